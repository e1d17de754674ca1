use crate::recipe::BuildStage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StowageError {
    #[error("Recipe parse error at line {line}: {reason}")]
    RecipeParse { line: usize, reason: String },

    #[error("Base image not found: {reference}")]
    BaseImageNotFound { reference: String },

    #[error("Source path not found in build context: {path}")]
    SourceNotFound { path: String },

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Invalid archive {path}: {reason}")]
    Archive { path: String, reason: String },

    #[error("Recipe declares neither ENTRYPOINT nor CMD")]
    MissingEntrypoint,

    #[error("Invalid dependency manifest: {reason}")]
    ManifestInvalid { reason: String },

    #[error("Dependency installation failed: {reason}")]
    DependencyInstall { reason: String },

    #[error("Image not found: {reference}")]
    ImageNotFound { reference: String },

    #[error("Invalid image reference: {reference}")]
    InvalidReference { reference: String },

    #[error("Entrypoint not found: {program}")]
    EntrypointNotFound { program: String },

    #[error("Entrypoint is not executable: {program}")]
    EntrypointNotExecutable { program: String },

    #[error("Container launch failed: {reason}")]
    Launch { reason: String },

    #[error("Storage error: {reason}")]
    Storage { reason: String },

    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    #[error("Internal error: {reason}")]
    InternalError { reason: String },

    #[error("build failed at stage {stage}: {source}")]
    BuildFailed {
        stage: BuildStage,
        #[source]
        source: Box<StowageError>,
    },
}

impl StowageError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        StowageError::Storage {
            reason: err.to_string(),
        }
    }

    /// Attach the failing build stage. An error that already carries a stage keeps it.
    pub fn in_stage(self, stage: BuildStage) -> Self {
        match self {
            StowageError::BuildFailed { .. } => self,
            other => StowageError::BuildFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn stage(&self) -> Option<BuildStage> {
        match self {
            StowageError::BuildFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn root_cause(&self) -> &StowageError {
        match self {
            StowageError::BuildFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            StowageError::RecipeParse { .. } => "BuildInputError",
            StowageError::BaseImageNotFound { .. } => "BuildInputError",
            StowageError::SourceNotFound { .. } => "BuildInputError",
            StowageError::InvalidPath { .. } => "BuildInputError",
            StowageError::Fetch { .. } => "BuildInputError",
            StowageError::Archive { .. } => "BuildInputError",
            StowageError::MissingEntrypoint => "BuildInputError",
            StowageError::ManifestInvalid { .. } => "DependencyResolutionError",
            StowageError::DependencyInstall { .. } => "DependencyResolutionError",
            StowageError::ImageNotFound { .. } => "RuntimeLaunchError",
            StowageError::InvalidReference { .. } => "RuntimeLaunchError",
            StowageError::EntrypointNotFound { .. } => "RuntimeLaunchError",
            StowageError::EntrypointNotExecutable { .. } => "RuntimeLaunchError",
            StowageError::Launch { .. } => "RuntimeLaunchError",
            StowageError::Storage { .. } => "InfrastructureError",
            StowageError::ConfigError { .. } => "InfrastructureError",
            StowageError::InternalError { .. } => "InfrastructureError",
            StowageError::BuildFailed { source, .. } => source.error_type(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            StowageError::EntrypointNotFound { .. } => 127,
            StowageError::EntrypointNotExecutable { .. } => 126,
            StowageError::ConfigError { .. } => 2,
            _ => 1,
        }
    }
}

pub type StowageResult<T> = Result<T, StowageError>;
