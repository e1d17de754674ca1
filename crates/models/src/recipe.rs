use crate::error::StowageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_TAG: &str = "latest";

/// A `name[:tag]` reference to a base or built image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageName {
    pub name: String,
    pub tag: String,
}

impl ImageName {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ImageName {
    type Err = StowageError;

    fn from_str(reference: &str) -> Result<Self, Self::Err> {
        let invalid = || StowageError::InvalidReference {
            reference: reference.to_string(),
        };

        // A colon before the last slash belongs to a registry port, not a tag.
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match reference[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        let name_ok = !name.is_empty()
            && !name.starts_with(['/', '.', '-'])
            && !name.ends_with('/')
            && name.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/' | ':')
            });
        let tag_ok = !tag.is_empty()
            && tag.len() <= 128
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

        if !name_ok || !tag_ok {
            return Err(invalid());
        }

        Ok(ImageName::new(name, tag))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRef {
    Scratch,
    Named(ImageName),
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Scratch => write!(f, "scratch"),
            ImageRef::Named(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// Plain copy from the build context.
    Copy,
    /// Copy that additionally fetches URLs and expands local archives.
    Add,
}

/// One build instruction. The executor interprets these strictly in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    SelectBase {
        image: ImageRef,
    },
    SetWorkdir {
        path: String,
    },
    SetEnv {
        vars: Vec<(String, String)>,
    },
    SetLabel {
        labels: Vec<(String, String)>,
    },
    StageFiles {
        mode: StageMode,
        sources: Vec<String>,
        destination: String,
    },
    RunInstall {
        manifest: String,
        installer_args: Vec<String>,
    },
    SetEntrypoint {
        argv: Vec<String>,
    },
    SetCmd {
        argv: Vec<String>,
    },
}

impl Instruction {
    pub fn stage(&self) -> BuildStage {
        match self {
            Instruction::SelectBase { .. } => BuildStage::SelectBase,
            Instruction::SetWorkdir { .. } => BuildStage::SetWorkdir,
            Instruction::SetEnv { .. } | Instruction::SetLabel { .. } => BuildStage::Configure,
            Instruction::StageFiles { .. } => BuildStage::StageFiles,
            Instruction::RunInstall { .. } => BuildStage::InstallDependencies,
            Instruction::SetEntrypoint { .. } | Instruction::SetCmd { .. } => {
                BuildStage::SetEntrypoint
            }
        }
    }

    /// Canonical serialized form, used as cache key material.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeStep {
    pub line: usize,
    /// Instruction text as written, recorded in image history.
    pub text: String,
    pub instruction: Instruction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub steps: Vec<RecipeStep>,
}

impl Recipe {
    pub fn base(&self) -> Option<&ImageRef> {
        self.steps.iter().find_map(|step| match &step.instruction {
            Instruction::SelectBase { image } => Some(image),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStage {
    Parse,
    SelectBase,
    SetWorkdir,
    Configure,
    StageFiles,
    InstallDependencies,
    SetEntrypoint,
    Commit,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::Parse => "parse",
            BuildStage::SelectBase => "select-base",
            BuildStage::SetWorkdir => "set-workdir",
            BuildStage::Configure => "configure",
            BuildStage::StageFiles => "stage-files",
            BuildStage::InstallDependencies => "install-dependencies",
            BuildStage::SetEntrypoint => "set-entrypoint",
            BuildStage::Commit => "commit",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
