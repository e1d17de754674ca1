use crate::cache::BuildCache;
use crate::context::BuildContext;
use crate::image_builder::{BuildOptions, BuildReport, ImageBuilder};
use crate::installer::{PackageInstaller, PipInstaller};
use crate::parser::{parse_recipe, parse_recipe_with_env};
use crate::store::{BaseImage, ImageStore};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stowage_models::{BuildStage, Config, ImageName, StowageError};
use tracing::{info, instrument};

/// Container directories younger than this survive `prune`; they may belong
/// to a running container.
const CONTAINER_MIN_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub cache_entries: usize,
    pub blobs: usize,
    pub scratch_dirs: usize,
}

/// Entry point for building, importing and pruning images.
pub struct PackagingService {
    config: Config,
    store: ImageStore,
    installer: Arc<dyn PackageInstaller>,
}

impl PackagingService {
    pub fn new(config: Config) -> Result<Self, StowageError> {
        let installer = Arc::new(PipInstaller::new(&config.installer, config.launcher.isolation));
        Self::with_installer(config, installer)
    }

    pub fn with_installer(config: Config, installer: Arc<dyn PackageInstaller>) -> Result<Self, StowageError> {
        let store = ImageStore::open(&config.store.dir)?;
        Ok(Self {
            config,
            store,
            installer,
        })
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Build the recipe at `recipe_path` (default `<context>/<build.recipe_file>`).
    #[instrument(skip(self, options))]
    pub async fn build(
        &self,
        context_dir: &Path,
        recipe_path: Option<&Path>,
        options: &BuildOptions,
    ) -> Result<BuildReport, StowageError> {
        let recipe_path = recipe_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| context_dir.join(&self.config.build.recipe_file));
        let content = fs::read_to_string(&recipe_path).map_err(|e| {
            StowageError::SourceNotFound {
                path: format!("{}: {}", recipe_path.display(), e),
            }
            .in_stage(BuildStage::Parse)
        })?;
        let recipe = parse_recipe(&content).map_err(|e| e.in_stage(BuildStage::Parse))?;
        // `$VAR` in a child recipe sees the base image's environment. A base
        // that does not resolve fails later, at select-base.
        let recipe = match recipe.base().map(|base| self.store.resolve_base(base)) {
            Some(Ok(base)) if !base.config.env.is_empty() => {
                parse_recipe_with_env(&content, &base.config.env).map_err(|e| e.in_stage(BuildStage::Parse))?
            }
            _ => recipe,
        };

        let context = BuildContext::new(context_dir)
            .map_err(|e| e.in_stage(BuildStage::StageFiles))?
            .exclude(self.store.root());
        let context_size = context
            .total_size()
            .map_err(|e| e.in_stage(BuildStage::StageFiles))?;
        if context_size > self.config.build.context_max_bytes {
            return Err(StowageError::InvalidPath {
                path: context_dir.display().to_string(),
                reason: format!(
                    "build context is {} bytes, limit is {}",
                    context_size, self.config.build.context_max_bytes
                ),
            }
            .in_stage(BuildStage::StageFiles));
        }
        info!(
            "Building {} ({} steps, context {} bytes)",
            recipe_path.display(),
            recipe.steps.len(),
            context_size
        );

        let mut cache = BuildCache::load(&self.store.cache_dir()).map_err(|e| e.in_stage(BuildStage::Parse))?;
        let builder = ImageBuilder::new(self.store.clone(), self.installer.clone(), &self.config)
            .map_err(|e| e.in_stage(BuildStage::Parse))?;
        builder.build(&recipe, &context, &mut cache, options).await
    }

    pub fn import_base(&self, name: &ImageName, source: &Path) -> Result<BaseImage, StowageError> {
        self.store.import_base(name, source)
    }

    /// Drop cache entries unused for `older_than_days` (unless an image still
    /// uses their layer), then every blob nothing references, then stale
    /// container and scratch directories.
    #[instrument(skip(self))]
    pub fn prune(&self, older_than_days: u64) -> Result<PruneReport, StowageError> {
        let mut cache = BuildCache::load(&self.store.cache_dir())?;
        let image_blobs = self.store.referenced_blobs()?;
        let cache_entries = cache.cleanup_old_cache(older_than_days, &image_blobs);
        cache.save()?;

        let mut keep = image_blobs;
        keep.extend(cache.referenced_digests());
        let blobs = self.store.remove_unreferenced_blobs(&keep)?;
        let scratch_dirs = self.store.cleanup_containers(CONTAINER_MIN_AGE)?;

        Ok(PruneReport {
            cache_entries,
            blobs,
            scratch_dirs,
        })
    }
}
