use crate::archive::ArchiveHandler;
use crate::cache::{cache_key, BuildCache};
use crate::context::BuildContext;
use crate::fetch::RemoteFetcher;
use crate::installer::{InstallRequest, PackageInstaller};
use crate::layer::{resolve_image_path, track_applied, AppliedLayer, DeltaEntry, LayerDelta};
use crate::stager::Stager;
use crate::store::ImageStore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stowage_models::{
    BuildStage, Config, DependencyManifest, HistoryEntry, ImageConfig, ImageName, ImageRecord,
    Instruction, LayerDescriptor, Recipe, RecipeStep, StowageError,
};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Rebuild every layer instead of reusing cached ones.
    pub no_cache: bool,
    pub tag: Option<ImageName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    CacheHit,
    Built,
    /// Config-only step, no layer.
    Metadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub text: String,
    pub stage: BuildStage,
    pub cache_key: String,
    pub outcome: StepOutcome,
    pub layer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub image: ImageRecord,
    pub tag: Option<ImageName>,
    pub steps: Vec<StepReport>,
    pub duration: Duration,
}

impl BuildReport {
    pub fn cache_hits(&self) -> usize {
        self.count(StepOutcome::CacheHit)
    }

    pub fn layers_built(&self) -> usize {
        self.count(StepOutcome::Built)
    }

    fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

/// Filesystem and config of the image under construction.
struct WorkingImage {
    config: ImageConfig,
    rootfs: TempDir,
    /// Paths put in place by earlier copy steps.
    copied: BTreeSet<String>,
    parent_key: String,
    cmd_set_by_recipe: bool,
}

/// Executes recipe steps in order against a working root filesystem, one
/// cached layer per filesystem-changing step.
pub struct ImageBuilder {
    store: ImageStore,
    installer: Arc<dyn PackageInstaller>,
    archives: ArchiveHandler,
    fetcher: RemoteFetcher,
    site_packages: String,
}

fn inputs_digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

fn prepend_path(existing: Option<&str>, entry: &str) -> String {
    match existing {
        None | Some("") => entry.to_string(),
        Some(value) if value.split(':').any(|p| p == entry) => value.to_string(),
        Some(value) => format!("{}:{}", entry, value),
    }
}

impl ImageBuilder {
    pub fn new(
        store: ImageStore,
        installer: Arc<dyn PackageInstaller>,
        config: &Config,
    ) -> Result<Self, StowageError> {
        Ok(Self {
            store,
            installer,
            archives: ArchiveHandler::new(config.build.context_max_bytes),
            fetcher: RemoteFetcher::new(
                Duration::from_secs(config.fetch.timeout_secs),
                config.fetch.max_bytes,
            )?,
            site_packages: config.installer.site_packages.clone(),
        })
    }

    #[instrument(skip(self, recipe, context, cache, options), fields(steps = recipe.steps.len()))]
    pub async fn build(
        &self,
        recipe: &Recipe,
        context: &BuildContext,
        cache: &mut BuildCache,
        options: &BuildOptions,
    ) -> Result<BuildReport, StowageError> {
        let started = Instant::now();
        let rootfs = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(self.store.tmp_dir())
            .map_err(|e| StowageError::storage(e).in_stage(BuildStage::SelectBase))?;

        let mut image = WorkingImage {
            config: ImageConfig::default(),
            rootfs,
            copied: BTreeSet::new(),
            parent_key: String::new(),
            cmd_set_by_recipe: false,
        };
        let mut steps = Vec::with_capacity(recipe.steps.len());
        let total = recipe.steps.len();

        for (index, step) in recipe.steps.iter().enumerate() {
            let stage = step.instruction.stage();
            info!("Step {}/{} [{}]: {}", index + 1, total, stage, step.text);
            let report = self
                .execute(index, step, &mut image, context, cache, options)
                .await
                .map_err(|e| e.in_stage(stage))?;
            steps.push(report);
        }

        if image.config.entrypoint.is_empty() && image.config.cmd.is_empty() {
            return Err(StowageError::MissingEntrypoint.in_stage(BuildStage::SetEntrypoint));
        }

        let record = self
            .store
            .put_image(image.config)
            .map_err(|e| e.in_stage(BuildStage::Commit))?;
        if let Some(tag) = &options.tag {
            self.store
                .tag(tag, &record.id)
                .map_err(|e| e.in_stage(BuildStage::Commit))?;
        }

        let report = BuildReport {
            image: record,
            tag: options.tag.clone(),
            steps,
            duration: started.elapsed(),
        };
        info!(
            "Built image {} in {:.2}s ({} layers built, {} cache hits)",
            report.image.short_id(),
            report.duration.as_secs_f64(),
            report.layers_built(),
            report.cache_hits()
        );
        Ok(report)
    }

    async fn execute(
        &self,
        index: usize,
        step: &RecipeStep,
        image: &mut WorkingImage,
        context: &BuildContext,
        cache: &mut BuildCache,
        options: &BuildOptions,
    ) -> Result<StepReport, StowageError> {
        let instruction = &step.instruction;
        let report = |cache_key: String, outcome: StepOutcome, layer: Option<String>| StepReport {
            index,
            text: step.text.clone(),
            stage: instruction.stage(),
            cache_key,
            outcome,
            layer,
        };

        match instruction {
            Instruction::SelectBase { image: reference } => {
                let base = self.store.resolve_base(reference)?;
                self.store.materialize(&base.config, image.rootfs.path())?;
                image.config = base.config;
                image.parent_key = cache_key("", instruction, &base.identity);
                info!("Selected base {} ({})", reference, base.identity);
                Ok(report(image.parent_key.clone(), StepOutcome::Metadata, None))
            }
            Instruction::SetWorkdir { path } => {
                let workdir = resolve_image_path(&image.config.workdir, path)?;
                image.config.workdir = format!("/{}", workdir);

                let exists = fs::symlink_metadata(image.rootfs.path().join(&workdir))
                    .map(|meta| meta.is_dir())
                    .unwrap_or(false);
                if workdir.is_empty() || exists {
                    return Ok(self.record_metadata(step, image, "", report));
                }

                let mut delta = LayerDelta::new();
                delta.insert(&workdir, DeltaEntry::Directory { mode: 0o755 });
                let (key, outcome, digest, _) =
                    self.commit_layer(step, image, &delta, &delta.digest()?, cache, options)?;
                Ok(report(key, outcome, Some(digest)))
            }
            Instruction::SetEnv { vars } => {
                for (key, value) in vars {
                    image.config.set_env(key, value.clone());
                }
                Ok(self.record_metadata(step, image, "", report))
            }
            Instruction::SetLabel { labels } => {
                for (key, value) in labels {
                    match image.config.labels.iter_mut().find(|(k, _)| k == key) {
                        Some(entry) => entry.1 = value.clone(),
                        None => image.config.labels.push((key.clone(), value.clone())),
                    }
                }
                Ok(self.record_metadata(step, image, "", report))
            }
            Instruction::StageFiles {
                mode,
                sources,
                destination,
            } => {
                let scratch = self.store.tmp_dir();
                let stager = Stager::new(context, &self.archives, &self.fetcher, &scratch);
                let staged = stager
                    .stage(
                        *mode,
                        sources,
                        destination,
                        &image.config.workdir,
                        image.rootfs.path(),
                        &image.copied,
                    )
                    .await?;
                let digest = staged.delta.digest()?;
                let (key, outcome, layer, applied) =
                    self.commit_layer(step, image, &staged.delta, &digest, cache, options)?;
                track_applied(&mut image.copied, &applied);
                Ok(report(key, outcome, Some(layer)))
            }
            Instruction::RunInstall {
                manifest,
                installer_args,
            } => {
                let (key, outcome, layer) = self
                    .install_dependencies(step, image, manifest, installer_args, cache, options)
                    .await?;
                let pythonpath = prepend_path(image.config.env_var("PYTHONPATH"), &self.site_packages);
                image.config.set_env("PYTHONPATH", pythonpath);
                Ok(report(key, outcome, Some(layer)))
            }
            Instruction::SetEntrypoint { argv } => {
                image.config.entrypoint = argv.clone();
                // An inherited CMD is meant for the base's entrypoint.
                if !image.cmd_set_by_recipe {
                    image.config.cmd.clear();
                }
                Ok(self.record_metadata(step, image, "", report))
            }
            Instruction::SetCmd { argv } => {
                image.config.cmd = argv.clone();
                image.cmd_set_by_recipe = true;
                Ok(self.record_metadata(step, image, "", report))
            }
        }
    }

    fn record_metadata(
        &self,
        step: &RecipeStep,
        image: &mut WorkingImage,
        inputs: &str,
        report: impl Fn(String, StepOutcome, Option<String>) -> StepReport,
    ) -> StepReport {
        let key = cache_key(&image.parent_key, &step.instruction, inputs);
        image.config.history.push(HistoryEntry {
            created_by: step.text.clone(),
            cache_key: key.clone(),
            empty_layer: true,
        });
        image.parent_key = key.clone();
        report(key, StepOutcome::Metadata, None)
    }

    /// Reuse the cached layer for this step, or pack and store `delta`. The
    /// layer is applied to the working rootfs either way.
    fn commit_layer(
        &self,
        step: &RecipeStep,
        image: &mut WorkingImage,
        delta: &LayerDelta,
        inputs: &str,
        cache: &mut BuildCache,
        options: &BuildOptions,
    ) -> Result<(String, StepOutcome, String, AppliedLayer), StowageError> {
        let key = cache_key(&image.parent_key, &step.instruction, inputs);

        let cached = if options.no_cache {
            None
        } else {
            cache
                .lookup(&key)
                .filter(|hit| self.store.has_blob(&hit.digest))
        };

        let (digest, size, outcome) = match cached {
            Some(hit) => {
                info!("Using cached layer {} for step {}", hit.digest, key);
                (hit.digest, hit.size, StepOutcome::CacheHit)
            }
            None => {
                let data = delta.pack()?;
                let (digest, size) = self.store.put_blob(&data)?;
                cache.insert(key.clone(), digest.clone(), size);
                cache.save()?;
                debug!("Committed layer {} ({} bytes)", digest, size);
                (digest, size, StepOutcome::Built)
            }
        };

        let applied = self.store.apply_layer(&digest, image.rootfs.path())?;
        image.config.layers.push(LayerDescriptor {
            digest: digest.clone(),
            size,
            created_by: step.text.clone(),
        });
        image.config.history.push(HistoryEntry {
            created_by: step.text.clone(),
            cache_key: key.clone(),
            empty_layer: false,
        });
        image.parent_key = key.clone();
        Ok((key, outcome, digest, applied))
    }

    /// Install the manifest into a fresh staging directory. Only a successful
    /// install becomes a layer; a failed one leaves nothing behind.
    async fn install_dependencies(
        &self,
        step: &RecipeStep,
        image: &mut WorkingImage,
        manifest: &str,
        installer_args: &[String],
        cache: &mut BuildCache,
        options: &BuildOptions,
    ) -> Result<(String, StepOutcome, String), StowageError> {
        let manifest_image_path = resolve_image_path(&image.config.workdir, manifest)?;
        let manifest_host_path: PathBuf = image.rootfs.path().join(&manifest_image_path);
        if !manifest_host_path.is_file() {
            return Err(StowageError::SourceNotFound {
                path: format!("/{}", manifest_image_path),
            });
        }
        let content = fs::read_to_string(&manifest_host_path).map_err(StowageError::storage)?;
        let parsed = DependencyManifest::parse(&content)?;
        info!(
            "Manifest /{} lists {} packages",
            manifest_image_path,
            parsed.len()
        );

        let site_packages = resolve_image_path("/", &self.site_packages)?;
        let staging = tempfile::Builder::new()
            .prefix("install-")
            .tempdir_in(self.store.tmp_dir())
            .map_err(StowageError::storage)?;
        let target = staging.path().join("site-packages");
        fs::create_dir_all(&target).map_err(StowageError::storage)?;
        let request = InstallRequest {
            rootfs: image.rootfs.path().to_path_buf(),
            manifest: format!("/{}", manifest_image_path),
            env: image.config.env.clone(),
            target: target.clone(),
            extra_args: installer_args.to_vec(),
        };

        let nothing_to_install = parsed.is_empty() && parsed.options.is_empty();
        let identity = if nothing_to_install {
            String::new()
        } else {
            self.installer.identity(&request).await?
        };
        let inputs = inputs_digest(&[
            content.as_bytes(),
            identity.as_bytes(),
            site_packages.as_bytes(),
            installer_args.join("\n").as_bytes(),
        ]);

        let key = cache_key(&image.parent_key, &step.instruction, &inputs);
        let cached = !options.no_cache
            && cache
                .lookup(&key)
                .map(|hit| self.store.has_blob(&hit.digest))
                .unwrap_or(false);

        let mut delta = LayerDelta::new();
        if !cached {
            if nothing_to_install {
                warn!("Manifest /{} is empty, nothing to install", manifest_image_path);
            } else {
                self.installer.install(&request).await?;
            }
            delta.add_tree(&target, &site_packages)?;
        }

        let (key, outcome, layer, _) =
            self.commit_layer(step, image, &delta, &inputs, cache, options)?;
        Ok((key, outcome, layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_path() {
        assert_eq!(prepend_path(None, "/sp"), "/sp");
        assert_eq!(prepend_path(Some(""), "/sp"), "/sp");
        assert_eq!(prepend_path(Some("/app"), "/sp"), "/sp:/app");
        assert_eq!(prepend_path(Some("/app:/sp"), "/sp"), "/app:/sp");
    }

    #[test]
    fn test_inputs_digest_is_unambiguous() {
        assert_ne!(
            inputs_digest(&[b"ab", b"c"]),
            inputs_digest(&[b"a", b"bc"])
        );
        assert_eq!(inputs_digest(&[b"x"]), inputs_digest(&[b"x"]));
    }
}
