use std::fs;
use std::path::{Path, PathBuf};
use stowage_models::{ImageConfig, StowageError};
use stowage_packaging::ImageStore;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// A private, writable copy of an image's filesystem.
///
/// The directory is removed on drop unless the container was created with
/// `keep`.
#[derive(Debug)]
pub struct Container {
    id: String,
    dir: PathBuf,
    rootfs: PathBuf,
    keep: bool,
}

impl Container {
    #[instrument(skip(store, config))]
    pub fn create(store: &ImageStore, config: &ImageConfig, keep: bool) -> Result<Self, StowageError> {
        let id = Uuid::new_v4().simple().to_string();
        let dir = store.containers_dir().join(&id);
        let rootfs = dir.join("rootfs");
        fs::create_dir_all(&rootfs).map_err(StowageError::storage)?;

        // From here on the drop guard owns the directory.
        let container = Self {
            id,
            dir,
            rootfs,
            keep,
        };
        store.materialize(config, &container.rootfs)?;
        debug!("Container {} ready at {}", container.id, container.rootfs.display());
        Ok(container)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// First 12 characters of the id, used as the container hostname.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Host location of an absolute image path.
    pub fn host_path(&self, image_path: &str) -> PathBuf {
        self.rootfs.join(image_path.trim_start_matches('/'))
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!("Failed to remove container {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rootfs_removed_on_drop_unless_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let config = ImageConfig::default();

        let container = Container::create(&store, &config, false).unwrap();
        let rootfs = container.rootfs().to_path_buf();
        assert!(rootfs.is_dir());
        assert_eq!(container.short_id().len(), 12);
        assert_eq!(container.host_path("/app/bot.py"), rootfs.join("app/bot.py"));
        drop(container);
        assert!(!rootfs.exists());

        let kept = Container::create(&store, &config, true).unwrap();
        let rootfs = kept.rootfs().to_path_buf();
        drop(kept);
        assert!(rootfs.is_dir());
    }
}
