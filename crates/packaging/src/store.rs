use crate::archive::ArchiveKind;
use crate::cache::write_json_atomic;
use crate::layer::{self, AppliedLayer, LayerDelta};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use stowage_models::{
    digest_hex, is_valid_digest, sha256_digest, ImageConfig, ImageName, ImageRecord, ImageRef,
    LayerDescriptor, StowageError, DIGEST_PREFIX,
};
use tracing::{debug, info, instrument, warn};

const BLOBS_DIR: &str = "blobs/sha256";
const CONFIGS_DIR: &str = "images/configs";
const TAGS_FILE: &str = "images/tags.json";
const BASES_FILE: &str = "bases.json";
const CACHE_DIR: &str = "cache";
const CONTAINERS_DIR: &str = "containers";
const TMP_DIR: &str = "tmp";

/// Shortest id prefix accepted when resolving an image by id.
const MIN_ID_PREFIX: usize = 4;

/// A base runtime image registered with `import`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseImage {
    pub layer: LayerDescriptor,
    pub source: String,
    pub imported_at: DateTime<Utc>,
}

/// Starting point of a build after resolving its `FROM` line.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBase {
    /// Stable identity folded into the first cache key.
    pub identity: String,
    pub config: ImageConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSummary {
    pub record: ImageRecord,
    pub tags: Vec<String>,
}

/// On-disk, content-addressed image store.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StowageError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let data = fs::read_to_string(path).map_err(StowageError::storage)?;
    serde_json::from_str(&data).map_err(|e| StowageError::Storage {
        reason: format!("corrupt index {}: {}", path.display(), e),
    })
}

impl ImageStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StowageError> {
        let root = root.into();
        for dir in [BLOBS_DIR, CONFIGS_DIR, CACHE_DIR, CONTAINERS_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir)).map_err(|e| StowageError::Storage {
                reason: format!("failed to create {}: {}", root.join(dir).display(), e),
            })?;
        }
        debug!("Opened image store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(CONTAINERS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest_hex(digest))
    }

    fn config_path(&self, id: &str) -> PathBuf {
        self.root
            .join(CONFIGS_DIR)
            .join(format!("{}.json", digest_hex(id)))
    }

    // Blobs

    /// Store a layer tarball. Writing an existing digest is a no-op.
    pub fn put_blob(&self, data: &[u8]) -> Result<(String, u64), StowageError> {
        let digest = sha256_digest(data);
        let path = self.blob_path(&digest);
        if !path.exists() {
            let mut tmp = tempfile::NamedTempFile::new_in(self.tmp_dir())
                .map_err(StowageError::storage)?;
            tmp.write_all(data).map_err(StowageError::storage)?;
            tmp.persist(&path).map_err(|e| StowageError::Storage {
                reason: e.error.to_string(),
            })?;
            debug!("Stored blob {} ({} bytes)", digest, data.len());
        }
        Ok((digest, data.len() as u64))
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        is_valid_digest(digest) && self.blob_path(digest).exists()
    }

    pub fn open_blob(&self, digest: &str) -> Result<File, StowageError> {
        if !is_valid_digest(digest) {
            return Err(StowageError::Storage {
                reason: format!("invalid digest {}", digest),
            });
        }
        File::open(self.blob_path(digest)).map_err(|e| StowageError::Storage {
            reason: format!("missing layer blob {}: {}", digest, e),
        })
    }

    pub fn apply_layer(&self, digest: &str, dest: &Path) -> Result<AppliedLayer, StowageError> {
        let blob = self.open_blob(digest)?;
        layer::apply_layer(blob, dest)
    }

    /// Unpack every layer of `config` into `dest` in order.
    #[instrument(skip(self, config))]
    pub fn materialize(&self, config: &ImageConfig, dest: &Path) -> Result<(), StowageError> {
        fs::create_dir_all(dest).map_err(StowageError::storage)?;
        for layer in &config.layers {
            self.apply_layer(&layer.digest, dest)?;
        }
        debug!("Materialized {} layers into {}", config.layers.len(), dest.display());
        Ok(())
    }

    // Images and tags

    fn load_tags(&self) -> Result<BTreeMap<String, String>, StowageError> {
        read_json(&self.root.join(TAGS_FILE))
    }

    fn save_tags(&self, tags: &BTreeMap<String, String>) -> Result<(), StowageError> {
        write_json_atomic(&self.root.join(TAGS_FILE), tags)
    }

    /// Persist an image record. The config is immutable once written, so an
    /// existing record with the same id is kept.
    pub fn put_image(&self, config: ImageConfig) -> Result<ImageRecord, StowageError> {
        let id = config.id();
        let path = self.config_path(&id);
        if path.exists() {
            return self.load_image(&id);
        }
        let record = ImageRecord::new(config);
        write_json_atomic(&path, &record)?;
        info!("Committed image {}", record.id);
        Ok(record)
    }

    pub fn load_image(&self, id: &str) -> Result<ImageRecord, StowageError> {
        let path = self.config_path(id);
        let data = fs::read_to_string(&path).map_err(|_| StowageError::ImageNotFound {
            reference: id.to_string(),
        })?;
        serde_json::from_str(&data).map_err(|e| StowageError::Storage {
            reason: format!("corrupt image record {}: {}", path.display(), e),
        })
    }

    /// Point `name` at `id`, superseding whatever it referenced before.
    pub fn tag(&self, name: &ImageName, id: &str) -> Result<Option<String>, StowageError> {
        let mut tags = self.load_tags()?;
        let previous = tags.insert(name.to_string(), id.to_string());
        self.save_tags(&tags)?;
        if let Some(previous) = previous.as_ref().filter(|previous| previous.as_str() != id) {
            info!("Tag {} moved from {} to {}", name, previous, id);
        }
        Ok(previous)
    }

    fn image_ids(&self) -> Result<Vec<String>, StowageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(CONFIGS_DIR)).map_err(StowageError::storage)? {
            let entry = entry.map_err(StowageError::storage)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(hex) = name.strip_suffix(".json") {
                ids.push(format!("{}{}", DIGEST_PREFIX, hex));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Resolve a tag, a full id, or a unique id prefix.
    #[instrument(skip(self))]
    pub fn resolve_image(&self, reference: &str) -> Result<ImageRecord, StowageError> {
        let tags = self.load_tags()?;
        if let Ok(name) = reference.parse::<ImageName>() {
            if let Some(id) = tags.get(&name.to_string()) {
                return self.load_image(id);
            }
        }

        let hex = digest_hex(reference);
        if hex.len() >= MIN_ID_PREFIX && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            let matches: Vec<String> = self
                .image_ids()?
                .into_iter()
                .filter(|id| digest_hex(id).starts_with(hex))
                .collect();
            match matches.len() {
                0 => {}
                1 => return self.load_image(&matches[0]),
                _ => {
                    return Err(StowageError::InvalidReference {
                        reference: format!("{} (ambiguous id prefix)", reference),
                    })
                }
            }
        }

        Err(StowageError::ImageNotFound {
            reference: reference.to_string(),
        })
    }

    /// All images, newest first, with the tags pointing at them.
    pub fn list_images(&self) -> Result<Vec<ImageSummary>, StowageError> {
        let tags = self.load_tags()?;
        let mut images = Vec::new();
        for id in self.image_ids()? {
            let record = self.load_image(&id)?;
            let image_tags = tags
                .iter()
                .filter(|(_, target)| **target == id)
                .map(|(tag, _)| tag.clone())
                .collect();
            images.push(ImageSummary {
                record,
                tags: image_tags,
            });
        }
        images.sort_by(|a, b| b.record.created_at.cmp(&a.record.created_at));
        Ok(images)
    }

    /// Remove a tag, or an image by id. The image record goes away once no
    /// tag references it. Layer blobs are left for `prune`.
    #[instrument(skip(self))]
    pub fn remove_image(&self, reference: &str) -> Result<Vec<String>, StowageError> {
        let mut tags = self.load_tags()?;
        let mut removed = Vec::new();

        let tagged = reference
            .parse::<ImageName>()
            .ok()
            .map(|name| name.to_string())
            .filter(|name| tags.contains_key(name));

        let id = match tagged {
            Some(name) => {
                let id = tags.remove(&name).unwrap_or_default();
                removed.push(format!("Untagged: {}", name));
                id
            }
            None => {
                let record = self.resolve_image(reference)?;
                let before = tags.len();
                tags.retain(|name, target| {
                    if *target == record.id {
                        removed.push(format!("Untagged: {}", name));
                        false
                    } else {
                        true
                    }
                });
                debug!("Dropped {} tags for {}", before - tags.len(), record.id);
                record.id
            }
        };
        self.save_tags(&tags)?;

        if !tags.values().any(|target| *target == id) {
            let path = self.config_path(&id);
            if path.exists() {
                fs::remove_file(&path).map_err(StowageError::storage)?;
                removed.push(format!("Deleted: {}", id));
            }
        }
        Ok(removed)
    }

    // Base images

    fn load_bases(&self) -> Result<BTreeMap<String, BaseImage>, StowageError> {
        read_json(&self.root.join(BASES_FILE))
    }

    /// Register a base runtime image from a directory tree or a tar archive.
    #[instrument(skip(self))]
    pub fn import_base(&self, name: &ImageName, source: &Path) -> Result<BaseImage, StowageError> {
        let data = if source.is_dir() {
            let mut delta = LayerDelta::new();
            delta.add_tree(source, "")?;
            delta.pack()?
        } else {
            let mut data = Vec::new();
            let file = File::open(source).map_err(|e| StowageError::SourceNotFound {
                path: format!("{}: {}", source.display(), e),
            })?;
            match ArchiveKind::sniff(source)? {
                Some(ArchiveKind::Tar) => {
                    let mut file = file;
                    file.read_to_end(&mut data).map_err(StowageError::storage)?;
                }
                Some(ArchiveKind::TarGz) => {
                    GzDecoder::new(file)
                        .read_to_end(&mut data)
                        .map_err(|e| StowageError::Archive {
                            path: source.display().to_string(),
                            reason: e.to_string(),
                        })?;
                }
                _ => {
                    return Err(StowageError::Archive {
                        path: source.display().to_string(),
                        reason: "base images must be a directory, .tar or .tar.gz".to_string(),
                    })
                }
            }
            data
        };

        let (digest, size) = self.put_blob(&data)?;
        let base = BaseImage {
            layer: LayerDescriptor {
                digest,
                size,
                created_by: format!("import {}", source.display()),
            },
            source: source.display().to_string(),
            imported_at: Utc::now(),
        };

        let mut bases = self.load_bases()?;
        bases.insert(name.to_string(), base.clone());
        write_json_atomic(&self.root.join(BASES_FILE), &bases)?;
        info!("Imported base image {} as {}", name, base.layer.digest);
        Ok(base)
    }

    pub fn lookup_base(&self, name: &ImageName) -> Result<Option<BaseImage>, StowageError> {
        Ok(self.load_bases()?.remove(&name.to_string()))
    }

    /// Resolve a `FROM` reference: `scratch`, a previously built image
    /// (whose config is inherited), or an imported base.
    pub fn resolve_base(&self, image: &ImageRef) -> Result<ResolvedBase, StowageError> {
        let name = match image {
            ImageRef::Scratch => {
                return Ok(ResolvedBase {
                    identity: "scratch".to_string(),
                    config: ImageConfig {
                        workdir: "/".to_string(),
                        ..Default::default()
                    },
                })
            }
            ImageRef::Named(name) => name,
        };

        if let Some(id) = self.load_tags()?.get(&name.to_string()) {
            let record = self.load_image(id)?;
            let mut config = record.config;
            config.base = Some(name.to_string());
            config.labels.clear();
            return Ok(ResolvedBase {
                identity: record.id,
                config,
            });
        }

        if let Some(base) = self.lookup_base(name)? {
            return Ok(ResolvedBase {
                identity: base.layer.digest.clone(),
                config: ImageConfig {
                    base: Some(name.to_string()),
                    workdir: "/".to_string(),
                    layers: vec![base.layer],
                    ..Default::default()
                },
            });
        }

        Err(StowageError::BaseImageNotFound {
            reference: name.to_string(),
        })
    }

    // Garbage collection

    /// Blobs referenced by any image record or base image.
    pub fn referenced_blobs(&self) -> Result<BTreeSet<String>, StowageError> {
        let mut referenced = BTreeSet::new();
        for id in self.image_ids()? {
            let record = self.load_image(&id)?;
            referenced.extend(record.config.layers.into_iter().map(|layer| layer.digest));
        }
        referenced.extend(
            self.load_bases()?
                .into_values()
                .map(|base| base.layer.digest),
        );
        Ok(referenced)
    }

    pub fn remove_unreferenced_blobs(&self, keep: &BTreeSet<String>) -> Result<usize, StowageError> {
        let mut removed = 0;
        for entry in fs::read_dir(self.root.join(BLOBS_DIR)).map_err(StowageError::storage)? {
            let entry = entry.map_err(StowageError::storage)?;
            let digest = format!("{}{}", DIGEST_PREFIX, entry.file_name().to_string_lossy());
            if !keep.contains(&digest) {
                fs::remove_file(entry.path()).map_err(StowageError::storage)?;
                removed += 1;
            }
        }
        info!("Removed {} unreferenced blobs", removed);
        Ok(removed)
    }

    /// Remove container and scratch directories older than `min_age`.
    pub fn cleanup_containers(&self, min_age: Duration) -> Result<usize, StowageError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for dir in [self.containers_dir(), self.tmp_dir()] {
            for entry in fs::read_dir(&dir).map_err(StowageError::storage)? {
                let entry = entry.map_err(StowageError::storage)?;
                let age = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();
                if age < min_age {
                    continue;
                }
                let path = entry.path();
                let result = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::DeltaEntry;
    use tempfile::tempdir;

    fn layer_with(path: &str, content: &str) -> Vec<u8> {
        let mut delta = LayerDelta::new();
        delta.insert(
            path,
            DeltaEntry::Bytes {
                data: content.as_bytes().to_vec(),
                mode: 0o644,
            },
        );
        delta.pack().unwrap()
    }

    fn image_with_layer(store: &ImageStore, content: &str) -> ImageConfig {
        let (digest, size) = store.put_blob(&layer_with("app/bot.py", content)).unwrap();
        ImageConfig {
            workdir: "/app".to_string(),
            cmd: vec!["python".to_string(), "bot.py".to_string()],
            layers: vec![LayerDescriptor {
                digest,
                size,
                created_by: "COPY bot.py .".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_put_blob_is_content_addressed() {
        let dir = tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let (a, _) = store.put_blob(b"layer").unwrap();
        let (b, _) = store.put_blob(b"layer").unwrap();
        assert_eq!(a, b);
        assert!(store.has_blob(&a));
        assert!(!store.has_blob("sha256:nope"));
    }

    #[test]
    fn test_tag_resolve_and_supersede() {
        let dir = tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let name: ImageName = "bot:dev".parse().unwrap();

        let first = store.put_image(image_with_layer(&store, "v1")).unwrap();
        store.tag(&name, &first.id).unwrap();
        let second = store.put_image(image_with_layer(&store, "v2")).unwrap();
        let previous = store.tag(&name, &second.id).unwrap();

        assert_eq!(previous, Some(first.id.clone()));
        assert_eq!(store.resolve_image("bot:dev").unwrap().id, second.id);
        // The superseded image stays addressable by id.
        assert_eq!(store.resolve_image(first.short_id()).unwrap().id, first.id);
    }

    #[test]
    fn test_materialize_layers() {
        let dir = tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let config = image_with_layer(&store, "print('ready')");

        let rootfs = dir.path().join("rootfs");
        store.materialize(&config, &rootfs).unwrap();
        assert_eq!(
            fs::read_to_string(rootfs.join("app/bot.py")).unwrap(),
            "print('ready')"
        );
    }

    #[test]
    fn test_remove_image_by_tag_and_id() {
        let dir = tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let record = store.put_image(image_with_layer(&store, "v1")).unwrap();
        store.tag(&"bot:a".parse().unwrap(), &record.id).unwrap();
        store.tag(&"bot:b".parse().unwrap(), &record.id).unwrap();

        let removed = store.remove_image("bot:a").unwrap();
        assert_eq!(removed, vec!["Untagged: bot:a".to_string()]);
        assert!(store.resolve_image(&record.id).is_ok());

        let removed = store.remove_image(&record.id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(matches!(
            store.resolve_image("bot:b").unwrap_err(),
            StowageError::ImageNotFound { .. }
        ));
    }

    #[test]
    fn test_import_and_resolve_base() {
        let dir = tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let rootfs = tempdir().unwrap();
        fs::create_dir_all(rootfs.path().join("usr/bin")).unwrap();
        fs::write(rootfs.path().join("usr/bin/python3"), "#!/bin/sh\n").unwrap();

        let name: ImageName = "python:3.11-slim".parse().unwrap();
        let base = store.import_base(&name, rootfs.path()).unwrap();
        let resolved = store.resolve_base(&ImageRef::Named(name)).unwrap();

        assert_eq!(resolved.identity, base.layer.digest);
        assert_eq!(resolved.config.layers.len(), 1);
        assert_eq!(resolved.config.base.as_deref(), Some("python:3.11-slim"));

        let missing = store
            .resolve_base(&ImageRef::Named("python:2.7".parse().unwrap()))
            .unwrap_err();
        assert!(matches!(missing, StowageError::BaseImageNotFound { .. }));
    }

    #[test]
    fn test_built_image_as_base_inherits_config() {
        let dir = tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let record = store.put_image(image_with_layer(&store, "v1")).unwrap();
        let name: ImageName = "bot-base:1".parse().unwrap();
        store.tag(&name, &record.id).unwrap();

        let resolved = store.resolve_base(&ImageRef::Named(name)).unwrap();
        assert_eq!(resolved.identity, record.id);
        assert_eq!(resolved.config.workdir, "/app");
        assert_eq!(resolved.config.layers, record.config.layers);
    }

    #[test]
    fn test_prune_unreferenced_blobs() {
        let dir = tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let record = store.put_image(image_with_layer(&store, "kept")).unwrap();
        let (orphan, _) = store.put_blob(b"orphan").unwrap();

        let keep = store.referenced_blobs().unwrap();
        assert_eq!(store.remove_unreferenced_blobs(&keep).unwrap(), 1);
        assert!(!store.has_blob(&orphan));
        assert!(store.has_blob(&record.config.layers[0].digest));
    }
}
