use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use stowage_models::{Instruction, StowageError};
use tracing::{debug, info, instrument};

pub const CACHE_FILE: &str = "build_cache.json";

/// Cache key of a step: chains the parent key, the canonical instruction and
/// a digest of everything the step reads.
pub fn cache_key(parent: &str, instruction: &Instruction, inputs_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update(b"\n");
    hasher.update(instruction.canonical().as_bytes());
    hasher.update(b"\n");
    hasher.update(inputs_digest.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedLayer {
    pub digest: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Maps step cache keys to committed layer digests. Persisted as JSON under
/// `<store>/cache/`.
#[derive(Debug)]
pub struct BuildCache {
    path: Option<PathBuf>,
    entries: HashMap<String, CachedLayer>,
    dirty: bool,
}

impl BuildCache {
    /// An in-memory cache that is never persisted.
    pub fn empty() -> Self {
        Self {
            path: None,
            entries: HashMap::new(),
            dirty: false,
        }
    }

    /// Load the cache from `cache_dir`, starting empty if no file exists yet.
    pub fn load(cache_dir: &Path) -> Result<Self, StowageError> {
        fs::create_dir_all(cache_dir).map_err(|e| StowageError::Storage {
            reason: e.to_string(),
        })?;
        let path = cache_dir.join(CACHE_FILE);

        let entries = if path.exists() {
            let data = fs::read_to_string(&path).map_err(|e| StowageError::Storage {
                reason: e.to_string(),
            })?;
            serde_json::from_str(&data).map_err(|e| StowageError::Storage {
                reason: format!("corrupt build cache {}: {}", path.display(), e),
            })?
        } else {
            HashMap::new()
        };

        debug!("Loaded {} build cache entries", entries.len());
        Ok(Self {
            path: Some(path),
            entries,
            dirty: false,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[instrument(skip(self))]
    pub fn lookup(&mut self, key: &str) -> Option<CachedLayer> {
        let entry = self.entries.get_mut(key)?;
        entry.last_used = Utc::now();
        self.dirty = true;
        Some(entry.clone())
    }

    pub fn insert(&mut self, key: String, digest: String, size: u64) {
        let now = Utc::now();
        self.entries.insert(
            key,
            CachedLayer {
                digest,
                size,
                created_at: now,
                last_used: now,
            },
        );
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<CachedLayer> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn referenced_digests(&self) -> BTreeSet<String> {
        self.entries.values().map(|entry| entry.digest.clone()).collect()
    }

    /// Drop entries unused for `max_age_days`, except those whose layer
    /// digest is in `keep`.
    #[instrument(skip(self, keep))]
    pub fn cleanup_old_cache(&mut self, max_age_days: u64, keep: &BTreeSet<String>) -> usize {
        let cutoff = Utc::now() - Duration::days(max_age_days as i64);
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_used >= cutoff || keep.contains(&entry.digest));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        info!("Cleaned up {} old build cache entries", removed);
        removed
    }

    /// Write the cache to disk if it changed since the last save.
    pub fn save(&mut self) -> Result<(), StowageError> {
        let path = match (&self.path, self.dirty) {
            (Some(path), true) => path.clone(),
            _ => return Ok(()),
        };
        write_json_atomic(&path, &self.entries)?;
        self.dirty = false;
        Ok(())
    }
}

/// Serialize `value` to a temp file next to `path`, then rename it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StowageError> {
    let dir = path.parent().ok_or_else(|| StowageError::Storage {
        reason: format!("{} has no parent directory", path.display()),
    })?;
    fs::create_dir_all(dir).map_err(StowageError::storage)?;

    let data = serde_json::to_vec_pretty(value).map_err(StowageError::storage)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(StowageError::storage)?;
    tmp.write_all(&data).map_err(StowageError::storage)?;
    tmp.as_file().sync_all().map_err(StowageError::storage)?;
    tmp.persist(path).map_err(|e| StowageError::Storage {
        reason: e.error.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_models::StageMode;
    use tempfile::tempdir;

    fn copy_bot() -> Instruction {
        Instruction::StageFiles {
            mode: StageMode::Copy,
            sources: vec!["bot.py".to_string()],
            destination: ".".to_string(),
        }
    }

    #[test]
    fn test_cache_key_chains_inputs() {
        let base = cache_key("", &copy_bot(), "aaa");
        assert_eq!(base, cache_key("", &copy_bot(), "aaa"));
        assert_ne!(base, cache_key("", &copy_bot(), "bbb"));
        assert_ne!(base, cache_key("parent", &copy_bot(), "aaa"));
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let mut cache = BuildCache::load(dir.path()).unwrap();
        cache.insert("k1".to_string(), "sha256:abc".to_string(), 10);
        cache.save().unwrap();

        let mut reloaded = BuildCache::load(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
        let hit = reloaded.lookup("k1").unwrap();
        assert_eq!(hit.digest, "sha256:abc");
        assert!(reloaded.lookup("k2").is_none());
    }

    #[test]
    fn test_empty_cache_is_not_persisted() {
        let mut cache = BuildCache::empty();
        cache.insert("k".to_string(), "sha256:abc".to_string(), 1);
        cache.save().unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cleanup_respects_keep_set() {
        let dir = tempdir().unwrap();
        let mut cache = BuildCache::load(dir.path()).unwrap();
        cache.insert("old".to_string(), "sha256:old".to_string(), 1);
        cache.insert("kept".to_string(), "sha256:kept".to_string(), 1);
        for entry in cache.entries.values_mut() {
            entry.last_used = Utc::now() - Duration::days(30);
        }

        let keep: BTreeSet<String> = ["sha256:kept".to_string()].into_iter().collect();
        assert_eq!(cache.cleanup_old_cache(7, &keep), 1);
        assert!(cache.lookup("kept").is_some());
        assert!(cache.lookup("old").is_none());
    }

    #[test]
    fn test_corrupt_cache_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CACHE_FILE), "not json").unwrap();
        let err = BuildCache::load(dir.path()).unwrap_err();
        assert!(matches!(err, StowageError::Storage { .. }));
    }
}
