use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DIGEST_PREFIX: &str = "sha256:";

/// Default search path for images that do not set `PATH`.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{}{:x}", DIGEST_PREFIX, hasher.finalize())
}

/// Hex part of a `sha256:<hex>` digest.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix(DIGEST_PREFIX).unwrap_or(digest)
}

pub fn is_valid_digest(digest: &str) -> bool {
    let hex = match digest.strip_prefix(DIGEST_PREFIX) {
        Some(hex) => hex,
        None => return false,
    };
    hex.len() == 64 && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub digest: String,
    pub size: u64,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created_by: String,
    pub cache_key: String,
    /// True for metadata-only steps (ENV, CMD, ...) that add no layer.
    pub empty_layer: bool,
}

/// Launch metadata and layer list of an image.
///
/// Carries no timestamps, so identical builds hash to the same image id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub base: Option<String>,
    pub workdir: String,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub layers: Vec<LayerDescriptor>,
    pub history: Vec<HistoryEntry>,
}

impl ImageConfig {
    pub fn id(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        sha256_digest(&canonical)
    }

    /// Command executed when a container starts with no override.
    pub fn command(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.cmd.iter()).cloned().collect()
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_env(&mut self, key: &str, value: String) {
        match self.env.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key.to_string(), value)),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|layer| layer.size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub config: ImageConfig,
}

impl ImageRecord {
    pub fn new(config: ImageConfig) -> Self {
        Self {
            id: config.id(),
            created_at: Utc::now(),
            config,
        }
    }

    pub fn short_id(&self) -> &str {
        let hex = digest_hex(&self.id);
        &hex[..hex.len().min(12)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot_config() -> ImageConfig {
        ImageConfig {
            base: Some("python:3.11-slim".to_string()),
            workdir: "/app".to_string(),
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            labels: vec![],
            entrypoint: vec![],
            cmd: vec!["python".to_string(), "bot.py".to_string()],
            layers: vec![LayerDescriptor {
                digest: sha256_digest(b"layer"),
                size: 5,
                created_by: "COPY bot.py .".to_string(),
            }],
            history: vec![],
        }
    }

    #[test]
    fn test_image_id_is_content_derived() {
        let a = bot_config();
        let b = bot_config();
        assert_eq!(a.id(), b.id());
        assert!(is_valid_digest(&a.id()));

        let mut c = bot_config();
        c.cmd = vec!["python".to_string(), "main.py".to_string()];
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_command_joins_entrypoint_and_cmd() {
        let mut config = bot_config();
        assert_eq!(config.command(), vec!["python", "bot.py"]);

        config.entrypoint = vec!["/usr/bin/env".to_string()];
        assert_eq!(config.command(), vec!["/usr/bin/env", "python", "bot.py"]);
    }

    #[test]
    fn test_set_env_replaces_existing() {
        let mut config = bot_config();
        config.set_env("PYTHONUNBUFFERED", "0".to_string());
        config.set_env("TZ", "UTC".to_string());
        assert_eq!(config.env_var("PYTHONUNBUFFERED"), Some("0"));
        assert_eq!(config.env.len(), 2);
    }

    #[test]
    fn test_digest_helpers() {
        let digest = sha256_digest(b"");
        assert_eq!(
            digest,
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest_hex(&digest).len(), 64);
        assert!(!is_valid_digest("sha256:xyz"));
        assert!(!is_valid_digest("md5:abc"));
    }

    #[test]
    fn test_record_short_id() {
        let record = ImageRecord::new(bot_config());
        assert_eq!(record.short_id().len(), 12);
        assert_eq!(record.id, record.config.id());
    }
}
