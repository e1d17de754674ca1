use crate::error::StowageError;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "stowage.toml";
pub const ENV_PREFIX: &str = "STOWAGE_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    pub build: BuildConfig,
    pub installer: InstallerConfig,
    pub fetch: FetchConfig,
    pub launcher: LauncherConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub recipe_file: String,
    pub context_max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InstallerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Image path that receives installed packages.
    pub site_packages: String,
    pub timeout_secs: u64,
    /// Install with the image's own interpreter when its `PATH` has one.
    pub image_interpreter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Run against the container rootfs without changing the process root.
    None,
    /// chroot into the container rootfs. Requires root.
    Chroot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    pub isolation: Isolation,
    /// Resolve programs missing from the image against the host PATH.
    pub host_path_fallback: bool,
    /// Time a process gets after a forwarded SIGTERM/SIGINT before SIGKILL.
    pub grace_period_secs: u64,
    pub keep_containers: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                dir: PathBuf::from(".stowage"),
            },
            build: BuildConfig {
                recipe_file: "Dockerfile".to_string(),
                context_max_bytes: 512 * 1024 * 1024, // 512MB
            },
            installer: InstallerConfig {
                program: "python3".to_string(),
                args: vec!["-m".to_string(), "pip".to_string()],
                site_packages: "/usr/local/lib/stowage/site-packages".to_string(),
                timeout_secs: 900,
                image_interpreter: true,
            },
            fetch: FetchConfig {
                timeout_secs: 60,
                max_bytes: 256 * 1024 * 1024, // 256MB
            },
            launcher: LauncherConfig {
                isolation: Isolation::None,
                host_path_fallback: true,
                grace_period_secs: 10,
                keep_containers: false,
            },
            logging: LoggingConfig {
                format: LogFormat::Pretty,
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Defaults, then the TOML file, then `STOWAGE_*` environment variables.
    ///
    /// Without an explicit path, `stowage.toml` in the current directory is
    /// used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, StowageError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(StowageError::ConfigError {
                        reason: format!("config file not found: {}", path.display()),
                    });
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE));
            }
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| StowageError::ConfigError {
                reason: e.to_string(),
            })
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store.dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "stowage.toml",
                r#"
                [store]
                dir = "/var/lib/stowage"

                [launcher]
                isolation = "chroot"
                "#,
            )?;
            jail.set_env("STOWAGE_LAUNCHER__GRACE_PERIOD_SECS", "3");

            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.store.dir, PathBuf::from("/var/lib/stowage"));
            assert_eq!(config.launcher.isolation, Isolation::Chroot);
            assert_eq!(config.launcher.grace_period_secs, 3);
            assert_eq!(config.installer.program, "python3");
            Ok(())
        });
    }

    #[test]
    fn test_unknown_field_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[store]\npath = \"x\"\n")?;
            let err = Config::load(Some(Path::new("custom.toml"))).unwrap_err();
            assert!(matches!(err, StowageError::ConfigError { .. }));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/nonexistent/stowage.toml"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }
}
