use async_trait::async_trait;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use stowage_models::{InstallerConfig, Isolation, StowageError, DEFAULT_PATH};
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

/// Lines of installer stderr carried into the error message.
const STDERR_TAIL_LINES: usize = 20;

const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Root of the image under construction.
    pub rootfs: PathBuf,
    /// Absolute image path of the manifest.
    pub manifest: String,
    /// Environment of the image at this step; its `PATH` is searched for an
    /// interpreter.
    pub env: Vec<(String, String)>,
    /// Empty host directory that receives the installed packages.
    pub target: PathBuf,
    /// Extra flags from the recipe, already validated by the parser.
    pub extra_args: Vec<String>,
}

impl InstallRequest {
    pub fn manifest_host_path(&self) -> PathBuf {
        self.rootfs.join(self.manifest.trim_start_matches('/'))
    }

    fn search_path(&self) -> &str {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.as_str())
            .unwrap_or(DEFAULT_PATH)
    }
}

/// Installs a dependency manifest into a target directory.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Stable description of the toolchain `request` would use, folded into
    /// the cache key of install steps.
    async fn identity(&self, request: &InstallRequest) -> Result<String, StowageError>;

    async fn install(&self, request: &InstallRequest) -> Result<(), StowageError>;
}

/// The interpreter an install runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpreter {
    /// The configured program, looked up on the host.
    Host(String),
    /// An interpreter shipped by the image, executed in place.
    Image { path: PathBuf },
    /// An interpreter shipped by the image, executed inside a chroot.
    Chroot { rootfs: PathBuf, path: PathBuf },
}

impl Interpreter {
    fn describe(&self) -> String {
        match self {
            Interpreter::Host(program) => program.clone(),
            Interpreter::Image { path } => format!("image:{}", path.display()),
            Interpreter::Chroot { path, .. } => format!("chroot:{}", path.display()),
        }
    }

    fn command(&self) -> Command {
        match self {
            Interpreter::Host(program) => Command::new(program),
            Interpreter::Image { path } => Command::new(path),
            Interpreter::Chroot { rootfs, path } => {
                let mut command = Command::new(path);
                let rootfs = rootfs.clone();
                // SAFETY: only async-signal-safe syscalls run between fork and exec.
                unsafe {
                    command.pre_exec(move || {
                        nix::unistd::chroot(&rootfs)?;
                        nix::unistd::chdir("/")?;
                        Ok(())
                    });
                }
                command
            }
        }
    }
}

/// Map an image path to the host, resolving symlinks against `rootfs` so
/// absolute link targets stay inside the image.
fn host_path_in_image(rootfs: &Path, image_path: &Path) -> Option<PathBuf> {
    let mut current = image_path.to_path_buf();
    for _ in 0..MAX_SYMLINK_HOPS {
        let host = rootfs.join(current.strip_prefix("/").unwrap_or(current.as_path()));
        let meta = fs::symlink_metadata(&host).ok()?;
        if !meta.file_type().is_symlink() {
            return Some(host);
        }
        let target = fs::read_link(&host).ok()?;
        current = if target.is_absolute() {
            target
        } else {
            current.parent().unwrap_or(Path::new("/")).join(target)
        };
    }
    None
}

/// Find `program` on the image's `PATH`, returning its image path and the
/// host path of the file it resolves to.
pub fn find_in_image(rootfs: &Path, program: &str, search_path: &str) -> Option<(PathBuf, PathBuf)> {
    let candidates: Vec<PathBuf> = if program.starts_with('/') {
        vec![PathBuf::from(program)]
    } else if program.contains('/') {
        Vec::new()
    } else {
        search_path
            .split(':')
            .filter(|dir| dir.starts_with('/'))
            .map(|dir| Path::new(dir).join(program))
            .collect()
    };

    candidates.into_iter().find_map(|image_path| {
        let host = host_path_in_image(rootfs, &image_path)?;
        let executable = host
            .metadata()
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        executable.then_some((image_path, host))
    })
}

/// Runs `pip install --target` with its download cache disabled, preferring
/// the interpreter of the image being built over the host's.
pub struct PipInstaller {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    image_interpreter: bool,
    isolation: Isolation,
}

impl PipInstaller {
    pub fn new(config: &InstallerConfig, isolation: Isolation) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            image_interpreter: config.image_interpreter,
            isolation,
        }
    }

    pub fn interpreter(&self, request: &InstallRequest) -> Interpreter {
        if self.image_interpreter {
            if let Some((image, host)) = find_in_image(&request.rootfs, &self.program, request.search_path()) {
                return match self.isolation {
                    Isolation::Chroot => Interpreter::Chroot {
                        rootfs: request.rootfs.clone(),
                        path: image,
                    },
                    Isolation::None => Interpreter::Image { path: host },
                };
            }
        }
        Interpreter::Host(self.program.clone())
    }

    fn command(&self, interpreter: &Interpreter, manifest: &Path, target: &Path, extra_args: &[String]) -> Command {
        let mut command = interpreter.command();
        command
            .args(&self.args)
            .arg("install")
            .arg("--no-cache-dir")
            .arg("--disable-pip-version-check")
            .arg("--no-input")
            .arg("--target")
            .arg(target)
            .args(extra_args)
            .arg("--requirement")
            .arg(manifest)
            .env("PIP_NO_CACHE_DIR", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONNOUSERSITE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// `--version` output of the interpreter.
    async fn version(&self, interpreter: &Interpreter) -> Result<String, StowageError> {
        let mut command = interpreter.command();
        command
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| StowageError::DependencyInstall {
                reason: format!("{} --version timed out", interpreter.describe()),
            })?
            .map_err(|e| StowageError::DependencyInstall {
                reason: format!("failed to start {}: {}", interpreter.describe(), e),
            })?;
        if !output.status.success() {
            return Err(StowageError::DependencyInstall {
                reason: format!("{} --version failed ({})", interpreter.describe(), output.status),
            });
        }
        let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            version = String::from_utf8_lossy(&output.stderr).trim().to_string();
        }
        Ok(version)
    }

    async fn run(&self, interpreter: &Interpreter, manifest: &Path, target: &Path, extra_args: &[String]) -> Result<(), StowageError> {
        let child = self
            .command(interpreter, manifest, target, extra_args)
            .spawn()
            .map_err(|e| StowageError::DependencyInstall {
                reason: format!("failed to start {}: {}", interpreter.describe(), e),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| StowageError::DependencyInstall {
                reason: format!("installer timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| StowageError::DependencyInstall {
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = tail(&output.stderr);
            error!("Dependency install failed: {}", stderr);
            return Err(StowageError::DependencyInstall {
                reason: format!("{} ({})", stderr, output.status),
            });
        }
        Ok(())
    }
}

fn tail(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    async fn identity(&self, request: &InstallRequest) -> Result<String, StowageError> {
        let interpreter = self.interpreter(request);
        let version = self.version(&interpreter).await?;
        Ok(format!(
            "pip:{} {} ({})",
            interpreter.describe(),
            self.args.join(" "),
            version
        ))
    }

    #[instrument(skip(self))]
    async fn install(&self, request: &InstallRequest) -> Result<(), StowageError> {
        let interpreter = self.interpreter(request);
        info!(
            "Installing {} into {} with {}",
            request.manifest,
            request.target.display(),
            interpreter.describe()
        );

        match &interpreter {
            Interpreter::Chroot { rootfs, .. } => {
                // The chrooted installer can only write inside the image, so
                // it installs into a scratch directory there that is moved out
                // afterwards.
                let scratch = tempfile::Builder::new()
                    .prefix(".stowage-install-")
                    .tempdir_in(rootfs)
                    .map_err(StowageError::storage)?;
                let name = scratch
                    .path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let target = Path::new("/").join(&name);
                self.run(&interpreter, Path::new(&request.manifest), &target, &request.extra_args)
                    .await?;
                debug!("Moving installed packages out of {}", scratch.path().display());
                fs::remove_dir(&request.target).map_err(StowageError::storage)?;
                fs::rename(scratch.path(), &request.target).map_err(StowageError::storage)?;
            }
            _ => {
                self.run(
                    &interpreter,
                    &request.manifest_host_path(),
                    &request.target,
                    &request.extra_args,
                )
                .await?;
            }
        }

        info!("Dependency install finished");
        Ok(())
    }
}
