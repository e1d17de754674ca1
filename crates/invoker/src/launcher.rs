use crate::container::Container;
use crate::signals::{forward_signal, signal_exit_code, SignalForwarder};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use stowage_models::{ImageConfig, Isolation, LauncherConfig, StowageError, DEFAULT_PATH};
use stowage_packaging::ImageStore;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Runtime overrides for one container.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replaces the image entrypoint and drops its `cmd`.
    pub entrypoint: Option<String>,
    /// Replaces the image `cmd` when non-empty.
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub keep: bool,
    /// Collect stdout/stderr instead of inheriting the launcher's stdio.
    pub capture_output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub container_id: String,
    pub image_id: String,
    pub code: i32,
    /// Set when the process was killed by a signal.
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// The argv a container runs: `entrypoint ++ cmd`, with runtime overrides.
pub fn resolve_command(config: &ImageConfig, options: &RunOptions) -> Vec<String> {
    match &options.entrypoint {
        Some(entrypoint) => std::iter::once(entrypoint.clone())
            .chain(options.args.iter().cloned())
            .collect(),
        None if options.args.is_empty() => config.command(),
        None => config
            .entrypoint
            .iter()
            .chain(options.args.iter())
            .cloned()
            .collect(),
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Where to find a program on the host and what to exec.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedProgram {
    /// Host path checked before spawning.
    host: PathBuf,
    /// Path handed to exec. Differs from `host` only under chroot.
    exec: PathBuf,
}

/// Runs image commands as child processes on a private copy of the image
/// filesystem.
pub struct Invoker {
    store: ImageStore,
    config: LauncherConfig,
}

impl Invoker {
    pub fn new(store: ImageStore, config: &LauncherConfig) -> Self {
        Self {
            store,
            config: config.clone(),
        }
    }

    /// Environment of the container process. Nothing is inherited from the
    /// launcher except, with `host_path_fallback`, the host `PATH`.
    fn environment(
        &self,
        image: &ImageConfig,
        options: &RunOptions,
        container: &Container,
    ) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        let mut set = |key: &str, value: String| match env.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => env.push((key.to_string(), value)),
        };

        for (key, value) in image.env.iter().chain(options.env.iter()) {
            set(key.as_str(), value.clone());
        }
        set("HOSTNAME", container.short_id().to_string());

        if self.config.isolation == Isolation::None {
            let path = env
                .iter()
                .find(|(k, _)| k == "PATH")
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| DEFAULT_PATH.to_string());
            let mut mapped = map_search_path(&path, container);
            if self.config.host_path_fallback {
                if let Ok(host_path) = std::env::var("PATH") {
                    mapped = format!("{}:{}", mapped, host_path);
                }
            }
            let pythonpath = env
                .iter()
                .find(|(k, _)| k == "PYTHONPATH")
                .map(|(_, v)| map_search_path(v, container));

            let mut set = |key: &str, value: String| match env.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value,
                None => env.push((key.to_string(), value)),
            };
            set("PATH", mapped);
            if let Some(pythonpath) = pythonpath {
                set("PYTHONPATH", pythonpath);
            }
        } else if !env.iter().any(|(k, _)| k == "PATH") {
            env.push(("PATH".to_string(), DEFAULT_PATH.to_string()));
        }
        env
    }

    /// Locate `program` the way `execvp` would, inside the container.
    fn resolve_program(
        &self,
        program: &str,
        search_path: &str,
        workdir: &str,
        container: &Container,
    ) -> Result<ResolvedProgram, StowageError> {
        let chroot = self.config.isolation == Isolation::Chroot;
        let not_found = || StowageError::EntrypointNotFound {
            program: program.to_string(),
        };
        let not_executable = || StowageError::EntrypointNotExecutable {
            program: program.to_string(),
        };
        let check = |host: PathBuf, exec: PathBuf| {
            if !host.exists() {
                Err(not_found())
            } else if !is_executable(&host) {
                Err(not_executable())
            } else {
                Ok(ResolvedProgram { host, exec })
            }
        };

        if program.is_empty() {
            return Err(not_found());
        }

        if program.contains('/') {
            let image_path = if program.starts_with('/') {
                PathBuf::from(program)
            } else {
                Path::new(workdir).join(program)
            };
            let host = container.host_path(&image_path.to_string_lossy());
            if chroot {
                return check(host, image_path);
            }
            if !host.exists() && program.starts_with('/') && self.config.host_path_fallback {
                return check(image_path.clone(), image_path);
            }
            return check(host.clone(), host);
        }

        // In chroot mode `search_path` holds image paths, otherwise the
        // entries were already mapped to host paths.
        let mut found_non_executable = false;
        for dir in search_path.split(':').filter(|d| !d.is_empty()) {
            let (host, exec) = if chroot {
                let image_path = Path::new(dir).join(program);
                (container.host_path(&image_path.to_string_lossy()), image_path)
            } else {
                let host = Path::new(dir).join(program);
                (host.clone(), host)
            };
            if is_executable(&host) {
                return Ok(ResolvedProgram { host, exec });
            }
            if host.is_file() {
                found_non_executable = true;
            }
        }

        if found_non_executable {
            Err(not_executable())
        } else {
            Err(not_found())
        }
    }

    fn command(
        &self,
        argv: &[String],
        program: &ResolvedProgram,
        env: &[(String, String)],
        workdir: &str,
        container: &Container,
        capture: bool,
    ) -> Command {
        let mut args: Vec<String> = argv[1..].to_vec();
        if self.config.isolation == Isolation::None {
            // Absolute paths naming image files are rewritten into the rootfs.
            for arg in args.iter_mut() {
                if arg.starts_with('/') && container.host_path(arg).exists() {
                    *arg = container.host_path(arg).to_string_lossy().into_owned();
                }
            }
        }

        let mut command = Command::new(&program.exec);
        command
            .arg0(&argv[0])
            .args(&args)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .process_group(0)
            .kill_on_drop(true);

        if capture {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        match self.config.isolation {
            Isolation::None => {
                command.current_dir(container.host_path(workdir));
            }
            Isolation::Chroot => {
                let rootfs = container.rootfs().to_path_buf();
                let workdir = PathBuf::from(workdir);
                // SAFETY: only async-signal-safe syscalls run between fork and exec.
                unsafe {
                    command.pre_exec(move || {
                        nix::unistd::chroot(&rootfs)?;
                        nix::unistd::chdir(&workdir)?;
                        Ok(())
                    });
                }
            }
        }
        command
    }

    /// Start `reference` and wait for it, forwarding signals until it exits.
    #[instrument(skip(self, options))]
    pub async fn run(&self, reference: &str, options: &RunOptions) -> Result<ExitOutcome, StowageError> {
        let record = self.store.resolve_image(reference)?;
        let image = &record.config;
        let argv = resolve_command(image, options);
        if argv.is_empty() {
            return Err(StowageError::Launch {
                reason: format!("image {} has no command", record.short_id()),
            });
        }

        let keep = options.keep || self.config.keep_containers;
        let container = Container::create(&self.store, image, keep)?;
        let workdir = if image.workdir.is_empty() {
            "/"
        } else {
            image.workdir.as_str()
        };
        let env = self.environment(image, options, &container);
        let search_path = env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.as_str())
            .unwrap_or(DEFAULT_PATH);
        let program = self.resolve_program(&argv[0], search_path, workdir, &container)?;
        debug!("Resolved {} to {}", argv[0], program.host.display());

        let mut forwarder = SignalForwarder::install()?;
        let mut child = self
            .command(&argv, &program, &env, workdir, &container, options.capture_output)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StowageError::EntrypointNotFound {
                    program: argv[0].clone(),
                },
                ErrorKind::PermissionDenied => StowageError::EntrypointNotExecutable {
                    program: argv[0].clone(),
                },
                _ => StowageError::Launch {
                    reason: e.to_string(),
                },
            })?;
        let leader = child
            .id()
            .map(|pid| Pid::from_raw(pid as i32))
            .ok_or_else(|| StowageError::Launch {
                reason: "process exited before it could be tracked".to_string(),
            })?;
        info!(
            "Started container {} from {} (pid {}): {:?}",
            container.id(),
            record.short_id(),
            leader,
            argv
        );

        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);

        let grace = Duration::from_secs(self.config.grace_period_secs);
        let mut deadline: Option<Instant> = None;
        let status = loop {
            let pending_kill = deadline;
            let kill_timer = async move {
                match pending_kill {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| StowageError::Launch { reason: e.to_string() })?;
                }
                Some(sig) = forwarder.recv() => {
                    info!("Forwarding {} to container {}", sig, container.id());
                    forward_signal(leader, sig)?;
                    if matches!(sig, Signal::SIGTERM | Signal::SIGINT) && deadline.is_none() {
                        deadline = Some(Instant::now() + grace);
                    }
                }
                _ = kill_timer => {
                    warn!(
                        "Container {} still running {}s after stop signal, killing",
                        container.id(),
                        grace.as_secs()
                    );
                    forward_signal(leader, Signal::SIGKILL)?;
                    deadline = None;
                }
            }
        };

        let outcome = ExitOutcome {
            container_id: container.id().to_string(),
            image_id: record.id.clone(),
            code: exit_code(&status),
            signal: status.signal(),
            stdout: join_output(stdout).await,
            stderr: join_output(stderr).await,
        };
        info!("Container {} exited with code {}", outcome.container_id, outcome.code);
        Ok(outcome)
    }
}

fn map_search_path(value: &str, container: &Container) -> String {
    value
        .split(':')
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            if entry.starts_with('/') {
                container.host_path(entry).to_string_lossy().into_owned()
            } else {
                entry.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn exit_code(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => signal_exit_code(signal),
        (None, None) => 1,
    }
}

fn collect<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn join_output(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    match handle {
        Some(handle) => String::from_utf8_lossy(&handle.await.unwrap_or_default()).into_owned(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(entrypoint: &[&str], cmd: &[&str]) -> ImageConfig {
        ImageConfig {
            workdir: "/app".to_string(),
            entrypoint: entrypoint.iter().map(|s| s.to_string()).collect(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_command_overrides() {
        let config = image(&["python"], &["bot.py"]);
        assert_eq!(resolve_command(&config, &RunOptions::default()), args(&["python", "bot.py"]));

        let with_args = RunOptions {
            args: args(&["other.py", "--debug"]),
            ..Default::default()
        };
        assert_eq!(
            resolve_command(&config, &with_args),
            args(&["python", "other.py", "--debug"])
        );

        let with_entrypoint = RunOptions {
            entrypoint: Some("sh".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_command(&config, &with_entrypoint), args(&["sh"]));
    }

    #[test]
    fn test_exit_code_from_status() {
        assert_eq!(exit_code(&ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(&ExitStatus::from_raw(15)), 143);
    }

    #[test]
    fn test_environment_maps_search_paths_into_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let mut config = LauncherConfig {
            isolation: Isolation::None,
            host_path_fallback: false,
            grace_period_secs: 1,
            keep_containers: false,
        };
        let mut image = image(&[], &["python"]);
        image.set_env("PYTHONPATH", "/usr/local/lib/stowage/site-packages".to_string());
        let options = RunOptions {
            env: vec![("BOT_TOKEN".to_string(), "secret".to_string())],
            ..Default::default()
        };

        let invoker = Invoker::new(store.clone(), &config);
        let container = Container::create(&store, &image, false).unwrap();
        let env = invoker.environment(&image, &options, &container);
        let get = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());

        let root = container.rootfs().to_string_lossy().into_owned();
        assert_eq!(get("BOT_TOKEN").as_deref(), Some("secret"));
        assert_eq!(get("HOSTNAME").as_deref(), Some(container.short_id()));
        assert_eq!(
            get("PYTHONPATH"),
            Some(format!("{}/usr/local/lib/stowage/site-packages", root))
        );
        assert!(get("PATH").unwrap().starts_with(&format!("{}/usr/local/sbin", root)));

        config.isolation = Isolation::Chroot;
        let invoker = Invoker::new(store, &config);
        let env = invoker.environment(&image, &options, &container);
        let path = env.iter().find(|(k, _)| k == "PATH").map(|(_, v)| v.as_str());
        assert_eq!(path, Some(DEFAULT_PATH));
    }
}
