use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

/// Runs the `stowage` binary against a private store.
#[derive(Debug, Clone)]
pub struct BinaryRunner {
    binary: PathBuf,
    store: PathBuf,
}

#[derive(Debug)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// A `stowage` process running in the background.
#[derive(Debug)]
pub struct RunningBinary {
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl BinaryRunner {
    pub fn new(binary: impl Into<PathBuf>, store: &Path) -> Self {
        Self {
            binary: binary.into(),
            store: store.to_path_buf(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--store")
            .arg(&self.store)
            .args(args)
            .env("STOWAGE_LAUNCHER__GRACE_PERIOD_SECS", "2")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    pub async fn output(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.command(args).output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    pub fn spawn(&self, args: &[&str]) -> Result<RunningBinary> {
        let mut child = self.command(args).spawn()?;
        let stdout = child.stdout.take().context("stdout not captured")?;
        Ok(RunningBinary {
            child,
            stdout: BufReader::new(stdout).lines(),
        })
    }
}

impl RunningBinary {
    /// Wait for a stdout line equal to `expected`.
    pub async fn wait_for_line(&mut self, expected: &str, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            while let Some(line) = self.stdout.next_line().await? {
                if line.trim() == expected {
                    return Ok(());
                }
            }
            anyhow::bail!("stdout closed before {:?}", expected)
        })
        .await
        .with_context(|| format!("timed out waiting for {:?}", expected))?
    }

    pub fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self.child.id().context("process already exited")?;
        kill(Pid::from_raw(pid as i32), signal)?;
        Ok(())
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<Option<i32>> {
        let status = tokio::time::timeout(timeout, self.child.wait())
            .await
            .context("timed out waiting for exit")??;
        Ok(status.code())
    }
}
