use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use stowage_models::StowageError;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Signals relayed from the launcher to the container process.
pub const FORWARDED_SIGNALS: [Signal; 6] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Catches the forwarded signal set for the lifetime of a container.
///
/// Install it before spawning so nothing delivered during startup is lost
/// or handled by the launcher's default disposition.
pub struct SignalForwarder {
    rx: mpsc::UnboundedReceiver<Signal>,
    listeners: Vec<JoinHandle<()>>,
}

impl SignalForwarder {
    pub fn install() -> Result<Self, StowageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = Vec::with_capacity(FORWARDED_SIGNALS.len());

        for sig in FORWARDED_SIGNALS {
            let mut stream =
                signal(SignalKind::from_raw(sig as i32)).map_err(|e| StowageError::Launch {
                    reason: format!("failed to install {} handler: {}", sig, e),
                })?;
            let tx = tx.clone();
            listeners.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(sig).is_err() {
                        break;
                    }
                }
            }));
        }

        Ok(Self { rx, listeners })
    }

    /// Next signal received by this process.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

/// Send `sig` to the process group led by `leader`. A group that already
/// exited is not an error.
pub fn forward_signal(leader: Pid, sig: Signal) -> Result<(), StowageError> {
    match killpg(leader, sig) {
        Ok(()) => {
            debug!("Sent {} to process group {}", sig, leader);
            Ok(())
        }
        Err(Errno::ESRCH) => {
            warn!("Process group {} is gone, dropping {}", leader, sig);
            Ok(())
        }
        Err(e) => Err(StowageError::Launch {
            reason: format!("failed to send {} to {}: {}", sig, leader, e),
        }),
    }
}

/// Exit code of a process killed by `signal`.
pub fn signal_exit_code(signal: i32) -> i32 {
    128 + signal
}
