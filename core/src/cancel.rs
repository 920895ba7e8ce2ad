//! Fleet-wide cancellation.
//!
//! Every worker receives every cancellation broadcast. Only the worker whose
//! process registry holds the job acts on it; everyone else finds nothing and
//! moves on. Acting means one SIGTERM. The owning pipeline notices the exit,
//! stops and cleans up after itself.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{CoordinationStore, MIN_TRACKED_PID};

#[derive(Debug, Error)]
#[error("failed to signal process {pid}: {reason}")]
pub struct SignalError {
    pub pid: u32,
    pub reason: String,
}

/// Sends signals to local OS processes.
pub trait ProcessSignaller: Send + Sync {
    /// Signal-0 probe.
    fn is_alive(&self, pid: u32) -> bool;

    /// Graceful stop request (SIGTERM).
    fn terminate(&self, pid: u32) -> Result<(), SignalError>;
}

/// [`ProcessSignaller`] backed by `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl NixSignaller {
    /// Only single, positive pids: `kill(2)` reads 0 and negatives as process groups.
    fn pid(pid: u32) -> Result<nix::unistd::Pid, SignalError> {
        let raw: i32 = i32::try_from(pid)
            .ok()
            .filter(|&raw| raw >= MIN_TRACKED_PID as i32)
            .ok_or_else(|| SignalError {
                pid,
                reason: "pid out of range".to_string(),
            })?;
        Ok(nix::unistd::Pid::from_raw(raw))
    }
}

impl ProcessSignaller for NixSignaller {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        let Ok(target) = Self::pid(pid) else {
            return false;
        };
        match kill(target, None) {
            Ok(()) => true,
            // exists, owned by someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn terminate(&self, pid: u32) -> Result<(), SignalError> {
        use nix::sys::signal::{Signal, kill};

        kill(Self::pid(pid)?, Signal::SIGTERM).map_err(|e| SignalError {
            pid,
            reason: e.to_string(),
        })
    }
}

/// What one [`CancellationHandler::handle`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelSummary {
    pub signalled: usize,
    pub already_exited: usize,
    /// Job ids with no local registry entry.
    pub not_owned: usize,
    pub failed: usize,
}

pub struct CancellationHandler {
    store: Arc<dyn CoordinationStore>,
    signaller: Arc<dyn ProcessSignaller>,
    host: String,
}

impl CancellationHandler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        signaller: Arc<dyn ProcessSignaller>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            signaller,
            host: host.into(),
        }
    }

    /// Sends SIGTERM to the local process of each job in `job_ids`.
    ///
    /// Never waits for the exit and never touches the registry.
    pub async fn handle(&self, job_ids: &[String]) -> CancelSummary {
        let mut summary = CancelSummary::default();

        for job_id in job_ids {
            let pid: u32 = match self.store.lookup_process(job_id, &self.host).await {
                Ok(Some(pid)) => pid,
                Ok(None) => {
                    debug!("Job {job_id} is not running on this worker");
                    summary.not_owned += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to look up job {job_id}: {e}");
                    summary.failed += 1;
                    continue;
                }
            };

            if !self.signaller.is_alive(pid) {
                info!("Process {pid} for job {job_id} already exited");
                summary.already_exited += 1;
                continue;
            }

            match self.signaller.terminate(pid) {
                Ok(()) => {
                    info!("Sent SIGTERM to process {pid} for job {job_id}");
                    summary.signalled += 1;
                }
                Err(e) => {
                    warn!("{e}");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
