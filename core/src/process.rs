//! Supervision of a single external command.
//!
//! A [`ProcessHandle`] owns exactly one OS process. Output is captured in
//! memory; stdout and stderr are drained by background tasks from the moment
//! the process starts so a chatty child never blocks on a full pipe.
//!
//! Every failure (spawn error, timeout, abnormal exit) is reported through
//! [`ProcessOutput`]. Nothing here panics or returns early past the caller.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

const TIMEOUT_MESSAGE: &str = "Timeout expired";
const EXIT_CODE_FAILED: i32 = -1;
// Bounds the wait for pipe EOF when a grandchild kept our stdout/stderr open.
const OUTPUT_DRAIN_LIMIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    pub succeeded: bool,
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process could not be spawned, timed out or died from a signal.
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ProcessOutput {
    fn failed(stderr: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: EXIT_CODE_FAILED,
            timed_out: false,
        }
    }
}

pub struct ProcessHandle {
    command: Vec<String>,
    child: Child,
    pid: Option<u32>,
    grace: Duration,
    stdout: Option<Drained>,
    stderr: Option<Drained>,
    timed_out: bool,
    output: Option<ProcessOutput>,
}

impl ProcessHandle {
    /// Runs `command` to completion, for at most `timeout`.
    ///
    /// On timeout the process is terminated and whatever it printed so far is kept.
    pub async fn run_foreground(command: &[String], timeout: Duration) -> ProcessOutput {
        let mut handle: ProcessHandle =
            match Self::run_background(command.to_vec(), DEFAULT_TERMINATE_GRACE) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Failed to spawn {:?}: {e}", command.first());
                    return ProcessOutput::failed(e.to_string());
                }
            };
        handle.wait(timeout).await
    }

    /// Spawns `command` without waiting for it.
    ///
    /// The caller must eventually [`wait`](Self::wait) or
    /// [`terminate`](Self::terminate); a handle dropped before that kills the process.
    pub fn run_background(command: Vec<String>, grace: Duration) -> io::Result<Self> {
        debug!("Running command: {}", command.join(" "));
        let mut child: Child = build_command(&command)?.spawn()?;
        let pid: Option<u32> = child.id();
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        Ok(Self {
            command,
            child,
            pid,
            grace,
            stdout,
            stderr,
            timed_out: false,
            output: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Final output, once the process has been waited for or terminated.
    pub fn output(&self) -> Option<&ProcessOutput> {
        self.output.as_ref()
    }

    pub fn is_running(&mut self) -> bool {
        self.output.is_none() && matches!(self.child.try_wait(), Ok(None))
    }

    /// Waits for the process to exit, terminating it if `timeout` elapses first.
    pub async fn wait(&mut self, timeout: Duration) -> ProcessOutput {
        if let Some(output) = &self.output {
            return output.clone();
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => self.collect(Some(status)).await,
            Ok(Err(e)) => {
                warn!("Failed to wait for process {:?}: {e}", self.pid);
                self.terminate().await
            }
            Err(_elapsed) => {
                warn!(
                    "Process {:?} still running after {}s, terminating",
                    self.pid,
                    timeout.as_secs()
                );
                self.timed_out = true;
                self.terminate().await
            }
        }
    }

    /// Stops the process: SIGTERM, then SIGKILL once the grace period runs out.
    ///
    /// Safe to call any number of times; output is collected once.
    pub async fn terminate(&mut self) -> ProcessOutput {
        if let Some(output) = &self.output {
            return output.clone();
        }

        if let Ok(None) = self.child.try_wait() {
            info!("Terminating process: {:?}", self.pid);
            self.signal_stop();

            if tokio::time::timeout(self.grace, self.child.wait()).await.is_err() {
                warn!("Process {:?} ignored SIGTERM, killing", self.pid);
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill process {:?}: {e}", self.pid);
                }
            }
        }

        let status: Option<ExitStatus> = self.child.wait().await.ok();
        self.collect(status).await
    }

    #[cfg(unix)]
    fn signal_stop(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            let _ = self.child.start_kill();
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to {pid}: {e}");
        }
    }

    #[cfg(not(unix))]
    fn signal_stop(&mut self) {
        let _ = self.child.start_kill();
    }

    async fn collect(&mut self, status: Option<ExitStatus>) -> ProcessOutput {
        let stdout: String = join_drained(self.stdout.take()).await;
        let mut stderr: String = join_drained(self.stderr.take()).await;

        let exit_code: i32 = match (self.timed_out, status.and_then(|s| s.code())) {
            (false, Some(code)) => code,
            _ => EXIT_CODE_FAILED,
        };
        if self.timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(TIMEOUT_MESSAGE);
        }

        let output = ProcessOutput {
            succeeded: !self.timed_out && status.is_some_and(|s| s.success()),
            stdout,
            stderr,
            exit_code,
            timed_out: self.timed_out,
        };
        debug!("Process {:?} finished with exit code {}", self.pid, output.exit_code);
        self.output = Some(output.clone());
        output
    }
}

fn build_command(argv: &[String]) -> io::Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

/// A pipe being read into memory by a background task.
struct Drained {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

fn drain<R>(mut reader: R) -> Drained
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = buf.clone();
    let task = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .extend_from_slice(&chunk[..n]),
            }
        }
    });
    Drained { buf, task }
}

/// Everything read so far. Waits a bounded time for EOF first.
async fn join_drained(drained: Option<Drained>) -> String {
    let Some(Drained { buf, mut task }) = drained else {
        return String::new();
    };
    if tokio::time::timeout(OUTPUT_DRAIN_LIMIT, &mut task).await.is_err() {
        task.abort();
    }
    let bytes = buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    String::from_utf8_lossy(&bytes).into_owned()
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
