//! The two-phase scan of a single job.
//!
//! ```text
//! Started -> DiscoveryRunning -> NoPorts ------------------------------> Merged -> Uploaded -> Done
//!                             \-> PortsFound -> [EnrichmentRunning] --/
//! ```
//!
//! Discovery finds the open ports. Enrichment, when the job asks for it,
//! identifies the services on exactly those ports. The result is annotated
//! with the job's hostnames and uploaded to the ledger. A target that did
//! not answer yields no host to annotate, and nothing is uploaded.
//!
//! The caller must already hold the target lock. The pipeline registers the
//! job in the running-target directory and the process registry, and a
//! [`JobGuard`] removes those registrations (and the lock) on every exit path.

use std::fmt;
use std::sync::Arc;

use scanfleet_common::config::{EmptyResultPolicy, WorkerConfig};
use scanfleet_common::job::{ImportMode, Job};
use scanfleet_common::records::{ProcessRecord, RunningTarget};
use scanfleet_report::ReportParser;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::ledger::{LedgerError, ScanLedger};
use crate::process::ProcessOutput;
use crate::runner::{RunnerError, ScanRunner, ScanTool};
use crate::store::{CleanupScope, CoordinationStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Started,
    DiscoveryRunning,
    NoPorts,
    PortsFound,
    EnrichmentRunning,
    Merged,
    Uploaded,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { uploads: usize },
    /// Discovery produced nothing usable; nothing was uploaded.
    NoReport,
    Failed(String),
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Completed { uploads } => write!(f, "completed ({uploads} uploads)"),
            PipelineOutcome::NoReport => f.write_str("no report"),
            PipelineOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
enum PipelineError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct Pipeline {
    config: Arc<WorkerConfig>,
    tool: ScanTool,
    store: Arc<dyn CoordinationStore>,
    ledger: Arc<dyn ScanLedger>,
    parser: Arc<dyn ReportParser>,
}

impl Pipeline {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn CoordinationStore>,
        ledger: Arc<dyn ScanLedger>,
        parser: Arc<dyn ReportParser>,
    ) -> Result<Self, RunnerError> {
        let tool: ScanTool = config.scan_command.parse()?;
        Ok(Self {
            config,
            tool,
            store,
            ledger,
            parser,
        })
    }

    /// Runs `job` to completion. Never fails past this point: every error
    /// ends up in the outcome, and registrations are always cleaned up.
    pub async fn run(&self, job: &Job) -> PipelineOutcome {
        info!(job = %job.id, ip = %job.ip, "Starting scan");
        let guard: JobGuard = JobGuard::register(self.store.clone(), job, &self.config.hostname).await;

        let outcome: PipelineOutcome = match self.scan(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job = %job.id, ip = %job.ip, "Scan failed: {e}");
                PipelineOutcome::Failed(e.to_string())
            }
        };

        guard.release().await;
        transition(job, PipelineState::Done);
        info!(job = %job.id, ip = %job.ip, "Scan {outcome}");
        outcome
    }

    async fn scan(&self, job: &Job) -> Result<PipelineOutcome, PipelineError> {
        transition(job, PipelineState::Started);
        let target: String = job.ip.to_string();

        let mut discovery: ScanRunner = self.runner();
        discovery.run_discovery_background(&target, self.discovery_opts(job))?;
        transition(job, PipelineState::DiscoveryRunning);

        let output: ProcessOutput = self.supervise(job, &mut discovery).await?;
        if !finished(&output) {
            warn!(job = %job.id, "Discovery did not finish: {}", output.stderr.trim());
            return Ok(PipelineOutcome::NoReport);
        }
        let Some(report) = discovery.parse_output() else {
            warn!(job = %job.id, "Discovery produced no readable report");
            return Ok(PipelineOutcome::NoReport);
        };

        if report.single_host().map_err(RunnerError::from)?.is_none() {
            warn!(job = %job.id, ip = %job.ip, "Target did not answer, nothing to report");
            return Ok(PipelineOutcome::NoReport);
        }
        let ports: Vec<u16> = ScanRunner::open_ports(&report)?;
        if ports.is_empty() {
            transition(job, PipelineState::NoPorts);
            return self.report_no_ports(job, &discovery).await;
        }
        transition(job, PipelineState::PortsFound);
        info!(job = %job.id, ip = %job.ip, "Found {} open ports", ports.len());

        if !job.include_enrichment {
            let annotated: String = discovery.merge_and_annotate(None, &target, &job.hostnames)?;
            transition(job, PipelineState::Merged);
            self.ledger.upload(&job.project, &annotated, job.mode).await?;
            transition(job, PipelineState::Uploaded);
            return Ok(PipelineOutcome::Completed { uploads: 1 });
        }

        let mut enrichment: ScanRunner = self.runner();
        enrichment.run_enrichment_background(&target, &ports, self.enrichment_opts(job))?;
        transition(job, PipelineState::EnrichmentRunning);
        let output: ProcessOutput = self.supervise(job, &mut enrichment).await?;

        let discovery_only: String = discovery.merge_and_annotate(None, &target, &job.hostnames)?;
        let mut uploads: usize = 0;

        let merged_upload: Result<(), PipelineError> =
            if finished(&output) && enrichment.parse_output().is_some() {
                let merged: String =
                    discovery.merge_and_annotate(Some(&enrichment), &target, &job.hostnames)?;
                transition(job, PipelineState::Merged);
                let result = self.ledger.upload(&job.project, &merged, job.mode).await;
                uploads += usize::from(result.is_ok());
                result.map_err(PipelineError::from)
            } else {
                warn!(job = %job.id, "Enrichment produced no usable report, keeping discovery findings only");
                Ok(())
            };

        // Discovery findings go up regardless, so ports enrichment no longer saw are kept.
        let append_upload = self
            .ledger
            .upload(&job.project, &discovery_only, ImportMode::Append)
            .await;
        uploads += usize::from(append_upload.is_ok());

        merged_upload?;
        append_upload?;
        transition(job, PipelineState::Uploaded);
        Ok(PipelineOutcome::Completed { uploads })
    }

    async fn report_no_ports(
        &self,
        job: &Job,
        discovery: &ScanRunner,
    ) -> Result<PipelineOutcome, PipelineError> {
        info!(job = %job.id, ip = %job.ip, "No open ports");

        match self.config.empty_result_policy {
            EmptyResultPolicy::AnnotatedReport => {
                let annotated: String =
                    discovery.merge_and_annotate(None, &job.ip.to_string(), &job.hostnames)?;
                transition(job, PipelineState::Merged);
                self.ledger.upload(&job.project, &annotated, job.mode).await?;
            }
            EmptyResultPolicy::ExplicitRecord => {
                self.ledger.create_empty(&job.project, &job.ip, job.mode).await?;
            }
        }

        transition(job, PipelineState::Uploaded);
        Ok(PipelineOutcome::Completed { uploads: 1 })
    }

    /// Registers the phase's pid, waits up to the job timeout, deregisters.
    async fn supervise(
        &self,
        job: &Job,
        runner: &mut ScanRunner,
    ) -> Result<ProcessOutput, PipelineError> {
        let host: &str = &self.config.hostname;

        if let Some(pid) = runner.pid() {
            let record = ProcessRecord::new(&job.id, pid, host);
            if let Err(e) = self.store.track_process(&record).await {
                warn!(job = %job.id, pid, "Failed to register process: {e}");
            }
        }

        let waited = runner.wait(job.timeout()).await;

        if let Err(e) = self.store.untrack_process(&job.id, host).await {
            warn!(job = %job.id, "Failed to deregister process: {e}");
        }

        let output: ProcessOutput = waited?;
        debug!(job = %job.id, "Scan phase exited with code {}", output.exit_code);
        Ok(output)
    }

    fn runner(&self) -> ScanRunner {
        ScanRunner::new(
            self.tool.clone(),
            self.parser.clone(),
            self.config.terminate_grace,
        )
    }

    fn discovery_opts<'a>(&'a self, job: &'a Job) -> &'a str {
        non_empty_or(&job.discovery_opts, &self.config.discovery_opts)
    }

    fn enrichment_opts<'a>(&'a self, job: &'a Job) -> &'a str {
        non_empty_or(&job.enrichment_opts, &self.config.enrichment_opts)
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() { fallback } else { value }
}

/// The process exited on its own: no timeout, no signal.
fn finished(output: &ProcessOutput) -> bool {
    !output.timed_out && output.exit_code >= 0
}

fn transition(job: &Job, state: PipelineState) {
    debug!(job = %job.id, "Pipeline state: {state:?}");
}

/// Owns a job's registrations in the coordination store.
///
/// [`release`](Self::release) removes them on the normal path. A guard dropped
/// without being released (panic, cancelled future) spawns the same cleanup
/// onto the current runtime.
pub struct JobGuard {
    store: Arc<dyn CoordinationStore>,
    scope: CleanupScope,
    released: bool,
}

impl JobGuard {
    /// Lists the job in the running-target directory and records its running-task entry.
    pub async fn register(store: Arc<dyn CoordinationStore>, job: &Job, worker: &str) -> Self {
        let entry = RunningTarget::new(job.ip, job.hostnames.clone(), worker);

        if let Err(e) = store.add_running_target(&job.project, &entry).await {
            warn!(job = %job.id, "Failed to add running target: {e}");
        }
        if let Err(e) = store.record_running_task(&job.id, worker, &entry).await {
            warn!(job = %job.id, "Failed to record running task: {e}");
        }

        Self {
            store,
            scope: CleanupScope::for_job(job, worker),
            released: false,
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        release_registrations(self.store.clone(), self.scope.clone()).await;
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = self.store.clone();
        let scope = self.scope.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(job = %scope.job_id, "Job ended abnormally, cleaning up");
                handle.spawn(release_registrations(store, scope));
            }
            Err(_) => error!(job = %scope.job_id, "No runtime left to clean up job"),
        }
    }
}

/// Failures are logged and swallowed.
async fn release_registrations(store: Arc<dyn CoordinationStore>, scope: CleanupScope) {
    match store
        .remove_running_target(&scope.project, &scope.ip, &scope.host)
        .await
    {
        Ok(true) => {}
        Ok(false) => debug!(job = %scope.job_id, "No running-target entry to remove"),
        Err(e) => error!(job = %scope.job_id, "Failed to remove running target: {e}"),
    }

    if let Err(e) = store.cleanup_job(&scope).await {
        error!(job = %scope.job_id, "Failed to clean up job: {e}");
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
