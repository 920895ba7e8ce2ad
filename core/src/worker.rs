//! The worker loop: pull jobs, claim their targets, run them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use scanfleet_common::config::WorkerConfig;
use scanfleet_common::job::{CancelRequest, Job};
use scanfleet_common::records::TargetLockHolder;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationHandler;
use crate::intake::{IntakeError, JobQueue};
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::store::CoordinationStore;

pub struct Worker {
    config: Arc<WorkerConfig>,
    store: Arc<dyn CoordinationStore>,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    slots: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn CoordinationStore>,
        queue: Arc<dyn JobQueue>,
        pipeline: Pipeline,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.worker_slots.max(1)));
        Self {
            config,
            store,
            queue,
            pipeline: Arc::new(pipeline),
            slots,
        }
    }

    /// Runs jobs, at most one per slot, until `shutdown` resolves. Jobs
    /// already running are waited for before this returns.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut running: JoinSet<(Job, PipelineOutcome)> = JoinSet::new();
        info!(
            "Worker {} ready with {} slots",
            self.config.hostname, self.config.worker_slots
        );

        loop {
            while let Some(finished) = running.try_join_next() {
                log_finished(finished);
            }

            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job: Job = tokio::select! {
                _ = &mut shutdown => break,
                next = self.queue.next_job() => match next {
                    Ok(Some(job)) => job,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("Failed to read job queue: {e}");
                        tokio::time::sleep(self.config.queue_poll).await;
                        continue;
                    }
                },
            };

            if !self.claim(&job).await {
                continue;
            }

            let pipeline = self.pipeline.clone();
            running.spawn(async move {
                let _permit = permit;
                let outcome: PipelineOutcome = pipeline.run(&job).await;
                (job, outcome)
            });
        }

        info!("Shutting down, waiting for {} running jobs", running.len());
        while let Some(finished) = running.join_next().await {
            log_finished(finished);
        }
    }

    /// Takes the target lock for `job`. Contention is not an error: the
    /// target belongs to another worker and the job is not started here.
    async fn claim(&self, job: &Job) -> bool {
        let holder = TargetLockHolder {
            worker: self.config.hostname.clone(),
            job_id: job.id.clone(),
            ports: job.port_set(),
        };
        let ttl = self.config.lock_ttl(job);

        match self
            .store
            .acquire_target_lock(&job.project, &job.ip, &holder, ttl)
            .await
        {
            Ok(true) => {
                debug!(job = %job.id, ip = %job.ip, "Target locked for {}s", ttl.as_secs());
                true
            }
            Ok(false) => {
                let owner: String = match self.store.target_lock_holder(&job.project, &job.ip).await {
                    Ok(Some(owner)) => format!("{} (job {})", owner.worker, owner.job_id),
                    _ => "another worker".to_string(),
                };
                info!(job = %job.id, ip = %job.ip, "Target is held by {owner}, skipping");
                false
            }
            Err(e) => {
                error!(job = %job.id, ip = %job.ip, "Failed to lock target: {e}");
                false
            }
        }
    }
}

fn log_finished(finished: Result<(Job, PipelineOutcome), JoinError>) {
    match finished {
        Ok((job, PipelineOutcome::Failed(reason))) => {
            warn!(job = %job.id, ip = %job.ip, "Job failed: {reason}")
        }
        Ok((job, outcome)) => debug!(job = %job.id, "Job finished: {outcome}"),
        Err(e) if e.is_panic() => error!("Job panicked: {e}"),
        Err(e) => warn!("Job task cancelled: {e}"),
    }
}

/// Pause before subscribing again after the cancellation stream ended or
/// could not be opened.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Feeds cancellation broadcasts to `handler`, forever.
///
/// `subscribe` opens a fresh stream. When a stream ends (the store dropped
/// the connection) or cannot be opened, it is opened again after `retry`.
pub async fn serve_cancellations<F, Fut, S>(
    handler: Arc<CancellationHandler>,
    mut subscribe: F,
    retry: Duration,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, IntakeError>>,
    S: Stream<Item = CancelRequest> + Unpin,
{
    loop {
        match subscribe().await {
            Ok(mut requests) => {
                while let Some(request) = requests.next().await {
                    let summary = handler.handle(&request.job_ids).await;
                    debug!(
                        "Cancellation handled: {} signalled, {} already exited, {} not ours, {} failed",
                        summary.signalled, summary.already_exited, summary.not_owned, summary.failed
                    );
                }
                warn!("Cancellation stream closed, subscribing again");
            }
            Err(e) => error!("Failed to subscribe to cancellations: {e}"),
        }
        tokio::time::sleep(retry).await;
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
