//! How jobs and cancellations reach a worker.
//!
//! Jobs travel point-to-point over a Redis list: each job is popped by exactly
//! one worker. Cancellations are broadcast over Redis Pub/Sub: every worker
//! sees every request and decides for itself whether it owns the job.

use std::collections::VecDeque;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use scanfleet_common::job::{CancelRequest, Job};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("failed to encode message: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// The next job, or `None` when none arrived within one poll interval.
    async fn next_job(&self) -> Result<Option<Job>, IntakeError>;

    async fn push(&self, job: &Job) -> Result<(), IntakeError>;
}

/// FIFO job queue on a Redis list: `LPUSH` in, `RPOP` out.
pub struct RedisJobQueue {
    connection_manager: ConnectionManager,
    queue: String,
    poll: Duration,
}

impl RedisJobQueue {
    pub fn new(connection_manager: ConnectionManager, queue: impl Into<String>, poll: Duration) -> Self {
        Self {
            connection_manager,
            queue: queue.into(),
            poll,
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn next_job(&self) -> Result<Option<Job>, IntakeError> {
        let mut conn = self.connection_manager.clone();
        let payload: Option<String> = ::redis::cmd("RPOP")
            .arg(&self.queue)
            .query_async(&mut conn)
            .await?;

        match payload {
            Some(raw) => Ok(decode_job(&raw)),
            None => {
                tokio::time::sleep(self.poll).await;
                Ok(None)
            }
        }
    }

    async fn push(&self, job: &Job) -> Result<(), IntakeError> {
        let mut conn = self.connection_manager.clone();
        ::redis::cmd("LPUSH")
            .arg(&self.queue)
            .arg(serde_json::to_string(job)?)
            .query_async::<()>(&mut conn)
            .await?;
        debug!("Queued job {} on {}", job.id, self.queue);
        Ok(())
    }
}

/// In-process [`JobQueue`], FIFO like the Redis one.
pub struct InMemoryJobQueue {
    jobs: Mutex<VecDeque<Job>>,
    poll: Duration,
}

impl InMemoryJobQueue {
    pub fn new(poll: Duration) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            poll,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn next_job(&self) -> Result<Option<Job>, IntakeError> {
        let next: Option<Job> = self.jobs.lock().await.pop_front();
        if next.is_none() {
            tokio::time::sleep(self.poll).await;
        }
        Ok(next)
    }

    async fn push(&self, job: &Job) -> Result<(), IntakeError> {
        self.jobs.lock().await.push_back(job.clone());
        Ok(())
    }
}

fn decode_job(raw: &str) -> Option<Job> {
    match serde_json::from_str::<Job>(raw) {
        Ok(job) => Some(job),
        Err(e) => {
            warn!("Skipping malformed job message: {e}");
            None
        }
    }
}

fn decode_cancel(raw: &str) -> Option<CancelRequest> {
    match serde_json::from_str::<CancelRequest>(raw) {
        Ok(request) => Some(request),
        Err(e) => {
            warn!("Skipping malformed cancel message: {e}");
            None
        }
    }
}

/// Cancellation broadcast over a Pub/Sub channel.
pub struct CancelBroadcast {
    client: ::redis::Client,
    channel: String,
}

impl CancelBroadcast {
    pub fn new(url: &str, channel: impl Into<String>) -> Result<Self, IntakeError> {
        Ok(Self {
            client: ::redis::Client::open(url)?,
            channel: channel.into(),
        })
    }

    /// Returns how many workers were subscribed when the request went out.
    pub async fn publish(&self, request: &CancelRequest) -> Result<usize, IntakeError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let receivers: usize = ::redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(serde_json::to_string(request)?)
            .query_async(&mut conn)
            .await?;
        info!(
            "Published cancellation of {} jobs to {receivers} workers",
            request.job_ids.len()
        );
        Ok(receivers)
    }

    /// Every request broadcast from now on. Malformed messages are skipped.
    pub async fn subscribe(&self) -> Result<BoxStream<'static, CancelRequest>, IntakeError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        debug!("Subscribed to {}", self.channel);

        let requests = pubsub
            .into_on_message()
            .filter_map(|message| async move {
                match message.get_payload::<String>() {
                    Ok(raw) => decode_cancel(&raw),
                    Err(e) => {
                        warn!("Skipping unreadable cancel message: {e}");
                        None
                    }
                }
            })
            .boxed();
        Ok(requests)
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
