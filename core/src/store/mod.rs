//! The coordination store: the only state workers share.
//!
//! Every worker reads and writes the same store. Target locks keep two workers
//! off the same (project, ip); the process registry maps a job to the local pid
//! serving it so cancellation can find it; the running-target directory lists
//! what is in flight per project.
//!
//! Two backends implement [`CoordinationStore`]:
//! - [`RedisStore`] for the fleet
//! - [`InMemoryStore`] for a single process and for tests

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use scanfleet_common::job::Job;
use scanfleet_common::records::{ProcessRecord, RunningTarget, TargetLockHolder, WorkerAddress};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod redis;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("failed to encode store value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything [`CoordinationStore::cleanup_job`] removes for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupScope {
    pub job_id: String,
    pub host: String,
    pub project: Uuid,
    pub user: String,
    pub ip: IpAddr,
    /// Port-set descriptor of the job's discovery scan. Informational.
    pub port_set: String,
}

impl CleanupScope {
    pub fn for_job(job: &Job, host: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            host: host.into(),
            project: job.project,
            user: job.user.clone(),
            ip: job.ip,
            port_set: job.port_set(),
        }
    }
}

/// Shared coordination state. Registry keys are scoped by the tool name the
/// store was built with, so several tools can share one store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set-if-absent with expiry. `true` iff the caller now owns the lock.
    async fn acquire_target_lock(
        &self,
        project: &Uuid,
        ip: &IpAddr,
        holder: &TargetLockHolder,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Unconditional delete; fine to call on an expired or missing lock.
    async fn release_target_lock(&self, project: &Uuid, ip: &IpAddr) -> Result<(), StoreError>;

    async fn target_lock_holder(
        &self,
        project: &Uuid,
        ip: &IpAddr,
    ) -> Result<Option<TargetLockHolder>, StoreError>;

    async fn track_process(&self, record: &ProcessRecord) -> Result<(), StoreError>;

    async fn untrack_process(&self, job_id: &str, host: &str) -> Result<(), StoreError>;

    async fn lookup_process(&self, job_id: &str, host: &str) -> Result<Option<u32>, StoreError>;

    /// All registry entries of `host`. Entries with an unreadable pid are skipped.
    async fn list_processes(&self, host: &str) -> Result<Vec<ProcessRecord>, StoreError>;

    async fn add_running_target(
        &self,
        project: &Uuid,
        entry: &RunningTarget,
    ) -> Result<(), StoreError>;

    /// Removes the first entry matching (ip, worker). `false` when none matched.
    async fn remove_running_target(
        &self,
        project: &Uuid,
        ip: &IpAddr,
        worker: &str,
    ) -> Result<bool, StoreError>;

    async fn running_targets(&self, project: &Uuid) -> Result<Vec<RunningTarget>, StoreError>;

    /// The per-job running-task entry, removed again by [`cleanup_job`](Self::cleanup_job).
    async fn record_running_task(
        &self,
        job_id: &str,
        host: &str,
        entry: &RunningTarget,
    ) -> Result<(), StoreError>;

    /// Deletes everything `scope` names as one atomic batch: the registry
    /// entry, the running-task entry, the job id from the project, user and
    /// (project, ip) task-id sets, the target lock and the job metadata.
    async fn cleanup_job(&self, scope: &CleanupScope) -> Result<(), StoreError>;

    async fn register_worker_address(
        &self,
        host: &str,
        address: &WorkerAddress,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn worker_address(&self, host: &str) -> Result<Option<WorkerAddress>, StoreError>;
}

/// Lowest pid a registry entry may name. `0` addresses the caller's own
/// process group and `1` is init.
pub const MIN_TRACKED_PID: u32 = 2;

/// Parses a registry pid, logging and dropping values that are not one.
pub(crate) fn parse_pid(job_id: &str, raw: &str) -> Option<u32> {
    match raw.trim().parse::<u32>() {
        Ok(pid) if pid >= MIN_TRACKED_PID => Some(pid),
        _ => {
            tracing::warn!("Skipping registry entry for job {job_id}: invalid pid {raw:?}");
            None
        }
    }
}

/// Decodes a running-target entry, logging and dropping malformed ones.
pub(crate) fn parse_running_target(raw: &str) -> Option<RunningTarget> {
    match serde_json::from_str::<RunningTarget>(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!("Skipping malformed running-target entry: {e}");
            None
        }
    }
}

/// TTLs are whole seconds on the wire; never round down to "no expiry".
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
