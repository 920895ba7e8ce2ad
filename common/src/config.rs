use std::time::Duration;

use crate::job::Job;

/// How a job whose discovery found no open ports is reported to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyResultPolicy {
    /// Upload the annotated, portless report through the normal import path.
    #[default]
    AnnotatedReport,
    /// Ask the ledger to create an explicit empty finding for the target.
    ExplicitRecord,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity of this worker in the fleet. Scopes the process registry.
    pub hostname: String,
    /// Name of the scan tool, used to namespace registry and metadata keys.
    pub tool: String,
    pub redis_url: String,
    /// List the scheduler pushes scan jobs onto.
    pub scan_queue: String,
    /// Pub/Sub channel carrying cancellation broadcasts.
    pub cancel_channel: String,
    pub backend_url: String,
    pub backend_token: String,
    /// Program (and leading arguments) used to launch the scan tool, e.g. `sudo -n nmap`.
    pub scan_command: String,
    /// Discovery options used when a job carries none.
    pub discovery_opts: String,
    /// Enrichment options used when a job carries none.
    pub enrichment_opts: String,
    /// Added on top of twice the job timeout when taking a target lock.
    pub lock_ttl_margin: Duration,
    /// Time a scan process gets to exit after SIGTERM before it is killed.
    pub terminate_grace: Duration,
    /// Number of jobs run concurrently.
    pub worker_slots: usize,
    /// Pause between polls of an empty job queue.
    pub queue_poll: Duration,
    pub presence_ttl: Duration,
    /// Echo service returning this worker's external address as plain text.
    pub address_lookup_url: String,
    pub empty_result_policy: EmptyResultPolicy,
}

impl WorkerConfig {
    /// TTL for the target lock guarding `job`: long enough for both phases
    /// to run to their timeout, short enough to recover from a dead worker.
    pub fn lock_ttl(&self, job: &Job) -> Duration {
        job.timeout() * 2 + self.lock_ttl_margin
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            tool: "nmap".to_string(),
            redis_url: "redis://127.0.0.1:6379/3".to_string(),
            scan_queue: "nmap_scan_queue".to_string(),
            cancel_channel: "nmap_cancel".to_string(),
            backend_url: "http://localhost:8000".to_string(),
            backend_token: String::new(),
            scan_command: "nmap".to_string(),
            discovery_opts: "-p- --open".to_string(),
            enrichment_opts: "-sV -Pn -T4".to_string(),
            lock_ttl_margin: Duration::from_secs(300),
            terminate_grace: Duration::from_secs(2),
            worker_slots: 1,
            queue_poll: Duration::from_secs(1),
            presence_ttl: Duration::from_secs(300),
            address_lookup_url: "https://api.ipify.org".to_string(),
            empty_result_policy: EmptyResultPolicy::AnnotatedReport,
        }
    }
}
