//! Records workers publish to the coordination store.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// One in-flight job, as listed in a project's running-target directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTarget {
    pub ip: IpAddr,
    pub hostnames: Vec<String>,
    /// Identity (hostname) of the worker running the job.
    pub worker: String,
    /// Unix timestamp, seconds.
    pub started_at: i64,
}

impl RunningTarget {
    pub fn new(ip: IpAddr, hostnames: Vec<String>, worker: impl Into<String>) -> Self {
        Self {
            ip,
            hostnames,
            worker: worker.into(),
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn matches(&self, ip: &IpAddr, worker: &str) -> bool {
        self.ip == *ip && self.worker == worker
    }
}

/// Maps a job to the OS process currently serving it on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub job_id: String,
    pub pid: u32,
    pub host: String,
}

impl ProcessRecord {
    pub fn new(job_id: impl Into<String>, pid: u32, host: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            pid,
            host: host.into(),
        }
    }
}

/// Value stored under a target lock, naming who holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLockHolder {
    pub worker: String,
    pub job_id: String,
    /// Port-set descriptor of the holding job's discovery scan.
    pub ports: String,
}

/// Presence record a worker keeps alive under `worker_ip:{host}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAddress {
    pub ip: String,
    pub last_updated: i64,
}
