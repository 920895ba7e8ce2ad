//! Key layout of the coordination store.
//!
//! Keys are namespaced by project, by (tool, host) and by job id. This is the
//! only layout visible to other services sharing the store, so the formats
//! here are a compatibility surface.

use std::net::IpAddr;

use uuid::Uuid;

/// Hash of job id -> pid for every scan process a host is running with `tool`.
pub fn running_tool(tool: &str, host: &str) -> String {
    format!("running_tool:{tool}:{host}")
}

/// Per-job list holding the job's `RunningTarget` entry on `host`.
pub fn running_tasks(job_id: &str, host: &str) -> String {
    format!("running_tasks:{job_id}:{host}")
}

/// Per-project list of `RunningTarget` entries.
pub fn running_targets(project: &Uuid) -> String {
    format!("running_targets:{project}")
}

pub fn project_task_ids(project: &Uuid) -> String {
    format!("project_task_ids:{project}")
}

pub fn user_task_ids(user: &str) -> String {
    format!("user_task_ids:{user}")
}

pub fn project_ip_task_ids(project: &Uuid, ip: &IpAddr) -> String {
    format!("project_ip_task_ids:{project}:{ip}")
}

/// Mutual-exclusion token for one target within a project.
pub fn target_lock(project: &Uuid, ip: &IpAddr) -> String {
    format!("lock:ip:{project}:{ip}")
}

pub fn task_metadata(tool: &str, job_id: &str) -> String {
    format!("task_metadata:{tool}:{job_id}")
}

pub fn worker_address(host: &str) -> String {
    format!("worker_ip:{host}")
}
