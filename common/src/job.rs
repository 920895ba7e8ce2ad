//! # Scan Job Model
//!
//! Defines the message a worker receives from the job queue and the
//! broadcast it receives when jobs are cancelled.
//!
//! Field names on the wire follow the scheduler's historical task schema
//! (`open_ports_opts`, `service_opts`, `timeout`, `include_services`), so the
//! Rust names are mapped with serde renames.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Port-set descriptor used when the discovery options carry no `-p` flag.
pub const DEFAULT_PORT_SET: &str = "default";

/// How the scan ledger reconciles an uploaded report with what it already stores.
///
/// Opaque to the pipeline: it only chooses which value to hand to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    #[default]
    Insert,
    Replace,
    Update,
    Append,
}

impl ImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::Insert => "insert",
            ImportMode::Replace => "replace",
            ImportMode::Update => "update",
            ImportMode::Append => "append",
        }
    }
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown import mode: {0}")]
pub struct UnknownImportMode(pub String);

impl FromStr for ImportMode {
    type Err = UnknownImportMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(ImportMode::Insert),
            "replace" => Ok(ImportMode::Replace),
            "update" => Ok(ImportMode::Update),
            "append" => Ok(ImportMode::Append),
            _ => Err(UnknownImportMode(s.to_string())),
        }
    }
}

/// One two-phase scan against a single target.
///
/// Immutable once received; owned by the pipeline invocation processing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Task identifier assigned by the scheduler. Cancellation addresses jobs by this id.
    #[serde(alias = "task_id")]
    pub id: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub hostnames: Vec<String>,
    pub project: Uuid,
    #[serde(default)]
    pub user: String,
    #[serde(rename = "open_ports_opts")]
    pub discovery_opts: String,
    #[serde(rename = "service_opts")]
    pub enrichment_opts: String,
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(rename = "include_services", default)]
    pub include_enrichment: bool,
    #[serde(default)]
    pub mode: ImportMode,
}

impl Job {
    /// Upper bound for each scan phase of this job.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The port set the discovery phase covers, taken from its `-p` option.
    ///
    /// Accepts both `-p 1-1024` and `-p1-1024`. `-p-` yields `"-"` (all ports).
    pub fn port_set(&self) -> String {
        let mut args = self.discovery_opts.split_whitespace();
        while let Some(arg) = args.next() {
            if arg == "-p" {
                return args.next().unwrap_or(DEFAULT_PORT_SET).to_string();
            }
            if let Some(ports) = arg.strip_prefix("-p") {
                // -Pn and friends are a different flag family
                if !ports.is_empty() && !ports.starts_with(char::is_alphabetic) {
                    return ports.to_string();
                }
            }
        }
        DEFAULT_PORT_SET.to_string()
    }
}

/// Fleet-wide cancellation broadcast. Every worker receives every request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(alias = "task_ids")]
    pub job_ids: Vec<String>,
}

impl CancelRequest {
    pub fn new(job_ids: Vec<String>) -> Self {
        Self { job_ids }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_opts(opts: &str) -> Job {
        Job {
            id: "job-1".into(),
            ip: "10.0.0.5".parse().unwrap(),
            hostnames: vec![],
            project: Uuid::nil(),
            user: "alice".into(),
            discovery_opts: opts.into(),
            enrichment_opts: "-sV".into(),
            timeout_secs: 60,
            include_enrichment: false,
            mode: ImportMode::Insert,
        }
    }

    #[test]
    fn deserializes_scheduler_message() {
        let raw = r#"{
            "id": "4f1c",
            "ip": "10.0.0.5",
            "hostnames": ["db1.internal"],
            "project": "6f9619ff-8b86-d011-b42d-00cf4fc964ff",
            "user": "u-17",
            "open_ports_opts": "-p- --open",
            "service_opts": "-sV -Pn -T4",
            "timeout": 600,
            "include_services": true,
            "mode": "replace"
        }"#;

        let job: Job = serde_json::from_str(raw).unwrap();
        assert_eq!(job.id, "4f1c");
        assert_eq!(job.hostnames, vec!["db1.internal".to_string()]);
        assert_eq!(job.discovery_opts, "-p- --open");
        assert_eq!(job.timeout(), Duration::from_secs(600));
        assert!(job.include_enrichment);
        assert_eq!(job.mode, ImportMode::Replace);
    }

    #[test]
    fn optional_fields_default() {
        let raw = r#"{
            "task_id": "abc",
            "ip": "192.168.1.1",
            "project": "6f9619ff-8b86-d011-b42d-00cf4fc964ff",
            "open_ports_opts": "--open",
            "service_opts": "-sV",
            "timeout": 10
        }"#;

        let job: Job = serde_json::from_str(raw).unwrap();
        assert_eq!(job.id, "abc");
        assert!(job.hostnames.is_empty());
        assert!(!job.include_enrichment);
        assert_eq!(job.mode, ImportMode::Insert);
    }

    #[test]
    fn port_set_from_discovery_options() {
        assert_eq!(job_with_opts("-p- --open").port_set(), "-");
        assert_eq!(job_with_opts("--open -p 1-1024").port_set(), "1-1024");
        assert_eq!(job_with_opts("-p22,80 --open").port_set(), "22,80");
        assert_eq!(job_with_opts("-Pn --open").port_set(), DEFAULT_PORT_SET);
        assert_eq!(job_with_opts("").port_set(), DEFAULT_PORT_SET);
    }

    #[test]
    fn import_mode_wire_names() {
        assert_eq!(serde_json::to_string(&ImportMode::Append).unwrap(), "\"append\"");
        assert_eq!("UPDATE".parse::<ImportMode>(), Ok(ImportMode::Update));
        assert!("merge".parse::<ImportMode>().is_err());
        assert_eq!(ImportMode::Replace.to_string(), "replace");
    }

    #[test]
    fn cancel_request_accepts_task_ids_alias() {
        let req: CancelRequest = serde_json::from_str(r#"{"task_ids": ["a", "b"]}"#).unwrap();
        assert_eq!(req.job_ids, vec!["a".to_string(), "b".to_string()]);
    }
}
