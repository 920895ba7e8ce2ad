//! Upload client for the scan ledger, the backend that stores findings.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use scanfleet_common::job::ImportMode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const REPORT_FILE_NAME: &str = "nmap_report.xml";
const REPORT_MIME: &str = "text/xml";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ledger answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Where finished reports go.
#[async_trait]
pub trait ScanLedger: Send + Sync {
    /// Imports a serialized report into `project` under `mode`.
    async fn upload(&self, project: &Uuid, report: &str, mode: ImportMode) -> Result<(), LedgerError>;

    /// Records an explicit "nothing open" finding for `ip`.
    async fn create_empty(&self, project: &Uuid, ip: &IpAddr, mode: ImportMode) -> Result<(), LedgerError>;
}

#[derive(Debug, Serialize)]
struct EmptyFinding {
    ip: String,
    ports: Vec<u16>,
}

/// [`ScanLedger`] over the ledger's HTTP API.
pub struct HttpScanLedger {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpScanLedger {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<(), LedgerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: String = response.text().await.unwrap_or_default();
        Err(LedgerError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ScanLedger for HttpScanLedger {
    async fn upload(&self, project: &Uuid, report: &str, mode: ImportMode) -> Result<(), LedgerError> {
        let url = format!("{}/projects/{project}/ips/import", self.base_url);
        let part: Part = Part::text(report.to_string())
            .file_name(REPORT_FILE_NAME)
            .mime_str(REPORT_MIME)?;

        debug!("Uploading {} bytes to {url} (mode {mode})", report.len());
        let response = self
            .client
            .post(&url)
            .query(&[("mode", mode.as_str())])
            .bearer_auth(&self.token)
            .multipart(Form::new().part("file", part))
            .send()
            .await?;

        Self::check(response).await?;
        info!("Uploaded report to project {project} (mode {mode})");
        Ok(())
    }

    async fn create_empty(&self, project: &Uuid, ip: &IpAddr, mode: ImportMode) -> Result<(), LedgerError> {
        let url = format!("{}/projects/{project}/ips", self.base_url);
        let body = [EmptyFinding {
            ip: ip.to_string(),
            ports: Vec::new(),
        }];

        let response = self
            .client
            .post(&url)
            .query(&[("mode", mode.as_str())])
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        Self::check(response).await?;
        info!("Recorded empty finding for {ip} in project {project} (mode {mode})");
        Ok(())
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
