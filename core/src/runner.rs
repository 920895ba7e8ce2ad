//! Scan tool invocations and their report files.
//!
//! A [`ScanRunner`] drives one scan phase: it builds the command line, owns
//! the temporary file the tool writes its XML report to, supervises the
//! process through a [`ProcessHandle`] and turns the report into something the
//! pipeline can act on.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use scanfleet_report::{ReportError, ReportParser, ScanReport, merge_files};
use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, warn};

use crate::process::{ProcessHandle, ProcessOutput};

/// Flag telling the scan tool where to write its XML report.
const XML_OUTPUT_FLAG: &str = "-oX";
const PORT_FLAG: &str = "-p";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("scan command is empty")]
    EmptyCommand,

    #[error("failed to create report file: {0}")]
    TempFile(#[source] io::Error),

    #[error("failed to start scan: {0}")]
    Spawn(#[source] io::Error),

    #[error("no scan has been started")]
    NotStarted,

    #[error("no report to merge")]
    NoReport,

    #[error(transparent)]
    Report(#[from] ReportError),
}

/// The program launching the scan tool, plus any leading arguments
/// (`sudo -n nmap` is a program and two arguments).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTool {
    program: String,
    args: Vec<String>,
}

impl ScanTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl FromStr for ScanTool {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace().map(str::to_string);
        let program: String = parts.next().ok_or(RunnerError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl fmt::Display for ScanTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

pub struct ScanRunner {
    tool: ScanTool,
    parser: Arc<dyn ReportParser>,
    grace: Duration,
    output: Option<TempPath>,
    process: Option<ProcessHandle>,
}

impl ScanRunner {
    pub fn new(tool: ScanTool, parser: Arc<dyn ReportParser>, grace: Duration) -> Self {
        Self {
            tool,
            parser,
            grace,
            output: None,
            process: None,
        }
    }

    /// `tool + options + -oX <fresh temp file> + target`.
    ///
    /// Every call allocates a new report file; the previous one is removed.
    pub fn build_command(&mut self, target: &str, options: &str) -> Result<Vec<String>, RunnerError> {
        let path: TempPath = tempfile::Builder::new()
            .prefix("scanfleet-")
            .suffix(".xml")
            .tempfile()
            .map_err(RunnerError::TempFile)?
            .into_temp_path();

        let mut argv: Vec<String> = Vec::with_capacity(self.tool.args.len() + 8);
        argv.push(self.tool.program.clone());
        argv.extend(self.tool.args.iter().cloned());
        argv.extend(options.split_whitespace().map(str::to_string));
        argv.push(XML_OUTPUT_FLAG.to_string());
        argv.push(path.to_string_lossy().into_owned());
        argv.push(target.to_string());

        self.output = Some(path);
        Ok(argv)
    }

    pub fn run_discovery_background(&mut self, target: &str, options: &str) -> Result<(), RunnerError> {
        let argv: Vec<String> = self.build_command(target, options)?;
        self.spawn(argv)
    }

    /// Scans only `ports`, with `-p 22,443` placed ahead of `base_options`.
    pub fn run_enrichment_background(
        &mut self,
        target: &str,
        ports: &[u16],
        base_options: &str,
    ) -> Result<(), RunnerError> {
        let options: String = enrichment_options(ports, base_options);
        let argv: Vec<String> = self.build_command(target, &options)?;
        self.spawn(argv)
    }

    fn spawn(&mut self, argv: Vec<String>) -> Result<(), RunnerError> {
        let handle = ProcessHandle::run_background(argv, self.grace).map_err(RunnerError::Spawn)?;
        debug!("Scan started with pid {:?}", handle.pid());
        self.process = Some(handle);
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(ProcessHandle::is_running)
    }

    pub async fn wait(&mut self, timeout: Duration) -> Result<ProcessOutput, RunnerError> {
        let process = self.process.as_mut().ok_or(RunnerError::NotStarted)?;
        Ok(process.wait(timeout).await)
    }

    pub async fn terminate(&mut self) -> Option<ProcessOutput> {
        match self.process.as_mut() {
            Some(process) => Some(process.terminate().await),
            None => None,
        }
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Raw report text, if the tool wrote one.
    pub fn read_output(&self) -> Option<String> {
        let path = self.output_path()?;
        match std::fs::read_to_string(path) {
            Ok(text) if !text.is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to read scan report {}: {e}", path.display());
                None
            }
        }
    }

    /// Parsed report. Missing and malformed reports are logged and yield `None`.
    pub fn parse_output(&self) -> Option<ScanReport> {
        let path = self.output_path()?;
        match self.parser.parse(path) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Failed to parse scan report {}: {e}", path.display());
                None
            }
        }
    }

    pub fn open_ports(report: &ScanReport) -> Result<Vec<u16>, RunnerError> {
        Ok(report.open_ports()?)
    }

    pub fn service_map(report: &ScanReport) -> Result<BTreeMap<u16, String>, RunnerError> {
        Ok(report.service_map()?)
    }

    /// This runner's report annotated with `hostnames`, with service data
    /// from `enrichment` spliced in when given.
    pub fn merge_and_annotate(
        &self,
        enrichment: Option<&ScanRunner>,
        target_ip: &str,
        hostnames: &[String],
    ) -> Result<String, RunnerError> {
        let base: &Path = self.output_path().ok_or(RunnerError::NoReport)?;
        let enrichment_path: Option<&Path> = enrichment.and_then(ScanRunner::output_path);

        match merge_files(base, enrichment_path, target_ip, hostnames) {
            Ok(xml) => Ok(xml),
            Err(ReportError::MissingReport(_)) => Err(RunnerError::NoReport),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the report file. Also happens on drop.
    pub fn cleanup(&mut self) {
        if let Some(path) = self.output.take() {
            let shown: String = path.to_string_lossy().into_owned();
            if let Err(e) = path.close() {
                warn!("Failed to remove scan report {shown}: {e}");
            }
        }
    }
}

fn enrichment_options(ports: &[u16], base_options: &str) -> String {
    let list: Vec<String> = ports.iter().map(u16::to_string).collect();
    format!("{PORT_FLAG} {} {base_options}", list.join(","))
        .trim_end()
        .to_string()
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
