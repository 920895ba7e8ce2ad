//! Read-only view of a scan report.
//!
//! Deserialized with `quick_xml::de` from the scan tool's XML output. Only the
//! parts the pipeline makes decisions on are modelled; everything else in the
//! report is ignored here and preserved by [`crate::tree`] instead.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ReportError;

const PORT_OPEN: &str = "open";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanReport {
    pub hosts: Vec<ReportHost>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportHost {
    /// First non-MAC address of the host.
    pub address: String,
    pub hostnames: Vec<String>,
    pub ports: Vec<ReportPort>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPort {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub service: Option<String>,
}

impl ReportPort {
    pub fn is_open(&self) -> bool {
        self.state == PORT_OPEN
    }
}

impl ScanReport {
    pub fn from_xml(xml: &str) -> Result<Self, ReportError> {
        let run: RawRun = quick_xml::de::from_str(xml)?;
        Ok(run.into())
    }

    /// The only host of a single-target report.
    ///
    /// `Ok(None)` when the target did not answer (no host element at all).
    pub fn single_host(&self) -> Result<Option<&ReportHost>, ReportError> {
        match self.hosts.as_slice() {
            [] => Ok(None),
            [host] => Ok(Some(host)),
            hosts => Err(ReportError::HostCount(hosts.len())),
        }
    }

    /// Open ports of the single host, in report order.
    pub fn open_ports(&self) -> Result<Vec<u16>, ReportError> {
        let ports: Vec<u16> = self
            .single_host()?
            .map(|host| {
                host.ports
                    .iter()
                    .filter(|port| port.is_open())
                    .map(|port| port.port)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ports)
    }

    /// Port -> service name of the single host. Ports without a named service are left out.
    pub fn service_map(&self) -> Result<BTreeMap<u16, String>, ReportError> {
        let services: BTreeMap<u16, String> = self
            .single_host()?
            .map(|host| {
                host.ports
                    .iter()
                    .filter_map(|port| Some((port.port, port.service.clone()?)))
                    .collect()
            })
            .unwrap_or_default();
        Ok(services)
    }
}

/// Turns a report file into a [`ScanReport`].
pub trait ReportParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ScanReport, ReportError>;
}

/// Parser for the scan tool's `-oX` XML output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NmapXmlParser;

impl ReportParser for NmapXmlParser {
    fn parse(&self, path: &Path) -> Result<ScanReport, ReportError> {
        if !path.exists() {
            return Err(ReportError::MissingReport(path.to_path_buf()));
        }
        let xml: String = std::fs::read_to_string(path)?;
        ScanReport::from_xml(&xml)
    }
}

// Wire structs. Attributes carry the `@` prefix quick-xml's deserializer expects.

#[derive(Debug, Deserialize)]
struct RawRun {
    #[serde(rename = "host", default)]
    hosts: Vec<RawHost>,
}

#[derive(Debug, Deserialize)]
struct RawHost {
    #[serde(rename = "address", default)]
    addresses: Vec<RawAddress>,
    #[serde(default)]
    hostnames: Option<RawHostnames>,
    #[serde(default)]
    ports: Option<RawPorts>,
}

#[derive(Debug, Deserialize)]
struct RawAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype", default)]
    addr_type: String,
}

#[derive(Debug, Deserialize)]
struct RawHostnames {
    #[serde(rename = "hostname", default)]
    names: Vec<RawHostname>,
}

#[derive(Debug, Deserialize)]
struct RawHostname {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawPorts {
    #[serde(rename = "port", default)]
    ports: Vec<RawPort>,
}

#[derive(Debug, Deserialize)]
struct RawPort {
    #[serde(rename = "@protocol")]
    protocol: String,
    #[serde(rename = "@portid")]
    port_id: u16,
    #[serde(default)]
    state: Option<RawState>,
    #[serde(default)]
    service: Option<RawService>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct RawService {
    #[serde(rename = "@name", default)]
    name: Option<String>,
}

impl From<RawRun> for ScanReport {
    fn from(run: RawRun) -> Self {
        Self {
            hosts: run.hosts.into_iter().map(ReportHost::from).collect(),
        }
    }
}

impl From<RawHost> for ReportHost {
    fn from(raw: RawHost) -> Self {
        let address: String = raw
            .addresses
            .into_iter()
            .find(|address| address.addr_type != "mac")
            .map(|address| address.addr)
            .unwrap_or_default();

        let hostnames: Vec<String> = raw
            .hostnames
            .map(|h| h.names.into_iter().map(|n| n.name).collect())
            .unwrap_or_default();

        let ports: Vec<ReportPort> = raw
            .ports
            .map(|p| {
                p.ports
                    .into_iter()
                    .map(|port| ReportPort {
                        port: port.port_id,
                        protocol: port.protocol,
                        state: port.state.map(|s| s.state).unwrap_or_default(),
                        service: port.service.and_then(|s| s.name),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            address,
            hostnames,
            ports,
        }
    }
}
