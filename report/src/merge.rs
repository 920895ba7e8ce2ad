//! Merge/annotate: the report that actually gets uploaded.
//!
//! The discovery report is the base. Operator-supplied hostnames replace the
//! hostname list of the scanned host, and when an enrichment report exists
//! every base port it also covers takes the enrichment's `service` and
//! `script` elements. Ports are matched on (host address, port id, protocol).
//!
//! Pure over strings: parse both documents, mutate the base tree, serialize.
//! The same inputs always produce the same bytes.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use quick_xml::escape::escape;
use tracing::{debug, warn};

use crate::error::ReportError;
use crate::tree::{Document, Element};

/// Origin tag on injected hostnames, telling the ledger they were supplied rather than resolved.
pub const USER_HOSTNAME_TYPE: &str = "user";

type PortKey = (String, String, String);

/// Annotates `base_xml` with `hostnames` and splices in service data from `enrichment_xml`.
pub fn merge_and_annotate(
    base_xml: &str,
    enrichment_xml: Option<&str>,
    target_ip: &str,
    hostnames: &[String],
) -> Result<String, ReportError> {
    let mut base: Document = Document::parse(base_xml)?;

    if !annotate_hostnames(&mut base.root, target_ip, hostnames) && !hostnames.is_empty() {
        warn!("No host element for {target_ip} in base report, hostnames not annotated");
    }

    if let Some(xml) = enrichment_xml {
        let enrichment: Document = Document::parse(xml)?;
        let lookup = service_lookup(&enrichment.root);
        let spliced: usize = splice_services(&mut base.root, &lookup);
        debug!("Spliced service data into {spliced} ports for {target_ip}");
    }

    base.to_xml()
}

/// File-based [`merge_and_annotate`].
///
/// A missing base report is an error. A missing enrichment report is treated
/// as no enrichment at all.
pub fn merge_files(
    base_path: &Path,
    enrichment_path: Option<&Path>,
    target_ip: &str,
    hostnames: &[String],
) -> Result<String, ReportError> {
    if !base_path.exists() {
        return Err(ReportError::MissingReport(base_path.to_path_buf()));
    }
    let base: String = fs::read_to_string(base_path)?;

    let enrichment: Option<String> = match enrichment_path {
        Some(path) if path.exists() => Some(fs::read_to_string(path)?),
        Some(path) => {
            debug!("Enrichment report {} not found, merging base only", path.display());
            None
        }
        None => None,
    };

    merge_and_annotate(&base, enrichment.as_deref(), target_ip, hostnames)
}

fn is_service_detail(element: &Element) -> bool {
    element.name == "service" || element.name == "script"
}

/// First non-MAC address of a host element, in wire form.
fn primary_address(host: &Element) -> Option<&str> {
    host.elements_named("address")
        .find(|address| address.attribute("addrtype") != Some("mac"))
        .and_then(|address| address.attribute("addr"))
}

fn annotate_hostnames(root: &mut Element, target_ip: &str, hostnames: &[String]) -> bool {
    let target: String = escape(target_ip).into_owned();

    let Some(host) = root.elements_named_mut("host").find(|host| {
        host.elements_named("address")
            .any(|address| address.attribute("addr") == Some(target.as_str()))
    }) else {
        return false;
    };

    let mut list = Element::new("hostnames");
    for name in hostnames {
        list.push_element(
            Element::new("hostname")
                .with_attribute("name", name)
                .with_attribute("type", USER_HOSTNAME_TYPE),
        );
    }

    match host.find_mut("hostnames") {
        Some(existing) => existing.children = list.children,
        None => host.insert_after_last("address", list),
    }
    true
}

fn service_lookup(root: &Element) -> HashMap<PortKey, Vec<Element>> {
    let mut lookup: HashMap<PortKey, Vec<Element>> = HashMap::new();

    for host in root.elements_named("host") {
        let Some(address) = primary_address(host) else {
            continue;
        };
        let Some(ports) = host.find("ports") else {
            continue;
        };
        for port in ports.elements_named("port") {
            let (Some(port_id), Some(protocol)) = (port.attribute("portid"), port.attribute("protocol"))
            else {
                continue;
            };
            let details: Vec<Element> = port
                .child_elements()
                .filter(|child| is_service_detail(child))
                .cloned()
                .collect();
            lookup.insert(
                (address.to_string(), port_id.to_string(), protocol.to_string()),
                details,
            );
        }
    }

    lookup
}

fn splice_services(root: &mut Element, lookup: &HashMap<PortKey, Vec<Element>>) -> usize {
    let mut spliced: usize = 0;

    for host in root.elements_named_mut("host") {
        let Some(address) = primary_address(host).map(str::to_string) else {
            continue;
        };
        let Some(ports) = host.find_mut("ports") else {
            continue;
        };
        for port in ports.elements_named_mut("port") {
            let key: PortKey = match (port.attribute("portid"), port.attribute("protocol")) {
                (Some(port_id), Some(protocol)) => {
                    (address.clone(), port_id.to_string(), protocol.to_string())
                }
                _ => continue,
            };
            let Some(details) = lookup.get(&key) else {
                continue;
            };

            port.retain_elements(|child| !is_service_detail(child));
            for detail in details {
                port.push_element(detail.clone());
            }
            spliced += 1;
        }
    }

    spliced
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
