use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no report at {0}")]
    MissingReport(PathBuf),
    #[error("failed to read report: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed report XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed attribute in report: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("report does not match the expected schema: {0}")]
    Schema(#[from] quick_xml::DeError),
    #[error("report has no root element")]
    NoRoot,
    #[error("unbalanced element </{0}> in report")]
    Unbalanced(String),
    #[error("expected a single host in the report, found {0}")]
    HostCount(usize),
}
