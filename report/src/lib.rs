//! # Scan Report Codec
//!
//! Reads and rewrites the XML reports produced by the scan tool.
//!
//! * [`tree`] keeps a whole report in memory as a mutable element tree and
//!   writes it back out without disturbing the parts nobody touched.
//! * [`model`] is the read-only view used to make decisions (which ports are
//!   open, which service runs where).
//! * [`merge`] injects operator-supplied hostnames into a report and splices
//!   per-port service data from an enrichment report into it.

pub mod error;
pub mod merge;
pub mod model;
pub mod tree;

pub use error::ReportError;
pub use merge::{merge_and_annotate, merge_files};
pub use model::{NmapXmlParser, ReportHost, ReportParser, ReportPort, ScanReport};
