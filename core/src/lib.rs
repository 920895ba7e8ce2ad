//! # Scan Worker Core
//!
//! Everything a worker node does between pulling a job off the queue and
//! handing the finished report to the scan ledger.
//!
//! * [`process`] supervises one external command.
//! * [`runner`] turns a scan phase into a command line and a report file.
//! * [`store`] is the coordination store shared by the whole fleet: target
//!   locks, the process registry, the running-target directory.
//! * [`pipeline`] runs the two-phase scan for one job and always cleans up.
//! * [`cancel`] reacts to fleet-wide cancellation broadcasts.
//! * [`intake`], [`worker`] and [`presence`] are the worker runtime around them.
//!
//! Collaborators (store, ledger, report parser, process signaller) are traits
//! handed to constructors as `Arc<dyn ...>`; nothing in here reaches for a
//! global client.

pub mod cancel;
pub mod intake;
pub mod ledger;
pub mod pipeline;
pub mod presence;
pub mod process;
pub mod runner;
pub mod store;
pub mod worker;
