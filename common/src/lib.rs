//! Shared vocabulary of the scan fleet.
//!
//! Everything in here is plain data: the job message a worker receives, the
//! records it publishes to the coordination store, the key layout of that
//! store and the worker configuration. No I/O happens in this crate.

pub mod config;
pub mod job;
pub mod keys;
pub mod records;
