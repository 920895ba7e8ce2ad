//! End-to-end tests: real pipelines and workers driving a fake scan tool,
//! with the in-memory coordination store and a ledger that records uploads.

#[cfg(test)]
mod support;

#[cfg(test)]
mod pipeline {
    mod integration;
}

#[cfg(test)]
mod fleet {
    mod integration;
}
