#![cfg(test)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use scanfleet_common::job::ImportMode;
use scanfleet_core::cancel::{CancellationHandler, NixSignaller};
use scanfleet_core::intake::{InMemoryJobQueue, JobQueue};
use scanfleet_core::pipeline::{Pipeline, PipelineOutcome};
use scanfleet_core::store::{CoordinationStore, InMemoryStore};
use scanfleet_core::worker::Worker;
use scanfleet_report::NmapXmlParser;

use crate::support::{config, job, FakeScanner, Harness, RecordingLedger, DISCOVERY};

#[tokio::test]
async fn cancelled_scan_is_stopped_and_cleaned_up() {
    let scanner = FakeScanner::hanging();
    let harness = Harness::new(config("worker-a", &scanner));
    let job = job(true, ImportMode::Insert);

    let store = harness.store.clone();
    let ledger = harness.ledger.clone();
    let pipeline = harness.pipeline;
    let running = {
        let job = job.clone();
        tokio::spawn(async move { pipeline.run(&job).await })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while store.lookup_process(&job.id, "worker-a").await.unwrap().is_none() {
        assert!(Instant::now() < deadline, "scan never registered its process");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // another worker's handler ignores the request
    let bystander = CancellationHandler::new(store.clone(), Arc::new(NixSignaller), "worker-b");
    assert_eq!(bystander.handle(&[job.id.clone()]).await.not_owned, 1);

    let handler = CancellationHandler::new(store.clone(), Arc::new(NixSignaller), "worker-a");
    let summary = handler.handle(&[job.id.clone()]).await;
    assert_eq!(summary.signalled, 1);

    let outcome = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::NoReport);
    assert!(ledger.uploads().is_empty());
    assert!(store.keys().await.is_empty());
}

#[tokio::test]
async fn duplicate_delivery_is_scanned_once() {
    let scanner = FakeScanner::slow(DISCOVERY, 1);
    let store = Arc::new(InMemoryStore::new("nmap"));
    let ledger = Arc::new(RecordingLedger::default());
    let queue = Arc::new(InMemoryJobQueue::new(Duration::from_millis(20)));

    let job = job(false, ImportMode::Insert);
    queue.push(&job).await.unwrap();
    queue.push(&job).await.unwrap();

    let worker = |name: &str| {
        let config = Arc::new(config(name, &scanner));
        let pipeline = Pipeline::new(
            config.clone(),
            store.clone(),
            ledger.clone(),
            Arc::new(NmapXmlParser),
        )
        .unwrap();
        Worker::new(config, store.clone(), queue.clone(), pipeline)
    };
    let worker_a = worker("worker-a");
    let worker_b = worker("worker-b");

    let drained = || {
        let queue = queue.clone();
        async move {
            while !queue.is_empty().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    tokio::join!(worker_a.run(drained()), worker_b.run(drained()));

    assert_eq!(scanner.invocations().len(), 1);
    assert_eq!(ledger.uploads().len(), 1);
    assert!(store.keys().await.is_empty());
}
