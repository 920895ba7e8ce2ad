#![cfg(test)]

use scanfleet_common::job::ImportMode;
use scanfleet_core::pipeline::PipelineOutcome;

use crate::support::{
    config, job, FakeScanner, Harness, DISCOVERY, ENRICHMENT, HOSTNAME, HOST_DOWN, NO_PORTS,
    TARGET,
};

#[tokio::test]
async fn enriched_scan_uploads_merged_and_discovery_reports() {
    let scanner = FakeScanner::new(DISCOVERY, Some(ENRICHMENT));
    let harness = Harness::new(config("worker-a", &scanner));
    let job = job(true, ImportMode::Insert);

    let outcome = harness.pipeline.run(&job).await;
    assert_eq!(outcome, PipelineOutcome::Completed { uploads: 2 });

    let uploads = harness.ledger.uploads();
    assert_eq!(uploads.len(), 2);
    assert!(uploads.iter().all(|upload| upload.project == job.project));

    let merged = uploads.iter().find(|upload| upload.mode == ImportMode::Insert).unwrap();
    assert!(merged.report.contains(HOSTNAME));
    assert!(merged.report.contains("OpenSSH"));
    assert!(merged.report.contains("http-title"));

    let discovery_only = uploads.iter().find(|upload| upload.mode == ImportMode::Append).unwrap();
    assert!(discovery_only.report.contains(HOSTNAME));
    assert!(discovery_only.report.contains(r#"method="table""#));
    assert!(!discovery_only.report.contains("OpenSSH"));

    let invocations = scanner.invocations();
    assert_eq!(invocations.len(), 2);
    assert!(invocations[0].contains("-p- --open"));
    assert!(invocations[0].ends_with(TARGET));
    assert!(invocations[1].contains("-p 22,443"));
    assert!(invocations[1].contains("-sV"));

    assert!(harness.store.keys().await.is_empty());
}

#[tokio::test]
async fn scan_without_open_ports_skips_enrichment() {
    let scanner = FakeScanner::new(NO_PORTS, Some(ENRICHMENT));
    let harness = Harness::new(config("worker-a", &scanner));
    let job = job(true, ImportMode::Replace);

    let outcome = harness.pipeline.run(&job).await;
    assert_eq!(outcome, PipelineOutcome::Completed { uploads: 1 });

    let uploads = harness.ledger.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].mode, ImportMode::Replace);
    assert!(uploads[0].report.contains(HOSTNAME));
    assert!(!uploads[0].report.contains("<port "));
    assert!(harness.ledger.empties().is_empty());

    assert_eq!(scanner.invocations().len(), 1);
    assert!(harness.store.keys().await.is_empty());
}

#[tokio::test]
async fn unanswered_target_uploads_nothing() {
    let scanner = FakeScanner::new(HOST_DOWN, Some(ENRICHMENT));
    let harness = Harness::new(config("worker-a", &scanner));
    let job = job(true, ImportMode::Replace);

    let outcome = harness.pipeline.run(&job).await;
    assert_eq!(outcome, PipelineOutcome::NoReport);

    assert!(harness.ledger.uploads().is_empty());
    assert!(harness.ledger.empties().is_empty());
    assert_eq!(scanner.invocations().len(), 1);
    assert!(harness.store.keys().await.is_empty());
}

#[tokio::test]
async fn discovery_only_job_uploads_once() {
    let scanner = FakeScanner::new(DISCOVERY, Some(ENRICHMENT));
    let harness = Harness::new(config("worker-a", &scanner));
    let job = job(false, ImportMode::Update);

    let outcome = harness.pipeline.run(&job).await;
    assert_eq!(outcome, PipelineOutcome::Completed { uploads: 1 });

    let uploads = harness.ledger.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].mode, ImportMode::Update);
    assert!(uploads[0].report.contains(HOSTNAME));
    assert!(!uploads[0].report.contains("OpenSSH"));
    assert_eq!(scanner.invocations().len(), 1);
}

#[tokio::test]
async fn failed_enrichment_keeps_discovery_findings() {
    // no enrichment fixture: the second phase writes an empty report
    let scanner = FakeScanner::new(DISCOVERY, None);
    let harness = Harness::new(config("worker-a", &scanner));
    let job = job(true, ImportMode::Insert);

    let outcome = harness.pipeline.run(&job).await;
    assert_eq!(outcome, PipelineOutcome::Completed { uploads: 1 });

    let uploads = harness.ledger.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].mode, ImportMode::Append);
    assert!(uploads[0].report.contains(HOSTNAME));
    assert_eq!(scanner.invocations().len(), 2);
    assert!(harness.store.keys().await.is_empty());
}

#[tokio::test]
async fn unreadable_discovery_report_uploads_nothing() {
    let scanner = FakeScanner::new("<nmaprun><host><address addr=\"10.0.0.5\"", Some(ENRICHMENT));
    let harness = Harness::new(config("worker-a", &scanner));
    let job = job(true, ImportMode::Insert);

    let outcome = harness.pipeline.run(&job).await;
    assert_eq!(outcome, PipelineOutcome::NoReport);

    assert!(harness.ledger.uploads().is_empty());
    assert_eq!(scanner.invocations().len(), 1);
    assert!(harness.store.keys().await.is_empty());
}

#[tokio::test]
async fn timed_out_discovery_uploads_nothing() {
    let scanner = FakeScanner::hanging();
    let harness = Harness::new(config("worker-a", &scanner));
    let mut job = job(true, ImportMode::Insert);
    job.timeout_secs = 1;

    let started = std::time::Instant::now();
    let outcome = harness.pipeline.run(&job).await;

    assert_eq!(outcome, PipelineOutcome::NoReport);
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert!(harness.ledger.uploads().is_empty());
    assert!(harness.store.keys().await.is_empty());
}
