use std::sync::Arc;

use anyhow::Context;
use scanfleet_common::config::WorkerConfig;
use scanfleet_core::cancel::{CancellationHandler, NixSignaller};
use scanfleet_core::intake::{CancelBroadcast, RedisJobQueue};
use scanfleet_core::ledger::HttpScanLedger;
use scanfleet_core::pipeline::Pipeline;
use scanfleet_core::presence;
use scanfleet_core::store::{CoordinationStore, RedisStore};
use scanfleet_core::worker::{RESUBSCRIBE_DELAY, Worker, serve_cancellations};
use scanfleet_report::NmapXmlParser;
use tracing::info;

use crate::commands::WorkArgs;
use crate::terminal::print;

pub async fn work(redis_url: &str, args: WorkArgs) -> anyhow::Result<()> {
    let hostname: String = nix::unistd::gethostname()
        .context("reading system hostname")?
        .to_string_lossy()
        .into_owned();
    let config: Arc<WorkerConfig> = Arc::new(args.into_config(redis_url, hostname));
    print_config(&config);

    let redis = RedisStore::connect(&config.redis_url, &config.tool)
        .await
        .context("connecting to the coordination store")?;
    let store: Arc<dyn CoordinationStore> = Arc::new(redis.clone());

    let queue = Arc::new(RedisJobQueue::new(
        redis.connection(),
        &config.scan_queue,
        config.queue_poll,
    ));
    let ledger = Arc::new(HttpScanLedger::new(&config.backend_url, &config.backend_token)?);
    let pipeline = Pipeline::new(config.clone(), store.clone(), ledger, Arc::new(NmapXmlParser))?;

    let broadcast = Arc::new(CancelBroadcast::new(&config.redis_url, &config.cancel_channel)?);
    let handler = Arc::new(CancellationHandler::new(
        store.clone(),
        Arc::new(NixSignaller),
        &config.hostname,
    ));

    let cancellations = tokio::spawn(serve_cancellations(
        handler,
        move || {
            let broadcast = broadcast.clone();
            async move { broadcast.subscribe().await }
        },
        RESUBSCRIBE_DELAY,
    ));
    let presence = tokio::spawn(presence::keep_registered(store.clone(), config.clone()));

    let worker = Worker::new(config, store, queue, pipeline);
    worker
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Interrupted, waiting for running jobs to finish");
        })
        .await;

    cancellations.abort();
    presence.abort();
    info!("Worker stopped");
    Ok(())
}

fn print_config(config: &WorkerConfig) {
    print::aligned_line("Worker", &config.hostname);
    print::aligned_line("Scan command", &config.scan_command);
    print::aligned_line("Job queue", &config.scan_queue);
    print::aligned_line("Cancel channel", &config.cancel_channel);
    print::aligned_line("Ledger", &config.backend_url);
    print::aligned_line("Slots", config.worker_slots);
    print::fat_separator();
}
