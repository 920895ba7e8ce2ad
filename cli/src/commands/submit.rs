use std::time::Duration;

use anyhow::Context;
use scanfleet_common::job::Job;
use scanfleet_core::intake::{JobQueue, RedisJobQueue};
use scanfleet_core::store::RedisStore;
use uuid::Uuid;

use crate::commands::SubmitArgs;
use crate::terminal::print;

pub async fn submit(redis_url: &str, args: SubmitArgs) -> anyhow::Result<()> {
    let job = Job {
        id: args.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        ip: args.ip,
        hostnames: args.hostnames,
        project: args.project,
        user: args.user,
        discovery_opts: args.discovery_opts,
        enrichment_opts: args.enrichment_opts,
        timeout_secs: args.timeout,
        include_enrichment: args.enrich,
        mode: args.mode,
    };

    // Only the connection is used; the tool namespace does not matter here.
    let store = RedisStore::connect(redis_url, "nmap")
        .await
        .context("connecting to the coordination store")?;
    let queue = RedisJobQueue::new(store.connection(), &args.queues.scan_queue, Duration::ZERO);
    queue.push(&job).await?;

    print::aligned_line("Job", &job.id);
    print::aligned_line("Target", job.ip);
    print::aligned_line("Queue", &args.queues.scan_queue);
    Ok(())
}
