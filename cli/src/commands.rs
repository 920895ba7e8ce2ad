pub mod cancel;
pub mod merge;
pub mod submit;
pub mod work;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use scanfleet_common::config::{EmptyResultPolicy, WorkerConfig};
use scanfleet_common::job::ImportMode;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "scanfleet")]
#[command(about = "Distributed two-phase port scanning worker.")]
pub struct CommandLine {
    /// Log filter, e.g. `info` or `scanfleet_core=debug`
    #[arg(long, global = true, env = "SCANFLEET_LOG", default_value = "info")]
    pub log: String,

    /// Coordination store
    #[arg(
        long,
        global = true,
        env = "SCANFLEET_REDIS_URL",
        default_value = "redis://127.0.0.1:6379/3"
    )]
    pub redis_url: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pull scan jobs off the queue and run them
    #[command(alias = "w")]
    Work(WorkArgs),
    /// Cancel running jobs anywhere in the fleet
    #[command(alias = "c")]
    Cancel(CancelArgs),
    /// Put a scan job on the queue
    #[command(alias = "s")]
    Submit(SubmitArgs),
    /// Annotate a report with hostnames and merge enrichment data into it
    #[command(alias = "m")]
    Merge(MergeArgs),
}

#[derive(Args, Clone)]
pub struct QueueArgs {
    #[arg(long, env = "SCANFLEET_SCAN_QUEUE", default_value = "nmap_scan_queue")]
    pub scan_queue: String,

    #[arg(long, env = "SCANFLEET_CANCEL_CHANNEL", default_value = "nmap_cancel")]
    pub cancel_channel: String,
}

#[derive(Args)]
pub struct WorkArgs {
    #[command(flatten)]
    pub queues: QueueArgs,

    /// Worker identity in the fleet [default: system hostname]
    #[arg(long, env = "SCANFLEET_HOSTNAME")]
    pub hostname: Option<String>,

    /// Tool name namespacing registry keys
    #[arg(long, env = "SCANFLEET_TOOL")]
    pub tool: Option<String>,

    #[arg(long, env = "SCANFLEET_BACKEND_URL")]
    pub backend_url: Option<String>,

    #[arg(long, env = "SCANFLEET_BACKEND_TOKEN", hide_env_values = true)]
    pub backend_token: Option<String>,

    /// Command launching the scan tool, e.g. "sudo -n nmap"
    #[arg(long, env = "SCANFLEET_SCAN_COMMAND")]
    pub scan_command: Option<String>,

    /// Discovery options for jobs that carry none
    #[arg(long, env = "SCANFLEET_DISCOVERY_OPTS", allow_hyphen_values = true)]
    pub discovery_opts: Option<String>,

    /// Enrichment options for jobs that carry none
    #[arg(long, env = "SCANFLEET_ENRICHMENT_OPTS", allow_hyphen_values = true)]
    pub enrichment_opts: Option<String>,

    /// Seconds added to twice the job timeout for the target lock TTL
    #[arg(long, env = "SCANFLEET_LOCK_TTL_MARGIN")]
    pub lock_ttl_margin: Option<u64>,

    /// Seconds a scan gets between SIGTERM and SIGKILL
    #[arg(long, env = "SCANFLEET_TERMINATE_GRACE")]
    pub terminate_grace: Option<u64>,

    /// Jobs run at the same time
    #[arg(long, env = "SCANFLEET_SLOTS")]
    pub slots: Option<usize>,

    /// Milliseconds between polls of an empty queue
    #[arg(long, env = "SCANFLEET_QUEUE_POLL_MS")]
    pub queue_poll_ms: Option<u64>,

    /// Seconds the worker address record lives without a refresh
    #[arg(long, env = "SCANFLEET_PRESENCE_TTL")]
    pub presence_ttl: Option<u64>,

    #[arg(long, env = "SCANFLEET_ADDRESS_LOOKUP_URL")]
    pub address_lookup_url: Option<String>,

    /// How a scan without open ports is reported
    #[arg(long, env = "SCANFLEET_EMPTY_RESULT", value_enum)]
    pub empty_result: Option<EmptyResult>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum EmptyResult {
    /// Upload the annotated report with no ports
    Report,
    /// Ask the ledger for an explicit empty finding
    Record,
}

impl From<EmptyResult> for EmptyResultPolicy {
    fn from(value: EmptyResult) -> Self {
        match value {
            EmptyResult::Report => EmptyResultPolicy::AnnotatedReport,
            EmptyResult::Record => EmptyResultPolicy::ExplicitRecord,
        }
    }
}

impl WorkArgs {
    /// Flags and environment on top of [`WorkerConfig::default`].
    pub fn into_config(self, redis_url: &str, hostname: String) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        let secs = |value: Option<u64>, default: Duration| value.map(Duration::from_secs).unwrap_or(default);

        WorkerConfig {
            hostname: self.hostname.unwrap_or(hostname),
            tool: self.tool.unwrap_or(defaults.tool),
            redis_url: redis_url.to_string(),
            scan_queue: self.queues.scan_queue,
            cancel_channel: self.queues.cancel_channel,
            backend_url: self.backend_url.unwrap_or(defaults.backend_url),
            backend_token: self.backend_token.unwrap_or(defaults.backend_token),
            scan_command: self.scan_command.unwrap_or(defaults.scan_command),
            discovery_opts: self.discovery_opts.unwrap_or(defaults.discovery_opts),
            enrichment_opts: self.enrichment_opts.unwrap_or(defaults.enrichment_opts),
            lock_ttl_margin: secs(self.lock_ttl_margin, defaults.lock_ttl_margin),
            terminate_grace: secs(self.terminate_grace, defaults.terminate_grace),
            worker_slots: self.slots.unwrap_or(defaults.worker_slots),
            queue_poll: self
                .queue_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_poll),
            presence_ttl: secs(self.presence_ttl, defaults.presence_ttl),
            address_lookup_url: self.address_lookup_url.unwrap_or(defaults.address_lookup_url),
            empty_result_policy: self
                .empty_result
                .map(EmptyResultPolicy::from)
                .unwrap_or(defaults.empty_result_policy),
        }
    }
}

#[derive(Args)]
pub struct CancelArgs {
    #[command(flatten)]
    pub queues: QueueArgs,

    /// Jobs to cancel
    #[arg(required = true)]
    pub job_ids: Vec<String>,
}

#[derive(Args)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub queues: QueueArgs,

    #[arg(long)]
    pub ip: IpAddr,

    #[arg(long)]
    pub project: Uuid,

    /// Hostname to annotate the target with; repeatable
    #[arg(long = "hostname")]
    pub hostnames: Vec<String>,

    #[arg(long, default_value = "")]
    pub user: String,

    /// Job id [default: random]
    #[arg(long)]
    pub id: Option<String>,

    /// Discovery options [default: the worker's]
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub discovery_opts: String,

    /// Enrichment options [default: the worker's]
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub enrichment_opts: String,

    /// Per-phase timeout in seconds
    #[arg(long, default_value_t = 3600)]
    pub timeout: u64,

    /// Run the enrichment phase on discovered ports
    #[arg(long)]
    pub enrich: bool,

    /// insert, replace, update or append
    #[arg(long, default_value = "insert")]
    pub mode: ImportMode,
}

#[derive(Args)]
pub struct MergeArgs {
    /// Discovery report
    pub base: PathBuf,

    /// Enrichment report to take service data from
    #[arg(long)]
    pub enrichment: Option<PathBuf>,

    /// Address of the host to annotate
    #[arg(long)]
    pub ip: IpAddr,

    /// Hostname to annotate the host with; repeatable
    #[arg(long = "hostname")]
    pub hostnames: Vec<String>,

    /// Write here instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

impl CommandLine {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
