//! flowstate service
//!
//! Applies workflow engine status changes to the state store and answers
//! operator queries:
//! - update-state: resolve an engine status-change event and record it
//! - announce: emit a single workflow event
//! - get / query / count / summary: read state records
//! - stats: time-bucketed transition counts from the event log

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowstate_core::{decode, parse_utc_timestamp, EventType, Settings, State};
use flowstate_events::{Announcement, StatusChange};
use flowstate_store::{metrics, QueryFilter, SortIndex};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

mod clients;

use clients::Clients;

#[derive(Parser, Debug)]
#[command(name = "flowstate-service")]
#[command(about = "Workflow state tracking and event fan-out")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML); FLOWSTATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(clap::Args, Debug, Clone)]
struct FilterArgs {
    /// Only records in this state
    #[arg(long)]
    state: Option<State>,

    /// Only records updated within this window, e.g. 6h or 2d
    #[arg(long)]
    since: Option<String>,

    /// Only records whose last error starts with this
    #[arg(long)]
    error_prefix: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> QueryFilter {
        QueryFilter {
            state: self.state,
            since: self.since.clone(),
            error_prefix: self.error_prefix.clone(),
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply an engine status-change event
    UpdateState {
        /// Path to the event JSON, or - for stdin
        #[arg(long, default_value = "-")]
        event: String,
    },

    /// Announce a single workflow event
    Announce {
        /// Event type, e.g. CLAIMED_PROCESSING or FAILED
        event_type: EventType,
        payload_id: String,
        #[arg(long)]
        execution: Option<String>,
        #[arg(long)]
        error: Option<String>,
        #[arg(long)]
        payload_url: Option<String>,
        /// Output item references recorded on success
        #[arg(long, value_delimiter = ',')]
        outputs: Option<Vec<String>>,
        /// Transition time (RFC 3339, UTC); defaults to now
        #[arg(long)]
        timestamp: Option<String>,
    },

    /// Fetch state records by payload id
    Get {
        #[arg(required = true)]
        payload_ids: Vec<String>,
    },

    /// List records in one collections/workflow partition
    Query {
        /// Partition key, `<collections>_<workflow>`
        collections_workflow: String,
        #[command(flatten)]
        filter: FilterArgs,
        /// default, state_updated or updated
        #[arg(long, default_value = "updated")]
        sort_index: SortIndex,
        #[arg(long)]
        ascending: bool,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        /// Cursor returned by a previous page
        #[arg(long)]
        nextkey: Option<String>,
    },

    /// Count records in a partition, capped at --limit
    Count {
        collections_workflow: String,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Per-state counts for a partition
    Summary {
        collections_workflow: String,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Transition counts from the event log
    Stats {
        /// Bucket width, e.g. 1h
        #[arg(long, default_value = "1h")]
        bucket: String,
        /// Window length, e.g. 1d
        #[arg(long, default_value = "1d")]
        duration: String,
    },

    /// Print Prometheus metrics for this process
    Metrics,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("flowstate_service=info".parse()?)
        .add_directive("flowstate_events=info".parse()?)
        .add_directive("flowstate_store=info".parse()?)
        .add_directive("flowstate_core=info".parse()?)
        .add_directive("sqlx=warn".parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Read an event document from `path`, or stdin for `-`
fn read_event(path: &str) -> Result<Value> {
    let raw = if path == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading event from stdin")?;
        raw
    } else {
        std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("reading event from {}", path))?
    };
    serde_json::from_str(&raw).context("parsing event JSON")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json)?;

    metrics::register_metrics();

    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    let clients = Clients::connect(&settings).await?;

    match args.command {
        Commands::UpdateState { event } => {
            let event = read_event(&event)?;
            let change = StatusChange::from_event(&event)?;
            info!(
                payload_id = %change.payload_id,
                status = %change.status,
                "Applying status change"
            );
            let record = clients.resolver.apply(&clients.manager(), &change).await?;
            print_json(&record)?;
        }
        Commands::Announce {
            event_type,
            payload_id,
            execution,
            error,
            payload_url,
            outputs,
            timestamp,
        } => {
            let mut announcement = Announcement::for_payload(payload_id).payload_url(payload_url);
            announcement.execution = execution;
            announcement.error = error;
            announcement.outputs = outputs;
            if let Some(timestamp) = timestamp {
                announcement = announcement.at(parse_utc_timestamp(&timestamp)?);
            }
            let record = clients.manager().announce(event_type, announcement).await?;
            print_json(&record)?;
        }
        Commands::Get { payload_ids } => {
            let keys = payload_ids
                .iter()
                .map(|id| decode(id))
                .collect::<flowstate_core::Result<Vec<_>>>()?;
            let records = clients.state_store.get_many(&keys).await?;
            print_json(&records)?;
        }
        Commands::Query {
            collections_workflow,
            filter,
            sort_index,
            ascending,
            limit,
            nextkey,
        } => {
            let filter = filter.to_filter().sort(sort_index, ascending);
            let page = clients
                .state_store
                .query(&collections_workflow, &filter, limit, nextkey.as_deref())
                .await?;
            print_json(&page)?;
        }
        Commands::Count {
            collections_workflow,
            filter,
            limit,
        } => {
            let count = clients
                .state_store
                .count(&collections_workflow, &filter.to_filter(), limit)
                .await?;
            print_json(&count)?;
        }
        Commands::Summary {
            collections_workflow,
            since,
            limit,
        } => {
            let summary = clients
                .state_store
                .summary(&collections_workflow, since.as_deref(), limit)
                .await?;
            print_json(&summary)?;
        }
        Commands::Stats { bucket, duration } => {
            let rows = clients.event_log.query_bucket(&bucket, &duration).await?;
            print_json(&rows)?;
        }
        Commands::Metrics => print!("{}", metrics::gather_metrics()),
    }

    Ok(())
}
