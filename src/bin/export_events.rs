//! export_events - dump stored detection events as JSON

use anyhow::{Context, Result};
use clap::Parser;

use cat_sentry::storage::{EventStore, SqliteEventStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the event database.
    #[arg(long, env = "CAT_SENTRY_DB_PATH", default_value = "cat_sentry.db")]
    db_path: String,
    /// Maximum number of events to export, newest first.
    #[arg(long, default_value_t = 1000)]
    limit: usize,
    /// Only include events at or after this Unix millisecond timestamp.
    #[arg(long)]
    since_ms: Option<u64>,
    /// Pretty-print the JSON output.
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let store = SqliteEventStore::open(&args.db_path)
        .with_context(|| format!("open event database {}", args.db_path))?;

    let mut events = store.recent(args.limit).context("read events")?;
    if let Some(since) = args.since_ms {
        events.retain(|e| e.event.unix_time_ms >= since);
    }

    let json = if args.pretty {
        serde_json::to_string_pretty(&events)
    } else {
        serde_json::to_string(&events)
    }
    .context("serialize events")?;
    println!("{}", json);

    log::info!("exported {} events from {}", events.len(), args.db_path);
    Ok(())
}
