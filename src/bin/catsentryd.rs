//! catsentryd - cat detection daemon
//!
//! This daemon:
//! 1. Captures frames from the configured camera on a dedicated thread
//! 2. Runs the detector chain with automatic fallback on another
//! 3. Validates detections for temporal and spatial consistency
//! 4. Persists validated events, then dispatches notifications
//! 5. Monitors device resources and sheds load under pressure

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use cat_sentry::config::{ConfigStore, SentryConfig};
use cat_sentry::notify::{MqttChannel, NotificationChannel, WebhookChannel};
use cat_sentry::pipeline::Pipeline;
use cat_sentry::storage::SqliteEventStore;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "CAT_SENTRY_CONFIG")]
    config: Option<PathBuf>,
    /// Seconds between status log lines (0 disables).
    #[arg(long, default_value_t = 60)]
    status_interval: u64,
}

/// Exit code asking the service manager to restart the process.
const EXIT_RESTART: i32 = 3;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SentryConfig::load_from(args.config.as_deref()).context("load configuration")?;
    log::info!(
        "cat-sentry {} starting: camera {} db {}",
        env!("CARGO_PKG_VERSION"),
        config.camera.url,
        config.db_path
    );

    let mut channels: Vec<Box<dyn NotificationChannel>> = Vec::new();
    if let Some(url) = config.notify.webhook_url.clone() {
        channels.push(Box::new(WebhookChannel::new(url)));
    }
    if let Some(mqtt) = &config.notify.mqtt {
        match MqttChannel::new(mqtt) {
            Ok(channel) => channels.push(Box::new(channel)),
            Err(e) => log::error!("mqtt channel unavailable: {}", e),
        }
    }
    if channels.is_empty() {
        log::warn!("no notification channels configured; events are stored only");
    }

    let store = SqliteEventStore::open(&config.db_path).context("open event store")?;
    let config_store = Arc::new(ConfigStore::new(config, args.config.clone()));

    let pipeline = Pipeline::start(config_store, Box::new(store), channels)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("install signal handler")?;

    let status_every = Duration::from_secs(args.status_interval.max(1));
    let mut last_status = std::time::Instant::now();
    while !shutdown.load(Ordering::SeqCst) && !pipeline.restart_requested() {
        std::thread::sleep(Duration::from_millis(200));
        if args.status_interval > 0 && last_status.elapsed() >= status_every {
            last_status = std::time::Instant::now();
            let status = pipeline.status();
            log::info!(
                "status: frames {} events {} stored {} backend {} sent {} (cooldown {} rate {} quiet {} failed {})",
                status.frames_processed,
                status.events_validated,
                status.stored_events,
                status.engine.active.as_str(),
                status.dispatcher.sent,
                status.dispatcher.suppressed_cooldown,
                status.dispatcher.suppressed_rate,
                status.dispatcher.suppressed_quiet,
                status.dispatcher.failed,
            );
        }
    }

    let restart = pipeline.restart_requested();
    pipeline.stop();
    if restart {
        log::error!("exiting for restart");
        std::process::exit(EXIT_RESTART);
    }
    Ok(())
}
