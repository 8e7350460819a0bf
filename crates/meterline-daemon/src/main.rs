//! Meterline Daemon - Main entry point
//!
//! Ingests the probe, then runs counter and rule tasks until shutdown.

mod config;
mod probe;
mod state;
mod tasks;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Meterline: machine data registry, lifetime counters, and derived values
#[derive(Parser, Debug)]
#[command(name = "meterline", version)]
struct Args {
    /// TOML configuration; defaults apply when the file is missing
    #[arg(short, long, default_value = "meterline.toml")]
    config: PathBuf,

    /// Probe file or http(s) URL, replacing `probe.source`
    #[arg(short, long)]
    probe: Option<String>,

    /// Default log level when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Register the probe, print a summary, and exit
    #[arg(long)]
    ingest_once: bool,
}

/// Directive for a `--log-level` value; unknown levels fall back to info
fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Meterline v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;
    if let Some(probe) = args.probe {
        config.probe.source = probe;
    }

    info!(
        store = ?config.store.kind,
        probe = %config.probe.source,
        counters = config.counters.len(),
        outputs = config.outputs.len(),
        "Configuration loaded"
    );

    let (trigger, mut shutdown) = meterline_core::shutdown::channel();
    let grace = config.daemon.shutdown_grace();
    let signals = tasks::listen_for_signals(trigger);

    let Some(store) = state::open_store(&config, &mut shutdown).await else {
        info!("Shutdown requested before the store was ready");
        return Ok(());
    };

    let state = state::AppState::new(config, store)?;
    let report = state
        .ingest()
        .await
        .context("Initial probe ingestion failed")?
        .unwrap_or_default();

    if args.ingest_once {
        println!(
            "Ingested {} elements: {} nodes created, {} already present",
            report.elements, report.created, report.existing
        );
        return Ok(());
    }

    let running = tasks::spawn_all(&state, &shutdown);
    shutdown.triggered().await;
    tasks::drain(running, grace).await;
    signals.abort();
    Ok(())
}
