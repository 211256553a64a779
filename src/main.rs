use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tradevol::config::Config;
use tradevol::consumer::{inbound_channel, BatchConsumer, RetryPolicy};
use tradevol::engine::Engine;
use tradevol::feed::run_file_feed;
use tradevol::graceful_shutdown;
use tradevol::health::HealthService;
use tradevol::lifecycle::Lifecycle;

#[derive(Parser, Debug)]
#[command(
    name = "tradevol",
    version,
    about = "Trade volume aggregation engine"
)]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// JSONL file of trade batches to ingest. Without it the engine idles until Ctrl-C.
    #[arg(long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let cfg = Config::load(&args.config).context("load config")?;

    std::fs::create_dir_all(&cfg.run.data_dir).context("create data_dir")?;

    let engine = Engine::in_memory(&cfg).await.context("build engine")?;
    let (inbound, inbound_rx) = inbound_channel(cfg.ingest.channel_capacity);

    let mut lifecycle = Lifecycle::new();
    lifecycle.register(Box::new(HealthService::new(
        cfg.health_path(),
        engine.health.clone(),
        Duration::from_secs(cfg.health.heartbeat_interval_secs),
    )));
    lifecycle.register(Box::new(engine.eviction_service(&cfg)));
    lifecycle.register(Box::new(BatchConsumer::new(
        engine.aggregator.clone(),
        inbound_rx,
        RetryPolicy::from(&cfg.channel),
        cfg.dead_letter_path(),
        engine.health.clone(),
    )));
    lifecycle.start_all().await.context("start services")?;
    info!(services = lifecycle.len(), "services running");

    let (shutdown_tx, shutdown_rx) = graceful_shutdown::channel();
    let feed_handle = args.input.clone().map(|path| {
        let inbound = inbound.clone();
        tokio::spawn(async move { run_file_feed(&path, inbound, shutdown_rx).await })
    });
    drop(inbound);

    match feed_handle {
        Some(mut handle) => {
            tokio::select! {
                res = &mut handle => {
                    match res.context("feed task join")? {
                        Ok(stats) => info!(?stats, "input fully consumed"),
                        Err(e) => error!(error = %e, "feed failed"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("ctrl-c received; shutting down");
                    graceful_shutdown::request(&shutdown_tx);
                    if let Err(e) = handle.await.context("feed task join")? {
                        error!(error = %e, "feed failed during shutdown");
                    }
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            info!("ctrl-c received; shutting down");
        }
    }

    lifecycle.stop_all().await.context("stop services")?;

    let snap = engine.health.snapshot();
    info!(
        batches = snap.batches_ingested,
        events = snap.events_ingested,
        dead_lettered = snap.batches_dead_lettered,
        watermark_ms = ?engine.aggregator.watermark(),
        "done"
    );
    Ok(())
}
