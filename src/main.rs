//! Watchdog Exporter - HTTP(S) endpoint prober with a Prometheus surface.
//!
//! Probes every configured endpoint over each of its routes on a fixed
//! interval and exports the latest outcome per target as gauges.

mod config;
mod metrics;
mod probe;
mod scheduler;
mod web;

use config::WatchdogConfig;
use metrics::WdMetrics;
use probe::ProbeValidator;
use scheduler::Engine;
use web::Server;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "watchdog_exporter",
    version,
    about = "HTTP(S) endpoint prober and Prometheus exporter"
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "WATCHDOG_CONFIG", default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Load configuration
    let cfg = WatchdogConfig::load(&args.config)?;

    // Initialize logging
    let level = if cfg.settings.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("watchdog_exporter={level}").parse()?),
        )
        .init();

    tracing::info!(
        "Starting {} {} with config {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );
    cfg.log_summary();

    let cfg = Arc::new(cfg);

    // Probing engine
    let validator = ProbeValidator::with_defaults(cfg.settings.response_body_limit);
    let engine = Arc::new(Engine::new(cfg.clone(), validator));

    // Metrics
    let registry = prometheus::Registry::new();
    let wd_metrics = Arc::new(WdMetrics::new(&registry, &cfg.metrics, engine.provider())?);
    engine.subscribe(wd_metrics.clone());
    wd_metrics.rebuild_all();

    // Shutdown on Ctrl-C
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    // Start engine
    let engine_task = tokio::spawn(engine.run(shutdown.clone()));

    // Start web server
    let server = Server::new(
        registry,
        cfg.listen_address(),
        cfg.settings.telemetry_path.clone(),
    );
    let served = server.start(shutdown.clone()).await;

    shutdown.cancel();
    engine_task.await?;
    served?;

    Ok(())
}
