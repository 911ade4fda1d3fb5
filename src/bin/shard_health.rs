//! Shard Health Daemon
//!
//! Probes every shard on an interval and periodically logs the health
//! report and active alerts.

use shardwarden::config::{ComponentFactory, ShardingConfig};
use shardwarden::sharding::ShardMetricsExporter;
use shardwarden::telemetry::Telemetry;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

/// Shard health monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of shards (overrides SHARD_COUNT)
    #[arg(long)]
    shard_count: Option<usize>,

    /// Probe interval in seconds (overrides HEALTH_CHECK_INTERVAL_SECS)
    #[arg(long)]
    interval_secs: Option<u64>,

    /// How often to log the health report, in seconds
    #[arg(long, env = "HEALTH_REPORT_INTERVAL_SECS", default_value = "60")]
    report_interval_secs: u64,

    /// Print the Prometheus exposition with each report
    #[arg(long)]
    prometheus: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("shardwarden-health", &args.log_level)?;

    let mut config = ShardingConfig::from_env()?;
    if let Some(count) = args.shard_count {
        if count == 0 {
            return Err("--shard-count must be at least 1".into());
        }
        config.shard_count = count;
    }
    if let Some(secs) = args.interval_secs {
        config.health.interval = Duration::from_secs(secs.max(1));
    }

    info!(
        shards = config.shard_count,
        interval_secs = config.health.interval.as_secs(),
        "Starting shard health daemon"
    );

    let router = ComponentFactory::create_router(&config)?;
    let checker = ComponentFactory::create_health_checker(Arc::clone(&router), &config.health);
    let exporter = ShardMetricsExporter::new(Arc::clone(&checker));

    checker.start()?;

    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval_secs.max(1)));
    // The first tick fires immediately, before any probe has finished
    report.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = report.tick() => {
                exporter.log_metrics();
                for alert in exporter.generate_alerts() {
                    warn!(alert = %alert, "Shard alert");
                }
                if args.prometheus {
                    println!("{}", exporter.export_prometheus());
                }
            }
            _ = &mut shutdown => break,
        }
    }

    info!("Shard health daemon shutting down");
    checker.stop().await;
    router.close().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
