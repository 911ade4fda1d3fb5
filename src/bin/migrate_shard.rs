//! Shard Migration Tool
//!
//! Copies one shard into another with live dual-writes, logging progress
//! until the migration completes or is rolled back. Ctrl+C or SIGTERM
//! cancels the run.

use shardwarden::config::{ComponentFactory, ShardingConfig};
use shardwarden::sharding::{
    DualWriteLeader, MigrationConfig, MigrationState, Row, ShardConnection, ShardMigration,
    DEFAULT_TABLES,
};
use shardwarden::telemetry::Telemetry;

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Leader {
    Source,
    Target,
}

impl From<Leader> for DualWriteLeader {
    fn from(leader: Leader) -> Self {
        match leader {
            Leader::Source => DualWriteLeader::Source,
            Leader::Target => DualWriteLeader::Target,
        }
    }
}

/// Shard migration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Shard to copy from
    #[arg(long)]
    source_shard: usize,

    /// Shard to copy into
    #[arg(long)]
    target_shard: usize,

    /// Rows per copy batch (0 = default)
    #[arg(long, default_value = "1000")]
    batch_size: usize,

    /// Side that receives live writes first
    #[arg(long, value_enum, default_value = "source")]
    leader: Leader,

    /// Re-read and compare every copied batch
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    verify: bool,

    /// Remove copied rows automatically when the migration fails
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    rollback_on_error: bool,

    /// Wall-clock budget in seconds (0 = unlimited)
    #[arg(long, default_value = "86400")]
    timeout_secs: u64,

    /// Progress log interval in seconds
    #[arg(long, default_value = "5")]
    status_interval_secs: u64,

    /// Synthetic rows per table loaded into the source shard (memory backend)
    #[arg(long, env = "MIGRATION_SEED_ROWS", default_value = "10000")]
    seed_rows: i64,

    /// Live writes per second sent through the migration while it runs
    #[arg(long, default_value = "0")]
    live_writes_per_sec: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("shardwarden-migrate", &args.log_level)?;

    let config = ShardingConfig::from_env()?;
    let shard_count = config
        .shard_count
        .max(args.source_shard.max(args.target_shard) + 1);
    let shards = ComponentFactory::create_memory_shards(shard_count);

    let source = Arc::clone(&shards[args.source_shard]);
    for table in DEFAULT_TABLES {
        source.seed(table, synthetic_rows(table, 1, args.seed_rows));
    }
    info!(
        source_shard = args.source_shard,
        rows_per_table = args.seed_rows,
        tables = DEFAULT_TABLES.len(),
        "Seeded source shard"
    );

    let migration_config = MigrationConfig {
        source_shard_id: args.source_shard,
        target_shard_id: args.target_shard,
        batch_size: args.batch_size,
        dual_write_leader: args.leader.into(),
        verify_all: args.verify,
        rollback_on_error: args.rollback_on_error,
        timeout: Duration::from_secs(args.timeout_secs),
    };
    let migration = Arc::new(ShardMigration::new(
        migration_config,
        Arc::clone(&shards[args.source_shard]) as Arc<dyn ShardConnection>,
        Arc::clone(&shards[args.target_shard]) as Arc<dyn ShardConnection>,
    ));

    let ctx = CancellationToken::new();
    let mut run = tokio::spawn({
        let migration = Arc::clone(&migration);
        let ctx = ctx.clone();
        async move { migration.start(&ctx).await }
    });

    if args.live_writes_per_sec > 0 {
        tokio::spawn(live_writes(
            Arc::clone(&migration),
            args.seed_rows + 1,
            args.live_writes_per_sec,
        ));
    }

    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval_secs.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut cancelled = false;

    let outcome = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = status.tick() => log_progress(&migration),
            _ = &mut shutdown, if !cancelled => {
                warn!("Shutdown signal received, cancelling migration");
                ctx.cancel();
                cancelled = true;
            }
        }
    };

    let progress = migration.progress();
    let dual_write = migration.dual_write_stats();
    info!(
        migration_id = %migration.id(),
        state = %progress.state,
        total = progress.total_records,
        migrated = progress.migrated_records,
        verified = progress.verified_records,
        failed = progress.failed_records,
        dual_writes = dual_write.write_count,
        dual_write_errors = dual_write.error_count,
        elapsed_secs = progress.elapsed.as_secs_f64(),
        "Migration finished"
    );

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(state = %migration.state(), "Migration failed: {}", e);
            Err(e.into())
        }
        Err(join_error) => Err(format!("migration task failed: {}", join_error).into()),
    }
}

fn log_progress(migration: &ShardMigration) {
    let progress = migration.progress();
    if progress.state != MigrationState::Running {
        return;
    }
    let elapsed = progress.elapsed.as_secs_f64();
    let rate = if elapsed > 0.0 {
        progress.migrated_records as f64 / elapsed
    } else {
        0.0
    };
    info!(
        phase = ?progress.phase,
        migrated = progress.migrated_records,
        total = progress.total_records,
        percent = %format!("{:.1}", progress.percent_complete),
        rows_per_sec = %format!("{:.0}", rate),
        eta_secs = ?progress.estimated_remaining.map(|d| d.as_secs()),
        "Migration progress"
    );
}

/// Send synthetic orders through the migration at a fixed rate until it settles
async fn live_writes(migration: Arc<ShardMigration>, first_id: i64, per_sec: u64) {
    let mut tick = tokio::time::interval(Duration::from_micros(1_000_000 / per_sec.max(1)));
    let mut id = first_id;
    loop {
        tick.tick().await;
        if migration.state().is_terminal() {
            break;
        }
        let rows = synthetic_rows("orders", id, 1);
        if let Err(e) = migration.write("orders", &rows).await {
            warn!("Live write failed: {}", e);
        }
        id += 1;
    }
}

fn synthetic_rows(table: &str, first_id: i64, count: i64) -> Vec<Row> {
    (first_id..first_id + count)
        .map(|id| {
            Row::new(id)
                .with("restaurant_id", id % 97)
                .with("amount_cents", (id * 731) % 50_000)
                .with("label", format!("{}-{}", table, id))
        })
        .collect()
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
