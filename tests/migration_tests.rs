//! Integration tests for online shard migration
//!
//! Covers the full lifecycle of a `ShardMigration` between in-memory shards:
//! copy and verification, live dual-writes, cancellation, timeouts, and
//! rollback of exactly the rows the migration created.

use shardwarden::sharding::{
    DualWriteLeader, FaultPlan, MemoryShard, MigrationConfig, MigrationPhase, MigrationState, Row,
    ShardConnection, ShardMigration, DEFAULT_BATCH_SIZE,
};
use shardwarden::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Helper to build a migration between two fresh in-memory shards
fn setup(config: MigrationConfig) -> (Arc<MemoryShard>, Arc<MemoryShard>, Arc<ShardMigration>) {
    let source = Arc::new(MemoryShard::new(config.source_shard_id));
    let target = Arc::new(MemoryShard::new(config.target_shard_id));
    let migration = Arc::new(ShardMigration::new(
        config,
        Arc::clone(&source) as Arc<dyn ShardConnection>,
        Arc::clone(&target) as Arc<dyn ShardConnection>,
    ));
    (source, target, migration)
}

/// Helper to create order rows with ids in `first..first + count`
fn orders(first: i64, count: i64) -> Vec<Row> {
    (first..first + count)
        .map(|id| Row::new(id).with("restaurant_id", id % 7).with("total", id * 100))
        .collect()
}

/// Helper to poll until `condition` holds, failing the test after 5 seconds
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Helper to run `start` on a background task
fn spawn_start(
    migration: &Arc<ShardMigration>,
    ctx: &CancellationToken,
) -> tokio::task::JoinHandle<shardwarden::Result<()>> {
    let migration = Arc::clone(migration);
    let ctx = ctx.clone();
    tokio::spawn(async move { migration.start(&ctx).await })
}

#[tokio::test]
async fn test_initial_state() {
    let (_, _, migration) = setup(MigrationConfig::new(0, 1));

    let progress = migration.progress();
    assert_eq!(migration.state(), MigrationState::Pending);
    assert_eq!(progress.state, MigrationState::Pending);
    assert_eq!(progress.phase, MigrationPhase::NotStarted);
    assert_eq!(progress.total_records, 0);
    assert_eq!(progress.migrated_records, 0);
    assert_eq!(progress.percent_complete, 0.0);
    assert!(progress.started_at.is_none());
    assert!(!migration.is_dual_write_active());
    assert_eq!(migration.dual_write_stats().write_count, 0);
}

#[tokio::test]
async fn test_full_copy_with_verification() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 7;
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 50));
    source.seed("customers", orders(1, 12));

    migration.start(&CancellationToken::new()).await.unwrap();

    let progress = migration.progress();
    assert_eq!(progress.state, MigrationState::Completed);
    assert_eq!(progress.phase, MigrationPhase::Finished);
    assert_eq!(progress.total_records, 62);
    assert_eq!(progress.migrated_records, 62);
    assert_eq!(progress.verified_records, 62);
    assert_eq!(progress.failed_records, 0);
    assert_eq!(progress.percent_complete, 100.0);
    assert!(progress.started_at.is_some());
    assert!(progress.estimated_remaining.is_none());

    for id in [1, 25, 50] {
        assert_eq!(target.row("orders", id), source.row("orders", id));
    }
    assert_eq!(target.row_count("customers"), 12);
    // The source is left intact
    assert_eq!(source.row_count("orders"), 50);
}

#[tokio::test]
async fn test_empty_source_completes() {
    let (_, target, migration) = setup(MigrationConfig::new(0, 1));

    migration.start(&CancellationToken::new()).await.unwrap();

    let progress = migration.progress();
    assert_eq!(progress.state, MigrationState::Completed);
    assert_eq!(progress.total_records, 0);
    assert_eq!(progress.percent_complete, 0.0);
    assert_eq!(target.row_count("orders"), 0);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let (source, target, migration) = setup(MigrationConfig::new(0, 1));
    source.seed("orders", orders(1, 10));

    migration.cancel();
    assert_eq!(migration.state(), MigrationState::RolledBack);

    let err = migration.start(&CancellationToken::new()).await.unwrap_err();
    assert!(
        matches!(err, Error::InvalidTransition { .. }),
        "unexpected error: {}",
        err
    );
    assert_eq!(migration.state(), MigrationState::RolledBack);
    assert_eq!(target.row_count("orders"), 0);
}

#[tokio::test]
async fn test_start_after_completion_is_rejected() {
    let (source, _, migration) = setup(MigrationConfig::new(0, 1));
    source.seed("orders", orders(1, 5));
    migration.start(&CancellationToken::new()).await.unwrap();

    let before = migration.progress();
    let err = migration.start(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert_eq!(migration.state(), MigrationState::Completed);
    assert_eq!(migration.progress().migrated_records, before.migrated_records);
}

#[tokio::test]
async fn test_cancel_while_running() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 10;
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 1000));
    source.set_latency(Duration::from_millis(10));

    let ctx = CancellationToken::new();
    let run = spawn_start(&migration, &ctx);
    wait_until("first batch", || migration.progress().migrated_records > 0).await;

    migration.cancel();
    let err = run.await.unwrap().unwrap_err();

    assert!(matches!(err, Error::Cancelled), "unexpected error: {}", err);
    assert_eq!(migration.state(), MigrationState::RolledBack);
    assert!(!migration.is_dual_write_active());

    // Cancel leaves copied rows for an explicit rollback
    let copied = target.row_count("orders");
    assert!(copied > 0 && copied < 1000, "copied {} rows", copied);

    source.set_latency(Duration::ZERO);
    migration.rollback(&CancellationToken::new()).await.unwrap();
    assert_eq!(target.row_count("orders"), 0);
    assert_eq!(source.row_count("orders"), 1000);
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 10;
    let (source, _, migration) = setup(config);
    source.seed("orders", orders(1, 200));
    source.set_latency(Duration::from_millis(3));

    let run = spawn_start(&migration, &CancellationToken::new());

    let mut last_migrated = 0;
    let mut last_percent = 0.0;
    let mut samples = 0;
    while !migration.state().is_terminal() {
        let progress = migration.progress();
        assert!(progress.migrated_records >= last_migrated);
        assert!(progress.percent_complete >= last_percent);
        assert!(progress.percent_complete <= 100.0);
        last_migrated = progress.migrated_records;
        last_percent = progress.percent_complete;
        samples += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    run.await.unwrap().unwrap();
    assert!(samples > 1);
    assert_eq!(migration.progress().migrated_records, 200);
}

#[tokio::test]
async fn test_live_writes_are_mirrored_during_copy() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 10;
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 100));
    source.set_latency(Duration::from_millis(5));

    let run = spawn_start(&migration, &CancellationToken::new());
    wait_until("dual-write", || migration.is_dual_write_active()).await;

    migration.write("orders", &orders(5000, 3)).await.unwrap();
    assert!(target.row("orders", 5000).is_some());
    assert!(source.row("orders", 5000).is_some());

    run.await.unwrap().unwrap();

    assert_eq!(migration.state(), MigrationState::Completed);
    assert!(!migration.is_dual_write_active());
    assert_eq!(source.row_count("orders"), 103);
    assert_eq!(target.row_count("orders"), 103);
    assert_eq!(migration.dual_write_stats().write_count, 1);
    assert_eq!(migration.dual_write_stats().error_count, 0);
}

#[tokio::test]
async fn test_rollback_restores_target_led_write_missing_on_source() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 10;
    config.dual_write_leader = DualWriteLeader::Target;
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 1000));
    source.set_latency(Duration::from_millis(5));

    let ctx = CancellationToken::new();
    let run = spawn_start(&migration, &ctx);
    wait_until("dual-write", || migration.is_dual_write_active()).await;

    // The mirror to the source fails but the target-led write is acknowledged
    source.set_faults(FaultPlan {
        latency: Duration::from_millis(5),
        fail_inserts_after: Some(0),
        ..Default::default()
    });
    migration.write("orders", &orders(5000, 1)).await.unwrap();
    assert_eq!(migration.dual_write_stats().error_count, 1);
    assert!(target.row("orders", 5000).is_some());
    assert!(source.row("orders", 5000).is_none());

    migration.cancel();
    assert!(run.await.unwrap().is_err());

    source.set_faults(FaultPlan::default());
    migration.rollback(&CancellationToken::new()).await.unwrap();

    assert_eq!(source.row("orders", 5000), orders(5000, 1).pop());
    assert!(target.row("orders", 5000).is_none());
    assert_eq!(target.row_count("orders"), 0);
    assert_eq!(source.row_count("orders"), 1001);
}

#[tokio::test]
async fn test_verification_mismatch_rolls_back() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 5;
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 20));
    target.set_faults(FaultPlan {
        corrupt_inserts: true,
        ..Default::default()
    });

    let err = migration.start(&CancellationToken::new()).await.unwrap_err();

    assert!(
        matches!(err, Error::VerificationMismatch { .. }),
        "unexpected error: {}",
        err
    );
    assert_eq!(migration.state(), MigrationState::RolledBack);
    assert!(migration.progress().failed_records > 0);
    assert_eq!(target.row_count("orders"), 0);
}

#[tokio::test]
async fn test_timeout_rolls_back() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 10;
    config.timeout = Duration::from_millis(100);
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 1000));
    source.set_latency(Duration::from_millis(10));

    let err = migration.start(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::Timeout), "unexpected error: {}", err);
    assert_eq!(migration.state(), MigrationState::RolledBack);
    assert_eq!(target.row_count("orders"), 0);
}

#[tokio::test]
async fn test_context_cancellation_rolls_back() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 10;
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 1000));
    source.set_latency(Duration::from_millis(10));

    let ctx = CancellationToken::new();
    let run = spawn_start(&migration, &ctx);
    wait_until("first batch", || migration.progress().migrated_records > 0).await;

    ctx.cancel();
    let err = run.await.unwrap().unwrap_err();

    assert!(matches!(err, Error::Cancelled), "unexpected error: {}", err);
    assert_eq!(migration.state(), MigrationState::RolledBack);
    assert_eq!(target.row_count("orders"), 0);
}

#[tokio::test]
async fn test_rollback_keeps_preexisting_target_rows() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 10;
    config.verify_all = false;
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 100));

    // Id 1 collides with the source, ids 900.. are unrelated
    let existing = Row::new(1).with("total", "kept");
    target.seed("orders", vec![existing.clone()]);
    target.seed("orders", orders(900, 5));
    target.set_faults(FaultPlan {
        fail_inserts_after: Some(3),
        ..Default::default()
    });

    let err = migration.start(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::Query { .. }), "unexpected error: {}", err);
    assert_eq!(migration.state(), MigrationState::RolledBack);
    assert_eq!(target.row_count("orders"), 6);
    assert_eq!(target.row("orders", 1), Some(existing));
    assert!(target.row("orders", 900).is_some());
    assert!(target.row("orders", 2).is_none());
}

#[tokio::test]
async fn test_connectivity_loss_fails_migration() {
    let (source, target, migration) = setup(MigrationConfig::new(0, 1));
    source.seed("orders", orders(1, 10));
    target.set_unreachable(true);

    let err = migration.start(&CancellationToken::new()).await.unwrap_err();

    assert!(err.is_connectivity(), "unexpected error: {}", err);
    assert_eq!(migration.state(), MigrationState::RolledBack);
    assert!(!migration.is_dual_write_active());
}

#[tokio::test]
async fn test_same_source_and_target() {
    let shard = Arc::new(MemoryShard::new(3));
    shard.seed("orders", orders(1, 25));
    let migration = ShardMigration::new(
        MigrationConfig::new(3, 3),
        Arc::clone(&shard) as Arc<dyn ShardConnection>,
        Arc::clone(&shard) as Arc<dyn ShardConnection>,
    );

    migration.start(&CancellationToken::new()).await.unwrap();

    assert_eq!(migration.state(), MigrationState::Completed);
    assert_eq!(shard.row_count("orders"), 25);
    assert_eq!(migration.progress().migrated_records, 25);
}

#[tokio::test]
async fn test_zero_batch_size_uses_default() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 0;
    let (source, target, migration) = setup(config);
    let rows = DEFAULT_BATCH_SIZE as i64 * 2 + 17;
    source.seed("orders", orders(1, rows));

    assert_eq!(migration.config().effective_batch_size(), DEFAULT_BATCH_SIZE);
    migration.start(&CancellationToken::new()).await.unwrap();

    assert_eq!(target.row_count("orders"), rows as usize);
    assert_eq!(migration.progress().migrated_records, rows);
}

#[tokio::test]
async fn test_concurrent_start_is_rejected() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 10;
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 100));
    source.set_latency(Duration::from_millis(5));

    let ctx = CancellationToken::new();
    let run = spawn_start(&migration, &ctx);
    wait_until("running", || migration.state() == MigrationState::Running).await;

    let err = migration.start(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    run.await.unwrap().unwrap();
    assert_eq!(migration.state(), MigrationState::Completed);
    assert_eq!(target.row_count("orders"), 100);
}

#[tokio::test]
async fn test_rollback_after_completion_is_rejected() {
    let (source, target, migration) = setup(MigrationConfig::new(0, 1));
    source.seed("orders", orders(1, 10));
    migration.start(&CancellationToken::new()).await.unwrap();

    let err = migration.rollback(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert_eq!(migration.state(), MigrationState::Completed);
    assert_eq!(target.row_count("orders"), 10);

    // Cancel is a no-op once completed
    migration.cancel();
    assert_eq!(migration.state(), MigrationState::Completed);
}

#[tokio::test]
async fn test_failure_without_auto_rollback_keeps_rows() {
    let mut config = MigrationConfig::new(0, 1);
    config.batch_size = 10;
    config.rollback_on_error = false;
    let (source, target, migration) = setup(config);
    source.seed("orders", orders(1, 50));
    target.set_faults(FaultPlan {
        fail_inserts_after: Some(2),
        ..Default::default()
    });

    let err = migration.start(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::Query { .. }), "unexpected error: {}", err);
    assert_eq!(migration.state(), MigrationState::RolledBack);
    assert_eq!(target.row_count("orders"), 20);

    target.set_faults(FaultPlan::default());
    migration.rollback(&CancellationToken::new()).await.unwrap();
    assert_eq!(target.row_count("orders"), 0);

    // A second rollback has nothing left to do
    migration.rollback(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_writes_after_rollback_go_to_source() {
    let (source, target, migration) = setup(MigrationConfig::new(0, 1));
    migration.cancel();

    migration.write("orders", &orders(1, 2)).await.unwrap();

    assert_eq!(source.row_count("orders"), 2);
    assert_eq!(target.row_count("orders"), 0);
}
