//! Online migration of one shard's rows into another
//!
//! A [`ShardMigration`] copies every table of a source shard into a target
//! shard in keyed batches while both stay writable. For the duration of the
//! copy, live writes routed through [`ShardMigration::write`] are mirrored to
//! both sides so the target keeps up with traffic.
//!
//! State machine:
//!
//! ```text
//! pending ──start──▶ running ──copy ok──▶ completed
//!    │                  │
//!    └──cancel/rollback─┴──cancel/rollback/failure──▶ rolled_back
//! ```
//!
//! `completed` and `rolled_back` are terminal. Every target row the
//! migration inserts is recorded, so a rollback removes exactly those rows
//! and never touches rows that were on the target beforehand.

use super::dual_write::{DualWriteCoordinator, DualWriteStats};
use super::telemetry;
use super::{Row, RowId, ShardConnection, ShardId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Rows per copy batch when the configured size is zero
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Wall-clock budget used by [`MigrationConfig::new`]
pub const DEFAULT_MIGRATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifecycle state of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Pending,
    Running,
    Completed,
    RolledBack,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Pending => "pending",
            MigrationState::Running => "running",
            MigrationState::Completed => "completed",
            MigrationState::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Completed | MigrationState::RolledBack)
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, RolledBack) | (Running, Completed) | (Running, RolledBack)
        )
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step of a running migration, for progress reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    NotStarted,
    Initializing,
    Copying,
    Verifying,
    Cutover,
    Finished,
}

/// Which side receives a mirrored write first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DualWriteLeader {
    /// The source stays authoritative until cutover
    #[default]
    Source,
    Target,
}

/// Input to a single migration run
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationConfig {
    pub source_shard_id: ShardId,
    pub target_shard_id: ShardId,
    /// Rows per copy batch; `0` selects [`DEFAULT_BATCH_SIZE`]
    pub batch_size: usize,
    pub dual_write_leader: DualWriteLeader,
    /// Re-read every copied batch from the target and compare
    pub verify_all: bool,
    /// Clean up copied rows automatically when the run fails
    pub rollback_on_error: bool,
    /// Budget for the whole run; zero disables the budget
    pub timeout: Duration,
}

impl MigrationConfig {
    pub fn new(source_shard_id: ShardId, target_shard_id: ShardId) -> Self {
        Self {
            source_shard_id,
            target_shard_id,
            batch_size: DEFAULT_BATCH_SIZE,
            dual_write_leader: DualWriteLeader::Source,
            verify_all: true,
            rollback_on_error: true,
            timeout: DEFAULT_MIGRATION_TIMEOUT,
        }
    }

    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }
}

/// Point-in-time view of a migration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationProgress {
    pub state: MigrationState,
    pub phase: MigrationPhase,
    pub total_records: i64,
    /// Never decreases while the migration is running
    pub migrated_records: i64,
    pub verified_records: i64,
    pub failed_records: i64,
    /// `0.0` when there is nothing to copy, capped at `100.0`
    pub percent_complete: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Duration,
    /// Linear extrapolation from the copy rate so far, while running
    pub estimated_remaining: Option<Duration>,
}

struct MigrationInner {
    state: MigrationState,
    phase: MigrationPhase,
    /// Flipped together with `state`, never on its own
    dual_write_active: bool,
    total_records: i64,
    migrated_records: i64,
    verified_records: i64,
    failed_records: i64,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    finished: Option<Instant>,
    /// How the migration ended, set once with the terminal transition
    outcome: Option<&'static str>,
}

impl MigrationInner {
    fn new() -> Self {
        Self {
            state: MigrationState::Pending,
            phase: MigrationPhase::NotStarted,
            dual_write_active: false,
            total_records: 0,
            migrated_records: 0,
            verified_records: 0,
            failed_records: 0,
            started_at: None,
            started: None,
            finished: None,
            outcome: None,
        }
    }

    /// The only place `state` changes
    fn transition(&mut self, next: MigrationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.dual_write_active = next == MigrationState::Running;
        if next.is_terminal() {
            self.phase = MigrationPhase::Finished;
            if self.started.is_some() {
                self.finished.get_or_insert_with(Instant::now);
            }
        }
        Ok(())
    }

    /// Move to a terminal state and count the outcome exactly once
    fn settle(&mut self, next: MigrationState, outcome: &'static str) -> Result<()> {
        self.transition(next)?;
        self.outcome = Some(outcome);
        telemetry::record_migration_outcome(outcome);
        Ok(())
    }

    fn progress(&self) -> MigrationProgress {
        let percent_complete = if self.total_records > 0 {
            (self.migrated_records as f64 / self.total_records as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let elapsed = match (self.started, self.finished) {
            (Some(started), Some(finished)) => finished.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        };

        let estimated_remaining = if self.state == MigrationState::Running
            && self.migrated_records > 0
            && self.total_records > self.migrated_records
        {
            let remaining = (self.total_records - self.migrated_records) as f64;
            let rate = self.migrated_records as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
            Some(Duration::from_secs_f64(remaining / rate))
        } else {
            None
        };

        MigrationProgress {
            state: self.state,
            phase: self.phase,
            total_records: self.total_records,
            migrated_records: self.migrated_records,
            verified_records: self.verified_records,
            failed_records: self.failed_records,
            percent_complete,
            started_at: self.started_at,
            elapsed,
            estimated_remaining,
        }
    }
}

/// A single source-to-target migration
///
/// Construction does not touch either shard. The instance is meant to be
/// shared behind an `Arc` so one task can drive [`start`](Self::start)
/// while others poll progress, write, or cancel.
pub struct ShardMigration {
    id: Uuid,
    config: MigrationConfig,
    source: Arc<dyn ShardConnection>,
    target: Arc<dyn ShardConnection>,
    inner: RwLock<MigrationInner>,
    dual_write: DualWriteCoordinator,
    cancel: CancellationToken,
    /// Target row ids inserted by this migration, per table
    inserted: Mutex<BTreeMap<String, BTreeSet<RowId>>>,
    /// Held shared by target writers, exclusively by rollback
    writers: tokio::sync::RwLock<()>,
}

impl ShardMigration {
    pub fn new(
        config: MigrationConfig,
        source: Arc<dyn ShardConnection>,
        target: Arc<dyn ShardConnection>,
    ) -> Self {
        let dual_write = DualWriteCoordinator::new(
            config.dual_write_leader,
            Arc::clone(&source),
            Arc::clone(&target),
        );
        Self {
            id: Uuid::new_v4(),
            config,
            source,
            target,
            inner: RwLock::new(MigrationInner::new()),
            dual_write,
            cancel: CancellationToken::new(),
            inserted: Mutex::new(BTreeMap::new()),
            writers: tokio::sync::RwLock::new(()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn state(&self) -> MigrationState {
        self.inner.read().state
    }

    pub fn progress(&self) -> MigrationProgress {
        self.inner.read().progress()
    }

    pub fn dual_write_stats(&self) -> DualWriteStats {
        self.dual_write.stats()
    }

    /// Whether live writes are currently mirrored to both shards
    pub fn is_dual_write_active(&self) -> bool {
        self.inner.read().dual_write_active
    }

    /// Run the migration to completion
    ///
    /// Only a pending migration can be started; any other state is rejected
    /// without side effects. Returns once the run is `completed` or
    /// `rolled_back`; it never leaves the migration `running`.
    ///
    /// `ctx` and the configured timeout abort the run. So does
    /// [`cancel`](Self::cancel), which skips the automatic rollback.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if inner.state != MigrationState::Pending {
                return Err(Error::InvalidTransition {
                    from: inner.state.to_string(),
                    to: MigrationState::Running.to_string(),
                });
            }
            inner.transition(MigrationState::Running)?;
            inner.started_at = Some(Utc::now());
            inner.started = Some(Instant::now());
        }

        info!(
            migration_id = %self.id,
            source_shard = self.config.source_shard_id,
            target_shard = self.config.target_shard_id,
            batch_size = self.config.effective_batch_size(),
            leader = ?self.config.dual_write_leader,
            "Starting shard migration"
        );

        let timeout = self.config.timeout;
        let deadline = async move {
            if timeout.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(timeout).await
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = ctx.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::Timeout),
            result = self.run(ctx) => result,
        };

        match outcome {
            Ok(()) => self.complete(),
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Stop the migration immediately
    ///
    /// Moves a pending or running migration to `rolled_back` and turns
    /// dual-write off. Copied rows stay on the target; call
    /// [`rollback`](Self::rollback) to remove them. Has no effect on a
    /// completed migration.
    pub fn cancel(&self) {
        {
            let mut inner = self.inner.write();
            match inner.state {
                MigrationState::Completed => {
                    debug!(migration_id = %self.id, "Cancel ignored, migration already completed");
                    return;
                }
                MigrationState::RolledBack => {}
                MigrationState::Pending | MigrationState::Running => {
                    if let Err(e) = inner.settle(MigrationState::RolledBack, "cancelled") {
                        warn!(migration_id = %self.id, "Cancel failed: {}", e);
                        return;
                    }
                }
            }
        }
        self.cancel.cancel();
        info!(migration_id = %self.id, "Migration cancelled");
    }

    /// Undo the migration's effect on the target shard
    ///
    /// Deletes every target row this migration inserted, whether copied or
    /// mirrored. A mirrored row the source never received is copied back to
    /// the source before it is deleted from the target. The state is
    /// `rolled_back` afterwards even if the cleanup fails; rows that could
    /// not be reverted are kept on record so a later call retries them. A
    /// completed migration cannot be rolled back.
    pub async fn rollback(&self, ctx: &CancellationToken) -> Result<()> {
        self.roll_back(ctx, "rolled_back").await
    }

    async fn roll_back(&self, ctx: &CancellationToken, outcome: &'static str) -> Result<()> {
        {
            let mut inner = self.inner.write();
            match inner.state {
                MigrationState::Completed => {
                    return Err(Error::InvalidTransition {
                        from: inner.state.to_string(),
                        to: MigrationState::RolledBack.to_string(),
                    });
                }
                // Cleanup after a cancel or a failed run without auto-rollback
                MigrationState::RolledBack => {}
                MigrationState::Pending | MigrationState::Running => {
                    inner.settle(MigrationState::RolledBack, outcome)?;
                }
            }
        }
        self.cancel.cancel();

        info!(
            migration_id = %self.id,
            source_shard = self.config.source_shard_id,
            target_shard = self.config.target_shard_id,
            "Rolling back shard migration"
        );

        // Wait out writes that passed their state check before the transition
        let _exclusive = self.writers.write().await;

        let pending = std::mem::take(&mut *self.inserted.lock());
        let batch_size = self.config.effective_batch_size();
        let mut deleted = 0u64;
        let mut restored = 0u64;
        let mut first_error: Option<Error> = None;
        let mut leftover: BTreeMap<String, BTreeSet<RowId>> = BTreeMap::new();

        for (table, ids) in pending {
            let ids: Vec<RowId> = ids.into_iter().collect();
            for chunk in ids.chunks(batch_size) {
                if first_error.is_none() && ctx.is_cancelled() {
                    first_error = Some(Error::Cancelled);
                }
                if first_error.is_some() {
                    leftover.entry(table.clone()).or_default().extend(chunk);
                    continue;
                }
                match self.revert_chunk(&table, chunk).await {
                    Ok((back, removed)) => {
                        restored += back;
                        deleted += removed;
                    }
                    Err(e) => {
                        warn!(
                            migration_id = %self.id,
                            table = %table,
                            "Failed to revert copied rows: {}",
                            e
                        );
                        leftover.entry(table.clone()).or_default().extend(chunk);
                        first_error = Some(e);
                    }
                }
            }
        }

        if !leftover.is_empty() {
            let mut inserted = self.inserted.lock();
            for (table, ids) in leftover {
                inserted.entry(table).or_default().extend(ids);
            }
        }

        match first_error {
            None => {
                info!(migration_id = %self.id, deleted, restored, "Rollback completed");
                Ok(())
            }
            Some(e) => {
                error!(migration_id = %self.id, deleted, restored, "Rollback incomplete: {}", e);
                Err(e)
            }
        }
    }

    /// Copy rows missing on the source back from the target, then delete
    /// them from the target. Returns (restored, deleted).
    async fn revert_chunk(&self, table: &str, ids: &[RowId]) -> Result<(u64, u64)> {
        let on_source: HashSet<RowId> = self
            .source
            .fetch_rows(table, ids)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();
        let missing: Vec<RowId> = ids
            .iter()
            .copied()
            .filter(|id| !on_source.contains(id))
            .collect();

        let mut restored = 0;
        if !missing.is_empty() {
            let rows = self.target.fetch_rows(table, &missing).await?;
            restored = self.source.insert_rows(table, &rows).await?.len() as u64;
            debug!(migration_id = %self.id, table, restored, "Restored rows to source");
        }

        let deleted = self.target.delete_rows(table, ids).await?;
        Ok((restored, deleted))
    }

    /// Apply a live write for the migrating shard
    ///
    /// While the migration runs, the write goes to both shards, leader
    /// first. Before start and after a rollback it goes to the source only;
    /// after completion, to the target only.
    pub async fn write(&self, table: &str, rows: &[Row]) -> Result<()> {
        let _shared = self.writers.read().await;
        let (state, dual_write_active) = {
            let inner = self.inner.read();
            (inner.state, inner.dual_write_active)
        };

        if dual_write_active {
            let inserted = self.dual_write.write_both(table, rows).await?;
            self.record_inserted(table, inserted);
            return Ok(());
        }

        let destination = match state {
            MigrationState::Completed => &self.target,
            _ => &self.source,
        };
        destination.insert_rows(table, rows).await?;
        Ok(())
    }

    fn complete(&self) -> Result<()> {
        let progress = {
            let mut inner = self.inner.write();
            if inner.state != MigrationState::Running {
                // Cancelled between the last batch and here
                return Err(Error::Cancelled);
            }
            inner.settle(MigrationState::Completed, "completed")?;
            inner.progress()
        };

        info!(
            migration_id = %self.id,
            migrated = progress.migrated_records,
            verified = progress.verified_records,
            elapsed_ms = progress.elapsed.as_millis() as u64,
            "Shard migration completed"
        );
        Ok(())
    }

    /// Settle the state after a failed run and hand the error back
    async fn abort(&self, err: Error) -> Error {
        if self.cancel.is_cancelled() {
            // cancel() or rollback() already moved the state
            info!(migration_id = %self.id, "Shard migration stopped: {}", err);
            return err;
        }

        error!(migration_id = %self.id, "Shard migration failed: {}", err);

        if self.config.rollback_on_error {
            if let Err(e) = self.roll_back(&CancellationToken::new(), "failed").await {
                warn!(migration_id = %self.id, "Automatic rollback failed: {}", e);
            }
        } else {
            {
                let mut inner = self.inner.write();
                if let Err(e) = inner.settle(MigrationState::RolledBack, "failed") {
                    debug!(migration_id = %self.id, "State already settled: {}", e);
                }
            }
            self.cancel.cancel();
            warn!(
                migration_id = %self.id,
                "Migration stopped without rollback, copied rows remain on the target shard"
            );
        }
        err
    }

    async fn run(&self, ctx: &CancellationToken) -> Result<()> {
        self.set_phase(MigrationPhase::Initializing);
        info!(migration_id = %self.id, "Phase 1/4: Initializing dual-write");
        self.source.ping().await?;
        self.target.ping().await?;

        let tables = self.source.list_tables().await?;
        let mut total = 0u64;
        for table in &tables {
            total += self.source.count_rows(table).await?;
        }
        self.inner.write().total_records = total as i64;
        info!(
            migration_id = %self.id,
            tables = tables.len(),
            total_records = total,
            "Phase 1/4 complete: dual-write active"
        );

        self.set_phase(MigrationPhase::Copying);
        info!(migration_id = %self.id, "Phase 2/4: Copying rows");
        for table in &tables {
            self.copy_table(ctx, table).await?;
        }

        if self.config.verify_all {
            self.set_phase(MigrationPhase::Verifying);
            info!(migration_id = %self.id, "Phase 3/4: Verifying row counts");
            for table in &tables {
                self.verify_counts(table).await?;
            }
        }

        self.set_phase(MigrationPhase::Cutover);
        info!(migration_id = %self.id, "Phase 4/4: Cutover to target shard");
        Ok(())
    }

    async fn copy_table(&self, ctx: &CancellationToken, table: &str) -> Result<()> {
        let batch_size = self.config.effective_batch_size();
        let mut cursor: Option<RowId> = None;
        let mut copied = 0usize;

        loop {
            if ctx.is_cancelled() || self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let batch_started = Instant::now();
            let rows = self.source.fetch_batch(table, cursor, batch_size).await?;
            let Some(last) = rows.last() else {
                break;
            };
            cursor = Some(last.id);

            {
                let _shared = self.writers.read().await;
                if self.state() != MigrationState::Running {
                    return Err(Error::Cancelled);
                }
                let inserted = self.target.insert_rows(table, &rows).await?;
                self.record_inserted(table, inserted);
            }

            if self.config.verify_all {
                self.verify_batch(table, &rows).await?;
            }

            {
                let mut inner = self.inner.write();
                inner.migrated_records += rows.len() as i64;
                if self.config.verify_all {
                    inner.verified_records += rows.len() as i64;
                }
            }
            copied += rows.len();
            telemetry::record_migration_batch(
                table,
                rows.len() as u64,
                batch_started.elapsed().as_secs_f64(),
            );
            debug!(
                migration_id = %self.id,
                table,
                batch = rows.len(),
                cursor = ?cursor,
                "Copied batch"
            );

            if rows.len() < batch_size {
                break;
            }
        }

        info!(migration_id = %self.id, table, rows = copied, "Table copied");
        Ok(())
    }

    async fn verify_batch(&self, table: &str, rows: &[Row]) -> Result<()> {
        let ids: Vec<RowId> = rows.iter().map(|row| row.id).collect();
        let copies: HashMap<RowId, Row> = self
            .target
            .fetch_rows(table, &ids)
            .await?
            .into_iter()
            .map(|row| (row.id, row))
            .collect();

        let mismatched: Vec<RowId> = rows
            .iter()
            .filter(|row| copies.get(&row.id) != Some(*row))
            .map(|row| row.id)
            .collect();

        if let Some(first) = mismatched.first() {
            self.inner.write().failed_records += mismatched.len() as i64;
            return Err(Error::VerificationMismatch {
                table: table.to_string(),
                detail: format!(
                    "{} of {} rows differ on target, first at id {}",
                    mismatched.len(),
                    rows.len(),
                    first
                ),
            });
        }
        Ok(())
    }

    async fn verify_counts(&self, table: &str) -> Result<()> {
        let source = self.source.count_rows(table).await?;
        let target = self.target.count_rows(table).await?;
        if target < source {
            return Err(Error::VerificationMismatch {
                table: table.to_string(),
                detail: format!("source has {} rows, target has {}", source, target),
            });
        }
        debug!(migration_id = %self.id, table, rows = source, "Row count verified");
        Ok(())
    }

    fn record_inserted(&self, table: &str, ids: Vec<RowId>) {
        // A shard migrating into itself only ever holds source rows
        if ids.is_empty() || self.config.source_shard_id == self.config.target_shard_id {
            return;
        }
        self.inserted
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend(ids);
    }

    fn set_phase(&self, phase: MigrationPhase) {
        let mut inner = self.inner.write();
        if inner.state == MigrationState::Running {
            inner.phase = phase;
        }
    }
}

impl std::fmt::Debug for ShardMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMigration")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
