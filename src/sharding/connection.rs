//! Shard connection interface and the in-memory backend

use super::{Row, RowId, ShardId};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Size and volume statistics reported by a shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub database_size: u64,
    pub record_count: u64,
}

/// Connection to a single shard
///
/// This trait abstracts the SQL execution layer. The shard core only needs
/// liveness probes and keyed row batches; anything that can run a batched
/// read or write and report success or failure can back a shard.
#[async_trait]
pub trait ShardConnection: Send + Sync {
    /// Shard this connection points at
    fn shard_id(&self) -> ShardId;

    /// Cheap liveness probe
    async fn ping(&self) -> Result<()>;

    /// Replication lag of the shard's replicas, if the backend replicates
    async fn replication_lag(&self) -> Result<Option<Duration>>;

    /// Database size and total row count
    async fn stats(&self) -> Result<ShardStats>;

    /// Tables present on the shard, in a stable order
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Number of rows in a table
    async fn count_rows(&self, table: &str) -> Result<u64>;

    /// Up to `limit` rows with id greater than `after`, ordered by id
    async fn fetch_batch(&self, table: &str, after: Option<RowId>, limit: usize)
        -> Result<Vec<Row>>;

    /// Rows with the given ids; missing ids are skipped
    async fn fetch_rows(&self, table: &str, ids: &[RowId]) -> Result<Vec<Row>>;

    /// Insert rows whose id is not present yet; returns the ids actually inserted
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<Vec<RowId>>;

    /// Delete rows by id; returns the number deleted
    async fn delete_rows(&self, table: &str, ids: &[RowId]) -> Result<u64>;

    /// Release the connection. Subsequent calls fail with `ConnectionClosed`.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Faults injected into a [`MemoryShard`]
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Every operation fails as if the host were down
    pub unreachable: bool,
    /// Delay added to every operation
    pub latency: Duration,
    /// Reported replication lag
    pub replication_lag: Option<Duration>,
    /// Fail inserts once this many insert calls have succeeded
    pub fail_inserts_after: Option<u64>,
    /// Store inserted rows with an altered payload
    pub corrupt_inserts: bool,
}

/// In-memory shard for development mode and tests
///
/// Tables are created on first insert. Reads of an unknown table behave
/// like reads of an empty one.
#[derive(Debug)]
pub struct MemoryShard {
    shard_id: ShardId,
    tables: DashMap<String, BTreeMap<RowId, Row>>,
    faults: RwLock<FaultPlan>,
    closed: AtomicBool,
    insert_calls: AtomicU64,
}

impl MemoryShard {
    /// Create an empty shard
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            tables: DashMap::new(),
            faults: RwLock::new(FaultPlan::default()),
            closed: AtomicBool::new(false),
            insert_calls: AtomicU64::new(0),
        }
    }

    /// Load rows directly, bypassing fault injection
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut entry = self.tables.entry(table.to_string()).or_default();
        for row in rows {
            entry.insert(row.id, row);
        }
    }

    /// Row count without going through the async interface
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Snapshot of a row without going through the async interface
    pub fn row(&self, table: &str, id: RowId) -> Option<Row> {
        self.tables.get(table).and_then(|t| t.get(&id).cloned())
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        *self.faults.write() = plan;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.write().unreachable = unreachable;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.faults.write().latency = latency;
    }

    pub fn set_replication_lag(&self, lag: Option<Duration>) {
        self.faults.write().replication_lag = lag;
    }

    /// Common preamble for every operation: closed check, latency, reachability
    async fn enter(&self) -> Result<FaultPlan> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed(self.shard_id));
        }
        let plan = self.faults.read().clone();
        if !plan.latency.is_zero() {
            tokio::time::sleep(plan.latency).await;
        }
        if plan.unreachable {
            return Err(Error::ShardUnavailable {
                shard_id: self.shard_id,
                reason: "connection refused".to_string(),
            });
        }
        Ok(plan)
    }
}

#[async_trait]
impl ShardConnection for MemoryShard {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await.map(|_| ())
    }

    async fn replication_lag(&self) -> Result<Option<Duration>> {
        Ok(self.enter().await?.replication_lag)
    }

    async fn stats(&self) -> Result<ShardStats> {
        self.enter().await?;
        let mut stats = ShardStats::default();
        for table in self.tables.iter() {
            stats.record_count += table.len() as u64;
            for row in table.values() {
                // Approximate on-disk size by the serialized payload
                stats.database_size += serde_json::to_vec(row).map(|b| b.len() as u64)?;
            }
        }
        Ok(stats)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.enter().await?;
        let mut tables: Vec<String> = self.tables.iter().map(|t| t.key().clone()).collect();
        tables.sort();
        Ok(tables)
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        self.enter().await?;
        Ok(self.row_count(table) as u64)
    }

    async fn fetch_batch(
        &self,
        table: &str,
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.enter().await?;
        let Some(rows) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(rows
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn fetch_rows(&self, table: &str, ids: &[RowId]) -> Result<Vec<Row>> {
        self.enter().await?;
        let Some(rows) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<Vec<RowId>> {
        let plan = self.enter().await?;
        if let Some(limit) = plan.fail_inserts_after {
            if self.insert_calls.load(Ordering::Acquire) >= limit {
                return Err(Error::Query {
                    shard_id: self.shard_id,
                    message: format!("insert into {} rejected", table),
                });
            }
        }
        self.insert_calls.fetch_add(1, Ordering::AcqRel);

        let mut entry = self.tables.entry(table.to_string()).or_default();
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            if entry.contains_key(&row.id) {
                continue;
            }
            let mut stored = row.clone();
            if plan.corrupt_inserts {
                stored
                    .columns
                    .insert("_corrupted".to_string(), serde_json::Value::Bool(true));
            }
            entry.insert(row.id, stored);
            inserted.push(row.id);
        }
        Ok(inserted)
    }

    async fn delete_rows(&self, table: &str, ids: &[RowId]) -> Result<u64> {
        self.enter().await?;
        let Some(mut rows) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| rows.remove(*id).is_some()).count() as u64)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
