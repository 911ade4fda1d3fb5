//! Shard management core
//!
//! Health monitoring over a fixed shard topology and online migration of one
//! shard's rows into another while both stay readable and writable.

mod connection;
mod dual_write;
mod exporter;
mod health;
mod metrics;
mod migration;
mod router;
pub mod telemetry;

pub use connection::{FaultPlan, MemoryShard, ShardConnection, ShardStats};
pub use dual_write::DualWriteStats;
pub use exporter::ShardMetricsExporter;
pub use health::{HealthChecker, HealthStatus, HealthSummary, HealthThresholds, ShardHealth};
pub use metrics::{MetricsWindow, ShardMetricsSnapshot};
pub use migration::{
    DualWriteLeader, MigrationConfig, MigrationPhase, MigrationProgress, MigrationState,
    ShardMigration, DEFAULT_BATCH_SIZE,
};
pub use router::{ShardHandle, ShardRouter};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shard identifier, `0..N-1` for a topology of `N` shards
pub type ShardId = usize;

/// Primary key of a row within a table
pub type RowId = i64;

/// A single row as moved between shards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub columns: BTreeMap<String, serde_json::Value>,
}

impl Row {
    /// Create a row with no columns besides its key
    pub fn new(id: RowId) -> Self {
        Self {
            id,
            columns: BTreeMap::new(),
        }
    }

    /// Builder-style column setter
    pub fn with(mut self, column: &str, value: impl Into<serde_json::Value>) -> Self {
        self.columns.insert(column.to_string(), value.into());
        self
    }
}

/// Tables that make up a tenant's data on a restaurant shard
pub const DEFAULT_TABLES: &[&str] = &["orders", "order_items", "payments", "customers", "restaurants"];
