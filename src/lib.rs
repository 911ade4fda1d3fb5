//! # shardwarden
//!
//! Health monitoring and online migration for a horizontally sharded
//! relational store.
//!
//! ## Components
//!
//! - **Shard Router**: owns the fixed set of shard connections and runs
//!   queries against a given shard
//! - **Health Checker**: probes every shard on an interval, keeps rolling
//!   per-shard query metrics, and classifies each shard as healthy, degraded
//!   or unhealthy
//! - **Shard Migration**: copies one shard's rows into another in keyed
//!   batches while live writes are mirrored to both, with cancel and rollback
//!
//! The SQL execution layer is abstracted behind
//! [`sharding::ShardConnection`]; [`sharding::MemoryShard`] backs
//! development mode and tests.

pub mod config;
pub mod sharding;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::{ComponentFactory, HealthConfig, ShardingConfig};
    pub use crate::sharding::{
        DualWriteLeader, HealthChecker, HealthStatus, MemoryShard, MigrationConfig,
        MigrationProgress, MigrationState, Row, ShardConnection, ShardHealth, ShardId,
        ShardMetricsExporter, ShardMigration, ShardRouter,
    };
    pub use crate::{Error, Result};
}
