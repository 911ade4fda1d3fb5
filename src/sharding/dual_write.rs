//! Mirroring of live writes during a migration

use super::migration::DualWriteLeader;
use super::telemetry;
use super::{Row, RowId, ShardConnection};
use crate::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters of writes routed through a dual-write coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DualWriteStats {
    /// Writes accepted by the leader
    pub write_count: u64,
    /// Failed leader or follower writes
    pub error_count: u64,
}

/// Sends each write to the leader, then mirrors it to the follower
///
/// Owned by a single migration; whether it is consulted at all is decided by
/// the migration's state.
pub(crate) struct DualWriteCoordinator {
    leader: DualWriteLeader,
    source: Arc<dyn ShardConnection>,
    target: Arc<dyn ShardConnection>,
    write_count: AtomicU64,
    error_count: AtomicU64,
}

impl DualWriteCoordinator {
    pub(crate) fn new(
        leader: DualWriteLeader,
        source: Arc<dyn ShardConnection>,
        target: Arc<dyn ShardConnection>,
    ) -> Self {
        Self {
            leader,
            source,
            target,
            write_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// Write `rows` to both sides
    ///
    /// A leader failure is returned and nothing is mirrored. A follower
    /// failure is counted and logged only. Returns the ids that were newly
    /// inserted on the target shard.
    pub(crate) async fn write_both(&self, table: &str, rows: &[Row]) -> Result<Vec<RowId>> {
        let (leader, follower) = match self.leader {
            DualWriteLeader::Source => (&self.source, &self.target),
            DualWriteLeader::Target => (&self.target, &self.source),
        };

        let leader_inserted = match leader.insert_rows(table, rows).await {
            Ok(ids) => ids,
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                telemetry::record_dual_write("leader", "error");
                return Err(e);
            }
        };
        self.write_count.fetch_add(1, Ordering::Relaxed);
        telemetry::record_dual_write("leader", "ok");

        let follower_inserted = match follower.insert_rows(table, rows).await {
            Ok(ids) => {
                telemetry::record_dual_write("follower", "ok");
                ids
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                telemetry::record_dual_write("follower", "error");
                warn!(
                    table,
                    follower_shard = follower.shard_id(),
                    "Dual-write to follower failed: {}",
                    e
                );
                Vec::new()
            }
        };

        debug!(
            table,
            rows = rows.len(),
            leader_shard = leader.shard_id(),
            "Dual-write applied"
        );

        Ok(match self.leader {
            DualWriteLeader::Source => follower_inserted,
            DualWriteLeader::Target => leader_inserted,
        })
    }

    pub(crate) fn stats(&self) -> DualWriteStats {
        DualWriteStats {
            write_count: self.write_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{FaultPlan, MemoryShard};

    fn pair() -> (Arc<MemoryShard>, Arc<MemoryShard>) {
        (Arc::new(MemoryShard::new(0)), Arc::new(MemoryShard::new(1)))
    }

    #[tokio::test]
    async fn test_writes_reach_both_sides() {
        let (source, target) = pair();
        let coordinator =
            DualWriteCoordinator::new(DualWriteLeader::Source, source.clone(), target.clone());

        let inserted = coordinator
            .write_both("orders", &[Row::new(1), Row::new(2)])
            .await
            .unwrap();

        assert_eq!(inserted, vec![1, 2]);
        assert_eq!(source.row_count("orders"), 2);
        assert_eq!(target.row_count("orders"), 2);
        assert_eq!(
            coordinator.stats(),
            DualWriteStats {
                write_count: 1,
                error_count: 0
            }
        );
    }

    #[tokio::test]
    async fn test_leader_failure_is_returned() {
        let (source, target) = pair();
        source.set_unreachable(true);
        let coordinator =
            DualWriteCoordinator::new(DualWriteLeader::Source, source.clone(), target.clone());

        assert!(coordinator.write_both("orders", &[Row::new(1)]).await.is_err());
        assert_eq!(target.row_count("orders"), 0);
        assert_eq!(coordinator.stats().error_count, 1);
        assert_eq!(coordinator.stats().write_count, 0);
    }

    #[tokio::test]
    async fn test_follower_failure_is_absorbed() {
        let (source, target) = pair();
        target.set_faults(FaultPlan {
            fail_inserts_after: Some(0),
            ..Default::default()
        });
        let coordinator =
            DualWriteCoordinator::new(DualWriteLeader::Source, source.clone(), target.clone());

        let inserted = coordinator.write_both("orders", &[Row::new(1)]).await.unwrap();

        assert!(inserted.is_empty());
        assert_eq!(source.row_count("orders"), 1);
        assert_eq!(coordinator.stats().write_count, 1);
        assert_eq!(coordinator.stats().error_count, 1);
    }

    #[tokio::test]
    async fn test_target_leader_reports_target_ids() {
        let (source, target) = pair();
        source.seed("orders", vec![Row::new(1)]);
        let coordinator =
            DualWriteCoordinator::new(DualWriteLeader::Target, source.clone(), target.clone());

        let inserted = coordinator
            .write_both("orders", &[Row::new(1), Row::new(2)])
            .await
            .unwrap();

        assert_eq!(inserted, vec![1, 2]);
        assert_eq!(source.row_count("orders"), 2);
    }
}
