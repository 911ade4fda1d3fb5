//! Periodic shard health probing and classification
//!
//! A [`HealthChecker`] probes every shard of a [`ShardRouter`] on a fixed
//! interval and classifies each one against [`HealthThresholds`]. Readers
//! never wait on a probe: each shard's latest [`ShardHealth`] sits behind its
//! own lock and is replaced whole once the probe finishes.
//!
//! Query paths feed per-shard [`MetricsWindow`]s through
//! [`HealthChecker::record_query`]; the error rate and QPS from those windows
//! are folded into the next classification.

use super::metrics::{MetricsWindow, ShardMetricsSnapshot};
use super::router::{ShardHandle, ShardRouter};
use super::telemetry;
use super::ShardId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default upper bound on a single probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `stop` waits for the loop to exit before aborting it
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Health classification of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Numeric encoding used by gauge exports
    pub fn gauge_value(&self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one shard's health, produced by a single probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardHealth {
    pub shard_id: ShardId,
    pub status: HealthStatus,
    /// Round-trip time of the liveness probe
    pub latency: Duration,
    pub last_error: Option<String>,
    pub replication_lag: Option<Duration>,
    /// `None` until the shard has been probed once
    pub last_check_time: Option<DateTime<Utc>>,
    pub message: String,
    pub is_reachable: bool,
    pub queries_per_second: f64,
    pub error_rate: f64,
    pub database_size: u64,
    pub record_count: u64,
}

impl ShardHealth {
    /// Placeholder for a shard that has not been probed
    pub fn unknown(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            status: HealthStatus::Unknown,
            latency: Duration::ZERO,
            last_error: None,
            replication_lag: None,
            last_check_time: None,
            message: "Not checked yet".to_string(),
            is_reachable: false,
            queries_per_second: 0.0,
            error_rate: 0.0,
            database_size: 0,
            record_count: 0,
        }
    }

    fn unreachable(shard_id: ShardId, latency: Duration, message: String, error: Option<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency,
            last_error: error,
            last_check_time: Some(Utc::now()),
            message,
            ..Self::unknown(shard_id)
        }
    }
}

/// Classification thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub degraded_latency: Duration,
    pub unhealthy_latency: Duration,
    /// Fraction of failed queries, in `[0, 1]`
    pub max_error_rate: f64,
    pub max_replication_lag: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_latency: Duration::from_millis(500),
            unhealthy_latency: Duration::from_secs(2),
            max_error_rate: 0.05,
            max_replication_lag: Duration::from_secs(10),
        }
    }
}

impl HealthThresholds {
    /// Classify a successful probe
    ///
    /// Any unhealthy breach wins over a degraded one.
    pub fn classify(
        &self,
        latency: Duration,
        error_rate: f64,
        replication_lag: Option<Duration>,
    ) -> (HealthStatus, String) {
        if latency > self.unhealthy_latency {
            return (
                HealthStatus::Unhealthy,
                format!("Response time too high: {:?}", latency),
            );
        }
        if error_rate > self.max_error_rate {
            return (
                HealthStatus::Unhealthy,
                format!("Error rate high: {:.2}%", error_rate * 100.0),
            );
        }
        if let Some(lag) = replication_lag {
            if lag > self.max_replication_lag {
                return (
                    HealthStatus::Unhealthy,
                    format!("Replication lag too high: {:?}", lag),
                );
            }
        }
        if latency > self.degraded_latency {
            return (
                HealthStatus::Degraded,
                format!("Response time degraded: {:?}", latency),
            );
        }
        (HealthStatus::Healthy, "Shard is healthy".to_string())
    }
}

/// Aggregate view over all shards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total_shards: usize,
    pub healthy_shards: usize,
    pub degraded_shards: usize,
    pub unhealthy_shards: usize,
    pub unknown_shards: usize,
    pub average_latency: Duration,
    /// True when no shard is unhealthy
    pub system_healthy: bool,
    /// Most recent probe across all shards
    pub last_check_time: Option<DateTime<Utc>>,
}

struct Shared {
    router: Arc<ShardRouter>,
    interval: Duration,
    probe_timeout: Duration,
    thresholds: RwLock<HealthThresholds>,
    health: Vec<RwLock<Arc<ShardHealth>>>,
    metrics: Vec<Mutex<MetricsWindow>>,
}

struct LoopHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

/// Background health monitor for a fixed shard topology
pub struct HealthChecker {
    shared: Arc<Shared>,
    task: Mutex<Option<LoopHandle>>,
}

impl HealthChecker {
    /// Create a stopped checker probing every `interval`
    pub fn new(router: Arc<ShardRouter>, interval: Duration) -> Self {
        let shards = router.shard_count();
        let shared = Shared {
            router,
            interval: interval.max(Duration::from_millis(1)),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            thresholds: RwLock::new(HealthThresholds::default()),
            health: (0..shards)
                .map(|id| RwLock::new(Arc::new(ShardHealth::unknown(id))))
                .collect(),
            metrics: (0..shards)
                .map(|_| Mutex::new(MetricsWindow::default()))
                .collect(),
        };
        Self {
            shared: Arc::new(shared),
            task: Mutex::new(None),
        }
    }

    /// Bound each probe by `timeout` instead of the default
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.probe_timeout = timeout;
        }
        self
    }

    pub fn shard_count(&self) -> usize {
        self.shared.health.len()
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Launch the background probe loop on the current tokio runtime
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("health checker needs a tokio runtime: {}", e)))?;

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.join.is_finished()) {
            warn!("Health checker already running");
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let join = runtime.spawn(run_loop(Arc::clone(&self.shared), shutdown.clone()));
        *task = Some(LoopHandle { shutdown, join });

        info!(
            shards = self.shard_count(),
            interval_ms = self.shared.interval.as_millis() as u64,
            "Health checker started"
        );
        Ok(())
    }

    /// Stop the probe loop and wait for it to exit
    ///
    /// An in-flight probe round is abandoned. Safe to call when not running.
    pub async fn stop(&self) {
        let Some(LoopHandle { shutdown, mut join }) = self.task.lock().take() else {
            return;
        };
        shutdown.cancel();

        if tokio::time::timeout(STOP_GRACE, &mut join).await.is_err() {
            warn!("Health check loop did not stop within {:?}, aborting", STOP_GRACE);
            join.abort();
        }
        info!("Health checker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.join.is_finished())
    }

    /// Probe every shard once, outside the regular schedule
    pub async fn check_now(&self) {
        self.shared.check_all().await;
    }

    /// Latest health of one shard
    ///
    /// Ids outside the topology yield an `unknown` snapshot.
    pub fn shard_health(&self, shard_id: ShardId) -> Arc<ShardHealth> {
        match self.shared.health.get(shard_id) {
            Some(slot) => Arc::clone(&slot.read()),
            None => Arc::new(ShardHealth {
                message: "Shard not found".to_string(),
                ..ShardHealth::unknown(shard_id)
            }),
        }
    }

    /// Latest health of every shard, ordered by shard id
    pub fn all_health(&self) -> Vec<ShardHealth> {
        self.shared
            .health
            .iter()
            .map(|slot| ShardHealth::clone(&slot.read()))
            .collect()
    }

    pub fn health_summary(&self) -> HealthSummary {
        let mut summary = HealthSummary {
            total_shards: self.shard_count(),
            healthy_shards: 0,
            degraded_shards: 0,
            unhealthy_shards: 0,
            unknown_shards: 0,
            average_latency: Duration::ZERO,
            system_healthy: true,
            last_check_time: None,
        };

        let mut total_latency = Duration::ZERO;
        for health in self.all_health() {
            total_latency = total_latency.saturating_add(health.latency);
            match health.status {
                HealthStatus::Healthy => summary.healthy_shards += 1,
                HealthStatus::Degraded => summary.degraded_shards += 1,
                HealthStatus::Unhealthy => summary.unhealthy_shards += 1,
                HealthStatus::Unknown => summary.unknown_shards += 1,
            }
            summary.last_check_time = summary.last_check_time.max(health.last_check_time);
        }

        if summary.total_shards > 0 {
            summary.average_latency = total_latency / summary.total_shards as u32;
        }
        summary.system_healthy = summary.unhealthy_shards == 0;
        summary
    }

    /// Record a completed query against a shard
    ///
    /// Unknown shard ids are ignored.
    pub fn record_query(&self, shard_id: ShardId, duration: Duration, error: Option<&Error>) {
        let Some(window) = self.shared.metrics.get(shard_id) else {
            return;
        };
        window.lock().record(duration, error.is_some());

        if let Some(e) = error {
            debug!(shard_id, "Query failed: {}", e);
        }
        telemetry::record_query(shard_id, duration.as_secs_f64(), error.is_some());
    }

    /// Current query metrics of a shard
    pub fn metrics(&self, shard_id: ShardId) -> Option<ShardMetricsSnapshot> {
        self.shared
            .metrics
            .get(shard_id)
            .map(|window| window.lock().snapshot())
    }

    /// Zero one shard's query metrics
    ///
    /// The shard's health keeps its current status until the next probe.
    pub fn reset_metrics(&self, shard_id: ShardId) {
        if let Some(window) = self.shared.metrics.get(shard_id) {
            window.lock().reset();
            info!(shard_id, "Reset shard metrics");
        }
    }

    /// Replace the classification thresholds from the next probe round on
    pub fn set_health_thresholds(
        &self,
        degraded_latency: Duration,
        unhealthy_latency: Duration,
        max_error_rate: f64,
        max_replication_lag: Duration,
    ) {
        let thresholds = HealthThresholds {
            degraded_latency,
            unhealthy_latency,
            max_error_rate,
            max_replication_lag,
        };
        *self.shared.thresholds.write() = thresholds;
        info!(?thresholds, "Updated health thresholds");
    }

    pub fn thresholds(&self) -> HealthThresholds {
        *self.shared.thresholds.read()
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.shutdown.cancel();
        }
    }
}

async fn run_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(shared.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = shared.check_all() => {}
                }
            }
        }
    }
    debug!("Health check loop exited");
}

impl Shared {
    async fn check_all(&self) {
        let thresholds = *self.thresholds.read();
        let probes = self
            .router
            .handles()
            .iter()
            .map(|handle| self.check_shard(handle, thresholds));
        futures::future::join_all(probes).await;
    }

    async fn check_shard(&self, handle: &ShardHandle, thresholds: HealthThresholds) {
        let shard_id = handle.id();
        let health = self.probe(handle, thresholds).await;
        telemetry::record_probe(shard_id, health.status.as_str(), health.latency.as_secs_f64());

        let Some(slot) = self.health.get(shard_id) else {
            return;
        };
        let current = Arc::new(health);
        let previous = std::mem::replace(&mut *slot.write(), Arc::clone(&current));

        if previous.status != current.status {
            match current.status {
                HealthStatus::Healthy => info!(
                    shard_id,
                    from = %previous.status,
                    "Shard is healthy"
                ),
                _ => warn!(
                    shard_id,
                    from = %previous.status,
                    to = %current.status,
                    message = %current.message,
                    "Shard health changed"
                ),
            }
        }
    }

    async fn probe(&self, handle: &ShardHandle, thresholds: HealthThresholds) -> ShardHealth {
        let shard_id = handle.id();
        let started = Instant::now();
        let ping = tokio::time::timeout(
            self.probe_timeout,
            handle.execute(|conn| async move { conn.ping().await }),
        )
        .await;
        let latency = started.elapsed();

        match ping {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return ShardHealth::unreachable(
                    shard_id,
                    latency,
                    format!("Ping failed: {}", e),
                    Some(e.to_string()),
                );
            }
            Err(_) => {
                return ShardHealth::unreachable(
                    shard_id,
                    latency,
                    format!("Probe timed out after {:?}", self.probe_timeout),
                    Some(Error::Timeout.to_string()),
                );
            }
        }

        // Replication lag and stats are best-effort
        let conn = handle.connection();
        let replication_lag = match tokio::time::timeout(self.probe_timeout, conn.replication_lag()).await {
            Ok(Ok(lag)) => lag,
            Ok(Err(e)) => {
                debug!(shard_id, "Replication lag unavailable: {}", e);
                None
            }
            Err(_) => None,
        };
        let stats = match tokio::time::timeout(self.probe_timeout, conn.stats()).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                debug!(shard_id, "Shard stats unavailable: {}", e);
                Default::default()
            }
            Err(_) => Default::default(),
        };

        let (error_rate, queries_per_second) = match self.metrics.get(shard_id) {
            Some(window) => {
                let window = window.lock();
                (window.error_rate(), window.qps())
            }
            None => (0.0, 0.0),
        };

        let (status, message) = thresholds.classify(latency, error_rate, replication_lag);
        ShardHealth {
            shard_id,
            status,
            latency,
            last_error: None,
            replication_lag,
            last_check_time: Some(Utc::now()),
            message,
            is_reachable: true,
            queries_per_second,
            error_rate,
            database_size: stats.database_size,
            record_count: stats.record_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_healthy() {
        let t = HealthThresholds::default();
        let (status, _) = t.classify(Duration::from_millis(10), 0.0, None);
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn test_classify_latency_bands() {
        let t = HealthThresholds::default();
        assert_eq!(
            t.classify(Duration::from_millis(700), 0.0, None).0,
            HealthStatus::Degraded
        );
        assert_eq!(
            t.classify(Duration::from_secs(3), 0.0, None).0,
            HealthStatus::Unhealthy
        );
        // Exactly on the threshold is not a breach
        assert_eq!(
            t.classify(Duration::from_millis(500), 0.0, None).0,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_classify_error_rate_and_lag_are_unhealthy() {
        let t = HealthThresholds::default();
        assert_eq!(
            t.classify(Duration::from_millis(10), 0.2, None).0,
            HealthStatus::Unhealthy
        );
        assert_eq!(
            t.classify(Duration::from_millis(10), 0.0, Some(Duration::from_secs(30))).0,
            HealthStatus::Unhealthy
        );
        // Unhealthy breach wins over a degraded latency
        assert_eq!(
            t.classify(Duration::from_millis(700), 0.5, None).0,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let value = serde_json::to_value(HealthStatus::Unhealthy).unwrap();
        assert_eq!(value, serde_json::json!("unhealthy"));
        assert_eq!(HealthStatus::Unknown.gauge_value(), 0);
    }

    #[test]
    fn test_unknown_snapshot_is_well_formed() {
        let health = ShardHealth::unknown(7);
        assert_eq!(health.shard_id, 7);
        assert_eq!(health.status, HealthStatus::Unknown);
        assert!(health.last_check_time.is_none());
        assert!(!health.is_reachable);
    }
}
