//! Per-shard query metrics with a bucketed QPS window

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default span of the QPS window
pub const DEFAULT_QPS_WINDOW: Duration = Duration::from_secs(60);

/// Width of one QPS bucket
const BUCKET_WIDTH: Duration = Duration::from_secs(1);

/// Point-in-time view of a shard's query metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardMetricsSnapshot {
    pub total_queries: i64,
    pub failed_queries: i64,
    /// Computed from the counters at read time, `0.0` when no queries were recorded
    pub error_rate: f64,
    /// Throughput over the recent window, not the lifetime average
    pub qps: f64,
    pub avg_latency: Duration,
    pub max_latency: Duration,
    pub min_latency: Duration,
    pub last_reset_time: DateTime<Utc>,
}

/// Rolling query counters for one shard
#[derive(Debug, Clone)]
pub struct MetricsWindow {
    total_queries: u64,
    failed_queries: u64,
    total_latency: Duration,
    max_latency: Duration,
    min_latency: Option<Duration>,
    reset_at: Instant,
    reset_time: DateTime<Utc>,
    /// (bucket index since `reset_at`, queries in bucket)
    buckets: VecDeque<(u64, u64)>,
    window: Duration,
}

impl MetricsWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            total_queries: 0,
            failed_queries: 0,
            total_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            min_latency: None,
            reset_at: Instant::now(),
            reset_time: Utc::now(),
            buckets: VecDeque::new(),
            window: window.max(BUCKET_WIDTH),
        }
    }

    /// Fold one completed query into the counters
    pub fn record(&mut self, latency: Duration, failed: bool) {
        self.record_at(Instant::now(), latency, failed);
    }

    fn record_at(&mut self, now: Instant, latency: Duration, failed: bool) {
        self.total_queries += 1;
        if failed {
            self.failed_queries += 1;
        }
        self.total_latency = self.total_latency.saturating_add(latency);
        self.max_latency = self.max_latency.max(latency);
        self.min_latency = Some(self.min_latency.map_or(latency, |m| m.min(latency)));

        let bucket = self.bucket_index(now);
        match self.buckets.back_mut() {
            Some((index, count)) if *index == bucket => *count += 1,
            _ => self.buckets.push_back((bucket, 1)),
        }
        self.prune(bucket);
    }

    /// Zero every counter and restart the QPS window
    pub fn reset(&mut self) {
        *self = Self::new(self.window);
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.failed_queries as f64 / self.total_queries as f64
    }

    /// Queries per second over the recent window
    pub fn qps(&self) -> f64 {
        self.qps_at(Instant::now())
    }

    fn qps_at(&self, now: Instant) -> f64 {
        let current = self.bucket_index(now);
        let window_buckets = self.window_buckets();
        let recent: u64 = self
            .buckets
            .iter()
            .filter(|(index, _)| current.saturating_sub(*index) < window_buckets)
            .map(|(_, count)| count)
            .sum();

        // Until a full window has elapsed since reset, divide by the time observed
        let span = now.saturating_duration_since(self.reset_at).min(self.window);
        if span.is_zero() {
            return 0.0;
        }
        recent as f64 / span.as_secs_f64()
    }

    pub fn snapshot(&self) -> ShardMetricsSnapshot {
        let avg_latency = match self.total_latency.as_nanos().checked_div(self.total_queries as u128) {
            Some(nanos) => Duration::from_nanos(nanos.min(u64::MAX as u128) as u64),
            None => Duration::ZERO,
        };
        ShardMetricsSnapshot {
            total_queries: self.total_queries as i64,
            failed_queries: self.failed_queries as i64,
            error_rate: self.error_rate(),
            qps: self.qps(),
            avg_latency,
            max_latency: self.max_latency,
            min_latency: self.min_latency.unwrap_or(Duration::ZERO),
            last_reset_time: self.reset_time,
        }
    }

    fn bucket_index(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.reset_at).as_millis() / BUCKET_WIDTH.as_millis()) as u64
    }

    fn window_buckets(&self) -> u64 {
        (self.window.as_millis() / BUCKET_WIDTH.as_millis()) as u64
    }

    fn prune(&mut self, current: u64) {
        let window_buckets = self.window_buckets();
        while let Some((index, _)) = self.buckets.front() {
            if current.saturating_sub(*index) >= window_buckets {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for MetricsWindow {
    fn default() -> Self {
        Self::new(DEFAULT_QPS_WINDOW)
    }
}
