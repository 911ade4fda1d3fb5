//! Text and JSON exports of shard health, plus alert generation

use super::health::{HealthChecker, HealthStatus, ShardHealth};
use chrono::Utc;
use std::fmt::Write;
use std::sync::Arc;
use tracing::info;

/// Renders a [`HealthChecker`]'s current view for scraping and dashboards
pub struct ShardMetricsExporter {
    checker: Arc<HealthChecker>,
}

impl ShardMetricsExporter {
    pub fn new(checker: Arc<HealthChecker>) -> Self {
        Self { checker }
    }

    /// Prometheus text exposition of per-shard and system gauges
    pub fn export_prometheus(&self) -> String {
        let shards = self.checker.all_health();
        let summary = self.checker.health_summary();
        let mut out = String::new();

        per_shard(
            &mut out,
            "shard_health_status",
            "Shard health status (0=unknown, 1=healthy, 2=degraded, 3=unhealthy)",
            &shards,
            |h| h.status.gauge_value().to_string(),
        );
        per_shard(
            &mut out,
            "shard_response_time_ms",
            "Shard probe response time in milliseconds",
            &shards,
            |h| format!("{:.2}", h.latency.as_secs_f64() * 1000.0),
        );
        per_shard(
            &mut out,
            "shard_error_rate_percentage",
            "Shard query error rate in percent",
            &shards,
            |h| format!("{:.2}", h.error_rate * 100.0),
        );
        per_shard(
            &mut out,
            "shard_queries_per_second",
            "Shard queries per second over the recent window",
            &shards,
            |h| format!("{:.2}", h.queries_per_second),
        );
        per_shard(
            &mut out,
            "shard_database_size_bytes",
            "Shard database size in bytes",
            &shards,
            |h| h.database_size.to_string(),
        );
        per_shard(
            &mut out,
            "shard_record_count",
            "Total records in shard",
            &shards,
            |h| h.record_count.to_string(),
        );
        per_shard(
            &mut out,
            "shard_reachable",
            "Shard reachability (1=reachable, 0=unreachable)",
            &shards,
            |h| u8::from(h.is_reachable).to_string(),
        );

        system(&mut out, "system_shards_total", "Total number of shards", summary.total_shards);
        system(&mut out, "system_shards_healthy", "Number of healthy shards", summary.healthy_shards);
        system(&mut out, "system_shards_degraded", "Number of degraded shards", summary.degraded_shards);
        system(&mut out, "system_shards_unhealthy", "Number of unhealthy shards", summary.unhealthy_shards);
        system(&mut out, "system_shards_unknown", "Number of shards not yet probed", summary.unknown_shards);
        system(
            &mut out,
            "system_average_latency_ms",
            "Average probe latency across all shards",
            summary.average_latency.as_millis(),
        );
        system(
            &mut out,
            "system_health",
            "System health (1=no unhealthy shard, 0=otherwise)",
            u8::from(summary.system_healthy),
        );

        out
    }

    /// JSON document with a timestamp, the system summary and every shard
    pub fn export_json(&self) -> serde_json::Value {
        let shards: Vec<serde_json::Value> = self
            .checker
            .all_health()
            .iter()
            .map(|h| {
                serde_json::json!({
                    "shard_id": h.shard_id,
                    "status": h.status,
                    "response_time_ms": h.latency.as_secs_f64() * 1000.0,
                    "error_rate": h.error_rate,
                    "qps": h.queries_per_second,
                    "database_size": h.database_size,
                    "record_count": h.record_count,
                    "is_reachable": h.is_reachable,
                    "replication_lag_ms": h.replication_lag.map(|lag| lag.as_millis() as u64),
                    "message": h.message,
                    "last_check_time": h.last_check_time,
                })
            })
            .collect();

        serde_json::json!({
            "timestamp": Utc::now(),
            "system": self.checker.health_summary(),
            "shards": shards,
        })
    }

    /// Human-readable alerts for the current state, most severe first per shard
    pub fn generate_alerts(&self) -> Vec<String> {
        let mut alerts = Vec::new();

        for health in self.checker.all_health() {
            match health.status {
                HealthStatus::Unhealthy => alerts.push(format!(
                    "CRITICAL: Shard {} is unhealthy - {}",
                    health.shard_id, health.message
                )),
                HealthStatus::Degraded => alerts.push(format!(
                    "WARNING: Shard {} is degraded - {}",
                    health.shard_id, health.message
                )),
                HealthStatus::Healthy | HealthStatus::Unknown => {}
            }
            // Unprobed shards are unknown, not unreachable
            if health.last_check_time.is_some() && !health.is_reachable {
                alerts.push(format!("CRITICAL: Shard {} is unreachable", health.shard_id));
            }
        }

        let summary = self.checker.health_summary();
        if !summary.system_healthy {
            alerts.push(format!(
                "CRITICAL: System is not healthy - {} healthy, {} degraded, {} unhealthy",
                summary.healthy_shards, summary.degraded_shards, summary.unhealthy_shards
            ));
        }

        alerts
    }

    /// Write the current summary and per-shard state to the log
    pub fn log_metrics(&self) {
        let summary = self.checker.health_summary();
        info!(
            total_shards = summary.total_shards,
            healthy = summary.healthy_shards,
            degraded = summary.degraded_shards,
            unhealthy = summary.unhealthy_shards,
            unknown = summary.unknown_shards,
            average_latency_ms = summary.average_latency.as_millis() as u64,
            system_healthy = summary.system_healthy,
            "Shard health summary"
        );

        for health in self.checker.all_health() {
            info!(
                shard_id = health.shard_id,
                status = %health.status,
                latency_ms = health.latency.as_millis() as u64,
                error_rate_pct = health.error_rate * 100.0,
                qps = health.queries_per_second,
                "Shard metrics"
            );
        }
    }
}

fn per_shard(
    out: &mut String,
    name: &str,
    help: &str,
    shards: &[ShardHealth],
    value: impl Fn(&ShardHealth) -> String,
) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    for health in shards {
        let _ = writeln!(
            out,
            "{}{{shard_id=\"{}\"}} {}",
            name,
            health.shard_id,
            value(health)
        );
    }
    out.push('\n');
}

fn system(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
    out.push('\n');
}
