//! Environment-based configuration and component factory
//!
//! `ShardingConfig` reads the shard topology and health-check settings from
//! environment variables. `ComponentFactory` turns it into shard
//! connections, a router and a health checker, so binaries can switch
//! backends without code changes.

use crate::sharding::{HealthChecker, HealthThresholds, MemoryShard, ShardConnection, ShardRouter};
use crate::{Error, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shard storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardBackend {
    /// In-process shards, for development and tests
    Memory,
}

impl FromStr for ShardBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(ShardBackend::Memory),
            other => Err(Error::Config(format!(
                "Unknown SHARD_BACKEND: {}. Use 'memory'",
                other
            ))),
        }
    }
}

/// Health checker settings
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_millis(5000),
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Shard topology and monitoring configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ShardingConfig {
    pub backend: ShardBackend,
    pub shard_count: usize,
    pub health: HealthConfig,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            backend: ShardBackend::Memory,
            shard_count: 4,
            health: HealthConfig::default(),
        }
    }
}

impl ShardingConfig {
    /// Load configuration from the process environment
    ///
    /// Environment variables:
    /// - SHARD_BACKEND: "memory" (default)
    /// - SHARD_COUNT: number of shards (default: 4, at least 1)
    /// - HEALTH_CHECK_INTERVAL_SECS: probe interval (default: 30)
    /// - HEALTH_PROBE_TIMEOUT_MS: per-probe timeout (default: 5000)
    /// - HEALTH_DEGRADED_LATENCY_MS: degraded latency threshold (default: 500)
    /// - HEALTH_UNHEALTHY_LATENCY_MS: unhealthy latency threshold (default: 2000)
    /// - HEALTH_MAX_ERROR_RATE: error rate threshold in [0, 1] (default: 0.05)
    /// - HEALTH_MAX_REPLICATION_LAG_SECS: replication lag threshold (default: 10)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let backend = match lookup("SHARD_BACKEND") {
            Some(value) => value.parse()?,
            None => defaults.backend,
        };

        let shard_count: usize = parse_var(&lookup, "SHARD_COUNT", defaults.shard_count)?;
        if shard_count == 0 {
            return Err(Error::Config("SHARD_COUNT must be at least 1".to_string()));
        }

        let interval_secs: u64 = parse_var(&lookup, "HEALTH_CHECK_INTERVAL_SECS", 30)?;
        if interval_secs == 0 {
            return Err(Error::Config(
                "HEALTH_CHECK_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        let probe_timeout_ms: u64 = parse_var(&lookup, "HEALTH_PROBE_TIMEOUT_MS", 5000)?;
        let degraded_ms: u64 = parse_var(&lookup, "HEALTH_DEGRADED_LATENCY_MS", 500)?;
        let unhealthy_ms: u64 = parse_var(&lookup, "HEALTH_UNHEALTHY_LATENCY_MS", 2000)?;
        let max_error_rate: f64 = parse_var(&lookup, "HEALTH_MAX_ERROR_RATE", 0.05)?;
        let max_lag_secs: u64 = parse_var(&lookup, "HEALTH_MAX_REPLICATION_LAG_SECS", 10)?;

        if !(0.0..=1.0).contains(&max_error_rate) {
            return Err(Error::Config(format!(
                "HEALTH_MAX_ERROR_RATE must be within [0, 1], got {}",
                max_error_rate
            )));
        }
        if degraded_ms > unhealthy_ms {
            return Err(Error::Config(format!(
                "HEALTH_DEGRADED_LATENCY_MS ({}) exceeds HEALTH_UNHEALTHY_LATENCY_MS ({})",
                degraded_ms, unhealthy_ms
            )));
        }

        Ok(Self {
            backend,
            shard_count,
            health: HealthConfig {
                interval: Duration::from_secs(interval_secs),
                probe_timeout: Duration::from_millis(probe_timeout_ms),
                thresholds: HealthThresholds {
                    degraded_latency: Duration::from_millis(degraded_ms),
                    unhealthy_latency: Duration::from_millis(unhealthy_ms),
                    max_error_rate,
                    max_replication_lag: Duration::from_secs(max_lag_secs),
                },
            },
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {}={:?}: {}", name, raw, e))),
        None => Ok(default),
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// In-memory shards `0..count`
    pub fn create_memory_shards(count: usize) -> Vec<Arc<MemoryShard>> {
        (0..count).map(|id| Arc::new(MemoryShard::new(id))).collect()
    }

    /// Open one connection per configured shard
    pub fn create_connections(config: &ShardingConfig) -> Result<Vec<Arc<dyn ShardConnection>>> {
        match config.backend {
            ShardBackend::Memory => {
                info!(
                    "Using in-memory shards (development mode): count={}",
                    config.shard_count
                );
                Ok(Self::create_memory_shards(config.shard_count)
                    .into_iter()
                    .map(|shard| shard as Arc<dyn ShardConnection>)
                    .collect())
            }
        }
    }

    /// Build the shard router for the configured topology
    pub fn create_router(config: &ShardingConfig) -> Result<Arc<ShardRouter>> {
        let connections = Self::create_connections(config)?;
        Ok(Arc::new(ShardRouter::new(connections)?))
    }

    /// Build a stopped health checker with the configured thresholds
    pub fn create_health_checker(router: Arc<ShardRouter>, config: &HealthConfig) -> Arc<HealthChecker> {
        let checker = HealthChecker::new(router, config.interval).with_probe_timeout(config.probe_timeout);
        let t = config.thresholds;
        checker.set_health_thresholds(
            t.degraded_latency,
            t.unhealthy_latency,
            t.max_error_rate,
            t.max_replication_lag,
        );
        Arc::new(checker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ShardingConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ShardingConfig::default());
        assert_eq!(config.health.interval, Duration::from_secs(30));
        assert_eq!(config.health.thresholds.max_error_rate, 0.05);
    }

    #[test]
    fn test_overrides() {
        let config = ShardingConfig::from_lookup(lookup(&[
            ("SHARD_COUNT", "8"),
            ("HEALTH_CHECK_INTERVAL_SECS", "5"),
            ("HEALTH_DEGRADED_LATENCY_MS", "100"),
            ("HEALTH_UNHEALTHY_LATENCY_MS", "900"),
            ("HEALTH_MAX_ERROR_RATE", "0.1"),
        ]))
        .unwrap();

        assert_eq!(config.shard_count, 8);
        assert_eq!(config.health.interval, Duration::from_secs(5));
        assert_eq!(config.health.thresholds.degraded_latency, Duration::from_millis(100));
        assert_eq!(config.health.thresholds.unhealthy_latency, Duration::from_millis(900));
        assert_eq!(config.health.thresholds.max_error_rate, 0.1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for vars in [
            vec![("SHARD_COUNT", "0")],
            vec![("SHARD_COUNT", "four")],
            vec![("SHARD_BACKEND", "postgres")],
            vec![("HEALTH_MAX_ERROR_RATE", "1.5")],
            vec![("HEALTH_CHECK_INTERVAL_SECS", "0")],
            vec![
                ("HEALTH_DEGRADED_LATENCY_MS", "3000"),
                ("HEALTH_UNHEALTHY_LATENCY_MS", "1000"),
            ],
        ] {
            let result = ShardingConfig::from_lookup(lookup(&vars));
            assert!(matches!(result, Err(Error::Config(_))), "{:?}", vars);
        }
    }

    #[test]
    fn test_factory_builds_router() {
        let config = ShardingConfig {
            shard_count: 3,
            ..Default::default()
        };
        let router = ComponentFactory::create_router(&config).unwrap();
        assert_eq!(router.shard_count(), 3);

        let checker = ComponentFactory::create_health_checker(router, &config.health);
        assert_eq!(checker.shard_count(), 3);
        assert_eq!(checker.thresholds(), config.health.thresholds);
    }
}
