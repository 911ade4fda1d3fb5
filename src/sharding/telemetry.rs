//! Sharding telemetry instruments and recording helpers.

use super::ShardId;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct ShardingInstruments {
    health_probes: Counter<u64>,
    health_probe_duration_seconds: Histogram<f64>,
    queries: Counter<u64>,
    query_duration_seconds: Histogram<f64>,
    migration_batches: Counter<u64>,
    migration_rows: Counter<u64>,
    migration_batch_duration_seconds: Histogram<f64>,
    migration_outcomes: Counter<u64>,
    dual_write_outcomes: Counter<u64>,
}

fn instruments() -> &'static ShardingInstruments {
    static INSTRUMENTS: OnceLock<ShardingInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("shardwarden.sharding");
        ShardingInstruments {
            health_probes: meter
                .u64_counter("shardwarden.sharding.health.probes")
                .with_description("Shard health probes by resulting status")
                .init(),
            health_probe_duration_seconds: meter
                .f64_histogram("shardwarden.sharding.health.probe.duration")
                .with_description("Shard health probe duration")
                .with_unit("s")
                .init(),
            queries: meter
                .u64_counter("shardwarden.sharding.queries")
                .with_description("Queries recorded against shards by outcome")
                .init(),
            query_duration_seconds: meter
                .f64_histogram("shardwarden.sharding.query.duration")
                .with_description("Recorded shard query duration")
                .with_unit("s")
                .init(),
            migration_batches: meter
                .u64_counter("shardwarden.sharding.migration.batches")
                .with_description("Batches copied by shard migrations")
                .init(),
            migration_rows: meter
                .u64_counter("shardwarden.sharding.migration.rows")
                .with_description("Rows copied by shard migrations")
                .init(),
            migration_batch_duration_seconds: meter
                .f64_histogram("shardwarden.sharding.migration.batch.duration")
                .with_description("Migration batch copy duration")
                .with_unit("s")
                .init(),
            migration_outcomes: meter
                .u64_counter("shardwarden.sharding.migration.outcomes")
                .with_description("Shard migration terminal outcomes")
                .init(),
            dual_write_outcomes: meter
                .u64_counter("shardwarden.sharding.dual_write.outcomes")
                .with_description("Dual-write outcomes by side")
                .init(),
        }
    })
}

pub fn record_probe(shard_id: ShardId, status: &'static str, duration_seconds: f64) {
    let i = instruments();
    let attrs = [
        KeyValue::new("shard_id", shard_id as i64),
        KeyValue::new("status", status),
    ];
    i.health_probes.add(1, &attrs);
    i.health_probe_duration_seconds.record(duration_seconds, &attrs[..1]);
}

pub fn record_query(shard_id: ShardId, duration_seconds: f64, failed: bool) {
    let i = instruments();
    let outcome = if failed { "error" } else { "ok" };
    i.queries.add(
        1,
        &[
            KeyValue::new("shard_id", shard_id as i64),
            KeyValue::new("outcome", outcome),
        ],
    );
    i.query_duration_seconds
        .record(duration_seconds, &[KeyValue::new("shard_id", shard_id as i64)]);
}

pub fn record_migration_batch(table: &str, rows: u64, duration_seconds: f64) {
    let i = instruments();
    let attrs = [KeyValue::new("table", table.to_string())];
    i.migration_batches.add(1, &attrs);
    i.migration_rows.add(rows, &attrs);
    i.migration_batch_duration_seconds
        .record(duration_seconds, &attrs);
}

pub fn record_migration_outcome(outcome: &'static str) {
    instruments()
        .migration_outcomes
        .add(1, &[KeyValue::new("outcome", outcome)]);
}

pub fn record_dual_write(side: &'static str, outcome: &'static str) {
    instruments().dual_write_outcomes.add(
        1,
        &[
            KeyValue::new("side", side),
            KeyValue::new("outcome", outcome),
        ],
    );
}
