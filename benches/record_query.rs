//! Query metrics recording benchmark

use shardwarden::config::ComponentFactory;
use shardwarden::sharding::{HealthChecker, MetricsWindow, ShardConnection, ShardRouter};
use shardwarden::Error;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

fn create_checker(shards: usize) -> Arc<HealthChecker> {
    let connections = ComponentFactory::create_memory_shards(shards)
        .into_iter()
        .map(|shard| shard as Arc<dyn ShardConnection>)
        .collect();
    let router = Arc::new(ShardRouter::new(connections).unwrap());
    Arc::new(HealthChecker::new(router, Duration::from_secs(60)))
}

fn benchmark_window_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_record");
    group.throughput(Throughput::Elements(1));

    group.bench_function("success", |b| {
        let mut window = MetricsWindow::default();
        b.iter(|| window.record(black_box(Duration::from_micros(750)), false));
    });

    group.bench_function("failure", |b| {
        let mut window = MetricsWindow::default();
        b.iter(|| window.record(black_box(Duration::from_micros(750)), true));
    });

    group.finish();
}

fn benchmark_record_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_query");

    for shards in [4, 64] {
        let checker = create_checker(shards);
        let err = Error::Timeout;
        let mut i = 0usize;

        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("{}_shards", shards), |b| {
            b.iter(|| {
                i = i.wrapping_add(1);
                let error = (i % 20 == 0).then_some(&err);
                checker.record_query(black_box(i % shards), Duration::from_micros(500), error);
            });
        });
    }

    group.finish();
}

fn benchmark_metrics_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics_snapshot");

    let checker = create_checker(8);
    for i in 0..100_000 {
        checker.record_query(i % 8, Duration::from_micros(300 + (i as u64 % 700)), None);
    }

    group.bench_function("single_shard", |b| {
        b.iter(|| black_box(checker.metrics(black_box(3))));
    });

    group.bench_function("health_summary", |b| {
        b.iter(|| black_box(checker.health_summary()));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_window_record,
    benchmark_record_query,
    benchmark_metrics_snapshot,
);

criterion_main!(benches);
