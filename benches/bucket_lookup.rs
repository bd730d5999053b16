//! Nearest-sample lookup benchmark
//!
//! Compares the bucketed index against the linear scan it replaces for
//! context enrichment. Both return identical matches; only the cost differs.
//!
//! ```bash
//! cargo bench --bench bucket_lookup
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sibscope::bucket_index::{LinearScan, NearestLookup, TimeBucketIndex};
use sibscope::record::SystemLoadSample;

const SERVICES: usize = 50;

fn samples(count: usize) -> Vec<SystemLoadSample> {
    (0..count)
        .map(|i| {
            SystemLoadSample::new(
                (i / SERVICES) as i64 * 30,
                format!("MS_{}", i % SERVICES),
                (i % 100) as f64 / 100.0,
                0.5,
            )
        })
        .collect()
}

fn queries(count: usize, span: i64) -> Vec<(String, i64)> {
    (0..count)
        .map(|i| (format!("MS_{}", (i * 7) % SERVICES), (i as i64 * 997) % span))
        .collect()
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("nearest_lookup");

    for &size in &[1_000usize, 10_000, 50_000] {
        let data = samples(size);
        let span = (size / SERVICES) as i64 * 30;
        let probes = queries(256, span.max(1));

        let index = TimeBucketIndex::build(data.clone(), 60, 5);
        group.bench_with_input(BenchmarkId::new("indexed", size), &probes, |b, probes| {
            b.iter(|| {
                for (service, ts) in probes {
                    black_box(index.lookup(service, *ts));
                }
            });
        });

        let scan = LinearScan::new(data, 60, 5);
        group.bench_with_input(BenchmarkId::new("linear_scan", size), &probes, |b, probes| {
            b.iter(|| {
                for (service, ts) in probes {
                    black_box(scan.lookup(service, *ts));
                }
            });
        });
    }

    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let data = samples(50_000);
    c.bench_function("index_build_50k", |b| {
        b.iter(|| TimeBucketIndex::build(black_box(data.clone()), 60, 5));
    });
}

criterion_group!(benches, bench_lookup, bench_build);
criterion_main!(benches);
