//! View engine benchmarks
//!
//! Measures report construction for the built-in view programs over
//! synthetic per-thread sample buckets.
//!
//! Run with: cargo bench --bench view_engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use perfex::experiment::SampleBucket;
use perfex::result::ResultValue;
use perfex::view::catalog::items_from_buckets;
use perfex::view::{find_view, NeverCancelled, ViewEngine};
use rand::{Rng, SeedableRng};

const SMALL_SIZE: usize = 1_000; // 1K functions
const MEDIUM_SIZE: usize = 100_000; // 100K functions
const THREADS: i64 = 8;

fn buckets(keys: usize) -> Vec<SampleBucket> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    (0..keys)
        .flat_map(|key| {
            let name = format!("function_{key}");
            (0..THREADS).map(move |thread| (name.clone(), thread))
        })
        .map(|(name, thread)| {
            let samples: u64 = rng.gen_range(1..10_000);
            SampleBucket {
                key: ResultValue::from(name),
                thread,
                seconds: samples as f64 * 0.01,
                samples,
            }
        })
        .collect()
}

/// Folding buckets into per-key temporaries
fn bench_items_from_buckets(c: &mut Criterion) {
    let mut group = c.benchmark_group("items_from_buckets");

    for size in [SMALL_SIZE, MEDIUM_SIZE] {
        let data = buckets(size);
        group.bench_with_input(BenchmarkId::new("fold", size), &data, |b, data| {
            b.iter(|| items_from_buckets(black_box(data)));
        });
    }

    group.finish();
}

/// Running each catalog program over prepared temporaries
fn bench_construct(c: &mut Criterion) {
    let mut group = c.benchmark_group("view_construct");

    for size in [SMALL_SIZE, MEDIUM_SIZE] {
        let (items, totals) = items_from_buckets(&buckets(size));
        for name in ["pcsamp", "loadbalance"] {
            let Some(view) = find_view(name) else {
                continue;
            };
            let engine = ViewEngine::new(view.program());
            group.bench_with_input(BenchmarkId::new(name, size), &items, |b, items| {
                b.iter(|| engine.construct(black_box(items), &totals, &NeverCancelled));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_items_from_buckets, bench_construct);
criterion_main!(benches);
