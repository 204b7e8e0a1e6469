//! Benchmark for VM selection over large pools
//!
//! Target: resolve a 5K VM pool against typical lists in well under 100ms

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vmbackup::selection::{validate, Inventory, Selections};

fn pool(size: usize) -> Inventory {
    (0..size)
        .map(|i| match i % 4 {
            0 => format!("web-{:05}", i),
            1 => format!("db-{:05}", i),
            2 => format!("test-{:05}", i),
            _ => format!("app {:05}", i),
        })
        .collect()
}

fn bench_literal_entries(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");
    let inventory = pool(5_000);
    let entries: Vec<String> = (0..200).map(|i| format!("web-{:05}:3", i * 4)).collect();

    group.throughput(Throughput::Elements(entries.len() as u64));
    group.bench_function("literal_entries", |b| {
        b.iter(|| validate("vm-exports", black_box(entries.as_slice()), inventory.clone()));
    });

    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");

    for size in [100usize, 1_000, 5_000] {
        let inventory = pool(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("resolve", size), &inventory, |b, inv| {
            b.iter(|| {
                Selections::resolve(
                    inv.clone(),
                    black_box(&["test-.*"]),
                    black_box(&["db-.*:2:xvda;xvdb"]),
                    black_box(&[".*"]),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_literal_entries, bench_resolve);
criterion_main!(benches);
