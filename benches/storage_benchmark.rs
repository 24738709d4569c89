//! Storage layer performance benchmarks.
//!
//! Run with: `cargo bench --bench storage_benchmark`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use emds::scheme::BytesScheme;
use emds::{Config, PersistentMap, PersistentSequence};
use tempfile::tempdir;

fn key(i: u64) -> Vec<u8> {
    i.to_le_bytes().to_vec()
}

/// Benchmark map insertion throughput, including occasional rehashes.
fn bench_map_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_insert");

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("keys", count), count, |b, &count| {
            b.iter(|| {
                let dir = tempdir().unwrap();
                let config = Config::defaults();
                let mut map = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap();
                for i in 0..count {
                    map.set(&key(i), &key(i)).unwrap();
                }
                black_box(map.len())
            });
        });
    }

    group.finish();
}

/// Benchmark map lookup latency against a pre-populated table.
fn bench_map_get(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let config = Config::defaults();
    let mut map = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap();
    for i in 0..10_000u64 {
        map.set(&key(i), &key(i)).unwrap();
    }

    c.bench_function("map_get_hit", |b| {
        b.iter(|| black_box(map.get(&key(5_000)).unwrap()));
    });
}

/// Benchmark sequence append throughput, including capacity growth.
fn bench_sequence_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_append");

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("values", count), count, |b, &count| {
            b.iter(|| {
                let dir = tempdir().unwrap();
                let config = Config::defaults();
                let mut seq = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap();
                for i in 0..count {
                    seq.append(&key(i)).unwrap();
                }
                black_box(seq.len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_map_insert, bench_map_get, bench_sequence_append);
criterion_main!(benches);
