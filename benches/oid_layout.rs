//! Benchmarks for object id generation, layout selection and put throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use s3gw::config::{GatewayConfig, IdMode, LayoutConfig};
use s3gw::core::layout::LayoutTable;
use s3gw::core::oid::IdAllocator;
use s3gw::{put_object, GatewayContext, InMemoryBackend, PutRequest, ShutdownSignal};
use std::sync::Arc;

fn benchmark_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("oid_generate");

    for mode in [IdMode::Deterministic, IdMode::Random] {
        let allocator = IdAllocator::new(mode, 20);
        group.bench_function(format!("{:?}", mode), |b| {
            b.iter(|| black_box(allocator.generate(black_box("/photos/2024/cat.jpg"))));
        });
    }

    group.finish();
}

fn benchmark_collision_retry(c: &mut Criterion) {
    let allocator = IdAllocator::new(IdMode::Deterministic, 20);
    let first = allocator.generate("/photos/cat.jpg");

    c.bench_function("oid_resolve_collision_chain", |b| {
        b.iter(|| {
            let mut retry = allocator.retry_sequence();
            let mut previous = first;
            for _ in 0..10 {
                previous = retry.next_id(&allocator, "/photos/cat.jpg", previous).unwrap();
            }
            black_box(previous)
        });
    });
}

fn benchmark_layout_select(c: &mut Criterion) {
    let table = LayoutTable::from_config(&LayoutConfig::default()).unwrap();
    let mut group = c.benchmark_group("layout_select");

    for size in [0u64, 4 * 1024, 1024 * 1024, 64 * 1024 * 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| black_box(table.select(black_box(size))));
        });
    }

    group.finish();
}

fn benchmark_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_object");
    group.sample_size(20);

    for size in [1024usize, 64 * 1024, 1024 * 1024].iter() {
        let backend = Arc::new(InMemoryBackend::new(4));
        let ctx = GatewayContext::new(GatewayConfig::default(), backend, ShutdownSignal::new()).unwrap();
        let body = vec![0xA5u8; *size];

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let outcome = put_object(&ctx, PutRequest::new("bench", "object", body.clone())).unwrap();
                black_box(outcome)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_generate,
    benchmark_collision_retry,
    benchmark_layout_select,
    benchmark_put
);
criterion_main!(benches);
