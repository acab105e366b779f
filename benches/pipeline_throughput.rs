//! Benchmarks for the hot paths: free-list churn, buffer transfer and
//! whole queries through the dispatcher
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stageflow::memory::{BlockPool, IndexFreeList};
use stageflow::pipeline::{
    tuple_buffer, AggregateFunction, AggregateOperator, AggregateSpec, AnyOperator, CmpOp,
    Dispatcher, DispatcherConfig, FilterOperator, MemoryTable, PacketDescriptor, PageSource,
    Predicate, ReadStatus, ResourceSet, ScanOperator, Tuple,
};
use std::sync::Arc;

fn bench_free_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("free_list");
    group.throughput(Throughput::Elements(1));

    let list = IndexFreeList::with_all_free(1024);
    group.bench_function("pop_push", |b| {
        b.iter(|| {
            let idx = list.pop().unwrap_or(0);
            list.push(black_box(idx));
        })
    });

    let pool = BlockPool::new(4096, 64).unwrap();
    group.bench_function("pool_checkout", |b| {
        b.iter(|| black_box(pool.checkout().unwrap()))
    });

    group.finish();
}

fn bench_buffer_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("tuple_buffer");
    const N: i64 = 100_000;
    group.throughput(Throughput::Elements(N as u64));

    for capacity in [16usize, 256, 4096] {
        group.bench_with_input(
            BenchmarkId::new("spsc", capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| {
                    let (tx, rx) = tuple_buffer(capacity).unwrap();
                    let producer = std::thread::spawn(move || {
                        for i in 0..N {
                            tx.write(Tuple::single(i)).unwrap();
                        }
                    });
                    let mut sum = 0i64;
                    while let ReadStatus::Tuple(t) = rx.read() {
                        sum += t.get(0).unwrap_or_default();
                    }
                    producer.join().unwrap();
                    black_box(sum)
                })
            },
        );
    }

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_filter_aggregate");
    group.sample_size(20);
    const ROWS: i64 = 100_000;
    group.throughput(Throughput::Elements(ROWS as u64));

    let table: Arc<dyn PageSource> = Arc::new(
        (0..ROWS)
            .map(|i| Tuple::pair(i % 32, i))
            .collect::<MemoryTable>(),
    );

    for workers in [1usize, 2, 4] {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            workers,
            resources: ResourceSet::new(16, 1024, 8),
            default_buffer_capacity: 256,
            ..DispatcherConfig::default()
        })
        .unwrap();

        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, _| {
            b.iter(|| {
                let desc = PacketDescriptor::new(AnyOperator::aggregate(AggregateOperator::new(
                    AggregateSpec::grouped(0, AggregateFunction::Sum, 1),
                )))
                .with_input(
                    PacketDescriptor::new(AnyOperator::filter(FilterOperator::new(
                        Predicate::new(1, CmpOp::Gt, ROWS / 2),
                    )))
                    .with_input(PacketDescriptor::new(AnyOperator::scan(ScanOperator::new(
                        Arc::clone(&table),
                    )))),
                );
                let handle = dispatcher.submit(desc).unwrap();
                black_box(handle.collect())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_free_list, bench_buffer_transfer, bench_query);
criterion_main!(benches);
