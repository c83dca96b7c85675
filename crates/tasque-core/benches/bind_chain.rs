use criterion::{criterion_group, criterion_main, Criterion};
use tasque_core::{Options, Task};
use tasque_runtime_std::{run_blocking, SyncExecutor};

fn deep_bind_chain(c: &mut Criterion) {
    let executor = SyncExecutor::new().into_ref();
    c.bench_function("bind_chain_10k", |b| {
        b.iter(|| {
            let chain = (0..10_000u64).fold(Task::pure(0u64), |acc, _| {
                acc.flat_map(|n| Task::pure(n + 1))
            });
            run_blocking(chain, &executor, Options::default()).unwrap()
        });
    });
}

fn fused_map_chain(c: &mut Criterion) {
    let executor = SyncExecutor::new().into_ref();
    c.bench_function("map_chain_1k", |b| {
        b.iter(|| {
            let chain = (0..1_000u64).fold(Task::pure(0u64), |acc, _| acc.map(|n| n + 1));
            run_blocking(chain, &executor, Options::default()).unwrap()
        });
    });
}

criterion_group!(benches, deep_bind_chain, fused_map_chain);
criterion_main!(benches);
