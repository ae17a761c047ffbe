//! Bookkeeping-path benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use memtrace_core::heap::SystemHeap;
use memtrace_core::pool::{BookkeepingAlloc, PoolConfig};
use memtrace_core::tracker::{MemTracker, Phase};

fn bench_pool_alloc_free(c: &mut Criterion) {
    let sizes: &[usize] = &[32, 64, 256, 1024];
    let mut group = c.benchmark_group("pool_alloc_free");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("pooled", size), &size, |b, &sz| {
            let mut alloc = BookkeepingAlloc::new(PoolConfig::default(), Box::new(SystemHeap));
            b.iter(|| {
                let addr = alloc.allocate(sz);
                criterion::black_box(addr);
                alloc.deallocate(addr);
            });
        });
    }
    group.finish();
}

fn bench_pool_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_burst");

    group.bench_function("1000x64B", |b| {
        let mut alloc = BookkeepingAlloc::new(PoolConfig::default(), Box::new(SystemHeap));
        b.iter(|| {
            let addrs: Vec<usize> = (0..1000).map(|_| alloc.allocate(64)).collect();
            for addr in addrs {
                alloc.deallocate(addr);
            }
        });
    });

    group.finish();
}

fn bench_tracked_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracked_event");

    group.bench_function("allocate_deallocate", |b| {
        let tracker = MemTracker::with_defaults();
        tracker.set_phase(Phase::Running);
        let mut next = 0x10_0000usize;
        b.iter(|| {
            next += 16;
            tracker.allocate(next, 64, 64, 0);
            tracker.deallocate(next);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_pool_alloc_free,
    bench_pool_burst,
    bench_tracked_event
);
criterion_main!(benches);
