//! Benchmark: region allocator under fragmentation.
//!
//! Compares exact, larger, and largest-region searches on a pack whose free
//! space is split into many small runs, and measures an allocate/release
//! cycle that exercises splitting and coalescing.

use criterion::{Criterion, criterion_group, criterion_main};
use mfd_alloc::PackAllocator;
use mfd_types::TrackId;
use std::hint::black_box;

/// Pack of 65536 tracks with a 16-track allocation every 48 tracks.
fn make_fragmented() -> PackAllocator {
    let mut pack = PackAllocator::new(65_536);
    let mut pos = 32_u64;
    while pos + 16 < 65_536 {
        assert!(pack.allocate(TrackId(pos), 16));
        pos += 48;
    }
    pack
}

fn bench_find(c: &mut Criterion) {
    let pack = make_fragmented();
    let mut group = c.benchmark_group("find_region");

    group.bench_function("exact", |b| {
        b.iter(|| black_box(pack.find_unallocated_region(black_box(32))));
    });

    group.bench_function("larger_miss", |b| {
        b.iter(|| black_box(pack.find_larger_unallocated_region(black_box(33))));
    });

    group.bench_function("largest", |b| {
        b.iter(|| black_box(pack.find_largest_unallocated_region()));
    });

    group.finish();
}

fn bench_modify(c: &mut Criterion) {
    let mut pack = make_fragmented();
    c.bench_function("allocate_release_middle", |b| {
        b.iter(|| {
            assert!(pack.allocate(black_box(TrackId(40_008)), 8));
            assert!(pack.release(black_box(TrackId(40_008)), 8));
        });
    });
}

criterion_group!(benches, bench_find, bench_modify);
criterion_main!(benches);
