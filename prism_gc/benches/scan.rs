//! Stored Continuation Scan Benchmarks
//!
//! Measures the collector-side cost of finding embedded references.
//!
//! # Benchmark Categories
//!
//! 1. **Frame Count**: scan cost as the number of captured frames grows
//! 2. **Slot Density**: cost per reported slot with sparse and dense maps
//! 3. **Publication**: writing metadata and publishing the frame bytes

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use prism_gc::{
    Allocator, GcConfig, GcHeap, ReferenceMapEncoding, ReferenceMapRegistry, StoredContinuation,
    StoredContinuationWriter, walk_stored_continuation,
};

const FRAME_SIZE: u32 = 128;

// =============================================================================
// Benchmark Helpers
// =============================================================================

fn bench_heap() -> GcHeap {
    GcHeap::new(GcConfig {
        collection_trigger: 0,
        ..Default::default()
    })
    .unwrap()
}

/// Build a published stored continuation of `frames` equal-sized frames,
/// all using reference map 0 of `encoding`.
fn build(
    heap: &GcHeap,
    registry: &ReferenceMapRegistry,
    encoding: &std::sync::Arc<ReferenceMapEncoding>,
    frames: usize,
) -> StoredContinuation {
    let handle = registry.register(encoding);
    let total = frames * FRAME_SIZE as usize;
    let source = vec![0u8; total];

    let mut writer = StoredContinuationWriter::allocate(heap, frames, total).unwrap();
    writer.write_reference_map_encoding(handle);
    for i in 0..frames {
        writer.write_frame_meta(i, FRAME_SIZE, 0);
    }
    unsafe { writer.publish(source.as_ptr(), total) }
}

// =============================================================================
// Scan Benchmarks
// =============================================================================

fn bench_scan_frame_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_frame_count");
    let heap = bench_heap();
    let registry = ReferenceMapRegistry::new();
    let encoding = ReferenceMapEncoding::from_bitmaps(vec![0b1010_1010]);

    for frames in [1usize, 8, 64, 512] {
        let stored = build(&heap, &registry, &encoding, frames);
        group.throughput(Throughput::Elements(frames as u64));
        group.bench_with_input(BenchmarkId::from_parameter(frames), &stored, |b, &stored| {
            b.iter(|| {
                let mut slots = 0usize;
                walk_stored_continuation(black_box(stored), &registry, &mut |slot: usize| {
                    slots = slots.wrapping_add(slot);
                    true
                });
                black_box(slots)
            })
        });
    }

    group.finish();
}

fn bench_scan_slot_density(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_slot_density");
    let heap = bench_heap();
    let registry = ReferenceMapRegistry::new();

    for (name, bitmap) in [("sparse", 0b1u64), ("half", 0xFFFF), ("dense", u64::MAX >> 48)] {
        let encoding = ReferenceMapEncoding::from_bitmaps(vec![bitmap]);
        let stored = build(&heap, &registry, &encoding, 64);
        group.throughput(Throughput::Elements(64 * bitmap.count_ones() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut count = 0usize;
                walk_stored_continuation(black_box(stored), &registry, &mut |_slot: usize| {
                    count += 1;
                    true
                });
                black_box(count)
            })
        });
    }

    group.finish();
}

// =============================================================================
// Publication Benchmarks
// =============================================================================

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    let heap = bench_heap();
    let registry = ReferenceMapRegistry::new();
    let encoding = ReferenceMapEncoding::from_bitmaps(vec![0b11]);

    for frames in [4usize, 64] {
        group.throughput(Throughput::Bytes(frames as u64 * FRAME_SIZE as u64));
        group.bench_with_input(BenchmarkId::from_parameter(frames), &frames, |b, &frames| {
            b.iter(|| {
                let stored = build(&heap, &registry, &encoding, frames);
                heap.release(black_box(stored).object());
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_scan_frame_count,
    bench_scan_slot_density,
    bench_publish
);
criterion_main!(benches);
