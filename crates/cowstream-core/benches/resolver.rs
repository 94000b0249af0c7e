//! Benchmarks for chain resolution and segment copies.
//!
//! Run with: cargo bench -p cowstream-core

use cowstream_core::copy::copy_segment;
use cowstream_core::{ChainResolver, ImageChain, ImageLayer, MemoryLayer, Segment};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

const IMAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Backing layer with every other `stride` bytes allocated
fn fragmented_layer(name: &str, stride: u64) -> Arc<dyn ImageLayer> {
    let layer = MemoryLayer::new(name, IMAGE_SIZE);
    let block = vec![0xA5u8; stride as usize];
    let mut offset = 0;
    while offset < IMAGE_SIZE {
        layer.write_at(offset, &block).unwrap();
        offset += 2 * stride;
    }
    Arc::new(layer)
}

/// Walk every segment of a chain with different fragmentation levels
fn bench_next_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_segment");
    group.throughput(Throughput::Bytes(IMAGE_SIZE));

    let strides = [(4096, "4KB"), (64 * 1024, "64KB"), (1024 * 1024, "1MB")];

    for (stride, stride_name) in strides {
        let chain = ImageChain::new(vec![
            Arc::new(MemoryLayer::new("top", IMAGE_SIZE)) as Arc<dyn ImageLayer>,
            fragmented_layer("mid", stride),
            Arc::new(MemoryLayer::new("base", IMAGE_SIZE)),
        ])
        .unwrap();
        let resolver = ChainResolver::new("bench", chain, None).unwrap();

        group.bench_with_input(
            BenchmarkId::new("walk", stride_name),
            &resolver,
            |b, resolver| {
                b.iter(|| {
                    let mut cursor = 0;
                    let mut segments = 0u64;
                    while let Some(segment) = resolver
                        .next_segment(black_box(cursor), 512 * 1024)
                        .unwrap()
                    {
                        cursor = segment.end();
                        segments += 1;
                    }
                    segments
                });
            },
        );
    }

    group.finish();
}

/// Copy one segment into a fresh top layer
fn bench_copy_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_segment");

    let sizes = [(64 * 1024, "64KB"), (512 * 1024, "512KB"), (4 * 1024 * 1024, "4MB")];

    for (size, size_name) in sizes {
        let source = MemoryLayer::with_data("backing", vec![0x5Au8; size]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(BenchmarkId::new("memory", size_name), |b| {
            b.iter(|| {
                let top = MemoryLayer::new("top", size as u64);
                copy_segment(
                    &source,
                    &top,
                    black_box(Segment {
                        offset: 0,
                        len: size as u64,
                        source: Some(1),
                    }),
                )
                .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_next_segment, bench_copy_segment);
criterion_main!(benches);
