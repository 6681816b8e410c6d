//! Trace channel benchmarks
//!
//! Measures the reservation hot path, segment switch overhead, and
//! whole-segment drains.
//!
//! Performance targets:
//! - Reserve + commit (64 B payload, narrow header): < 100ns
//! - Reserve + commit amortized across segment switches: < 300ns
//! - Whole-segment drain + decode: < 10μs
//!
//! Run with: cargo bench --bench reserve_bench

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use blackbox_core::{Channel, ChannelConfig, SegmentView};

fn overwrite_channel(segment_size: usize, segment_count: usize) -> Channel {
    let config = ChannelConfig::builder()
        .name("bench")
        .segment_size(segment_size)
        .segment_count(segment_count)
        .overwrite(true)
        .build();
    Channel::open(config).unwrap()
}

fn bench_reserve_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_commit");
    group.throughput(Throughput::Elements(1));

    for payload_len in [16usize, 64, 256] {
        group.bench_with_input(
            BenchmarkId::new("single", payload_len),
            &payload_len,
            |b, &len| {
                let channel = overwrite_channel(65536, 8);
                let buffer = channel.buffer(0).unwrap();
                let payload = vec![0xAB_u8; len];
                b.iter(|| {
                    let mut slot = buffer.reserve(black_box(len)).unwrap();
                    slot.write(&payload);
                    slot.commit();
                })
            },
        );
    }

    group.finish();
}

fn bench_header_width(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_width");
    group.throughput(Throughput::Elements(1));

    // the widest window keeps records narrow; a one-tick window forces the
    // full timestamp onto every record
    for (name, window) in [("narrow", 1_u64 << 31), ("wide", 1)] {
        group.bench_with_input(BenchmarkId::new(name, 64), &window, |b, &window| {
            let config = ChannelConfig::builder()
                .name("bench")
                .segment_size(65536)
                .segment_count(8)
                .overwrite(true)
                .compact_window(window)
                .build();
            let channel = Channel::open(config).unwrap();
            let buffer = channel.buffer(0).unwrap();
            let payload = [0xAB_u8; 64];
            b.iter(|| {
                let mut slot = buffer.reserve(black_box(64)).unwrap();
                slot.write(&payload);
                slot.commit();
            })
        });
    }

    group.finish();
}

fn bench_segment_switch(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_switch");
    group.throughput(Throughput::Elements(1));

    // tiny segments so every third record crosses a boundary
    group.bench_function("amortized", |b| {
        let channel = overwrite_channel(256, 8);
        let buffer = channel.buffer(0).unwrap();
        let payload = [0xAB_u8; 64];
        b.iter(|| {
            let mut slot = buffer.reserve(black_box(64)).unwrap();
            slot.write(&payload);
            slot.commit();
        })
    });

    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    const RECORDS_PER_REFILL: usize = 60;

    let mut group = c.benchmark_group("drain");
    group.throughput(Throughput::Elements(RECORDS_PER_REFILL as u64));

    group.bench_function("segment", |b| {
        let config = ChannelConfig::builder()
            .name("bench")
            .segment_size(4096)
            .segment_count(8)
            .build();
        let channel = Channel::open(config).unwrap();
        let buffer = channel.buffer(0).unwrap();
        let payload = [0xAB_u8; 64];
        let mut bytes = Vec::new();
        b.iter(|| {
            match buffer.consume_segment(&mut bytes) {
                Ok(()) => {
                    let view = SegmentView::parse(&bytes).unwrap();
                    black_box(view.records().count())
                }
                // empty: write a bit more than one segment and retry
                Err(_) => {
                    for _ in 0..RECORDS_PER_REFILL {
                        let mut slot = buffer.reserve(64).unwrap();
                        slot.write(&payload);
                        slot.commit();
                    }
                    0
                }
            }
        })
    });

    group.finish();
}

criterion_group!(
    producer_benches,
    bench_reserve_commit,
    bench_header_width,
    bench_segment_switch,
);

criterion_group!(consumer_benches, bench_drain);

criterion_main!(producer_benches, consumer_benches);
