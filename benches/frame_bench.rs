//! Benchmarks for framing, handshake and envelope hot paths
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;

use layered_ws::envelope::{Envelope, Priority};
use layered_ws::frame::{OpCode, Parsed, encode_into, parse};
use layered_ws::mask::apply_mask;
use layered_ws::queue::{BoundedQueue, QueueOrdering};

/// Benchmark mask application
fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for size in [64, 256, 1024, 4096, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("apply_mask", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            let mask = [0x37, 0xfa, 0x21, 0x3d];

            b.iter(|| {
                apply_mask(black_box(&mut data), black_box(mask));
            });
        });
    }

    group.finish();
}

/// Benchmark frame parsing
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    for size in [8, 64, 256, 1024, 4096, 70_000] {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();

        let mut buf = BytesMut::new();
        encode_into(&mut buf, OpCode::Binary, &payload, Some(mask), true).unwrap();
        let frame_data = buf.freeze();
        group.throughput(Throughput::Bytes(frame_data.len() as u64));

        group.bench_with_input(BenchmarkId::new("masked", size), &frame_data, |b, data| {
            b.iter(|| match parse(black_box(data)).unwrap() {
                Parsed::Frame { consumed, .. } => consumed,
                Parsed::NeedMoreData => 0,
            });
        });
    }

    group.finish();
}

/// Benchmark frame encoding
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [8, 64, 256, 1024, 4096, 16384] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        // Unmasked (server)
        group.bench_with_input(BenchmarkId::new("unmasked", size), &payload, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 14);

            b.iter(|| {
                buf.clear();
                encode_into(black_box(&mut buf), OpCode::Binary, black_box(data), None, true).unwrap();
            });
        });

        // Masked (client)
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        group.bench_with_input(BenchmarkId::new("masked", size), &payload, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 14);

            b.iter(|| {
                buf.clear();
                encode_into(black_box(&mut buf), OpCode::Binary, black_box(data), Some(mask), true)
                    .unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark handshake key generation
fn bench_handshake(c: &mut Criterion) {
    use layered_ws::handshake::{generate_accept_key, generate_key};

    let mut group = c.benchmark_group("handshake");

    group.bench_function("generate_key", |b| {
        b.iter(generate_key);
    });

    group.bench_function("generate_accept_key", |b| {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        b.iter(|| generate_accept_key(black_box(key)));
    });

    group.finish();
}

/// Benchmark envelope encode/decode
fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    let envelope = Envelope::new(
        "publish",
        "client_42",
        json!({"topic": "market.ticks", "content": {"bid": 101.25, "ask": 101.5}, "timestamp": 1}),
    )
    .with_priority(Priority::High);
    let text = envelope.to_json().unwrap();

    group.bench_function("to_json", |b| b.iter(|| black_box(&envelope).to_json().unwrap()));
    group.bench_function("from_json", |b| {
        b.iter(|| Envelope::from_json(black_box(&text)).unwrap())
    });

    group.finish();
}

/// Benchmark priority queue push/pop
fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    let priorities = [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent];

    for ordering in [QueueOrdering::Fifo, QueueOrdering::Priority] {
        group.bench_function(format!("{ordering:?}"), |b| {
            let queue = BoundedQueue::new(256, ordering);
            b.iter(|| {
                for (i, p) in priorities.iter().cycle().take(64).enumerate() {
                    let env = Envelope::new("x", i.to_string(), json!({})).with_priority(*p);
                    let _ = queue.try_push(env);
                }
                while queue.try_pop().is_some() {}
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_mask,
    bench_parse,
    bench_encode,
    bench_handshake,
    bench_envelope,
    bench_queue,
);

criterion_main!(benches);
