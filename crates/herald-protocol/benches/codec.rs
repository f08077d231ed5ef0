//! Codec benchmarks for herald-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use herald_protocol::{codec, Frame};

fn bench_encode_small(c: &mut Criterion) {
    let frame = Frame::message("ping", "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_encode_multiline(c: &mut Criterion) {
    let data = vec!["y".repeat(63); 16].join("\n");
    let frame = Frame::message("note", data);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(1024));
    group.bench_function("multiline_1KB", |b| {
        b.iter(|| codec::encode(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    let mut encoded = BytesMut::new();
    for i in 0..32 {
        codec::encode_into(&Frame::message("ping", i.to_string()), &mut encoded).unwrap();
    }
    let encoded = encoded.freeze();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("stream_32_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&encoded[..]);
            while let Some(frame) = codec::decode_from(&mut buf).unwrap() {
                black_box(frame);
            }
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_encode_multiline,
    bench_decode_stream
);
criterion_main!(benches);
