//! Codec benchmarks for murmur-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use murmur_protocol::{codec, ClientFrame, Encoding, Envelope, ServerFrame};

fn bench_encode_json(c: &mut Criterion) {
    let frame = ServerFrame::new_message(1, 7, 42, "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("json_64B", |b| {
        b.iter(|| Encoding::Json.encode_server(black_box(&frame)))
    });
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| Encoding::MessagePack.encode_server(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_client(c: &mut Criterion) {
    let text = codec::encode_json(&Envelope::from(&ClientFrame::message(7, "x".repeat(64)))).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("json_message", |b| {
        b.iter(|| codec::decode_client_text(black_box(&text)))
    });
    group.finish();
}

criterion_group!(benches, bench_encode_json, bench_decode_client);
criterion_main!(benches);
