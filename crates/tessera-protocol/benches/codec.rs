//! Codec benchmarks for tessera-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use tessera_protocol::{codec, ClientEvent, Envelope};

fn item_update(fields: usize) -> Envelope {
    let map: serde_json::Map<String, serde_json::Value> = (0..fields)
        .map(|i| (format!("field_{i}"), json!(i)))
        .collect();
    Envelope::new("item-update", serde_json::Value::Object(map))
}

fn bench_text(c: &mut Criterion) {
    let envelope = item_update(16);
    let text = codec::encode_text(&envelope).unwrap();

    let mut group = c.benchmark_group("text");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("encode_16_fields", |b| {
        b.iter(|| codec::encode_text(black_box(&envelope)))
    });
    group.bench_function("decode_16_fields", |b| {
        b.iter(|| codec::decode_text(black_box(&text)))
    });
    group.finish();
}

fn bench_binary(c: &mut Criterion) {
    let envelope = item_update(16);
    let encoded = codec::encode(&envelope).unwrap();

    let mut group = c.benchmark_group("binary");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_16_fields", |b| {
        b.iter(|| codec::encode(black_box(&envelope)))
    });
    group.bench_function("decode_16_fields", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let text = codec::encode_text(&item_update(16)).unwrap();

    c.bench_function("decode_and_validate", |b| {
        b.iter(|| {
            let envelope = codec::decode_text(black_box(&text)).unwrap();
            ClientEvent::from_envelope(envelope).unwrap()
        })
    });
}

criterion_group!(benches, bench_text, bench_binary, bench_validate);
criterion_main!(benches);
