//! Codec benchmarks for relay-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_protocol::{codec, Message, UserInfo};

fn bench_encode_chat(c: &mut Criterion) {
    let message = Message::chat("alice", "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("chat_64B", |b| b.iter(|| codec::encode(black_box(&message))));
    group.finish();
}

fn bench_decode_chat(c: &mut Criterion) {
    let message = Message::chat("alice", "x".repeat(64));
    let encoded = codec::encode(&message).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("chat_64B", |b| b.iter(|| codec::decode(black_box(&encoded))));
    group.finish();
}

fn bench_encode_roster(c: &mut Criterion) {
    let users = (0..100)
        .map(|i| UserInfo::new(format!("user-{i}"), "just browsing"))
        .collect();
    let message = Message::user_list(users);

    c.bench_function("encode_roster_100", |b| {
        b.iter(|| codec::encode(black_box(&message)).unwrap())
    });
}

criterion_group!(benches, bench_encode_chat, bench_decode_chat, bench_encode_roster);
criterion_main!(benches);
