use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

use tidekv::codec::key::{decode_key, encode_key, prefix_range, Key, KeyPart};

/// Performance benchmarks for the key codec: encode, decode, and range
/// derivation over keys of increasing width.

fn generate_key(parts: usize) -> Key {
    let mut rng = rand::thread_rng();
    (0..parts)
        .map(|i| match i % 4 {
            0 => KeyPart::Text(format!("segment-{}", rng.gen_range(0..1_000_000))),
            1 => KeyPart::Number(rng.gen_range(-1e9..1e9)),
            2 => KeyPart::Bool(rng.gen()),
            _ => KeyPart::Bytes((0..16).map(|_| rng.gen()).collect()),
        })
        .collect()
}

fn bench_key_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_codec");

    for parts in [1usize, 4, 8, 16] {
        let key = generate_key(parts);
        let encoded = encode_key(&key).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", parts), &key, |b, key| {
            b.iter(|| encode_key(black_box(key)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decode", parts), &encoded, |b, bytes| {
            b.iter(|| decode_key(black_box(bytes)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("prefix_range", parts), &key, |b, key| {
            b.iter(|| prefix_range(black_box(key)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_key_codec);
criterion_main!(benches);
