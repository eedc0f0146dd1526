// Criterion bench for the flat cosine search path: the exact-recall top-k
// contract says no ANN index, so this is the number that matters when the
// event log grows.

use aviary::engine::embedder::HashEmbedder;
use aviary::engine::store::{cosine_similarity, encode_vector, flat_top_k};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

fn bench_cosine(c: &mut Criterion) {
    let embedder = HashEmbedder::new(384);
    let a = embedder.embed_one("the deploy pipeline uses blue green rollouts");
    let b = embedder.embed_one("rollouts in the deploy pipeline are blue green");
    c.bench_function("cosine_384", |bench| {
        bench.iter(|| cosine_similarity(black_box(&a), black_box(&b)))
    });
}

fn bench_flat_top_k(c: &mut Criterion) {
    let embedder = HashEmbedder::new(384);
    let query = embedder.embed_one("what did alice say about the acme contract");
    let candidates: Vec<Option<Vec<u8>>> = (0..2000)
        .map(|i| {
            let text = format!("event number {} about projects, people and plans", i);
            Some(encode_vector("hash@384", &embedder.embed_one(&text)))
        })
        .collect();
    c.bench_function("flat_top_k_2000x384", |bench| {
        bench.iter(|| flat_top_k("hash@384", black_box(&query), black_box(&candidates), 10))
    });
}

criterion_group!(benches, bench_cosine, bench_flat_top_k);
criterion_main!(benches);
