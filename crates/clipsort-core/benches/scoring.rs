//! Benchmarks for preprocessing and prompt scoring.
//!
//! Run with: cargo bench -p clipsort-core

use std::sync::Arc;

use clipsort_core::embedding::preprocess::preprocess;
use clipsort_core::math::l2_normalize;
use clipsort_core::scoring::{PromptEmbeddings, Scorer};
use clipsort_core::CategoryKey;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::DynamicImage;

const DIM: usize = 512;

fn vector(seed: usize) -> Vec<f32> {
    let raw: Vec<f32> = (0..DIM)
        .map(|i| ((i * 31 + seed * 17) as f32 * 0.013).sin())
        .collect();
    l2_normalize(&raw)
}

fn prompts() -> Arc<PromptEmbeddings> {
    let categories = (0..CategoryKey::COUNT).map(vector).collect();
    Arc::new(PromptEmbeddings::from_parts(categories, vector(100), vector(101)).unwrap())
}

fn benchmark_preprocess(c: &mut Criterion) {
    let img = DynamicImage::new_rgb8(1920, 1080);

    c.bench_function("preprocess_224", |b| {
        b.iter(|| preprocess(black_box(&img), 224))
    });
}

fn benchmark_score_embedding(c: &mut Criterion) {
    let embedding = vector(7);
    let scorer = Scorer::new(prompts(), false);
    let scorer_with_value = Scorer::new(prompts(), true);

    c.bench_function("score_embedding", |b| {
        b.iter(|| scorer.score_embedding(black_box(&embedding)))
    });
    c.bench_function("score_embedding_with_value", |b| {
        b.iter(|| scorer_with_value.score_embedding(black_box(&embedding)))
    });
}

criterion_group!(benches, benchmark_preprocess, benchmark_score_embedding);
criterion_main!(benches);
