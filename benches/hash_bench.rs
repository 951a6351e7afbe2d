use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{DynamicImage, Rgb, RgbImage};
use reelset::pipeline::dedup::{phash, Deduplicator};
use reelset::pipeline::quality::QualityGate;

fn create_test_frame(width: u32, height: u32, seed: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        let v = ((x / 8 * 31 + y / 8 * 17 + seed * 13) % 256) as u8;
        Rgb([v, v.wrapping_add(60), v.wrapping_mul(3)])
    }))
}

fn bench_phash_720p(c: &mut Criterion) {
    let frame = create_test_frame(1280, 720, 1);
    c.bench_function("phash_720p", |b| {
        b.iter(|| black_box(phash(black_box(&frame))));
    });
}

fn bench_dedup_sequence(c: &mut Criterion) {
    let hashes: Vec<u64> = (0..500u64).map(|i| i.wrapping_mul(0x9E3779B97F4A7C15)).collect();
    c.bench_function("dedup_500_hashes", |b| {
        b.iter(|| black_box(Deduplicator::retain_indices(8, black_box(&hashes))));
    });
}

fn bench_quality_gate(c: &mut Criterion) {
    let frame = create_test_frame(640, 360, 2);
    c.bench_function("quality_gate_360p", |b| {
        b.iter(|| black_box(QualityGate::measure(black_box(&frame))));
    });
}

criterion_group!(benches, bench_phash_720p, bench_dedup_sequence, bench_quality_gate);
criterion_main!(benches);
