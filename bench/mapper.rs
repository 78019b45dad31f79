use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cv_stereo_mapper::{
    block_matching::BlockMatcher,
    prelude::*,
    sgbm::SemiGlobalMatcher
};
use image::{GrayImage, Luma};

fn noise(x: u32, y: u32) -> u8 {
    let mut h = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77);
    h ^= h >> 15;
    h = h.wrapping_mul(0x2C1B_3C6D);
    h ^= h >> 12;
    (h & 0xFF) as u8
}

fn pair(width: u32, height: u32, disparity: u32) -> (GrayImage, GrayImage) {
    (
        GrayImage::from_fn(width, height, |x, y| Luma([noise(x, y)])),
        GrayImage::from_fn(width, height, |x, y| Luma([noise(x + disparity, y)]))
    )
}

fn matcher_bench(c: &mut Criterion) {
    let (left, right) = pair(320, 240, 12);

    // Build disparity algs
    let bm = BlockMatcher::new(MatcherParams::new(64, 9)).unwrap();
    let sgbm = SemiGlobalMatcher::new(MatcherParams::new(64, 5)).unwrap();

    // Benchmark compute functions
    c.bench_function("block matching 320x240", |b| {
        b.iter(|| bm.compute(black_box(&left), black_box(&right)))
    });
    c.bench_function("sgbm hh 320x240", |b| {
        b.iter(|| sgbm.compute(black_box(&left), black_box(&right)))
    });
}

fn mapper_bench(c: &mut Criterion) {
    let (left, right) = pair(320, 240, 12);
    let stereo = StereoPair::new(
        image::DynamicImage::ImageLuma8(left).to_rgb8(),
        image::DynamicImage::ImageLuma8(right).to_rgb8()
    )
    .unwrap();

    let mut mapper = DisparityMapper::new(
        MapperConfig::new(64, 9)
            .with_quality(Quality::Fast)
            .with_depth_transform(DepthTransform::from_pinhole(159.5, 119.5, 300.0, 97.0, 159.5))
    )
    .unwrap();

    c.bench_function("mapper fast 320x240", |b| b.iter(|| mapper.compute(black_box(&stereo))));
}

criterion_group!(benches, matcher_bench, mapper_bench);
criterion_main!(benches);
