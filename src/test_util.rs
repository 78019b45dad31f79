//! Synthetic images shared by the unit tests.

use image::{GrayImage, Luma};

/// Deterministic per-pixel noise in `0..=255`.
pub(crate) fn noise(x: u32, y: u32, seed: u32) -> u8 {
    let mut h = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77) ^ seed.wrapping_mul(0xC2B2_AE3D);
    h ^= h >> 15;
    h = h.wrapping_mul(0x2C1B_3C6D);
    h ^= h >> 12;
    (h & 0xFF) as u8
}

pub(crate) fn textured_image(width: u32, height: u32, seed: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| Luma([noise(x, y, seed)]))
}

/// A rectified pair of a fronto-parallel textured plane at constant disparity.
pub(crate) fn shifted_pair(width: u32, height: u32, disparity: u32) -> (GrayImage, GrayImage) {
    let left = GrayImage::from_fn(width, height, |x, y| Luma([noise(x, y, 1)]));
    let right = GrayImage::from_fn(width, height, |x, y| Luma([noise(x + disparity, y, 1)]));

    (left, right)
}
