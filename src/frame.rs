//! # Stereo frames
//!
//! This module provides the stereo image pair consumed by a pipeline run.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::Path;

use image::{imageops, GrayImage, RgbImage};

use crate::error::*;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A pair of equally sized colour images taken by the left and right cameras of a rig.
#[derive(Debug, Clone)]
pub struct StereoPair {
    pub left: RgbImage,
    pub right: RgbImage
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl StereoPair {
    /// Build a pair, checking that both images have the same dimensions.
    pub fn new(left: RgbImage, right: RgbImage) -> Result<Self> {
        if left.dimensions() != right.dimensions() {
            return Err(Error::DimensionMismatch {
                left: left.dimensions(),
                right: right.dimensions()
            });
        }

        Ok(Self { left, right })
    }

    /// Load a pair from two image files.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(left: P, right: Q) -> Result<Self> {
        let left = image::open(left)?.to_rgb8();
        let right = image::open(right)?.to_rgb8();

        Self::new(left, right)
    }

    pub fn width(&self) -> u32 {
        self.left.width()
    }

    pub fn height(&self) -> u32 {
        self.left.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.left.dimensions()
    }

    /// Converts both images to grayscale, optionally halving their resolution.
    ///
    /// Matching always operates on grayscale data, the colour images are kept for display and
    /// for colouring the point cloud.
    pub fn to_gray(&self, downscale: bool) -> (GrayImage, GrayImage) {
        let left = imageops::grayscale(&self.left);
        let right = imageops::grayscale(&self.right);

        if !downscale {
            return (left, right);
        }

        (half_size(&left), half_size(&right))
    }
}

/// Halve the resolution of a grayscale image using bilinear filtering.
pub(crate) fn half_size(image: &GrayImage) -> GrayImage {
    let width = (image.width() / 2).max(1);
    let height = (image.height() / 2).max(1);

    imageops::resize(image, width, height, imageops::FilterType::Triangle)
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_sizes_are_rejected() {
        let res = StereoPair::new(RgbImage::new(10, 10), RgbImage::new(12, 10));

        match res {
            Err(Error::DimensionMismatch { left, right }) => {
                assert_eq!(left, (10, 10));
                assert_eq!(right, (12, 10));
            }
            other => panic!("expected a dimension mismatch, got {:?}", other)
        }
    }

    #[test]
    fn downscale_halves_matching_resolution() {
        let pair = StereoPair::new(RgbImage::new(64, 48), RgbImage::new(64, 48)).unwrap();

        let (left, right) = pair.to_gray(true);
        assert_eq!(left.dimensions(), (32, 24));
        assert_eq!(right.dimensions(), (32, 24));

        let (left, _) = pair.to_gray(false);
        assert_eq!(left.dimensions(), (64, 48));
    }
}
