//! # Weighted least squares disparity filter
//!
//! Edge-aware smoothing of a disparity map guided by the left image, in the form of the fast
//! global smoother of Min et al., "Fast Global Image Smoothing Based on Weighted Least Squares".
//! The 2D problem is approximated by alternating 1D solves along rows and columns with a
//! decreasing smoothness weight.
//!
//! Disparities are weighted by a confidence, so unmatched pixels are filled from their
//! neighbours: the result is `smooth(d * c) / smooth(c)`.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use log::trace;
use rayon::prelude::*;

use crate::disparity::{DisparityMap, RegionOfInterest, DISP_SCALE};
use crate::error::*;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of row/column sweeps of the smoother.
const NUM_ITERATIONS: i32 = 3;

/// Largest left/right disagreement, in fixed point, of a confident pixel.
const LRC_THRESHOLD: i32 = 24;

/// Smallest smoothed confidence for which a filtered value is produced.
const MIN_WEIGHT: f32 = 1e-3;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WlsFilter {
    /// Strength of the smoothing.
    pub lambda: f64,
    /// Sensitivity of the smoothing to edges of the guide image.
    pub sigma_color: f64,
    /// Weight disparities by left/right consistency rather than by validity alone.
    pub use_confidence: bool,
    /// Radius around unreliable pixels in which the confidence is also cleared.
    pub depth_discontinuity_radius: u8
}

/// Fast global smoother with the edge weights of one guide image.
pub struct FastGlobalSmoother {
    width: usize,
    height: usize,
    lambda: f32,
    /// Weight between `(x, y)` and `(x + 1, y)`, row major.
    horizontal: Vec<f32>,
    /// Weight between `(x, y)` and `(x, y + 1)`, column major.
    vertical: Vec<f32>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for WlsFilter {
    fn default() -> Self {
        Self {
            lambda: 8000.0,
            sigma_color: 1.5,
            use_confidence: false,
            depth_discontinuity_radius: 4
        }
    }
}

impl WlsFilter {
    pub fn new(lambda: f64, sigma_color: f64, use_confidence: bool) -> Self {
        Self {
            lambda,
            sigma_color,
            use_confidence,
            ..Self::default()
        }
    }

    /// Set the discontinuity radius from the matching window, `ceil(block_size / 2)`.
    pub fn with_block_size(mut self, block_size: i32) -> Self {
        self.depth_discontinuity_radius = ((block_size + 1) / 2).max(0).min(255) as u8;
        self
    }

    /// Confidence of each left disparity in `0..=255`.
    ///
    /// Pixels outside `roi`, without a valid disparity or whose match in the right view disagrees
    /// by more than 1.5 px are not trusted, nor is anything within the discontinuity radius of
    /// them.
    pub fn confidence(
        &self,
        left: &DisparityMap,
        right: &DisparityMap,
        roi: &RegionOfInterest
    ) -> Result<GrayImage> {
        check_dims(left.dimensions(), right.dimensions())?;

        let (width, height) = left.dimensions();
        let left_invalid = left.invalid_value();
        let right_invalid = right.invalid_value();

        let conf = GrayImage::from_fn(width, height, |x, y| {
            let dl = left.get(x, y);
            if !roi.contains(x, y) || dl <= left_invalid {
                return Luma([0]);
            }

            let x2 = x as i64 - ((dl as i32 + DISP_SCALE / 2) / DISP_SCALE) as i64;
            if x2 < 0 || x2 >= width as i64 {
                return Luma([0]);
            }

            let dr = right.get(x2 as u32, y);
            if dr > right_invalid && (dl as i32 - dr as i32).abs() > LRC_THRESHOLD {
                Luma([0])
            } else {
                Luma([255])
            }
        });

        if self.depth_discontinuity_radius == 0 {
            Ok(conf)
        } else {
            Ok(erode(&conf, Norm::LInf, self.depth_discontinuity_radius))
        }
    }

    /// Filter the left disparity map, guided by the left grayscale image.
    ///
    /// The right view disparity is only used when confidence weighting is enabled.
    pub fn filter(
        &self,
        left: &DisparityMap,
        guide: &GrayImage,
        right: Option<&DisparityMap>,
        roi: &RegionOfInterest
    ) -> Result<DisparityMap> {
        check_dims(left.dimensions(), guide.dimensions())?;

        let (width, height) = left.dimensions();
        let invalid = left.invalid_value();

        let weights: Vec<f32> = match (self.use_confidence, right) {
            (true, Some(right)) => self
                .confidence(left, right, roi)?
                .iter()
                .map(|c| *c as f32 / 255.0)
                .collect(),
            _ => left
                .as_image()
                .enumerate_pixels()
                .map(|(x, y, d)| {
                    if roi.contains(x, y) && d[0] > invalid {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect()
        };

        let weighted: Vec<f32> = left
            .as_image()
            .iter()
            .zip(weights.iter())
            .map(|(d, w)| *d as f32 * w)
            .collect();

        trace!(
            "WLS filter {}x{}, lambda {}, sigma {}, confidence {}",
            width,
            height,
            self.lambda,
            self.sigma_color,
            self.use_confidence
        );

        let smoother = FastGlobalSmoother::new(guide, self.lambda, self.sigma_color);
        let (num, den) = rayon::join(|| smoother.filter(&weighted), || smoother.filter(&weights));

        let max_value = (left.min_disparity() + left.num_disparities()) * DISP_SCALE;
        let mut out = DisparityMap::new(width, height, left.min_disparity(), left.num_disparities());

        for (o, (n, d)) in out.as_mut_slice().iter_mut().zip(num.iter().zip(den.iter())) {
            if *d > MIN_WEIGHT {
                *o = (n / d).round().max(invalid as f32).min(max_value as f32) as i16;
            }
        }

        Ok(out)
    }
}

impl FastGlobalSmoother {
    /// Precompute the edge weights `exp(-|I_p - I_q| / sigma_color)` of the guide.
    pub fn new(guide: &GrayImage, lambda: f64, sigma_color: f64) -> Self {
        let (width, height) = (guide.width() as usize, guide.height() as usize);
        let sigma = sigma_color.max(f64::EPSILON);

        let mut lut = [0f32; 256];
        for (i, v) in lut.iter_mut().enumerate() {
            *v = (-(i as f64) / sigma).exp() as f32;
        }

        let px = |x: usize, y: usize| guide.get_pixel(x as u32, y as u32)[0] as i32;

        let mut horizontal = vec![0f32; width * height];
        for y in 0..height {
            for x in 0..width.saturating_sub(1) {
                horizontal[y * width + x] = lut[(px(x, y) - px(x + 1, y)).abs() as usize];
            }
        }

        let mut vertical = vec![0f32; width * height];
        for x in 0..width {
            for y in 0..height.saturating_sub(1) {
                vertical[x * height + y] = lut[(px(x, y) - px(x, y + 1)).abs() as usize];
            }
        }

        Self {
            width,
            height,
            lambda: lambda as f32,
            horizontal,
            vertical
        }
    }

    /// Smooth a row major plane of the guide's size.
    pub fn filter(&self, src: &[f32]) -> Vec<f32> {
        let mut data = src.to_vec();
        if self.width == 0 || self.height == 0 {
            return data;
        }

        let denom = 4f32.powi(NUM_ITERATIONS) - 1.0;

        for i in 0..NUM_ITERATIONS {
            let lambda = self.lambda * 1.5 * 4f32.powi(NUM_ITERATIONS - 1 - i) / denom;

            data.par_chunks_mut(self.width)
                .zip(self.horizontal.par_chunks(self.width))
                .for_each(|(row, weights)| solve_1d(row, weights, lambda));

            let mut columns = transpose(&data, self.width, self.height);
            columns
                .par_chunks_mut(self.height)
                .zip(self.vertical.par_chunks(self.height))
                .for_each(|(col, weights)| solve_1d(col, weights, lambda));
            data = transpose(&columns, self.height, self.width);
        }

        data
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn check_dims(left: (u32, u32), right: (u32, u32)) -> Result<()> {
    if left != right {
        return Err(Error::DimensionMismatch { left, right });
    }
    Ok(())
}

/// Solve `(I + lambda * L) u = f` for a 1D signal with the Thomas algorithm, where `L` is the
/// graph Laplacian of the neighbour weights `w[i]` between samples `i` and `i + 1`.
fn solve_1d(f: &mut [f32], w: &[f32], lambda: f32) {
    let n = f.len();
    if n < 2 {
        return;
    }

    let mut c_prime = vec![0f32; n];

    // Forward sweep
    let mut prev_c = 0.0;
    let mut prev_d = 0.0;
    for i in 0..n {
        let a = if i > 0 { -lambda * w[i - 1] } else { 0.0 };
        let c = if i + 1 < n { -lambda * w[i] } else { 0.0 };
        let b = 1.0 - a - c;

        let m = b - a * prev_c;
        prev_c = c / m;
        prev_d = (f[i] - a * prev_d) / m;

        c_prime[i] = prev_c;
        f[i] = prev_d;
    }

    // Back substitution
    for i in (0..n - 1).rev() {
        f[i] -= c_prime[i] * f[i + 1];
    }
}

fn transpose(data: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = vec![0f32; data.len()];
    for y in 0..height {
        for x in 0..width {
            out[x * height + y] = data[y * width + x];
        }
    }
    out
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn constant_map(width: u32, height: u32, value: i16) -> DisparityMap {
        let mut map = DisparityMap::new(width, height, 0, 16);
        for y in 0..height {
            for x in 0..width {
                map.put(x, y, value);
            }
        }
        map
    }

    fn whole(map: &DisparityMap) -> RegionOfInterest {
        RegionOfInterest {
            x: 0,
            y: 0,
            width: map.width(),
            height: map.height()
        }
    }

    #[test]
    fn smoother_keeps_constant_signals() {
        let guide = crate::test_util::textured_image(24, 16, 3);
        let smoother = FastGlobalSmoother::new(&guide, 8000.0, 1.5);

        let out = smoother.filter(&vec![42.0; 24 * 16]);
        for v in out {
            assert_relative_eq!(v, 42.0, epsilon = 1e-2);
        }
    }

    #[test]
    fn thomas_solver_satisfies_the_system() {
        let mut f = [1.0f32, 4.0, 2.0, 8.0];
        let w = [1.0f32, 0.5, 0.25, 0.0];
        let lambda = 2.0;
        let src = f;

        solve_1d(&mut f, &w, lambda);

        // Row i of (I + lambda L) u
        for i in 0..4 {
            let mut v = f[i];
            if i > 0 {
                v += lambda * w[i - 1] * (f[i] - f[i - 1]);
            }
            if i < 3 {
                v += lambda * w[i] * (f[i] - f[i + 1]);
            }
            assert_relative_eq!(v, src[i], epsilon = 1e-4);
        }
    }

    #[test]
    fn holes_are_filled_from_neighbours() {
        let mut map = constant_map(20, 12, 80);
        let invalid = map.invalid_value();
        map.put(10, 6, invalid);
        map.put(11, 6, invalid);

        let guide = GrayImage::from_pixel(20, 12, Luma([128]));
        let filter = WlsFilter::default();

        let out = filter.filter(&map, &guide, None, &whole(&map)).unwrap();
        assert!((out.get(10, 6) - 80).abs() <= 1);
        assert!((out.get(3, 3) - 80).abs() <= 1);
    }

    #[test]
    fn smoothing_stops_at_guide_edges() {
        let mut map = DisparityMap::new(30, 10, 0, 16);
        for y in 0..10 {
            for x in 0..30 {
                map.put(x, y, if x < 15 { 32 } else { 160 });
            }
        }
        let guide = GrayImage::from_fn(30, 10, |x, _| Luma([if x < 15 { 20 } else { 220 }]));

        let out = WlsFilter::default().filter(&map, &guide, None, &whole(&map)).unwrap();

        assert!((out.get(12, 5) - 32).abs() <= 2);
        assert!((out.get(17, 5) - 160).abs() <= 2);
    }

    #[test]
    fn inconsistent_matches_lose_confidence() {
        let left = constant_map(40, 20, 5 * 16);
        let mut right = constant_map(40, 20, 5 * 16);
        right.put(15, 10, 12 * 16);

        let filter = WlsFilter {
            depth_discontinuity_radius: 1,
            ..WlsFilter::new(8000.0, 1.5, true)
        };
        let conf = filter.confidence(&left, &right, &whole(&left)).unwrap();

        // Left pixel 20 matches right pixel 15
        assert_eq!(conf.get_pixel(20, 10)[0], 0);
        assert_eq!(conf.get_pixel(21, 11)[0], 0);
        assert_eq!(conf.get_pixel(30, 10)[0], 255);
        // Matches left of the right image edge
        assert_eq!(conf.get_pixel(2, 5)[0], 0);
    }

    #[test]
    fn discontinuity_radius_follows_the_window() {
        assert_eq!(WlsFilter::default().with_block_size(7).depth_discontinuity_radius, 4);
        assert_eq!(WlsFilter::default().with_block_size(5).depth_discontinuity_radius, 3);
    }

    #[test]
    fn mismatched_guide_is_rejected() {
        let map = constant_map(8, 8, 16);
        let res = WlsFilter::default().filter(&map, &GrayImage::new(7, 8), None, &whole(&map));

        assert!(matches!(res, Err(Error::DimensionMismatch { .. })));
    }
}
