//! # General disparity objects
//!
//! This module provides generic disparity traits and structures for use by different algorithms.
//!
//! Disparities are stored as fixed point `i16` values in sixteenths of a pixel. Pixels without a
//! valid match hold `(min_disparity - 1) * 16`.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::ops::Range;

use image::{imageops, GrayImage, ImageBuffer, Luma, Pixel};
use imageproc::gradients::horizontal_sobel;
use serde::{Deserialize, Serialize};

use crate::error::*;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of fractional bits in a fixed point disparity.
pub const DISP_SHIFT: u32 = 4;

/// Fixed point scale of a disparity, `1 << DISP_SHIFT`.
pub const DISP_SCALE: i32 = 1 << DISP_SHIFT;

/// Largest accepted smoothness penalty, keeping aggregated path costs within `u32`.
pub const MAX_PENALTY: i32 = 1 << 20;

// -----------------------------------------------------------------------------------------------
// TYPES
// -----------------------------------------------------------------------------------------------

/// Raw fixed point disparity image.
pub type DisparityImage = ImageBuffer<Luma<i16>, Vec<i16>>;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A fixed point disparity map.
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityMap {
    data: DisparityImage,
    min_disparity: i32,
    num_disparities: i32
}

/// Path configuration of semi-global matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SgbmMode {
    /// Five aggregation paths.
    Sgbm,
    /// All eight aggregation paths.
    Hh,
    /// Three aggregation paths.
    ThreeWay
}

/// Parameters shared by the block matching and semi-global matchers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherParams {
    pub min_disparity: i32,
    /// Width of the disparity search range, a positive multiple of 16.
    pub num_disparities: i32,
    /// Odd side length of the matching window.
    pub block_size: i32,
    /// Margin, in percent, by which the best cost must beat every other candidate.
    pub uniqueness_ratio: i32,
    /// Largest allowed difference between the left and right view disparities. Negative values
    /// disable the check.
    pub disp12_max_diff: i32,
    /// Largest connected region considered noise. Zero disables speckle filtering.
    pub speckle_window_size: i32,
    /// Largest disparity step, in pixels, within one connected region.
    pub speckle_range: i32,
    pub pre_filter_cap: i32,
    /// Block matching only: smallest summed texture of a window for it to be matched.
    pub texture_threshold: i32,
    /// Penalty for a disparity change of one pixel between neighbours.
    pub p1: i32,
    /// Penalty for larger disparity changes between neighbours.
    pub p2: i32,
    pub mode: SgbmMode
}

/// Rectangle of a disparity map in which every pixel could be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32
}

/// Computes the disparity of the right view with a left view matcher.
///
/// Both images are mirrored and swapped, so that the right image plays the role of the left one,
/// and the result is mirrored back.
pub struct RightMatcher<'a, A: ?Sized> {
    inner: &'a A
}

/// Subpixel refinement applied around the winning disparity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Subpixel {
    /// Fit a parabola through the three costs around the minimum.
    Parabola,
    /// Fit two lines of equal but opposite slope through the costs around the minimum.
    Equiangular
}

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

pub trait DisparityAlgorithm: Sync {
    /// The parameters used by the algorithm.
    fn params(&self) -> &MatcherParams;

    /// Compute the disparity map of the left image of a rectified grayscale pair.
    fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap>;

    /// The region of a map of the given size in which disparities can be valid.
    fn region_of_interest(&self, dimensions: (u32, u32)) -> RegionOfInterest {
        RegionOfInterest::for_left(dimensions, self.params())
    }
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl DisparityMap {
    /// Create a map in which every pixel is invalid.
    pub fn new(width: u32, height: u32, min_disparity: i32, num_disparities: i32) -> Self {
        let invalid = invalid_value(min_disparity);

        Self {
            data: ImageBuffer::from_pixel(width, height, Luma([invalid])),
            min_disparity,
            num_disparities
        }
    }

    pub fn from_image(data: DisparityImage, min_disparity: i32, num_disparities: i32) -> Self {
        Self {
            data,
            min_disparity,
            num_disparities
        }
    }

    pub fn width(&self) -> u32 {
        self.data.width()
    }

    pub fn height(&self) -> u32 {
        self.data.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.data.dimensions()
    }

    pub fn min_disparity(&self) -> i32 {
        self.min_disparity
    }

    pub fn num_disparities(&self) -> i32 {
        self.num_disparities
    }

    /// The value held by pixels without a valid disparity.
    pub fn invalid_value(&self) -> i16 {
        invalid_value(self.min_disparity)
    }

    pub fn as_image(&self) -> &DisparityImage {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [i16] {
        &mut self.data
    }

    /// Raw fixed point value at a pixel.
    pub fn get(&self, x: u32, y: u32) -> i16 {
        self.data.get_pixel(x, y)[0]
    }

    pub fn put(&mut self, x: u32, y: u32, val: i16) {
        self.data.put_pixel(x, y, Luma([val]))
    }

    /// Disparity in pixels, or `None` if the pixel has no valid match.
    pub fn disparity(&self, x: u32, y: u32) -> Option<f32> {
        let v = self.get(x, y);

        if v <= self.invalid_value() {
            None
        } else {
            Some(v as f32 / DISP_SCALE as f32)
        }
    }

    /// Number of pixels holding a valid disparity.
    pub fn valid_count(&self) -> usize {
        let invalid = self.invalid_value();
        self.data.iter().filter(|v| **v > invalid).count()
    }

    /// Smallest and largest raw values in the map, invalid pixels included.
    pub fn min_max(&self) -> (i16, i16) {
        self.data
            .iter()
            .fold((i16::MAX, i16::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
    }

    /// Mirror the map around its vertical axis. Values are unchanged.
    pub fn flip_horizontal(&self) -> Self {
        Self {
            data: imageops::flip_horizontal(&self.data),
            min_disparity: self.min_disparity,
            num_disparities: self.num_disparities
        }
    }

    /// Stretch the map's own value range onto `0..=255`.
    ///
    /// A map holding a single value becomes all zeros.
    pub fn to_luma_normalised(&self) -> GrayImage {
        let (lo, hi) = self.min_max();
        let stretch = Stretch::new(lo as f64, hi as f64);

        GrayImage::from_fn(self.width(), self.height(), |x, y| {
            Luma([stretch.apply(self.get(x, y) as f64)])
        })
    }
}

impl Default for SgbmMode {
    fn default() -> Self {
        SgbmMode::Hh
    }
}

impl SgbmMode {
    /// Directions of travel `(dx, dy)` of the aggregation paths.
    pub fn paths(&self) -> &'static [(isize, isize)] {
        match self {
            SgbmMode::Sgbm => &[(1, 0), (-1, 0), (0, 1), (1, 1), (-1, 1)],
            SgbmMode::Hh => &[(1, 0), (-1, 0), (0, 1), (0, -1), (1, 1), (-1, 1), (1, -1), (-1, -1)],
            SgbmMode::ThreeWay => &[(1, 0), (-1, 0), (0, 1)]
        }
    }
}

impl Default for MatcherParams {
    fn default() -> Self {
        Self {
            min_disparity: 0,
            num_disparities: 64,
            block_size: 7,
            uniqueness_ratio: 0,
            disp12_max_diff: 1_000_000,
            speckle_window_size: 0,
            speckle_range: 2,
            pre_filter_cap: 31,
            texture_threshold: 10,
            p1: 0,
            p2: 0,
            mode: SgbmMode::Hh
        }
    }
}

impl MatcherParams {
    pub fn new(num_disparities: i32, block_size: i32) -> Self {
        Self {
            num_disparities,
            block_size,
            ..Self::default()
        }
    }

    /// Check the parameters, `block_matching` applying the stricter window limit of the local
    /// matcher.
    pub fn validate(&self, block_matching: bool) -> Result<()> {
        if self.num_disparities <= 0 || self.num_disparities % 16 != 0 {
            return Err(Error::InvalidParameter(format!(
                "the number of disparities must be a positive multiple of 16, got {}",
                self.num_disparities
            )));
        }

        // Invalid marker and largest disparity must both fit the fixed point format
        let lowest = (self.min_disparity as i64 - 1) * DISP_SCALE as i64;
        let highest = (self.min_disparity as i64 + self.num_disparities as i64) * DISP_SCALE as i64;
        if lowest < i16::MIN as i64 || highest > i16::MAX as i64 {
            return Err(Error::InvalidParameter(format!(
                "disparities {}..{} do not fit the 1/{} pixel fixed point range",
                self.min_disparity,
                self.min_disparity as i64 + self.num_disparities as i64,
                DISP_SCALE
            )));
        }

        let min_block = if block_matching { 5 } else { 1 };
        if self.block_size < min_block || self.block_size % 2 == 0 {
            return Err(Error::InvalidParameter(format!(
                "the block size must be odd and at least {}, got {}",
                min_block, self.block_size
            )));
        }

        if !(0..=100).contains(&self.uniqueness_ratio) {
            return Err(Error::InvalidParameter(format!(
                "the uniqueness ratio must lie in 0..=100, got {}",
                self.uniqueness_ratio
            )));
        }

        if self.speckle_window_size < 0 || self.speckle_range < 0 {
            return Err(Error::InvalidParameter("speckle parameters must not be negative".into()));
        }

        if !(1..=63).contains(&self.pre_filter_cap) {
            return Err(Error::InvalidParameter(format!(
                "the pre-filter cap must lie in 1..=63, got {}",
                self.pre_filter_cap
            )));
        }

        if self.texture_threshold < 0 || self.p1 < 0 || self.p2 < 0 {
            return Err(Error::InvalidParameter(
                "texture threshold and smoothness penalties must not be negative".into()
            ));
        }

        if self.p1 > MAX_PENALTY || self.p2 > MAX_PENALTY {
            return Err(Error::InvalidParameter(format!(
                "smoothness penalties must not exceed {}, got {} and {}",
                MAX_PENALTY, self.p1, self.p2
            )));
        }

        Ok(())
    }

    /// Smoothness penalties actually used, unset ones replaced by defaults and `P2 > P1`.
    pub fn penalties(&self) -> (u32, u32) {
        let p1 = if self.p1 > 0 { self.p1 } else { 2 };
        let p2 = (if self.p2 > 0 { self.p2 } else { 5 }).max(p1.saturating_add(1));

        (p1 as u32, p2 as u32)
    }

    /// Exclusive upper bound of the searched disparities.
    pub fn max_disparity(&self) -> i32 {
        self.min_disparity + self.num_disparities
    }

    /// Columns in which every candidate disparity lands inside the right image.
    pub(crate) fn matchable_columns(&self, width: usize) -> Range<usize> {
        let start = (self.max_disparity() - 1).max(0) as usize;
        let end = (width as i64 + self.min_disparity.min(0) as i64).max(0) as usize;

        start.min(end)..end
    }
}

impl RegionOfInterest {
    /// Valid region of a left view disparity map.
    ///
    /// Columns left of `max_disparity + block_size / 2` cannot be matched at every candidate
    /// disparity, and a half window on every side is not fully covered by the image.
    pub fn for_left(dimensions: (u32, u32), params: &MatcherParams) -> Self {
        let (w, h) = (dimensions.0 as i64, dimensions.1 as i64);
        let bs2 = (params.block_size / 2) as i64;

        let xmin = (params.max_disparity() as i64 + bs2).max(0).min(w);
        let xmax = (w + params.min_disparity as i64 - bs2).max(xmin).min(w);
        let ymin = bs2.min(h);
        let ymax = (h - bs2).max(ymin);

        Self {
            x: xmin as u32,
            y: ymin as u32,
            width: (xmax - xmin) as u32,
            height: (ymax - ymin) as u32
        }
    }

    /// Valid region of a right view disparity map, the mirror of the left one.
    pub fn for_right(dimensions: (u32, u32), params: &MatcherParams) -> Self {
        Self::for_left(dimensions, params).mirrored(dimensions.0)
    }

    pub fn mirrored(&self, image_width: u32) -> Self {
        Self {
            x: image_width.saturating_sub(self.x + self.width),
            ..*self
        }
    }

    /// The same region in an image `factor` times larger.
    pub fn scaled(&self, factor: u32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor
        }
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    /// Copy the region out of an image, clipped to the image bounds.
    pub fn crop<P>(&self, image: &ImageBuffer<P, Vec<P::Subpixel>>) -> ImageBuffer<P, Vec<P::Subpixel>>
    where
        P: Pixel + 'static
    {
        let x = self.x.min(image.width());
        let y = self.y.min(image.height());
        let width = self.width.min(image.width() - x);
        let height = self.height.min(image.height() - y);

        imageops::crop_imm(image, x, y, width, height).to_image()
    }
}

impl<'a, A: DisparityAlgorithm + ?Sized> RightMatcher<'a, A> {
    pub fn new(inner: &'a A) -> Self {
        Self { inner }
    }
}

impl<'a, A: DisparityAlgorithm + ?Sized> DisparityAlgorithm for RightMatcher<'a, A> {
    fn params(&self) -> &MatcherParams {
        self.inner.params()
    }

    fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap> {
        let flipped_left = imageops::flip_horizontal(left);
        let flipped_right = imageops::flip_horizontal(right);

        Ok(self.inner.compute(&flipped_right, &flipped_left)?.flip_horizontal())
    }

    fn region_of_interest(&self, dimensions: (u32, u32)) -> RegionOfInterest {
        self.inner.region_of_interest(dimensions).mirrored(dimensions.0)
    }
}

/// Linear map of `lo..=hi` onto `0..=255`.
struct Stretch {
    lo: f64,
    scale: f64
}

impl Stretch {
    fn new(lo: f64, hi: f64) -> Self {
        let scale = if hi > lo { 255.0 / (hi - lo) } else { 0.0 };
        Self { lo, scale }
    }

    fn apply(&self, v: f64) -> u8 {
        ((v - self.lo) * self.scale).round().max(0.0).min(255.0) as u8
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

pub(crate) fn invalid_value(min_disparity: i32) -> i16 {
    ((min_disparity - 1) * DISP_SCALE) as i16
}

/// Check that a grayscale pair can be matched.
pub(crate) fn check_pair(left: &GrayImage, right: &GrayImage) -> Result<()> {
    if left.dimensions() != right.dimensions() {
        return Err(Error::DimensionMismatch {
            left: left.dimensions(),
            right: right.dimensions()
        });
    }

    Ok(())
}

/// Horizontal Sobel response clipped to `-cap..=cap` and shifted to `0..=2 * cap`.
pub(crate) fn prefilter_xsobel(image: &GrayImage, cap: i32) -> GrayImage {
    let sobel = horizontal_sobel(image);

    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let v = sobel.get_pixel(x, y)[0] as i32;
        Luma([(v.max(-cap).min(cap) + cap) as u8])
    })
}

/// Winner-take-all selection of the disparities of one row.
///
/// `costs` holds `num_disparities` costs per column. Only columns in `columns` are matched, and
/// with a `textured` mask only those flagged. The results, in fixed point, are written to `out`
/// which must already be filled with the invalid value.
pub(crate) fn select_row(
    costs: &[u32],
    params: &MatcherParams,
    subpixel: Subpixel,
    columns: Range<usize>,
    textured: Option<&[bool]>,
    out: &mut [i16]
) {
    let width = out.len();
    let nd = params.num_disparities as usize;
    let min_d = params.min_disparity;
    let invalid = invalid_value(min_d);
    let uniqueness = params.uniqueness_ratio as u64;

    // Best match of each right image column, for the left-right consistency check
    let check_lr = params.disp12_max_diff >= 0;
    let mut disp2 = vec![invalid_value(min_d) as i32 / DISP_SCALE; if check_lr { width } else { 0 }];
    let mut disp2_cost = vec![u32::MAX; if check_lr { width } else { 0 }];

    for x in columns.clone() {
        if let Some(mask) = textured {
            if !mask[x] {
                continue;
            }
        }

        let c = &costs[x * nd..(x + 1) * nd];

        let (best, min_cost) = c
            .iter()
            .enumerate()
            .fold((0usize, u32::MAX), |(bi, bc), (i, v)| if *v < bc { (i, *v) } else { (bi, bc) });

        if uniqueness > 0 {
            let ambiguous = c.iter().enumerate().any(|(d, v)| {
                (*v as u64) * (100 - uniqueness) < (min_cost as u64) * 100
                    && (d as i64 - best as i64).abs() > 1
            });
            if ambiguous {
                continue;
            }
        }

        if check_lr {
            let x2 = x as i64 - (min_d as i64 + best as i64);
            if x2 >= 0 && (x2 as usize) < width && disp2_cost[x2 as usize] > min_cost {
                disp2_cost[x2 as usize] = min_cost;
                disp2[x2 as usize] = min_d + best as i32;
            }
        }

        let fixed = if best > 0 && best < nd - 1 {
            let (cl, cb, cr) = (c[best - 1] as i64, c[best] as i64, c[best + 1] as i64);
            let offset = match subpixel {
                Subpixel::Parabola => {
                    let denom2 = (cl + cr - 2 * cb).max(1);
                    ((cl - cr) * DISP_SCALE as i64 + denom2) / (denom2 * 2)
                }
                Subpixel::Equiangular => {
                    let denom = 2 * (cl.max(cr) - cb);
                    if denom > 0 {
                        ((cl - cr) * DISP_SCALE as i64) / denom
                    } else {
                        0
                    }
                }
            };
            best as i64 * DISP_SCALE as i64 + offset
        } else {
            best as i64 * DISP_SCALE as i64
        };

        out[x] = (fixed + (min_d * DISP_SCALE) as i64) as i16;
    }

    if !check_lr {
        return;
    }

    for x in columns {
        let d1 = out[x] as i32;
        if d1 == invalid as i32 {
            continue;
        }

        let d_lo = d1 >> DISP_SHIFT;
        let d_hi = (d1 + DISP_SCALE - 1) >> DISP_SHIFT;
        let x_lo = x as i64 - d_lo as i64;
        let x_hi = x as i64 - d_hi as i64;

        let inconsistent = |x2: i64, d: i32| {
            x2 >= 0
                && (x2 as usize) < width
                && disp2[x2 as usize] >= min_d
                && (disp2[x2 as usize] - d).abs() > params.disp12_max_diff
        };

        if inconsistent(x_lo, d_lo) && inconsistent(x_hi, d_hi) {
            out[x] = invalid;
        }
    }
}

/// Invalidate small connected regions of similar disparity.
///
/// Neighbouring pixels belong to the same region when their values differ by at most `max_diff`.
/// Regions of at most `max_size` pixels are set to `new_val`.
pub(crate) fn filter_speckles(map: &mut DisparityMap, new_val: i16, max_size: usize, max_diff: i32) {
    if max_size == 0 {
        return;
    }

    let (width, height) = (map.width() as usize, map.height() as usize);
    let data = map.as_mut_slice();

    let mut labels = vec![0u32; width * height];
    let mut region_is_speckle: Vec<bool> = vec![false];
    let mut queue = VecDeque::new();
    let mut members = Vec::new();

    for start in 0..width * height {
        if data[start] == new_val {
            continue;
        }

        if labels[start] != 0 {
            if region_is_speckle[labels[start] as usize] {
                data[start] = new_val;
            }
            continue;
        }

        let label = region_is_speckle.len() as u32;
        labels[start] = label;
        queue.push_back(start);
        members.clear();

        while let Some(p) = queue.pop_front() {
            members.push(p);
            let (px, py) = (p % width, p / width);
            let val = data[p] as i32;

            let mut visit = |q: usize| {
                if labels[q] == 0 && data[q] != new_val && (data[q] as i32 - val).abs() <= max_diff {
                    labels[q] = label;
                    queue.push_back(q);
                }
            };

            if px > 0 {
                visit(p - 1);
            }
            if px + 1 < width {
                visit(p + 1);
            }
            if py > 0 {
                visit(p - width);
            }
            if py + 1 < height {
                visit(p + width);
            }
        }

        let speckle = members.len() <= max_size;
        region_is_speckle.push(speckle);
        if speckle {
            data[start] = new_val;
        }
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn params(num: i32, block: i32) -> MatcherParams {
        MatcherParams::new(num, block)
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(params(64, 7).validate(false).is_ok());
        assert!(matches!(params(60, 7).validate(false), Err(Error::InvalidParameter(_))));
        assert!(matches!(params(0, 7).validate(false), Err(Error::InvalidParameter(_))));
        assert!(matches!(params(64, 8).validate(false), Err(Error::InvalidParameter(_))));
        assert!(params(64, 3).validate(false).is_ok());
        assert!(matches!(params(64, 3).validate(true), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn fixed_point_range_is_enforced() {
        // (0 + 2032) * 16 = 32512 still fits, 2048 * 16 does not
        assert!(params(2032, 5).validate(false).is_ok());
        assert!(matches!(params(2048, 5).validate(false), Err(Error::InvalidParameter(_))));
        assert!(matches!(params(2064, 5).validate(false), Err(Error::InvalidParameter(_))));

        let shifted = |min_disparity| MatcherParams {
            min_disparity,
            ..params(16, 5)
        };
        assert!(shifted(-2047).validate(false).is_ok());
        assert_eq!(invalid_value(-2047), -32768);
        assert!(matches!(shifted(-2048).validate(false), Err(Error::InvalidParameter(_))));
        assert!(matches!(shifted(2032).validate(false), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn oversized_penalties_are_rejected() {
        let p = MatcherParams {
            p1: i32::MAX,
            ..params(16, 5)
        };
        assert!(matches!(p.validate(false), Err(Error::InvalidParameter(_))));
        assert_eq!(p.penalties(), (i32::MAX as u32, i32::MAX as u32));

        let p = MatcherParams {
            p1: MAX_PENALTY,
            p2: MAX_PENALTY,
            ..params(16, 5)
        };
        assert!(p.validate(false).is_ok());
    }

    #[test]
    fn default_penalties_follow_the_smoothness_rule() {
        assert_eq!(MatcherParams::default().penalties(), (2, 5));

        let p = MatcherParams {
            p1: 200,
            p2: 100,
            ..MatcherParams::default()
        };
        assert_eq!(p.penalties(), (200, 201));
    }

    #[test]
    fn roi_matches_window_and_range() {
        let roi = RegionOfInterest::for_left((640, 480), &params(112, 7));

        assert_eq!(roi.x, 115);
        assert_eq!(roi.y, 3);
        assert_eq!(roi.x + roi.width, 637);
        assert_eq!(roi.y + roi.height, 477);

        let right = RegionOfInterest::for_right((640, 480), &params(112, 7));
        assert_eq!(right.x, 3);
        assert_eq!(right.width, roi.width);
    }

    #[test]
    fn roi_shrinks_with_block_and_range() {
        let base = RegionOfInterest::for_left((320, 240), &params(32, 5));
        let wider_block = RegionOfInterest::for_left((320, 240), &params(32, 11));
        let more_disp = RegionOfInterest::for_left((320, 240), &params(64, 5));

        assert!(base.width > 0 && base.height > 0);
        assert!(wider_block.width < base.width && wider_block.height < base.height);
        assert!(more_disp.width < base.width);
    }

    #[test]
    fn roi_never_exceeds_the_image() {
        let roi = RegionOfInterest::for_left((40, 10), &params(64, 21));

        assert!(roi.is_empty());
        assert!(roi.x <= 40 && roi.y <= 10);
    }

    #[test]
    fn crop_copies_the_region() {
        let img = GrayImage::from_fn(10, 8, |x, y| Luma([(x + 10 * y) as u8]));
        let roi = RegionOfInterest { x: 2, y: 3, width: 4, height: 2 };

        let out = roi.crop(&img);
        assert_eq!(out.dimensions(), (4, 2));
        assert_eq!(out.get_pixel(0, 0)[0], 32);
        assert_eq!(out.get_pixel(3, 1)[0], 45);
    }

    #[test]
    fn normalisation_is_idempotent() {
        let mut map = DisparityMap::new(16, 4, 0, 16);
        for (x, y) in (0..16).flat_map(|x| (0..4).map(move |y| (x, y))) {
            map.put(x, y, (-16 + 40 * x as i32 + y as i32) as i16);
        }

        let once = map.to_luma_normalised();
        assert_eq!(*once.iter().min().unwrap(), 0);
        assert_eq!(*once.iter().max().unwrap(), 255);

        let mut stretched = DisparityMap::new(16, 4, 0, 16);
        for (x, y, v) in once.enumerate_pixels() {
            stretched.put(x, y, v[0] as i16);
        }
        assert_eq!(stretched.to_luma_normalised(), once);
    }

    #[test]
    fn flat_map_normalises_to_zero() {
        let map = DisparityMap::new(8, 8, 0, 16);

        assert!(map.to_luma_normalised().iter().all(|v| *v == 0));
    }

    #[test]
    fn invalid_pixels_have_no_disparity() {
        let mut map = DisparityMap::new(4, 4, 0, 16);
        assert_eq!(map.invalid_value(), -16);
        assert_eq!(map.disparity(1, 1), None);

        map.put(1, 1, 40);
        assert_eq!(map.disparity(1, 1), Some(2.5));
        assert_eq!(map.valid_count(), 1);
    }

    #[test]
    fn speckles_are_removed() {
        let mut map = DisparityMap::new(10, 10, 0, 16);
        for y in 0..10 {
            for x in 0..10 {
                map.put(x, y, 160);
            }
        }
        // A lone outlier and a 2x2 island
        map.put(5, 5, 800);
        for (x, y) in [(1, 1), (2, 1), (1, 2), (2, 2)].iter() {
            map.put(*x, *y, 480);
        }

        let invalid = map.invalid_value();
        filter_speckles(&mut map, invalid, 4, 16);

        assert_eq!(map.get(5, 5), invalid);
        assert_eq!(map.get(1, 1), invalid);
        assert_eq!(map.get(2, 2), invalid);
        assert_eq!(map.get(8, 8), 160);
    }

    #[test]
    fn row_selection_refines_and_rejects() {
        let p = MatcherParams {
            uniqueness_ratio: 10,
            disp12_max_diff: -1,
            ..params(16, 5)
        };

        let width = 20;
        let mut costs = vec![1000u32; width * 16];
        // Column 18: clear minimum at 4, slightly skewed towards 5
        for (d, c) in [(3, 300), (4, 100), (5, 200)].iter() {
            costs[18 * 16 + d] = *c;
        }
        // Column 17: two equally good, distant minima
        costs[17 * 16 + 2] = 100;
        costs[17 * 16 + 9] = 100;

        let mut out = vec![invalid_value(0); width];
        select_row(&costs, &p, Subpixel::Parabola, 15..20, None, &mut out);

        // Parabola through (3, 300), (4, 100), (5, 200) has its minimum at 4 + 1/6
        assert_eq!(out[18], 4 * 16 + 3);
        assert_eq!(out[17], -16);

        let mut out = vec![invalid_value(0); width];
        select_row(&costs, &p, Subpixel::Equiangular, 18..19, None, &mut out);
        // (300 - 200) / (2 * (300 - 100)) = 0.25 px
        assert_eq!(out[18], 4 * 16 + 4);
    }
}
