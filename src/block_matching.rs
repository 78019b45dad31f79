//! # Block matching
//!
//! Local stereo matching: each pixel takes the disparity minimising the sum of absolute
//! differences between a window around it in the left image and the shifted window in the right
//! image. Both images are pre-filtered with a clipped horizontal Sobel to remove brightness
//! offsets between the cameras, and windows without enough texture are left unmatched.
//!
//! Subpixel refinement fits two lines of equal slope through the costs around the minimum, as
//! described in McManamon et al., "EXOMARS ROVER VEHICLE PERCEPTION SYSTEM ARCHITECTURE AND TEST
//! RESULTS".

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::ops::Range;

use image::GrayImage;
use log::trace;
use rayon::prelude::*;

use crate::disparity::{
    check_pair, filter_speckles, prefilter_xsobel, select_row, DisparityAlgorithm, DisparityMap,
    MatcherParams, Subpixel, DISP_SCALE
};
use crate::error::*;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

pub struct BlockMatcher {
    params: MatcherParams
}

/// A pre-filtered image as a flat buffer with clamped access.
struct Plane<'a> {
    data: &'a [u8],
    width: isize,
    height: isize
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl BlockMatcher {
    /// Create a new instance of the algorithm with the given parameters.
    pub fn new(params: MatcherParams) -> Result<Self> {
        params.validate(true)?;

        Ok(Self { params })
    }

    /// Sum of absolute differences of every window in row `y`, `num_disparities` per column.
    ///
    /// Columns outside `columns` keep the largest cost.
    fn row_costs(&self, left: &Plane, right: &Plane, y: usize, columns: &Range<usize>) -> Vec<u32> {
        let width = left.width as usize;
        let nd = self.params.num_disparities as usize;
        let r = (self.params.block_size / 2) as isize;
        let y = y as isize;

        let mut costs = vec![u32::MAX; width * nd];
        let mut column_sums = vec![0u32; width];

        for d_idx in 0..nd {
            let d = (self.params.min_disparity + d_idx as i32) as isize;

            // Vertical sums of absolute differences over the window height
            for (x, sum) in column_sums.iter_mut().enumerate() {
                let x = x as isize;
                *sum = (-r..=r)
                    .map(|j| (left.get(x, y + j) - right.get(x - d, y + j)).abs() as u32)
                    .sum();
            }

            for x in columns.clone() {
                let x = x as isize;
                let sad: u32 = (-r..=r)
                    .map(|i| column_sums[(x + i).max(0).min(left.width - 1) as usize])
                    .sum();

                costs[x as usize * nd + d_idx] = sad;
            }
        }

        costs
    }

    /// Flags the columns of row `y` whose window holds enough texture to be matched.
    fn row_texture(&self, left: &Plane, y: usize, columns: &Range<usize>) -> Vec<bool> {
        let width = left.width as usize;
        let cap = self.params.pre_filter_cap;
        let threshold = self.params.texture_threshold as u32;
        let r = (self.params.block_size / 2) as isize;
        let y = y as isize;

        let mut textured = vec![false; width];
        for x in columns.clone() {
            let x = x as isize;
            let mut sum = 0u32;
            for j in -r..=r {
                for i in -r..=r {
                    sum += (left.get(x + i, y + j) - cap).abs() as u32;
                }
            }
            textured[x as usize] = threshold == 0 || sum >= threshold;
        }

        textured
    }
}

impl DisparityAlgorithm for BlockMatcher {
    fn params(&self) -> &MatcherParams {
        &self.params
    }

    /// Compute the disparity map for the given pair.
    fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap> {
        check_pair(left, right)?;

        let (width, height) = left.dimensions();
        let params = &self.params;

        // ---- PRE FILTER ----

        let (left_pf, right_pf) = rayon::join(
            || prefilter_xsobel(left, params.pre_filter_cap),
            || prefilter_xsobel(right, params.pre_filter_cap)
        );
        let left_plane = Plane::new(&left_pf);
        let right_plane = Plane::new(&right_pf);

        // ---- STEREO CORRELATION ----

        let columns = params.matchable_columns(width as usize);
        let mut map = DisparityMap::new(width, height, params.min_disparity, params.num_disparities);

        trace!(
            "Block matching {}x{}, columns {:?}, {} disparities",
            width,
            height,
            columns,
            params.num_disparities
        );

        if !columns.is_empty() {
            map.as_mut_slice()
                .par_chunks_mut(width as usize)
                .enumerate()
                .for_each(|(y, out)| {
                    let costs = self.row_costs(&left_plane, &right_plane, y, &columns);
                    let textured = self.row_texture(&left_plane, y, &columns);

                    select_row(
                        &costs,
                        params,
                        Subpixel::Equiangular,
                        columns.clone(),
                        Some(&textured),
                        out
                    );
                });
        }

        // ---- POST FILTER ----

        let invalid = map.invalid_value();
        filter_speckles(
            &mut map,
            invalid,
            params.speckle_window_size as usize,
            params.speckle_range * DISP_SCALE
        );

        Ok(map)
    }
}

impl<'a> Plane<'a> {
    fn new(image: &'a GrayImage) -> Self {
        Self {
            data: image.as_raw(),
            width: image.width() as isize,
            height: image.height() as isize
        }
    }

    /// Pixel value with coordinates clamped to the image.
    fn get(&self, x: isize, y: isize) -> i32 {
        let x = x.max(0).min(self.width - 1);
        let y = y.max(0).min(self.height - 1);

        self.data[(y * self.width + x) as usize] as i32
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
