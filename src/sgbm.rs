//! # Semi-global block matching
//!
//! Matching costs are Birchfield-Tomasi dissimilarities of the Sobel pre-filtered images, plus a
//! weaker intensity term, summed over the matching block. They are then aggregated along 3, 5 or
//! 8 image paths with a small penalty `P1` for disparity changes of one pixel and a larger
//! penalty `P2` for bigger jumps, and the disparity with the smallest aggregated cost wins.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

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

pub struct SemiGlobalMatcher {
    params: MatcherParams
}

/// Cost volume laid out row by row, `nd` costs per pixel.
struct CostVolume<T> {
    data: Vec<T>,
    width: usize,
    height: usize,
    nd: usize
}

/// Per pixel extremes of a scanline and its half-pixel interpolations.
struct Extremes {
    values: Vec<i32>,
    min: Vec<i32>,
    max: Vec<i32>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl SemiGlobalMatcher {
    pub fn new(params: MatcherParams) -> Result<Self> {
        params.validate(false)?;

        Ok(Self { params })
    }

    /// Birchfield-Tomasi costs of every pixel and candidate disparity.
    fn pixel_costs(
        &self,
        left: &GrayImage,
        right: &GrayImage,
        left_pf: &GrayImage,
        right_pf: &GrayImage
    ) -> CostVolume<u16> {
        let (width, height) = (left.width() as usize, left.height() as usize);
        let nd = self.params.num_disparities as usize;
        let min_d = self.params.min_disparity as isize;
        let out_of_range = (2 * self.params.pre_filter_cap + 63) as u16;

        let mut data = vec![0u16; width * height * nd];

        data.par_chunks_mut(width * nd)
            .enumerate()
            .for_each(|(y, row)| {
                let span = y * width..(y + 1) * width;
                let lg = Extremes::new(&left_pf.as_raw()[span.clone()]);
                let rg = Extremes::new(&right_pf.as_raw()[span.clone()]);
                let li = Extremes::new(&left.as_raw()[span.clone()]);
                let ri = Extremes::new(&right.as_raw()[span]);

                for x in 0..width {
                    for d in 0..nd {
                        let x2 = x as isize - (min_d + d as isize);

                        row[x * nd + d] = if x2 < 0 || x2 >= width as isize {
                            out_of_range
                        } else {
                            let x2 = x2 as usize;
                            (bt_cost(&lg, x, &rg, x2) + (bt_cost(&li, x, &ri, x2) >> 2)) as u16
                        };
                    }
                }
            });

        CostVolume { data, width, height, nd }
    }

    /// Aggregate the matching costs along every path of the configured mode.
    fn aggregate(&self, costs: &CostVolume<u16>) -> CostVolume<u32> {
        let (p1, p2) = self.params.penalties();
        let mut total = CostVolume {
            data: vec![0u32; costs.data.len()],
            width: costs.width,
            height: costs.height,
            nd: costs.nd
        };

        for &(dx, dy) in self.params.mode.paths() {
            if dy == 0 {
                aggregate_along_rows(costs, &mut total, dx, p1, p2);
            } else {
                aggregate_across_rows(costs, &mut total, dx, dy, p1, p2);
            }
        }

        total
    }
}

impl DisparityAlgorithm for SemiGlobalMatcher {
    fn params(&self) -> &MatcherParams {
        &self.params
    }

    fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap> {
        check_pair(left, right)?;

        let (width, height) = left.dimensions();
        let params = &self.params;

        let columns = params.matchable_columns(width as usize);
        let mut map = DisparityMap::new(width, height, params.min_disparity, params.num_disparities);

        if columns.is_empty() || height == 0 {
            return Ok(map);
        }

        // ---- MATCHING COST ----

        let (left_pf, right_pf) = rayon::join(
            || prefilter_xsobel(left, params.pre_filter_cap),
            || prefilter_xsobel(right, params.pre_filter_cap)
        );

        let costs = self
            .pixel_costs(left, right, &left_pf, &right_pf)
            .box_sum((params.block_size / 2) as usize);

        // ---- AGGREGATION ----

        trace!(
            "SGBM {}x{}, {} disparities, {} paths, penalties {:?}",
            width,
            height,
            params.num_disparities,
            params.mode.paths().len(),
            params.penalties()
        );

        let total = self.aggregate(&costs);
        drop(costs);

        // ---- SELECTION ----

        let row_len = total.width * total.nd;

        map.as_mut_slice()
            .par_chunks_mut(width as usize)
            .zip(total.data.par_chunks(row_len))
            .for_each(|(out, row_costs)| {
                select_row(row_costs, params, Subpixel::Parabola, columns.clone(), None, out);
            });

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

impl CostVolume<u16> {
    /// Sum the costs over a `(2r + 1)` square window, clamping at the borders.
    fn box_sum(self, r: usize) -> Self {
        if r == 0 {
            return self;
        }

        let (width, height, nd) = (self.width, self.height, self.nd);
        let row_len = width * nd;
        let r = r as isize;

        // Horizontal pass
        let mut horizontal = vec![0u16; self.data.len()];
        horizontal
            .par_chunks_mut(row_len)
            .zip(self.data.par_chunks(row_len))
            .for_each(|(out, row)| {
                for x in 0..width as isize {
                    for d in 0..nd {
                        let sum: u32 = (-r..=r)
                            .map(|i| row[clamp(x + i, width) * nd + d] as u32)
                            .sum();
                        out[x as usize * nd + d] = sum.min(u16::MAX as u32) as u16;
                    }
                }
            });
        drop(self.data);

        // Vertical pass
        let mut data = vec![0u16; horizontal.len()];
        data.par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(y, out)| {
                for j in -r..=r {
                    let src = clamp(y as isize + j, height) * row_len;
                    for (o, h) in out.iter_mut().zip(horizontal[src..src + row_len].iter()) {
                        *o = o.saturating_add(*h);
                    }
                }
            });

        Self { data, width, height, nd }
    }
}

impl Extremes {
    fn new(row: &[u8]) -> Self {
        let n = row.len();
        let values: Vec<i32> = row.iter().map(|v| *v as i32).collect();
        let mut min = vec![0; n];
        let mut max = vec![0; n];

        for x in 0..n {
            let v = values[x];
            let prev = (v + values[x.saturating_sub(1)]) / 2;
            let next = (v + values[(x + 1).min(n - 1)]) / 2;

            min[x] = v.min(prev).min(next);
            max[x] = v.max(prev).max(next);
        }

        Self { values, min, max }
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn clamp(i: isize, len: usize) -> usize {
    i.max(0).min(len as isize - 1) as usize
}

/// Sampling insensitive dissimilarity between left pixel `x` and right pixel `x2`.
fn bt_cost(left: &Extremes, x: usize, right: &Extremes, x2: usize) -> i32 {
    let l = left.values[x];
    let r = right.values[x2];

    let lr = 0.max(l - right.max[x2]).max(right.min[x2] - l);
    let rl = 0.max(r - left.max[x]).max(left.min[x] - r);

    lr.min(rl)
}

/// One step of the path recurrence:
/// `L(p, d) = C(p, d) + min(L(p-r, d), L(p-r, d±1) + P1, min L(p-r) + P2) - min L(p-r)`.
fn path_step(cost: &[u16], prev: Option<&[u32]>, out: &mut [u32], p1: u32, p2: u32) {
    let prev = match prev {
        Some(p) => p,
        None => {
            for (o, c) in out.iter_mut().zip(cost.iter()) {
                *o = *c as u32;
            }
            return;
        }
    };

    let nd = cost.len();
    let prev_min = prev.iter().copied().min().unwrap_or(0);
    let jump = prev_min + p2;

    for d in 0..nd {
        let mut best = prev[d].min(jump);
        if d > 0 {
            best = best.min(prev[d - 1] + p1);
        }
        if d + 1 < nd {
            best = best.min(prev[d + 1] + p1);
        }

        out[d] = cost[d] as u32 + best - prev_min;
    }
}

/// Aggregate along a horizontal path, every row independently.
fn aggregate_along_rows(costs: &CostVolume<u16>, total: &mut CostVolume<u32>, dx: isize, p1: u32, p2: u32) {
    let (width, nd) = (costs.width, costs.nd);
    let row_len = width * nd;

    total
        .data
        .par_chunks_mut(row_len)
        .zip(costs.data.par_chunks(row_len))
        .for_each(|(total_row, cost_row)| {
            let mut prev = vec![0u32; nd];
            let mut cur = vec![0u32; nd];

            for i in 0..width {
                let x = if dx > 0 { i } else { width - 1 - i };
                let span = x * nd..(x + 1) * nd;

                path_step(
                    &cost_row[span.clone()],
                    if i == 0 { None } else { Some(prev.as_slice()) },
                    &mut cur,
                    p1,
                    p2
                );

                for (t, c) in total_row[span].iter_mut().zip(cur.iter()) {
                    *t += *c;
                }
                std::mem::swap(&mut prev, &mut cur);
            }
        });
}

/// Aggregate along a vertical or diagonal path. Rows are visited in path order, the pixels of a
/// row only depend on the previous row and are processed in parallel.
fn aggregate_across_rows(
    costs: &CostVolume<u16>,
    total: &mut CostVolume<u32>,
    dx: isize,
    dy: isize,
    p1: u32,
    p2: u32
) {
    let (width, height, nd) = (costs.width, costs.height, costs.nd);
    let row_len = width * nd;

    let mut prev = vec![0u32; row_len];
    let mut cur = vec![0u32; row_len];

    for i in 0..height {
        let y = if dy > 0 { i } else { height - 1 - i };
        let cost_row = &costs.data[y * row_len..(y + 1) * row_len];
        let first_row = i == 0;

        {
            let prev = &prev;
            cur.par_chunks_mut(nd)
                .enumerate()
                .for_each(|(x, out)| {
                    let px = x as isize - dx;
                    let prev_px = if first_row || px < 0 || px >= width as isize {
                        None
                    } else {
                        let px = px as usize;
                        Some(&prev[px * nd..(px + 1) * nd])
                    };

                    path_step(&cost_row[x * nd..(x + 1) * nd], prev_px, out, p1, p2);
                });
        }

        total.data[y * row_len..(y + 1) * row_len]
            .par_iter_mut()
            .zip(cur.par_iter())
            .for_each(|(t, c)| *t += *c);

        std::mem::swap(&mut prev, &mut cur);
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
