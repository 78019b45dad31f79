//! # Quality tiers
//!
//! Three ways of turning a rectified grayscale pair into a disparity map, trading accuracy for
//! speed:
//!
//! - `Quality`: semi-global matching in both directions, fused by the WLS filter.
//! - `Fast`: block matching in both directions, fused by the WLS filter.
//! - `VeryFast`: block matching of the left view only.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::GrayImage;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::block_matching::BlockMatcher;
use crate::disparity::{DisparityAlgorithm, DisparityMap, MatcherParams, RegionOfInterest, RightMatcher};
use crate::error::*;
use crate::sgbm::SemiGlobalMatcher;
use crate::wls::WlsFilter;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    VeryFast,
    Fast,
    Quality
}

/// Disparity of the left view and the valid regions of the matched views.
#[derive(Debug, Clone)]
pub struct MatchOutput {
    pub disparity: DisparityMap,
    pub left_roi: RegionOfInterest,
    /// Only set by the tiers that also match the right view.
    pub right_roi: Option<RegionOfInterest>
}

/// A matcher and filter set up for one quality tier.
pub struct DisparityPipeline {
    quality: Quality,
    matcher: Box<dyn DisparityAlgorithm>,
    filter: WlsFilter
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for Quality {
    fn default() -> Self {
        Quality::Fast
    }
}

impl DisparityPipeline {
    /// Build the matcher of the tier, validating the parameters.
    pub fn new(quality: Quality, params: MatcherParams, filter: WlsFilter) -> Result<Self> {
        let matcher: Box<dyn DisparityAlgorithm> = match quality {
            Quality::Quality => Box::new(SemiGlobalMatcher::new(params)?),
            Quality::Fast | Quality::VeryFast => Box::new(BlockMatcher::new(params)?)
        };

        Ok(Self {
            quality,
            matcher,
            filter: filter.with_block_size(params.block_size)
        })
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn params(&self) -> &MatcherParams {
        self.matcher.params()
    }

    pub fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<MatchOutput> {
        debug!(
            "Matching {:?} at {}x{}",
            self.quality,
            left.width(),
            left.height()
        );

        match self.quality {
            Quality::VeryFast => self.compute_left_only(left, right),
            Quality::Fast | Quality::Quality => self.compute_filtered(left, right)
        }
    }

    fn compute_left_only(&self, left: &GrayImage, right: &GrayImage) -> Result<MatchOutput> {
        let disparity = self.matcher.compute(left, right)?;

        Ok(MatchOutput {
            left_roi: self.matcher.region_of_interest(left.dimensions()),
            right_roi: None,
            disparity
        })
    }

    /// Match both views and fuse them with the WLS filter.
    fn compute_filtered(&self, left: &GrayImage, right: &GrayImage) -> Result<MatchOutput> {
        let dims = left.dimensions();
        let left_matcher: &dyn DisparityAlgorithm = self.matcher.as_ref();
        let right_matcher = RightMatcher::new(left_matcher);

        let (left_disp, right_disp) = rayon::join(
            || left_matcher.compute(left, right),
            || right_matcher.compute(left, right)
        );
        let (left_disp, right_disp) = (left_disp?, right_disp?);

        let left_roi = left_matcher.region_of_interest(dims);
        let right_roi = right_matcher.region_of_interest(dims);

        debug!(
            "Filtering, {} left and {} right pixels matched",
            left_disp.valid_count(),
            right_disp.valid_count()
        );

        let disparity = self.filter.filter(&left_disp, left, Some(&right_disp), &left_roi)?;

        Ok(MatchOutput {
            disparity,
            left_roi,
            right_roi: Some(right_roi)
        })
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::shifted_pair;

    fn mean_in_roi(out: &MatchOutput) -> f32 {
        let roi = out.left_roi;
        let mut sum = 0.0;
        let mut n = 0;

        for y in roi.y..roi.y + roi.height {
            for x in roi.x..roi.x + roi.width {
                if let Some(d) = out.disparity.disparity(x, y) {
                    sum += d;
                    n += 1;
                }
            }
        }

        assert!(n > 0);
        sum / n as f32
    }

    #[test]
    fn tiers_deserialise_from_snake_case() {
        let q: Quality = serde_json::from_str("\"very_fast\"").unwrap();
        assert_eq!(q, Quality::VeryFast);
        assert_eq!(Quality::default(), Quality::Fast);
    }

    #[test]
    fn block_matching_tiers_need_a_large_window() {
        let params = MatcherParams::new(16, 3);

        assert!(DisparityPipeline::new(Quality::Quality, params, WlsFilter::default()).is_ok());
        assert!(matches!(
            DisparityPipeline::new(Quality::Fast, params, WlsFilter::default()),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn very_fast_matches_the_left_view_only() {
        let (left, right) = shifted_pair(96, 40, 6);
        let pipeline =
            DisparityPipeline::new(Quality::VeryFast, MatcherParams::new(16, 7), WlsFilter::default())
                .unwrap();

        let out = pipeline.compute(&left, &right).unwrap();

        assert!(out.right_roi.is_none());
        assert!((mean_in_roi(&out) - 6.0).abs() < 0.5);
    }

    #[test]
    fn filtered_tiers_recover_the_shift() {
        let (left, right) = shifted_pair(96, 40, 6);

        for quality in [Quality::Fast, Quality::Quality].iter() {
            let filter = WlsFilter::new(8000.0, 1.5, true);
            let pipeline = DisparityPipeline::new(*quality, MatcherParams::new(16, 7), filter).unwrap();

            let out = pipeline.compute(&left, &right).unwrap();
            let right_roi = out.right_roi.unwrap();

            assert_eq!(right_roi.x, 3);
            assert_eq!(right_roi.width, out.left_roi.width);
            assert!((mean_in_roi(&out) - 6.0).abs() < 0.5, "{:?}", quality);
        }
    }
}
