//! # Mapper configuration
//!
//! Every setting of a [`DisparityMapper`](crate::mapper::DisparityMapper), fixed before the mapper
//! is built. Configurations can be written in code with the `with_*` builders or loaded from a
//! JSON file, in which any missing field takes its default.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::camera::DepthTransform;
use crate::disparity::{MatcherParams, SgbmMode};
use crate::error::*;
use crate::pattern::PatternGeometry;
use crate::quality::Quality;
use crate::wls::WlsFilter;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub matcher: MatcherParams,
    pub quality: Quality,

    /// Match at half resolution.
    pub downscale: bool,

    /// Smoothing strength of the disparity filter.
    pub lambda: f64,
    /// Edge sensitivity of the disparity filter.
    pub sigma_color: f64,
    /// Weight the filter by left/right consistency.
    pub use_confidence: bool,

    /// Calibrate and rectify the pair before matching.
    pub rectify: bool,
    /// Rectification free scaling, 0 keeps only valid pixels and 1 keeps every source pixel.
    pub alpha: f64,
    /// Depth transform of an already rectified pair, used when not rectifying.
    pub depth_transform: Option<DepthTransform>,
    /// JSON list of interleaved left/right calibration images.
    pub calibration_manifest: Option<PathBuf>,
    pub pattern: PatternGeometry
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherParams::default(),
            quality: Quality::default(),
            downscale: false,
            lambda: 8000.0,
            sigma_color: 1.5,
            use_confidence: false,
            rectify: false,
            alpha: 1.0,
            depth_transform: None,
            calibration_manifest: None,
            pattern: PatternGeometry::default()
        }
    }
}

impl MapperConfig {
    pub fn new(num_disparities: i32, window_size: i32) -> Self {
        Self {
            matcher: MatcherParams::new(num_disparities, window_size),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_min_disparity(mut self, min_disparity: i32) -> Self {
        self.matcher.min_disparity = min_disparity;
        self
    }

    pub fn with_uniqueness_ratio(mut self, ratio: i32) -> Self {
        self.matcher.uniqueness_ratio = ratio;
        self
    }

    pub fn with_disp12_max_diff(mut self, max_diff: i32) -> Self {
        self.matcher.disp12_max_diff = max_diff;
        self
    }

    pub fn with_speckle_filter(mut self, window_size: i32, range: i32) -> Self {
        self.matcher.speckle_window_size = window_size;
        self.matcher.speckle_range = range;
        self
    }

    pub fn with_penalties(mut self, p1: i32, p2: i32) -> Self {
        self.matcher.p1 = p1;
        self.matcher.p2 = p2;
        self
    }

    pub fn with_pre_filter_cap(mut self, cap: i32) -> Self {
        self.matcher.pre_filter_cap = cap;
        self
    }

    pub fn with_texture_threshold(mut self, threshold: i32) -> Self {
        self.matcher.texture_threshold = threshold;
        self
    }

    pub fn with_mode(mut self, mode: SgbmMode) -> Self {
        self.matcher.mode = mode;
        self
    }

    pub fn with_filter(mut self, lambda: f64, sigma_color: f64, use_confidence: bool) -> Self {
        self.lambda = lambda;
        self.sigma_color = sigma_color;
        self.use_confidence = use_confidence;
        self
    }

    pub fn with_downscale(mut self, downscale: bool) -> Self {
        self.downscale = downscale;
        self
    }

    /// Calibrate from `manifest` and rectify every pair before matching.
    pub fn with_rectification<P: Into<PathBuf>>(mut self, manifest: P, alpha: f64) -> Self {
        self.rectify = true;
        self.calibration_manifest = Some(manifest.into());
        self.alpha = alpha;
        self
    }

    pub fn with_pattern(mut self, pattern: PatternGeometry) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_depth_transform(mut self, depth_transform: DepthTransform) -> Self {
        self.depth_transform = Some(depth_transform);
        self
    }

    /// The disparity filter described by this configuration.
    pub fn filter(&self) -> WlsFilter {
        WlsFilter::new(self.lambda, self.sigma_color, self.use_confidence)
            .with_block_size(self.matcher.block_size)
    }

    /// Check the settings that can be checked without any image.
    pub fn validate(&self) -> Result<()> {
        match self.quality {
            Quality::Quality => self.matcher.validate(false)?,
            Quality::Fast | Quality::VeryFast => self.matcher.validate(true)?
        }

        if !(self.lambda >= 0.0) || !(self.sigma_color > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "filter lambda must be non-negative and sigma colour positive, got {} and {}",
                self.lambda, self.sigma_color
            )));
        }

        if !(-1.0..=1.0).contains(&self.alpha) {
            return Err(Error::InvalidParameter(format!(
                "rectification alpha must lie in -1..=1, got {}",
                self.alpha
            )));
        }

        if self.pattern.columns == 0 || self.pattern.rows < 2 || !(self.pattern.spacing > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "invalid calibration pattern {:?}",
                self.pattern
            )));
        }

        if !self.rectify && self.depth_transform.is_none() {
            return Err(Error::Configuration(
                "a depth transform is required when not rectifying".into()
            ));
        }

        if self.rectify && self.calibration_manifest.is_none() {
            return Err(Error::Configuration(
                "rectification requires a calibration manifest".into()
            ));
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_documented_values() {
        let c = MapperConfig::default();

        assert_eq!(c.matcher.min_disparity, 0);
        assert_eq!(c.matcher.uniqueness_ratio, 0);
        assert_eq!(c.matcher.disp12_max_diff, 1_000_000);
        assert_eq!(c.matcher.speckle_window_size, 0);
        assert_eq!(c.matcher.mode, SgbmMode::Hh);
        assert_eq!(c.lambda, 8000.0);
        assert_eq!(c.sigma_color, 1.5);
        assert!(!c.use_confidence && !c.downscale && !c.rectify);
        assert_eq!(c.quality, Quality::Fast);
        assert_eq!(c.alpha, 1.0);
    }

    #[test]
    fn loads_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "matcher": {{ "num_disparities": 112, "block_size": 7, "mode": "three_way" }},
                "quality": "quality",
                "depth_transform": [[1, 0, 0, -320], [0, 1, 0, -240], [0, 0, 0, 300], [0, 0, 0.01, 0]]
            }}"#
        )
        .unwrap();

        let c = MapperConfig::from_file(file.path()).unwrap();

        assert_eq!(c.matcher.num_disparities, 112);
        assert_eq!(c.matcher.mode, SgbmMode::ThreeWay);
        assert_eq!(c.matcher.pre_filter_cap, 31);
        assert_eq!(c.quality, Quality::Quality);
        assert_eq!(c.depth_transform.unwrap().focal_length(), 300.0);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn missing_depth_source_is_a_configuration_error() {
        let c = MapperConfig::new(64, 7);
        assert!(matches!(c.validate(), Err(Error::Configuration(_))));

        let c = MapperConfig {
            rectify: true,
            ..MapperConfig::new(64, 7)
        };
        assert!(matches!(c.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let q = DepthTransform::from_pinhole(320.0, 240.0, 300.0, 97.0, 320.0);

        let c = MapperConfig::new(50, 7).with_depth_transform(q);
        assert!(matches!(c.validate(), Err(Error::InvalidParameter(_))));

        let c = MapperConfig::new(64, 3).with_depth_transform(q);
        assert!(matches!(c.validate(), Err(Error::InvalidParameter(_))));
        assert!(c.with_quality(Quality::Quality).validate().is_ok());

        let c = MapperConfig::new(64, 7)
            .with_depth_transform(q)
            .with_filter(8000.0, 0.0, false);
        assert!(matches!(c.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn malformed_json_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ \"quality\": \"ultra\" }}").unwrap();

        assert!(matches!(MapperConfig::from_file(file.path()), Err(Error::Json(_))));
    }
}
