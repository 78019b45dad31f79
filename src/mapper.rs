//! # Disparity mapper
//!
//! Runs the whole reconstruction for one stereo pair:
//!
//! ```text
//! Configured -> [Calibrating -> Rectifying] -> Matching -> PointCloudBuilding -> Done
//! ```
//!
//! Calibration and rectification only run when the configuration asks for them, otherwise the
//! pair is taken as already rectified and the configured depth transform is used. Results are
//! borrowed from the mapper after [`DisparityMapper::compute`] and stay valid until the next run.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{imageops, imageops::FilterType, GrayImage, Rgba, RgbaImage, RgbImage};
use log::{debug, info, warn};

use crate::calibration::{CalibrationEngine, StereoCalibration};
use crate::camera::DepthTransform;
use crate::config::MapperConfig;
use crate::disparity::{DisparityMap, RegionOfInterest};
use crate::error::*;
use crate::frame::StereoPair;
use crate::point_cloud::{ColoredPoint, PointCloud, PointCloudProjector, ViewScale};
use crate::quality::DisparityPipeline;
use crate::rectification::Rectifier;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Progress of a mapper through a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configured,
    Calibrating,
    Rectifying,
    Matching,
    PointCloudBuilding,
    Done
}

pub struct DisparityMapper {
    config: MapperConfig,
    pipeline: DisparityPipeline,
    stage: Stage,
    output: Option<MapperOutput>
}

/// Everything produced by one run.
struct MapperOutput {
    originals: StereoPair,
    rectified: Option<StereoPair>,
    calibration: Option<StereoCalibration>,
    depth_transform: DepthTransform,
    raw_disparity: DisparityMap,
    disparity: GrayImage,
    cropped_disparity: GrayImage,
    cropped_left: RgbImage,
    cropped_right: RgbImage,
    left_roi: RegionOfInterest,
    right_roi: Option<RegionOfInterest>,
    point_cloud: PointCloud
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl DisparityMapper {
    /// Build a mapper, validating the configuration.
    ///
    /// A configuration which neither rectifies nor supplies a depth transform is rejected here,
    /// before any image is touched.
    pub fn new(config: MapperConfig) -> Result<Self> {
        config.validate()?;

        let pipeline = DisparityPipeline::new(config.quality, config.matcher, config.filter())?;

        Ok(Self {
            config,
            pipeline,
            stage: Stage::Configured,
            output: None
        })
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Reconstruct the given pair, replacing the results of any previous run.
    pub fn compute(&mut self, pair: &StereoPair) -> Result<()> {
        self.output = None;
        self.set_stage(Stage::Configured);

        match self.run(pair) {
            Ok(output) => {
                self.output = Some(output);
                self.set_stage(Stage::Done);
                Ok(())
            }
            Err(e) => {
                warn!("Computation failed during {:?}: {}", self.stage, e);
                self.set_stage(Stage::Configured);
                Err(e)
            }
        }
    }

    fn run(&mut self, pair: &StereoPair) -> Result<MapperOutput> {
        // ---- RECTIFICATION ----

        let (calibration, rectified, depth_transform) = if self.config.rectify {
            let manifest = self.config.calibration_manifest.clone().ok_or_else(|| {
                Error::Configuration("rectification requires a calibration manifest".into())
            })?;

            self.set_stage(Stage::Calibrating);
            let calibration = CalibrationEngine::new(self.config.pattern)
                .calibrate_from_manifest(&manifest)?;

            self.set_stage(Stage::Rectifying);
            if calibration.image_size != pair.dimensions() {
                warn!(
                    "Calibration images are {:?} but the pair is {:?}",
                    calibration.image_size,
                    pair.dimensions()
                );
            }
            let rectifier = Rectifier::new(&calibration, pair.dimensions(), self.config.alpha)?;
            let rectified = rectifier.rectify(pair)?;

            (Some(calibration), Some(rectified), rectifier.depth_transform())
        } else {
            let q = self.config.depth_transform.ok_or_else(|| {
                Error::Configuration("a depth transform is required when not rectifying".into())
            })?;

            (None, None, q)
        };

        info!(
            "Depth transform: focal length {:.3}, baseline {:.3}",
            depth_transform.focal_length(),
            depth_transform.baseline()
        );

        // ---- MATCHING ----

        self.set_stage(Stage::Matching);

        let matched = rectified.as_ref().unwrap_or(pair);
        let (left_gray, right_gray) = matched.to_gray(self.config.downscale);
        let output = self.pipeline.compute(&left_gray, &right_gray)?;

        let disparity = output.disparity.to_luma_normalised();
        let cropped_disparity = output.left_roi.crop(&disparity);

        // The colour images stay at full resolution
        let scale = if self.config.downscale { 2 } else { 1 };
        let image_roi = output.left_roi.scaled(scale);
        let cropped_left = image_roi.crop(&matched.left);
        let cropped_right = image_roi.crop(&matched.right);

        // ---- POINT CLOUD ----

        self.set_stage(Stage::PointCloudBuilding);

        let (w, h) = cropped_disparity.dimensions();
        let colors = if cropped_left.dimensions() == (w, h) {
            cropped_left.clone()
        } else {
            imageops::resize(&cropped_left, w, h, FilterType::Triangle)
        };
        let point_cloud = PointCloudProjector::new(depth_transform).project(&cropped_disparity, &colors)?;

        Ok(MapperOutput {
            originals: pair.clone(),
            rectified,
            calibration,
            depth_transform,
            raw_disparity: output.disparity,
            disparity,
            cropped_disparity,
            cropped_left,
            cropped_right,
            left_roi: output.left_roi,
            right_roi: output.right_roi,
            point_cloud
        })
    }

    fn set_stage(&mut self, stage: Stage) {
        if stage != self.stage {
            debug!("Mapper stage {:?} -> {:?}", self.stage, stage);
        }
        self.stage = stage;
    }

    fn output(&self) -> Result<&MapperOutput> {
        self.output.as_ref().ok_or(Error::NotComputed)
    }

    // ---- RESULTS ----

    /// Filtered disparity at matching resolution, stretched onto `0..=255`.
    pub fn disparity(&self) -> Result<&GrayImage> {
        Ok(&self.output()?.disparity)
    }

    /// Fixed point disparity as produced by the matcher and filter.
    pub fn raw_disparity(&self) -> Result<&DisparityMap> {
        Ok(&self.output()?.raw_disparity)
    }

    /// Normalised disparity cropped to the left region of interest.
    pub fn cropped_disparity(&self) -> Result<&GrayImage> {
        Ok(&self.output()?.cropped_disparity)
    }

    /// Normalised disparity as an opaque gray RGBA image, for texture upload.
    pub fn disparity_rgba(&self) -> Result<RgbaImage> {
        let d = &self.output()?.disparity;

        Ok(RgbaImage::from_fn(d.width(), d.height(), |x, y| {
            let v = d.get_pixel(x, y)[0];
            Rgba([v, v, v, 255])
        }))
    }

    /// The pair handed to the last run.
    pub fn originals(&self) -> Result<&StereoPair> {
        Ok(&self.output()?.originals)
    }

    /// The rectified pair, if rectification ran.
    pub fn rectified(&self) -> Result<Option<&StereoPair>> {
        Ok(self.output()?.rectified.as_ref())
    }

    /// Left colour image the disparity was computed from, rectified when rectifying.
    pub fn left_image(&self) -> Result<&RgbImage> {
        let out = self.output()?;
        Ok(&out.rectified.as_ref().unwrap_or(&out.originals).left)
    }

    /// Right colour image the disparity was computed from, rectified when rectifying.
    pub fn right_image(&self) -> Result<&RgbImage> {
        let out = self.output()?;
        Ok(&out.rectified.as_ref().unwrap_or(&out.originals).right)
    }

    /// Left colour image cropped to the left region of interest.
    pub fn cropped_left_image(&self) -> Result<&RgbImage> {
        Ok(&self.output()?.cropped_left)
    }

    /// Right colour image cropped to the left region of interest.
    pub fn cropped_right_image(&self) -> Result<&RgbImage> {
        Ok(&self.output()?.cropped_right)
    }

    pub fn point_cloud(&self) -> Result<&PointCloud> {
        Ok(&self.output()?.point_cloud)
    }

    /// Point cloud vertices fitted into viewer space.
    pub fn vertices(&self) -> Result<Vec<ColoredPoint>> {
        let out = self.output()?;
        let scale = ViewScale::new(
            out.depth_transform.focal_length(),
            out.depth_transform.baseline(),
            self.config.matcher.num_disparities
        );

        Ok(out.point_cloud.vertices(&scale))
    }

    /// Depth transform used by the last run, either computed by rectification or configured.
    pub fn depth_transform(&self) -> Result<&DepthTransform> {
        Ok(&self.output()?.depth_transform)
    }

    pub fn focal_length(&self) -> Result<f64> {
        Ok(self.output()?.depth_transform.focal_length())
    }

    pub fn baseline(&self) -> Result<f64> {
        Ok(self.output()?.depth_transform.baseline())
    }

    /// Valid region of the left disparity, in disparity map coordinates.
    pub fn left_roi(&self) -> Result<RegionOfInterest> {
        Ok(self.output()?.left_roi)
    }

    /// Valid region of the right disparity, when the right view was matched.
    pub fn right_roi(&self) -> Result<Option<RegionOfInterest>> {
        Ok(self.output()?.right_roi)
    }

    /// The calibration, if rectification ran.
    pub fn calibration(&self) -> Result<Option<&StereoCalibration>> {
        Ok(self.output()?.calibration.as_ref())
    }

    /// Plot the histogram of the last raw disparity map.
    #[cfg(feature = "statistics")]
    pub fn plot_statistics<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        crate::statistics::plot_disparity_histogram(&self.output()?.raw_disparity, path)
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::Quality;
    use crate::test_util::shifted_pair;
    use image::DynamicImage;

    fn pair(width: u32, height: u32, disparity: u32) -> StereoPair {
        let (left, right) = shifted_pair(width, height, disparity);

        StereoPair::new(
            DynamicImage::ImageLuma8(left).to_rgb8(),
            DynamicImage::ImageLuma8(right).to_rgb8()
        )
        .unwrap()
    }

    fn config() -> MapperConfig {
        MapperConfig::new(16, 7)
            .with_depth_transform(DepthTransform::from_pinhole(48.0, 20.0, 300.0, 97.0, 48.0))
    }

    #[test]
    fn results_require_a_run() {
        let mapper = DisparityMapper::new(config()).unwrap();

        assert_eq!(mapper.stage(), Stage::Configured);
        assert!(matches!(mapper.disparity(), Err(Error::NotComputed)));
        assert!(matches!(mapper.point_cloud(), Err(Error::NotComputed)));
        assert!(matches!(mapper.focal_length(), Err(Error::NotComputed)));
    }

    #[test]
    fn run_reaches_done() {
        let mut mapper = DisparityMapper::new(config().with_quality(Quality::VeryFast)).unwrap();

        mapper.compute(&pair(96, 40, 5)).unwrap();

        assert_eq!(mapper.stage(), Stage::Done);
        assert!(mapper.rectified().unwrap().is_none());
        assert!(mapper.calibration().unwrap().is_none());
        assert_eq!(mapper.disparity_rgba().unwrap().dimensions(), (96, 40));

        let roi = mapper.left_roi().unwrap();
        assert_eq!(mapper.cropped_disparity().unwrap().dimensions(), (roi.width, roi.height));
        assert_eq!(mapper.cropped_left_image().unwrap().dimensions(), (roi.width, roi.height));
        assert!(mapper.point_cloud().unwrap().points().len() <= roi.area());
    }

    #[test]
    fn downscaled_runs_keep_full_resolution_colour() {
        let mut mapper = DisparityMapper::new(config().with_downscale(true)).unwrap();

        mapper.compute(&pair(128, 48, 8)).unwrap();

        let roi = mapper.left_roi().unwrap();
        assert_eq!(mapper.disparity().unwrap().dimensions(), (64, 24));
        assert_eq!(mapper.cropped_left_image().unwrap().dimensions(), (roi.width * 2, roi.height * 2));
        assert_eq!(mapper.point_cloud().unwrap().len(), roi.area());
    }

    #[test]
    fn failed_runs_clear_previous_results() {
        let mut mapper = DisparityMapper::new(config()).unwrap();
        mapper.compute(&pair(96, 40, 5)).unwrap();

        let bad = StereoPair {
            left: RgbImage::new(96, 40),
            right: RgbImage::new(90, 40)
        };
        assert!(mapper.compute(&bad).is_err());
        assert!(matches!(mapper.disparity(), Err(Error::NotComputed)));
        assert_eq!(mapper.stage(), Stage::Configured);
    }
}
