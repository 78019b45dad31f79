//! # Stereo Mapper
//!
//! This crate reconstructs coloured 3D point clouds from stereo image pairs: camera calibration
//! from circle grid images, stereo rectification, disparity computation with post-filtering and
//! reprojection of the disparity to metric 3D coordinates.

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod block_matching;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod disparity;
mod error;
pub mod frame;
pub mod mapper;
pub mod pattern;
pub mod point_cloud;
pub mod quality;
pub mod rectification;
pub mod sgbm;
#[cfg(feature = "statistics")]
pub mod statistics;
pub mod wls;

#[cfg(test)]
mod test_util;

// -----------------------------------------------------------------------------------------------
// EXPORTS
// -----------------------------------------------------------------------------------------------

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::camera::DepthTransform;
    pub use crate::config::MapperConfig;
    pub use crate::disparity::{DisparityAlgorithm, DisparityMap, MatcherParams, RegionOfInterest, SgbmMode};
    pub use crate::error::{Error, Result};
    pub use crate::frame::StereoPair;
    pub use crate::mapper::{DisparityMapper, Stage};
    pub use crate::pattern::PatternGeometry;
    pub use crate::point_cloud::{ColoredPoint, PointCloud};
    pub use crate::quality::Quality;
}
