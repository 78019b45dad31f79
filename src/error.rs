//! # Error standards
//!
//! This module provides a standardised error enum and result type for this crate.

// -----------------------------------------------------------------------------------------------
// TYPES
// -----------------------------------------------------------------------------------------------

/// Standard result type used in the stereo mapper crate.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A required input was missing before an operation that depends on it.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The calibration manifest could not be used or too few pattern detections were found.
    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Results were requested before compute() was run")]
    NotComputed,

    #[error("Stereo images differ in size: left is {left:?}, right is {right:?}")]
    DimensionMismatch {
        left: (u32, u32),
        right: (u32, u32)
    },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "statistics")]
    #[error("Error was thrown while plotting statistics: {0}")]
    Statistics(String)
}
