//! # Point cloud reconstruction
//!
//! Reprojects a cropped, normalised disparity map to 3D through the depth transform and pairs
//! every point with the colour of the source pixel.
//!
//! The disparity is flipped vertically before reprojection so the cloud is y-up, as renderers
//! expect. Pixels whose disparity reprojects to infinite depth keep their place in the grid but
//! are left out of the renderable points.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{imageops, GrayImage, RgbImage};
use log::debug;
use rayon::prelude::*;

use crate::camera::DepthTransform;
use crate::error::*;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A renderable vertex, laid out as six consecutive `f32`s.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColoredPoint {
    pub position: [f32; 3],
    /// RGB in `0.0..=1.0`.
    pub color: [f32; 3]
}

/// Dense grid of reprojected points, one per pixel of the cropped disparity.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    width: u32,
    height: u32,
    positions: Vec<[f32; 3]>,
    colors: Vec<[u8; 3]>
}

pub struct PointCloudProjector {
    depth: DepthTransform
}

/// Fits a point cloud into viewer space.
///
/// `x` and `y` are scaled so the grid spans `extent` units, and depth so that the depth of the
/// smallest searched disparity step spans `extent` too, then shifted by `depth_offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewScale {
    pub extent: f32,
    pub depth_offset: f32,
    depth_scale: f32
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl PointCloud {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of grid slots, finite or not.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Reprojected position of grid cell `(x, y)`, row 0 being the bottom of the image.
    pub fn position(&self, x: u32, y: u32) -> [f32; 3] {
        self.positions[(y * self.width + x) as usize]
    }

    pub fn is_finite(&self, x: u32, y: u32) -> bool {
        is_finite(&self.position(x, y))
    }

    /// Every point with a finite position, coloured, in grid order.
    pub fn points(&self) -> Vec<ColoredPoint> {
        self.positions
            .iter()
            .zip(self.colors.iter())
            .filter(|(p, _)| is_finite(p))
            .map(|(p, c)| ColoredPoint {
                position: *p,
                color: to_unit(c)
            })
            .collect()
    }

    /// Renderable points moved into viewer space.
    pub fn vertices(&self, scale: &ViewScale) -> Vec<ColoredPoint> {
        let xscale = scale.extent / self.width.max(1) as f32;
        let yscale = scale.extent / self.height.max(1) as f32;

        self.points()
            .into_iter()
            .map(|p| ColoredPoint {
                position: [
                    p.position[0] * xscale,
                    p.position[1] * yscale,
                    p.position[2] * scale.depth_scale + scale.depth_offset
                ],
                color: p.color
            })
            .collect()
    }
}

impl PointCloudProjector {
    pub fn new(depth: DepthTransform) -> Self {
        Self { depth }
    }

    pub fn depth_transform(&self) -> &DepthTransform {
        &self.depth
    }

    /// Reproject a cropped 8 bit disparity map, taking colours from the matching crop of the
    /// left image.
    pub fn project(&self, disparity: &GrayImage, color: &RgbImage) -> Result<PointCloud> {
        if disparity.dimensions() != color.dimensions() {
            return Err(Error::DimensionMismatch {
                left: disparity.dimensions(),
                right: color.dimensions()
            });
        }

        let (width, height) = disparity.dimensions();
        let flipped = imageops::flip_vertical(disparity);

        let mut positions = vec![[0f32; 3]; (width * height) as usize];
        if width > 0 {
            positions
                .par_chunks_mut(width as usize)
                .enumerate()
                .for_each(|(y, row)| {
                    for (x, p) in row.iter_mut().enumerate() {
                        let d = flipped.get_pixel(x as u32, y as u32)[0] as f64;
                        *p = self.depth.reproject(x as f64, y as f64, d);
                    }
                });
        }

        // Grid row y shows image row height - y - 1
        let mut colors = Vec::with_capacity(positions.len());
        for y in 0..height {
            for x in 0..width {
                colors.push(color.get_pixel(x, height - y - 1).0);
            }
        }

        let cloud = PointCloud {
            width,
            height,
            positions,
            colors
        };

        debug!(
            "Reprojected {}x{} disparities, {} finite points",
            width,
            height,
            cloud.positions.iter().filter(|p| is_finite(p)).count()
        );

        Ok(cloud)
    }
}

impl ViewScale {
    /// Viewer scaling for a rig with the given focal length and baseline, searching
    /// `num_disparities` disparities.
    pub fn new(focal_length: f64, baseline: f64, num_disparities: i32) -> Self {
        let extent = 8.0;
        let reference_depth = focal_length * baseline / num_disparities as f64;

        Self {
            extent,
            depth_offset: -6.0,
            depth_scale: (extent as f64 / reference_depth) as f32
        }
    }

    pub fn with_depth_offset(mut self, depth_offset: f32) -> Self {
        self.depth_offset = depth_offset;
        self
    }

    pub fn depth_scale(&self) -> f32 {
        self.depth_scale
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn is_finite(p: &[f32; 3]) -> bool {
    p.iter().all(|v| v.is_finite())
}

fn to_unit(c: &[u8; 3]) -> [f32; 3] {
    [c[0] as f32 / 255.0, c[1] as f32 / 255.0, c[2] as f32 / 255.0]
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{Luma, Rgb};

    fn projector() -> PointCloudProjector {
        PointCloudProjector::new(DepthTransform::from_pinhole(4.0, 3.0, 300.0, 97.0, 4.0))
    }

    #[test]
    fn zero_disparity_is_excluded() {
        let mut disp = GrayImage::from_pixel(8, 6, Luma([50]));
        disp.put_pixel(2, 1, Luma([0]));
        let color = RgbImage::new(8, 6);

        let cloud = projector().project(&disp, &color).unwrap();

        assert_eq!(cloud.len(), 48);
        // Image row 1 lands on grid row 4
        assert!(!cloud.is_finite(2, 4));
        assert_eq!(cloud.points().len(), 47);
    }

    #[test]
    fn depth_follows_focal_length_and_baseline() {
        let disp = GrayImage::from_pixel(8, 6, Luma([97]));
        let cloud = projector().project(&disp, &RgbImage::new(8, 6)).unwrap();

        // Z = f * b / d
        assert_relative_eq!(cloud.position(0, 0)[2], 300.0, epsilon = 1e-3);
        assert_relative_eq!(cloud.position(4, 3)[0], 0.0, epsilon = 1e-3);
    }

    #[test]
    fn colours_follow_the_flip() {
        let disp = GrayImage::from_pixel(3, 2, Luma([10]));
        let mut color = RgbImage::new(3, 2);
        color.put_pixel(1, 0, Rgb([255, 0, 51]));

        let cloud = projector().project(&disp, &color).unwrap();
        let points = cloud.points();

        // Grid row 1 is image row 0
        assert_eq!(points[4].color, [1.0, 0.0, 0.2]);
        assert_eq!(points[1].color, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn mismatched_colour_is_rejected() {
        let res = projector().project(&GrayImage::new(4, 4), &RgbImage::new(4, 3));
        assert!(matches!(res, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn view_scale_fits_the_grid() {
        let disp = GrayImage::from_pixel(8, 6, Luma([112]));
        let cloud = projector().project(&disp, &RgbImage::new(8, 6)).unwrap();
        let scale = ViewScale::new(300.0, 97.0, 112);

        let verts = cloud.vertices(&scale);
        assert_eq!(verts.len(), 48);

        // Depth f * b / 112 maps onto the extent
        assert_relative_eq!(verts[0].position[2], 8.0 - 6.0, epsilon = 1e-3);
    }
}
