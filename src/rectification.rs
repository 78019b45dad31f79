//! # Stereo rectification
//!
//! Bouguet rectification of a calibrated stereo pair. Both cameras are rotated half way towards
//! each other and then together so that the baseline lies along the image rows; a common focal
//! length and principal row are chosen so that epipolar lines become horizontal scanlines.
//!
//! The result is a pair of remap tables, one per camera, and the depth transform `Q` that
//! reprojects disparities of the rectified pair.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_with, Interpolation};
use log::debug;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2, Rotation3, Vector3};
use rayon::prelude::*;

use crate::calibration::StereoCalibration;
use crate::camera::{CameraModel, DepthTransform};
use crate::error::*;
use crate::frame::StereoPair;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Samples per side of the grid used to find the valid region of a rectified image.
const RECT_SAMPLES: usize = 9;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Rotations and projections which rectify a stereo pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectificationMatrices {
    /// Rotation applied to the left camera.
    pub r1: Matrix3<f64>,
    /// Rotation applied to the right camera.
    pub r2: Matrix3<f64>,
    /// Projection of the rectified left camera.
    pub p1: Matrix3x4<f64>,
    /// Projection of the rectified right camera, carrying the baseline in its last column.
    pub p2: Matrix3x4<f64>,
    pub q: DepthTransform
}

/// Per pixel source coordinates for warping an image.
#[derive(Debug, Clone)]
pub struct RemapTable {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>
}

/// Applies the rectification of a calibrated rig to stereo pairs.
#[derive(Debug, Clone)]
pub struct Rectifier {
    matrices: RectificationMatrices,
    left_map: RemapTable,
    right_map: RemapTable
}

/// Axis aligned rectangle in floating point pixel coordinates.
#[derive(Debug, Clone, Copy)]
struct Rect {
    x: f64,
    y: f64,
    width: f64,
    height: f64
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl RemapTable {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Source coordinates for the destination pixel `(x, y)`.
    pub fn source(&self, x: u32, y: u32) -> (f32, f32) {
        let idx = (y * self.width + x) as usize;
        (self.map_x[idx], self.map_y[idx])
    }

    /// Warp an image through the table with bilinear interpolation and a black border.
    pub fn remap(&self, image: &RgbImage) -> Result<RgbImage> {
        if image.dimensions() != self.dimensions() {
            return Err(Error::InvalidParameter(format!(
                "remap table is {:?} but the image is {:?}",
                self.dimensions(),
                image.dimensions()
            )));
        }

        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;

        Ok(warp_with(
            image,
            |x, y| self.source(x.round().min(max_x).max(0.0) as u32, y.round().min(max_y).max(0.0) as u32),
            Interpolation::Bilinear,
            Rgb([0, 0, 0])
        ))
    }
}

impl Rectifier {
    /// Compute rectification for the calibrated rig at the given image size.
    ///
    /// `alpha` trades between keeping only valid pixels (0) and keeping every source pixel (1).
    pub fn new(calibration: &StereoCalibration, image_size: (u32, u32), alpha: f64) -> Result<Self> {
        let matrices = stereo_rectify(
            &calibration.left,
            &calibration.right,
            &calibration.extrinsics.rotation,
            &calibration.extrinsics.translation,
            image_size,
            alpha
        )?;

        let left_map = init_undistort_rectify_map(
            &calibration.left,
            &matrices.r1,
            &matrices.p1.fixed_slice::<3, 3>(0, 0).into_owned(),
            image_size
        )?;
        let right_map = init_undistort_rectify_map(
            &calibration.right,
            &matrices.r2,
            &matrices.p2.fixed_slice::<3, 3>(0, 0).into_owned(),
            image_size
        )?;

        Ok(Self {
            matrices,
            left_map,
            right_map
        })
    }

    pub fn matrices(&self) -> &RectificationMatrices {
        &self.matrices
    }

    pub fn depth_transform(&self) -> DepthTransform {
        self.matrices.q
    }

    /// Rectify both images of a pair.
    pub fn rectify(&self, pair: &StereoPair) -> Result<StereoPair> {
        let (left, right) = rayon::join(
            || self.left_map.remap(&pair.left),
            || self.right_map.remap(&pair.right)
        );

        StereoPair::new(left?, right?)
    }
}

impl Rect {
    fn right(&self) -> f64 {
        self.x + self.width
    }

    fn bottom(&self) -> f64 {
        self.y + self.height
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Compute the rectifying rotations, projections and depth transform of a stereo rig.
///
/// `rotation` and `translation` take points from the left camera frame into the right one.
pub fn stereo_rectify(
    left: &CameraModel,
    right: &CameraModel,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    image_size: (u32, u32),
    alpha: f64
) -> Result<RectificationMatrices> {
    if image_size.0 == 0 || image_size.1 == 0 {
        return Err(Error::InvalidParameter("cannot rectify an empty image".into()));
    }
    if translation.norm() < 1e-12 {
        return Err(Error::InvalidParameter("cannot rectify a rig with no baseline".into()));
    }

    // Rotate each camera half way, so that both share an orientation
    let om = Rotation3::from_matrix_unchecked(*rotation).scaled_axis();
    let r_half = Rotation3::from_scaled_axis(om * -0.5).into_inner();
    let t = r_half * translation;

    // Then rotate both so that the baseline lies along the dominant image axis
    let idx = if t.x.abs() > t.y.abs() { 0 } else { 1 };
    let c = t[idx];
    let nt = t.norm();

    let mut uu = Vector3::zeros();
    uu[idx] = if c > 0.0 { 1.0 } else { -1.0 };

    let mut ww = t.cross(&uu);
    let nw = ww.norm();
    if nw > 0.0 {
        ww *= (c.abs() / nt).acos() / nw;
    }
    let w_r = Rotation3::from_scaled_axis(ww).into_inner();

    let r1 = w_r * r_half.transpose();
    let r2 = w_r * r_half;
    let t_new = r2 * translation;

    // Common focal length, shrunk for barrel distortion so the image fits
    let (nx, ny) = (image_size.0 as f64, image_size.1 as f64);
    let mut fc_new = f64::MAX;
    for cam in [left, right].iter() {
        let k1 = cam.distortion.k1;
        let mut fc = cam.matrix[(idx ^ 1, idx ^ 1)];
        if k1 < 0.0 {
            fc *= 1.0 + k1 * (nx * nx + ny * ny) / (4.0 * nx * ny);
        }
        fc_new = fc_new.min(fc);
    }

    // Principal points keeping the image centre in place
    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(nx - 1.0, 0.0),
        Point2::new(0.0, ny - 1.0),
        Point2::new(nx - 1.0, ny - 1.0)
    ];
    let centred = Matrix3::new(
        fc_new, 0.0, 0.0,
        0.0, fc_new, 0.0,
        0.0, 0.0, 1.0
    );

    let mut cc_new = [Point2::origin(); 2];
    for (k, (cam, rot)) in [(left, &r1), (right, &r2)].iter().enumerate() {
        let mut avg: Point2<f64> = Point2::origin();
        for corner in corners.iter() {
            let p = cam.undistort_point(corner, rot, &centred);
            avg.x += p.x / 4.0;
            avg.y += p.y / 4.0;
        }
        cc_new[k] = Point2::new((nx - 1.0) / 2.0 - avg.x, (ny - 1.0) / 2.0 - avg.y);
    }

    // Shared principal row (or column for vertical rigs)
    if idx == 0 {
        let y = (cc_new[0].y + cc_new[1].y) / 2.0;
        cc_new[0].y = y;
        cc_new[1].y = y;
    } else {
        let x = (cc_new[0].x + cc_new[1].x) / 2.0;
        cc_new[0].x = x;
        cc_new[1].x = x;
    }

    let mut p1 = projection(fc_new, &cc_new[0]);
    let mut p2 = projection(fc_new, &cc_new[1]);

    // Scale to the requested free scaling
    if alpha >= 0.0 {
        let alpha = alpha.min(1.0);

        let (inner1, outer1) = valid_rectangles(left, &r1, &p1, image_size);
        let (inner2, outer2) = valid_rectangles(right, &r2, &p2, image_size);

        let scale_limits = |cc: &Point2<f64>, rect: &Rect| {
            [
                cc.x / (cc.x - rect.x),
                cc.y / (cc.y - rect.y),
                (nx - 1.0 - cc.x) / (rect.right() - cc.x),
                (ny - 1.0 - cc.y) / (rect.bottom() - cc.y)
            ]
        };

        let s0 = scale_limits(&cc_new[0], &inner1)
            .iter()
            .chain(scale_limits(&cc_new[1], &inner2).iter())
            .fold(f64::MIN, |a, b| a.max(*b));
        let s1 = scale_limits(&cc_new[0], &outer1)
            .iter()
            .chain(scale_limits(&cc_new[1], &outer2).iter())
            .fold(f64::MAX, |a, b| a.min(*b));

        let s = s0 * (1.0 - alpha) + s1 * alpha;
        if s.is_finite() && s > 0.0 {
            fc_new *= s;
            p1 = projection(fc_new, &cc_new[0]);
            p2 = projection(fc_new, &cc_new[1]);
        }
    }

    p2[(idx, 3)] = t_new[idx] * fc_new;

    let principal_offset = if idx == 0 {
        cc_new[0].x - cc_new[1].x
    } else {
        cc_new[0].y - cc_new[1].y
    };

    let q = DepthTransform::from_matrix(Matrix4::new(
        1.0, 0.0, 0.0, -cc_new[0].x,
        0.0, 1.0, 0.0, -cc_new[0].y,
        0.0, 0.0, 0.0, fc_new,
        0.0, 0.0, -1.0 / t_new[idx], principal_offset / t_new[idx]
    ));

    debug!(
        "Rectification: focal {:.2}, principal points {:?} and {:?}, baseline {:.3}",
        fc_new,
        (cc_new[0].x, cc_new[0].y),
        (cc_new[1].x, cc_new[1].y),
        q.baseline()
    );

    Ok(RectificationMatrices { r1, r2, p1, p2, q })
}

/// Build the table mapping each pixel of the rectified image to its source in the raw image.
pub fn init_undistort_rectify_map(
    camera: &CameraModel,
    rotation: &Matrix3<f64>,
    new_matrix: &Matrix3<f64>,
    image_size: (u32, u32)
) -> Result<RemapTable> {
    let (width, height) = image_size;
    if width == 0 || height == 0 {
        return Err(Error::InvalidParameter("remap tables need a non-zero size".into()));
    }

    let inv = (new_matrix * rotation)
        .try_inverse()
        .ok_or_else(|| Error::InvalidParameter("singular rectification transform".into()))?;

    let mut map_x = vec![0.0f32; (width * height) as usize];
    let mut map_y = vec![0.0f32; (width * height) as usize];

    map_x
        .par_chunks_mut(width as usize)
        .zip(map_y.par_chunks_mut(width as usize))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            for x in 0..width as usize {
                let ray = inv * Vector3::new(x as f64, y as f64, 1.0);

                // Points behind the camera have no source, send them off image
                if ray.z.abs() <= 1e-12 {
                    row_x[x] = -1.0;
                    row_y[x] = -1.0;
                    continue;
                }

                let (xd, yd) = camera.distortion.apply(ray.x / ray.z, ray.y / ray.z);
                row_x[x] = (camera.fx() * xd + camera.cx()) as f32;
                row_y[x] = (camera.fy() * yd + camera.cy()) as f32;
            }
        });

    Ok(RemapTable {
        width,
        height,
        map_x,
        map_y
    })
}

fn projection(focal: f64, principal: &Point2<f64>) -> Matrix3x4<f64> {
    Matrix3x4::new(
        focal, 0.0, principal.x, 0.0,
        0.0, focal, principal.y, 0.0,
        0.0, 0.0, 1.0, 0.0
    )
}

/// Inscribed and bounding rectangles of the source image once rectified.
fn valid_rectangles(
    camera: &CameraModel,
    rotation: &Matrix3<f64>,
    projection: &Matrix3x4<f64>,
    image_size: (u32, u32)
) -> (Rect, Rect) {
    let new_matrix = projection.fixed_slice::<3, 3>(0, 0).into_owned();
    let n = RECT_SAMPLES;

    let (mut ix0, mut ix1, mut iy0, mut iy1) = (f64::MIN, f64::MAX, f64::MIN, f64::MAX);
    let (mut ox0, mut ox1, mut oy0, mut oy1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);

    for y in 0..n {
        for x in 0..n {
            let src = Point2::new(
                x as f64 * image_size.0 as f64 / (n - 1) as f64,
                y as f64 * image_size.1 as f64 / (n - 1) as f64
            );
            let p = camera.undistort_point(&src, rotation, &new_matrix);

            ox0 = ox0.min(p.x);
            ox1 = ox1.max(p.x);
            oy0 = oy0.min(p.y);
            oy1 = oy1.max(p.y);

            if x == 0 {
                ix0 = ix0.max(p.x);
            }
            if x == n - 1 {
                ix1 = ix1.min(p.x);
            }
            if y == 0 {
                iy0 = iy0.max(p.y);
            }
            if y == n - 1 {
                iy1 = iy1.min(p.y);
            }
        }
    }

    (
        Rect { x: ix0, y: iy0, width: ix1 - ix0, height: iy1 - iy0 },
        Rect { x: ox0, y: oy0, width: ox1 - ox0, height: oy1 - oy0 }
    )
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Distortion;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, Distortion::none())
    }

    #[test]
    fn aligned_rig_needs_no_rotation() {
        let rect = stereo_rectify(
            &camera(),
            &camera(),
            &Matrix3::identity(),
            &Vector3::new(-60.0, 0.0, 0.0),
            (640, 480),
            0.0
        ).unwrap();

        assert_relative_eq!(rect.r1, Matrix3::identity(), epsilon = 1e-9);
        assert_relative_eq!(rect.r2, Matrix3::identity(), epsilon = 1e-9);

        assert_relative_eq!(rect.q.focal_length(), 500.0, epsilon = 1e-6);
        assert_relative_eq!(rect.q.baseline(), 60.0, epsilon = 1e-6);
        assert_relative_eq!(rect.q.focal_length(), rect.q.matrix()[(2, 3)]);
        assert_relative_eq!(rect.q.baseline(), 1.0 / rect.q.matrix()[(3, 2)]);
    }

    #[test]
    fn full_alpha_keeps_every_source_pixel() {
        let rect = stereo_rectify(
            &camera(),
            &camera(),
            &Matrix3::identity(),
            &Vector3::new(-60.0, 0.0, 0.0),
            (640, 480),
            1.0
        ).unwrap();

        // Slightly zoomed out so the image corners fit
        assert!(rect.q.focal_length() <= 500.0);
        assert!(rect.q.focal_length() > 490.0);
    }

    #[test]
    fn rotated_rig_gets_horizontal_epipolar_lines() {
        let rot = Rotation3::from_euler_angles(0.02, -0.05, 0.01).into_inner();
        let t = Vector3::new(-60.0, 3.0, 1.5);

        let rect = stereo_rectify(&camera(), &camera(), &rot, &t, (640, 480), 0.0).unwrap();

        // A world point seen by both rectified cameras lands on the same row
        let world = Vector3::new(35.0, -20.0, 800.0);
        let left_ray = rect.r1 * world;
        let right_ray = rect.r2 * (rot * world + t);

        let lp = rect.p1 * left_ray.push(1.0);
        let rp = rect.p2.fixed_slice::<3, 3>(0, 0) * right_ray;

        assert_relative_eq!(lp.y / lp.z, rp.y / rp.z, epsilon = 1e-6);
    }

    #[test]
    fn identity_maps_leave_the_image_unchanged() {
        let cam = camera();
        let map = init_undistort_rectify_map(&cam, &Matrix3::identity(), &cam.matrix, (40, 30)).unwrap();

        let (sx, sy) = map.source(12, 7);
        assert_relative_eq!(sx, 12.0, epsilon = 1e-4);
        assert_relative_eq!(sy, 7.0, epsilon = 1e-4);

        let img = RgbImage::from_fn(40, 30, |x, y| Rgb([(x * 5) as u8, (y * 7) as u8, 100]));
        let out = map.remap(&img).unwrap();
        assert_eq!(out.get_pixel(12, 7), img.get_pixel(12, 7));
    }
}
