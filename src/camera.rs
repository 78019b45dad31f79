//! # Camera models
//!
//! Pinhole camera models with radial/tangential distortion, the extrinsic relation between the
//! two cameras of a stereo rig, and the depth transform used to reproject disparities.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use nalgebra::{Matrix3, Matrix4, Point2, Vector3, Vector4};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of fixed point iterations used when inverting the distortion model.
const UNDISTORT_ITERATIONS: usize = 20;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Brown-Conrady distortion coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64
}

/// Intrinsic matrix and distortion of a single camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub matrix: Matrix3<f64>,
    pub distortion: Distortion
}

/// Pose of the right camera relative to the left one, plus the derived epipolar matrices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoExtrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>
}

/// The 4x4 "Q" matrix mapping `(x, y, disparity, 1)` to homogeneous `(X, Y, Z, W)`.
///
/// Serialised as a row-major `[[f64; 4]; 4]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[[f64; 4]; 4]", into = "[[f64; 4]; 4]")]
pub struct DepthTransform(Matrix4<f64>);

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Distortion {
    pub fn none() -> Self {
        Self::default()
    }

    /// Distort normalised image coordinates.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));

        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

        (xd, yd)
    }

    /// Remove distortion from normalised image coordinates by fixed point iteration.
    pub fn remove(&self, xd: f64, yd: f64) -> (f64, f64) {
        let mut x = xd;
        let mut y = yd;

        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            if radial.abs() < 1e-12 {
                break;
            }

            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }

        (x, y)
    }
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, distortion: Distortion) -> Self {
        Self {
            matrix: Matrix3::new(
                fx, 0.0, cx,
                0.0, fy, cy,
                0.0, 0.0, 1.0
            ),
            distortion
        }
    }

    pub fn fx(&self) -> f64 {
        self.matrix[(0, 0)]
    }

    pub fn fy(&self) -> f64 {
        self.matrix[(1, 1)]
    }

    pub fn cx(&self) -> f64 {
        self.matrix[(0, 2)]
    }

    pub fn cy(&self) -> f64 {
        self.matrix[(1, 2)]
    }

    /// Project a point given in camera coordinates to pixel coordinates.
    pub fn project(&self, point: &Vector3<f64>) -> Option<Point2<f64>> {
        if point.z.abs() < 1e-12 {
            return None;
        }

        let (xd, yd) = self.distortion.apply(point.x / point.z, point.y / point.z);

        Some(Point2::new(
            self.fx() * xd + self.cx(),
            self.fy() * yd + self.cy()
        ))
    }

    /// Undistort a pixel, rotate it by `rotation` and project it with `projection`.
    ///
    /// This is the point-wise counterpart of the rectification remap: with an identity rotation
    /// and the camera's own matrix it simply removes lens distortion.
    pub fn undistort_point(
        &self,
        pixel: &Point2<f64>,
        rotation: &Matrix3<f64>,
        projection: &Matrix3<f64>
    ) -> Point2<f64> {
        let xd = (pixel.x - self.cx()) / self.fx();
        let yd = (pixel.y - self.cy()) / self.fy();
        let (x, y) = self.distortion.remove(xd, yd);

        let ray = rotation * Vector3::new(x, y, 1.0);
        let projected = projection * (ray / ray.z);

        Point2::new(projected.x / projected.z, projected.y / projected.z)
    }
}

impl StereoExtrinsics {
    /// Build the extrinsics from the right camera's pose relative to the left one, deriving the
    /// essential and fundamental matrices.
    pub fn new(
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
        left: &CameraModel,
        right: &CameraModel
    ) -> Self {
        let essential = translation.cross_matrix() * rotation;

        let left_inv = left.matrix.try_inverse().unwrap_or_else(Matrix3::identity);
        let right_inv = right.matrix.try_inverse().unwrap_or_else(Matrix3::identity);
        let mut fundamental = right_inv.transpose() * essential * left_inv;

        if fundamental[(2, 2)].abs() > 1e-12 {
            fundamental /= fundamental[(2, 2)];
        }

        Self {
            rotation,
            translation,
            essential,
            fundamental
        }
    }
}

impl DepthTransform {
    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self(matrix)
    }

    /// Build a depth transform for an already rectified pair from its pinhole parameters.
    ///
    /// `cx_right` is the principal point column of the right camera; it equals `cx` for pairs
    /// rectified to zero disparity at infinity.
    pub fn from_pinhole(cx: f64, cy: f64, focal_length: f64, baseline: f64, cx_right: f64) -> Self {
        Self(Matrix4::new(
            1.0, 0.0, 0.0, -cx,
            0.0, 1.0, 0.0, -cy,
            0.0, 0.0, 0.0, focal_length,
            0.0, 0.0, 1.0 / baseline, (cx - cx_right) / baseline
        ))
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    /// Focal length of the rectified cameras, `Q[2][3]`.
    pub fn focal_length(&self) -> f64 {
        self.0[(2, 3)]
    }

    /// Distance between the two camera centres, `1 / Q[3][2]`.
    pub fn baseline(&self) -> f64 {
        1.0 / self.0[(3, 2)]
    }

    /// Reproject a pixel and its disparity to 3D.
    ///
    /// A disparity for which `W` vanishes yields non-finite coordinates; callers treat such
    /// points as having undefined depth.
    pub fn reproject(&self, x: f64, y: f64, disparity: f64) -> [f32; 3] {
        let h = self.0 * Vector4::new(x, y, disparity, 1.0);
        let inv_w = 1.0 / h.w;

        [
            (h.x * inv_w) as f32,
            (h.y * inv_w) as f32,
            (h.z * inv_w) as f32
        ]
    }
}

impl From<[[f64; 4]; 4]> for DepthTransform {
    fn from(rows: [[f64; 4]; 4]) -> Self {
        Self(Matrix4::from_fn(|r, c| rows[r][c]))
    }
}

impl From<DepthTransform> for [[f64; 4]; 4] {
    fn from(q: DepthTransform) -> Self {
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, val) in row.iter_mut().enumerate() {
                *val = q.0[(r, c)];
            }
        }
        rows
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn undistortion_inverts_distortion() {
        let dist = Distortion {
            k1: -0.21,
            k2: 0.05,
            ..Distortion::none()
        };

        let (xd, yd) = dist.apply(0.31, -0.18);
        let (x, y) = dist.remove(xd, yd);

        assert_relative_eq!(x, 0.31, epsilon = 1e-6);
        assert_relative_eq!(y, -0.18, epsilon = 1e-6);
    }

    #[test]
    fn pinhole_depth_transform_reports_focal_and_baseline() {
        let q = DepthTransform::from_pinhole(160.0, 120.0, 300.0, 97.0, 160.0);

        assert_relative_eq!(q.focal_length(), 300.0);
        assert_relative_eq!(q.baseline(), 97.0, epsilon = 1e-9);

        // Z = f * b / d
        let p = q.reproject(160.0, 120.0, 10.0);
        assert_relative_eq!(p[2], 300.0 * 97.0 / 10.0, epsilon = 1e-2);
        assert_relative_eq!(p[0], 0.0);
    }

    #[test]
    fn zero_disparity_has_no_finite_depth() {
        let q = DepthTransform::from_pinhole(160.0, 120.0, 300.0, 97.0, 160.0);

        let p = q.reproject(20.0, 30.0, 0.0);
        assert!(!p[2].is_finite());
    }

    #[test]
    fn depth_transform_serialises_row_major() {
        let q = DepthTransform::from_pinhole(1.0, 2.0, 3.0, 4.0, 1.0);
        let json = serde_json::to_string(&q).unwrap();
        assert!(json.starts_with("[[1.0,0.0,0.0,-1.0]"));

        let back: DepthTransform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn fundamental_matrix_satisfies_epipolar_constraint() {
        let cam = CameraModel::new(500.0, 500.0, 320.0, 240.0, Distortion::none());
        let ext = StereoExtrinsics::new(
            Matrix3::identity(),
            Vector3::new(-60.0, 0.0, 0.0),
            &cam,
            &cam
        );

        let world = Vector3::new(40.0, -25.0, 900.0);
        let l = cam.project(&world).unwrap();
        let r = cam.project(&(ext.rotation * world + ext.translation)).unwrap();

        let err = Vector3::new(r.x, r.y, 1.0).dot(&(ext.fundamental * Vector3::new(l.x, l.y, 1.0)));
        assert!(err.abs() < 1e-6);
    }
}
