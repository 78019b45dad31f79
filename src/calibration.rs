//! # Stereo calibration
//!
//! Joint calibration of both cameras of a stereo rig from views of an asymmetric circle grid.
//!
//! Calibration images are listed in a JSON manifest, interleaved left, right, left, right, ...
//! The model solved for is deliberately constrained: both cameras share one focal length with
//! unit aspect ratio, the principal points are fixed at the image centre, tangential distortion
//! and the third radial coefficient are held at zero. Only `k1` and `k2` are estimated per camera.
//!
//! The solve is initialised in closed form from plane homographies and refined with
//! Levenberg-Marquardt over the focal length, distortion, the stereo pose and every view's pose.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::{Path, PathBuf};

use image::GrayImage;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, Rotation3, UnitQuaternion, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::camera::{CameraModel, Distortion, StereoExtrinsics};
use crate::error::*;
use crate::pattern::{find_circles_grid, PatternGeometry};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Parameters shared by all views: focal, k1/k2 left, k1/k2 right, stereo rotation, stereo
/// translation.
const NUM_GLOBAL_PARAMS: usize = 11;

/// Parameters per view: rotation and translation of the left camera.
const NUM_VIEW_PARAMS: usize = 6;

const INITIAL_DAMPING: f64 = 1e-3;
const MAX_DAMPING_ATTEMPTS: usize = 10;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Termination criteria of the iterative solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermCriteria {
    pub max_iterations: usize,
    /// Stop once the relative parameter change drops below this value.
    pub epsilon: f64
}

/// Pattern detections in one left/right calibration pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewCorrespondence {
    pub left: Vec<Point2<f64>>,
    pub right: Vec<Point2<f64>>
}

/// Result of a stereo calibration.
#[derive(Debug, Clone)]
pub struct StereoCalibration {
    pub left: CameraModel,
    pub right: CameraModel,
    pub extrinsics: StereoExtrinsics,
    /// Root mean square reprojection error over both cameras, in pixels.
    pub rms_error: f64,
    /// Size of the calibration images.
    pub image_size: (u32, u32),
    /// Number of pairs in which the pattern was found in both images.
    pub used_pairs: usize,
    pub views: Vec<ViewCorrespondence>
}

/// Detects the calibration pattern and solves for both camera models and their relative pose.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    pattern: PatternGeometry,
    criteria: TermCriteria
}

/// A rigid transform from pattern to camera coordinates.
#[derive(Debug, Clone, Copy)]
struct Pose {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>
}

/// The joint least squares problem over all views.
struct StereoProblem<'a> {
    object: &'a [Point3<f64>],
    views: &'a [ViewCorrespondence],
    principal: (f64, f64)
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for TermCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            epsilon: 1e-5
        }
    }
}

impl CalibrationEngine {
    pub fn new(pattern: PatternGeometry) -> Self {
        Self {
            pattern,
            criteria: TermCriteria::default()
        }
    }

    pub fn with_criteria(mut self, criteria: TermCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn pattern(&self) -> &PatternGeometry {
        &self.pattern
    }

    /// Calibrate from the images listed in a JSON manifest.
    pub fn calibrate_from_manifest<P: AsRef<Path>>(&self, manifest: P) -> Result<StereoCalibration> {
        let paths = read_manifest(manifest.as_ref())?;

        if paths.is_empty() {
            return Err(Error::Calibration("calibration manifest lists no images".into()));
        }
        if paths.len() % 2 != 0 {
            return Err(Error::Calibration(format!(
                "calibration manifest lists an odd number of images ({}), expected left/right pairs",
                paths.len()
            )));
        }

        let images = paths
            .iter()
            .map(|p| {
                image::open(p)
                    .map(|i| i.to_luma8())
                    .map_err(|e| Error::Calibration(format!(
                        "could not read calibration image {}: {}", p.display(), e
                    )))
            })
            .collect::<Result<Vec<_>>>()?;

        self.calibrate_images(&images)
    }

    /// Calibrate from interleaved left/right grayscale images.
    pub fn calibrate_images(&self, images: &[GrayImage]) -> Result<StereoCalibration> {
        if images.is_empty() || images.len() % 2 != 0 {
            return Err(Error::Calibration(format!(
                "expected a non-zero, even number of calibration images, got {}",
                images.len()
            )));
        }

        let image_size = images[0].dimensions();
        if let Some(bad) = images.iter().find(|i| i.dimensions() != image_size) {
            return Err(Error::Calibration(format!(
                "calibration images differ in size: {:?} and {:?}",
                image_size,
                bad.dimensions()
            )));
        }

        let detections: Vec<Option<Vec<Point2<f64>>>> = images
            .par_iter()
            .map(|img| find_circles_grid(img, &self.pattern))
            .collect();

        let num_pairs = images.len() / 2;
        let mut views = Vec::with_capacity(num_pairs);

        for (i, pair) in detections.chunks(2).enumerate() {
            match (&pair[0], &pair[1]) {
                (Some(l), Some(r)) => views.push(ViewCorrespondence {
                    left: l.clone(),
                    right: r.clone()
                }),
                (l, r) => warn!(
                    "Calibration pair {} skipped: pattern {} in left, {} in right",
                    i,
                    if l.is_some() { "found" } else { "not found" },
                    if r.is_some() { "found" } else { "not found" }
                )
            }
        }

        if views.len() * 2 < num_pairs {
            return Err(Error::Calibration(format!(
                "pattern only found in {} of {} calibration pairs",
                views.len(),
                num_pairs
            )));
        }

        self.calibrate_points(views, image_size)
    }

    /// Calibrate from already detected pattern points.
    ///
    /// Every view must hold one point per circle, in the order given by
    /// [`PatternGeometry::object_points`].
    pub fn calibrate_points(
        &self,
        views: Vec<ViewCorrespondence>,
        image_size: (u32, u32)
    ) -> Result<StereoCalibration> {
        if views.is_empty() {
            return Err(Error::Calibration(
                "the calibration pattern was not found in any left/right pair".into()
            ));
        }

        let object = self.pattern.object_points();
        if let Some(bad) = views
            .iter()
            .find(|v| v.left.len() != object.len() || v.right.len() != object.len())
        {
            return Err(Error::Calibration(format!(
                "expected {} points per view, got {} left and {} right",
                object.len(),
                bad.left.len(),
                bad.right.len()
            )));
        }

        let principal = (
            (image_size.0 as f64 - 1.0) * 0.5,
            (image_size.1 as f64 - 1.0) * 0.5
        );

        // ---- INITIALISATION ----

        let planar: Vec<Point2<f64>> = object.iter().map(|p| Point2::new(p.x, p.y)).collect();

        let mut homographies = Vec::with_capacity(views.len() * 2);
        for view in views.iter() {
            homographies.push(estimate_homography(&planar, &view.left)?);
            homographies.push(estimate_homography(&planar, &view.right)?);
        }

        let focal = match focal_from_homographies(&homographies, principal) {
            Some(f) => f,
            None => {
                warn!(
                    "Could not initialise the focal length from the pattern views, \
                    falling back to the image width"
                );
                image_size.0 as f64
            }
        };

        let k = Matrix3::new(
            focal, 0.0, principal.0,
            0.0, focal, principal.1,
            0.0, 0.0, 1.0
        );
        let k_inv = k
            .try_inverse()
            .ok_or_else(|| Error::Calibration("singular initial camera matrix".into()))?;

        let mut left_poses = Vec::with_capacity(views.len());
        let mut relative = Vec::with_capacity(views.len());
        for pair in homographies.chunks(2) {
            let l = pose_from_homography(&k_inv, &pair[0])?;
            let r = pose_from_homography(&k_inv, &pair[1])?;

            let rot = r.rotation * l.rotation.transpose();
            relative.push(Pose {
                rotation: rot,
                translation: r.translation - rot * l.translation
            });
            left_poses.push(l);
        }

        let stereo = average_poses(&relative)?;

        debug!(
            "Calibration initialised: focal {:.2}, stereo translation {:?}",
            focal,
            stereo.translation.as_slice()
        );

        // ---- REFINEMENT ----

        let mut params = DVector::<f64>::zeros(NUM_GLOBAL_PARAMS + NUM_VIEW_PARAMS * views.len());
        params[0] = focal;
        write_pose(&mut params, 5, &stereo);
        for (i, pose) in left_poses.iter().enumerate() {
            write_pose(&mut params, NUM_GLOBAL_PARAMS + NUM_VIEW_PARAMS * i, pose);
        }

        let problem = StereoProblem {
            object: &object,
            views: &views,
            principal
        };
        let params = problem.solve(params, &self.criteria)?;

        // ---- RESULTS ----

        let residuals = problem.residuals(&params);
        let rms_error = (residuals.norm_squared() / (residuals.len() / 2) as f64).sqrt();

        let left = problem.camera(&params, 1);
        let right = problem.camera(&params, 3);
        let stereo = read_pose(&params, 5);
        let extrinsics = StereoExtrinsics::new(stereo.rotation, stereo.translation, &left, &right);

        info!(
            "Stereo calibration from {} pairs: RMS error {:.4} px, focal length {:.2} px, \
            baseline {:.3}",
            views.len(),
            rms_error,
            left.fx(),
            extrinsics.translation.norm()
        );

        Ok(StereoCalibration {
            left,
            right,
            extrinsics,
            rms_error,
            image_size,
            used_pairs: views.len(),
            views
        })
    }
}

impl StereoCalibration {
    /// Mean distance, in pixels, between each undistorted detection and the epipolar line of its
    /// counterpart in the other image.
    ///
    /// A quality diagnostic only; it plays no part in the calibration itself.
    pub fn epipolar_error(&self) -> f64 {
        let f = &self.extrinsics.fundamental;
        let mut total = 0.0;
        let mut count = 0usize;

        for view in self.views.iter() {
            for (pl, pr) in view.left.iter().zip(view.right.iter()) {
                let l = self.left.undistort_point(pl, &Matrix3::identity(), &self.left.matrix);
                let r = self.right.undistort_point(pr, &Matrix3::identity(), &self.right.matrix);

                let l = Vector3::new(l.x, l.y, 1.0);
                let r = Vector3::new(r.x, r.y, 1.0);

                let line_r = f * l;
                let line_l = f.transpose() * r;

                total += r.dot(&line_r).abs() / line_r.xy().norm().max(1e-12);
                total += l.dot(&line_l).abs() / line_l.xy().norm().max(1e-12);
                count += 2;
            }
        }

        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }
}

impl<'a> StereoProblem<'a> {
    fn num_residuals(&self) -> usize {
        self.views.len() * self.object.len() * 4
    }

    /// Camera model whose k1/k2 start at `offset` in the parameter vector.
    fn camera(&self, params: &DVector<f64>, offset: usize) -> CameraModel {
        CameraModel::new(
            params[0],
            params[0],
            self.principal.0,
            self.principal.1,
            Distortion {
                k1: params[offset],
                k2: params[offset + 1],
                ..Distortion::none()
            }
        )
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let left = self.camera(params, 1);
        let right = self.camera(params, 3);
        let stereo = read_pose(params, 5);

        let mut res = DVector::zeros(self.num_residuals());
        let mut row = 0;

        for (i, view) in self.views.iter().enumerate() {
            let pose_l = read_pose(params, NUM_GLOBAL_PARAMS + NUM_VIEW_PARAMS * i);
            let pose_r = Pose {
                rotation: stereo.rotation * pose_l.rotation,
                translation: stereo.rotation * pose_l.translation + stereo.translation
            };

            for (cam, pose, observed) in [
                (&left, &pose_l, &view.left),
                (&right, &pose_r, &view.right)
            ].iter() {
                for (obj, obs) in self.object.iter().zip(observed.iter()) {
                    let pc = pose.rotation * obj.coords + pose.translation;
                    if let Some(p) = cam.project(&pc) {
                        res[row] = p.x - obs.x;
                        res[row + 1] = p.y - obs.y;
                    }
                    row += 2;
                }
            }
        }

        res
    }

    fn jacobian(&self, params: &DVector<f64>, base: &DVector<f64>) -> DMatrix<f64> {
        let columns: Vec<DVector<f64>> = (0..params.len())
            .into_par_iter()
            .map(|k| {
                let step = 1e-6 * (1.0 + params[k].abs());
                let mut perturbed = params.clone();
                perturbed[k] += step;
                (self.residuals(&perturbed) - base) / step
            })
            .collect();

        DMatrix::from_columns(&columns)
    }

    /// Levenberg-Marquardt over the full parameter vector.
    fn solve(&self, mut params: DVector<f64>, criteria: &TermCriteria) -> Result<DVector<f64>> {
        let mut damping = INITIAL_DAMPING;
        let mut residuals = self.residuals(&params);
        let mut cost = residuals.norm_squared();

        for iteration in 0..criteria.max_iterations {
            let jac = self.jacobian(&params, &residuals);
            let jt = jac.transpose();
            let jtj = &jt * &jac;
            let gradient = &jt * &residuals;

            let mut step = None;
            for _ in 0..MAX_DAMPING_ATTEMPTS {
                let mut lhs = jtj.clone();
                for d in 0..lhs.nrows() {
                    lhs[(d, d)] += damping * jtj[(d, d)].max(1e-12);
                }

                let delta = match solve_normal(lhs, -&gradient) {
                    Some(d) => d,
                    None => {
                        damping *= 10.0;
                        continue;
                    }
                };

                let candidate = &params + &delta;
                let candidate_res = self.residuals(&candidate);
                let candidate_cost = candidate_res.norm_squared();

                if candidate_cost.is_finite() && candidate_cost < cost {
                    damping = (damping * 0.1).max(1e-12);
                    step = Some((delta, candidate, candidate_res, candidate_cost));
                    break;
                }

                damping *= 10.0;
            }

            let (delta, candidate, candidate_res, candidate_cost) = match step {
                Some(s) => s,
                None => {
                    debug!("Calibration converged after {} iterations (no descent)", iteration);
                    break;
                }
            };

            let relative_change = delta.norm() / params.norm().max(1e-12);

            params = candidate;
            residuals = candidate_res;
            cost = candidate_cost;

            if relative_change < criteria.epsilon {
                debug!("Calibration converged after {} iterations", iteration + 1);
                break;
            }
        }

        if !params.iter().all(|p| p.is_finite()) || params[0] <= 0.0 {
            return Err(Error::Calibration("calibration diverged".into()));
        }

        Ok(params)
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Read the list of calibration image paths from a JSON manifest.
///
/// The manifest is either a bare array of paths or an object whose first array-valued field
/// holds them. Relative paths are resolved against the manifest's directory.
pub fn read_manifest(path: &Path) -> Result<Vec<PathBuf>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::Calibration(format!("could not read calibration manifest {}: {}", path.display(), e))
    })?;

    let value: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
        Error::Calibration(format!("calibration manifest {} is not valid JSON: {}", path.display(), e))
    })?;

    let list = match &value {
        serde_json::Value::Array(a) => Some(a),
        serde_json::Value::Object(o) => o.values().find_map(|v| v.as_array()),
        _ => None
    }
    .ok_or_else(|| Error::Calibration(format!(
        "calibration manifest {} holds no list of images", path.display()
    )))?;

    let base = path.parent().unwrap_or_else(|| Path::new(""));

    list.iter()
        .map(|entry| {
            entry
                .as_str()
                .map(|s| base.join(s))
                .ok_or_else(|| Error::Calibration(format!(
                    "calibration manifest entry {} is not a path", entry
                )))
        })
        .collect()
}

fn solve_normal(lhs: DMatrix<f64>, rhs: DVector<f64>) -> Option<DVector<f64>> {
    match lhs.clone().cholesky() {
        Some(chol) => Some(chol.solve(&rhs)),
        None => lhs.lu().solve(&rhs)
    }
}

fn read_pose(params: &DVector<f64>, offset: usize) -> Pose {
    let rvec = Vector3::new(params[offset], params[offset + 1], params[offset + 2]);
    Pose {
        rotation: Rotation3::from_scaled_axis(rvec).into_inner(),
        translation: Vector3::new(params[offset + 3], params[offset + 4], params[offset + 5])
    }
}

fn write_pose(params: &mut DVector<f64>, offset: usize, pose: &Pose) {
    let rvec = rotation_vector(&pose.rotation);
    for i in 0..3 {
        params[offset + i] = rvec[i];
        params[offset + 3 + i] = pose.translation[i];
    }
}

/// Axis-angle vector of a rotation matrix.
///
/// Goes through a quaternion so that rotations close to the identity, whose trace may round to
/// slightly above 3, still give a finite vector.
fn rotation_vector(rotation: &Matrix3<f64>) -> Vector3<f64> {
    let q = UnitQuaternion::from_matrix(rotation);
    let (w, v) = if q.w < 0.0 { (-q.w, -q.imag()) } else { (q.w, q.imag()) };

    let sin_half = v.norm();
    if sin_half < 1e-12 {
        return v * 2.0;
    }

    v * (2.0 * sin_half.atan2(w) / sin_half)
}

/// Closest rotation matrix in the Frobenius sense.
fn orthonormalise(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u.ok_or_else(|| Error::Calibration("rotation SVD failed".into()))?;
    let v_t = svd.v_t.ok_or_else(|| Error::Calibration("rotation SVD failed".into()))?;

    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u = u;
        u.column_mut(2).neg_mut();
        r = u * v_t;
    }

    Ok(r)
}

/// Average a set of rigid transforms: chordal mean of the rotations, mean of the translations.
fn average_poses(poses: &[Pose]) -> Result<Pose> {
    let n = poses.len() as f64;
    let rot_sum = poses.iter().fold(Matrix3::zeros(), |acc, p| acc + p.rotation);
    let t_sum = poses.iter().fold(Vector3::zeros(), |acc, p| acc + p.translation);

    Ok(Pose {
        rotation: orthonormalise(&(rot_sum / n))?,
        translation: t_sum / n
    })
}

/// Plane to image homography with Hartley normalisation.
fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return Err(Error::Calibration("a homography needs at least 4 point pairs".into()));
    }

    let (src_n, ts) = normalise_points(src);
    let (dst_n, td) = normalise_points(dst);

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let (x, y) = (src_n[i].x, src_n[i].y);
        let (u, v) = (dst_n[i].x, dst_n[i].y);
        let r0 = 2 * i;
        let r1 = r0 + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // The null vector of A is the eigenvector of AᵀA with the smallest eigenvalue
    let ata = a.transpose() * &a;
    let svd = ata.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::Calibration("homography SVD failed".into()))?;
    let h = v_t.row(svd.singular_values.imin());

    let hn = Matrix3::new(
        h[0], h[1], h[2],
        h[3], h[4], h[5],
        h[6], h[7], h[8]
    );

    let td_inv = td
        .try_inverse()
        .ok_or_else(|| Error::Calibration("degenerate pattern detection".into()))?;
    let mut hom = td_inv * hn * ts;
    if hom[(2, 2)].abs() > 1e-12 {
        hom /= hom[(2, 2)];
    }

    Ok(hom)
}

fn normalise_points(points: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;

    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let scale = if mean_dist > 1e-18 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let normalised = points
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * scale, (p.y - mean_y) * scale))
        .collect();

    let t = Matrix3::new(
        scale, 0.0, -mean_x * scale,
        0.0, scale, -mean_y * scale,
        0.0, 0.0, 1.0
    );

    (normalised, t)
}

/// Closed form focal length for square pixels and a known principal point.
///
/// With `w = 1 / f²` every homography gives two linear constraints `A w + C = 0` from the
/// orthogonality and equal norm of the first two rotation columns.
fn focal_from_homographies(homographies: &[Matrix3<f64>], principal: (f64, f64)) -> Option<f64> {
    let shift = Matrix3::new(
        1.0, 0.0, -principal.0,
        0.0, 1.0, -principal.1,
        0.0, 0.0, 1.0
    );

    let mut num = 0.0;
    let mut den = 0.0;

    for h in homographies {
        let mut h = shift * h;
        let norm = h.norm();
        if norm < 1e-12 {
            continue;
        }
        h /= norm;

        let a1 = h[(0, 0)] * h[(0, 1)] + h[(1, 0)] * h[(1, 1)];
        let c1 = h[(2, 0)] * h[(2, 1)];

        let a2 = h[(0, 0)].powi(2) + h[(1, 0)].powi(2) - h[(0, 1)].powi(2) - h[(1, 1)].powi(2);
        let c2 = h[(2, 0)].powi(2) - h[(2, 1)].powi(2);

        num += a1 * c1 + a2 * c2;
        den += a1 * a1 + a2 * a2;
    }

    if den < 1e-18 {
        return None;
    }

    let w = -num / den;
    if w <= 0.0 || !w.is_finite() {
        return None;
    }

    Some(1.0 / w.sqrt())
}

/// Decompose a plane homography into a pose, given the inverse camera matrix.
fn pose_from_homography(k_inv: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<Pose> {
    let r1_raw = k_inv * h.column(0);
    let r2_raw = k_inv * h.column(1);
    let t_raw = k_inv * h.column(2);

    let mut scale = 2.0 / (r1_raw.norm() + r2_raw.norm()).max(1e-18);
    // The pattern must lie in front of the camera
    if t_raw.z < 0.0 {
        scale = -scale;
    }

    let r1 = r1_raw * scale;
    let r2 = r2_raw * scale;
    let r3 = r1.cross(&r2);

    Ok(Pose {
        rotation: orthonormalise(&Matrix3::from_columns(&[r1, r2, r3]))?,
        translation: t_raw * scale
    })
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Luma;
    use imageproc::drawing::draw_filled_circle_mut;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 319.5, 239.5, Distortion::none())
    }

    #[test]
    fn homography_maps_plane_to_image() {
        let cam = camera();
        let object = PatternGeometry::default().object_points();
        let rot = Rotation3::from_euler_angles(0.2, -0.3, 0.1).into_inner();
        let t = Vector3::new(-40.0, -60.0, 600.0);

        let planar: Vec<Point2<f64>> = object.iter().map(|p| Point2::new(p.x, p.y)).collect();
        let image: Vec<Point2<f64>> = object
            .iter()
            .map(|p| cam.project(&(rot * p.coords + t)).unwrap())
            .collect();

        let h = estimate_homography(&planar, &image).unwrap();

        for (p, i) in planar.iter().zip(image.iter()) {
            let q = h * Vector3::new(p.x, p.y, 1.0);
            assert_relative_eq!(q.x / q.z, i.x, epsilon = 1e-6);
            assert_relative_eq!(q.y / q.z, i.y, epsilon = 1e-6);
        }

        let f = focal_from_homographies(&[h], (319.5, 239.5)).unwrap();
        assert_relative_eq!(f, 500.0, epsilon = 1e-3);

        let pose = pose_from_homography(&cam.matrix.try_inverse().unwrap(), &h).unwrap();
        assert_relative_eq!(pose.rotation, rot, epsilon = 1e-6);
        assert_relative_eq!(pose.translation, t, epsilon = 1e-4);
    }

    #[test]
    fn manifest_accepts_array_and_object() {
        let dir = tempfile::tempdir().unwrap();

        let array = dir.path().join("array.json");
        std::fs::write(&array, r#"["l0.png", "r0.png"]"#).unwrap();
        let paths = read_manifest(&array).unwrap();
        assert_eq!(paths, vec![dir.path().join("l0.png"), dir.path().join("r0.png")]);

        let object = dir.path().join("object.json");
        std::fs::write(&object, r#"{"name": "rig", "images": ["/abs/l.png", "/abs/r.png"]}"#).unwrap();
        let paths = read_manifest(&object).unwrap();
        assert_eq!(paths, vec![PathBuf::from("/abs/l.png"), PathBuf::from("/abs/r.png")]);
    }

    #[test]
    fn bad_manifests_are_calibration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CalibrationEngine::new(PatternGeometry::default());

        let missing = engine.calibrate_from_manifest(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(Error::Calibration(_))));

        let odd = dir.path().join("odd.json");
        std::fs::write(&odd, r#"["a.png", "b.png", "c.png"]"#).unwrap();
        assert!(matches!(engine.calibrate_from_manifest(&odd), Err(Error::Calibration(_))));

        let unreadable = dir.path().join("unreadable.json");
        std::fs::write(&unreadable, r#"["a.png", "b.png"]"#).unwrap();
        assert!(matches!(engine.calibrate_from_manifest(&unreadable), Err(Error::Calibration(_))));
    }

    #[test]
    fn no_detected_pairs_is_an_error() {
        let engine = CalibrationEngine::new(PatternGeometry::default());
        let blank = vec![GrayImage::new(64, 64), GrayImage::new(64, 64)];

        assert!(matches!(engine.calibrate_images(&blank), Err(Error::Calibration(_))));
    }

    #[test]
    fn pattern_missing_from_most_pairs_is_an_error() {
        let geometry = PatternGeometry::default();
        let mut grid = GrayImage::from_pixel(360, 360, Luma([230u8]));
        for p in geometry.object_points().iter() {
            let centre = ((p.x * 2.0 + 90.0).round() as i32, (p.y * 2.0 + 60.0).round() as i32);
            draw_filled_circle_mut(&mut grid, centre, 6, Luma([20u8]));
        }
        let blank = GrayImage::from_pixel(360, 360, Luma([230u8]));

        let images = vec![
            grid.clone(), grid,
            blank.clone(), blank.clone(),
            blank.clone(), blank
        ];

        match CalibrationEngine::new(geometry).calibrate_images(&images) {
            Err(Error::Calibration(msg)) => assert!(msg.contains("1 of 3"), "{}", msg),
            other => panic!("expected a calibration error, got {:?}", other.map(|c| c.used_pairs))
        }
    }

    #[test]
    fn pose_parameters_survive_near_identity_rotations() {
        let mut params = DVector::zeros(6);
        let translation = Vector3::new(-22.0, -60.0, 420.0);

        // Identity with round-off, trace just above 3
        let nearly = Matrix3::new(
            1.0, 1e-17, 0.0,
            -1e-17, 1.0 + 4.4e-16, 0.0,
            0.0, 0.0, 1.0 + 4.4e-16
        );
        assert!(nearly.trace() > 3.0);

        for rotation in [Matrix3::identity(), nearly].iter() {
            write_pose(&mut params, 0, &Pose { rotation: *rotation, translation });
            assert!(params.iter().all(|p| p.is_finite()), "{:?}", params);

            let back = read_pose(&params, 0);
            assert_relative_eq!(back.rotation, Matrix3::identity(), epsilon = 1e-9);
            assert_relative_eq!(back.translation, translation);
        }

        let rot = Rotation3::from_euler_angles(0.0, 0.01, 0.0).into_inner();
        write_pose(&mut params, 0, &Pose { rotation: rot, translation });
        assert_relative_eq!(read_pose(&params, 0).rotation, rot, epsilon = 1e-12);
    }

    #[test]
    fn fronto_parallel_view_gives_finite_pose() {
        let cam = camera();
        let object = PatternGeometry::default().object_points();
        let t = Vector3::new(-22.0, -60.0, 420.0);

        let planar: Vec<Point2<f64>> = object.iter().map(|p| Point2::new(p.x, p.y)).collect();
        let image: Vec<Point2<f64>> = object
            .iter()
            .map(|p| cam.project(&(p.coords + t)).unwrap())
            .collect();

        let h = estimate_homography(&planar, &image).unwrap();
        let pose = pose_from_homography(&cam.matrix.try_inverse().unwrap(), &h).unwrap();

        let mut params = DVector::zeros(6);
        write_pose(&mut params, 0, &pose);

        assert!(params.iter().all(|p| p.is_finite()), "{:?}", params);
        assert_relative_eq!(params[3], -22.0, epsilon = 1e-4);
        assert_relative_eq!(params[5], 420.0, epsilon = 1e-3);
    }
}
