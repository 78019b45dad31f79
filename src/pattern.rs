//! # Calibration pattern
//!
//! Geometry and detection of the asymmetric circle grid used to calibrate the stereo rig.
//!
//! The grid is laid out as `rows` rows of `columns` circles, every odd row being shifted by one
//! spacing along the row. Detection thresholds the image with Otsu's method, extracts dark blobs
//! as connected components and orders their centroids into the grid.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::cmp::Ordering;

use image::{GrayImage, Luma};
use imageproc::{
    contrast::{otsu_level, threshold},
    region_labelling::{connected_components, Connectivity}
};
use log::trace;
use nalgebra::{Matrix2, Point2, Point3, SymmetricEigen, Vector2};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Smallest blob, in pixels, considered a circle candidate.
const MIN_BLOB_AREA: u32 = 6;

/// Accepted range of blob area over bounding box area. A disc fills pi/4 of its box.
const FILL_RATIO_RANGE: (f64, f64) = (0.55, 0.95);

/// Largest accepted ratio between the long and short side of a blob's bounding box.
const MAX_BLOB_ELONGATION: f64 = 3.0;

const KMEANS_ITERATIONS: usize = 30;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Physical layout of an asymmetric circle grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternGeometry {
    /// Circles per row.
    pub columns: usize,
    pub rows: usize,
    /// Distance between adjacent rows, in world units.
    pub spacing: f64
}

/// Statistics accumulated for one connected component.
#[derive(Debug, Clone, Copy)]
struct Blob {
    area: u32,
    sum_x: f64,
    sum_y: f64,
    min: (u32, u32),
    max: (u32, u32)
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for PatternGeometry {
    fn default() -> Self {
        Self {
            columns: 4,
            rows: 11,
            spacing: 12.0
        }
    }
}

impl PatternGeometry {
    pub fn new(columns: usize, rows: usize, spacing: f64) -> Self {
        Self {
            columns,
            rows,
            spacing
        }
    }

    pub fn num_points(&self) -> usize {
        self.columns * self.rows
    }

    /// World coordinates of the circle centres, row by row.
    ///
    /// Circle `j` of row `i` lies at `((2j + i mod 2) * s, i * s, 0)`.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        let mut points = Vec::with_capacity(self.num_points());

        for i in 0..self.rows {
            for j in 0..self.columns {
                points.push(Point3::new(
                    (2 * j + i % 2) as f64 * self.spacing,
                    i as f64 * self.spacing,
                    0.0
                ));
            }
        }

        points
    }
}

impl Blob {
    fn new(x: u32, y: u32) -> Self {
        Self {
            area: 0,
            sum_x: 0.0,
            sum_y: 0.0,
            min: (x, y),
            max: (x, y)
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.sum_x += x as f64;
        self.sum_y += y as f64;
        self.min = (self.min.0.min(x), self.min.1.min(y));
        self.max = (self.max.0.max(x), self.max.1.max(y));
    }

    fn centroid(&self) -> Vector2<f64> {
        Vector2::new(self.sum_x / self.area as f64, self.sum_y / self.area as f64)
    }

    fn looks_like_circle(&self, image_area: u32) -> bool {
        if self.area < MIN_BLOB_AREA || self.area > image_area / 20 {
            return false;
        }

        let w = (self.max.0 - self.min.0 + 1) as f64;
        let h = (self.max.1 - self.min.1 + 1) as f64;

        let fill = self.area as f64 / (w * h);
        let elongation = w.max(h) / w.min(h);

        fill >= FILL_RATIO_RANGE.0 && fill <= FILL_RATIO_RANGE.1 && elongation <= MAX_BLOB_ELONGATION
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Find the centres of a dark asymmetric circle grid on a light background.
///
/// Returns the centres in the same order as [`PatternGeometry::object_points`], or `None` if the
/// full grid could not be found.
pub fn find_circles_grid(image: &GrayImage, geometry: &PatternGeometry) -> Option<Vec<Point2<f64>>> {
    let needed = geometry.num_points();
    if needed == 0 || geometry.rows < 2 {
        return None;
    }

    let level = otsu_level(image);
    let binary = threshold(image, level);
    let labels = connected_components(&binary, Connectivity::Eight, Luma([255u8]));

    let mut blobs: Vec<Option<Blob>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if blobs.len() < label {
            blobs.resize(label, None);
        }
        blobs[label - 1].get_or_insert_with(|| Blob::new(x, y)).add(x, y);
    }

    let image_area = image.width() * image.height();
    let mut candidates: Vec<Blob> = blobs
        .into_iter()
        .flatten()
        .filter(|b| b.looks_like_circle(image_area))
        .collect();

    trace!("Circle grid: Otsu level {}, {} candidate blobs", level, candidates.len());

    if candidates.len() < needed {
        return None;
    }

    // Keep the blobs whose area is closest to the median one, spurious blobs are rarely the
    // same size as the grid circles
    if candidates.len() > needed {
        let mut areas: Vec<u32> = candidates.iter().map(|b| b.area).collect();
        areas.sort_unstable();
        let median = areas[areas.len() / 2] as f64;

        candidates.sort_by(|a, b| {
            let da = (a.area as f64 / median).ln().abs();
            let db = (b.area as f64 / median).ln().abs();
            da.partial_cmp(&db).unwrap_or(Ordering::Equal)
        });
        candidates.truncate(needed);
    }

    let centres: Vec<Vector2<f64>> = candidates.iter().map(Blob::centroid).collect();

    order_grid(&centres, geometry)
}

/// Order unordered circle centres into grid order.
///
/// The centres are projected onto their principal axes. Rows are found by clustering the
/// projection along the row axis, circles within a row are sorted along the column axis, and the
/// asymmetric row offset fixes the remaining orientation ambiguity.
fn order_grid(points: &[Vector2<f64>], geometry: &PatternGeometry) -> Option<Vec<Point2<f64>>> {
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;

    let mut cov = Matrix2::<f64>::zeros();
    for p in points {
        let d = p - mean;
        cov += d * d.transpose();
    }
    cov /= n;

    let eig = SymmetricEigen::new(cov);
    let (major, minor) = if eig.eigenvalues[0] >= eig.eigenvalues[1] {
        (0, 1)
    } else {
        (1, 0)
    };

    let axes = [
        eig.eigenvectors.column(major).into_owned(),
        eig.eigenvectors.column(minor).into_owned()
    ];

    for axis in axes.iter() {
        for sign in [1.0, -1.0].iter() {
            let row_dir = axis * *sign;
            // Perpendicular with the same handedness as the image axes
            let col_dir = Vector2::new(row_dir.y, -row_dir.x);

            if let Some(ordered) = try_order(points, &mean, &row_dir, &col_dir, geometry) {
                return Some(ordered);
            }
        }
    }

    None
}

fn try_order(
    points: &[Vector2<f64>],
    mean: &Vector2<f64>,
    row_dir: &Vector2<f64>,
    col_dir: &Vector2<f64>,
    geometry: &PatternGeometry
) -> Option<Vec<Point2<f64>>> {
    // (u, v, index)
    let projected: Vec<(f64, f64, usize)> = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let d = p - mean;
            (d.dot(col_dir), d.dot(row_dir), i)
        })
        .collect();

    let v_vals: Vec<f64> = projected.iter().map(|p| p.1).collect();
    let mut centres = kmeans_1d(&v_vals, geometry.rows, KMEANS_ITERATIONS);
    centres.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let mut rows: Vec<Vec<(f64, f64, usize)>> = vec![Vec::with_capacity(geometry.columns); geometry.rows];
    for p in projected.iter() {
        let nearest = centres
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (p.1 - *a).abs().partial_cmp(&(p.1 - *b).abs()).unwrap_or(Ordering::Equal)
            })
            .map(|(i, _)| i)?;
        rows[nearest].push(*p);
    }

    if rows.iter().any(|r| r.len() != geometry.columns) {
        return None;
    }

    for row in rows.iter_mut() {
        row.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
    }

    // Odd rows start half a column further along than their even neighbours
    for i in 0..(geometry.rows - 1) {
        let this_first = rows[i][0].0;
        let next_first = rows[i + 1][0].0;
        let shifted_right = next_first > this_first;

        if shifted_right != (i % 2 == 0) {
            return None;
        }
    }

    Some(
        rows.iter()
            .flat_map(|r| r.iter())
            .map(|p| Point2::new(points[p.2].x, points[p.2].y))
            .collect()
    )
}

/// 1D k-means with centres initialised evenly over the value range.
fn kmeans_1d(values: &[f64], k: usize, iters: usize) -> Vec<f64> {
    let min_v = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max_v = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if k == 1 || (max_v - min_v).abs() < 1e-12 {
        return vec![0.5 * (min_v + max_v); k];
    }

    let mut centres: Vec<f64> = (0..k)
        .map(|i| min_v + i as f64 * (max_v - min_v) / (k as f64 - 1.0))
        .collect();

    for _ in 0..iters {
        let mut sums = vec![0.0f64; k];
        let mut counts = vec![0usize; k];

        for &v in values {
            let mut best = 0;
            let mut best_dist = (v - centres[0]).abs();
            for (i, &c) in centres.iter().enumerate().skip(1) {
                let dist = (v - c).abs();
                if dist < best_dist {
                    best_dist = dist;
                    best = i;
                }
            }
            sums[best] += v;
            counts[best] += 1;
        }

        for i in 0..k {
            if counts[i] > 0 {
                centres[i] = sums[i] / counts[i] as f64;
            }
        }
    }

    centres
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::draw_filled_circle_mut;

    /// Render the grid with the given pixels per world unit, rotation and offset.
    fn render(geometry: &PatternGeometry, scale: f64, angle: f64, offset: (f64, f64)) -> (GrayImage, Vec<(i32, i32)>) {
        let mut img = GrayImage::from_pixel(360, 360, Luma([230u8]));
        let (s, c) = angle.sin_cos();

        let centres: Vec<(i32, i32)> = geometry
            .object_points()
            .iter()
            .map(|p| {
                let x = p.x * scale;
                let y = p.y * scale;
                (
                    (c * x - s * y + offset.0).round() as i32,
                    (s * x + c * y + offset.1).round() as i32
                )
            })
            .collect();

        for centre in centres.iter() {
            draw_filled_circle_mut(&mut img, *centre, 6, Luma([20u8]));
        }

        (img, centres)
    }

    #[test]
    fn asymmetric_object_points() {
        let pts = PatternGeometry::default().object_points();

        assert_eq!(pts.len(), 44);
        assert_eq!(pts[0], Point3::new(0.0, 0.0, 0.0));
        assert_eq!(pts[1], Point3::new(24.0, 0.0, 0.0));
        assert_eq!(pts[4], Point3::new(12.0, 12.0, 0.0));
        assert_eq!(pts[43], Point3::new(72.0, 120.0, 0.0));
    }

    #[test]
    fn detects_frontal_grid_in_order() {
        let geometry = PatternGeometry::default();
        let (img, expected) = render(&geometry, 2.0, 0.0, (90.0, 60.0));

        let found = find_circles_grid(&img, &geometry).expect("grid not found");

        assert_eq!(found.len(), expected.len());
        for (f, e) in found.iter().zip(expected.iter()) {
            assert!((f.x - e.0 as f64).abs() < 0.5, "{:?} vs {:?}", f, e);
            assert!((f.y - e.1 as f64).abs() < 0.5, "{:?} vs {:?}", f, e);
        }
    }

    #[test]
    fn detects_rotated_grid_in_order() {
        let geometry = PatternGeometry::default();
        let (img, expected) = render(&geometry, 2.0, 0.15, (130.0, 50.0));

        let found = find_circles_grid(&img, &geometry).expect("grid not found");

        for (f, e) in found.iter().zip(expected.iter()) {
            assert!((f.x - e.0 as f64).abs() < 1.0, "{:?} vs {:?}", f, e);
            assert!((f.y - e.1 as f64).abs() < 1.0, "{:?} vs {:?}", f, e);
        }
    }

    #[test]
    fn blank_image_has_no_grid() {
        let img = GrayImage::from_pixel(100, 100, Luma([128u8]));

        assert!(find_circles_grid(&img, &PatternGeometry::default()).is_none());
    }
}
