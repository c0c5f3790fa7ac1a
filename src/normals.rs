// normals.rs — Surface normals from a depth map by local plane fitting.
//
// For each valid pixel the 3D points of its (2·wsh+1)² neighborhood are
// fitted with a plane: the normal is the eigenvector of the point
// covariance with the smallest eigenvalue. It is then flipped to face
// the camera (n · (C - X) > 0).
//
// Sentinel (-1, -1, -1) when:
//   - the center depth is invalid,
//   - fewer than 3 valid neighbors exist,
//   - the neighborhood is degenerate (points on a line).

use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use rayon::prelude::*;

use crate::frame::MapFrame;
use crate::image::Image;
use crate::maps::{is_valid_depth, NormalMap, NORMAL_INVALID};

/// Ratio under which the middle eigenvalue counts as zero.
const COLLINEAR_RATIO: f64 = 1e-9;

/// Estimate a normal map for `depth`, laid out in `frame`.
pub fn compute_normal_map(depth: &Image<f32>, frame: &MapFrame, wsh: usize) -> NormalMap {
    let (w, h) = (depth.width(), depth.height());
    let mut normals = Image::filled(w, h, NORMAL_INVALID);

    normals
        .as_mut_slice()
        .par_chunks_mut(w.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                if let Some(n) = pixel_normal(depth, frame, x, y, wsh) {
                    *out = [n.x as f32, n.y as f32, n.z as f32];
                }
            }
        });
    normals
}

fn pixel_normal(depth: &Image<f32>, frame: &MapFrame, x: usize, y: usize, wsh: usize) -> Option<Vector3<f64>> {
    let d0 = depth.get(x, y);
    if !is_valid_depth(d0) {
        return None;
    }
    let center = frame.back_project(x, y, d0 as f64);

    let x_lo = x.saturating_sub(wsh);
    let y_lo = y.saturating_sub(wsh);
    let x_hi = (x + wsh).min(depth.width() - 1);
    let y_hi = (y + wsh).min(depth.height() - 1);

    let mut points: Vec<Vector3<f64>> = Vec::with_capacity((2 * wsh + 1).pow(2));
    for yy in y_lo..=y_hi {
        for xx in x_lo..=x_hi {
            let d = depth.get(xx, yy);
            if is_valid_depth(d) {
                points.push(frame.back_project(xx, yy, d as f64));
            }
        }
    }
    if points.len() < 3 {
        return None;
    }

    let n = points.len() as f64;
    let mean = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let cov = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p - mean;
        acc + d * d.transpose()
    }) / n;

    let eig = SymmetricEigen::new(cov);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
    let (smallest, middle, largest) = (order[0], order[1], order[2]);
    if eig.eigenvalues[largest] <= 0.0 || eig.eigenvalues[middle] <= eig.eigenvalues[largest] * COLLINEAR_RATIO {
        return None;
    }

    let mut normal: Vector3<f64> = eig.eigenvectors.column(smallest).into_owned();
    let norm = normal.norm();
    if norm <= f64::EPSILON {
        return None;
    }
    normal /= norm;
    if normal.dot(&(frame.cam.c - center)) < 0.0 {
        normal = -normal;
    }
    Some(normal)
}
