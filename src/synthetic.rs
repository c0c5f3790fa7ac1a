// synthetic.rs — A textured plane seen by a ring of converging cameras.
//
// Used by tests and benches to exercise the engines end to end with a
// known answer:
//
//          plane  Z = distance
//   ───────────────────────────────────
//            ↖    ↑    ↗
//           c2   c0   c1 ...          centers on the X axis,
//                                     all looking at (0, 0, distance)
//
// Camera 0 is the reference; camera i > 0 sits at ±ceil(i/2)·baseline.
// The plane texture is a fixed function of the plane coordinates, so
// every view renders the same surface.

use nalgebra::{Matrix3, Vector3};

use crate::camera::{CameraParams, CameraView};
use crate::depth_list::DepthRange;
use crate::error::Result;
use crate::image::Image;

#[derive(Debug, Clone, PartialEq)]
pub struct PlaneScene {
    pub width: usize,
    pub height: usize,
    pub focal: f64,
    /// Distance of the plane from the reference center along Z.
    pub distance: f64,
    pub baseline: f64,
    pub nb_cameras: usize,
}

impl PlaneScene {
    /// Plane at distance 10 seen by `nb_cameras` views about 5° apart.
    pub fn new(width: usize, height: usize, nb_cameras: usize) -> Self {
        let distance = 10.0;
        PlaneScene {
            width,
            height,
            focal: width as f64 * 1.2,
            distance,
            baseline: distance * 5f64.to_radians().tan(),
            nb_cameras,
        }
    }

    pub fn center(&self, i: usize) -> Vector3<f64> {
        let side = if i % 2 == 1 { 1.0 } else { -1.0 };
        let k = i.div_ceil(2) as f64;
        Vector3::new(side * k * self.baseline, 0.0, 0.0)
    }

    pub fn camera(&self, i: usize) -> CameraParams {
        let c = self.center(i);
        let target = Vector3::new(0.0, 0.0, self.distance);
        CameraParams::from_intrinsics(
            self.focal,
            self.focal,
            (self.width as f64 - 1.0) * 0.5,
            (self.height as f64 - 1.0) * 0.5,
            look_at(&c, &target),
            c,
            self.width,
            self.height,
        )
    }

    /// Distance along the ray of camera `cam` through (u, v) to the plane.
    pub fn depth_at(&self, cam: &CameraParams, u: f64, v: f64) -> f64 {
        let ray = cam.ray(u, v);
        (self.distance - cam.c.z) / ray.z
    }

    /// Ground-truth depth map of camera `i` at full resolution.
    pub fn depth_map(&self, i: usize) -> Image<f32> {
        let cam = self.camera(i);
        let mut depth = Image::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                depth.set(x, y, self.depth_at(&cam, x as f64, y as f64) as f32);
            }
        }
        depth
    }

    /// Image of camera `i`: the plane texture at every pixel's hit point.
    pub fn render(&self, i: usize) -> Image<f32> {
        let cam = self.camera(i);
        let px_per_unit = self.focal / self.distance;
        let mut img = Image::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let (u, v) = (x as f64, y as f64);
                let hit = cam.back_project(u, v, self.depth_at(&cam, u, v));
                img.set(x, y, plane_texture(hit.x * px_per_unit, hit.y * px_per_unit));
            }
        }
        img
    }

    /// Every camera with its pyramid.
    pub fn views(&self, max_downscale: u32) -> Result<Vec<CameraView>> {
        (0..self.nb_cameras)
            .map(|i| CameraView::new(i, self.camera(i), &self.render(i), max_downscale))
            .collect()
    }

    /// A depth range that brackets the plane for every view.
    pub fn depth_range(&self) -> Result<DepthRange> {
        DepthRange::new(self.distance * 0.7, self.distance * 1.5)
    }

    /// Landmarks on the plane, a `n × n` grid covering the reference view.
    pub fn landmarks(&self, n: usize) -> Vec<Vector3<f64>> {
        let cam = self.camera(0);
        let mut points = Vec::with_capacity(n * n);
        for j in 0..n {
            for i in 0..n {
                let u = (i as f64 + 0.5) / n as f64 * self.width as f64;
                let v = (j as f64 + 0.5) / n as f64 * self.height as f64;
                points.push(cam.back_project(u, v, self.depth_at(&cam, u, v)));
            }
        }
        points
    }
}

/// Rotation (world → camera) of a camera at `c` looking at `target`, +Y down.
fn look_at(c: &Vector3<f64>, target: &Vector3<f64>) -> Matrix3<f64> {
    let z = (target - c).normalize();
    let x = Vector3::y().cross(&z).normalize();
    let y = z.cross(&x);
    Matrix3::from_rows(&[x.transpose(), y.transpose(), z.transpose()])
}

/// Smooth aperiodic texture in [~20, ~236], coordinates in reference pixels.
pub fn plane_texture(px: f64, py: f64) -> f32 {
    let waves = 40.0 * (0.35 * px + 0.12 * py).sin()
        + 30.0 * (0.22 * py - 0.17 * px + 1.3).sin()
        + 20.0 * (0.5 * px * 0.6 + 0.41 * py).cos();
    (128.0 + waves + 40.0 * (value_noise(px / 3.0, py / 3.0) - 0.5)) as f32
}

fn lattice(i: i64, j: i64) -> f64 {
    let mut h = (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (j as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    h ^= h >> 29;
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^= h >> 32;
    (h >> 11) as f64 / (1u64 << 53) as f64
}

fn value_noise(x: f64, y: f64) -> f64 {
    let (x0, y0) = (x.floor(), y.floor());
    let (i, j) = (x0 as i64, y0 as i64);
    let smooth = |t: f64| t * t * (3.0 - 2.0 * t);
    let (tx, ty) = (smooth(x - x0), smooth(y - y0));
    let top = lattice(i, j) * (1.0 - tx) + lattice(i + 1, j) * tx;
    let bottom = lattice(i, j + 1) * (1.0 - tx) + lattice(i + 1, j + 1) * tx;
    top * (1.0 - ty) + bottom * ty
}
