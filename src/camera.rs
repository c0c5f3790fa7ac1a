// camera.rs — Pinhole camera geometry for multi-view matching.
//
// Conventions:
//   P   = K [R | -R C]             3×4 projection
//   iCam = (K R)⁻¹ = Rᵀ K⁻¹        pixel → world ray direction
//   depth                          distance from C along the viewing ray
//                                  (not the z coordinate)
//
// A camera at downscale `s` sees pixel (u/s, v/s) where the full camera
// sees (u, v). `rescaled` builds that camera the way the persisted
// metadata expects it: divide the first two rows of P by s and
// re-decompose into K, R, C.
//
// Poses and intrinsics come from upstream structure-from-motion and are
// read-only here.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3, Vector4};

use crate::error::{DepthMapError, Result};
use crate::image::{Image, Pixel};
use crate::pyramid::Pyramid;

/// Intrinsics + pose of one view at one resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraParams {
    pub k: Matrix3<f64>,
    pub r: Matrix3<f64>,
    pub c: Vector3<f64>,
    pub width: usize,
    pub height: usize,
}

impl CameraParams {
    pub fn new(k: Matrix3<f64>, r: Matrix3<f64>, c: Vector3<f64>, width: usize, height: usize) -> Self {
        CameraParams { k, r, c, width, height }
    }

    /// Convenience constructor from focal length and principal point.
    pub fn from_intrinsics(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        r: Matrix3<f64>,
        c: Vector3<f64>,
        width: usize,
        height: usize,
    ) -> Self {
        let k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);
        Self::new(k, r, c, width, height)
    }

    /// Recover K, R, C from a projection matrix (RQ decomposition).
    ///
    /// K is normalized to `K[2][2] = 1` with a positive diagonal and R is
    /// a proper rotation.
    pub fn from_projection(p: &Matrix3x4<f64>, width: usize, height: usize) -> Result<Self> {
        let mut m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();
        let mut p4: Vector3<f64> = p.column(3).into_owned();
        if m.determinant() < 0.0 {
            m = -m;
            p4 = -p4;
        }
        let m_inv = m
            .try_inverse()
            .ok_or_else(|| DepthMapError::config("projection matrix has a singular 3×3 block"))?;
        let c = -(m_inv * p4);

        let (mut k, mut r) = rq_decompose(&m);
        for i in 0..3 {
            if k[(i, i)] < 0.0 {
                k.column_mut(i).neg_mut();
                r.row_mut(i).neg_mut();
            }
        }
        let scale = k[(2, 2)];
        if scale.abs() < f64::EPSILON {
            return Err(DepthMapError::config("degenerate intrinsics in projection matrix"));
        }
        k /= scale;

        Ok(CameraParams { k, r, c, width, height })
    }

    /// `P = K [R | -R C]`.
    pub fn projection(&self) -> Matrix3x4<f64> {
        let kr = self.k * self.r;
        let t = -(kr * self.c);
        let mut p = Matrix3x4::zeros();
        p.fixed_view_mut::<3, 3>(0, 0).copy_from(&kr);
        p.set_column(3, &t);
        p
    }

    /// P padded with the homogeneous row `[0 0 0 1]`.
    pub fn projection_4x4(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 4>(0, 0).copy_from(&self.projection());
        m
    }

    /// `(K R)⁻¹`.
    pub fn inverse_camera(&self) -> Matrix3<f64> {
        let k_inv = self.k.try_inverse().unwrap_or_else(Matrix3::zeros);
        self.r.transpose() * k_inv
    }

    /// The same view seen at `1 / downscale` resolution.
    pub fn rescaled(&self, downscale: f64) -> Result<CameraParams> {
        if downscale <= 0.0 {
            return Err(DepthMapError::config(format!("invalid downscale {downscale}")));
        }
        if (downscale - 1.0).abs() < f64::EPSILON {
            return Ok(self.clone());
        }
        let mut p = self.projection();
        for col in 0..4 {
            p[(0, col)] /= downscale;
            p[(1, col)] /= downscale;
        }
        let w = (self.width as f64 / downscale).ceil() as usize;
        let h = (self.height as f64 / downscale).ceil() as usize;
        Self::from_projection(&p, w, h)
    }

    /// World-space unit ray through pixel (u, v).
    pub fn ray(&self, u: f64, v: f64) -> Vector3<f64> {
        (self.inverse_camera() * Vector3::new(u, v, 1.0)).normalize()
    }

    /// 3D point at `depth` along the ray through (u, v).
    pub fn back_project(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        self.c + self.ray(u, v) * depth
    }

    /// Pixel coordinates of `x`, or `None` if it is behind the camera.
    pub fn project(&self, x: &Vector3<f64>) -> Option<(f64, f64)> {
        let p = self.projection() * Vector4::new(x.x, x.y, x.z, 1.0);
        if p.z <= f64::EPSILON {
            return None;
        }
        Some((p.x / p.z, p.y / p.z))
    }

    /// Distance from the camera center.
    pub fn depth_of(&self, x: &Vector3<f64>) -> f64 {
        (x - self.c).norm()
    }

    /// Optical axis in world coordinates.
    pub fn view_direction(&self) -> Vector3<f64> {
        self.r.transpose() * Vector3::z()
    }

    /// World-space footprint of one pixel at point `x`.
    pub fn pixel_size_at(&self, x: &Vector3<f64>) -> f64 {
        let depth = self.depth_of(x);
        match self.project(x) {
            Some((u, v)) => (self.back_project(u + 1.0, v, depth) - x).norm(),
            None => depth / self.k[(0, 0)].abs().max(f64::EPSILON),
        }
    }
}

/// RQ decomposition `m = K R` with K upper triangular, R orthogonal.
///
/// Computed from the QR decomposition of the row-reversed transpose.
fn rq_decompose(m: &Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    let flip = Matrix3::new(0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
    let qr = (flip * m).transpose().qr();
    let k = flip * qr.r().transpose() * flip;
    let r = flip * qr.q().transpose();
    (k, r)
}

// ---------------------------------------------------------------------------
// CameraView — a camera plus its texture pyramid
// ---------------------------------------------------------------------------

/// One view participating in a depth-map pass.
#[derive(Debug, Clone)]
pub struct CameraView {
    /// Index used for file naming and logging.
    pub index: usize,
    pub params: CameraParams,
    pub pyramid: Pyramid,
}

impl CameraView {
    /// Build the view and a pyramid deep enough for `max_downscale`.
    pub fn new<T: Pixel>(
        index: usize,
        params: CameraParams,
        image: &Image<T>,
        max_downscale: u32,
    ) -> Result<Self> {
        if image.width() != params.width || image.height() != params.height {
            return Err(DepthMapError::config(format!(
                "camera {index}: image is {}×{} but intrinsics expect {}×{}",
                image.width(),
                image.height(),
                params.width,
                params.height
            )));
        }
        let pyramid = Pyramid::build_for_downscale(image, max_downscale)?;
        Ok(CameraView { index, params, pyramid })
    }

    pub fn width(&self) -> usize {
        self.params.width
    }

    pub fn height(&self) -> usize {
        self.params.height
    }

    /// Texture at `1 / downscale` resolution.
    pub fn image_at(&self, downscale: u32) -> Result<&Image<f32>> {
        self.pyramid.at_downscale(downscale)
    }

    /// Camera matching `image_at(downscale)`.
    pub fn camera_at(&self, downscale: u32) -> Result<CameraParams> {
        let mut cam = self.params.rescaled(downscale as f64)?;
        let img = self.image_at(downscale)?;
        cam.width = img.width();
        cam.height = img.height();
        Ok(cam)
    }
}

/// Rank neighbor candidates for `rc` by the angle between optical axes.
///
/// Keeps views whose angle lies within `[min_angle_deg, max_angle_deg]`,
/// smallest angle first, at most `max_tcs`.
pub fn select_neighbors(
    rc: &CameraView,
    candidates: &[CameraView],
    min_angle_deg: f64,
    max_angle_deg: f64,
    max_tcs: usize,
) -> Vec<usize> {
    let rc_dir = rc.params.view_direction();
    let mut scored: Vec<(usize, f64)> = candidates
        .iter()
        .enumerate()
        .filter(|(_, tc)| tc.index != rc.index)
        .filter_map(|(i, tc)| {
            let cos = rc_dir.dot(&tc.params.view_direction()).clamp(-1.0, 1.0);
            let angle = cos.acos().to_degrees();
            let baseline = (tc.params.c - rc.params.c).norm();
            (angle >= min_angle_deg && angle <= max_angle_deg && baseline > f64::EPSILON)
                .then_some((i, angle))
        })
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1));
    scored.into_iter().take(max_tcs).map(|(i, _)| i).collect()
}
