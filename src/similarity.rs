// similarity.rs — Bilateral-weighted ZNCC patch matching.
//
// For an rc pixel (u, v) and a depth hypothesis d, every patch sample
// (u+dx, v+dy) is back-projected at depth d, projected into the tc and
// sampled bilinearly there. Each sample pair (a, b) is weighted by
//
//   w = exp( -|a - c0| / gamma_c  -  sqrt(dx² + dy²) / gamma_p )
//
// where c0 is the rc color at the patch center: samples that look like
// the center and sit close to it dominate. The score is the weighted
// normalized cross-correlation of a and b, in [-1, 1].
//
// Matching cost (the value stored in similarity volumes):
//
//   cost = clamp((1 - zncc) / 2 · 254, 0, 254)     255 = no valid sample
//
// and the similarity written to maps is cost / 254 · 2 - 1, i.e. -zncc
// (lower is better).

use nalgebra::{Matrix3, Matrix3x4, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::camera::CameraParams;
use crate::image::{sample_bilinear, Image};
use crate::volume::{TSIM_INVALID, TSIM_MAX};

/// Minimum weighted variance for a patch to carry information.
const MIN_PATCH_VARIANCE: f64 = 1e-4;
/// Minimum number of valid samples in a patch.
const MIN_PATCH_SAMPLES: usize = 3;

/// Patch shape and bilateral weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchParams {
    /// Half size: the patch is (2·wsh+1)².
    pub wsh: i32,
    /// Color similarity falloff (intensity units, 0..255 images).
    pub gamma_c: f32,
    /// Proximity falloff (pixels).
    pub gamma_p: f32,
}

#[inline]
pub fn cost_from_zncc(zncc: f32) -> f32 {
    ((1.0 - zncc) * 0.5 * TSIM_MAX).clamp(0.0, TSIM_MAX)
}

/// Map similarity in [-1, 1] from a volume cost.
#[inline]
pub fn sim_from_cost(cost: f32) -> f32 {
    cost.min(TSIM_MAX) / TSIM_MAX * 2.0 - 1.0
}

/// Matching between one rc texture and one tc texture.
///
/// Camera matrices are captured once; evaluating a hypothesis costs one
/// matrix-vector product per patch sample.
pub struct PatchMatcher<'a> {
    rc_img: &'a Image<f32>,
    tc_img: &'a Image<f32>,
    rc_icam: Matrix3<f64>,
    rc_c: Vector3<f64>,
    tc_p: Matrix3x4<f64>,
    params: PatchParams,
}

impl<'a> PatchMatcher<'a> {
    /// Both cameras must be expressed at the resolution of their images.
    pub fn new(
        rc_img: &'a Image<f32>,
        rc_cam: &CameraParams,
        tc_img: &'a Image<f32>,
        tc_cam: &CameraParams,
        params: PatchParams,
    ) -> Self {
        PatchMatcher {
            rc_img,
            tc_img,
            rc_icam: rc_cam.inverse_camera(),
            rc_c: rc_cam.c,
            tc_p: tc_cam.projection(),
            params,
        }
    }

    #[inline]
    fn project_sample(&self, u: f64, v: f64, depth: f64) -> Option<(f32, f32)> {
        let ray = (self.rc_icam * Vector3::new(u, v, 1.0)).normalize();
        let x = self.rc_c + ray * depth;
        let p = self.tc_p * Vector4::new(x.x, x.y, x.z, 1.0);
        if p.z <= f64::EPSILON {
            return None;
        }
        Some(((p.x / p.z) as f32, (p.y / p.z) as f32))
    }

    /// Weighted ZNCC at rc pixel (u, v) for `depth`, `None` if undefined.
    pub fn zncc(&self, u: f64, v: f64, depth: f64) -> Option<f32> {
        let (cu, cv) = (u.round() as i64, v.round() as i64);
        let c0 = self.rc_img.try_get(cu, cv)?;

        // The patch center must land inside the tc.
        let (tu, tv) = self.project_sample(u, v, depth)?;
        sample_bilinear(self.tc_img, tu, tv)?;

        let wsh = self.params.wsh as i64;
        let inv_gc = 1.0 / self.params.gamma_c.max(f32::EPSILON) as f64;
        let inv_gp = 1.0 / self.params.gamma_p.max(f32::EPSILON) as f64;

        let (mut sw, mut sa, mut sb, mut saa, mut sbb, mut sab) = (0.0f64, 0.0, 0.0, 0.0, 0.0, 0.0);
        let mut count = 0usize;
        for dy in -wsh..=wsh {
            for dx in -wsh..=wsh {
                let Some(a) = self.rc_img.try_get(cu + dx, cv + dy) else { continue };
                let Some((tu, tv)) = self.project_sample(u + dx as f64, v + dy as f64, depth) else {
                    return None;
                };
                let Some(b) = sample_bilinear(self.tc_img, tu, tv) else { continue };
                let (a, b) = (a as f64, b as f64);
                let dist = ((dx * dx + dy * dy) as f64).sqrt();
                let w = (-(a - c0 as f64).abs() * inv_gc - dist * inv_gp).exp();
                sw += w;
                sa += w * a;
                sb += w * b;
                saa += w * a * a;
                sbb += w * b * b;
                sab += w * a * b;
                count += 1;
            }
        }
        if count < MIN_PATCH_SAMPLES || sw <= 0.0 {
            return None;
        }
        let (ma, mb) = (sa / sw, sb / sw);
        let va = saa / sw - ma * ma;
        let vb = sbb / sw - mb * mb;
        if va < MIN_PATCH_VARIANCE || vb < MIN_PATCH_VARIANCE {
            return None;
        }
        let cov = sab / sw - ma * mb;
        Some((cov / (va * vb).sqrt()).clamp(-1.0, 1.0) as f32)
    }

    /// Volume cost for the hypothesis, `TSIM_INVALID` when undefined.
    #[inline]
    pub fn cost(&self, u: f64, v: f64, depth: f64) -> f32 {
        self.zncc(u, v, depth).map_or(TSIM_INVALID, cost_from_zncc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(w: usize, h: usize, shift: f32) -> Image<f32> {
        let mut img = Image::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let fx = x as f32 + shift;
                let v = 128.0 + 60.0 * (fx * 0.7).sin() + 40.0 * (y as f32 * 0.45 + fx * 0.2).cos();
                img.set(x, y, v);
            }
        }
        img
    }

    fn cams(baseline: f64) -> (CameraParams, CameraParams) {
        let rc = CameraParams::from_intrinsics(
            50.0, 50.0, 16.0, 16.0, Matrix3::identity(), Vector3::zeros(), 32, 32,
        );
        let tc = CameraParams::from_intrinsics(
            50.0, 50.0, 16.0, 16.0, Matrix3::identity(), Vector3::new(baseline, 0.0, 0.0), 32, 32,
        );
        (rc, tc)
    }

    const PATCH: PatchParams = PatchParams { wsh: 2, gamma_c: 5.5, gamma_p: 8.0 };

    #[test]
    fn test_cost_mapping() {
        assert_eq!(cost_from_zncc(1.0), 0.0);
        assert_eq!(cost_from_zncc(-1.0), TSIM_MAX);
        assert!((sim_from_cost(0.0) + 1.0).abs() < 1e-6);
        assert!((sim_from_cost(TSIM_MAX) - 1.0).abs() < 1e-6);
        assert!((sim_from_cost(TSIM_INVALID) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_identical_views_match_perfectly() {
        let img = textured(32, 32, 0.0);
        let (rc, _) = cams(0.0);
        let m = PatchMatcher::new(&img, &rc, &img, &rc, PATCH);
        let z = m.zncc(16.0, 16.0, 3.0).unwrap();
        assert!(z > 0.999, "zncc {z}");
    }

    #[test]
    fn test_true_depth_beats_wrong_depth() {
        // tc at baseline 0.1 sees a plane at depth 2.5 shifted by
        // f·b/d = 2 px, so tc(x) = rc(x + 2).
        let rc_img = textured(32, 32, 0.0);
        let tc_img = textured(32, 32, 2.0);
        let (rc, tc) = cams(0.1);
        let m = PatchMatcher::new(&rc_img, &rc, &tc_img, &tc, PATCH);
        let good = m.cost(16.0, 16.0, 2.5);
        let bad = m.cost(16.0, 16.0, 1.25);
        assert!(good < 5.0, "good cost {good}");
        assert!(bad > good + 20.0, "bad {bad} good {good}");
    }

    #[test]
    fn test_flat_patch_is_invalid() {
        let img = Image::filled(32, 32, 100.0f32);
        let (rc, _) = cams(0.0);
        let m = PatchMatcher::new(&img, &rc, &img, &rc, PATCH);
        assert_eq!(m.cost(16.0, 16.0, 2.0), TSIM_INVALID);
    }

    #[test]
    fn test_projection_outside_tc_is_invalid() {
        let img = textured(32, 32, 0.0);
        let (rc, tc) = cams(10.0);
        let m = PatchMatcher::new(&img, &rc, &img, &tc, PATCH);
        assert_eq!(m.cost(16.0, 16.0, 1.0), TSIM_INVALID);
    }
}
