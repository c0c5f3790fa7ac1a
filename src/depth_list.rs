// depth_list.rs — Depth hypothesis lists.
//
// Two instances per tile:
//
//   SgmDepthList     wide, coarse: ordered candidate depths across the
//                    whole scene range, spaced so that consecutive
//                    hypotheses move the projection in the neighbor
//                    images by about `step_z` pixels.
//
//   RefineDepthList  narrow, per pixel: d + k · depth_step · pixSize for
//                    k ∈ [-half, half], centered on the SGM result.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::camera::CameraParams;
use crate::error::{DepthMapError, Result};
use crate::roi::Roi;

/// Closed depth interval `[min, max]`, both strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthRange {
    pub min: f64,
    pub max: f64,
}

impl DepthRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min > 0.0 && max > min && max.is_finite()) {
            return Err(DepthMapError::config(format!("invalid depth range [{min}, {max}]")));
        }
        Ok(DepthRange { min, max })
    }

    /// Range of the landmarks visible in `roi`, widened by `margin`
    /// (a fraction: 0.1 widens by 10% on each side).
    pub fn from_points(
        cam: &CameraParams,
        points: &[Vector3<f64>],
        roi: &Roi,
        margin: f64,
    ) -> Option<Self> {
        let (mut lo, mut hi) = (f64::INFINITY, 0.0f64);
        for p in points {
            let Some((u, v)) = cam.project(p) else { continue };
            if !roi.contains(u.floor() as i32, v.floor() as i32) {
                continue;
            }
            let d = cam.depth_of(p);
            lo = lo.min(d);
            hi = hi.max(d);
        }
        if !lo.is_finite() {
            return None;
        }
        let min = (lo * (1.0 - margin)).max(lo * 1e-3);
        let max = hi * (1.0 + margin);
        DepthRange::new(min, max.max(min * (1.0 + 1e-6))).ok()
    }
}

/// Strictly increasing candidate depths for one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct SgmDepthList {
    depths: Vec<f32>,
}

impl SgmDepthList {
    /// Wrap an explicit list. Depths must be positive and strictly increasing.
    pub fn from_depths(depths: Vec<f32>) -> Result<Self> {
        if depths.iter().any(|&d| !(d > 0.0)) {
            return Err(DepthMapError::config("depth hypotheses must be positive"));
        }
        if depths.windows(2).any(|w| w[1] <= w[0]) {
            return Err(DepthMapError::config("depth hypotheses must be strictly increasing"));
        }
        Ok(SgmDepthList { depths })
    }

    /// Uniformly spaced list (mostly for tests and synthetic scenes).
    pub fn linear(range: DepthRange, count: usize) -> Result<Self> {
        if count < 2 {
            return Err(DepthMapError::config("a linear depth list needs at least 2 depths"));
        }
        let step = (range.max - range.min) / (count - 1) as f64;
        Self::from_depths((0..count).map(|i| (range.min + step * i as f64) as f32).collect())
    }

    /// Sample `range` so that each step moves the tile center's projection
    /// by about `step_z` pixels in the most sensitive neighbor, capped to
    /// `max_depths` entries.
    pub fn compute(
        rc: &CameraParams,
        tcs: &[&CameraParams],
        roi: &Roi,
        range: DepthRange,
        step_z: f64,
        max_depths: usize,
    ) -> Result<Self> {
        if step_z <= 0.0 || max_depths < 2 {
            return Err(DepthMapError::config(format!(
                "invalid depth sampling: step_z {step_z}, max_depths {max_depths}"
            )));
        }
        let u = (roi.x.begin + roi.x.end) as f64 * 0.5;
        let v = (roi.y.begin + roi.y.end) as f64 * 0.5;

        // Hard stop so a pathological geometry cannot loop forever.
        let hard_cap = max_depths.saturating_mul(64).max(1024);
        let mut depths: Vec<f32> = Vec::new();
        let mut d = range.min;
        while d <= range.max && depths.len() < hard_cap {
            if depths.last().map_or(true, |&last| (d as f32) > last) {
                depths.push(d as f32);
            }
            let step = step_z * depth_per_pixel(rc, tcs, u, v, d);
            d += step.max(range.min * 1e-6);
        }
        if depths.len() < 2 {
            depths = vec![range.min as f32, range.max as f32];
        }

        if depths.len() > max_depths {
            let n = depths.len();
            depths = (0..max_depths)
                .map(|i| {
                    let idx = (i as f64 * (n - 1) as f64 / (max_depths - 1) as f64).round() as usize;
                    depths[idx]
                })
                .collect();
        }
        Self::from_depths(depths)
    }

    pub fn depths(&self) -> &[f32] {
        &self.depths
    }

    pub fn len(&self) -> usize {
        self.depths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }

    pub fn min(&self) -> Option<f32> {
        self.depths.first().copied()
    }

    pub fn max(&self) -> Option<f32> {
        self.depths.last().copied()
    }
}

/// Depth change that moves the projection of rc pixel (u, v) by one pixel
/// in the neighbor where it moves fastest.
fn depth_per_pixel(rc: &CameraParams, tcs: &[&CameraParams], u: f64, v: f64, d: f64) -> f64 {
    let eps = d * 1e-3;
    let x0 = rc.back_project(u, v, d);
    let x1 = rc.back_project(u, v, d + eps);
    let motion = tcs
        .iter()
        .filter_map(|tc| {
            let (a, b) = (tc.project(&x0)?, tc.project(&x1)?);
            Some(((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt() / eps)
        })
        .fold(0.0f64, f64::max);
    if motion > f64::EPSILON {
        1.0 / motion
    } else {
        rc.pixel_size_at(&x0)
    }
}

/// Narrow per-pixel band for refinement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefineDepthList {
    pub half_nb_depths: usize,
    /// Spacing in units of the pixel size.
    pub depth_step: f32,
}

impl RefineDepthList {
    pub fn new(half_nb_depths: usize, depth_step: f32) -> Self {
        RefineDepthList { half_nb_depths, depth_step }
    }

    pub fn len(&self) -> usize {
        2 * self.half_nb_depths + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Signed offsets `-half ..= half`.
    pub fn offsets(&self) -> impl Iterator<Item = i32> {
        let h = self.half_nb_depths as i32;
        -h..=h
    }

    /// Depth of hypothesis `k` around `center`.
    #[inline]
    pub fn depth_at(&self, center: f32, pix_size: f32, k: i32) -> f32 {
        center + k as f32 * self.depth_step * pix_size
    }

    /// Half-width of the band in depth units.
    #[inline]
    pub fn band(&self, pix_size: f32) -> f32 {
        self.half_nb_depths as f32 * self.depth_step * pix_size
    }
}
