// sgm/params.rs — SGM stage configuration.

use serde::{Deserialize, Serialize};

use crate::error::{DepthMapError, Result};
use crate::pyramid::level_for_downscale;
use crate::similarity::PatchParams;

/// Aggregation direction: slices are swept along this image axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgmAxis {
    /// Sweep columns left→right and right→left.
    X,
    /// Sweep rows top→bottom and bottom→top.
    Y,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgmParams {
    /// Pyramid downscale of the textures used for matching.
    pub scale: u32,
    /// Map pixel spacing in `scale` image pixels.
    pub step_xy: u32,
    /// Cap on the number of depth hypotheses per tile.
    pub max_depths: usize,
    /// Hypothesis spacing in neighbor-image pixels.
    pub step_z: f64,
    /// Neighbor cameras per reference camera.
    pub max_tcs: usize,
    /// Accepted angle between optical axes for neighbor selection (degrees).
    pub min_view_angle: f64,
    pub max_view_angle: f64,
    pub patch: PatchParams,
    /// Penalty for a ±1 depth-index change between neighbors.
    pub p1: f32,
    /// Numerator of the color-adaptive penalty for larger jumps.
    pub p2_weighting: f32,
    /// Aggregation axes, e.g. "YX".
    pub filtering_axes: String,
    /// Parabolic sub-depth interpolation in best-depth retrieval.
    pub interpolate_retrieve_best_depth: bool,
    /// Half window of the plane fit used for normals.
    pub normal_wsh: usize,
    /// Map pixels whose cost profiles are exported for diagnostics.
    pub export_probes: Vec<[u32; 2]>,
}

impl Default for SgmParams {
    fn default() -> Self {
        SgmParams {
            scale: 2,
            step_xy: 2,
            max_depths: 1500,
            step_z: 1.0,
            max_tcs: 10,
            min_view_angle: 2.0,
            max_view_angle: 70.0,
            patch: PatchParams { wsh: 4, gamma_c: 5.5, gamma_p: 8.0 },
            p1: 10.0,
            p2_weighting: 100.0,
            filtering_axes: "YX".to_string(),
            interpolate_retrieve_best_depth: false,
            normal_wsh: 2,
            export_probes: Vec::new(),
        }
    }
}

impl SgmParams {
    /// Total downscale of the SGM maps relative to full resolution.
    pub fn downscale(&self) -> u32 {
        self.scale * self.step_xy
    }

    pub fn axes(&self) -> Result<Vec<SgmAxis>> {
        let mut axes = Vec::new();
        for ch in self.filtering_axes.chars() {
            let axis = match ch.to_ascii_uppercase() {
                'X' => SgmAxis::X,
                'Y' => SgmAxis::Y,
                other => {
                    return Err(DepthMapError::config(format!(
                        "unknown SGM filtering axis '{other}' in \"{}\"",
                        self.filtering_axes
                    )))
                }
            };
            if axes.contains(&axis) {
                return Err(DepthMapError::config(format!(
                    "duplicate SGM filtering axis in \"{}\"",
                    self.filtering_axes
                )));
            }
            axes.push(axis);
        }
        Ok(axes)
    }

    pub fn validate(&self) -> Result<()> {
        level_for_downscale(self.scale)?;
        if self.step_xy == 0 {
            return Err(DepthMapError::config("SGM step_xy must be at least 1"));
        }
        if self.max_depths < 2 || self.step_z <= 0.0 {
            return Err(DepthMapError::config(format!(
                "SGM depth sampling invalid: max_depths {}, step_z {}",
                self.max_depths, self.step_z
            )));
        }
        if self.patch.wsh < 0 || self.patch.gamma_c <= 0.0 || self.patch.gamma_p <= 0.0 {
            return Err(DepthMapError::config(format!("invalid SGM patch {:?}", self.patch)));
        }
        if self.p1 < 0.0 || self.p2_weighting < 0.0 {
            return Err(DepthMapError::config("SGM penalties must be non-negative"));
        }
        self.axes()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let p = SgmParams::default();
        p.validate().unwrap();
        assert_eq!(p.downscale(), 4);
        assert_eq!(p.axes().unwrap(), vec![SgmAxis::Y, SgmAxis::X]);
    }

    #[test]
    fn test_bad_axes() {
        let p = SgmParams { filtering_axes: "XZ".into(), ..SgmParams::default() };
        assert!(p.validate().is_err());
        let p = SgmParams { filtering_axes: "XX".into(), ..SgmParams::default() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_bad_scale() {
        let p = SgmParams { scale: 3, ..SgmParams::default() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let p: SgmParams = serde_json::from_str(r#"{ "scale": 1, "p1": 5.0 }"#).unwrap();
        assert_eq!(p.scale, 1);
        assert_eq!(p.p1, 5.0);
        assert_eq!(p.p2_weighting, 100.0);
    }
}
