// refine/params.rs — Refinement stage configuration.

use serde::{Deserialize, Serialize};

use crate::depth_list::RefineDepthList;
use crate::error::{DepthMapError, Result};
use crate::pyramid::level_for_downscale;
use crate::similarity::PatchParams;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineParams {
    /// Run refinement at all; when off the SGM result is upscaled only.
    pub enabled: bool,
    pub scale: u32,
    pub step_xy: u32,
    /// Hypotheses on each side of the SGM depth.
    pub half_nb_depths: usize,
    /// Hypothesis spacing in pixel sizes.
    pub depth_step: f32,
    pub max_tcs: usize,
    pub patch: PatchParams,
    /// Bilinear upscaling where all four SGM neighbors are valid.
    pub interpolate_middle_depth: bool,
    /// Jacobi iterations of the smoothing step.
    pub n_iterations: usize,
    /// Half window of the texture variance.
    pub variance_wsh: usize,
    /// Variance at which the smoothing weight is halved.
    pub variance_gamma: f32,
    /// Base weight of the neighbor term.
    pub smoothness: f32,
    /// Fraction by which the smoothing weight decays over the iterations.
    pub iteration_decay: f32,
    /// Weight of the upscaled SGM depth in the data term.
    pub sgm_prior_weight: f32,
    pub normal_wsh: usize,
}

impl Default for RefineParams {
    fn default() -> Self {
        RefineParams {
            enabled: true,
            scale: 1,
            step_xy: 1,
            half_nb_depths: 15,
            depth_step: 1.0,
            max_tcs: 6,
            patch: PatchParams { wsh: 3, gamma_c: 15.5, gamma_p: 8.0 },
            interpolate_middle_depth: false,
            n_iterations: 100,
            variance_wsh: 1,
            variance_gamma: 100.0,
            smoothness: 1.0,
            iteration_decay: 0.5,
            sgm_prior_weight: 0.1,
            normal_wsh: 2,
        }
    }
}

impl RefineParams {
    pub fn downscale(&self) -> u32 {
        self.scale * self.step_xy
    }

    pub fn depth_list(&self) -> RefineDepthList {
        RefineDepthList::new(self.half_nb_depths, self.depth_step)
    }

    pub fn validate(&self) -> Result<()> {
        level_for_downscale(self.scale)?;
        if self.step_xy == 0 {
            return Err(DepthMapError::config("refine step_xy must be at least 1"));
        }
        if self.depth_step <= 0.0 {
            return Err(DepthMapError::config(format!(
                "refine depth_step must be positive, got {}",
                self.depth_step
            )));
        }
        if self.patch.wsh < 0 || self.patch.gamma_c <= 0.0 || self.patch.gamma_p <= 0.0 {
            return Err(DepthMapError::config(format!("invalid refine patch {:?}", self.patch)));
        }
        if self.variance_gamma <= 0.0 || self.smoothness < 0.0 || self.sgm_prior_weight < 0.0 {
            return Err(DepthMapError::config("refine smoothing weights out of range"));
        }
        if !(0.0..=1.0).contains(&self.iteration_decay) {
            return Err(DepthMapError::config(format!(
                "refine iteration_decay must lie in [0, 1], got {}",
                self.iteration_decay
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let p = RefineParams::default();
        p.validate().unwrap();
        assert_eq!(p.downscale(), 1);
        assert_eq!(p.depth_list().len(), 31);
    }

    #[test]
    fn test_rejects_bad_decay() {
        let p = RefineParams { iteration_decay: 1.5, ..RefineParams::default() };
        assert!(p.validate().is_err());
    }
}
