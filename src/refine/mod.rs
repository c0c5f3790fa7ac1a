// refine/mod.rs — Refinement Engine (CPU reference).
//
// Per tile, starting from the SGM result:
//
//   1. upscale          SGM depth/sim → refine resolution
//   2. pix size         world footprint of one map step at each depth
//   3. sweep            narrow depth band against the refine neighbors
//   4. variance         texture variance of the reference image
//   5. optimize         variance-guided Jacobi smoothing, clamped to the band
//   6. normals          PCA plane fit on the final depth map
//
// With `enabled = false` only steps 1, 2 and 6 run.

pub mod optimize;
pub mod params;
pub mod sweep;
pub mod upscale;

use crate::camera::CameraView;
use crate::error::Result;
use crate::frame::MapFrame;
use crate::gpu::buffer::{MemoryUsage, PitchedLayout};
use crate::maps::{DepthPixSizeMap, DepthSimMap, NormalMap};
use crate::normals::compute_normal_map;
use crate::sgm::volume::NeighborTexture;
use crate::sgm::SgmResult;
use crate::tile::{Tile, TileParams};

use optimize::SmoothingParams;
pub use params::RefineParams;

/// Refinement output for one tile, at refine resolution.
#[derive(Debug, Clone)]
pub struct RefineResult {
    pub depth_sim: DepthSimMap,
    pub depth_pix_size: DepthPixSizeMap,
    pub normals: NormalMap,
    pub frame: MapFrame,
}

pub struct Refine {
    params: RefineParams,
}

impl Refine {
    pub fn new(params: RefineParams) -> Result<Self> {
        params.validate()?;
        Ok(Refine { params })
    }

    pub fn params(&self) -> &RefineParams {
        &self.params
    }

    pub fn smoothing(&self) -> SmoothingParams {
        SmoothingParams {
            n_iterations: self.params.n_iterations,
            variance_gamma: self.params.variance_gamma,
            smoothness: self.params.smoothness,
            iteration_decay: self.params.iteration_decay,
            sgm_prior_weight: self.params.sgm_prior_weight,
        }
    }

    pub fn refine_rc(
        &self,
        tile: &Tile,
        rc: &CameraView,
        tcs: &[&CameraView],
        sgm: &SgmResult,
    ) -> Result<RefineResult> {
        let p = &self.params;
        let frame = MapFrame::new(rc, &tile.roi, p.scale, p.step_xy)?;
        log::debug!(
            "refine rc {} tile {}/{}: {}×{} map, {} tcs",
            rc.index,
            tile.id + 1,
            tile.nb_tiles,
            frame.width(),
            frame.height(),
            tcs.len()
        );

        let sgm_up = upscale::upscale_depth_sim(&sgm.depth_sim, &sgm.frame, &frame, p.interpolate_middle_depth);
        let mut pix = upscale::compute_pix_size_map(&sgm_up.depth, &frame);

        let depth_sim = if p.enabled && !tcs.is_empty() {
            let rc_image = rc.image_at(p.scale)?;
            let neighbors = tcs
                .iter()
                .map(|tc| {
                    Ok(NeighborTexture {
                        index: tc.index,
                        image: tc.image_at(p.scale)?,
                        cam: tc.camera_at(p.scale)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let list = p.depth_list();
            let mut refined =
                sweep::refine_sweep(&frame, rc_image, &neighbors, &pix, &sgm_up.sim, list, p.patch);

            let variance = optimize::compute_variance(&frame.sample_texture(rc_image), p.variance_wsh);
            optimize::optimize_depth_map(
                &mut refined.depth,
                &refined.sim,
                &sgm_up.depth,
                &pix.pix_size,
                &variance,
                list,
                self.smoothing(),
            );
            refined
        } else {
            sgm_up
        };

        pix.depth = depth_sim.depth.clone();
        let normals = compute_normal_map(&depth_sim.depth, &frame, p.normal_wsh);
        log::debug!(
            "refine rc {} tile {}: {} valid depths",
            rc.index,
            tile.id + 1,
            depth_sim.nb_valid()
        );
        Ok(RefineResult { depth_sim, depth_pix_size: pix, normals, frame })
    }

    /// Memory a tile of maximal size would need (capacity planning).
    pub fn estimate_memory(tile_params: &TileParams, params: &RefineParams) -> MemoryUsage {
        let ds = params.downscale().max(1) as usize;
        let w = (tile_params.buffer_width.max(0) as usize).div_ceil(ds);
        let h = (tile_params.buffer_height.max(0) as usize).div_ceil(ds);
        let f = std::mem::size_of::<f32>();
        MemoryUsage::sum([
            // upscaled sgm depth/sim, pix size
            PitchedLayout::new(w, h, 3, f),
            // refined depth/sim, ping-pong depth
            PitchedLayout::new(w, h, 3, f),
            // sweep cost accumulators (sum + count per hypothesis)
            PitchedLayout::new(w, h, 2 * params.depth_list().len(), f),
            // texture, variance, data term
            PitchedLayout::new(w, h, 3, f),
        ])
    }
}
