// sgm/mod.rs — Similarity Volume Engine (CPU reference).
//
// Per tile:
//
//   1. compute_similarity_volumes   best / second-best cost per voxel
//                                   over all neighbor cameras
//   2. optimize_similarity_volume   SGM aggregation of the best volume;
//                                   the result overwrites the second-best
//                                   volume, whose storage is recycled
//   3. retrieve_best_depth          argmin depth + similarity per pixel
//   4. normals                      PCA plane fit on the depth map
//
// The engine owns its volumes and accumulators and reuses them from tile
// to tile. gpu/sgm.rs mirrors the same stages with wgpu kernels.
//
// Outputs are at `scale · step_xy` downscale over the tile region.

pub mod optimize;
pub mod params;
pub mod retrieve;
pub mod volume;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::camera::CameraView;
use crate::depth_list::SgmDepthList;
use crate::error::{DepthMapError, Result};
use crate::frame::MapFrame;
use crate::gpu::buffer::{MemoryUsage, PitchedLayout};
use crate::image::Image;
use crate::maps::{DepthSimMap, NormalMap};
use crate::normals::compute_normal_map;
use crate::tile::{Tile, TileParams};
use crate::volume::{Volume, TSIM_INVALID};

use optimize::{Penalties, SgmAccumulators};
pub use params::{SgmAxis, SgmParams};
use volume::NeighborTexture;

/// SGM output for one tile.
#[derive(Debug, Clone)]
pub struct SgmResult {
    pub depth_sim: DepthSimMap,
    pub normals: NormalMap,
    pub frame: MapFrame,
}

pub struct Sgm {
    params: SgmParams,
    axes: Vec<SgmAxis>,
    best: Volume<f32>,
    /// Second-best costs; holds the aggregated volume after optimization.
    second: Volume<f32>,
    acc: SgmAccumulators,
    rc_colors: Image<f32>,
}

impl Sgm {
    pub fn new(params: SgmParams) -> Result<Self> {
        params.validate()?;
        let axes = params.axes()?;
        Ok(Sgm {
            params,
            axes,
            best: Volume::filled(0, 0, 0, TSIM_INVALID),
            second: Volume::filled(0, 0, 0, TSIM_INVALID),
            acc: SgmAccumulators::default(),
            rc_colors: Image::new(0, 0),
        })
    }

    pub fn params(&self) -> &SgmParams {
        &self.params
    }

    /// Full SGM pass for one tile.
    pub fn sgm_rc(
        &mut self,
        tile: &Tile,
        rc: &CameraView,
        tcs: &[&CameraView],
        depths: &SgmDepthList,
    ) -> Result<SgmResult> {
        let frame = MapFrame::new(rc, &tile.roi, self.params.scale, self.params.step_xy)?;
        log::debug!(
            "sgm rc {} tile {}/{}: {}×{} map, {} depths, {} tcs",
            rc.index,
            tile.id + 1,
            tile.nb_tiles,
            frame.width(),
            frame.height(),
            depths.len(),
            tcs.len()
        );

        self.compute_similarity_volumes(&frame, rc, tcs, depths)?;
        self.optimize_similarity_volume(&frame, rc)?;
        let depth_sim = self.retrieve_best_depth(depths);
        let normals = compute_normal_map(&depth_sim.depth, &frame, self.params.normal_wsh);

        log::debug!(
            "sgm rc {} tile {}: {} valid depths",
            rc.index,
            tile.id + 1,
            depth_sim.nb_valid()
        );
        Ok(SgmResult { depth_sim, normals, frame })
    }

    /// Stage 1: fill the best and second-best volumes.
    pub fn compute_similarity_volumes(
        &mut self,
        frame: &MapFrame,
        rc: &CameraView,
        tcs: &[&CameraView],
        depths: &SgmDepthList,
    ) -> Result<()> {
        let scale = self.params.scale;
        let rc_image = rc.image_at(scale)?;
        let neighbors = tcs
            .iter()
            .map(|tc| {
                Ok(NeighborTexture {
                    index: tc.index,
                    image: tc.image_at(scale)?,
                    cam: tc.camera_at(scale)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        volume::compute_similarity_volumes(
            frame,
            rc_image,
            &neighbors,
            depths.depths(),
            self.params.patch,
            &mut self.best,
            &mut self.second,
        );
        Ok(())
    }

    /// Stage 2: aggregate the best volume into the second-best storage.
    pub fn optimize_similarity_volume(&mut self, frame: &MapFrame, rc: &CameraView) -> Result<()> {
        let rc_image = rc.image_at(self.params.scale)?;
        self.rc_colors = frame.sample_texture(rc_image);
        optimize::optimize_similarity_volume(
            &self.best,
            &mut self.second,
            &self.rc_colors,
            &self.axes,
            Penalties { p1: self.params.p1, p2_weighting: self.params.p2_weighting },
            &mut self.acc,
        );
        Ok(())
    }

    /// Stage 3: depth/similarity map from the aggregated volume.
    pub fn retrieve_best_depth(&self, depths: &SgmDepthList) -> DepthSimMap {
        retrieve::retrieve_best_depth(
            &self.best,
            &self.second,
            depths.depths(),
            self.params.interpolate_retrieve_best_depth,
        )
    }

    pub fn best_volume(&self) -> &Volume<f32> {
        &self.best
    }

    /// Second-best costs before optimization, aggregated costs after.
    pub fn second_best_volume(&self) -> &Volume<f32> {
        &self.second
    }

    /// Write the cost profile of every probe pixel as CSV, see
    /// [`write_volume_probes`]. After a full `sgm_rc` the second column
    /// holds the aggregated cost.
    pub fn export_volume_information(&self, path: &Path, depths: &SgmDepthList) -> Result<()> {
        write_volume_probes(path, &self.params.export_probes, &self.best, &self.second, depths)
    }

    /// Memory currently held, with device row pitch applied (MiB).
    pub fn device_memory_consumption(&self) -> f64 {
        self.memory_usage().padded_mib()
    }

    /// Memory currently held, without pitch padding (MiB).
    pub fn device_memory_consumption_unpadded(&self) -> f64 {
        self.memory_usage().unpadded_mib()
    }

    fn memory_usage(&self) -> MemoryUsage {
        let (w, h, nz) = (self.best.width(), self.best.height(), self.best.depth());
        let other = self.acc.axis_acc.len();
        let f = std::mem::size_of::<f32>();
        MemoryUsage::sum([
            PitchedLayout::new(w, h, nz, f),
            PitchedLayout::new(w, h, nz, f),
            PitchedLayout::new(nz, other, 1, f),
            PitchedLayout::new(nz, other, 1, f),
            PitchedLayout::new(other, 1, 1, f),
            PitchedLayout::new(self.rc_colors.width(), self.rc_colors.height(), 1, f),
        ])
    }

    /// Memory a tile of maximal size would need (capacity planning).
    pub fn estimate_memory(tile_params: &TileParams, params: &SgmParams) -> MemoryUsage {
        let ds = params.downscale().max(1) as usize;
        let w = (tile_params.buffer_width.max(0) as usize).div_ceil(ds);
        let h = (tile_params.buffer_height.max(0) as usize).div_ceil(ds);
        let nz = params.max_depths;
        let other = w.max(h);
        let f = std::mem::size_of::<f32>();
        MemoryUsage::sum([
            // best, second-best (aggregated) volumes
            PitchedLayout::new(w, h, nz, f),
            PitchedLayout::new(w, h, nz, f),
            // slice accumulators A/B and axis buffer
            PitchedLayout::new(nz, other, 1, f),
            PitchedLayout::new(nz, other, 1, f),
            PitchedLayout::new(other, 1, 1, f),
            // depth list, rc colors, depth+sim, normals
            PitchedLayout::new(nz, 1, 1, f),
            PitchedLayout::new(w, h, 1, f),
            PitchedLayout::new(w, h, 2, f),
            PitchedLayout::new(w * 3, h, 1, f),
        ])
    }
}

/// CSV `x,y,z,depth,best,second` of the probe pixels; probes outside the
/// volume are skipped.
pub fn write_volume_probes(
    path: &Path,
    probes: &[[u32; 2]],
    best: &Volume<f32>,
    second: &Volume<f32>,
    depths: &SgmDepthList,
) -> Result<()> {
    let file = File::create(path).map_err(|e| DepthMapError::io(path, e))?;
    let mut out = BufWriter::new(file);
    let io = |e| DepthMapError::io(path, e);
    writeln!(out, "x,y,z,depth,best,second").map_err(io)?;
    for &[x, y] in probes {
        let (x, y) = (x as usize, y as usize);
        if x >= best.width() || y >= best.height() {
            continue;
        }
        for (z, d) in depths.depths().iter().enumerate().take(best.depth()) {
            writeln!(out, "{x},{y},{z},{d},{},{}", best.get(x, y, z), second.get(x, y, z)).map_err(io)?;
        }
    }
    out.flush().map_err(io)?;
    log::debug!("exported sgm volume probes to {}", path.display());
    Ok(())
}
