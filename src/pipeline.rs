// pipeline.rs — Per-camera depth-map estimation.
//
// For each reference camera:
//
//   1. select SGM / refine neighbors by viewing angle
//   2. cut the image into padded tiles aligned to the SGM downscale
//   3. per tile: depth range → SGM depth list → SGM → refine
//   4. persist each tile with its metadata
//   5. merge the tiles into untiled maps, then delete the tiles
//
// The engines behind step 3 are chosen through `TileEngine`: the CPU
// reference (parallel across cameras) or the wgpu engines (one device,
// cameras in sequence).

use std::path::Path;

use nalgebra::Vector3;
use rayon::prelude::*;

use crate::camera::{select_neighbors, CameraParams, CameraView};
use crate::config::{Backend, DepthMapConfig};
use crate::depth_list::{DepthRange, SgmDepthList};
use crate::error::{DepthMapError, Result};
use crate::frame::MapFrame;
use crate::gpu::{GpuDevice, GpuRefine, GpuSgm};
use crate::io::depth_sim_map::{
    delete_depth_sim_map_tiles, read_depth_sim_map, read_normal_map, write_depth_sim_map,
    write_depth_sim_map_tile, write_normal_map_tile,
};
use crate::io::paths::MapPaths;
use crate::maps::{DepthSimMap, NormalMap, NORMAL_INVALID};
use crate::roi::Roi;
use crate::refine::{Refine, RefineResult};
use crate::sgm::{Sgm, SgmResult};
use crate::tile::{make_tiles, tile_roi_list, Tile};

/// Runs the two engines on one tile.
pub trait TileEngine {
    fn name(&self) -> &'static str;

    fn sgm(&mut self, tile: &Tile, rc: &CameraView, tcs: &[&CameraView], depths: &SgmDepthList)
        -> Result<SgmResult>;

    fn refine(&mut self, tile: &Tile, rc: &CameraView, tcs: &[&CameraView], sgm: &SgmResult)
        -> Result<RefineResult>;

    /// Cost profiles of the configured probe pixels for the last SGM tile.
    fn export_probes(&self, path: &Path, depths: &SgmDepthList) -> Result<()>;
}

/// CPU reference engines.
pub struct CpuTileEngine {
    sgm: Sgm,
    refine: Refine,
}

impl CpuTileEngine {
    pub fn new(config: &DepthMapConfig) -> Result<Self> {
        Ok(CpuTileEngine {
            sgm: Sgm::new(config.sgm.clone())?,
            refine: Refine::new(config.refine.clone())?,
        })
    }
}

impl TileEngine for CpuTileEngine {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn sgm(&mut self, tile: &Tile, rc: &CameraView, tcs: &[&CameraView], depths: &SgmDepthList) -> Result<SgmResult> {
        self.sgm.sgm_rc(tile, rc, tcs, depths)
    }

    fn refine(&mut self, tile: &Tile, rc: &CameraView, tcs: &[&CameraView], sgm: &SgmResult) -> Result<RefineResult> {
        self.refine.refine_rc(tile, rc, tcs, sgm)
    }

    fn export_probes(&self, path: &Path, depths: &SgmDepthList) -> Result<()> {
        self.sgm.export_volume_information(path, depths)
    }
}

/// wgpu engines sharing one device.
pub struct GpuTileEngine<'g> {
    sgm: GpuSgm<'g>,
    refine: GpuRefine<'g>,
}

impl<'g> GpuTileEngine<'g> {
    pub fn new(gpu: &'g GpuDevice, config: &DepthMapConfig) -> Result<Self> {
        let sgm = GpuSgm::new(gpu, config.sgm.clone(), &config.tile)?;
        let refine = GpuRefine::new(gpu, config.refine.clone(), &config.sgm, &config.tile)?;
        log::info!(
            "gpu engines on {}: {:.1} MiB sgm, {:.1} MiB refine",
            gpu,
            sgm.device_memory_consumption(),
            refine.device_memory_consumption()
        );
        Ok(GpuTileEngine { sgm, refine })
    }
}

impl TileEngine for GpuTileEngine<'_> {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn sgm(&mut self, tile: &Tile, rc: &CameraView, tcs: &[&CameraView], depths: &SgmDepthList) -> Result<SgmResult> {
        self.sgm.sgm_rc(tile, rc, tcs, depths)
    }

    fn refine(&mut self, tile: &Tile, rc: &CameraView, tcs: &[&CameraView], sgm: &SgmResult) -> Result<RefineResult> {
        self.refine.refine_rc(tile, rc, tcs, sgm)
    }

    fn export_probes(&self, path: &Path, depths: &SgmDepthList) -> Result<()> {
        self.sgm.export_volume_information(path, depths)
    }
}

/// Inputs shared by all cameras of a pass.
#[derive(Debug, Clone, Copy)]
pub struct SceneInput<'a> {
    pub views: &'a [CameraView],
    /// Sparse reconstruction used to bound the depth range of each tile.
    pub landmarks: &'a [Vector3<f64>],
    /// Range for tiles that see no landmark.
    pub fallback_range: Option<DepthRange>,
}

/// Outcome of one camera.
#[derive(Debug, Clone)]
pub struct CameraResult {
    pub rc: usize,
    pub nb_tiles: usize,
    pub sgm_tcs: Vec<usize>,
    pub refine_tcs: Vec<usize>,
    /// Valid depths summed over the persisted tiles.
    pub nb_depth_values: usize,
    /// The merged map, when merging is enabled.
    pub merged: Option<DepthSimMap>,
}

#[derive(Debug)]
pub struct DepthMapEstimator {
    config: DepthMapConfig,
    output: MapPaths,
}

impl DepthMapEstimator {
    /// Maps are written to `dir` at the refine resolution.
    pub fn new(config: DepthMapConfig, dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        config.validate()?;
        let output = MapPaths::new(dir, config.refine.scale, config.refine.step_xy);
        Ok(DepthMapEstimator { config, output })
    }

    pub fn config(&self) -> &DepthMapConfig {
        &self.config
    }

    /// Location of the refined maps.
    pub fn output(&self) -> &MapPaths {
        &self.output
    }

    /// Location of the exported SGM maps.
    pub fn sgm_output(&self) -> MapPaths {
        MapPaths::new(self.output.dir.clone(), self.config.sgm.scale, self.config.sgm.step_xy).with_suffix("_sgm")
    }

    /// Estimate, persist and optionally merge the depth map of camera `rc`
    /// (an index into `scene.views`).
    pub fn estimate_camera<E: TileEngine + ?Sized>(
        &self,
        engine: &mut E,
        scene: &SceneInput<'_>,
        rc: usize,
    ) -> Result<CameraResult> {
        let cfg = &self.config;
        let view = scene
            .views
            .get(rc)
            .ok_or_else(|| DepthMapError::config(format!("no camera {rc} in a scene of {}", scene.views.len())))?;

        let sgm_tcs = select_neighbors(view, scene.views, cfg.sgm.min_view_angle, cfg.sgm.max_view_angle, cfg.sgm.max_tcs);
        let refine_tcs: Vec<usize> = sgm_tcs.iter().copied().take(cfg.refine.max_tcs).collect();
        let rois = tile_roi_list(&cfg.tile, view.width(), view.height(), cfg.max_downscale() as i32)?;
        let tiles = make_tiles(rc, &rois, &sgm_tcs, &refine_tcs);
        log::info!(
            "rc {} ({} engine): {} tiles, {} sgm tcs, {} refine tcs",
            view.index,
            engine.name(),
            tiles.len(),
            sgm_tcs.len(),
            refine_tcs.len()
        );
        if sgm_tcs.is_empty() {
            log::warn!("rc {}: no neighbor camera within the view angle limits", view.index);
        }

        let sgm_views: Vec<&CameraView> = sgm_tcs.iter().map(|&i| &scene.views[i]).collect();
        let refine_views: Vec<&CameraView> = refine_tcs.iter().map(|&i| &scene.views[i]).collect();

        let mut nb_depth_values = 0;
        for tile in &tiles {
            let refined = self.process_tile(engine, scene, tile, view, &sgm_views, &refine_views)?;
            nb_depth_values += refined.depth_sim.nb_valid();
        }

        let merged = if cfg.merge_tiles { Some(self.merge_camera(view, tiles.len())?) } else { None };
        log::info!("rc {}: {} valid depths", view.index, nb_depth_values);
        Ok(CameraResult { rc, nb_tiles: tiles.len(), sgm_tcs, refine_tcs, nb_depth_values, merged })
    }

    fn process_tile<E: TileEngine + ?Sized>(
        &self,
        engine: &mut E,
        scene: &SceneInput<'_>,
        tile: &Tile,
        view: &CameraView,
        sgm_views: &[&CameraView],
        refine_views: &[&CameraView],
    ) -> Result<RefineResult> {
        let cfg = &self.config;
        let range = DepthRange::from_points(&view.params, scene.landmarks, &tile.roi, cfg.depth_range_margin)
            .or(scene.fallback_range);

        let sgm = match range {
            Some(range) => {
                let tc_cams: Vec<&CameraParams> = sgm_views.iter().map(|v| &v.params).collect();
                // One step moves about `step_z` pixels of the matching texture.
                let step_z = cfg.sgm.step_z * cfg.sgm.scale as f64;
                let depths = SgmDepthList::compute(&view.params, &tc_cams, &tile.roi, range, step_z, cfg.sgm.max_depths)?;
                let sgm = engine.sgm(tile, view, sgm_views, &depths)?;
                if !cfg.sgm.export_probes.is_empty() {
                    let name = format!("{}_{}_{}_sgmProbes.csv", view.index, tile.roi.x.begin, tile.roi.y.begin);
                    engine.export_probes(&self.output.dir.join(name), &depths)?;
                }
                sgm
            }
            None => {
                log::debug!("rc {} tile {}: no depth range, tile left empty", view.index, tile.id + 1);
                empty_sgm_result(view, tile, cfg)?
            }
        };
        if cfg.export_sgm {
            let paths = self.sgm_output();
            write_depth_sim_map_tile(&paths, view.index, &view.params, &cfg.tile, &tile.roi, &sgm.depth_sim.depth, &sgm.depth_sim.sim)?;
        }

        let refined = engine.refine(tile, view, refine_views, &sgm)?;
        let d = &refined.depth_sim;
        write_depth_sim_map_tile(&self.output, view.index, &view.params, &cfg.tile, &tile.roi, &d.depth, &d.sim)?;
        if cfg.write_normals {
            write_normal_map_tile(&self.output, view.index, &view.params, &cfg.tile, &tile.roi, &refined.normals)?;
        }
        Ok(refined)
    }

    /// Merge the persisted tiles of `view` into untiled maps.
    fn merge_camera(&self, view: &CameraView, nb_tiles: usize) -> Result<DepthSimMap> {
        let cfg = &self.config;
        let map = read_depth_sim_map(&self.output, view.index, &view.params)?;
        if nb_tiles > 1 {
            write_depth_sim_map(&self.output, view.index, &view.params, &map)?;
            if cfg.write_normals {
                let normals = read_normal_map(&self.output, view.index, &view.params)?;
                let roi = Roi::full(view.width(), view.height());
                write_normal_map_tile(&self.output, view.index, &view.params, &cfg.tile, &roi, &normals)?;
            }
            if cfg.delete_tiles {
                delete_depth_sim_map_tiles(&self.output, view.index)?;
                if cfg.export_sgm {
                    delete_depth_sim_map_tiles(&self.sgm_output(), view.index)?;
                }
            }
        }
        Ok(map)
    }

    /// Estimate every camera in `rcs`. A failing camera does not stop the
    /// others; device setup failure for the GPU backend fails the pass.
    pub fn estimate_all(&self, scene: &SceneInput<'_>, rcs: &[usize]) -> Result<Vec<Result<CameraResult>>> {
        match self.config.backend {
            Backend::Cpu => Ok(rcs
                .par_iter()
                .map(|&rc| {
                    let mut engine = CpuTileEngine::new(&self.config)?;
                    self.estimate_camera(&mut engine, scene, rc)
                })
                .map(|r| self.log_failure(r))
                .collect()),
            Backend::Gpu => {
                let gpu = GpuDevice::new()?;
                let mut engine = GpuTileEngine::new(&gpu, &self.config)?;
                Ok(rcs
                    .iter()
                    .map(|&rc| self.log_failure(self.estimate_camera(&mut engine, scene, rc)))
                    .collect())
            }
        }
    }

    fn log_failure(&self, result: Result<CameraResult>) -> Result<CameraResult> {
        if let Err(e) = &result {
            log::warn!("depth map estimation failed: {e}");
        }
        result
    }
}

/// All-invalid SGM output for a tile without a usable depth range.
fn empty_sgm_result(view: &CameraView, tile: &Tile, cfg: &DepthMapConfig) -> Result<SgmResult> {
    let frame = MapFrame::new(view, &tile.roi, cfg.sgm.scale, cfg.sgm.step_xy)?;
    let (w, h) = (frame.width(), frame.height());
    Ok(SgmResult {
        depth_sim: DepthSimMap::new_invalid(w, h),
        normals: NormalMap::filled(w, h, NORMAL_INVALID),
        frame,
    })
}
