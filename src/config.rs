// config.rs — Pass configuration.
//
// One JSON document configures a depth-map pass. Every section and field
// is optional; missing values take their defaults:
//
//   {
//     "tile":   { "buffer_width": 1024, "buffer_height": 1024, "padding": 64 },
//     "sgm":    { "scale": 2, "step_xy": 2, "p1": 10.0, ... },
//     "refine": { "n_iterations": 100, ... },
//     "backend": "cpu",
//     "merge_tiles": true
//   }

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DepthMapError, Result};
use crate::refine::RefineParams;
use crate::sgm::SgmParams;
use crate::tile::TileParams;

/// Which engine implementation runs the tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthMapConfig {
    pub tile: TileParams,
    pub sgm: SgmParams,
    pub refine: RefineParams,
    pub backend: Backend,
    /// Relative widening of depth ranges derived from landmarks.
    pub depth_range_margin: f64,
    /// Also persist the SGM tile maps (suffix `_sgm`).
    pub export_sgm: bool,
    /// Persist normal maps next to the depth maps.
    pub write_normals: bool,
    /// Merge the tiles of each camera into untiled maps.
    pub merge_tiles: bool,
    /// Delete tile files once merged.
    pub delete_tiles: bool,
}

impl Default for DepthMapConfig {
    fn default() -> Self {
        DepthMapConfig {
            tile: TileParams::default(),
            sgm: SgmParams::default(),
            refine: RefineParams::default(),
            backend: Backend::Cpu,
            depth_range_margin: 0.1,
            export_sgm: false,
            write_normals: true,
            merge_tiles: true,
            delete_tiles: true,
        }
    }
}

impl DepthMapConfig {
    /// Largest downscale of any stage; tiles are aligned to it.
    pub fn max_downscale(&self) -> u32 {
        self.sgm.downscale().max(self.refine.downscale())
    }

    pub fn validate(&self) -> Result<()> {
        self.tile.validate()?;
        self.sgm.validate()?;
        self.refine.validate()?;
        if self.refine.downscale() > self.sgm.downscale() {
            return Err(DepthMapError::config(format!(
                "refine downscale {} is coarser than the SGM downscale {}",
                self.refine.downscale(),
                self.sgm.downscale()
            )));
        }
        let align = self.max_downscale() as i32;
        if self.tile.padding % align != 0 {
            return Err(DepthMapError::config(format!(
                "tile padding {} must be a multiple of the SGM downscale {align}",
                self.tile.padding
            )));
        }
        if !(0.0..1.0).contains(&self.depth_range_margin) {
            return Err(DepthMapError::config(format!(
                "depth_range_margin must lie in [0, 1), got {}",
                self.depth_range_margin
            )));
        }
        if self.delete_tiles && !self.merge_tiles {
            return Err(DepthMapError::config("delete_tiles requires merge_tiles"));
        }
        Ok(())
    }
}

/// Read and validate a JSON configuration file.
pub fn load_config(path: &Path) -> Result<DepthMapConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| DepthMapError::io(path, e))?;
    let config: DepthMapConfig = serde_json::from_str(&text)
        .map_err(|e| DepthMapError::config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    log::debug!("loaded configuration from {}", path.display());
    Ok(config)
}
