// io/paths.rs — File naming for persisted maps.
//
//   full map   {dir}/{rc}_{kind}{_scale<N>}{suffix}.exr
//   tile       {dir}/{rc}_{kind}{_scale<N>}{suffix}_{roiBeginX}_{roiBeginY}.exr
//
// `_scale<N>` is present only when the map scale is above 1. Tile files
// are discovered by matching the full-map stem followed by exactly two
// unsigned integers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DepthMapError, Result};

pub const MAP_EXTENSION: &str = "exr";

/// The kinds of per-camera map files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    Depth,
    Sim,
    Normal,
}

impl MapKind {
    pub fn name(self) -> &'static str {
        match self {
            MapKind::Depth => "depthMap",
            MapKind::Sim => "simMap",
            MapKind::Normal => "normalMap",
        }
    }
}

/// Location and resolution of one set of maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapPaths {
    pub dir: PathBuf,
    /// Pyramid scale of the maps.
    pub scale: u32,
    /// Pixel step on top of the scale.
    pub step: u32,
    /// Free-form suffix appended to the file stem.
    #[serde(default)]
    pub suffix: String,
}

impl MapPaths {
    pub fn new(dir: impl Into<PathBuf>, scale: u32, step: u32) -> Self {
        MapPaths { dir: dir.into(), scale, step, suffix: String::new() }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Total downscale of the stored maps. A scale of 0 counts as 1.
    pub fn downscale(&self) -> i32 {
        (self.scale.max(1) * self.step.max(1)) as i32
    }

    fn stem(&self, rc: usize, kind: MapKind) -> String {
        let mut stem = format!("{rc}_{}", kind.name());
        if self.scale > 1 {
            stem.push_str(&format!("_scale{}", self.scale));
        }
        stem.push_str(&self.suffix);
        stem
    }

    /// Path of the untiled map.
    pub fn map_path(&self, rc: usize, kind: MapKind) -> PathBuf {
        self.dir.join(format!("{}.{MAP_EXTENSION}", self.stem(rc, kind)))
    }

    /// Path of the tile whose full-resolution region starts at `(x, y)`.
    pub fn tile_path(&self, rc: usize, kind: MapKind, x: i32, y: i32) -> PathBuf {
        self.dir.join(format!("{}_{x}_{y}.{MAP_EXTENSION}", self.stem(rc, kind)))
    }

    /// All tile files of `rc` and `kind` in the directory, sorted by name.
    ///
    /// A missing directory is an error; an empty result is not.
    pub fn tile_paths(&self, rc: usize, kind: MapKind) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Err(DepthMapError::io(
                &self.dir,
                std::io::Error::new(std::io::ErrorKind::NotFound, "depth map directory not found"),
            ));
        }
        let stem = self.stem(rc, kind);
        let entries = std::fs::read_dir(&self.dir).map_err(|e| DepthMapError::io(&self.dir, e))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DepthMapError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if parse_tile_origin(name, &stem).is_some() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// `(x, y)` of a tile file name `{stem}_{x}_{y}.exr`, `None` if the name
/// does not follow that pattern.
pub fn parse_tile_origin(file_name: &str, stem: &str) -> Option<(i32, i32)> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix('_')?;
    let rest = rest.strip_suffix(MAP_EXTENSION)?.strip_suffix('.')?;
    let (x, y) = rest.split_once('_')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(x) || !digits(y) {
        return None;
    }
    Some((x.parse().ok()?, y.parse().ok()?))
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
