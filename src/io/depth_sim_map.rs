// io/depth_sim_map.rs — Reading and writing per-camera maps.
//
// Writers take a buffer computed over a full-resolution region and decide
// between the untiled and the tiled file name: a buffer covering the whole
// downscaled map is written untiled.
//
// Readers prefer the untiled file and fall back to merging tiles
// (merge.rs). Storage:
//
//   depthMap    1 channel  "Y"         f32
//   simMap      1 channel  "Y"         f16
//   normalMap   3 channels "R" "G" "B" f32

use std::path::Path;

use crate::camera::CameraParams;
use crate::error::{DepthMapError, Result};
use crate::image::Image;
use crate::io::exr::{self, Canvas, StorageType};
use crate::io::metadata::{self, TileMetadata};
use crate::io::paths::{file_name, MapKind, MapPaths};
use crate::maps::{count_valid_depths, DepthSimMap, NormalMap, NORMAL_INVALID};
use crate::merge;
use crate::roi::{divide_round_up, Roi};
use crate::tile::TileParams;

const GRAY: &str = "Y";
const NORMAL_CHANNELS: [&str; 3] = ["R", "G", "B"];

/// Size of the stored maps of a `width × height` camera.
pub fn map_size(paths: &MapPaths, cam: &CameraParams) -> (usize, usize) {
    let ds = paths.downscale();
    (
        divide_round_up(cam.width as i32, ds) as usize,
        divide_round_up(cam.height as i32, ds) as usize,
    )
}

/// Canvas and destination of a buffer of `roi`.
fn placement(paths: &MapPaths, rc: usize, cam: &CameraParams, kind: MapKind, roi: &Roi) -> (Canvas, std::path::PathBuf) {
    let (w, h) = map_size(paths, cam);
    let canvas = Canvas { width: w, height: h, data: roi.downscale(paths.downscale()) };
    let path = if canvas.is_tile() {
        paths.tile_path(rc, kind, roi.x.begin, roi.y.begin)
    } else {
        paths.map_path(rc, kind)
    };
    (canvas, path)
}

fn check_buffer(canvas: &Canvas, w: usize, h: usize) -> Result<()> {
    if canvas.data.width() != w || canvas.data.height() != h {
        return Err(DepthMapError::config(format!(
            "map buffer is {w}×{h} but region {} covers {}×{}",
            canvas.data,
            canvas.data.width(),
            canvas.data.height()
        )));
    }
    Ok(())
}

/// Write the depth and similarity buffers of `roi`.
///
/// Either image may be empty (0×0) to skip that file.
pub fn write_depth_sim_map_tile(
    paths: &MapPaths,
    rc: usize,
    cam: &CameraParams,
    tile_params: &TileParams,
    roi: &Roi,
    depth: &Image<f32>,
    sim: &Image<f32>,
) -> Result<()> {
    let meta = TileMetadata::new(cam, tile_params, roi, paths.downscale(), Some(depth))?;
    let attributes = meta.to_attributes();

    if !depth.is_empty() {
        let (canvas, path) = placement(paths, rc, cam, MapKind::Depth, roi);
        check_buffer(&canvas, depth.width(), depth.height())?;
        exr::write_map(&path, &canvas, &[(GRAY, depth.as_slice())], StorageType::Float, &attributes)?;
    }
    if !sim.is_empty() {
        let (canvas, path) = placement(paths, rc, cam, MapKind::Sim, roi);
        check_buffer(&canvas, sim.width(), sim.height())?;
        exr::write_map(&path, &canvas, &[(GRAY, sim.as_slice())], StorageType::Half, &attributes)?;
    }
    Ok(())
}

/// Write a full-image depth/similarity map (untiled).
pub fn write_depth_sim_map(paths: &MapPaths, rc: usize, cam: &CameraParams, map: &DepthSimMap) -> Result<()> {
    let roi = Roi::full(cam.width, cam.height);
    write_depth_sim_map_tile(paths, rc, cam, &TileParams::default(), &roi, &map.depth, &map.sim)
}

/// Write a full-image depth map alone.
pub fn write_depth_map(paths: &MapPaths, rc: usize, cam: &CameraParams, depth: &Image<f32>) -> Result<()> {
    let roi = Roi::full(cam.width, cam.height);
    write_depth_sim_map_tile(paths, rc, cam, &TileParams::default(), &roi, depth, &Image::new(0, 0))
}

/// Write the normal buffer of `roi`.
pub fn write_normal_map_tile(
    paths: &MapPaths,
    rc: usize,
    cam: &CameraParams,
    tile_params: &TileParams,
    roi: &Roi,
    normals: &NormalMap,
) -> Result<()> {
    let (canvas, path) = placement(paths, rc, cam, MapKind::Normal, roi);
    check_buffer(&canvas, normals.width(), normals.height())?;
    let meta = TileMetadata::new(cam, tile_params, roi, paths.downscale(), None)?;

    let planes: Vec<Vec<f32>> = (0..3)
        .map(|c| normals.as_slice().iter().map(|n| n[c]).collect())
        .collect();
    let channels: Vec<(&str, &[f32])> = NORMAL_CHANNELS
        .iter()
        .zip(&planes)
        .map(|(name, plane)| (*name, plane.as_slice()))
        .collect();
    exr::write_map(&path, &canvas, &channels, StorageType::Float, &meta.to_attributes())
}

fn read_gray(path: &Path, expected: (usize, usize)) -> Result<Image<f32>> {
    let file = exr::read_map(path)?;
    let image = file.channel_image(path, GRAY)?;
    if (image.width(), image.height()) != expected {
        return Err(DepthMapError::data(
            path,
            format!("map is {}×{}, expected {}×{}", image.width(), image.height(), expected.0, expected.1),
        ));
    }
    Ok(image)
}

fn read_map(paths: &MapPaths, rc: usize, cam: &CameraParams, kind: MapKind) -> Result<Image<f32>> {
    let path = paths.map_path(rc, kind);
    if path.exists() {
        read_gray(&path, map_size(paths, cam))
    } else {
        merge::read_map_from_tiles(paths, rc, cam, kind)
    }
}

/// Full depth map: the untiled file if present, otherwise merged tiles.
pub fn read_depth_map(paths: &MapPaths, rc: usize, cam: &CameraParams) -> Result<Image<f32>> {
    read_map(paths, rc, cam, MapKind::Depth)
}

/// Full similarity map: the untiled file if present, otherwise merged tiles.
pub fn read_sim_map(paths: &MapPaths, rc: usize, cam: &CameraParams) -> Result<Image<f32>> {
    read_map(paths, rc, cam, MapKind::Sim)
}

/// Depth and similarity together. The untiled fast path is taken only
/// when both untiled files exist.
pub fn read_depth_sim_map(paths: &MapPaths, rc: usize, cam: &CameraParams) -> Result<DepthSimMap> {
    let depth_path = paths.map_path(rc, MapKind::Depth);
    let sim_path = paths.map_path(rc, MapKind::Sim);
    if depth_path.exists() && sim_path.exists() {
        let size = map_size(paths, cam);
        return Ok(DepthSimMap { depth: read_gray(&depth_path, size)?, sim: read_gray(&sim_path, size)? });
    }
    Ok(DepthSimMap {
        depth: merge::read_map_from_tiles(paths, rc, cam, MapKind::Depth)?,
        sim: merge::read_map_from_tiles(paths, rc, cam, MapKind::Sim)?,
    })
}

/// Full normal map. Tiles are merged per channel and renormalized; pixels
/// without a usable normal get the sentinel.
pub fn read_normal_map(paths: &MapPaths, rc: usize, cam: &CameraParams) -> Result<NormalMap> {
    let path = paths.map_path(rc, MapKind::Normal);
    let (w, h) = map_size(paths, cam);
    let planes = if path.exists() {
        let file = exr::read_map(&path)?;
        NORMAL_CHANNELS
            .iter()
            .map(|name| file.channel_image(&path, name))
            .collect::<Result<Vec<_>>>()?
    } else {
        merge::read_channels_from_tiles(paths, rc, cam, MapKind::Normal, &NORMAL_CHANNELS)?
    };
    if planes.iter().any(|p| (p.width(), p.height()) != (w, h)) {
        return Err(DepthMapError::data(&path, format!("normal map size differs from {w}×{h}")));
    }

    let mut normals = NormalMap::filled(w, h, NORMAL_INVALID);
    for (i, n) in normals.as_mut_slice().iter_mut().enumerate() {
        let v = [planes[0].as_slice()[i], planes[1].as_slice()[i], planes[2].as_slice()[i]];
        if v == NORMAL_INVALID {
            continue;
        }
        let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        // blended against a sentinel or missing tile
        if norm < 0.5 {
            continue;
        }
        *n = [v[0] / norm, v[1] / norm, v[2] / norm];
    }
    Ok(normals)
}

/// Metadata of one map file. Missing ROI or tile geometry is a
/// configuration error.
pub fn read_tile_metadata(path: &Path) -> Result<TileMetadata> {
    let (_, attributes) = exr::read_attributes(path)?;
    TileMetadata::from_attributes(&attributes)
}

/// Number of valid depths of the camera's depth map.
///
/// Read from metadata (summed over tiles) when available, otherwise
/// recomputed from the pixels.
pub fn nb_depth_values(paths: &MapPaths, rc: usize, cam: &CameraParams) -> Result<usize> {
    let depth_path = paths.map_path(rc, MapKind::Depth);

    let from_metadata = if depth_path.exists() {
        let (_, attributes) = exr::read_attributes(&depth_path)?;
        metadata::nb_depth_values_from_attributes(&attributes).map(|n| n as usize)
    } else {
        let tiles = paths.tile_paths(rc, MapKind::Depth)?;
        if tiles.is_empty() {
            log::info!("no depth map tile file found (rc: {rc})");
            return Ok(0);
        }
        let mut total = 0usize;
        for tile in &tiles {
            let (_, attributes) = exr::read_attributes(tile)?;
            let n = metadata::nb_depth_values_from_attributes(&attributes).ok_or_else(|| {
                DepthMapError::config(format!(
                    "missing or invalid '{}' in depth map tile {} (rc: {rc})",
                    metadata::NB_DEPTH_VALUES,
                    file_name(tile)
                ))
            })?;
            total += n as usize;
        }
        Some(total)
    };

    match from_metadata {
        Some(n) => Ok(n),
        None => {
            log::warn!("missing or invalid depth count metadata (rc: {rc}), recounting valid depths");
            Ok(count_valid_depths(&read_depth_map(paths, rc, cam)?))
        }
    }
}

/// Delete the depth, similarity and normal tile files of `rc`. Untiled
/// maps are left alone. Individual failures are logged and skipped.
pub fn delete_depth_sim_map_tiles(paths: &MapPaths, rc: usize) -> Result<usize> {
    let mut deleted = 0;
    for kind in [MapKind::Depth, MapKind::Sim, MapKind::Normal] {
        let tiles = paths.tile_paths(rc, kind)?;
        if tiles.is_empty() && kind != MapKind::Normal {
            log::info!("no {} tile file to delete (rc: {rc})", kind.name());
        }
        for tile in tiles {
            match std::fs::remove_file(&tile) {
                Ok(()) => deleted += 1,
                Err(e) => log::warn!(
                    "cannot delete {} tile file (rc: {rc}): {}: {e}",
                    kind.name(),
                    file_name(&tile)
                ),
            }
        }
    }
    log::debug!("deleted {deleted} tile files (rc: {rc})");
    Ok(deleted)
}
