// merge.rs — Weighted reassembly of tiled maps.
//
// Neighboring tiles overlap by `padding` pixels. Inside a tile, the
// padding band along each side shared with another tile is split into
// eight zones; each zone ramps the tile's weight bilinearly between four
// corner alphas:
//
//        ┌────┬──────────────┬────┐
//        │ TL │     Top      │ TR │        a ─── b
//        ├────┼──────────────┼────┤        │     │   alphas of a zone
//        │Left│   weight 1   │Rght│        d ─── c
//        ├────┼──────────────┼────┤
//        │ BL │    Bottom    │ BR │
//        └────┴──────────────┴────┘
//
// Sides lying on the image boundary keep full weight. The ramps of two
// overlapping tiles are complementary, so weights sum to 1 at every pixel
// of a covering tile set (checked by `weight_coverage`).
//
// A small margin at both ends of each ramp is pinned to 0 / 1 so the
// corners of four-tile junctions stay clean.

use crate::camera::CameraParams;
use crate::error::{DepthMapError, Result};
use crate::image::Image;
use crate::io::exr;
use crate::io::metadata::{roi_from_attributes, tile_params_from_attributes};
use crate::io::paths::{file_name, MapKind, MapPaths};
use crate::roi::{divide_round_up, Roi};
use crate::tile::TileParams;

/// Pixels pinned at each end of a ramp.
pub const BORDER_MARGIN: f64 = 2.0;

/// Which image boundaries a tile touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileAdjacency {
    pub first_column: bool,
    pub last_column: bool,
    pub first_row: bool,
    pub last_row: bool,
}

impl TileAdjacency {
    /// Adjacency of a full-resolution tile `roi` in a `width × height` image.
    pub fn of(roi: &Roi, width: usize, height: usize) -> Self {
        TileAdjacency {
            first_column: roi.x.begin == 0,
            last_column: roi.x.end == width as i32,
            first_row: roi.y.begin == 0,
            last_row: roi.y.end == height as i32,
        }
    }
}

/// Bilinear alphas at the top-left, top-right, bottom-right and
/// bottom-left corners of a zone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BorderWeights {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
}

impl BorderWeights {
    const fn new(a: bool, b: bool, c: bool, d: bool) -> Self {
        BorderWeights { a: flag(a), b: flag(b), c: flag(c), d: flag(d) }
    }
}

const fn flag(v: bool) -> f32 {
    if v {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderZone {
    TopLeft,
    BottomLeft,
    TopRight,
    BottomRight,
    Top,
    Bottom,
    Left,
    Right,
}

impl BorderZone {
    pub const ALL: [BorderZone; 8] = [
        BorderZone::TopLeft,
        BorderZone::BottomLeft,
        BorderZone::TopRight,
        BorderZone::BottomRight,
        BorderZone::Top,
        BorderZone::Bottom,
        BorderZone::Left,
        BorderZone::Right,
    ];

    /// Alphas of the zone for a tile with adjacency `t`, `None` when the
    /// zone keeps full weight.
    pub fn weights(self, t: TileAdjacency) -> Option<BorderWeights> {
        use BorderZone::*;
        let (fc, lc, fr, lr) = (t.first_column, t.last_column, t.first_row, t.last_row);
        let (applies, w) = match self {
            TopLeft => (!fc || !fr, BorderWeights::new(false, fr, true, fc)),
            BottomLeft => (!fc || !lr, BorderWeights::new(fc, true, lr, false)),
            TopRight => (!lc || !fr, BorderWeights::new(fr, false, lc, true)),
            BottomRight => (!lc || !lr, BorderWeights::new(true, lc, false, lr)),
            Top => (!fr, BorderWeights::new(false, false, true, true)),
            Bottom => (!lr, BorderWeights::new(true, true, false, false)),
            Left => (!fc, BorderWeights::new(false, true, true, false)),
            Right => (!lc, BorderWeights::new(true, false, false, true)),
        };
        applies.then_some(w)
    }

    /// Top-left corner and size of the zone in a `w × h` tile with
    /// padding `p` (all in map pixels).
    pub fn area(self, w: i32, h: i32, p: i32) -> ((i32, i32), (i32, i32)) {
        use BorderZone::*;
        match self {
            TopLeft => ((0, 0), (p, p)),
            BottomLeft => ((0, h - p), (p, p)),
            TopRight => ((w - p, 0), (p, p)),
            BottomRight => ((w - p, h - p), (p, p)),
            Top => ((p, 0), (w - 2 * p, p)),
            Bottom => ((p, h - p), (w - 2 * p, p)),
            Left => ((0, p), (p, h - 2 * p)),
            Right => ((w - p, p), (p, h - 2 * p)),
        }
    }
}

fn border_margin(size: i32) -> f64 {
    BORDER_MARGIN.min(((size - 1) / 2).max(0) as f64)
}

/// Multiply the `bw × bh` zone at `lu` of `map` by its bilinear weight.
pub fn weight_tile_border(w: BorderWeights, bw: i32, bh: i32, lu: (i32, i32), map: &mut Image<f32>) {
    if bw <= 0 || bh <= 0 {
        return;
    }
    let end_x = (lu.0 + bw).min(map.width() as i32);
    let end_y = (lu.1 + bh).min(map.height() as i32);

    let (mx, my) = (border_margin(bw), border_margin(bh));
    let (lu_x, lu_y) = (lu.0 as f64 + mx, lu.1 as f64 + my);
    let (rd_x, rd_y) = ((lu.0 + bw) as f64 - mx, (lu.1 + bh) as f64 - my);
    let (bw_m, bh_m) = (bw as f64 - 2.0 * mx, bh as f64 - 2.0 * my);

    for y in lu.1.max(0)..end_y {
        let r_y = ((rd_y - y as f64) / bh_m).clamp(0.0, 1.0) as f32;
        let l_y = ((y as f64 - lu_y) / bh_m).clamp(0.0, 1.0) as f32;
        for x in lu.0.max(0)..end_x {
            let r_x = ((rd_x - x as f64) / bw_m).clamp(0.0, 1.0) as f32;
            let l_x = ((x as f64 - lu_x) / bw_m).clamp(0.0, 1.0) as f32;
            let weight = r_y * (r_x * w.a + l_x * w.b) + l_y * (r_x * w.d + l_x * w.c);
            map[(x as usize, y as usize)] *= weight;
        }
    }
}

/// Apply every zone of a tile in place.
pub fn weight_tile(map: &mut Image<f32>, padding: i32, adjacency: TileAdjacency) {
    let (w, h) = (map.width() as i32, map.height() as i32);
    for zone in BorderZone::ALL {
        if let Some(weights) = zone.weights(adjacency) {
            let (lu, (bw, bh)) = zone.area(w, h, padding);
            weight_tile_border(weights, bw, bh, lu, map);
        }
    }
}

/// Weight `tile` (the buffer of full-resolution region `roi`) and add it
/// into `map` at its downscaled position.
pub fn add_tile_map_weighted(
    map: &mut Image<f32>,
    tile: &mut Image<f32>,
    roi: &Roi,
    image_size: (usize, usize),
    tile_params: &TileParams,
    downscale: i32,
) -> Result<()> {
    let roi_ds = roi.downscale(downscale);
    if tile.width() != roi_ds.width() || tile.height() != roi_ds.height() {
        return Err(DepthMapError::config(format!(
            "tile buffer is {}×{} but region {roi} maps to {}×{}",
            tile.width(),
            tile.height(),
            roi_ds.width(),
            roi_ds.height()
        )));
    }
    if !roi_ds.is_inside(map.width(), map.height()) {
        return Err(DepthMapError::config(format!("tile region {roi} outside the map")));
    }

    let adjacency = TileAdjacency::of(roi, image_size.0, image_size.1);
    weight_tile(tile, tile_params.padding / downscale, adjacency);

    let (x0, y0) = (roi_ds.x.begin as usize, roi_ds.y.begin as usize);
    for ty in 0..tile.height() {
        let src = tile.row(ty);
        let dst = &mut map.row_mut(y0 + ty)[x0..x0 + src.len()];
        for (d, s) in dst.iter_mut().zip(src) {
            *d += *s;
        }
    }
    Ok(())
}

/// Accumulated weight of a tile set at every map pixel. A covering set
/// yields 1 everywhere.
pub fn weight_coverage(
    rois: &[Roi],
    image_size: (usize, usize),
    tile_params: &TileParams,
    downscale: i32,
) -> Result<Image<f32>> {
    let (w, h) = map_size(image_size, downscale);
    let mut coverage = Image::new(w, h);
    let image_roi = Roi::full(image_size.0, image_size.1);
    for roi in rois {
        let roi = roi.intersect(&image_roi);
        if roi.is_empty() {
            continue;
        }
        let roi_ds = roi.downscale(downscale);
        let mut ones = Image::filled(roi_ds.width(), roi_ds.height(), 1.0f32);
        add_tile_map_weighted(&mut coverage, &mut ones, &roi, image_size, tile_params, downscale)?;
    }
    Ok(coverage)
}

/// Number of pixels whose coverage differs from 1 by more than `tolerance`.
pub fn coverage_defects(coverage: &Image<f32>, tolerance: f32) -> usize {
    coverage
        .as_slice()
        .iter()
        .filter(|&&w| (w - 1.0).abs() > tolerance)
        .count()
}

fn map_size(image_size: (usize, usize), downscale: i32) -> (usize, usize) {
    (
        divide_round_up(image_size.0 as i32, downscale) as usize,
        divide_round_up(image_size.1 as i32, downscale) as usize,
    )
}

/// Merge the tiles of a single-channel map kind.
pub fn read_map_from_tiles(paths: &MapPaths, rc: usize, cam: &CameraParams, kind: MapKind) -> Result<Image<f32>> {
    let mut planes = read_channels_from_tiles(paths, rc, cam, kind, &["Y"])?;
    Ok(planes.swap_remove(0))
}

/// Merge the tiles of `kind` channel by channel into zero-initialized
/// full maps.
///
/// Zero tiles give all-zero maps. A tile with missing metadata or
/// unreadable pixels is skipped with a warning.
pub fn read_channels_from_tiles(
    paths: &MapPaths,
    rc: usize,
    cam: &CameraParams,
    kind: MapKind,
    channels: &[&str],
) -> Result<Vec<Image<f32>>> {
    let downscale = paths.downscale();
    let image_size = (cam.width, cam.height);
    let (w, h) = map_size(image_size, downscale);
    let mut maps: Vec<Image<f32>> = channels.iter().map(|_| Image::new(w, h)).collect();

    let tiles = paths.tile_paths(rc, kind)?;
    if tiles.is_empty() {
        log::info!("no {} tile file found (rc: {rc})", kind.name());
        return Ok(maps);
    }

    let image_roi = Roi::full(cam.width, cam.height);
    let mut merged = Vec::with_capacity(tiles.len());
    let mut merged_params = None;
    for path in &tiles {
        match add_tile_file(&mut maps, path, channels, &image_roi, image_size, downscale) {
            Ok(Some((roi, params))) => {
                merged.push(roi);
                merged_params = Some(params);
            }
            Ok(None) => {}
            Err(e) => log::warn!(
                "skipping {} tile (rc: {rc}) {}: {e}",
                kind.name(),
                file_name(path)
            ),
        }
    }
    log::debug!("merged {}/{} {} tiles (rc: {rc})", merged.len(), tiles.len(), kind.name());

    if cfg!(debug_assertions) {
        if let Some(params) = merged_params {
            let defects = coverage_defects(&weight_coverage(&merged, image_size, &params, downscale)?, 1e-3);
            if defects > 0 {
                log::warn!(
                    "{} tiles (rc: {rc}) do not partition the map: {defects} pixels with weight ≠ 1",
                    kind.name()
                );
            }
        }
    }
    Ok(maps)
}

/// Read one tile and add it. `Ok(None)` when its region misses the image.
fn add_tile_file(
    maps: &mut [Image<f32>],
    path: &std::path::Path,
    channels: &[&str],
    image_roi: &Roi,
    image_size: (usize, usize),
    downscale: i32,
) -> Result<Option<(Roi, TileParams)>> {
    let file = exr::read_map(path)?;
    let roi = roi_from_attributes(&file.attributes)?.intersect(image_roi);
    let params = tile_params_from_attributes(&file.attributes)?;
    if roi.is_empty() {
        return Ok(None);
    }

    // Decode every channel before touching the maps so a bad tile adds nothing.
    let mut planes = channels
        .iter()
        .map(|name| file.channel_image(path, name))
        .collect::<Result<Vec<_>>>()?;
    let roi_ds = roi.downscale(downscale);
    if planes.iter().any(|p| p.width() != roi_ds.width() || p.height() != roi_ds.height()) {
        return Err(DepthMapError::data(
            path,
            format!("buffer is {}×{}, region {roi} expects {}×{}", file.width(), file.height(), roi_ds.width(), roi_ds.height()),
        ));
    }
    for (map, plane) in maps.iter_mut().zip(planes.iter_mut()) {
        add_tile_map_weighted(map, plane, &roi, image_size, &params, downscale)?;
    }
    Ok(Some((roi, params)))
}
