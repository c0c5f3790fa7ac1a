// tile.rs — Padded tile decomposition of a reference image.
//
// The image is cut into overlapping tiles so device buffers stay bounded.
// Neighboring tiles overlap by exactly `padding` pixels; that band is
// where the merge blends them (see merge.rs).
//
//   axis length 64, buffer 40, padding 16:
//
//   tile 0   [0 ........................ 40)
//   tile 1                 [24 ......................... 64)
//                          └── 16 ──┘ blend band
//
// Per axis: n = ceil((len - p) / (buffer - p)) tiles with a uniform
// stride s = ceil((len - p) / n), rounded up to `align` so that every
// tile boundary survives downscaling exactly. Tile i covers
// [i·s, min(i·s + s + p, len)).

use serde::{Deserialize, Serialize};

use crate::error::{DepthMapError, Result};
use crate::roi::{Range, Roi};

/// Tile geometry shared by all tiles of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileParams {
    /// Maximum tile width in full-resolution pixels.
    pub buffer_width: i32,
    /// Maximum tile height in full-resolution pixels.
    pub buffer_height: i32,
    /// Overlap (and blend band) between neighboring tiles.
    pub padding: i32,
}

impl Default for TileParams {
    fn default() -> Self {
        TileParams {
            buffer_width: 1024,
            buffer_height: 1024,
            padding: 64,
        }
    }
}

impl TileParams {
    /// Metadata validity rule: positive buffer, non-negative padding.
    pub fn is_valid(&self) -> bool {
        self.buffer_width > 0 && self.buffer_height > 0 && self.padding >= 0
    }

    /// Full validation for running a pass.
    pub fn validate(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(DepthMapError::config(format!("invalid tile parameters {self:?}")));
        }
        if 2 * self.padding >= self.buffer_width || 2 * self.padding >= self.buffer_height {
            return Err(DepthMapError::config(format!(
                "tile padding {} must be less than half of the tile buffer {}×{}",
                self.padding, self.buffer_width, self.buffer_height
            )));
        }
        Ok(())
    }
}

/// One unit of work: a padded region of one reference camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub id: usize,
    pub nb_tiles: usize,
    /// Reference camera index.
    pub rc: usize,
    /// Region in full-resolution image coordinates.
    pub roi: Roi,
    /// Neighbor camera indices used by SGM.
    pub sgm_tcs: Vec<usize>,
    /// Neighbor camera indices used by refinement.
    pub refine_tcs: Vec<usize>,
}

/// Decompose a `width × height` image into tile regions, row-major.
///
/// `align` is the largest downscale any stage will apply; tile starts are
/// multiples of it and padding must be too.
pub fn tile_roi_list(params: &TileParams, width: usize, height: usize, align: i32) -> Result<Vec<Roi>> {
    params.validate()?;
    if align <= 0 || params.padding % align != 0 {
        return Err(DepthMapError::config(format!(
            "tile padding {} must be a multiple of the maximum downscale {align}",
            params.padding
        )));
    }
    let xs = axis_ranges(width as i32, params.buffer_width, params.padding, align)?;
    let ys = axis_ranges(height as i32, params.buffer_height, params.padding, align)?;

    let mut rois = Vec::with_capacity(xs.len() * ys.len());
    for y in &ys {
        for x in &xs {
            rois.push(Roi::new(*x, *y));
        }
    }
    Ok(rois)
}

fn axis_ranges(len: i32, buffer: i32, padding: i32, align: i32) -> Result<Vec<Range>> {
    if len <= 0 {
        return Ok(Vec::new());
    }
    if len <= buffer {
        return Ok(vec![Range::new(0, len)]);
    }

    let span = len - padding;
    let usable = buffer - padding;
    let n_min = div_ceil(span, usable);

    // Uniform aligned stride, the last tile takes the remainder.
    let mut stride = round_up(div_ceil(span, n_min), align);
    if stride + padding > buffer {
        stride = (usable / align) * align;
    }
    if stride > 0 {
        let n = div_ceil(span, stride);
        let ranges: Vec<Range> = (0..n)
            .map(|i| Range::new(i * stride, (i * stride + stride + padding).min(len)))
            .collect();
        if blendable(&ranges, buffer, padding) {
            return Ok(ranges);
        }
    }

    // Otherwise spread the tile starts evenly, adding tiles until every
    // range fits between 2·padding and the buffer.
    let n_max = if padding > 0 { span / padding } else { span };
    for n in n_min.max(1)..=n_max {
        let begins: Vec<i32> = (0..n).map(|i| (i * span / n) / align * align).collect();
        let ranges: Vec<Range> = (0..n as usize)
            .map(|i| match begins.get(i + 1) {
                Some(next) => Range::new(begins[i], next + padding),
                None => Range::new(begins[i], len),
            })
            .collect();
        if blendable(&ranges, buffer, padding) {
            return Ok(ranges);
        }
    }
    Err(DepthMapError::config(format!(
        "no tiling of {len} px with buffer {buffer}, padding {padding} and alignment {align} \
         keeps every tile wider than twice the padding"
    )))
}

/// Each range fits the buffer and its opposite blend bands do not overlap.
fn blendable(ranges: &[Range], buffer: i32, padding: i32) -> bool {
    ranges.iter().all(|r| {
        let size = r.size() as i32;
        size >= (2 * padding).max(1) && size <= buffer
    })
}

#[inline]
fn div_ceil(a: i32, b: i32) -> i32 {
    (a + b - 1) / b
}

#[inline]
fn round_up(v: i32, align: i32) -> i32 {
    div_ceil(v, align) * align
}

/// Build tiles with their neighbor lists.
pub fn make_tiles(rc: usize, rois: &[Roi], sgm_tcs: &[usize], refine_tcs: &[usize]) -> Vec<Tile> {
    rois.iter()
        .enumerate()
        .map(|(id, roi)| Tile {
            id,
            nb_tiles: rois.len(),
            rc,
            roi: *roi,
            sgm_tcs: sgm_tcs.to_vec(),
            refine_tcs: refine_tcs.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(b: i32, p: i32) -> TileParams {
        TileParams { buffer_width: b, buffer_height: b, padding: p }
    }

    #[test]
    fn test_four_tiles_with_16px_overlap() {
        let rois = tile_roi_list(&params(40, 16), 64, 64, 1).unwrap();
        assert_eq!(rois.len(), 4);
        assert_eq!(rois[0], Roi::from_bounds(0, 0, 40, 40));
        assert_eq!(rois[1], Roi::from_bounds(24, 0, 64, 40));
        assert_eq!(rois[2], Roi::from_bounds(0, 24, 40, 64));
        assert_eq!(rois[3], Roi::from_bounds(24, 24, 64, 64));
    }

    #[test]
    fn test_overlap_equals_padding() {
        let rois = tile_roi_list(&params(40, 8), 64, 64, 1).unwrap();
        assert_eq!(rois.len(), 4);
        assert_eq!(rois[0].x, Range::new(0, 36));
        assert_eq!(rois[1].x, Range::new(28, 64));
    }

    #[test]
    fn test_single_tile_when_image_fits() {
        let rois = tile_roi_list(&TileParams::default(), 640, 480, 4).unwrap();
        assert_eq!(rois, vec![Roi::full(640, 480)]);
    }

    #[test]
    fn test_coverage_and_alignment() {
        let align = 4;
        let rois = tile_roi_list(&params(100, 16), 333, 250, align).unwrap();
        for r in &rois {
            assert_eq!(r.x.begin % align, 0);
            assert_eq!(r.y.begin % align, 0);
            assert!(r.width() <= 100 && r.height() <= 100);
            assert!(r.is_inside(333, 250));
        }
        for y in 0..250 {
            for x in 0..333 {
                assert!(rois.iter().any(|r| r.contains(x, y)), "({x},{y}) uncovered");
            }
        }
    }

    #[test]
    fn test_rejects_padding_not_multiple_of_downscale() {
        assert!(tile_roi_list(&params(40, 6), 64, 64, 4).is_err());
    }

    #[test]
    fn test_rejects_large_padding() {
        assert!(params(40, 20).validate().is_err());
        assert!(params(40, 19).validate().is_ok());
        assert!(!TileParams { buffer_width: 0, ..TileParams::default() }.is_valid());
        assert!(!TileParams { padding: -1, ..TileParams::default() }.is_valid());
    }

    #[test]
    fn test_rejects_geometry_breaking_blend_bands() {
        // Two tiles cover at most 61 px, three need at least 76.
        assert!(tile_roi_list(&params(40, 19), 64, 64, 1).is_err());
    }

    #[test]
    fn test_even_spread_when_remainder_tile_is_too_narrow() {
        // A uniform stride of 24 leaves [72, 90), narrower than 32.
        let rois = tile_roi_list(&params(40, 16), 90, 40, 4).unwrap();
        let xs: Vec<Range> = rois.iter().map(|r| r.x).collect();
        assert_eq!(
            xs,
            vec![Range::new(0, 32), Range::new(16, 52), Range::new(36, 68), Range::new(52, 90)]
        );
        for pair in xs.windows(2) {
            assert_eq!(pair[0].end - pair[1].begin, 16);
        }
        assert!(xs.iter().all(|r| r.begin % 4 == 0 && r.size() >= 32 && r.size() <= 40));
    }

    #[test]
    fn test_make_tiles() {
        let rois = tile_roi_list(&params(40, 16), 64, 64, 1).unwrap();
        let tiles = make_tiles(3, &rois, &[1, 2], &[1]);
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[2].id, 2);
        assert_eq!(tiles[2].nb_tiles, 4);
        assert_eq!(tiles[2].rc, 3);
        assert_eq!(tiles[2].sgm_tcs, vec![1, 2]);
    }
}
