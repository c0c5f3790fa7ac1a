// refine/upscale.rs — SGM map → refine resolution, plus pixel sizes.

use rayon::prelude::*;

use crate::frame::MapFrame;
use crate::image::Image;
use crate::maps::{is_valid_depth, DepthPixSizeMap, DepthSimMap, DEPTH_INVALID, SIM_INVALID};

/// Resample `sgm` (laid out in `sgm_frame`) onto `frame`.
///
/// Nearest neighbor by default. With `interpolate_middle_depth` the depth
/// is interpolated bilinearly, but only where all four surrounding SGM
/// pixels are valid; otherwise the nearest one is taken.
pub fn upscale_depth_sim(
    sgm: &DepthSimMap,
    sgm_frame: &MapFrame,
    frame: &MapFrame,
    interpolate_middle_depth: bool,
) -> DepthSimMap {
    let (w, h) = (frame.width(), frame.height());
    let mut out = DepthSimMap::new_invalid(w, h);
    let (sw, sh) = (sgm.width(), sgm.height());
    if sw == 0 || sh == 0 {
        return out;
    }
    let ratio = frame.downscale() as f32 / sgm_frame.downscale() as f32;
    let (ox, oy) = (sgm_frame.roi.x.begin as f32, sgm_frame.roi.y.begin as f32);

    out.depth
        .as_mut_slice()
        .par_chunks_mut(w.max(1))
        .zip(out.sim.as_mut_slice().par_chunks_mut(w.max(1)))
        .enumerate()
        .for_each(|(ly, (depth_row, sim_row))| {
            let sy = ((frame.roi.y.begin + ly as i32) as f32 * ratio - oy).clamp(0.0, (sh - 1) as f32);
            for lx in 0..w {
                let sx = ((frame.roi.x.begin + lx as i32) as f32 * ratio - ox).clamp(0.0, (sw - 1) as f32);
                let (nx, ny) = (sx.round() as usize, sy.round() as usize);
                let mut d = sgm.depth.get(nx, ny);
                let s = sgm.sim.get(nx, ny);

                if interpolate_middle_depth {
                    if let Some(di) = bilinear_if_all_valid(&sgm.depth, sx, sy) {
                        d = di;
                    }
                }
                if is_valid_depth(d) {
                    depth_row[lx] = d;
                    sim_row[lx] = s;
                } else {
                    depth_row[lx] = DEPTH_INVALID;
                    sim_row[lx] = SIM_INVALID;
                }
            }
        });
    out
}

fn bilinear_if_all_valid(depth: &Image<f32>, x: f32, y: f32) -> Option<f32> {
    let (x0, y0) = (x.floor() as usize, y.floor() as usize);
    let x1 = (x0 + 1).min(depth.width() - 1);
    let y1 = (y0 + 1).min(depth.height() - 1);
    let (d00, d10, d01, d11) = (depth.get(x0, y0), depth.get(x1, y0), depth.get(x0, y1), depth.get(x1, y1));
    if ![d00, d10, d01, d11].iter().all(|&d| is_valid_depth(d)) {
        return None;
    }
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    let top = d00 + fx * (d10 - d00);
    let bottom = d01 + fx * (d11 - d01);
    Some(top + fy * (bottom - top))
}

/// Attach the world-space footprint of one map step to every valid depth.
pub fn compute_pix_size_map(depth: &Image<f32>, frame: &MapFrame) -> DepthPixSizeMap {
    let (w, h) = (depth.width(), depth.height());
    let mut out = DepthPixSizeMap::new_invalid(w, h);
    out.depth = depth.clone();
    out.pix_size
        .as_mut_slice()
        .par_chunks_mut(w.max(1))
        .enumerate()
        .for_each(|(ly, row)| {
            for (lx, px) in row.iter_mut().enumerate() {
                let d = depth.get(lx, ly);
                if is_valid_depth(d) {
                    *px = frame.pixel_size(lx, ly, d as f64) as f32;
                }
            }
        });
    out
}
