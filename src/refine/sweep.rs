// refine/sweep.rs — Narrow-band depth sweep around the SGM estimate.
//
// Every valid pixel tests `2·half + 1` depths d + k·step·pixSize against
// all refine neighbors. The cost of a hypothesis is the mean matching
// cost over the neighbors that define one. The minimum is refined with
// a parabola through its two neighbors in k.

use rayon::prelude::*;

use crate::depth_list::RefineDepthList;
use crate::frame::MapFrame;
use crate::image::Image;
use crate::maps::{is_valid_depth, DepthPixSizeMap, DepthSimMap, DEPTH_INVALID, SIM_INVALID};
use crate::sgm::retrieve::parabola_vertex;
use crate::sgm::volume::NeighborTexture;
use crate::similarity::{sim_from_cost, PatchMatcher, PatchParams};
use crate::volume::TSIM_INVALID;

/// Refined depth and similarity per pixel.
///
/// Pixels where no hypothesis gets a valid cost keep their input depth
/// and similarity (`fallback_sim`); invalid input depths stay invalid.
pub fn refine_sweep(
    frame: &MapFrame,
    rc_image: &Image<f32>,
    neighbors: &[NeighborTexture<'_>],
    input: &DepthPixSizeMap,
    fallback_sim: &Image<f32>,
    list: RefineDepthList,
    patch: PatchParams,
) -> DepthSimMap {
    let (w, h) = (input.width(), input.height());
    let mut out = DepthSimMap::new_invalid(w, h);
    let matchers: Vec<PatchMatcher<'_>> = neighbors
        .iter()
        .map(|tc| PatchMatcher::new(rc_image, &frame.cam, tc.image, &tc.cam, patch))
        .collect();

    out.depth
        .as_mut_slice()
        .par_chunks_mut(w.max(1))
        .zip(out.sim.as_mut_slice().par_chunks_mut(w.max(1)))
        .enumerate()
        .for_each(|(ly, (depth_row, sim_row))| {
            let mut costs = vec![TSIM_INVALID; list.len()];
            for lx in 0..w {
                let d0 = input.depth.get(lx, ly);
                if !is_valid_depth(d0) {
                    depth_row[lx] = DEPTH_INVALID;
                    sim_row[lx] = SIM_INVALID;
                    continue;
                }
                let pix = input.pix_size.get(lx, ly);
                let (u, v) = frame.image_coords(lx, ly);
                for (slot, k) in costs.iter_mut().zip(list.offsets()) {
                    let d = list.depth_at(d0, pix, k);
                    *slot = if d > 0.0 { mean_cost(&matchers, u, v, d as f64) } else { TSIM_INVALID };
                }

                match best_hypothesis(&costs) {
                    Some((i, off)) => {
                        let k = i as f32 - list.half_nb_depths as f32 + off;
                        let d = d0 + k * list.depth_step * pix;
                        depth_row[lx] = if d > 0.0 { d } else { d0 };
                        sim_row[lx] = sim_from_cost(costs[i]);
                    }
                    None => {
                        depth_row[lx] = d0;
                        sim_row[lx] = fallback_sim.get(lx, ly);
                    }
                }
            }
        });
    out
}

/// Mean cost over the neighbors that define one, `TSIM_INVALID` if none.
pub fn mean_cost(matchers: &[PatchMatcher<'_>], u: f64, v: f64, depth: f64) -> f32 {
    let (sum, n) = matchers
        .iter()
        .map(|m| m.cost(u, v, depth))
        .filter(|&c| c < TSIM_INVALID)
        .fold((0.0f32, 0usize), |(s, n), c| (s + c, n + 1));
    if n == 0 {
        TSIM_INVALID
    } else {
        sum / n as f32
    }
}

/// Index of the lowest valid cost and its parabolic sub-sample offset.
fn best_hypothesis(costs: &[f32]) -> Option<(usize, f32)> {
    let (i, &c0) = costs
        .iter()
        .enumerate()
        .filter(|&(_, &c)| c < TSIM_INVALID)
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let off = if i > 0 && i + 1 < costs.len() && costs[i - 1] < TSIM_INVALID && costs[i + 1] < TSIM_INVALID {
        parabola_vertex(costs[i - 1], c0, costs[i + 1])
    } else {
        0.0
    };
    Some((i, off))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_hypothesis_skips_invalid() {
        let costs = [TSIM_INVALID, 40.0, 10.0, 40.0, TSIM_INVALID];
        assert_eq!(best_hypothesis(&costs), Some((2, 0.0)));
        assert_eq!(best_hypothesis(&[TSIM_INVALID; 3]), None);
    }

    #[test]
    fn test_best_hypothesis_at_band_edge_has_no_offset() {
        let costs = [5.0, 40.0, 60.0];
        assert_eq!(best_hypothesis(&costs), Some((0, 0.0)));
    }

    #[test]
    fn test_mean_cost_without_neighbors_is_invalid() {
        assert_eq!(mean_cost(&[], 1.0, 1.0, 2.0), TSIM_INVALID);
    }
}
