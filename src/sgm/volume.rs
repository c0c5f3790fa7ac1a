// sgm/volume.rs — Similarity volume computation.
//
// For every neighbor camera the matching cost of every (pixel, depth)
// voxel is evaluated and folded into two running volumes:
//
//   cost < best            →  second = best, best = cost
//   best ≤ cost < second   →  second = cost
//
// so after all neighbors `best ≤ second` holds at every voxel. Depth
// planes are independent and are computed in parallel.

use rayon::prelude::*;

use crate::camera::CameraParams;
use crate::frame::MapFrame;
use crate::image::Image;
use crate::similarity::{PatchMatcher, PatchParams};
use crate::volume::{Volume, TSIM_INVALID};

/// One neighbor as seen by the similarity stage.
pub struct NeighborTexture<'a> {
    pub index: usize,
    pub image: &'a Image<f32>,
    /// Camera at the resolution of `image`.
    pub cam: CameraParams,
}

/// Reset `best`/`second` to the frame size and fold in every neighbor.
pub fn compute_similarity_volumes(
    frame: &MapFrame,
    rc_image: &Image<f32>,
    neighbors: &[NeighborTexture<'_>],
    depths: &[f32],
    patch: PatchParams,
    best: &mut Volume<f32>,
    second: &mut Volume<f32>,
) {
    let (w, h) = (frame.width(), frame.height());
    best.reset(w, h, depths.len(), TSIM_INVALID);
    second.reset(w, h, depths.len(), TSIM_INVALID);
    let plane = w * h;
    if plane == 0 || depths.is_empty() {
        return;
    }

    for tc in neighbors {
        log::trace!("similarity volume: tc {} over {} depths", tc.index, depths.len());
        let matcher = PatchMatcher::new(rc_image, &frame.cam, tc.image, &tc.cam, patch);
        best.as_mut_slice()
            .par_chunks_mut(plane)
            .zip(second.as_mut_slice().par_chunks_mut(plane))
            .enumerate()
            .for_each(|(z, (best_plane, second_plane))| {
                let depth = depths[z] as f64;
                for ly in 0..h {
                    for lx in 0..w {
                        let (u, v) = frame.image_coords(lx, ly);
                        let cost = matcher.cost(u, v, depth);
                        let i = ly * w + lx;
                        update_best_two(&mut best_plane[i], &mut second_plane[i], cost);
                    }
                }
            });
    }
}

#[inline]
pub fn update_best_two(best: &mut f32, second: &mut f32, cost: f32) {
    if cost < *best {
        *second = *best;
        *best = cost;
    } else if cost < *second {
        *second = cost;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_two_tracks_order() {
        let (mut b, mut s) = (TSIM_INVALID, TSIM_INVALID);
        for c in [120.0, 30.0, 80.0, 200.0, 10.0] {
            update_best_two(&mut b, &mut s, c);
            assert!(b <= s);
        }
        assert_eq!((b, s), (10.0, 30.0));
    }

    #[test]
    fn test_invalid_costs_do_not_displace() {
        let (mut b, mut s) = (40.0, 90.0);
        update_best_two(&mut b, &mut s, TSIM_INVALID);
        assert_eq!((b, s), (40.0, 90.0));
    }
}
