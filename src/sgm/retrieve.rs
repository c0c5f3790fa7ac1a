// sgm/retrieve.rs — Best depth per pixel from the aggregated volume.

use crate::maps::{DepthSimMap, DEPTH_INVALID, SIM_INVALID};
use crate::similarity::sim_from_cost;
use crate::volume::{Volume, TSIM_INVALID};

/// Pick, per pixel, the depth index minimizing `optimized`.
///
/// Pixels where `best` holds no valid cost at any depth get the sentinel
/// depth. With `interpolate`, a parabola through the minimum and its two
/// neighbors refines the depth between hypotheses.
pub fn retrieve_best_depth(
    best: &Volume<f32>,
    optimized: &Volume<f32>,
    depths: &[f32],
    interpolate: bool,
) -> DepthSimMap {
    let (w, h, nz) = (best.width(), best.height(), best.depth());
    let mut out = DepthSimMap::new_invalid(w, h);
    if nz == 0 {
        return out;
    }

    for y in 0..h {
        for x in 0..w {
            let any_valid = (0..nz).any(|z| best.get(x, y, z) < TSIM_INVALID);
            if !any_valid {
                continue;
            }
            let mut z_best = 0;
            let mut c_best = optimized.get(x, y, 0);
            for z in 1..nz {
                let c = optimized.get(x, y, z);
                if c < c_best {
                    c_best = c;
                    z_best = z;
                }
            }

            let mut depth = depths[z_best];
            if interpolate && z_best > 0 && z_best + 1 < nz {
                let cm = optimized.get(x, y, z_best - 1);
                let cp = optimized.get(x, y, z_best + 1);
                depth = parabolic_depth(depths, z_best, cm, c_best, cp);
            }

            let cost = best.get(x, y, z_best);
            out.depth.set(x, y, if depth > 0.0 { depth } else { DEPTH_INVALID });
            out.sim.set(x, y, if cost < TSIM_INVALID { sim_from_cost(cost) } else { SIM_INVALID });
        }
    }
    out
}

/// Vertex of the parabola through (z-1, cm), (z, c0), (z+1, cp), mapped
/// to depth by linear interpolation towards the neighboring hypothesis.
pub fn parabolic_depth(depths: &[f32], z: usize, cm: f32, c0: f32, cp: f32) -> f32 {
    let offset = parabola_vertex(cm, c0, cp);
    if offset >= 0.0 {
        depths[z] + offset * (depths[z + 1] - depths[z])
    } else {
        depths[z] + offset * (depths[z] - depths[z - 1])
    }
}

/// Sub-sample offset of the minimum in `[-0.5, 0.5]`; 0 when the three
/// costs are not convex.
#[inline]
pub fn parabola_vertex(cm: f32, c0: f32, cp: f32) -> f32 {
    let denom = cm - 2.0 * c0 + cp;
    if denom <= f32::EPSILON {
        return 0.0;
    }
    (0.5 * (cm - cp) / denom).clamp(-0.5, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmin_and_sentinel() {
        let depths = [1.0, 2.0, 3.0];
        let mut best = Volume::filled(2, 1, 3, TSIM_INVALID);
        let mut opt = Volume::filled(2, 1, 3, 50.0);
        best.set(0, 0, 2, 12.0);
        opt.set(0, 0, 2, 5.0);
        opt.set(1, 0, 0, 1.0);
        let map = retrieve_best_depth(&best, &opt, &depths, false);
        assert_eq!(map.depth.get(0, 0), 3.0);
        assert!((map.sim.get(0, 0) - sim_from_cost(12.0)).abs() < 1e-6);
        // No valid cost at pixel 1: sentinel even though opt has a minimum.
        assert_eq!(map.depth.get(1, 0), DEPTH_INVALID);
    }

    #[test]
    fn test_parabola_symmetric_is_exact() {
        let depths = [1.0, 2.0, 3.0];
        assert_eq!(parabolic_depth(&depths, 1, 10.0, 0.0, 10.0), 2.0);
    }

    #[test]
    fn test_parabola_leans_toward_lower_neighbor() {
        let depths = [1.0, 2.0, 3.0];
        let d = parabolic_depth(&depths, 1, 10.0, 0.0, 4.0);
        assert!(d > 2.0 && d < 2.5, "{d}");
    }

    #[test]
    fn test_zero_depths_gives_all_invalid() {
        let best = Volume::filled(3, 2, 0, TSIM_INVALID);
        let opt = Volume::filled(3, 2, 0, 0.0);
        let map = retrieve_best_depth(&best, &opt, &[], true);
        assert_eq!(map.nb_valid(), 0);
    }
}
