// tests/test_sgm.rs — Similarity volumes and SGM on the synthetic plane.

use depthmap::camera::CameraView;
use depthmap::depth_list::{DepthRange, SgmDepthList};
use depthmap::frame::MapFrame;
use depthmap::maps::is_valid_depth;
use depthmap::roi::Roi;
use depthmap::sgm::volume::update_best_two;
use depthmap::sgm::{Sgm, SgmParams};
use depthmap::synthetic::PlaneScene;
use depthmap::tile::Tile;
use depthmap::volume::{Volume, TSIM_INVALID};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic cost in [2, 254] for neighbor `n` at voxel `i`, so a
/// forced 1.0 always wins.
fn crafted_cost(n: usize, i: usize) -> f32 {
    let h = (i as u64 + 1).wrapping_mul(2654435761).wrapping_add(n as u64 * 40503);
    2.0 + ((h >> 7) % 253) as f32
}

#[test]
fn best_two_are_global_over_four_neighbors() {
    let (w, h, nz) = (6, 5, 9);
    let mut best = Volume::filled(w, h, nz, TSIM_INVALID);
    let mut second = Volume::filled(w, h, nz, TSIM_INVALID);
    let neighbors: Vec<Vec<f32>> = (0..4).map(|n| (0..w * h * nz).map(|i| crafted_cost(n, i)).collect()).collect();

    // Neighbor 2 wins everywhere on one depth plane, neighbor 3 loses
    // everywhere on another.
    let mut neighbors = neighbors;
    for i in 0..w * h {
        neighbors[2][3 * w * h + i] = 1.0;
        neighbors[3][5 * w * h + i] = 250.0;
    }

    for costs in &neighbors {
        for z in 0..nz {
            for y in 0..h {
                for x in 0..w {
                    let i = (z * h + y) * w + x;
                    let (mut b, mut s) = (best.get(x, y, z), second.get(x, y, z));
                    update_best_two(&mut b, &mut s, costs[i]);
                    best.set(x, y, z, b);
                    second.set(x, y, z, s);
                }
            }
        }
    }

    for z in 0..nz {
        for y in 0..h {
            for x in 0..w {
                let i = (z * h + y) * w + x;
                let mut all: Vec<f32> = neighbors.iter().map(|c| c[i]).collect();
                all.sort_by(f32::total_cmp);
                assert_eq!(best.get(x, y, z), all[0], "best at ({x}, {y}, {z})");
                assert_eq!(second.get(x, y, z), all[1], "second at ({x}, {y}, {z})");
                assert!(best.get(x, y, z) <= second.get(x, y, z));
            }
        }
        if z == 3 {
            assert!((0..h).all(|y| (0..w).all(|x| best.get(x, y, z) == 1.0)));
        }
    }
}

fn plane_setup() -> (PlaneScene, Vec<CameraView>, Tile) {
    let scene = PlaneScene::new(64, 64, 3);
    let views = scene.views(1).unwrap();
    let tile = Tile { id: 0, nb_tiles: 1, rc: 0, roi: Roi::full(64, 64), sgm_tcs: vec![1, 2], refine_tcs: vec![1, 2] };
    (scene, views, tile)
}

fn full_res_params() -> SgmParams {
    let mut p = SgmParams { scale: 1, step_xy: 1, max_depths: 64, ..SgmParams::default() };
    p.patch.wsh = 3;
    p
}

#[test]
fn sgm_recovers_plane_depth() {
    init();
    let (scene, views, tile) = plane_setup();
    let tcs = [&views[1], &views[2]];
    let depths = SgmDepthList::linear(DepthRange::new(8.0, 12.5).unwrap(), 64).unwrap();

    let mut sgm = Sgm::new(full_res_params()).unwrap();
    let result = sgm.sgm_rc(&tile, &views[0], &tcs, &depths).unwrap();
    assert_eq!((result.depth_sim.width(), result.depth_sim.height()), (64, 64));

    let truth = scene.depth_map(0);
    let border = 6;
    let mut errors = Vec::new();
    for y in border..64 - border {
        for x in border..64 - border {
            let d = result.depth_sim.depth.get(x, y);
            if is_valid_depth(d) {
                errors.push((d - truth.get(x, y)).abs());
            }
        }
    }
    let interior = (64 - 2 * border) * (64 - 2 * border);
    assert!(errors.len() * 10 >= interior * 9, "only {}/{interior} valid", errors.len());
    errors.sort_by(f32::total_cmp);
    let median = errors[errors.len() / 2];
    assert!(median < 0.4, "median depth error {median}");

    // Good matches come with negative similarity.
    let sim = result.depth_sim.sim.get(32, 32);
    assert!(sim < 0.0, "similarity at center {sim}");

    // Normals of the plane face the reference camera.
    let n = result.normals.get(32, 32);
    assert!(n[2] < -0.7, "normal at center {n:?}");
}

#[test]
fn aggregation_keeps_best_volume_below_second() {
    let (_, views, tile) = plane_setup();
    let tcs = [&views[1], &views[2]];
    let depths = SgmDepthList::linear(DepthRange::new(8.0, 12.5).unwrap(), 16).unwrap();
    let params = SgmParams { max_depths: 16, ..full_res_params() };
    let frame = MapFrame::new(&views[0], &tile.roi, params.scale, params.step_xy).unwrap();

    let mut sgm = Sgm::new(params).unwrap();
    sgm.compute_similarity_volumes(&frame, &views[0], &tcs, &depths).unwrap();
    let best = sgm.best_volume();
    let second = sgm.second_best_volume();
    assert_eq!((best.width(), best.height(), best.depth()), (64, 64, 16));
    assert!(best.as_slice().iter().zip(second.as_slice()).all(|(b, s)| b <= s));
    assert!(best.as_slice().iter().any(|&b| b < TSIM_INVALID));
}

#[test]
fn no_neighbors_gives_invalid_map() {
    let (_, views, tile) = plane_setup();
    let depths = SgmDepthList::linear(DepthRange::new(8.0, 12.5).unwrap(), 8).unwrap();
    let params = SgmParams { max_depths: 8, ..full_res_params() };
    let result = Sgm::new(params).unwrap().sgm_rc(&tile, &views[0], &[], &depths).unwrap();
    assert_eq!(result.depth_sim.nb_valid(), 0);
}

#[test]
fn depth_list_spacing_tracks_disparity() {
    let (scene, views, _) = plane_setup();
    let rc = views[0].camera_at(1).unwrap();
    let tc = views[1].camera_at(1).unwrap();
    let tcs = [&tc];
    let roi = Roi::full(64, 64);
    let list = SgmDepthList::compute(&rc, &tcs, &roi, scene.depth_range().unwrap(), 0.1, 1000).unwrap();
    let d = list.depths();
    assert!(d.windows(2).all(|p| p[0] < p[1]));
    // Depth steps grow with depth for a fixed pixel step.
    assert!(d[d.len() - 1] - d[d.len() - 2] > d[1] - d[0]);
    let capped = SgmDepthList::compute(&rc, &tcs, &roi, scene.depth_range().unwrap(), 0.1, 5).unwrap();
    assert_eq!(capped.len(), 5);
}
