// tests/test_refine.rs — Refinement of a coarse SGM result on the synthetic plane.

use depthmap::camera::CameraView;
use depthmap::depth_list::{DepthRange, SgmDepthList};
use depthmap::frame::MapFrame;
use depthmap::image::Image;
use depthmap::maps::{is_valid_depth, NORMAL_INVALID, SIM_INVALID};
use depthmap::refine::upscale::{compute_pix_size_map, upscale_depth_sim};
use depthmap::refine::{Refine, RefineParams};
use depthmap::roi::Roi;
use depthmap::sgm::{Sgm, SgmParams, SgmResult};
use depthmap::synthetic::PlaneScene;
use depthmap::tile::Tile;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Fixture {
    scene: PlaneScene,
    views: Vec<CameraView>,
    tile: Tile,
    sgm: SgmResult,
}

fn fixture() -> Fixture {
    let scene = PlaneScene::new(64, 64, 3);
    let views = scene.views(2).unwrap();
    let tile = Tile { id: 0, nb_tiles: 1, rc: 0, roi: Roi::full(64, 64), sgm_tcs: vec![1, 2], refine_tcs: vec![1, 2] };
    let mut params = SgmParams { scale: 2, step_xy: 1, max_depths: 48, ..SgmParams::default() };
    params.patch.wsh = 2;
    let depths = SgmDepthList::linear(DepthRange::new(8.0, 12.5).unwrap(), 48).unwrap();
    let sgm = Sgm::new(params).unwrap().sgm_rc(&tile, &views[0], &[&views[1], &views[2]], &depths).unwrap();
    Fixture { scene, views, tile, sgm }
}

fn refine_params() -> RefineParams {
    let mut p = RefineParams { scale: 1, step_xy: 1, n_iterations: 10, half_nb_depths: 6, ..RefineParams::default() };
    p.patch.wsh = 2;
    p
}

fn median_error(depth: &Image<f32>, truth: &Image<f32>, border: usize) -> f32 {
    let mut errors: Vec<f32> = Vec::new();
    for y in border..depth.height() - border {
        for x in border..depth.width() - border {
            let d = depth.get(x, y);
            if is_valid_depth(d) {
                errors.push((d - truth.get(x, y)).abs());
            }
        }
    }
    assert!(!errors.is_empty());
    errors.sort_by(f32::total_cmp);
    errors[errors.len() / 2]
}

#[test]
fn refined_depths_stay_in_the_band() {
    init();
    let f = fixture();
    let tcs = [&f.views[1], &f.views[2]];
    let params = refine_params();
    let refine = Refine::new(params.clone()).unwrap();
    let out = refine.refine_rc(&f.tile, &f.views[0], &tcs, &f.sgm).unwrap();
    assert_eq!((out.depth_sim.width(), out.depth_sim.height()), (64, 64));

    let frame = MapFrame::new(&f.views[0], &f.tile.roi, params.scale, params.step_xy).unwrap();
    let up = upscale_depth_sim(&f.sgm.depth_sim, &f.sgm.frame, &frame, params.interpolate_middle_depth);
    let pix = compute_pix_size_map(&up.depth, &frame);
    let list = params.depth_list();

    for y in 0..64 {
        for x in 0..64 {
            let (d0, d) = (up.depth.get(x, y), out.depth_sim.depth.get(x, y));
            if !is_valid_depth(d0) {
                assert!(!is_valid_depth(d), "refine invented a depth at ({x}, {y})");
                continue;
            }
            let band = list.band(pix.pix_size.get(x, y));
            assert!((d - d0).abs() <= band * 1.001 + 1e-5, "({x}, {y}): {d} vs {d0}, band {band}");
        }
    }

    // The pixel-size map annotates the final depths.
    assert_eq!(out.depth_pix_size.depth.as_slice(), out.depth_sim.depth.as_slice());
    for (d, p) in out.depth_pix_size.depth.as_slice().iter().zip(out.depth_pix_size.pix_size.as_slice()) {
        if is_valid_depth(*d) {
            assert!(*p > 0.0);
        }
    }
}

#[test]
fn refinement_is_at_least_as_accurate_as_sgm() {
    init();
    let f = fixture();
    let tcs = [&f.views[1], &f.views[2]];
    let params = refine_params();
    let out = Refine::new(params.clone()).unwrap().refine_rc(&f.tile, &f.views[0], &tcs, &f.sgm).unwrap();

    let frame = MapFrame::new(&f.views[0], &f.tile.roi, params.scale, params.step_xy).unwrap();
    let up = upscale_depth_sim(&f.sgm.depth_sim, &f.sgm.frame, &frame, false);
    let truth = f.scene.depth_map(0);

    let before = median_error(&up.depth, &truth, 6);
    let after = median_error(&out.depth_sim.depth, &truth, 6);
    assert!(after <= before + 0.02, "refined median error {after} vs sgm {before}");
    assert!(after < 0.3, "refined median error {after}");
}

#[test]
fn disabled_refine_only_upscales() {
    let f = fixture();
    let params = RefineParams { enabled: false, ..refine_params() };
    let out = Refine::new(params.clone())
        .unwrap()
        .refine_rc(&f.tile, &f.views[0], &[&f.views[1]], &f.sgm)
        .unwrap();

    let frame = MapFrame::new(&f.views[0], &f.tile.roi, params.scale, params.step_xy).unwrap();
    let up = upscale_depth_sim(&f.sgm.depth_sim, &f.sgm.frame, &frame, params.interpolate_middle_depth);
    assert_eq!(out.depth_sim.depth.as_slice(), up.depth.as_slice());
    assert_eq!(out.depth_sim.sim.as_slice(), up.sim.as_slice());
}

#[test]
fn invalid_sgm_pixels_stay_invalid_after_refine() {
    init();
    let mut f = fixture();
    // SGM runs at scale 2: block [10, 14)² covers refine pixels [20, 28)².
    for y in 10..14 {
        for x in 10..14 {
            f.sgm.depth_sim.depth.set(x, y, -1.0);
            f.sgm.depth_sim.sim.set(x, y, SIM_INVALID);
        }
    }
    let tcs = [&f.views[1], &f.views[2]];

    for interpolate in [false, true] {
        let params = RefineParams { interpolate_middle_depth: interpolate, ..refine_params() };
        let out = Refine::new(params).unwrap().refine_rc(&f.tile, &f.views[0], &tcs, &f.sgm).unwrap();
        // 27 would round to SGM column 14, which is still valid.
        for y in 20..27 {
            for x in 20..27 {
                assert!(!is_valid_depth(out.depth_sim.depth.get(x, y)), "depth at ({x}, {y}), interpolate {interpolate}");
                assert_eq!(out.depth_sim.sim.get(x, y), SIM_INVALID);
                assert_eq!(out.normals.get(x, y), NORMAL_INVALID);
                assert!(!is_valid_depth(out.depth_pix_size.depth.get(x, y)));
            }
        }
        // Valid pixels away from the hole are still refined.
        assert!(is_valid_depth(out.depth_sim.depth.get(40, 40)));
    }
}
