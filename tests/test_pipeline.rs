// tests/test_pipeline.rs — End-to-end depth map estimation on the
// synthetic plane: tiling, SGM, refinement, persistence and merge.

use depthmap::io::{nb_depth_values, read_depth_map, read_normal_map, MapKind};
use depthmap::maps::is_valid_depth;
use depthmap::synthetic::PlaneScene;
use depthmap::tile::TileParams;
use depthmap::{CpuTileEngine, DepthMapConfig, DepthMapEstimator, SceneInput};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Four 40×40 tiles on a 64×64 image, SGM at half and refine at full
/// resolution.
fn config() -> DepthMapConfig {
    let mut c = DepthMapConfig::default();
    c.tile = TileParams { buffer_width: 40, buffer_height: 40, padding: 16 };
    c.sgm.scale = 1;
    c.sgm.step_xy = 2;
    c.sgm.step_z = 0.05;
    c.sgm.max_depths = 48;
    c.sgm.patch.wsh = 3;
    c.refine.scale = 1;
    c.refine.step_xy = 1;
    c.refine.half_nb_depths = 3;
    c.refine.n_iterations = 10;
    c.refine.patch.wsh = 2;
    c
}

#[test]
fn estimates_the_plane_end_to_end() {
    init();
    let scene = PlaneScene::new(64, 64, 3);
    let views = scene.views(2).unwrap();
    let landmarks = scene.landmarks(6);
    let input = SceneInput { views: &views, landmarks: &landmarks, fallback_range: None };
    let dir = tempfile::tempdir().unwrap();
    let est = DepthMapEstimator::new(config(), dir.path()).unwrap();

    let mut engine = CpuTileEngine::new(est.config()).unwrap();
    let r = est.estimate_camera(&mut engine, &input, 0).unwrap();
    assert_eq!(r.nb_tiles, 4);
    assert_eq!(r.sgm_tcs.len(), 2);
    assert!(r.nb_depth_values > 0);

    let merged = r.merged.unwrap();
    assert_eq!((merged.width(), merged.height()), (64, 64));

    // Persisted as untiled maps, tiles gone.
    let out = est.output();
    assert!(out.map_path(0, MapKind::Depth).exists());
    assert!(out.map_path(0, MapKind::Sim).exists());
    assert!(out.map_path(0, MapKind::Normal).exists());
    assert!(out.tile_paths(0, MapKind::Depth).unwrap().is_empty());
    assert!(out.tile_paths(0, MapKind::Normal).unwrap().is_empty());
    assert_eq!(read_depth_map(out, 0, &views[0].params).unwrap().as_slice(), merged.depth.as_slice());
    assert_eq!(nb_depth_values(out, 0, &views[0].params).unwrap(), merged.nb_valid());

    let truth = scene.depth_map(0);
    let border = 6;
    let mut errors = Vec::new();
    for y in border..64 - border {
        for x in border..64 - border {
            let d = merged.depth.get(x, y);
            if is_valid_depth(d) {
                errors.push((d - truth.get(x, y)).abs());
            }
        }
    }
    let interior = (64 - 2 * border) * (64 - 2 * border);
    assert!(errors.len() * 10 >= interior * 8, "only {}/{interior} valid", errors.len());
    errors.sort_by(f32::total_cmp);
    let median = errors[errors.len() / 2];
    assert!(median < 0.3, "median depth error {median}");

    let normals = read_normal_map(out, 0, &views[0].params).unwrap();
    assert!(normals.get(32, 32)[2] < -0.7);
}

#[test]
fn keeps_tiles_when_merge_is_off() {
    init();
    let scene = PlaneScene::new(64, 64, 3);
    let views = scene.views(2).unwrap();
    let input = SceneInput { views: &views, landmarks: &[], fallback_range: Some(scene.depth_range().unwrap()) };
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.merge_tiles = false;
    cfg.delete_tiles = false;
    cfg.export_sgm = true;
    cfg.write_normals = false;
    cfg.sgm.export_probes = vec![[5, 5]];
    let est = DepthMapEstimator::new(cfg, dir.path()).unwrap();

    let mut engine = CpuTileEngine::new(est.config()).unwrap();
    let r = est.estimate_camera(&mut engine, &input, 1).unwrap();
    assert!(r.merged.is_none());

    let out = est.output();
    assert!(!out.map_path(1, MapKind::Depth).exists());
    assert_eq!(out.tile_paths(1, MapKind::Depth).unwrap().len(), 4);
    assert_eq!(out.tile_paths(1, MapKind::Sim).unwrap().len(), 4);
    assert!(out.tile_paths(1, MapKind::Normal).unwrap().is_empty());
    assert_eq!(est.sgm_output().tile_paths(1, MapKind::Depth).unwrap().len(), 4);
    let probes = std::fs::read_to_string(dir.path().join("1_24_24_sgmProbes.csv")).unwrap();
    assert!(probes.lines().count() > 2);

    // The tiles still read back as one map, and the per-tile counts add up.
    let depth = read_depth_map(out, 1, &views[1].params).unwrap();
    assert_eq!((depth.width(), depth.height()), (64, 64));
    assert_eq!(nb_depth_values(out, 1, &views[1].params).unwrap(), r.nb_depth_values);
}

#[test]
fn estimate_all_reports_each_camera() {
    init();
    let scene = PlaneScene::new(64, 64, 3);
    let views = scene.views(2).unwrap();
    let landmarks = scene.landmarks(4);
    let input = SceneInput { views: &views, landmarks: &landmarks, fallback_range: None };
    let dir = tempfile::tempdir().unwrap();
    let est = DepthMapEstimator::new(config(), dir.path()).unwrap();

    let results = est.estimate_all(&input, &[0, 2, 9]).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().rc, 0);
    assert_eq!(results[1].as_ref().unwrap().rc, 2);
    assert!(results[2].as_ref().unwrap_err().is_configuration());
    assert!(est.output().map_path(2, MapKind::Depth).exists());
}

#[test]
fn rejects_invalid_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.merge_tiles = false;
    assert!(DepthMapEstimator::new(cfg, dir.path()).unwrap_err().is_configuration());
}
