// benches/gpu_benchmarks.rs — GPU engine benchmarks.
//
// Mirrors benchmarks.rs structure. Each CPU stage has a corresponding GPU
// benchmark in the same group for direct comparison.
//
//   cargo bench --bench gpu_benchmarks
//
//
// CRITERION + GPU CAVEATS
// ────────────────────────
// Criterion measures wall time including CPU overhead (texture uploads,
// bind group creation, submit, poll). Shader execution is included in the
// final download. That is the number that matters here: the pipeline
// writes each tile to disk before starting the next one.
//
// The first iterations pay pipeline compilation on some drivers, so the
// warm-up time is set explicitly.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use depthmap::camera::CameraView;
use depthmap::depth_list::SgmDepthList;
use depthmap::gpu::{GpuDevice, GpuRefine, GpuSgm};
use depthmap::refine::{Refine, RefineParams};
use depthmap::roi::Roi;
use depthmap::sgm::{Sgm, SgmParams};
use depthmap::synthetic::PlaneScene;
use depthmap::tile::{Tile, TileParams};

// ============================================================
// Shared helpers
// ============================================================

const W: usize = 256;
const H: usize = 192;

fn scene() -> (PlaneScene, Vec<CameraView>) {
    let scene = PlaneScene::new(W, H, 3);
    let views = scene.views(4).expect("synthetic views");
    (scene, views)
}

fn full_tile() -> Tile {
    Tile { id: 0, nb_tiles: 1, rc: 0, roi: Roi::full(W, H), sgm_tcs: vec![1, 2], refine_tcs: vec![1, 2] }
}

const TILES: TileParams = TileParams { buffer_width: 256, buffer_height: 256, padding: 32 };

// ============================================================
// SGM: CPU vs GPU, varying depth count
// ============================================================

fn bench_sgm(c: &mut Criterion) {
    let (scene, views) = scene();
    let tile = full_tile();
    let tcs = [&views[1], &views[2]];
    let gpu = GpuDevice::new().expect("no Vulkan GPU");

    let mut group = c.benchmark_group("sgm");
    group.warm_up_time(Duration::from_secs(2));
    group.sample_size(10);

    for nz in [32usize, 96, 256] {
        let params = SgmParams { max_depths: nz, ..SgmParams::default() };
        let depths = SgmDepthList::linear(scene.depth_range().expect("range"), nz).expect("depth list");
        let mut cpu = Sgm::new(params.clone()).expect("sgm params");
        let mut gpu_sgm = GpuSgm::new(&gpu, params, &TILES).expect("gpu sgm");

        group.bench_with_input(BenchmarkId::new("cpu_sgm_rc", nz), &nz, |b, _| {
            b.iter(|| cpu.sgm_rc(&tile, &views[0], &tcs, &depths))
        });
        group.bench_with_input(BenchmarkId::new("gpu_sgm_rc", nz), &nz, |b, _| {
            b.iter(|| gpu_sgm.sgm_rc(&tile, &views[0], &tcs, &depths))
        });
    }
    group.finish();
}

// ============================================================
// Refine: CPU vs GPU
// ============================================================

fn bench_refine(c: &mut Criterion) {
    let (scene, views) = scene();
    let tile = full_tile();
    let tcs = [&views[1], &views[2]];
    let gpu = GpuDevice::new().expect("no Vulkan GPU");

    let sgm_params = SgmParams { max_depths: 64, ..SgmParams::default() };
    let depths = SgmDepthList::linear(scene.depth_range().expect("range"), 64).expect("depth list");
    let sgm = Sgm::new(sgm_params.clone())
        .and_then(|mut s| s.sgm_rc(&tile, &views[0], &tcs, &depths))
        .expect("sgm");

    let params = RefineParams::default();
    let cpu = Refine::new(params.clone()).expect("refine params");
    let mut gpu_refine = GpuRefine::new(&gpu, params, &sgm_params, &TILES).expect("gpu refine");

    let mut group = c.benchmark_group("refine");
    group.warm_up_time(Duration::from_secs(2));
    group.sample_size(10);
    group.bench_function("cpu_refine_rc_256x192", |b| {
        b.iter(|| cpu.refine_rc(&tile, &views[0], &tcs, &sgm))
    });
    group.bench_function("gpu_refine_rc_256x192", |b| {
        b.iter(|| gpu_refine.refine_rc(&tile, &views[0], &tcs, &sgm))
    });
    group.finish();
}

// ============================================================
// Allocation: engine construction for the largest tile
// ============================================================

fn bench_allocation(c: &mut Criterion) {
    let gpu = GpuDevice::new().expect("no Vulkan GPU");
    let params = SgmParams { max_depths: 256, ..SgmParams::default() };
    let tiles = TileParams::default();

    let mut group = c.benchmark_group("allocation");
    group.sample_size(10);
    group.bench_function("gpu_sgm_new_1024_tiles", |b| {
        b.iter(|| GpuSgm::new(&gpu, params.clone(), &tiles))
    });
    group.finish();
}

// ============================================================
// Register
// ============================================================

criterion_group!(benches, bench_sgm, bench_refine, bench_allocation);
criterion_main!(benches);
