// gpu/refine.rs — Refinement Engine on the GPU.
//
// Mirrors refine/mod.rs with the kernels of refine.wgsl. All per-pixel
// planes of a tile live in one pitched `maps` buffer; the sweep costs in
// a second one. The Jacobi iterations ping-pong between two depth planes,
// so the final depth sits in plane 3 after an even number of iterations
// and in plane 5 after an odd one.

use bytemuck::{Pod, Zeroable};

use crate::camera::CameraView;
use crate::error::{DepthMapError, Result};
use crate::frame::MapFrame;
use crate::gpu::buffer::{uniform_buffer, DeviceBuffer, MemoryUsage};
use crate::gpu::device::GpuDevice;
use crate::gpu::kernel::{camera_block, load_module, ComputeKernel, COMMON_WGSL};
use crate::gpu::sgm::max_map_size;
use crate::gpu::stream::GpuStream;
use crate::image::Image;
use crate::maps::{DepthPixSizeMap, DepthSimMap};
use crate::normals::compute_normal_map;
use crate::refine::{RefineParams, RefineResult};
use crate::sgm::{SgmParams, SgmResult};
use crate::tile::{Tile, TileParams};

const REFINE_WGSL: &str = include_str!("../shaders/refine.wgsl");

const PLANE_PIX_SIZE: usize = 2;
const PLANE_DEPTH: usize = 3;
const PLANE_SIM: usize = 4;
const PLANE_DEPTH_ALT: usize = 5;
const NB_PLANES: usize = 8;

/// Mirrors `RefineUniform` in refine.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct RefineUniform {
    width: u32,
    height: u32,
    pitch: u32,
    rows: u32,

    roi_x: i32,
    roi_y: i32,
    step: i32,
    n_depths: u32,

    rc_w: i32,
    rc_h: i32,
    tc_w: i32,
    tc_h: i32,

    wsh: i32,
    gamma_c: f32,
    gamma_p: f32,
    tc_cam: u32,

    sgm_w: u32,
    sgm_h: u32,
    sgm_pitch: u32,
    sgm_rows: u32,

    ratio: f32,
    sgm_off_x: f32,
    sgm_off_y: f32,
    interpolate: u32,

    half_nb_depths: u32,
    depth_step: f32,
    variance_wsh: i32,
    variance_gamma: f32,

    smoothness: f32,
    iteration_decay: f32,
    sgm_prior_weight: f32,
    n_iterations: u32,

    iteration: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

struct RefineKernels {
    upscale_depth_pix_size: ComputeKernel,
    clear_costs: ComputeKernel,
    refine_sweep: ComputeKernel,
    refine_best_depth: ComputeKernel,
    variance_data_term: ComputeKernel,
    optimize_iteration: ComputeKernel,
}

impl RefineKernels {
    fn new(gpu: &GpuDevice) -> Self {
        let module = load_module(gpu, "refine.wgsl", &[COMMON_WGSL, REFINE_WGSL]);
        RefineKernels {
            upscale_depth_pix_size: ComputeKernel::new(gpu, &module, "upscale_depth_pix_size"),
            clear_costs: ComputeKernel::new(gpu, &module, "clear_costs"),
            refine_sweep: ComputeKernel::new(gpu, &module, "refine_sweep"),
            refine_best_depth: ComputeKernel::new(gpu, &module, "refine_best_depth"),
            variance_data_term: ComputeKernel::new(gpu, &module, "variance_data_term"),
            optimize_iteration: ComputeKernel::new(gpu, &module, "optimize_iteration"),
        }
    }
}

pub struct GpuRefine<'g> {
    gpu: &'g GpuDevice,
    params: RefineParams,
    kernels: RefineKernels,
    /// SGM depth and similarity planes.
    sgm_in: DeviceBuffer<f32>,
    maps: DeviceBuffer<f32>,
    costs: DeviceBuffer<f32>,
}

impl<'g> GpuRefine<'g> {
    /// Compile the kernels and allocate buffers for the largest tile.
    /// `sgm_params` sizes the buffer receiving the SGM maps.
    pub fn new(
        gpu: &'g GpuDevice,
        params: RefineParams,
        sgm_params: &SgmParams,
        tile_params: &TileParams,
    ) -> Result<Self> {
        params.validate()?;
        tile_params.validate()?;
        let (sw, sh) = max_map_size(tile_params, sgm_params.downscale());
        let (w, h) = max_map_size(tile_params, params.downscale());
        let k = params.depth_list().len();
        log::debug!("GpuRefine: buffers for {w}×{h} maps, {k} hypotheses");

        Ok(GpuRefine {
            gpu,
            kernels: RefineKernels::new(gpu),
            sgm_in: DeviceBuffer::new(gpu, "refine sgm input", sw, sh, 2)?,
            maps: DeviceBuffer::new(gpu, "refine maps", w, h, NB_PLANES)?,
            costs: DeviceBuffer::new(gpu, "refine costs", w, h, 2 * k)?,
            params,
        })
    }

    pub fn params(&self) -> &RefineParams {
        &self.params
    }

    pub fn refine_rc(
        &mut self,
        tile: &Tile,
        rc: &CameraView,
        tcs: &[&CameraView],
        sgm: &SgmResult,
    ) -> Result<RefineResult> {
        let gpu = self.gpu;
        let p = &self.params;
        let frame = MapFrame::new(rc, &tile.roi, p.scale, p.step_xy)?;
        let (w, h) = (frame.width(), frame.height());
        let (sw, sh) = (sgm.depth_sim.width(), sgm.depth_sim.height());
        log::debug!(
            "gpu refine rc {} tile {}/{}: {w}×{h} map, {} tcs",
            rc.index,
            tile.id + 1,
            tile.nb_tiles,
            tcs.len()
        );

        let cap = *self.maps.layout();
        let sgm_cap = *self.sgm_in.layout();
        if w > cap.width || h > cap.height || sw > sgm_cap.width || sh > sgm_cap.height {
            return Err(DepthMapError::config(format!(
                "tile maps {w}×{h} (sgm {sw}×{sh}) exceed the allocated {}×{} (sgm {}×{})",
                cap.width, cap.height, sgm_cap.width, sgm_cap.height
            )));
        }
        if sw == 0 || sh == 0 || w == 0 || h == 0 {
            let depth_sim = DepthSimMap::new_invalid(w, h);
            let normals = compute_normal_map(&depth_sim.depth, &frame, p.normal_wsh);
            return Ok(RefineResult {
                depth_pix_size: DepthPixSizeMap::new_invalid(w, h),
                depth_sim,
                normals,
                frame,
            });
        }

        let mut sgm_planes = Vec::with_capacity(2 * sw * sh);
        sgm_planes.extend_from_slice(sgm.depth_sim.depth.as_slice());
        sgm_planes.extend_from_slice(sgm.depth_sim.sim.as_slice());
        self.sgm_in.upload(gpu, &sgm_planes, sw, sh, 2)?;

        let rc_image = rc.image_at(p.scale)?;
        let rc_buf = DeviceBuffer::from_slice(gpu, "refine rc image", rc_image.as_slice(), rc_image.len(), 1, 1)?;
        let mut cam_data = camera_block(&frame.cam).to_vec();
        let mut textures = Vec::with_capacity(tcs.len());
        for tc in tcs {
            let image = tc.image_at(p.scale)?;
            cam_data.extend_from_slice(&camera_block(&tc.camera_at(p.scale)?));
            let buf = DeviceBuffer::from_slice(gpu, "refine tc image", image.as_slice(), image.len(), 1, 1)?;
            textures.push((buf, image.width(), image.height()));
        }
        let cams = DeviceBuffer::from_slice(gpu, "refine cameras", &cam_data, cam_data.len(), 1, 1)?;

        let list = p.depth_list();
        let base = RefineUniform {
            width: w as u32,
            height: h as u32,
            pitch: self.maps.pitch(),
            rows: self.maps.rows(),
            roi_x: frame.roi.x.begin,
            roi_y: frame.roi.y.begin,
            step: frame.step as i32,
            n_depths: list.len() as u32,
            rc_w: rc_image.width() as i32,
            rc_h: rc_image.height() as i32,
            wsh: p.patch.wsh,
            gamma_c: p.patch.gamma_c,
            gamma_p: p.patch.gamma_p,
            sgm_w: sw as u32,
            sgm_h: sh as u32,
            sgm_pitch: self.sgm_in.pitch(),
            sgm_rows: self.sgm_in.rows(),
            ratio: frame.downscale() as f32 / sgm.frame.downscale() as f32,
            sgm_off_x: sgm.frame.roi.x.begin as f32,
            sgm_off_y: sgm.frame.roi.y.begin as f32,
            interpolate: p.interpolate_middle_depth as u32,
            half_nb_depths: list.half_nb_depths as u32,
            depth_step: list.depth_step,
            variance_wsh: p.variance_wsh as i32,
            variance_gamma: p.variance_gamma,
            smoothness: p.smoothness,
            iteration_decay: p.iteration_decay,
            sgm_prior_weight: p.sgm_prior_weight,
            n_iterations: p.n_iterations as u32,
            ..RefineUniform::default()
        };

        let k = &self.kernels;
        let mut stream = GpuStream::new(gpu, format!("refine rc {} tile {}", rc.index, tile.id));
        // Uniform buffers must outlive the checkpoint.
        let mut uniforms: Vec<wgpu::Buffer> = Vec::new();

        let u = uniform_buffer(gpu, "refine upscale", &base);
        let bg = k.upscale_depth_pix_size.bind(
            gpu,
            [
                (0, u.as_entire_binding()),
                (3, cams.binding()),
                (4, self.sgm_in.binding()),
                (5, self.maps.binding()),
            ],
        );
        k.upscale_depth_pix_size.dispatch_grid(&mut stream, &bg, w, h, 1);
        uniforms.push(u);

        let run_sweep = p.enabled && !tcs.is_empty();
        if run_sweep {
            let u = uniform_buffer(gpu, "refine clear", &base);
            let bg = k.clear_costs.bind(gpu, [(0, u.as_entire_binding()), (6, self.costs.binding())]);
            k.clear_costs.dispatch_grid(&mut stream, &bg, w, h, 2 * list.len());
            uniforms.push(u);

            for (i, (tex, tw, th)) in textures.iter().enumerate() {
                let u = uniform_buffer(
                    gpu,
                    "refine sweep",
                    &RefineUniform { tc_cam: 1 + i as u32, tc_w: *tw as i32, tc_h: *th as i32, ..base },
                );
                let bg = k.refine_sweep.bind(
                    gpu,
                    [
                        (0, u.as_entire_binding()),
                        (1, rc_buf.binding()),
                        (2, tex.binding()),
                        (3, cams.binding()),
                        (5, self.maps.binding()),
                        (6, self.costs.binding()),
                    ],
                );
                k.refine_sweep.dispatch_grid(&mut stream, &bg, w, h, list.len());
                uniforms.push(u);
            }

            let u = uniform_buffer(gpu, "refine best depth", &base);
            let bg = k.refine_best_depth.bind(
                gpu,
                [(0, u.as_entire_binding()), (5, self.maps.binding()), (6, self.costs.binding())],
            );
            k.refine_best_depth.dispatch_grid(&mut stream, &bg, w, h, 1);
            uniforms.push(u);

            if p.n_iterations > 0 {
                let u = uniform_buffer(gpu, "refine variance", &base);
                let bg = k.variance_data_term.bind(
                    gpu,
                    [(0, u.as_entire_binding()), (1, rc_buf.binding()), (5, self.maps.binding())],
                );
                k.variance_data_term.dispatch_grid(&mut stream, &bg, w, h, 1);
                uniforms.push(u);

                for t in 0..p.n_iterations {
                    let u = uniform_buffer(gpu, "refine iteration", &RefineUniform { iteration: t as u32, ..base });
                    let bg = k.optimize_iteration.bind(gpu, [(0, u.as_entire_binding()), (5, self.maps.binding())]);
                    k.optimize_iteration.dispatch_grid(&mut stream, &bg, w, h, 1);
                    uniforms.push(u);
                }
            }
        }
        stream.synchronize("refine")?;
        drop(uniforms);

        let planes = self.maps.download(gpu, w, h, PLANE_DEPTH_ALT + 1)?;
        let plane = |i: usize| Image::from_vec(w, h, planes[i * w * h..(i + 1) * w * h].to_vec());
        let final_plane = if run_sweep && p.n_iterations % 2 == 1 { PLANE_DEPTH_ALT } else { PLANE_DEPTH };
        let depth_sim = DepthSimMap { depth: plane(final_plane), sim: plane(PLANE_SIM) };
        let depth_pix_size = DepthPixSizeMap { depth: depth_sim.depth.clone(), pix_size: plane(PLANE_PIX_SIZE) };
        let normals = compute_normal_map(&depth_sim.depth, &frame, p.normal_wsh);
        log::debug!("gpu refine rc {} tile {}: {} valid depths", rc.index, tile.id + 1, depth_sim.nb_valid());
        Ok(RefineResult { depth_sim, depth_pix_size, normals, frame })
    }

    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::sum([*self.sgm_in.layout(), *self.maps.layout(), *self.costs.layout()])
    }

    /// Device memory held, with row pitch applied (MiB).
    pub fn device_memory_consumption(&self) -> f64 {
        self.memory_usage().padded_mib()
    }

    /// Device memory held, without pitch padding (MiB).
    pub fn device_memory_consumption_unpadded(&self) -> f64 {
        self.memory_usage().unpadded_mib()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout() {
        assert_eq!(std::mem::size_of::<RefineUniform>(), 144);
        assert_eq!(std::mem::size_of::<RefineUniform>() % 16, 0);
    }

    // ---- CPU parity (subprocess isolation, see gpu::device) --------------

    use crate::depth_list::SgmDepthList;
    use crate::maps::is_valid_depth;
    use crate::refine::Refine;
    use crate::roi::Roi;
    use crate::sgm::Sgm;
    use crate::synthetic::PlaneScene;

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_refine_matches_cpu() {
        let gpu = GpuDevice::new().unwrap();
        let scene = PlaneScene::new(64, 64, 3);
        let views = scene.views(4).unwrap();
        let tcs = [&views[1], &views[2]];
        let tile_params = TileParams { buffer_width: 64, buffer_height: 64, padding: 16 };
        let tile = Tile { id: 0, nb_tiles: 1, rc: 0, roi: Roi::full(64, 64), sgm_tcs: vec![1, 2], refine_tcs: vec![1, 2] };
        let sgm_params = SgmParams { max_depths: 32, ..SgmParams::default() };
        let params = RefineParams { scale: 2, step_xy: 1, n_iterations: 8, ..RefineParams::default() };

        let depths = SgmDepthList::linear(scene.depth_range().unwrap(), 32).unwrap();
        let sgm = Sgm::new(sgm_params.clone()).unwrap().sgm_rc(&tile, &views[0], &tcs, &depths).unwrap();

        let cpu = Refine::new(params.clone()).unwrap().refine_rc(&tile, &views[0], &tcs, &sgm).unwrap();
        let mut engine = GpuRefine::new(&gpu, params, &sgm_params, &tile_params).unwrap();
        let out = engine.refine_rc(&tile, &views[0], &tcs, &sgm).unwrap();

        assert_eq!(out.depth_sim.width(), cpu.depth_sim.width());
        assert_eq!(out.depth_sim.height(), cpu.depth_sim.height());
        let pix = cpu.depth_pix_size.pix_size.as_slice();
        let g = out.depth_sim.depth.as_slice();
        let c = cpu.depth_sim.depth.as_slice();
        let mut compared = 0;
        let mut close = 0;
        for ((a, b), p) in g.iter().zip(c).zip(pix) {
            if !is_valid_depth(*b) {
                continue;
            }
            compared += 1;
            if (a - b).abs() <= 2.0 * p.max(1e-3) {
                close += 1;
            }
        }
        assert!(compared > 0);
        assert!(close * 100 >= compared * 90, "only {close}/{compared} refined depths agree");
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_refine_matches_cpu() {
        let out =
            crate::gpu::device::tests::run_gpu_test_in_subprocess("gpu::refine::tests::inner_refine_matches_cpu");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
