// gpu/sgm.rs — Similarity Volume Engine on the GPU.
//
// Same stages and outputs as the CPU engine in sgm/mod.rs, backed by the
// kernels of sgm.wgsl:
//
//   volume_init           best / second ← 255
//   compute_similarity    × neighbors, best-two update per voxel
//   volume_fill_second    second ← 0 (recycled as the aggregated volume)
//   aggregate             × axes × 2 directions, one workgroup per lane
//   volume_scale          mean over paths
//   retrieve_best_depth   argmin + parabola per pixel
//
// Every device buffer is allocated once for the largest tile the tiling
// can produce; a tile uses the top-left part and passes its logical size
// in the uniform block. Normals are computed on the host from the
// downloaded depth map.

use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::camera::CameraView;
use crate::depth_list::SgmDepthList;
use crate::error::{DepthMapError, Result};
use crate::frame::MapFrame;
use crate::gpu::buffer::{uniform_buffer, DeviceBuffer, MemoryUsage};
use crate::gpu::device::GpuDevice;
use crate::gpu::kernel::{camera_block, load_module, ComputeKernel, COMMON_WGSL};
use crate::gpu::stream::GpuStream;
use crate::image::Image;
use crate::maps::DepthSimMap;
use crate::normals::compute_normal_map;
use crate::sgm::{write_volume_probes, SgmAxis, SgmParams, SgmResult};
use crate::tile::{Tile, TileParams};
use crate::volume::{Volume, TSIM_INVALID};

const SGM_WGSL: &str = include_str!("../shaders/sgm.wgsl");

/// Mirrors `SgmUniform` in sgm.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct SgmUniform {
    width: u32,
    height: u32,
    nz: u32,
    pitch: u32,

    rows: u32,
    roi_x: i32,
    roi_y: i32,
    step: i32,

    rc_w: i32,
    rc_h: i32,
    tc_w: i32,
    tc_h: i32,

    wsh: i32,
    gamma_c: f32,
    gamma_p: f32,
    tc_cam: u32,

    axis: u32,
    forward: u32,
    p1: f32,
    p2_weighting: f32,

    fill_value: f32,
    scale: f32,
    interpolate: u32,
    out_pitch: u32,
}

struct SgmKernels {
    volume_init: ComputeKernel,
    volume_fill_second: ComputeKernel,
    compute_similarity: ComputeKernel,
    aggregate: ComputeKernel,
    volume_scale: ComputeKernel,
    retrieve_best_depth: ComputeKernel,
}

impl SgmKernels {
    fn new(gpu: &GpuDevice) -> Self {
        let module = load_module(gpu, "sgm.wgsl", &[COMMON_WGSL, SGM_WGSL]);
        SgmKernels {
            volume_init: ComputeKernel::new(gpu, &module, "volume_init"),
            volume_fill_second: ComputeKernel::new(gpu, &module, "volume_fill_second"),
            compute_similarity: ComputeKernel::new(gpu, &module, "compute_similarity"),
            aggregate: ComputeKernel::new(gpu, &module, "aggregate"),
            volume_scale: ComputeKernel::new(gpu, &module, "volume_scale"),
            retrieve_best_depth: ComputeKernel::new(gpu, &module, "retrieve_best_depth"),
        }
    }
}

/// Reference texture of the tile being processed.
struct RcTexture {
    image: DeviceBuffer<f32>,
    cams: DeviceBuffer<f32>,
    width: usize,
    height: usize,
}

pub struct GpuSgm<'g> {
    gpu: &'g GpuDevice,
    params: SgmParams,
    axes: Vec<SgmAxis>,
    kernels: SgmKernels,
    best: DeviceBuffer<f32>,
    /// Second-best costs; holds the aggregated volume after optimization.
    second: DeviceBuffer<f32>,
    /// Two depth rows per lane (previous / current slice).
    slices: DeviceBuffer<f32>,
    depths: DeviceBuffer<f32>,
    out_depth: DeviceBuffer<f32>,
    out_sim: DeviceBuffer<f32>,
    rc: Option<RcTexture>,
    /// Uniform block of the current tile; carries its logical size.
    uniform: SgmUniform,
}

impl<'g> GpuSgm<'g> {
    /// Compile the kernels and allocate buffers for the largest tile of
    /// `tile_params`.
    pub fn new(gpu: &'g GpuDevice, params: SgmParams, tile_params: &TileParams) -> Result<Self> {
        params.validate()?;
        tile_params.validate()?;
        let axes = params.axes()?;
        let wg = gpu.workgroup_size.total();
        if !wg.is_power_of_two() || wg > 256 {
            return Err(DepthMapError::config(format!(
                "sgm aggregation needs a power-of-two workgroup of at most 256 invocations, got {}",
                gpu.workgroup_size
            )));
        }

        let (w, h) = max_map_size(tile_params, params.downscale());
        let nz = params.max_depths;
        let other = w.max(h);
        log::debug!("GpuSgm: buffers for {w}×{h}×{nz} volumes");

        Ok(GpuSgm {
            gpu,
            axes,
            kernels: SgmKernels::new(gpu),
            best: DeviceBuffer::new(gpu, "sgm best volume", w, h, nz)?,
            second: DeviceBuffer::new(gpu, "sgm second volume", w, h, nz)?,
            slices: DeviceBuffer::new(gpu, "sgm slices", 2 * nz * other, 1, 1)?,
            depths: DeviceBuffer::new(gpu, "sgm depths", nz, 1, 1)?,
            out_depth: DeviceBuffer::new(gpu, "sgm depth", w, h, 1)?,
            out_sim: DeviceBuffer::new(gpu, "sgm sim", w, h, 1)?,
            rc: None,
            uniform: SgmUniform::default(),
            params,
        })
    }

    pub fn params(&self) -> &SgmParams {
        &self.params
    }

    /// Full SGM pass for one tile.
    pub fn sgm_rc(
        &mut self,
        tile: &Tile,
        rc: &CameraView,
        tcs: &[&CameraView],
        depths: &SgmDepthList,
    ) -> Result<SgmResult> {
        let frame = MapFrame::new(rc, &tile.roi, self.params.scale, self.params.step_xy)?;
        log::debug!(
            "gpu sgm rc {} tile {}/{}: {}×{} map, {} depths, {} tcs",
            rc.index,
            tile.id + 1,
            tile.nb_tiles,
            frame.width(),
            frame.height(),
            depths.len(),
            tcs.len()
        );

        let mut stream = GpuStream::new(self.gpu, format!("sgm rc {} tile {}", rc.index, tile.id));
        self.compute_similarity_volumes(&mut stream, &frame, rc, tcs, depths)?;
        self.optimize_similarity_volume(&mut stream)?;
        let depth_sim = self.retrieve_best_depth(&mut stream)?;
        let normals = compute_normal_map(&depth_sim.depth, &frame, self.params.normal_wsh);
        Ok(SgmResult { depth_sim, normals, frame })
    }

    fn frame_uniform(&self, frame: &MapFrame, nz: usize, rc: &RcTexture) -> SgmUniform {
        let p = &self.params;
        SgmUniform {
            width: frame.width() as u32,
            height: frame.height() as u32,
            nz: nz as u32,
            pitch: self.best.pitch(),
            rows: self.best.rows(),
            roi_x: frame.roi.x.begin,
            roi_y: frame.roi.y.begin,
            step: frame.step as i32,
            rc_w: rc.width as i32,
            rc_h: rc.height as i32,
            wsh: p.patch.wsh,
            gamma_c: p.patch.gamma_c,
            gamma_p: p.patch.gamma_p,
            p1: p.p1,
            p2_weighting: p.p2_weighting,
            interpolate: p.interpolate_retrieve_best_depth as u32,
            out_pitch: self.out_depth.pitch(),
            ..SgmUniform::default()
        }
    }

    /// Stage 1: fill the best and second-best volumes.
    pub fn compute_similarity_volumes(
        &mut self,
        stream: &mut GpuStream<'_>,
        frame: &MapFrame,
        rc: &CameraView,
        tcs: &[&CameraView],
        depths: &SgmDepthList,
    ) -> Result<()> {
        let gpu = self.gpu;
        let (w, h, nz) = (frame.width(), frame.height(), depths.len());
        let cap = self.best.layout();
        if w > cap.width || h > cap.height || nz > cap.depth {
            return Err(DepthMapError::config(format!(
                "tile map {w}×{h}×{nz} exceeds the allocated {}×{}×{}",
                cap.width, cap.height, cap.depth
            )));
        }

        let scale = self.params.scale;
        let rc_image = rc.image_at(scale)?;
        let mut cam_data = camera_block(&frame.cam).to_vec();
        let mut textures = Vec::with_capacity(tcs.len());
        for tc in tcs {
            let image = tc.image_at(scale)?;
            cam_data.extend_from_slice(&camera_block(&tc.camera_at(scale)?));
            let buf = DeviceBuffer::from_slice(gpu, "sgm tc image", image.as_slice(), image.len(), 1, 1)?;
            textures.push((buf, image.width(), image.height()));
        }
        let rc_tex = RcTexture {
            image: DeviceBuffer::from_slice(gpu, "sgm rc image", rc_image.as_slice(), rc_image.len(), 1, 1)?,
            cams: DeviceBuffer::from_slice(gpu, "sgm cameras", &cam_data, cam_data.len(), 1, 1)?,
            width: rc_image.width(),
            height: rc_image.height(),
        };
        self.depths.upload(gpu, depths.depths(), nz, 1, 1)?;

        let base = self.frame_uniform(frame, nz, &rc_tex);
        let k = &self.kernels;

        let init = uniform_buffer(gpu, "sgm init", &SgmUniform { fill_value: TSIM_INVALID, ..base });
        let bg = k.volume_init.bind(
            gpu,
            [(0, init.as_entire_binding()), (5, self.best.binding()), (6, self.second.binding())],
        );
        k.volume_init.dispatch_grid(stream, &bg, w, h, nz);

        let uniforms: Vec<wgpu::Buffer> = textures
            .iter()
            .enumerate()
            .map(|(i, (_, tw, th))| {
                let u = SgmUniform { tc_cam: 1 + i as u32, tc_w: *tw as i32, tc_h: *th as i32, ..base };
                uniform_buffer(gpu, "sgm similarity", &u)
            })
            .collect();
        for (i, ((tex, _, _), u)) in textures.iter().zip(&uniforms).enumerate() {
            log::trace!("gpu similarity volume: tc {} over {nz} depths", tcs[i].index);
            let bg = k.compute_similarity.bind(
                gpu,
                [
                    (0, u.as_entire_binding()),
                    (1, rc_tex.image.binding()),
                    (2, tex.binding()),
                    (3, rc_tex.cams.binding()),
                    (4, self.depths.binding()),
                    (5, self.best.binding()),
                    (6, self.second.binding()),
                ],
            );
            k.compute_similarity.dispatch_grid(stream, &bg, w, h, nz);
        }
        stream.synchronize("similarity")?;

        self.uniform = base;
        self.rc = Some(rc_tex);
        Ok(())
    }

    /// Stage 2: aggregate the best volume into the second-best storage.
    pub fn optimize_similarity_volume(&mut self, stream: &mut GpuStream<'_>) -> Result<()> {
        let gpu = self.gpu;
        let base = self.uniform;
        let (w, h, nz) = (base.width as usize, base.height as usize, base.nz as usize);
        let Some(rc_tex) = self.rc.as_ref() else {
            return Err(DepthMapError::config("sgm aggregation before the similarity stage"));
        };
        if w == 0 || h == 0 || nz == 0 {
            return Ok(());
        }
        let k = &self.kernels;

        let clear = uniform_buffer(gpu, "sgm clear", &SgmUniform { fill_value: 0.0, ..base });
        let bg = k.volume_fill_second.bind(gpu, [(0, clear.as_entire_binding()), (6, self.second.binding())]);
        k.volume_fill_second.dispatch_grid(stream, &bg, w, h, nz);

        let sweeps: Vec<(wgpu::Buffer, usize)> = self
            .axes
            .iter()
            .flat_map(|&axis| [(axis, true), (axis, false)])
            .map(|(axis, forward)| {
                let (code, other) = match axis {
                    SgmAxis::X => (0, h),
                    SgmAxis::Y => (1, w),
                };
                let u = SgmUniform { axis: code, forward: forward as u32, ..base };
                (uniform_buffer(gpu, "sgm aggregate", &u), other)
            })
            .collect();
        for (u, other) in &sweeps {
            let bg = k.aggregate.bind(
                gpu,
                [
                    (0, u.as_entire_binding()),
                    (1, rc_tex.image.binding()),
                    (5, self.best.binding()),
                    (6, self.second.binding()),
                    (7, self.slices.binding()),
                ],
            );
            k.aggregate.dispatch(stream, &bg, (*other as u32, 1, 1));
        }

        // Kept alive until the checkpoint below.
        let mut scale = None;
        if !sweeps.is_empty() {
            let u = SgmUniform { scale: 1.0 / sweeps.len() as f32, ..base };
            let buf = uniform_buffer(gpu, "sgm scale", &u);
            let bg = k.volume_scale.bind(gpu, [(0, buf.as_entire_binding()), (6, self.second.binding())]);
            k.volume_scale.dispatch_grid(stream, &bg, w, h, nz);
            scale = Some(buf);
        }
        stream.synchronize("aggregation")?;
        drop(scale);
        Ok(())
    }

    /// Stage 3: depth/similarity map from the aggregated volume.
    pub fn retrieve_best_depth(&mut self, stream: &mut GpuStream<'_>) -> Result<DepthSimMap> {
        let gpu = self.gpu;
        let base = self.uniform;
        let (w, h, nz) = (base.width as usize, base.height as usize, base.nz as usize);
        if nz == 0 {
            return Ok(DepthSimMap::new_invalid(w, h));
        }
        let u = uniform_buffer(gpu, "sgm retrieve", &base);
        let k = &self.kernels.retrieve_best_depth;
        let bg = k.bind(
            gpu,
            [
                (0, u.as_entire_binding()),
                (4, self.depths.binding()),
                (5, self.best.binding()),
                (6, self.second.binding()),
                (8, self.out_depth.binding()),
                (9, self.out_sim.binding()),
            ],
        );
        k.dispatch_grid(stream, &bg, w, h, 1);
        stream.synchronize("retrieve")?;

        let depth = self.out_depth.download(gpu, w, h, 1)?;
        let sim = self.out_sim.download(gpu, w, h, 1)?;
        Ok(DepthSimMap { depth: Image::from_vec(w, h, depth), sim: Image::from_vec(w, h, sim) })
    }

    /// Download both volumes of the current tile (diagnostics and tests).
    pub fn download_volumes(&self) -> Result<(Volume<f32>, Volume<f32>)> {
        let (w, h, nz) = (self.uniform.width as usize, self.uniform.height as usize, self.uniform.nz as usize);
        let best = self.best.download(self.gpu, w, h, nz)?;
        let second = self.second.download(self.gpu, w, h, nz)?;
        Ok((Volume::from_vec(w, h, nz, best), Volume::from_vec(w, h, nz, second)))
    }

    /// Probe export of the current tile, as on the CPU engine.
    pub fn export_volume_information(&self, path: &Path, depths: &SgmDepthList) -> Result<()> {
        let (best, second) = self.download_volumes()?;
        write_volume_probes(path, &self.params.export_probes, &best, &second, depths)
    }

    fn memory_usage(&self) -> MemoryUsage {
        let mut layouts = vec![
            *self.best.layout(),
            *self.second.layout(),
            *self.slices.layout(),
            *self.depths.layout(),
            *self.out_depth.layout(),
            *self.out_sim.layout(),
        ];
        if let Some(rc) = &self.rc {
            layouts.push(*rc.image.layout());
            layouts.push(*rc.cams.layout());
        }
        MemoryUsage::sum(layouts)
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

/// Largest map a tile of `tile_params` produces at `downscale`. Unaligned
/// tile origins can straddle one extra map pixel.
pub(crate) fn max_map_size(tile_params: &TileParams, downscale: u32) -> (usize, usize) {
    let ds = downscale.max(1) as usize;
    let w = (tile_params.buffer_width.max(1) as usize).div_ceil(ds) + 1;
    let h = (tile_params.buffer_height.max(1) as usize).div_ceil(ds) + 1;
    (w, h)
}
