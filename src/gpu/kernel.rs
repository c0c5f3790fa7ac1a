// gpu/kernel.rs — Compute pipelines built from the WGSL templates.
//
// Each engine compiles one shader module (common.wgsl prepended to its own
// source, workgroup size baked in) and creates one pipeline per entry
// point. Pipelines use automatic layouts: the bind group of a kernel lists
// exactly the bindings its entry point reads or writes.

use crate::gpu::device::GpuDevice;
use crate::gpu::stream::GpuStream;

pub(crate) const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");

/// Compile `sources`, concatenated in order, as one specialized module.
pub fn load_module(gpu: &GpuDevice, label: &str, sources: &[&str]) -> wgpu::ShaderModule {
    let source = gpu.workgroup_size.specialize(&sources.concat());
    gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

/// One entry point of a shader module.
pub struct ComputeKernel {
    name: &'static str,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

impl ComputeKernel {
    pub fn new(gpu: &GpuDevice, module: &wgpu::ShaderModule, entry_point: &'static str) -> Self {
        let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: None,
            module,
            entry_point,
            compilation_options: Default::default(),
            cache: None,
        });
        let layout = pipeline.get_bind_group_layout(0);
        ComputeKernel { name: entry_point, pipeline, layout }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bind group from `(binding, resource)` pairs.
    pub fn bind<'a>(
        &self,
        gpu: &GpuDevice,
        entries: impl IntoIterator<Item = (u32, wgpu::BindingResource<'a>)>,
    ) -> wgpu::BindGroup {
        let entries: Vec<wgpu::BindGroupEntry<'a>> = entries
            .into_iter()
            .map(|(binding, resource)| wgpu::BindGroupEntry { binding, resource })
            .collect();
        gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.name),
            layout: &self.layout,
            entries: &entries,
        })
    }

    /// Record a launch over `workgroups` on `stream`.
    pub fn dispatch(&self, stream: &mut GpuStream<'_>, bind_group: &wgpu::BindGroup, workgroups: (u32, u32, u32)) {
        stream.dispatch(self.name, &self.pipeline, bind_group, workgroups);
    }

    /// Record a launch covering a `w × h × d` grid of invocations, one
    /// workgroup layer per `d`.
    pub fn dispatch_grid(
        &self,
        stream: &mut GpuStream<'_>,
        bind_group: &wgpu::BindGroup,
        w: usize,
        h: usize,
        d: usize,
    ) {
        let (gx, gy) = stream.gpu().dispatch_size(w as u32, h as u32);
        self.dispatch(stream, bind_group, (gx, gy, d as u32));
    }
}

/// Camera blocks as the kernels read them: per camera, P (3×4 row-major),
/// iCam (3×3 row-major) and the center, 24 floats in total.
pub fn camera_block(cam: &crate::camera::CameraParams) -> [f32; 24] {
    let p = cam.projection();
    let icam = cam.inverse_camera();
    let mut out = [0.0f32; 24];
    for r in 0..3 {
        for c in 0..4 {
            out[r * 4 + c] = p[(r, c)] as f32;
        }
        for c in 0..3 {
            out[12 + r * 3 + c] = icam[(r, c)] as f32;
        }
        out[21 + r] = cam.c[r] as f32;
    }
    out
}
