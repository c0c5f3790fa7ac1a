// gpu/stream.rs — In-order command stream with error checkpoints.
//
// One stream per reference camera. Kernel dispatches are recorded into a
// single command encoder, one compute pass each, so they execute in
// recording order; a later kernel always sees the writes of an earlier
// one. Nothing reaches the device until `synchronize`:
//
//   dispatch(similarity) ─┐
//   dispatch(similarity)  │ recorded
//   dispatch(aggregate)  ─┘
//   synchronize("sgm")      submit → wait → pop error scopes
//
// Validation and out-of-memory errors raised while recording or executing
// are captured by error scopes opened when the stream starts (and
// re-opened after every checkpoint) and surface as `GpuError::Kernel`
// naming the stage. Error scopes are device-wide in wgpu, so streams that
// share a device must not checkpoint concurrently.

use crate::gpu::device::{GpuDevice, GpuError};

pub struct GpuStream<'a> {
    gpu: &'a GpuDevice,
    label: String,
    encoder: Option<wgpu::CommandEncoder>,
    dispatches: usize,
}

impl<'a> GpuStream<'a> {
    pub fn new(gpu: &'a GpuDevice, label: impl Into<String>) -> Self {
        let label = label.into();
        push_scopes(gpu);
        GpuStream { gpu, label, encoder: None, dispatches: 0 }
    }

    pub fn gpu(&self) -> &'a GpuDevice {
        self.gpu
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Recorded dispatches not yet submitted.
    pub fn pending(&self) -> usize {
        self.dispatches
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let gpu = self.gpu;
        let label = &self.label;
        self.encoder.get_or_insert_with(|| {
            gpu.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
        })
    }

    /// Record one kernel launch over a `wg_x × wg_y × wg_z` grid of
    /// workgroups.
    pub fn dispatch(
        &mut self,
        name: &str,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        workgroups: (u32, u32, u32),
    ) {
        let (x, y, z) = workgroups;
        if x == 0 || y == 0 || z == 0 {
            return;
        }
        let encoder = self.encoder();
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(name),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(x, y, z);
        drop(pass);
        self.dispatches += 1;
    }

    /// Record a device-side buffer copy.
    pub fn copy_buffer(&mut self, src: &wgpu::Buffer, dst: &wgpu::Buffer, size: u64) {
        self.encoder().copy_buffer_to_buffer(src, 0, dst, 0, size);
    }

    /// Submit everything recorded, wait for completion and report any
    /// error raised since the previous checkpoint.
    pub fn synchronize(&mut self, stage: &str) -> Result<(), GpuError> {
        if let Some(encoder) = self.encoder.take() {
            self.gpu.queue.submit(std::iter::once(encoder.finish()));
        }
        self.gpu.device.poll(wgpu::Maintain::Wait);
        log::trace!("{}: {stage} checkpoint after {} dispatches", self.label, self.dispatches);
        self.dispatches = 0;

        let result = pop_scopes(self.gpu);
        push_scopes(self.gpu);
        result.map_err(|message| GpuError::Kernel {
            stage: format!("{} / {stage}", self.label),
            message,
        })
    }
}

impl Drop for GpuStream<'_> {
    fn drop(&mut self) {
        // Unsubmitted work is discarded; close the scopes opened for it.
        self.encoder = None;
        if let Err(message) = pop_scopes(self.gpu) {
            log::warn!("{}: error discarded on drop: {message}", self.label);
        }
    }
}

fn push_scopes(gpu: &GpuDevice) {
    gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
}

/// Pop in reverse push order; the first error wins.
fn pop_scopes(gpu: &GpuDevice) -> Result<(), String> {
    let validation = pollster::block_on(gpu.device.pop_error_scope());
    let oom = pollster::block_on(gpu.device.pop_error_scope());
    match (validation, oom) {
        (Some(e), _) | (None, Some(e)) => Err(e.to_string()),
        (None, None) => Ok(()),
    }
}
