// gpu/mod.rs — GPU acceleration layer.
//
// wgpu compute kernels that mirror the CPU engines in sgm/ and refine/.
// The CPU implementations remain the authoritative reference; every GPU
// stage is validated against them within floating-point tolerance.
//
//   device   adapter selection, limits, workgroup size, error type
//   buffer   pitched device buffers (single ownership) and memory sizing
//   stream   in-order command recording with error checkpoints
//   kernel   shader module loading and compute pipelines
//   sgm      similarity volumes, aggregation, best-depth retrieval
//   refine   upscale, narrow-band sweep, smoothing
//
// The host keeps tiling, neighbor selection, normals and file I/O.

pub mod buffer;
pub mod device;
pub mod kernel;
pub mod refine;
pub mod sgm;
pub mod stream;

pub use device::{DeviceProfile, GpuDevice, GpuError, WorkgroupSize};
pub use refine::GpuRefine;
pub use sgm::GpuSgm;
pub use stream::GpuStream;
