// gpu/buffer.rs — Pitched device buffers with single ownership.
//
// Every 2D/3D array on the device is a storage buffer whose rows are
// padded to the 256-byte copy alignment:
//
//   pitch (bytes) = align_to(width · size_of::<T>(), 256)
//   element (x, y, z) at byte  (z · height + y) · pitch + x · size_of::<T>()
//
// so a plane-major host `Volume` maps row for row onto the device. Buffers
// are allocated once for the largest tile; smaller tiles use the top-left
// sub-region and pass their logical size to the kernels.
//
// `DeviceBuffer<T>` owns its allocation. Transfers are explicit
// (`upload`, `download`); dropping it destroys the device memory on every
// exit path, including `?` early returns.

use std::marker::PhantomData;

use bytemuck::Pod;

use crate::gpu::device::{GpuDevice, GpuError};

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Round `value` up to a multiple of `alignment`.
///
///   align_to(100, 256) = 256
///   align_to(256, 256) = 256
///   align_to(640, 256) = 768
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Byte layout of a pitched `width × height × depth` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchedLayout {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub elem_size: usize,
    /// Row stride in bytes.
    pub pitch: usize,
}

impl PitchedLayout {
    pub fn new(width: usize, height: usize, depth: usize, elem_size: usize) -> Self {
        let row = (width * elem_size) as u32;
        PitchedLayout {
            width,
            height,
            depth,
            elem_size,
            pitch: align_to(row.max(1), COPY_ALIGNMENT) as usize,
        }
    }

    /// Row stride in elements.
    pub fn pitch_elems(&self) -> usize {
        self.pitch / self.elem_size.max(1)
    }

    pub fn padded_bytes(&self) -> u64 {
        (self.pitch * self.height * self.depth) as u64
    }

    pub fn unpadded_bytes(&self) -> u64 {
        (self.width * self.elem_size * self.height * self.depth) as u64
    }
}

/// Memory of a set of buffers, with and without row padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub padded_bytes: u64,
    pub unpadded_bytes: u64,
}

impl MemoryUsage {
    pub fn sum(layouts: impl IntoIterator<Item = PitchedLayout>) -> Self {
        layouts.into_iter().fold(MemoryUsage::default(), |acc, l| MemoryUsage {
            padded_bytes: acc.padded_bytes + l.padded_bytes(),
            unpadded_bytes: acc.unpadded_bytes + l.unpadded_bytes(),
        })
    }

    pub fn padded_mib(&self) -> f64 {
        self.padded_bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn unpadded_mib(&self) -> f64 {
        self.unpadded_bytes as f64 / (1024.0 * 1024.0)
    }
}

impl std::ops::Add for MemoryUsage {
    type Output = MemoryUsage;

    fn add(self, rhs: MemoryUsage) -> MemoryUsage {
        MemoryUsage {
            padded_bytes: self.padded_bytes + rhs.padded_bytes,
            unpadded_bytes: self.unpadded_bytes + rhs.unpadded_bytes,
        }
    }
}

/// A pitched storage buffer holding `T` elements.
pub struct DeviceBuffer<T: Pod> {
    buffer: wgpu::Buffer,
    layout: PitchedLayout,
    label: String,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceBuffer<T> {
    /// Allocate an uninitialized (zeroed by wgpu) buffer.
    ///
    /// Allocation failures are caught with an out-of-memory error scope
    /// and returned instead of poisoning the device.
    pub fn new(gpu: &GpuDevice, label: &str, width: usize, height: usize, depth: usize) -> Result<Self, GpuError> {
        let layout = PitchedLayout::new(width, height, depth, std::mem::size_of::<T>());
        let bytes = layout.padded_bytes().max(COPY_ALIGNMENT as u64);
        if bytes > gpu.max_binding_size() {
            return Err(GpuError::BufferTooLarge {
                label: label.to_string(),
                bytes,
                max: gpu.max_binding_size(),
            });
        }

        gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(gpu.device.pop_error_scope()) {
            return Err(GpuError::Allocation {
                label: label.to_string(),
                bytes,
                reason: err.to_string(),
            });
        }
        log::trace!("allocated '{label}': {width}×{height}×{depth}, {bytes} bytes");

        Ok(DeviceBuffer {
            buffer,
            layout,
            label: label.to_string(),
            _marker: PhantomData,
        })
    }

    /// Buffer with the contents of `data` (dense, `width · height · depth`).
    pub fn from_slice(
        gpu: &GpuDevice,
        label: &str,
        data: &[T],
        width: usize,
        height: usize,
        depth: usize,
    ) -> Result<Self, GpuError> {
        let buf = Self::new(gpu, label, width, height, depth)?;
        buf.upload(gpu, data, width, height, depth)?;
        Ok(buf)
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn layout(&self) -> &PitchedLayout {
        &self.layout
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Row stride in elements, as the kernels index it.
    pub fn pitch(&self) -> u32 {
        self.layout.pitch_elems() as u32
    }

    /// Allocated rows per plane.
    pub fn rows(&self) -> u32 {
        self.layout.height as u32
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }

    fn check_region(&self, width: usize, height: usize, depth: usize) -> Result<(), GpuError> {
        if width > self.layout.width || height > self.layout.height || depth > self.layout.depth {
            return Err(GpuError::TransferSize {
                label: self.label.clone(),
                expected: self.layout.width * self.layout.height * self.layout.depth,
                actual: width * height * depth,
            });
        }
        Ok(())
    }

    /// Write a dense `width × height × depth` block into the top-left
    /// sub-region. The write is queued and ordered before any later submit.
    pub fn upload(&self, gpu: &GpuDevice, data: &[T], width: usize, height: usize, depth: usize) -> Result<(), GpuError> {
        self.check_region(width, height, depth)?;
        if data.len() != width * height * depth {
            return Err(GpuError::TransferSize {
                label: self.label.clone(),
                expected: width * height * depth,
                actual: data.len(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let pitch = self.layout.pitch;
        let row_bytes = width * std::mem::size_of::<T>();
        let plane_stride = (pitch * self.layout.height) as u64;

        // One staging block per plane: `height` pitched rows.
        let mut staging = vec![0u8; pitch * height];
        for z in 0..depth {
            for y in 0..height {
                let src = &data[(z * height + y) * width..(z * height + y + 1) * width];
                staging[y * pitch..y * pitch + row_bytes].copy_from_slice(bytemuck::cast_slice(src));
            }
            gpu.queue.write_buffer(&self.buffer, z as u64 * plane_stride, &staging);
        }
        Ok(())
    }

    /// Overwrite the whole allocation with `value`.
    pub fn fill(&self, gpu: &GpuDevice, value: T) -> Result<(), GpuError> {
        let l = self.layout;
        let data = vec![value; l.width * l.height * l.depth];
        self.upload(gpu, &data, l.width, l.height, l.depth)
    }

    /// Read back the top-left `width × height × depth` block, densely packed.
    ///
    /// **Synchronous**: submits a copy and waits for the device.
    pub fn download(&self, gpu: &GpuDevice, width: usize, height: usize, depth: usize) -> Result<Vec<T>, GpuError> {
        self.check_region(width, height, depth)?;
        if width * height * depth == 0 {
            return Ok(Vec::new());
        }
        let pitch = self.layout.pitch;
        let plane_stride = pitch * self.layout.height;
        let size = (plane_stride * (depth - 1) + pitch * height) as u64;

        let readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("DeviceBuffer::readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("DeviceBuffer::download") });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &readback, 0, size);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            // The receiver outlives the poll below; a failed send only
            // means the caller already gave up.
            let _ = tx.send(r);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(r) => r?,
            Err(_) => {
                return Err(GpuError::Kernel {
                    stage: format!("download '{}'", self.label),
                    message: "map callback never fired".to_string(),
                })
            }
        }

        let row_bytes = width * std::mem::size_of::<T>();
        let mut out = Vec::with_capacity(width * height * depth);
        {
            let mapped = slice.get_mapped_range();
            for z in 0..depth {
                for y in 0..height {
                    let start = z * plane_stride + y * pitch;
                    out.extend(
                        mapped[start..start + row_bytes]
                            .chunks_exact(std::mem::size_of::<T>())
                            .map(bytemuck::pod_read_unaligned::<T>),
                    );
                }
            }
        }
        readback.unmap();
        readback.destroy();
        Ok(out)
    }
}

impl<T: Pod> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

/// Small uniform block, rounded up to 16 bytes.
pub(crate) fn uniform_buffer<U: Pod>(gpu: &GpuDevice, label: &str, value: &U) -> wgpu::Buffer {
    use wgpu::util::DeviceExt;
    gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::bytes_of(value),
        usage: wgpu::BufferUsages::UNIFORM,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(100, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(640, 256), 768);
    }

    #[test]
    fn test_pitched_layout_bytes() {
        let l = PitchedLayout::new(100, 10, 3, 4);
        assert_eq!(l.pitch, 512);
        assert_eq!(l.pitch_elems(), 128);
        assert_eq!(l.padded_bytes(), 512 * 10 * 3);
        assert_eq!(l.unpadded_bytes(), 400 * 10 * 3);
    }

    #[test]
    fn test_memory_usage_sum() {
        let m = MemoryUsage::sum([PitchedLayout::new(64, 1, 1, 4), PitchedLayout::new(64, 2, 1, 4)]);
        assert_eq!(m.padded_bytes, 256 * 3);
        assert_eq!(m.unpadded_bytes, 256 * 3);
        let big = MemoryUsage { padded_bytes: 2 << 20, unpadded_bytes: 1 << 20 };
        assert_eq!(big.padded_mib(), 2.0);
        assert_eq!((m + big).unpadded_bytes, (1 << 20) + 768);
    }

    // ---- GPU round trip (subprocess isolation, see gpu::device) ----------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_device_buffer_roundtrip() {
        let gpu = GpuDevice::new().unwrap();
        let (w, h, d) = (37, 5, 3);
        let data: Vec<f32> = (0..w * h * d).map(|i| i as f32 * 0.5).collect();
        let buf = DeviceBuffer::<f32>::new(&gpu, "roundtrip", 64, 8, 4).unwrap();
        buf.upload(&gpu, &data, w, h, d).unwrap();
        let back = buf.download(&gpu, w, h, d).unwrap();
        assert_eq!(back, data);
        assert!(buf.upload(&gpu, &data, 65, h, d).is_err());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_device_buffer_roundtrip() {
        let out = crate::gpu::device::tests::run_gpu_test_in_subprocess(
            "gpu::buffer::tests::inner_device_buffer_roundtrip",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
