// volume.rs — Dense host 3D arrays (similarity volumes).
//
// Layout is plane-major: depth index z is the slowest axis, so each
// depth hypothesis is one contiguous width×height plane.
//
//   index(x, y, z) = (z · height + y) · width + x
//
// The device-side pitched volume (gpu/buffer.rs) uses the same order with
// rows padded to the copy alignment.

use crate::image::{Element, Image};

/// Cost of a voxel with no valid sample.
pub const TSIM_INVALID: f32 = 255.0;
/// Largest valid cost.
pub const TSIM_MAX: f32 = 254.0;

#[derive(Debug, Clone)]
pub struct Volume<T: Element> {
    data: Vec<T>,
    width: usize,
    height: usize,
    depth: usize,
}

impl<T: Element> Volume<T> {
    pub fn filled(width: usize, height: usize, depth: usize, value: T) -> Self {
        Volume {
            data: vec![value; width * height * depth],
            width,
            height,
            depth,
        }
    }

    /// Wrap a dense plane-major buffer of `width · height · depth` elements.
    pub fn from_vec(width: usize, height: usize, depth: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), width * height * depth, "volume data size mismatch");
        Volume { data, width, height, depth }
    }

    /// Reshape in place, reusing the allocation, and fill with `value`.
    pub fn reset(&mut self, width: usize, height: usize, depth: usize, value: T) {
        self.width = width;
        self.height = height;
        self.depth = depth;
        self.data.clear();
        self.data.resize(width * height * depth, value);
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn plane_len(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(x < self.width && y < self.height && z < self.depth,
            "voxel ({x},{y},{z}) out of bounds for {}×{}×{}", self.width, self.height, self.depth);
        (z * self.height + y) * self.width + x
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> T {
        self.data[self.index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: T) {
        let i = self.index(x, y, z);
        self.data[i] = value;
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize, z: usize) -> &mut T {
        let i = self.index(x, y, z);
        &mut self.data[i]
    }

    /// One depth plane.
    pub fn plane(&self, z: usize) -> &[T] {
        let n = self.plane_len();
        &self.data[z * n..(z + 1) * n]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Copy of depth plane `z` as an image.
    pub fn plane_image(&self, z: usize) -> Image<T> {
        Image::from_vec(self.width, self.height, self.plane(z).to_vec())
    }

    /// Memory held by the buffer.
    pub fn bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<T>()
    }
}
