// image.rs — Runtime-sized host image container.
//
// Every 2D buffer in the crate is an `Image<T>`:
//
//   ┌──────────────────────┬────────────────────────────────────────┐
//   │  Image<f32>          │  grayscale textures, depth, sim, var   │
//   │  Image<[f32; 3]>     │  normal maps                           │
//   │  Image<u8>, <u16>    │  decoded input frames before pyramid   │
//   └──────────────────────┴────────────────────────────────────────┘
//
// Host images are dense (row length == width). Pitched, alignment-padded
// storage only exists on the device side (see gpu/buffer.rs); upload and
// download convert between the two layouts.
//
// Two traits:
//   Element — anything storable (Copy + Default + thread-safe).
//   Pixel   — scalar element types that convert to/from f32, used by the
//             convolution and pyramid code.

use std::fmt;

/// Types that can be stored in an `Image`.
pub trait Element: Copy + Default + Send + Sync + 'static {}

impl<T: Copy + Default + Send + Sync + 'static> Element for T {}

/// Scalar pixel types with an f32 conversion.
pub trait Pixel: Element + PartialOrd {
    /// Raw conversion to f32 (not normalized to [0,1]).
    fn to_f32(self) -> f32;

    /// Construct from f32 with clamping/rounding where needed.
    fn from_f32(v: f32) -> Self;
}

impl Pixel for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 255.0).round() as u8
    }
}

impl Pixel for u16 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 65535.0).round() as u16
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A dense row-major 2D buffer. Pixel (x, y) lives at `y * width + x`.
pub struct Image<T: Element> {
    data: Vec<T>,
    width: usize,
    height: usize,
}

impl<T: Element> Clone for Image<T> {
    fn clone(&self) -> Self {
        Image {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
        }
    }
}

impl<T: Element> Image<T> {
    /// Default-initialized image (0 / 0.0 / [0.0; 3]).
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, T::default())
    }

    /// Image with every pixel set to `value`.
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Image {
            data: vec![value; width * height],
            width,
            height,
        }
    }

    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height }
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
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    /// # Safety
    /// Caller must guarantee x < width and y < height.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self, x: usize, y: usize) -> T {
        debug_assert!(x < self.width && y < self.height,
            "get_unchecked({x},{y}) out of bounds for {}x{}", self.width, self.height);
        *self.data.get_unchecked(y * self.width + x)
    }

    /// # Safety
    /// Caller must guarantee x < width and y < height.
    #[inline(always)]
    pub unsafe fn set_unchecked(&mut self, x: usize, y: usize, value: T) {
        debug_assert!(x < self.width && y < self.height);
        *self.data.get_unchecked_mut(y * self.width + x) = value;
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.width + x;
        &mut self.data[idx]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        *self.get_mut(x, y) = value;
    }

    /// Signed lookup returning `None` outside the image.
    #[inline]
    pub fn try_get(&self, x: i64, y: i64) -> Option<T> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(self.data[y as usize * self.width + x as usize])
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &mut self.data[start..start + self.width]
    }

    /// Iterate over all pixels as `(x, y, value)`.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        let w = self.width;
        self.data
            .iter()
            .enumerate()
            .map(move |(i, &v)| (i % w.max(1), i / w.max(1), v))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Copy the rectangle `[x, x+w) × [y, y+h)` into a new image.
    ///
    /// # Panics
    /// Panics if the rectangle extends beyond the image.
    pub fn crop(&self, x: usize, y: usize, w: usize, h: usize) -> Image<T> {
        assert!(
            x + w <= self.width && y + h <= self.height,
            "crop region ({x},{y},{w},{h}) exceeds image bounds ({},{})",
            self.width,
            self.height,
        );
        let mut data = Vec::with_capacity(w * h);
        for yy in y..y + h {
            let start = yy * self.width + x;
            data.extend_from_slice(&self.data[start..start + w]);
        }
        Image::from_vec(w, h, data)
    }

    /// Apply `f` to every pixel, producing a new image.
    pub fn map<U: Element>(&self, f: impl Fn(T) -> U) -> Image<U> {
        Image {
            data: self.data.iter().map(|&v| f(v)).collect(),
            width: self.width,
            height: self.height,
        }
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

impl<T: Element + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}×{} }}",
            std::any::type_name::<T>(),
            self.width,
            self.height,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl<T: Element> std::ops::Index<(usize, usize)> for Image<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &T {
        self.bounds_check(x, y);
        &self.data[y * self.width + x]
    }
}

impl<T: Element> std::ops::IndexMut<(usize, usize)> for Image<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.width + x;
        &mut self.data[idx]
    }
}

// ---------------------------------------------------------------------------
// Conversion & sampling
// ---------------------------------------------------------------------------

/// Convert any scalar image to f32, preserving raw values.
pub fn to_f32_image<T: Pixel>(src: &Image<T>) -> Image<f32> {
    src.map(|v| v.to_f32())
}

/// Bilinear interpolation with clamp-to-edge addressing.
///
/// # Panics
/// Panics if the image is empty.
pub fn interpolate_bilinear(img: &Image<f32>, x: f32, y: f32) -> f32 {
    assert!(img.width() > 0 && img.height() > 0, "cannot interpolate on an empty image");

    let max_x = (img.width() - 1) as f32;
    let max_y = (img.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    // SAFETY: coordinates were clamped to [0, w-1] × [0, h-1].
    unsafe { interpolate_bilinear_unchecked(img, x, y) }
}

/// Bilinear sample that refuses coordinates outside `[0, w-1] × [0, h-1]`.
///
/// Used by the matching cost: a projection that falls off the neighbor
/// image must not be silently clamped to the border.
#[inline]
pub fn sample_bilinear(img: &Image<f32>, x: f32, y: f32) -> Option<f32> {
    if !(x >= 0.0 && y >= 0.0) {
        return None;
    }
    if x > (img.width() as f32 - 1.0) || y > (img.height() as f32 - 1.0) {
        return None;
    }
    // SAFETY: range checked above (NaN fails the first comparison).
    Some(unsafe { interpolate_bilinear_unchecked(img, x, y) })
}

/// # Safety
/// Caller must guarantee a non-empty image, x in [0, width-1] and
/// y in [0, height-1].
#[inline(always)]
pub unsafe fn interpolate_bilinear_unchecked(img: &Image<f32>, x: f32, y: f32) -> f32 {
    let x0 = x as usize;
    let y0 = y as usize;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let w = img.width();
    let x1 = if x0 + 1 < w { x0 + 1 } else { x0 };
    let h = img.height();
    let y1 = if y0 + 1 < h { y0 + 1 } else { y0 };

    let p00 = img.get_unchecked(x0, y0);
    let p10 = img.get_unchecked(x1, y0);
    let p01 = img.get_unchecked(x0, y1);
    let p11 = img.get_unchecked(x1, y1);

    (1.0 - fx) * (1.0 - fy) * p00
        + fx * (1.0 - fy) * p10
        + (1.0 - fx) * fy * p01
        + fx * fy * p11
}
