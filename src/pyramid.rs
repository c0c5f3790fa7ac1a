// pyramid.rs — Gaussian image pyramid for camera textures.
//
// Each reference/neighbor camera keeps one pyramid. The SGM and refine
// stages pick the level matching their `scale` parameter:
//
//   level 0  downscale 1   full resolution
//   level 1  downscale 2
//   level 2  downscale 4   ...
//
// Algorithm at each level: Gaussian blur, then keep every other pixel.
// Level pixel (x, y) therefore sits at full-resolution pixel
// (x·2ⁿ, y·2ⁿ), which is the same convention the camera rescaling uses
// (pixel coordinates divided by the downscale factor).

use crate::convolution::{convolve_separable, gaussian_kernel_1d};
use crate::error::{DepthMapError, Result};
use crate::image::{to_f32_image, Image, Pixel};

/// Blur sigma applied before every 2× decimation.
pub const PYRAMID_SIGMA: f32 = 1.0;

/// A Gaussian image pyramid, finest level first.
#[derive(Debug, Clone)]
pub struct Pyramid {
    pub levels: Vec<Image<f32>>,
}

impl Pyramid {
    /// Build `num_levels` levels from `src`.
    ///
    /// # Panics
    /// Panics if `num_levels == 0`.
    pub fn build<T: Pixel>(src: &Image<T>, num_levels: usize, sigma: f32) -> Self {
        assert!(num_levels >= 1, "pyramid must have at least 1 level");

        let half_size = (3.0 * sigma).ceil().max(1.0) as usize;
        let kernel = gaussian_kernel_1d(half_size, sigma);

        let mut levels = Vec::with_capacity(num_levels);
        let mut current = to_f32_image(src);
        for _ in 1..num_levels {
            let blurred = convolve_separable(&current, &kernel, &kernel);
            let next = downsample_2x(&blurred);
            levels.push(std::mem::replace(&mut current, next));
        }
        levels.push(current);

        Pyramid { levels }
    }

    /// Enough levels to serve every downscale up to `max_downscale`.
    pub fn build_for_downscale<T: Pixel>(src: &Image<T>, max_downscale: u32) -> Result<Self> {
        let levels = level_for_downscale(max_downscale)? + 1;
        Ok(Self::build(src, levels, PYRAMID_SIGMA))
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &Image<f32> {
        &self.levels[level]
    }

    /// The level whose resolution is `1 / downscale` of level 0.
    pub fn at_downscale(&self, downscale: u32) -> Result<&Image<f32>> {
        let level = level_for_downscale(downscale)?;
        self.levels.get(level).ok_or_else(|| {
            DepthMapError::config(format!(
                "downscale {downscale} needs pyramid level {level}, only {} built",
                self.levels.len()
            ))
        })
    }
}

/// log2 of a power-of-two downscale factor.
pub fn level_for_downscale(downscale: u32) -> Result<usize> {
    if downscale == 0 || !downscale.is_power_of_two() {
        return Err(DepthMapError::config(format!(
            "image downscale must be a power of two, got {downscale}"
        )));
    }
    Ok(downscale.trailing_zeros() as usize)
}

/// `dst(x, y) = src(2x, 2y)`; odd dimensions drop the last row/column.
fn downsample_2x(src: &Image<f32>) -> Image<f32> {
    let new_w = (src.width() / 2).max(1);
    let new_h = (src.height() / 2).max(1);
    let mut dst = Image::new(new_w, new_h);
    for y in 0..new_h {
        for x in 0..new_w {
            let sx = (x * 2).min(src.width() - 1);
            let sy = (y * 2).min(src.height() - 1);
            // SAFETY: sx < width and sy < height by the min above.
            unsafe { dst.set_unchecked(x, y, src.get_unchecked(sx, sy)) };
        }
    }
    dst
}
