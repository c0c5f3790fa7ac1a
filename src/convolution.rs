// convolution.rs — Separable 1D filtering for host images.
//
// Two users in the crate:
//   pyramid.rs  — Gaussian pre-blur before each decimation step.
//   refine      — box-filtered E[I] and E[I²] for the local variance field.
//
// Border handling is clamp-to-edge: a tap that falls outside the image
// reads the nearest edge pixel. The GPU variance kernel clamps the same
// way, so CPU and GPU agree on the border rows.
//
// A 2D separable kernel K = k_col · k_rowᵀ is applied as a row pass
// followed by a column pass, O(2k) instead of O(k²) per pixel.

use rayon::prelude::*;

use crate::image::{Image, Pixel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Rows,
    Cols,
}

fn check_kernel(kernel: &[f32]) {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());
}

fn convolve_axis<T: Pixel>(src: &Image<T>, kernel: &[f32], axis: Axis) -> Image<f32> {
    check_kernel(kernel);
    let w = src.width();
    let h = src.height();
    let mut dst = Image::<f32>::new(w, h);
    if w == 0 || h == 0 {
        return dst;
    }
    let half = kernel.len() as isize / 2;

    dst.as_mut_slice()
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, out_row)| {
            for (x, out) in out_row.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for (ki, &kv) in kernel.iter().enumerate() {
                    let off = ki as isize - half;
                    let (sx, sy) = match axis {
                        Axis::Rows => ((x as isize + off).clamp(0, w as isize - 1) as usize, y),
                        Axis::Cols => (x, (y as isize + off).clamp(0, h as isize - 1) as usize),
                    };
                    // SAFETY: both coordinates are clamped into the image.
                    acc += unsafe { src.get_unchecked(sx, sy) }.to_f32() * kv;
                }
                *out = acc;
            }
        });
    dst
}

/// Horizontal pass.
pub fn convolve_rows<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Image<f32> {
    convolve_axis(src, kernel, Axis::Rows)
}

/// Vertical pass.
pub fn convolve_cols(src: &Image<f32>, kernel: &[f32]) -> Image<f32> {
    convolve_axis(src, kernel, Axis::Cols)
}

/// Row pass then column pass.
///
/// # Panics
/// Panics if either kernel is empty or has even length.
pub fn convolve_separable<T: Pixel>(
    src: &Image<T>,
    kernel_row: &[f32],
    kernel_col: &[f32],
) -> Image<f32> {
    let intermediate = convolve_rows(src, kernel_row);
    convolve_cols(&intermediate, kernel_col)
}

/// Normalized Gaussian of length `2 * half_size + 1`.
///
/// ```
/// let k = depthmap::convolution::gaussian_kernel_1d(2, 1.0);
/// assert_eq!(k.len(), 5);
/// assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive");
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..2 * half_size + 1)
        .map(|i| {
            let x = i as f32 - half_size as f32;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|v| *v /= sum);
    kernel
}

/// Uniform averaging kernel of length `2 * half_size + 1`.
pub fn box_kernel_1d(half_size: usize) -> Vec<f32> {
    let len = 2 * half_size + 1;
    vec![1.0 / len as f32; len]
}
