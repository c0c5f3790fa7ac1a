// refine/optimize.rs — Variance-guided depth smoothing.
//
// Jacobi iterations over the refined depth map. For a valid pixel p with
// valid 4-neighbors N(p) (those within one refine band of p):
//
//   data   = (c·d_refined + w_sgm·d_sgm) / (c + w_sgm)     c = (1 - sim) / 2
//   λ      = smoothness · (1 - var / (var + γ)) · (1 - decay · t / (n - 1))
//   d'(p)  = (data + λ·Σ d(q)) / (1 + λ·|N(p)|)
//
// then clamped to the refine band around the SGM depth. Textured pixels
// (high variance) follow their own data; flat ones are pulled towards
// their neighbors, less and less as the iterations progress. Invalid
// pixels are never read nor written.

use rayon::prelude::*;

use crate::convolution::{box_kernel_1d, convolve_separable};
use crate::depth_list::RefineDepthList;
use crate::image::Image;
use crate::maps::{is_valid_depth, DEPTH_INVALID};

/// Local texture variance `E[I²] - E[I]²` over a `(2·wsh+1)²` box.
pub fn compute_variance(texture: &Image<f32>, wsh: usize) -> Image<f32> {
    if texture.is_empty() {
        return Image::new(texture.width(), texture.height());
    }
    let k = box_kernel_1d(wsh);
    let mean = convolve_separable(texture, &k, &k);
    let sq = texture.map(|v| v * v);
    let mean_sq = convolve_separable(&sq, &k, &k);
    let mut var = mean_sq;
    for (v, m) in var.as_mut_slice().iter_mut().zip(mean.as_slice()) {
        *v = (*v - m * m).max(0.0);
    }
    var
}

/// Smoothing weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingParams {
    pub n_iterations: usize,
    pub variance_gamma: f32,
    pub smoothness: f32,
    pub iteration_decay: f32,
    pub sgm_prior_weight: f32,
}

impl SmoothingParams {
    /// Neighbor weight at iteration `t` for texture variance `var`.
    #[inline]
    pub fn lambda(&self, var: f32, t: usize) -> f32 {
        let edge = 1.0 - var / (var + self.variance_gamma);
        let progress = if self.n_iterations > 1 {
            t as f32 / (self.n_iterations - 1) as f32
        } else {
            0.0
        };
        self.smoothness * edge * (1.0 - self.iteration_decay * progress)
    }
}

/// Smooth `refined` in place.
///
/// `sgm_depth` is the upscaled SGM map (same size), `sim` the refined
/// similarity and `pix_size` the per-pixel footprint that sizes the band.
pub fn optimize_depth_map(
    refined: &mut Image<f32>,
    sim: &Image<f32>,
    sgm_depth: &Image<f32>,
    pix_size: &Image<f32>,
    variance: &Image<f32>,
    list: RefineDepthList,
    params: SmoothingParams,
) {
    let (w, h) = (refined.width(), refined.height());
    if w == 0 || h == 0 || params.n_iterations == 0 {
        return;
    }
    let data = data_term(refined, sim, sgm_depth, params.sgm_prior_weight);
    let mut next = refined.clone();

    for t in 0..params.n_iterations {
        let current = &*refined;
        next.as_mut_slice()
            .par_chunks_mut(w)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    let d = current.get(x, y);
                    if !is_valid_depth(d) {
                        *out = DEPTH_INVALID;
                        continue;
                    }
                    let band = list.band(pix_size.get(x, y));
                    let (sum, n) = neighbor_sum(current, x, y, d, band);
                    let lambda = params.lambda(variance.get(x, y), t);
                    let v = (data.get(x, y) + lambda * sum) / (1.0 + lambda * n as f32);
                    let center = sgm_depth.get(x, y);
                    let v = if is_valid_depth(center) { v.clamp(center - band, center + band) } else { v };
                    *out = if is_valid_depth(v) { v } else { d };
                }
            });
        std::mem::swap(refined, &mut next);
    }
}

fn data_term(refined: &Image<f32>, sim: &Image<f32>, sgm_depth: &Image<f32>, prior: f32) -> Image<f32> {
    let mut data = refined.clone();
    for (i, out) in data.as_mut_slice().iter_mut().enumerate() {
        let d = refined.as_slice()[i];
        if !is_valid_depth(d) {
            continue;
        }
        let s = sgm_depth.as_slice()[i];
        let c = ((1.0 - sim.as_slice()[i]) * 0.5).clamp(0.0, 1.0);
        let ws = if is_valid_depth(s) { prior } else { 0.0 };
        if c + ws > 0.0 {
            *out = (c * d + ws * s) / (c + ws);
        }
    }
    data
}

fn neighbor_sum(depth: &Image<f32>, x: usize, y: usize, d: f32, band: f32) -> (f32, usize) {
    let (w, h) = (depth.width() as i64, depth.height() as i64);
    let mut sum = 0.0;
    let mut n = 0;
    for (dx, dy) in [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)] {
        let (nx, ny) = (x as i64 + dx, y as i64 + dy);
        if nx < 0 || ny < 0 || nx >= w || ny >= h {
            continue;
        }
        let q = depth.get(nx as usize, ny as usize);
        if is_valid_depth(q) && (q - d).abs() <= band {
            sum += q;
            n += 1;
        }
    }
    (sum, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMOOTH: SmoothingParams = SmoothingParams {
        n_iterations: 50,
        variance_gamma: 100.0,
        smoothness: 1.0,
        iteration_decay: 0.5,
        sgm_prior_weight: 0.1,
    };

    #[test]
    fn test_variance_of_flat_and_step() {
        let flat = Image::filled(8, 8, 50.0f32);
        assert!(compute_variance(&flat, 1).as_slice().iter().all(|&v| v.abs() < 1e-3));

        let mut step = Image::filled(8, 8, 0.0f32);
        for y in 0..8 {
            for x in 4..8 {
                step.set(x, y, 90.0);
            }
        }
        let var = compute_variance(&step, 1);
        assert!(var.get(4, 4) > 1000.0);
        assert!(var.get(0, 4) < 1e-3);
    }

    #[test]
    fn test_lambda_decays_with_variance_and_iterations() {
        assert_eq!(SMOOTH.lambda(0.0, 0), 1.0);
        assert!((SMOOTH.lambda(100.0, 0) - 0.5).abs() < 1e-6);
        assert!((SMOOTH.lambda(0.0, 49) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_smoothing_reduces_noise_within_band() {
        let (w, h) = (16, 16);
        let mut refined = Image::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let noise = if (x + y) % 2 == 0 { 0.01 } else { -0.01 };
                refined.set(x, y, 2.0 + noise);
            }
        }
        let sgm = Image::filled(w, h, 2.0f32);
        let sim = Image::filled(w, h, -0.8f32);
        let pix = Image::filled(w, h, 0.01f32);
        let var = Image::new(w, h);
        let list = RefineDepthList::new(2, 1.0);

        let before = deviation(&refined);
        optimize_depth_map(&mut refined, &sim, &sgm, &pix, &var, list, SMOOTH);
        let after = deviation(&refined);
        assert!(after < 0.5 * before, "{after} vs {before}");
        assert!(refined.as_slice().iter().all(|&d| (d - 2.0).abs() <= 0.02 + 1e-6));
    }

    #[test]
    fn test_invalid_pixels_are_untouched() {
        let mut refined = Image::filled(4, 4, 3.0f32);
        refined.set(1, 1, DEPTH_INVALID);
        let sgm = refined.clone();
        let sim = Image::filled(4, 4, -1.0f32);
        let pix = Image::filled(4, 4, 0.1f32);
        let var = Image::new(4, 4);
        optimize_depth_map(&mut refined, &sim, &sgm, &pix, &var, RefineDepthList::new(1, 1.0), SMOOTH);
        assert_eq!(refined.get(1, 1), DEPTH_INVALID);
        assert!((refined.get(0, 0) - 3.0).abs() < 1e-5);
    }

    fn deviation(img: &Image<f32>) -> f32 {
        img.as_slice().iter().map(|d| (d - 2.0).abs()).sum::<f32>() / img.len() as f32
    }
}
