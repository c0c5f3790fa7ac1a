// sgm/optimize.rs — Semi-global path aggregation.
//
// Each configured axis is swept in both directions. Along a sweep the
// volume is visited one slice at a time (a column for axis X, a row for
// axis Y); a slice holds `other_len × nb_depths` costs.
//
//   L(s, i, z) = C(s, i, z)
//              + min( L(s-1, i, z),
//                     L(s-1, i, z±1) + P1,
//                     min_k L(s-1, i, k) + P2 )
//              - min_k L(s-1, i, k)
//
//   P2 = max(P1, p2_weighting / (1 + |I(s, i) - I(s-1, i)|))
//
// Only the previous and the current slice are alive: two slice
// accumulators swap roles every step and one axis buffer holds
// min_k L(s-1, i, k). The aggregated volume is the mean over all paths.

use rayon::prelude::*;

use crate::image::Image;
use crate::sgm::params::SgmAxis;
use crate::volume::Volume;

/// Reusable aggregation state, sized for the largest tile.
#[derive(Debug, Clone, Default)]
pub struct SgmAccumulators {
    /// Previous slice, `nb_depths` wide and `other_len` tall.
    pub slice_a: Vec<f32>,
    /// Current slice.
    pub slice_b: Vec<f32>,
    /// Per-lane minimum of the previous slice.
    pub axis_acc: Vec<f32>,
}

impl SgmAccumulators {
    fn ensure(&mut self, other_len: usize, nb_depths: usize) {
        let n = other_len * nb_depths;
        if self.slice_a.len() < n {
            self.slice_a.resize(n, 0.0);
            self.slice_b.resize(n, 0.0);
        }
        if self.axis_acc.len() < other_len {
            self.axis_acc.resize(other_len, 0.0);
        }
    }

    pub fn bytes(&self) -> usize {
        (self.slice_a.len() + self.slice_b.len() + self.axis_acc.len()) * std::mem::size_of::<f32>()
    }
}

/// Penalties of the aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penalties {
    pub p1: f32,
    pub p2_weighting: f32,
}

impl Penalties {
    #[inline]
    pub fn p2(&self, color_delta: f32) -> f32 {
        (self.p2_weighting / (1.0 + color_delta.abs())).max(self.p1)
    }
}

/// Aggregate `input` along `axes` into `output` (resized as needed).
///
/// `rc_colors` holds the reference texture at map resolution; it drives
/// the color-adaptive P2.
pub fn optimize_similarity_volume(
    input: &Volume<f32>,
    output: &mut Volume<f32>,
    rc_colors: &Image<f32>,
    axes: &[SgmAxis],
    penalties: Penalties,
    acc: &mut SgmAccumulators,
) {
    let (w, h, nz) = (input.width(), input.height(), input.depth());
    output.reset(w, h, nz, 0.0);
    if w == 0 || h == 0 || nz == 0 || axes.is_empty() {
        return;
    }
    debug_assert_eq!((rc_colors.width(), rc_colors.height()), (w, h));

    for &axis in axes {
        for forward in [true, false] {
            sweep(input, output, rc_colors, axis, forward, penalties, acc);
        }
    }

    let n_paths = (axes.len() * 2) as f32;
    output.as_mut_slice().par_iter_mut().for_each(|v| *v /= n_paths);
}

fn sweep(
    input: &Volume<f32>,
    output: &mut Volume<f32>,
    rc_colors: &Image<f32>,
    axis: SgmAxis,
    forward: bool,
    penalties: Penalties,
    acc: &mut SgmAccumulators,
) {
    let (w, h, nz) = (input.width(), input.height(), input.depth());
    let (n_slices, other_len) = match axis {
        SgmAxis::X => (w, h),
        SgmAxis::Y => (h, w),
    };
    acc.ensure(other_len, nz);
    let lane_len = other_len * nz;

    // Slice s, lane i → image pixel.
    let pixel = |s: usize, i: usize| -> (usize, usize) {
        match axis {
            SgmAxis::X => (s, i),
            SgmAxis::Y => (i, s),
        }
    };
    let order: Vec<usize> = if forward {
        (0..n_slices).collect()
    } else {
        (0..n_slices).rev().collect()
    };

    // First slice: L = C.
    let s0 = order[0];
    for i in 0..other_len {
        let (x, y) = pixel(s0, i);
        for z in 0..nz {
            let c = input.get(x, y, z);
            acc.slice_a[i * nz + z] = c;
            *output.get_mut(x, y, z) += c;
        }
    }

    for k in 1..order.len() {
        let (s, prev_s) = (order[k], order[k - 1]);

        {
            let prev = &acc.slice_a[..lane_len];
            acc.axis_acc[..other_len]
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, m)| {
                    *m = prev[i * nz..(i + 1) * nz].iter().copied().fold(f32::INFINITY, f32::min);
                });
        }

        {
            let prev = &acc.slice_a[..lane_len];
            let mins = &acc.axis_acc[..other_len];
            acc.slice_b[..lane_len]
                .par_chunks_mut(nz)
                .enumerate()
                .for_each(|(i, lane)| {
                    let (x, y) = pixel(s, i);
                    let (px, py) = pixel(prev_s, i);
                    let p2 = penalties.p2(rc_colors.get(x, y) - rc_colors.get(px, py));
                    let prev_lane = &prev[i * nz..(i + 1) * nz];
                    let m = mins[i];
                    for z in 0..nz {
                        let mut best = prev_lane[z];
                        if z > 0 {
                            best = best.min(prev_lane[z - 1] + penalties.p1);
                        }
                        if z + 1 < nz {
                            best = best.min(prev_lane[z + 1] + penalties.p1);
                        }
                        best = best.min(m + p2);
                        lane[z] = input.get(x, y, z) + best - m;
                    }
                });
        }

        for i in 0..other_len {
            let (x, y) = pixel(s, i);
            for z in 0..nz {
                *output.get_mut(x, y, z) += acc.slice_b[i * nz + z];
            }
        }
        std::mem::swap(&mut acc.slice_a, &mut acc.slice_b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEN: Penalties = Penalties { p1: 10.0, p2_weighting: 100.0 };

    #[test]
    fn test_p2_is_color_adaptive_and_bounded() {
        assert_eq!(PEN.p2(0.0), 100.0);
        assert_eq!(PEN.p2(-3.0), 25.0);
        assert_eq!(PEN.p2(200.0), 10.0);
    }

    #[test]
    fn test_uniform_volume_stays_uniform() {
        let input = Volume::filled(5, 4, 6, 42.0f32);
        let mut out = Volume::filled(1, 1, 1, 0.0f32);
        let colors = Image::filled(5, 4, 128.0f32);
        let mut acc = SgmAccumulators::default();
        optimize_similarity_volume(&input, &mut out, &colors, &[SgmAxis::X, SgmAxis::Y], PEN, &mut acc);
        assert_eq!((out.width(), out.height(), out.depth()), (5, 4, 6));
        assert!(out.as_slice().iter().all(|&v| (v - 42.0).abs() < 1e-4));
    }

    #[test]
    fn test_aggregation_fixes_outlier() {
        // True minimum at z = 2 everywhere except one pixel whose raw
        // cost prefers z = 5 by a small margin.
        let (w, h, nz) = (7, 7, 8);
        let mut input = Volume::filled(w, h, nz, 100.0f32);
        for y in 0..h {
            for x in 0..w {
                input.set(x, y, 2, 0.0);
            }
        }
        input.set(3, 3, 2, 30.0);
        input.set(3, 3, 5, 20.0);
        let mut out = Volume::filled(1, 1, 1, 0.0f32);
        let colors = Image::filled(w, h, 128.0f32);
        let mut acc = SgmAccumulators::default();
        optimize_similarity_volume(&input, &mut out, &colors, &[SgmAxis::Y, SgmAxis::X], PEN, &mut acc);

        let argmin = |x: usize, y: usize| {
            (0..nz).min_by(|&a, &b| out.get(x, y, a).total_cmp(&out.get(x, y, b))).unwrap()
        };
        assert_eq!(argmin(3, 3), 2);
        assert_eq!(argmin(0, 0), 2);
    }

    #[test]
    fn test_single_axis_single_pixel_lane() {
        let mut input = Volume::filled(3, 1, 3, 0.0f32);
        input.set(1, 0, 1, 7.0);
        let mut out = Volume::filled(1, 1, 1, 0.0f32);
        let colors = Image::filled(3, 1, 0.0f32);
        let mut acc = SgmAccumulators::default();
        optimize_similarity_volume(&input, &mut out, &colors, &[SgmAxis::Y], PEN, &mut acc);
        // Axis Y over a 1-row image: every path is a single slice, L = C.
        assert_eq!(out.get(1, 0, 1), 7.0);
        assert_eq!(out.get(1, 0, 0), 0.0);
    }
}
