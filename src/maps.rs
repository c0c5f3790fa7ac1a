// maps.rs — Per-pixel output maps.
//
//   DepthSimMap      depth + similarity, the product of SGM and refine
//   DepthPixSizeMap  depth + world-space pixel footprint (refine only)
//   NormalMap        unit surface normals
//
// Sentinels: depth ≤ 0 is invalid (engines write -1 and the merge
// produces 0 where nothing was written); normals use (-1, -1, -1).
// Similarity lies in [-1, 1], lower is better; it is meaningless where
// the depth is invalid.

use crate::image::Image;

pub const DEPTH_INVALID: f32 = -1.0;
/// Similarity written next to an invalid depth.
pub const SIM_INVALID: f32 = 1.0;
pub const NORMAL_INVALID: [f32; 3] = [-1.0, -1.0, -1.0];

pub type NormalMap = Image<[f32; 3]>;

#[inline]
pub fn is_valid_depth(d: f32) -> bool {
    d > 0.0
}

#[derive(Debug, Clone)]
pub struct DepthSimMap {
    pub depth: Image<f32>,
    pub sim: Image<f32>,
}

impl DepthSimMap {
    /// All pixels invalid.
    pub fn new_invalid(width: usize, height: usize) -> Self {
        DepthSimMap {
            depth: Image::filled(width, height, DEPTH_INVALID),
            sim: Image::filled(width, height, SIM_INVALID),
        }
    }

    /// All pixels zero (the merge accumulator).
    pub fn zeros(width: usize, height: usize) -> Self {
        DepthSimMap {
            depth: Image::new(width, height),
            sim: Image::new(width, height),
        }
    }

    pub fn width(&self) -> usize {
        self.depth.width()
    }

    pub fn height(&self) -> usize {
        self.depth.height()
    }

    pub fn nb_valid(&self) -> usize {
        count_valid_depths(&self.depth)
    }
}

/// Depth plus the world-space size of one map pixel at that depth.
#[derive(Debug, Clone)]
pub struct DepthPixSizeMap {
    pub depth: Image<f32>,
    pub pix_size: Image<f32>,
}

impl DepthPixSizeMap {
    pub fn new_invalid(width: usize, height: usize) -> Self {
        DepthPixSizeMap {
            depth: Image::filled(width, height, DEPTH_INVALID),
            pix_size: Image::new(width, height),
        }
    }

    pub fn width(&self) -> usize {
        self.depth.width()
    }

    pub fn height(&self) -> usize {
        self.depth.height()
    }
}

pub fn count_valid_depths(depth: &Image<f32>) -> usize {
    depth.as_slice().iter().filter(|&&d| is_valid_depth(d)).count()
}

/// `(min, max)` over valid depths, `None` if there are none.
pub fn valid_depth_range(depth: &Image<f32>) -> Option<(f32, f32)> {
    depth
        .as_slice()
        .iter()
        .copied()
        .filter(|&d| is_valid_depth(d))
        .fold(None, |acc, d| match acc {
            None => Some((d, d)),
            Some((lo, hi)) => Some((lo.min(d), hi.max(d))),
        })
}
