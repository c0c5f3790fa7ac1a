// roi.rs — Half-open integer ranges and rectangular regions of interest.
//
// All region arithmetic in the crate goes through these two types:
//
//   Range  [begin, end)          one axis
//   Roi    x: Range, y: Range    a rectangle
//
// Downscaling maps a full-resolution region to the pixels of a map
// computed at `1 / factor` resolution. Begin rounds down and end rounds
// up so the downscaled region always covers every source pixel:
//
//   full:   [24, 64)   factor 4   →   [6, 16)
//   full:   [26, 63)   factor 4   →   [6, 16)
//
// Coordinates are i32 because metadata stores them signed and a
// negative begin is how an invalid region is recognised on read.

use serde::{Deserialize, Serialize};

/// A half-open integer interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    pub begin: i32,
    pub end: i32,
}

impl Range {
    #[inline]
    pub const fn new(begin: i32, end: i32) -> Self {
        Range { begin, end }
    }

    /// Number of elements; zero when the range is empty or inverted.
    #[inline]
    pub fn size(&self) -> usize {
        (self.end - self.begin).max(0) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    #[inline]
    pub fn contains(&self, v: i32) -> bool {
        v >= self.begin && v < self.end
    }

    pub fn intersect(&self, other: &Range) -> Range {
        Range::new(self.begin.max(other.begin), self.end.min(other.end))
    }

    /// Floor on begin, ceiling on end.
    pub fn downscale(&self, factor: i32) -> Range {
        debug_assert!(factor > 0);
        Range::new(
            self.begin.div_euclid(factor),
            divide_round_up(self.end, factor),
        )
    }
}

/// A rectangular region `[x.begin, x.end) × [y.begin, y.end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Roi {
    pub x: Range,
    pub y: Range,
}

impl Roi {
    #[inline]
    pub const fn new(x: Range, y: Range) -> Self {
        Roi { x, y }
    }

    pub const fn from_bounds(x_begin: i32, y_begin: i32, x_end: i32, y_end: i32) -> Self {
        Roi {
            x: Range::new(x_begin, x_end),
            y: Range::new(y_begin, y_end),
        }
    }

    /// The whole image `[0, width) × [0, height)`.
    pub fn full(width: usize, height: usize) -> Self {
        Roi::from_bounds(0, 0, width as i32, height as i32)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.x.size()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.y.size()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty() || self.y.is_empty()
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.x.contains(x) && self.y.contains(y)
    }

    pub fn intersect(&self, other: &Roi) -> Roi {
        Roi::new(self.x.intersect(&other.x), self.y.intersect(&other.y))
    }

    pub fn downscale(&self, factor: i32) -> Roi {
        Roi::new(self.x.downscale(factor), self.y.downscale(factor))
    }

    /// True if this region lies entirely within `[0, width) × [0, height)`.
    pub fn is_inside(&self, width: usize, height: usize) -> bool {
        self.x.begin >= 0
            && self.y.begin >= 0
            && self.x.end <= width as i32
            && self.y.end <= height as i32
    }

    /// Metadata validity rule: begin must be non-negative and end positive.
    pub fn is_valid(&self) -> bool {
        self.x.begin >= 0 && self.y.begin >= 0 && self.x.end > 0 && self.y.end > 0
    }
}

impl std::fmt::Display for Roi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}) × [{}, {})",
            self.x.begin, self.x.end, self.y.begin, self.y.end
        )
    }
}

/// Integer ceiling division for non-negative numerators.
#[inline]
pub fn divide_round_up(a: i32, b: i32) -> i32 {
    (a + b - 1).div_euclid(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downscale_floor_begin_ceil_end() {
        let r = Range::new(26, 63).downscale(4);
        assert_eq!(r, Range::new(6, 16));
        let r = Range::new(24, 64).downscale(4);
        assert_eq!(r, Range::new(6, 16));
    }

    #[test]
    fn test_downscale_identity() {
        let roi = Roi::from_bounds(3, 5, 17, 21);
        assert_eq!(roi.downscale(1), roi);
    }

    #[test]
    fn test_intersect_disjoint_is_empty() {
        let a = Roi::from_bounds(0, 0, 10, 10);
        let b = Roi::from_bounds(10, 0, 20, 10);
        assert!(a.intersect(&b).is_empty());
        assert_eq!(a.intersect(&b).width(), 0);
    }

    #[test]
    fn test_intersect_clips_to_image() {
        let tile = Roi::from_bounds(40, -4, 80, 30);
        let img = Roi::full(64, 64);
        let r = tile.intersect(&img);
        assert_eq!(r, Roi::from_bounds(40, 0, 64, 30));
        assert!(r.is_inside(64, 64));
    }

    #[test]
    fn test_validity_rule() {
        assert!(Roi::from_bounds(0, 0, 1, 1).is_valid());
        assert!(!Roi::from_bounds(-1, 0, 1, 1).is_valid());
        assert!(!Roi::from_bounds(0, 0, 0, 1).is_valid());
    }

    #[test]
    fn test_divide_round_up() {
        assert_eq!(divide_round_up(64, 4), 16);
        assert_eq!(divide_round_up(65, 4), 17);
        assert_eq!(divide_round_up(0, 4), 0);
        assert_eq!(divide_round_up(1, 1), 1);
    }
}
