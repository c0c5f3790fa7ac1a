// tests/test_image.rs — Integration tests for Image<T>, Roi and sampling.

use depthmap::image::{interpolate_bilinear, sample_bilinear, to_f32_image, Image};
use depthmap::roi::{divide_round_up, Range, Roi};

// ===== Image construction & basic access =====

#[test]
fn image_new_zero_initialized() {
    let img: Image<u8> = Image::new(100, 50);
    assert_eq!(img.width(), 100);
    assert_eq!(img.height(), 50);
    assert_eq!(img.get(0, 0), 0);
    assert_eq!(img.get(99, 49), 0);
}

#[test]
fn image_from_vec_layout() {
    // 3×2 image, row-major:
    //  [10, 20, 30]
    //  [40, 50, 60]
    let img = Image::from_vec(3, 2, vec![10u8, 20, 30, 40, 50, 60]);
    assert_eq!(img.get(0, 0), 10);
    assert_eq!(img.get(2, 0), 30);
    assert_eq!(img.get(0, 1), 40);
    assert_eq!(img[(2, 1)], 60);
    assert_eq!(img.row(1), &[40, 50, 60]);
}

#[test]
fn filled_and_fill() {
    let mut img = Image::filled(4, 3, -1.0f32);
    assert!(img.as_slice().iter().all(|&v| v == -1.0));
    img.fill(2.5);
    assert!(img.as_slice().iter().all(|&v| v == 2.5));
}

#[test]
fn try_get_outside_is_none() {
    let img = Image::from_vec(2, 2, vec![1u8, 2, 3, 4]);
    assert_eq!(img.try_get(1, 1), Some(4));
    assert_eq!(img.try_get(-1, 0), None);
    assert_eq!(img.try_get(0, 2), None);
}

#[test]
fn crop_copies_region() {
    // value = x * 10 + y
    let mut img: Image<u8> = Image::new(5, 5);
    for y in 0..5u8 {
        for x in 0..5u8 {
            img.set(x as usize, y as usize, x * 10 + y);
        }
    }
    let c = img.crop(1, 2, 3, 3);
    assert_eq!((c.width(), c.height()), (3, 3));
    assert_eq!(c.get(0, 0), 12);
    assert_eq!(c.get(2, 2), 34);
}

#[test]
fn map_and_f32_conversion() {
    let img = Image::from_vec(2, 2, vec![0u8, 42, 128, 255]);
    let f = to_f32_image(&img);
    assert_eq!(f.as_slice(), &[0.0, 42.0, 128.0, 255.0]);
    let halved = f.map(|v| v * 0.5);
    assert_eq!(halved.get(1, 1), 127.5);
}

#[test]
fn pixels_iterator_order() {
    let img = Image::from_vec(2, 2, vec![1u8, 2, 3, 4]);
    let pixels: Vec<_> = img.pixels().collect();
    assert_eq!(pixels, vec![(0, 0, 1), (1, 0, 2), (0, 1, 3), (1, 1, 4)]);
}

#[test]
fn clone_is_independent() {
    let mut img: Image<u8> = Image::new(4, 4);
    img.set(0, 0, 42);
    let img2 = img.clone();
    img.set(0, 0, 99);
    assert_eq!(img2.get(0, 0), 42);
    assert_eq!(img.get(0, 0), 99);
}

#[test]
fn empty_dimension_image() {
    let img: Image<f32> = Image::new(0, 0);
    assert!(img.is_empty());
    assert_eq!(img.pixels().count(), 0);
}

// ===== Bilinear interpolation =====

#[test]
fn bilinear_linear_gradient() {
    // Exact on a linear gradient.
    let mut img: Image<f32> = Image::new(10, 10);
    for y in 0..10 {
        for x in 0..10 {
            img.set(x, y, x as f32 * 3.0 + y as f32 * 7.0);
        }
    }
    for (px, py) in [(0.5, 0.5), (2.3, 4.7), (7.9, 1.1), (0.0, 8.0)] {
        let expected = px * 3.0 + py * 7.0;
        let actual = interpolate_bilinear(&img, px, py);
        assert!(
            (actual - expected).abs() < 1e-4,
            "bilinear({px}, {py}): expected {expected}, got {actual}"
        );
    }
}

#[test]
fn sample_refuses_outside_and_nan() {
    let img = Image::filled(4, 4, 1.0f32);
    assert_eq!(sample_bilinear(&img, 3.0, 3.0), Some(1.0));
    assert_eq!(sample_bilinear(&img, 3.01, 1.0), None);
    assert_eq!(sample_bilinear(&img, -0.01, 1.0), None);
    assert_eq!(sample_bilinear(&img, f32::NAN, 1.0), None);
    // Clamped variant keeps answering.
    assert_eq!(interpolate_bilinear(&img, -5.0, 9.0), 1.0);
}

// ===== Roi =====

#[test]
fn roi_downscale_rounds_outward() {
    let roi = Roi { x: Range::new(24, 64), y: Range::new(0, 37) };
    let ds = roi.downscale(4);
    assert_eq!((ds.x.begin, ds.x.end), (6, 16));
    assert_eq!((ds.y.begin, ds.y.end), (0, 10));
    assert_eq!(divide_round_up(37, 4), 10);
}

#[test]
fn roi_inside_and_valid() {
    let roi = Roi { x: Range::new(10, 50), y: Range::new(0, 40) };
    assert!(roi.is_valid());
    assert!(roi.is_inside(50, 40));
    assert!(!roi.is_inside(49, 40));
    assert_eq!((roi.width(), roi.height()), (40, 40));
    let empty = Roi { x: Range::new(5, 5), y: Range::new(0, 1) };
    assert!(empty.is_empty());
    assert!(Roi::full(8, 6).is_inside(8, 6));
}
