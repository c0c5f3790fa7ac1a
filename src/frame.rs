// frame.rs — Map pixel ↔ camera pixel bookkeeping for one tile.
//
// A stage working at `scale` and `step` produces a map whose pixels are
// `scale · step` full-resolution pixels apart:
//
//   tile roi (full res)  ──÷(scale·step)──►  map roi (global map coords)
//   local map pixel (lx, ly)
//     global map pixel  = map_roi.begin + (lx, ly)
//     camera pixel      = global · step      in the `scale` image
//
// SGM, refine and normal estimation all go through this type so that a
// depth written by one stage back-projects to the same 3D point in the
// next.

use nalgebra::{Matrix3, Vector3};

use crate::camera::{CameraParams, CameraView};
use crate::error::Result;
use crate::image::Image;
use crate::roi::Roi;

#[derive(Debug, Clone)]
pub struct MapFrame {
    /// Camera at the `scale` image resolution.
    pub cam: CameraParams,
    pub scale: u32,
    pub step: u32,
    /// Tile region in map coordinates.
    pub roi: Roi,
    icam: Matrix3<f64>,
}

impl MapFrame {
    pub fn new(view: &CameraView, tile_roi: &Roi, scale: u32, step: u32) -> Result<Self> {
        let cam = view.camera_at(scale)?;
        Ok(Self::from_camera(cam, tile_roi, scale, step))
    }

    /// Frame for a camera already expressed at the `scale` resolution.
    pub fn from_camera(cam: CameraParams, tile_roi: &Roi, scale: u32, step: u32) -> Self {
        let icam = cam.inverse_camera();
        MapFrame {
            cam,
            scale,
            step,
            roi: tile_roi.downscale((scale * step) as i32),
            icam,
        }
    }

    /// Total downscale relative to full resolution.
    pub fn downscale(&self) -> u32 {
        self.scale * self.step
    }

    pub fn width(&self) -> usize {
        self.roi.width()
    }

    pub fn height(&self) -> usize {
        self.roi.height()
    }

    /// Pixel in the `scale` image for local map pixel (lx, ly).
    #[inline]
    pub fn image_coords(&self, lx: usize, ly: usize) -> (f64, f64) {
        let s = self.step as f64;
        (
            (self.roi.x.begin as f64 + lx as f64) * s,
            (self.roi.y.begin as f64 + ly as f64) * s,
        )
    }

    #[inline]
    pub fn ray(&self, u: f64, v: f64) -> Vector3<f64> {
        (self.icam * Vector3::new(u, v, 1.0)).normalize()
    }

    /// 3D point of local map pixel (lx, ly) at `depth`.
    #[inline]
    pub fn back_project(&self, lx: usize, ly: usize, depth: f64) -> Vector3<f64> {
        let (u, v) = self.image_coords(lx, ly);
        self.cam.c + self.ray(u, v) * depth
    }

    /// World distance between neighboring map pixels at `depth`.
    pub fn pixel_size(&self, lx: usize, ly: usize, depth: f64) -> f64 {
        let (u, v) = self.image_coords(lx, ly);
        let a = self.ray(u, v) * depth;
        let b = self.ray(u + self.step as f64, v) * depth;
        (b - a).norm()
    }

    pub fn inverse_camera(&self) -> &Matrix3<f64> {
        &self.icam
    }

    /// `image` (at `scale` resolution) sampled at every map pixel;
    /// 0 where the map pixel falls outside the image.
    pub fn sample_texture(&self, image: &Image<f32>) -> Image<f32> {
        let (w, h) = (self.width(), self.height());
        let mut out = Image::new(w, h);
        for ly in 0..h {
            for lx in 0..w {
                let (u, v) = self.image_coords(lx, ly);
                out.set(lx, ly, image.try_get(u as i64, v as i64).unwrap_or(0.0));
            }
        }
        out
    }
}
