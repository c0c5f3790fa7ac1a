// io/metadata.rs — Self-describing tile metadata.
//
// Every persisted map carries the attributes needed to put it back in
// place and to reuse it without the original cameras:
//
//   depthMap:roiBeginX/Y, roiEndX/Y        tile region, full resolution
//   depthMap:tileBufferWidth/Height        tile geometry of the pass
//   depthMap:tilePadding
//   depthMap:downscale                     scale · step of the map
//   depthMap:P                             4×4 projection at full resolution
//   depthMap:CArr                          camera center at the map resolution
//   depthMap:iCamArr                       (K R)⁻¹ at the map resolution
//   depthMap:nbDepthValues                 valid depth count of the buffer
//   depthMap:minDepth, maxDepth            valid depth range (-1 if none)
//
// The ROI and tile geometry are required on read; everything else is
// informational. OpenEXR stores the matrices as f32.

use exr::prelude::{AttributeValue, Text};
use nalgebra::{Matrix3, Matrix4, Vector3};

use crate::camera::CameraParams;
use crate::error::{DepthMapError, Result};
use crate::image::Image;
use crate::io::exr::Attributes;
use crate::maps::{count_valid_depths, valid_depth_range};
use crate::roi::Roi;
use crate::tile::TileParams;

pub const ROI_BEGIN_X: &str = "depthMap:roiBeginX";
pub const ROI_BEGIN_Y: &str = "depthMap:roiBeginY";
pub const ROI_END_X: &str = "depthMap:roiEndX";
pub const ROI_END_Y: &str = "depthMap:roiEndY";
pub const TILE_BUFFER_WIDTH: &str = "depthMap:tileBufferWidth";
pub const TILE_BUFFER_HEIGHT: &str = "depthMap:tileBufferHeight";
pub const TILE_PADDING: &str = "depthMap:tilePadding";
pub const DOWNSCALE: &str = "depthMap:downscale";
pub const PROJECTION: &str = "depthMap:P";
pub const CAMERA_CENTER: &str = "depthMap:CArr";
pub const INVERSE_CAMERA: &str = "depthMap:iCamArr";
pub const NB_DEPTH_VALUES: &str = "depthMap:nbDepthValues";
pub const MIN_DEPTH: &str = "depthMap:minDepth";
pub const MAX_DEPTH: &str = "depthMap:maxDepth";

/// Everything written next to a map buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TileMetadata {
    /// Tile region in full-resolution image coordinates.
    pub roi: Roi,
    pub tile_params: TileParams,
    pub downscale: i32,
    pub projection: Matrix4<f64>,
    pub center: Vector3<f64>,
    pub inverse_camera: Matrix3<f64>,
    pub nb_depth_values: i32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl TileMetadata {
    /// Metadata for a buffer of `roi` computed at `downscale`.
    ///
    /// `cam` is the full-resolution camera. P is stored as is; the center
    /// and inverse camera come from the rescaled camera. `depth` supplies the statistics when present.
    pub fn new(
        cam: &CameraParams,
        tile_params: &TileParams,
        roi: &Roi,
        downscale: i32,
        depth: Option<&Image<f32>>,
    ) -> Result<Self> {
        let scaled = cam.rescaled(downscale.max(1) as f64)?;
        let (nb_depth_values, (min_depth, max_depth)) = match depth {
            Some(d) => (
                count_valid_depths(d) as i32,
                valid_depth_range(d).unwrap_or((-1.0, -1.0)),
            ),
            None => (-1, (-1.0, -1.0)),
        };
        Ok(TileMetadata {
            roi: *roi,
            tile_params: *tile_params,
            downscale,
            projection: cam.projection_4x4(),
            center: scaled.c,
            inverse_camera: scaled.inverse_camera(),
            nb_depth_values,
            min_depth,
            max_depth,
        })
    }

    pub fn to_attributes(&self) -> Attributes {
        let mut a = Attributes::new();
        let mut int = |key: &str, v: i32| {
            a.insert(Text::from(key), AttributeValue::I32(v));
        };
        int(ROI_BEGIN_X, self.roi.x.begin);
        int(ROI_BEGIN_Y, self.roi.y.begin);
        int(ROI_END_X, self.roi.x.end);
        int(ROI_END_Y, self.roi.y.end);
        int(TILE_BUFFER_WIDTH, self.tile_params.buffer_width);
        int(TILE_BUFFER_HEIGHT, self.tile_params.buffer_height);
        int(TILE_PADDING, self.tile_params.padding);
        int(DOWNSCALE, self.downscale);
        int(NB_DEPTH_VALUES, self.nb_depth_values);

        let mut p = [0.0f32; 16];
        for (i, v) in p.iter_mut().enumerate() {
            *v = self.projection[(i / 4, i % 4)] as f32;
        }
        let mut icam = [0.0f32; 9];
        for (i, v) in icam.iter_mut().enumerate() {
            *v = self.inverse_camera[(i / 3, i % 3)] as f32;
        }
        a.insert(Text::from(PROJECTION), AttributeValue::Matrix4x4(p));
        a.insert(Text::from(INVERSE_CAMERA), AttributeValue::Matrix3x3(icam));
        a.insert(
            Text::from(CAMERA_CENTER),
            AttributeValue::FloatVec3((self.center.x as f32, self.center.y as f32, self.center.z as f32)),
        );
        a.insert(Text::from(MIN_DEPTH), AttributeValue::F32(self.min_depth));
        a.insert(Text::from(MAX_DEPTH), AttributeValue::F32(self.max_depth));
        a
    }

    /// Parse a complete metadata set. Missing camera attributes are an
    /// error as well as a missing ROI or tile geometry.
    pub fn from_attributes(attributes: &Attributes) -> Result<Self> {
        let roi = roi_from_attributes(attributes)?;
        let tile_params = tile_params_from_attributes(attributes)?;
        let missing = |key: &str| DepthMapError::config(format!("missing or invalid metadata '{key}'"));

        let downscale = get_int(attributes, DOWNSCALE).ok_or_else(|| missing(DOWNSCALE))?;
        let projection = match attributes.get(&Text::from(PROJECTION)) {
            Some(AttributeValue::Matrix4x4(m)) => Matrix4::from_fn(|r, c| m[r * 4 + c] as f64),
            _ => return Err(missing(PROJECTION)),
        };
        let inverse_camera = match attributes.get(&Text::from(INVERSE_CAMERA)) {
            Some(AttributeValue::Matrix3x3(m)) => Matrix3::from_fn(|r, c| m[r * 3 + c] as f64),
            _ => return Err(missing(INVERSE_CAMERA)),
        };
        let center = match attributes.get(&Text::from(CAMERA_CENTER)) {
            Some(AttributeValue::FloatVec3((x, y, z))) => Vector3::new(*x as f64, *y as f64, *z as f64),
            _ => return Err(missing(CAMERA_CENTER)),
        };
        Ok(TileMetadata {
            roi,
            tile_params,
            downscale,
            projection,
            center,
            inverse_camera,
            nb_depth_values: nb_depth_values_from_attributes(attributes).unwrap_or(-1),
            min_depth: get_float(attributes, MIN_DEPTH).unwrap_or(-1.0),
            max_depth: get_float(attributes, MAX_DEPTH).unwrap_or(-1.0),
        })
    }
}

fn get_int(attributes: &Attributes, key: &str) -> Option<i32> {
    match attributes.get(&Text::from(key)) {
        Some(AttributeValue::I32(v)) => Some(*v),
        _ => None,
    }
}

fn get_float(attributes: &Attributes, key: &str) -> Option<f32> {
    match attributes.get(&Text::from(key)) {
        Some(AttributeValue::F32(v)) => Some(*v),
        _ => None,
    }
}

/// Tile region from the four ROI attributes.
///
/// All four must be present as integers with non-negative begins and
/// positive ends.
pub fn roi_from_attributes(attributes: &Attributes) -> Result<Roi> {
    let get = |key: &str| {
        get_int(attributes, key)
            .ok_or_else(|| DepthMapError::config(format!("missing or invalid tile ROI metadata '{key}'")))
    };
    let roi = Roi::from_bounds(get(ROI_BEGIN_X)?, get(ROI_BEGIN_Y)?, get(ROI_END_X)?, get(ROI_END_Y)?);
    if !roi.is_valid() {
        return Err(DepthMapError::config(format!("invalid tile ROI metadata {roi}")));
    }
    Ok(roi)
}

pub fn tile_params_from_attributes(attributes: &Attributes) -> Result<TileParams> {
    let params = TileParams {
        buffer_width: get_int(attributes, TILE_BUFFER_WIDTH).unwrap_or(-1),
        buffer_height: get_int(attributes, TILE_BUFFER_HEIGHT).unwrap_or(-1),
        padding: get_int(attributes, TILE_PADDING).unwrap_or(-1),
    };
    if !params.is_valid() {
        return Err(DepthMapError::config("missing or invalid tile parameters metadata"));
    }
    Ok(params)
}

/// Valid depth count, `None` when absent or negative.
pub fn nb_depth_values_from_attributes(attributes: &Attributes) -> Option<i32> {
    get_int(attributes, NB_DEPTH_VALUES).filter(|&n| n >= 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraParams {
        CameraParams::from_intrinsics(
            200.0,
            200.0,
            32.0,
            32.0,
            Matrix3::identity(),
            Vector3::new(0.5, -0.25, 1.0),
            64,
            64,
        )
    }

    #[test]
    fn test_attribute_round_trip() {
        let depth = Image::from_vec(3, 1, vec![-1.0, 2.0, 4.0]);
        let meta = TileMetadata::new(
            &camera(),
            &TileParams { buffer_width: 40, buffer_height: 40, padding: 16 },
            &Roi::from_bounds(24, 0, 64, 40),
            4,
            Some(&depth),
        )
        .unwrap();
        assert_eq!(meta.nb_depth_values, 2);
        assert_eq!((meta.min_depth, meta.max_depth), (2.0, 4.0));

        let back = TileMetadata::from_attributes(&meta.to_attributes()).unwrap();
        assert_eq!(back.roi, meta.roi);
        assert_eq!(back.tile_params, meta.tile_params);
        assert_eq!(back.downscale, 4);
        assert_eq!(back.nb_depth_values, 2);
        for i in 0..3 {
            assert_relative_eq!(back.center[i], meta.center[i], epsilon = 1e-6);
        }
        for i in 0..16 {
            let (r, c) = (i / 4, i % 4);
            assert_relative_eq!(back.projection[(r, c)], meta.projection[(r, c)], max_relative = 1e-6);
        }
    }

    #[test]
    fn test_rescaled_geometry() {
        let meta = TileMetadata::new(&camera(), &TileParams::default(), &Roi::full(64, 64), 4, None).unwrap();
        // P stays at full resolution, iCam has the focal divided by 4
        assert_relative_eq!(meta.projection[(0, 0)], 200.0, epsilon = 1e-9);
        assert_relative_eq!(meta.projection[(3, 3)], 1.0);
        assert_relative_eq!(meta.inverse_camera[(0, 0)], 1.0 / 50.0, epsilon = 1e-12);
        assert_eq!(meta.nb_depth_values, -1);
    }

    #[test]
    fn test_downscaled_round_trip_keeps_full_resolution_p() {
        let cam = camera();
        let meta = TileMetadata::new(&cam, &TileParams::default(), &Roi::full(64, 64), 2, None).unwrap();
        let back = TileMetadata::from_attributes(&meta.to_attributes()).unwrap();
        let full = cam.projection_4x4();
        for r in 0..4 {
            for c in 0..4 {
                assert_relative_eq!(back.projection[(r, c)], full[(r, c)], epsilon = 1e-4, max_relative = 1e-6);
            }
        }
        let icam = cam.rescaled(2.0).unwrap().inverse_camera();
        assert_relative_eq!(back.inverse_camera[(0, 0)], icam[(0, 0)], max_relative = 1e-6);
        assert_relative_eq!(back.inverse_camera[(0, 0)], 1.0 / 100.0, max_relative = 1e-6);
    }

    #[test]
    fn test_missing_roi_is_configuration_error() {
        let meta = TileMetadata::new(&camera(), &TileParams::default(), &Roi::full(64, 64), 1, None).unwrap();
        let mut attrs = meta.to_attributes();
        attrs.remove(&Text::from(ROI_END_Y));
        assert!(roi_from_attributes(&attrs).unwrap_err().is_configuration());
        assert!(TileMetadata::from_attributes(&attrs).is_err());
    }

    #[test]
    fn test_invalid_roi_and_tile_params() {
        let meta = TileMetadata::new(&camera(), &TileParams::default(), &Roi::full(64, 64), 1, None).unwrap();
        let mut attrs = meta.to_attributes();
        attrs.insert(Text::from(ROI_BEGIN_X), AttributeValue::I32(-8));
        assert!(roi_from_attributes(&attrs).is_err());

        let mut attrs = meta.to_attributes();
        attrs.insert(Text::from(TILE_PADDING), AttributeValue::I32(-1));
        assert!(tile_params_from_attributes(&attrs).is_err());
        attrs.insert(Text::from(TILE_PADDING), AttributeValue::F32(16.0));
        assert!(tile_params_from_attributes(&attrs).is_err());
    }

    #[test]
    fn test_nb_depth_values_absent_or_negative() {
        let mut attrs = Attributes::new();
        assert_eq!(nb_depth_values_from_attributes(&attrs), None);
        attrs.insert(Text::from(NB_DEPTH_VALUES), AttributeValue::I32(-1));
        assert_eq!(nb_depth_values_from_attributes(&attrs), None);
        attrs.insert(Text::from(NB_DEPTH_VALUES), AttributeValue::I32(12));
        assert_eq!(nb_depth_values_from_attributes(&attrs), Some(12));
    }
}
