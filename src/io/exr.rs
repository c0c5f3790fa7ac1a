// io/exr.rs — OpenEXR map files.
//
// A map file holds one layer of float channels placed inside a larger
// canvas:
//
//   display window   (0, 0) .. (canvas width, canvas height)   full map
//   data window      data roi                                  the buffer
//
// Untiled maps use data window = display window. Custom key/value
// attributes ride in the layer header (see metadata.rs for the keys).
//
// Samples are stored either as 32-bit or 16-bit floats; reading always
// yields f32.

use std::collections::HashMap;
use std::path::Path;

use exr::prelude::*;
use half::f16;

use crate::error::{DepthMapError, Result};
use crate::roi::Roi;

/// Custom header attributes by name.
pub type Attributes = HashMap<Text, AttributeValue>;

/// Sample storage type on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Float,
    Half,
}

/// Placement of a buffer inside the full map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    pub width: usize,
    pub height: usize,
    /// Region covered by the stored buffer, in canvas pixels.
    pub data: Roi,
}

impl Canvas {
    /// A buffer covering the whole canvas.
    pub fn full(width: usize, height: usize) -> Self {
        Canvas { width, height, data: Roi::full(width, height) }
    }

    pub fn is_tile(&self) -> bool {
        self.data != Roi::full(self.width, self.height)
    }
}

/// A map file read back into memory.
#[derive(Debug, Clone)]
pub struct MapFile {
    pub canvas: Canvas,
    pub channels: Vec<(String, Vec<f32>)>,
    pub attributes: Attributes,
}

impl MapFile {
    pub fn width(&self) -> usize {
        self.canvas.data.width()
    }

    pub fn height(&self) -> usize {
        self.canvas.data.height()
    }

    pub fn channel(&self, name: &str) -> Option<&[f32]> {
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_slice())
    }

    /// Channel `name` as an image, or a data error naming `path`.
    pub fn channel_image(&self, path: &Path, name: &str) -> Result<crate::image::Image<f32>> {
        let samples = self
            .channel(name)
            .ok_or_else(|| DepthMapError::data(path, format!("missing channel '{name}'")))?;
        Ok(crate::image::Image::from_vec(self.width(), self.height(), samples.to_vec()))
    }
}

fn exr_error(path: &Path, err: exr::error::Error) -> DepthMapError {
    match err {
        exr::error::Error::Io(source) => DepthMapError::io(path, source),
        other => DepthMapError::data(path, other),
    }
}

/// Write `channels` (each `data.width() · data.height()` samples,
/// row-major) placed at `canvas.data`.
pub fn write_map(
    path: &Path,
    canvas: &Canvas,
    channels: &[(&str, &[f32])],
    storage: StorageType,
    attributes: &Attributes,
) -> Result<()> {
    let (w, h) = (canvas.data.width(), canvas.data.height());
    if w == 0 || h == 0 || channels.is_empty() {
        return Err(DepthMapError::config(format!(
            "cannot write empty map {} ({w}×{h}, {} channels)",
            path.display(),
            channels.len()
        )));
    }

    let mut list = SmallVec::<[AnyChannel<FlatSamples>; 4]>::new();
    for &(name, samples) in channels {
        if samples.len() != w * h {
            return Err(DepthMapError::config(format!(
                "channel '{name}' has {} samples, expected {}",
                samples.len(),
                w * h
            )));
        }
        let data = match storage {
            StorageType::Float => FlatSamples::F32(samples.to_vec()),
            StorageType::Half => FlatSamples::F16(samples.iter().map(|&v| f16::from_f32(v)).collect()),
        };
        list.push(AnyChannel::new(name, data));
    }

    let mut layer_attributes = LayerAttributes::default();
    layer_attributes.layer_position = Vec2(canvas.data.x.begin, canvas.data.y.begin);
    layer_attributes.other = attributes.clone();

    let layer = Layer::new((w, h), layer_attributes, Encoding::FAST_LOSSLESS, AnyChannels::sort(list));
    let mut image = Image::from_layer(layer);
    image.attributes.display_window = IntegerBounds::new((0, 0), (canvas.width, canvas.height));

    image.write().to_file(path).map_err(|e| exr_error(path, e))?;
    log::debug!("wrote {} ({w}×{h} at {})", path.display(), canvas.data);
    Ok(())
}

/// Read every channel and attribute of the first layer.
pub fn read_map(path: &Path) -> Result<MapFile> {
    let image = read_first_flat_layer_from_file(path).map_err(|e| exr_error(path, e))?;
    let layer = &image.layer_data;

    let canvas = canvas_from(&image.attributes.display_window, layer.attributes.layer_position, layer.size);
    let channels = layer
        .channel_data
        .list
        .iter()
        .map(|channel| {
            let samples: Vec<f32> = match &channel.sample_data {
                FlatSamples::F32(v) => v.clone(),
                FlatSamples::F16(v) => v.iter().map(|h| h.to_f32()).collect(),
                FlatSamples::U32(v) => v.iter().map(|&u| u as f32).collect(),
            };
            (channel.name.to_string(), samples)
        })
        .collect();

    let mut attributes = image.attributes.other.clone();
    attributes.extend(layer.attributes.other.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(MapFile { canvas, channels, attributes })
}

/// Read only the header: placement and custom attributes.
pub fn read_attributes(path: &Path) -> Result<(Canvas, Attributes)> {
    let meta = MetaData::read_from_file(path, false).map_err(|e| exr_error(path, e))?;
    let header = meta
        .headers
        .first()
        .ok_or_else(|| DepthMapError::data(path, "file has no layer"))?;

    let canvas = canvas_from(
        &header.shared_attributes.display_window,
        header.own_attributes.layer_position,
        header.layer_size,
    );
    let mut attributes = header.shared_attributes.other.clone();
    attributes.extend(header.own_attributes.other.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok((canvas, attributes))
}

fn canvas_from(display: &IntegerBounds, position: Vec2<i32>, size: Vec2<usize>) -> Canvas {
    let x = position.x() - display.position.x();
    let y = position.y() - display.position.y();
    Canvas {
        width: display.size.width(),
        height: display.size.height(),
        data: Roi::from_bounds(x, y, x + size.width() as i32, y + size.height() as i32),
    }
}
