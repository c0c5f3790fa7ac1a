// depthmap: tiled multi-view stereo depth maps
// SGM + sub-pixel refinement over padded tiles, persisted as OpenEXR and
// merged with weighted border blending.
//
// Every engine stage has a CPU reference (sgm/, refine/) and a wgpu
// mirror (gpu/). The CPU side is authoritative.

pub mod error;
pub mod roi;
pub mod image;
pub mod convolution;
pub mod pyramid;
pub mod camera;
pub mod frame;
pub mod tile;
pub mod depth_list;
pub mod maps;
pub mod volume;
pub mod similarity;
pub mod normals;
pub mod sgm;
pub mod refine;
pub mod gpu;
pub mod io;
pub mod merge;
pub mod config;
pub mod pipeline;
pub mod synthetic;

pub use config::{load_config, Backend, DepthMapConfig};
pub use error::{DepthMapError, Result};
pub use pipeline::{CameraResult, CpuTileEngine, DepthMapEstimator, GpuTileEngine, SceneInput, TileEngine};
