// io/mod.rs — Persistence of depth, similarity and normal maps.
//
//   exr            OpenEXR files: channels, canvas placement, attributes
//   metadata       the depthMap:* attribute set of a tile
//   paths          file naming and tile discovery
//   depth_sim_map  map-level readers and writers
//
// Merging tiles back into a full map lives in merge.rs.

pub mod depth_sim_map;
pub mod exr;
pub mod metadata;
pub mod paths;

pub use depth_sim_map::{
    delete_depth_sim_map_tiles, nb_depth_values, read_depth_map, read_depth_sim_map, read_normal_map,
    read_sim_map, read_tile_metadata, write_depth_map, write_depth_sim_map, write_depth_sim_map_tile,
    write_normal_map_tile,
};
pub use metadata::TileMetadata;
pub use paths::{MapKind, MapPaths};
