//! Height data, LOD index tables and terrain blocks

pub mod block;
pub mod generator;
pub mod heightfield;
pub mod lod;

pub use block::{BlockGeometry, RenderMode, TerrainBlock, TerrainVertex, TERRAIN_VERTEX_FORMAT};
pub use generator::{HeightFieldGenerator, NoiseParams};
pub use heightfield::{HeightField, TerrainTransform, DEFAULT_COLOR, MAX_HEIGHT, MIN_HEIGHT};
pub use lod::{EdgeSide, IndexRange, LodLevel, LodTable, MipLookup, BYTES_PER_INDEX, MAX_LANDSCAPE_LOD};
