//! Terrain texture painting: brush strokes, weight layers and layer packing

pub mod filter;
pub mod layer;
pub mod params;
pub mod texture_data;

pub use filter::{PaintSnapshot, SurfaceSampler};
pub use layer::{CombinedBlendTexture, PaintLayer, RenderBatch};
pub use params::{LayerMaterial, MaterialHandle, MaterialLibrary, PaintParams};
pub use texture_data::{
    LandscapeTextureData, LayerShaderData, PaintCommit, PaintDrawStates, MAX_BUMP_LAYERS_PER_PASS,
    MAX_LAYERS_PER_PASS,
};
