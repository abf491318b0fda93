//! Landscape assembly, per-frame visibility and rendering, persistence

pub mod config;
#[allow(clippy::module_inception)]
pub mod landscape;
pub mod procedural;
pub mod states;

pub use config::{ImportParams, LandscapeConfig, OcclusionConfig};
pub use landscape::{Landscape, RenderPass};
pub use procedural::{
    batch_procedural_draws, ProceduralConstants, ProceduralDrawBatch, ProceduralLayer, ProceduralShaderData,
    MAX_PROCEDURAL_LAYERS_PER_PASS,
};
pub use states::{LandscapeStates, TerrainBaseData};
