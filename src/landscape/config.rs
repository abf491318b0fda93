//! Landscape configuration
//!
//! Stored as JSON in the landscape's database row and accepted by the
//! import tool.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::types::{Result, Vec3};
use crate::core::Error;
use crate::culling::CullDescriptor;
use crate::math::Size;
use crate::terrain::{NoiseParams, TerrainTransform, MAX_HEIGHT, MIN_HEIGHT};

/// Adaptive horizon occlusion settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcclusionConfig {
    pub enabled: bool,
    /// Occlusion is suspended when fewer tested nodes than this are rejected
    pub min_success_ratio: f32,
    /// Seconds before a suspended occlusion test runs again
    pub retest_delay: f32,
}

impl Default for OcclusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_success_ratio: 0.7,
            retest_delay: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandscapeConfig {
    /// Vertices along one block edge, `2^n + 1`
    pub block_size: u32,
    /// Blocks along X and Z; empty derives the layout from the height field
    pub block_layout: Size,
    /// Blend map texels per block
    pub blend_map_size: Size,
    /// World extent of the height field on X and Z, and of the full sample range on Y
    pub dimensions: Vec3,
    /// World position of sample (0, 0) at height 0
    pub offset: Vec3,
    /// Scales every LOD switch distance
    pub terrain_detail: f32,
    /// Added to every selected LOD
    pub lod_bias: i32,
    /// Measure LOD distance in the XZ plane only
    pub lod_ignore_y: bool,
    /// Converts height error into LOD switch distance
    pub variance_scale: f32,
    pub occlusion: OcclusionConfig,
    pub cull_descriptors: Vec<CullDescriptor>,
    /// Objects further than this are culled whatever their size
    pub object_cull_distance: Option<f32>,
    pub render_procedural: bool,
}

impl Default for LandscapeConfig {
    fn default() -> Self {
        Self {
            block_size: 33,
            block_layout: Size::default(),
            blend_map_size: Size::new(32, 32),
            dimensions: Vec3::new(1024.0, 512.0, 1024.0),
            offset: Vec3::ZERO,
            terrain_detail: 1.0,
            lod_bias: 0,
            lod_ignore_y: true,
            variance_scale: 64.0,
            occlusion: OcclusionConfig::default(),
            cull_descriptors: Vec::new(),
            object_cull_distance: None,
            render_procedural: true,
        }
    }
}

impl LandscapeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check settings that apply to the whole landscape
    pub fn validate(&self) -> Result<()> {
        let quads = self.block_size.saturating_sub(1);
        if quads < 2 || !quads.is_power_of_two() {
            return Err(Error::Geometry(format!(
                "block size {} is not 2^n + 1",
                self.block_size
            )));
        }
        if self.blend_map_size.is_empty() {
            return Err(Error::Degenerate("blend map has no texels".into()));
        }
        if self.dimensions.x <= 0.0 || self.dimensions.y <= 0.0 || self.dimensions.z <= 0.0 {
            return Err(Error::Degenerate(format!("landscape dimensions {}", self.dimensions)));
        }
        Ok(())
    }

    /// Layout to use for a height field, deriving it when none is configured
    pub fn layout_for(&self, field: Size) -> Size {
        if !self.block_layout.is_empty() {
            return self.block_layout;
        }
        let quads = self.block_size.saturating_sub(1).max(1);
        Size::new(
            field.width.saturating_sub(1) / quads,
            field.height.saturating_sub(1) / quads,
        )
    }

    /// Sample grid a layout covers
    pub fn field_size(&self, layout: Size) -> Size {
        let quads = self.block_size.saturating_sub(1);
        Size::new(layout.width * quads + 1, layout.height * quads + 1)
    }

    /// Sample-to-world mapping for a height field of `field` samples
    pub fn transform(&self, field: Size) -> TerrainTransform {
        let range = MAX_HEIGHT as f32 - MIN_HEIGHT as f32;
        let scale = Vec3::new(
            self.dimensions.x / field.width.saturating_sub(1).max(1) as f32,
            self.dimensions.y / range,
            self.dimensions.z / field.height.saturating_sub(1).max(1) as f32,
        );
        TerrainTransform::new(scale, self.offset)
    }
}

/// Inputs of the heightmap import tool
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportParams {
    pub config: LandscapeConfig,
    /// 16-bit grayscale PNG; synthesized from `noise` when absent
    pub heightmap: Option<PathBuf>,
    pub noise: NoiseParams,
    /// Remap samples into this range after loading
    pub normalize: Option<(i16, i16)>,
}

impl ImportParams {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let params: Self = serde_json::from_str(&text)?;
        log::info!("Loaded import parameters from {}", path.display());
        Ok(params)
    }
}
