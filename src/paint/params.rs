//! Brush parameters and layer materials

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::types::{Vec2, Vec3};
use crate::render::ResourceHandle;

/// Surface material applied by a paint or procedural layer
#[derive(Clone, Debug, PartialEq)]
pub struct LayerMaterial {
    /// Database id of the material
    pub id: u32,
    pub name: String,
    pub color_map: Option<ResourceHandle>,
    /// Layers with a normal map are packed into the bump-capable slots
    pub normal_map: Option<ResourceHandle>,
    pub scale: Vec2,
    pub base_scale: Vec2,
    /// Texture rotation in radians
    pub rotation: f32,
    pub offset: Vec2,
    pub tiling_reduction: bool,
}

impl LayerMaterial {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color_map: None,
            normal_map: None,
            scale: Vec2::ONE,
            base_scale: Vec2::ONE,
            rotation: 0.0,
            offset: Vec2::ZERO,
            tiling_reduction: false,
        }
    }

    pub fn with_color_map(mut self, texture: ResourceHandle) -> Self {
        self.color_map = Some(texture);
        self
    }

    pub fn with_normal_map(mut self, texture: ResourceHandle) -> Self {
        self.normal_map = Some(texture);
        self
    }

    pub fn with_tiling_reduction(mut self, enabled: bool) -> Self {
        self.tiling_reduction = enabled;
        self
    }

    pub fn has_normal_map(&self) -> bool {
        self.normal_map.is_some()
    }
}

/// Shared reference to a material
pub type MaterialHandle = Arc<LayerMaterial>;

/// Materials known to the host, looked up by id when loading layers
#[derive(Clone, Debug, Default)]
pub struct MaterialLibrary {
    materials: HashMap<u32, MaterialHandle>,
}

impl MaterialLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, material: LayerMaterial) -> MaterialHandle {
        let handle = Arc::new(material);
        self.materials.insert(handle.id, handle.clone());
        handle
    }

    pub fn get(&self, id: u32) -> Option<MaterialHandle> {
        self.materials.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

/// Settings for one paint stroke
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaintParams {
    /// Weight added per dab, as a percentage of full coverage (0..=100)
    pub strength: f32,
    /// Radius of full brush coverage (world units)
    pub inner_radius: f32,
    /// Radius at which the filtered falloff reaches zero (world units)
    pub outer_radius: f32,
    /// Subtract weight from existing layers instead of adding a material
    pub erase: bool,

    pub enable_height_limits: bool,
    pub min_height: f32,
    pub max_height: f32,
    /// Width of the soft band outside `[min_height, max_height]`
    pub height_softness: f32,

    pub enable_slope_limits: bool,
    pub slope_axis: Vec3,
    pub slope_scale: f32,
    pub slope_bias: f32,
    pub invert_slope: bool,
}

impl Default for PaintParams {
    fn default() -> Self {
        Self {
            strength: 100.0,
            inner_radius: 2.0,
            outer_radius: 4.0,
            erase: false,
            enable_height_limits: false,
            min_height: 0.0,
            max_height: 0.0,
            height_softness: 0.0,
            enable_slope_limits: false,
            slope_axis: Vec3::Y,
            slope_scale: 1.0,
            slope_bias: 0.0,
            invert_slope: false,
        }
    }
}

impl PaintParams {
    pub fn new(strength: f32, inner_radius: f32, outer_radius: f32) -> Self {
        Self {
            strength,
            inner_radius,
            outer_radius,
            ..Default::default()
        }
    }

    pub fn erasing(mut self) -> Self {
        self.erase = true;
        self
    }

    pub fn with_height_limits(mut self, min: f32, max: f32, softness: f32) -> Self {
        self.enable_height_limits = true;
        self.min_height = min;
        self.max_height = max;
        self.height_softness = softness;
        self
    }

    pub fn with_slope_limits(mut self, axis: Vec3, scale: f32, bias: f32, invert: bool) -> Self {
        self.enable_slope_limits = true;
        self.slope_axis = axis;
        self.slope_scale = scale;
        self.slope_bias = bias;
        self.invert_slope = invert;
        self
    }

    /// Radius of the rasterized brush shape
    pub fn radius(&self) -> f32 {
        (self.inner_radius + self.outer_radius) * 0.5
    }

    /// Weight added by one dab
    pub fn dab_value(&self) -> u8 {
        (self.strength.clamp(0.0, 100.0) / 100.0 * 255.0).round() as u8
    }
}
