//! Procedural layers and their per-block draw batches

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::core::types::{Result, Vec3};
use crate::math::Aabb;
use crate::paint::{MaterialHandle, MaterialLibrary};
use crate::persistence::{ProceduralLayerRow, RowId};
use crate::terrain::TerrainBlock;

/// Layers a single procedural pass can blend
pub const MAX_PROCEDURAL_LAYERS_PER_PASS: usize = 3;

/// Material applied by height and slope rules rather than painted weights
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProceduralLayer {
    /// Database id, 0 until saved
    #[serde(skip)]
    pub layer_id: RowId,
    pub name: String,
    #[serde(skip)]
    pub material: Option<MaterialHandle>,
    pub material_id: u32,
    pub enable_height: bool,
    pub min_height: f32,
    pub max_height: f32,
    /// World distance over which the layer fades in and out around the height range
    pub height_attenuation_band: f32,
    pub slope_axis: Vec3,
    pub slope_scale: f32,
    pub slope_bias: f32,
    pub invert_slope: bool,
    pub weight: f32,
}

impl Default for ProceduralLayer {
    fn default() -> Self {
        Self {
            layer_id: 0,
            name: String::new(),
            material: None,
            material_id: 0,
            enable_height: false,
            min_height: 0.0,
            max_height: 0.0,
            height_attenuation_band: 0.0,
            slope_axis: Vec3::Y,
            slope_scale: 0.0,
            slope_bias: 1.0,
            invert_slope: false,
            weight: 1.0,
        }
    }
}

impl ProceduralLayer {
    pub fn new(name: impl Into<String>, material: MaterialHandle) -> Self {
        Self {
            name: name.into(),
            material_id: material.id,
            material: Some(material),
            ..Default::default()
        }
    }

    pub fn with_height_range(mut self, min: f32, max: f32, band: f32) -> Self {
        self.enable_height = true;
        self.min_height = min;
        self.max_height = max;
        self.height_attenuation_band = band.max(0.0);
        self
    }

    pub fn with_slope(mut self, axis: Vec3, scale: f32, bias: f32, invert: bool) -> Self {
        self.slope_axis = axis.normalize_or(Vec3::Y);
        self.slope_scale = scale;
        self.slope_bias = bias;
        self.invert_slope = invert;
        self
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    /// Whether any part of a block's height range can receive this layer
    pub fn applies_to(&self, bounds: &Aabb) -> bool {
        if self.weight <= 0.0 {
            return false;
        }
        if !self.enable_height {
            return true;
        }
        let band = self.height_attenuation_band;
        bounds.max.y >= self.min_height - band && bounds.min.y <= self.max_height + band
    }

    /// Shader constants of this layer
    pub fn shader_data(&self) -> ProceduralShaderData {
        let height_params = if self.enable_height {
            let center = (self.min_height + self.max_height) * 0.5;
            let fade = self.height_attenuation_band.max(1e-3);
            [center, -1.0 / fade, ((self.max_height - center) + fade) / fade]
        } else {
            // Saturates to full weight at every height
            [0.0, 0.0, 1.0]
        };
        let (scale, bias) = if self.invert_slope {
            (-self.slope_scale, 1.0 - self.slope_bias)
        } else {
            (self.slope_scale, self.slope_bias)
        };
        ProceduralShaderData {
            height_params,
            weight: self.weight,
            slope_axis: self.slope_axis.to_array(),
            _pad0: 0.0,
            slope_params: [scale, bias],
            _pad1: [0.0; 2],
        }
    }

    pub fn to_row(&self) -> Result<ProceduralLayerRow> {
        Ok(ProceduralLayerRow {
            id: self.layer_id,
            material_id: self.material_id,
            params: serde_json::to_string(self)?,
            ..Default::default()
        })
    }

    /// Rebuild a stored layer; an unknown material leaves the layer without one
    pub fn from_row(row: &ProceduralLayerRow, materials: &MaterialLibrary) -> Result<Self> {
        let mut layer: Self = serde_json::from_str(&row.params)?;
        layer.layer_id = row.id;
        layer.material_id = row.material_id;
        layer.material = materials.get(row.material_id);
        if layer.material.is_none() {
            log::warn!("Procedural layer '{}' references unknown material {}", layer.name, row.material_id);
        }
        Ok(layer)
    }
}

/// One layer slot of the procedural constant buffer (48 bytes)
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ProceduralShaderData {
    /// Center, -1/fade, ((max - center) + fade) / fade
    pub height_params: [f32; 3],
    pub weight: f32,
    pub slope_axis: [f32; 3],
    pub _pad0: f32,
    /// Scale, bias
    pub slope_params: [f32; 2],
    pub _pad1: [f32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct ProceduralConstants {
    pub layers: [ProceduralShaderData; MAX_PROCEDURAL_LAYERS_PER_PASS],
}

/// Blocks that draw the same set of procedural layers in one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProceduralDrawBatch {
    /// Indices into the landscape's procedural layer list
    pub layers: Vec<usize>,
    pub blocks: Vec<u32>,
}

/// Group blocks by the exact set of procedural layers they need, at most
/// three layers per batch, in layer order.
pub fn batch_procedural_draws(layers: &[ProceduralLayer], blocks: &[Option<TerrainBlock>]) -> Vec<ProceduralDrawBatch> {
    let mut batches: Vec<ProceduralDrawBatch> = Vec::new();
    let mut by_key: HashMap<Vec<usize>, usize> = HashMap::new();

    for block in blocks.iter().flatten() {
        let applicable: Vec<usize> = layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.applies_to(block.bounds()))
            .map(|(i, _)| i)
            .collect();

        for key in applicable.chunks(MAX_PROCEDURAL_LAYERS_PER_PASS) {
            let slot = *by_key.entry(key.to_vec()).or_insert_with(|| {
                batches.push(ProceduralDrawBatch { layers: key.to_vec(), blocks: Vec::new() });
                batches.len() - 1
            });
            batches[slot].blocks.push(block.index());
        }
    }

    log::debug!("Batched {} procedural layers into {} draw batches", layers.len(), batches.len());
    batches
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::paint::LayerMaterial;

    fn material(id: u32) -> MaterialHandle {
        Arc::new(LayerMaterial::new(id, format!("m{id}")))
    }

    fn slab(min_y: f32, max_y: f32) -> Aabb {
        Aabb::new(Vec3::new(0.0, min_y, 0.0), Vec3::new(10.0, max_y, 10.0))
    }

    #[test]
    fn test_height_range_with_band() {
        let layer = ProceduralLayer::new("snow", material(1)).with_height_range(100.0, 200.0, 10.0);
        assert!(layer.applies_to(&slab(0.0, 95.0)));
        assert!(!layer.applies_to(&slab(0.0, 85.0)));
        assert!(layer.applies_to(&slab(205.0, 300.0)));
        assert!(!layer.applies_to(&slab(215.0, 300.0)));
        assert!(!layer.clone().with_weight(0.0).applies_to(&slab(120.0, 130.0)));
    }

    #[test]
    fn test_shader_height_params() {
        let layer = ProceduralLayer::new("rock", material(1)).with_height_range(100.0, 200.0, 10.0);
        let data = layer.shader_data();
        assert_eq!(data.height_params, [150.0, -0.1, 6.0]);
        // Weight reaches 1 at the range edge and 0 one band beyond it
        let weight = |h: f32| ((h - 150.0f32).abs() * data.height_params[1] + data.height_params[2]).clamp(0.0, 1.0);
        assert!((weight(200.0) - 1.0).abs() < 1e-5);
        assert!(weight(210.0).abs() < 1e-5);

        let flat = ProceduralLayer::new("grass", material(2)).shader_data();
        assert_eq!(flat.height_params, [0.0, 0.0, 1.0]);
        assert_eq!(std::mem::size_of::<ProceduralConstants>(), 144);
    }

    #[test]
    fn test_row_round_trip_resolves_material() {
        let mut library = MaterialLibrary::new();
        let grass = library.insert(LayerMaterial::new(4, "grass"));
        let layer = ProceduralLayer::new("grass", grass).with_slope(Vec3::Y, 2.0, -0.5, true);

        let mut row = layer.to_row().unwrap();
        row.id = 11;
        let restored = ProceduralLayer::from_row(&row, &library).unwrap();
        assert_eq!(restored.layer_id, 11);
        assert_eq!(restored.material.as_ref().map(|m| m.id), Some(4));
        assert_eq!(ProceduralLayer { layer_id: 0, ..restored }, layer);

        let orphan = ProceduralLayer::from_row(&row, &MaterialLibrary::new()).unwrap();
        assert!(orphan.material.is_none());
    }
}
