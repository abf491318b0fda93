//! Device states and constant buffers owned by a landscape

use bytemuck::{Pod, Zeroable};

use crate::core::types::Result;
use crate::core::Error;
use crate::paint::{LayerShaderData, PaintDrawStates};
use crate::render::{
    AddressMode, BlendDesc, CompareFunction, CullMode, DepthStencilDesc, FilterMode, RasterizerDesc,
    ResourceHandle, ResourceProvider, SamplerDesc,
};
use super::procedural::ProceduralConstants;

/// Landscape-wide shader constants (48 bytes)
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TerrainBaseData {
    pub color: [f32; 4],
    /// World extent (x, y, z) and 1 / texels per block edge
    pub terrain_size: [f32; 4],
    pub terrain_offset: [f32; 3],
    /// World units per height sample step
    pub height_scale: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct LandscapeStates {
    pub depth_fill_depth: ResourceHandle,
    pub depth_fill_blend: ResourceHandle,
    pub painted_depth: ResourceHandle,
    pub opaque_blend: ResourceHandle,
    pub additive_blend: ResourceHandle,
    pub procedural_depth: ResourceHandle,
    pub post_process_depth: ResourceHandle,
    pub rasterizer: ResourceHandle,
    pub wire_rasterizer: ResourceHandle,
    pub blend_map_sampler: ResourceHandle,
    pub material_sampler: ResourceHandle,
    pub base_constants: ResourceHandle,
    pub layer_constants: ResourceHandle,
    pub procedural_constants: ResourceHandle,
    pub default_color: Option<ResourceHandle>,
    pub default_normal: Option<ResourceHandle>,
}

impl LandscapeStates {
    /// Create every state object; nothing is left allocated on failure
    pub fn create(provider: &mut dyn ResourceProvider) -> Result<Self> {
        let mut created = Vec::new();
        match Self::build(provider, &mut created) {
            Ok(states) => {
                log::debug!("Created {} landscape render states", created.len());
                Ok(states)
            }
            Err(e) => {
                for handle in created {
                    provider.release(handle);
                }
                Err(e)
            }
        }
    }

    fn build(provider: &mut dyn ResourceProvider, created: &mut Vec<ResourceHandle>) -> Result<Self> {
        let mut track = |handle: Option<ResourceHandle>, what: &str| -> Result<ResourceHandle> {
            let handle = handle.ok_or_else(|| Error::Resource(format!("landscape {}", what)))?;
            created.push(handle);
            Ok(handle)
        };

        let depth = |test: bool, write: bool, compare: CompareFunction, stencil: bool| DepthStencilDesc {
            depth_test: test,
            depth_write: write,
            compare,
            stencil_write: stencil,
        };

        Ok(Self {
            depth_fill_depth: track(
                provider.create_depth_stencil_state(&depth(true, true, CompareFunction::LessEqual, false)),
                "depth fill depth state",
            )?,
            depth_fill_blend: track(provider.create_blend_state(&BlendDesc::COLOR_DISABLED), "depth fill blend state")?,
            painted_depth: track(
                provider.create_depth_stencil_state(&depth(true, true, CompareFunction::LessEqual, true)),
                "painted depth state",
            )?,
            opaque_blend: track(provider.create_blend_state(&BlendDesc::OPAQUE), "opaque blend state")?,
            additive_blend: track(provider.create_blend_state(&BlendDesc::ADDITIVE), "additive blend state")?,
            procedural_depth: track(
                provider.create_depth_stencil_state(&depth(true, false, CompareFunction::Equal, false)),
                "procedural depth state",
            )?,
            post_process_depth: track(
                provider.create_depth_stencil_state(&depth(false, false, CompareFunction::Always, false)),
                "post-process depth state",
            )?,
            rasterizer: track(
                provider.create_rasterizer_state(&RasterizerDesc { cull: CullMode::Back, wireframe: false }),
                "rasterizer state",
            )?,
            wire_rasterizer: track(
                provider.create_rasterizer_state(&RasterizerDesc { cull: CullMode::None, wireframe: true }),
                "wireframe rasterizer state",
            )?,
            blend_map_sampler: track(
                provider.create_sampler_state(&SamplerDesc { address: AddressMode::Clamp, filter: FilterMode::Linear }),
                "blend map sampler",
            )?,
            material_sampler: track(
                provider.create_sampler_state(&SamplerDesc { address: AddressMode::Wrap, filter: FilterMode::Anisotropic }),
                "material sampler",
            )?,
            base_constants: track(
                provider.create_constant_buffer(std::mem::size_of::<TerrainBaseData>()),
                "base constant buffer",
            )?,
            layer_constants: track(
                provider.create_constant_buffer(std::mem::size_of::<LayerShaderData>()),
                "layer constant buffer",
            )?,
            procedural_constants: track(
                provider.create_constant_buffer(std::mem::size_of::<ProceduralConstants>()),
                "procedural constant buffer",
            )?,
            default_color: None,
            default_normal: None,
        })
    }

    /// Host textures bound to layer slots without their own maps
    pub fn with_default_textures(mut self, color: Option<ResourceHandle>, normal: Option<ResourceHandle>) -> Self {
        self.default_color = color;
        self.default_normal = normal;
        self
    }

    pub fn paint_states(&self) -> PaintDrawStates {
        PaintDrawStates {
            opaque_blend: self.opaque_blend,
            additive_blend: self.additive_blend,
            blend_map_sampler: self.blend_map_sampler,
            material_sampler: self.material_sampler,
            default_color: self.default_color,
            default_normal: self.default_normal,
            layer_constants: self.layer_constants,
        }
    }

    fn handles(&self) -> [ResourceHandle; 14] {
        [
            self.depth_fill_depth,
            self.depth_fill_blend,
            self.painted_depth,
            self.opaque_blend,
            self.additive_blend,
            self.procedural_depth,
            self.post_process_depth,
            self.rasterizer,
            self.wire_rasterizer,
            self.blend_map_sampler,
            self.material_sampler,
            self.base_constants,
            self.layer_constants,
            self.procedural_constants,
        ]
    }

    /// Release owned states; host default textures are left alone
    pub fn release(&self, provider: &mut dyn ResourceProvider) {
        for handle in self.handles() {
            provider.release(handle);
        }
    }
}
