//! Per-block paint state and layer packing
//!
//! Every terrain block owns a `LandscapeTextureData`: a set of weight layers
//! over the block's blend map, packed into RGBA combined textures and drawn in
//! one pass per [`RenderBatch`].
//!
//! Texel coordinates come in two flavours:
//! - *stored*: `0..w+2` by `0..h+2`, including a 1-texel border copied from
//!   the neighbouring blocks so filtering is seamless;
//! - *global*: landscape-wide blend map coordinates, where the active texel
//!   (1, 1) of block `(bx, by)` is `(bx * w, by * h)`.
//!
//! A stroke accumulates brush coverage into the painting layer's paint
//! buffer, previews it into the combined textures, and commits the previewed
//! channel values back into the layer weights at `end_paint`.

use std::collections::VecDeque;

use bytemuck::{Pod, Zeroable};

use crate::core::types::{Result, Vec2};
use crate::core::Error;
use crate::math::{Rect, Size};
use crate::render::{
    write_texture_rect, PermutationArg, RenderDriver, ResourceHandle, ResourceProvider, TextureDesc,
    TextureFormat,
};
use super::filter::{attenuation, box_filter, kernel_half_width, PaintSnapshot, SurfaceSampler};
use super::layer::{CombinedBlendTexture, PaintLayer, RenderBatch};
use super::params::{MaterialHandle, PaintParams};

/// Layers drawn by a single pass
pub const MAX_LAYERS_PER_PASS: usize = 4;
/// Layers per pass that may carry a normal map
pub const MAX_BUMP_LAYERS_PER_PASS: usize = 2;

/// First sampler slot for layer color maps; normal maps follow
const COLOR_SAMPLER_SLOT: u32 = 1;
const NORMAL_SAMPLER_SLOT: u32 = COLOR_SAMPLER_SLOT + MAX_LAYERS_PER_PASS as u32;

/// Texture transform of one layer slot
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct LayerTransform {
    /// Row-major 2x2 scale-rotation matrix
    pub uv_matrix: [f32; 4],
    pub offset: [f32; 2],
    pub base_scale: [f32; 2],
}

/// Per-pass layer constants (128 bytes)
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct LayerShaderData {
    pub layers: [LayerTransform; MAX_LAYERS_PER_PASS],
}

/// Device states shared by every painted block
#[derive(Clone, Copy, Debug)]
pub struct PaintDrawStates {
    pub opaque_blend: ResourceHandle,
    pub additive_blend: ResourceHandle,
    pub blend_map_sampler: ResourceHandle,
    pub material_sampler: ResourceHandle,
    pub default_color: Option<ResourceHandle>,
    pub default_normal: Option<ResourceHandle>,
    pub layer_constants: ResourceHandle,
}

/// Persistence work produced by a finished stroke
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaintCommit {
    /// Indices of layers whose weights changed
    pub modified_layers: Vec<usize>,
    /// Database ids of layers that no longer cover any texel
    pub removed_layer_ids: Vec<i64>,
}

impl PaintCommit {
    pub fn is_empty(&self) -> bool {
        self.modified_layers.is_empty() && self.removed_layer_ids.is_empty()
    }
}

#[derive(Clone, Debug)]
struct PaintStroke {
    layer: usize,
    params: PaintParams,
}

/// Paint layers, combined textures and render batches of one block
#[derive(Debug)]
pub struct LandscapeTextureData {
    blend_map_size: Size,
    grid_origin: (i32, i32),
    world_min: Vec2,
    world_max: Vec2,
    layers: Vec<PaintLayer>,
    textures: Vec<CombinedBlendTexture>,
    batches: Vec<RenderBatch>,
    stroke: Option<PaintStroke>,
    current_pass: usize,
    pending_release: Vec<ResourceHandle>,
}

impl LandscapeTextureData {
    /// `world_min`/`world_max` bound the block's active area in XZ
    pub fn new(blend_map_size: Size, grid_origin: (i32, i32), world_min: Vec2, world_max: Vec2) -> Self {
        Self {
            blend_map_size,
            grid_origin,
            world_min,
            world_max,
            layers: Vec::new(),
            textures: Vec::new(),
            batches: Vec::new(),
            stroke: None,
            current_pass: 0,
            pending_release: Vec::new(),
        }
    }

    pub fn blend_map_size(&self) -> Size {
        self.blend_map_size
    }

    pub fn stored_size(&self) -> Size {
        Size::new(self.blend_map_size.width + 2, self.blend_map_size.height + 2)
    }

    pub fn stored_rect(&self) -> Rect {
        Rect::from_size(self.stored_size())
    }

    /// Active region in stored coordinates
    pub fn active_rect(&self) -> Rect {
        Rect::new(
            1,
            1,
            self.blend_map_size.width as i32 + 1,
            self.blend_map_size.height as i32 + 1,
        )
    }

    /// Active region in global blend-map coordinates
    pub fn blend_map_area(&self) -> Rect {
        self.stored_to_global(self.active_rect())
    }

    /// World XZ bounds of the stored blend map, border included
    pub fn blend_map_world_area(&self) -> (Vec2, Vec2) {
        let texel = self.texel_size();
        (self.world_min - texel, self.world_max + texel)
    }

    /// Move the block's active area after the landscape is rescaled
    pub fn set_world_bounds(&mut self, world_min: Vec2, world_max: Vec2) {
        self.world_min = world_min;
        self.world_max = world_max;
    }

    pub fn texel_size(&self) -> Vec2 {
        let size = Vec2::new(self.blend_map_size.width as f32, self.blend_map_size.height as f32);
        (self.world_max - self.world_min) / size.max(Vec2::ONE)
    }

    /// World XZ of a stored texel's center
    pub fn texel_center(&self, x: i32, y: i32) -> Vec2 {
        texel_center(self.world_min, self.texel_size(), x, y)
    }

    pub fn stored_to_global(&self, rect: Rect) -> Rect {
        rect.offset(self.grid_origin.0 - 1, self.grid_origin.1 - 1)
    }

    /// Stored texels whose centers fall inside a world XZ box
    pub fn paint_rectangle(&self, min: Vec2, max: Vec2) -> Option<Rect> {
        let texel = self.texel_size();
        let lo = (min - self.world_min) / texel + 0.5;
        let hi = (max - self.world_min) / texel + 0.5;
        let rect = Rect::new(
            lo.x.ceil() as i32,
            lo.y.ceil() as i32,
            hi.x.floor() as i32 + 1,
            hi.y.floor() as i32 + 1,
        );
        rect.intersect(&self.stored_rect())
    }

    pub fn layers(&self) -> &[PaintLayer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&PaintLayer> {
        self.layers.get(index)
    }

    pub fn textures(&self) -> &[CombinedBlendTexture] {
        &self.textures
    }

    pub fn batches(&self) -> &[RenderBatch] {
        &self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.erase)
    }

    pub fn is_painting(&self) -> bool {
        self.stroke.is_some()
    }

    pub fn find_layer(&self, material_id: u32) -> Option<usize> {
        self.layers.iter().position(|l| l.material_id() == Some(material_id))
    }

    /// Add a layer restored from storage. Call [`Self::optimize_layers`]
    /// once every layer is in place.
    pub fn add_layer(&mut self, material: MaterialHandle, weights: Vec<u8>, layer_id: i64) -> Result<usize> {
        if weights.len() != self.stored_size().area() {
            return Err(Error::Persistence(format!(
                "layer {} has {} weights, expected {}",
                layer_id,
                weights.len(),
                self.stored_size().area()
            )));
        }
        let mut layer = PaintLayer::with_weights(Some(material), weights);
        layer.layer_id = layer_id;
        self.layers.push(layer);
        Ok(self.layers.len() - 1)
    }

    /// Record the database id of a saved layer and clear its modified flag
    pub fn mark_saved(&mut self, index: usize, layer_id: i64) {
        if let Some(layer) = self.layers.get_mut(index) {
            layer.layer_id = layer_id;
            layer.modified = false;
        }
    }

    /// Start a stroke with `material`, or an erase stroke when `params.erase`
    pub fn begin_paint(&mut self, material: Option<MaterialHandle>, params: PaintParams) -> bool {
        if self.stroke.is_some() {
            return false;
        }
        let texel_count = self.stored_size().area();

        let layer = if params.erase {
            self.layers.push(PaintLayer::erase_layer(texel_count));
            self.layers.len() - 1
        } else {
            let Some(material) = material else {
                return false;
            };
            match self.find_layer(material.id) {
                Some(index) => index,
                None => {
                    self.layers.push(PaintLayer::new(material, texel_count));
                    self.optimize_layers();
                    self.layers.len() - 1
                }
            }
        };

        self.layers[layer].paint_buffer = Some(vec![0; texel_count]);
        self.stroke = Some(PaintStroke { layer, params });
        true
    }

    /// Stamp a circular dab at world XZ
    pub fn paint(&mut self, center: Vec2) -> bool {
        self.paint_line(center, center)
    }

    /// Stamp a capsule from `from` to `to`; each texel is touched once
    pub fn paint_line(&mut self, from: Vec2, to: Vec2) -> bool {
        let Some(stroke) = &self.stroke else {
            return false;
        };
        let radius = stroke.params.radius();
        let value = stroke.params.dab_value();
        let texel = self.texel_size();
        let half = kernel_half_width(&stroke.params, texel) as f32;
        let layer = stroke.layer;

        let lo = from.min(to) - radius;
        let hi = from.max(to) + radius;
        let Some(reach) = self.paint_rectangle(lo - texel * half, hi + texel * half) else {
            return false;
        };

        if let Some(shape) = self.paint_rectangle(lo, hi) {
            let stride = self.stored_size().width as usize;
            let world_min = self.world_min;
            let buffer = self.layers[layer].paint_buffer.get_or_insert_with(Vec::new);
            for (x, y) in shape.cells() {
                let p = texel_center(world_min, texel, x, y);
                if distance_to_segment(p, from, to) <= radius {
                    let i = x as usize + y as usize * stride;
                    buffer[i] = buffer[i].saturating_add(value);
                }
            }
        }

        self.layers[layer].mark_dirty(reach);
        true
    }

    /// Overwrite one stored texel of the active stroke's coverage
    pub fn set_pixel(&mut self, x: i32, y: i32, value: u8) -> bool {
        let Some(stroke) = &self.stroke else {
            return false;
        };
        if !self.stored_rect().contains(x, y) {
            return false;
        }
        let half = kernel_half_width(&stroke.params, self.texel_size()) as i32;
        let layer = stroke.layer;
        let i = x as usize + y as usize * self.stored_size().width as usize;
        let Some(buffer) = self.layers[layer].paint_buffer.as_mut() else {
            return false;
        };
        buffer[i] = value;
        self.layers[layer].mark_dirty(Rect::new(x, y, x + 1, y + 1).inflate(half));
        true
    }

    /// Coverage of the active stroke at a stored texel
    pub fn paint_value(&self, x: i32, y: i32) -> u8 {
        let Some(stroke) = &self.stroke else {
            return 0;
        };
        if !self.stored_rect().contains(x, y) {
            return 0;
        }
        let i = x as usize + y as usize * self.stored_size().width as usize;
        self.layers[stroke.layer]
            .paint_buffer
            .as_ref()
            .map_or(0, |b| b[i])
    }

    /// Copy active-region coverage into a global snapshot buffer
    pub fn copy_paint_into(&self, rect: Rect, out: &mut [u8]) {
        let Some(overlap) = self.blend_map_area().intersect(&rect) else {
            return;
        };
        let width = rect.width() as usize;
        for (gx, gy) in overlap.cells() {
            let sx = gx - self.grid_origin.0 + 1;
            let sy = gy - self.grid_origin.1 + 1;
            out[(gx - rect.left) as usize + (gy - rect.top) as usize * width] = self.paint_value(sx, sy);
        }
    }

    /// Global rectangle a preview needs coverage for, if anything is pending
    pub fn paint_snapshot_rect(&self) -> Option<Rect> {
        let stroke = self.stroke.as_ref()?;
        let dirty = self.layers[stroke.layer].dirty?;
        let region = dirty.intersect(&self.stored_rect())?;
        let half = kernel_half_width(&stroke.params, self.texel_size()) as i32;
        Some(self.stored_to_global(region).inflate(half))
    }

    /// Filter pending coverage and write previewed weights into the combined
    /// textures. `snapshot` must cover [`Self::paint_snapshot_rect`].
    pub fn update_paint_preview(&mut self, snapshot: &PaintSnapshot, surface: &dyn SurfaceSampler) -> bool {
        let Some(stroke) = self.stroke.clone() else {
            return false;
        };
        let Some(dirty) = self.layers[stroke.layer].dirty.take() else {
            return false;
        };
        let Some(region) = dirty.intersect(&self.stored_rect()) else {
            return false;
        };

        let half = kernel_half_width(&stroke.params, self.texel_size());
        let filtered = box_filter(snapshot, self.stored_to_global(region), half);
        let stride = self.stored_size().width as usize;

        for ((x, y), coverage) in region.cells().zip(filtered) {
            if coverage == 0 {
                continue;
            }
            let center = self.texel_center(x, y);
            let weight = attenuation(&stroke.params, surface, center.x, center.y);
            let delta = (coverage as f32 * weight).round().min(255.0) as u8;
            if delta == 0 {
                continue;
            }
            self.apply_texel(stroke.layer, x as usize + y as usize * stride, delta, stroke.params.erase);
        }

        for layer in self.layers.iter_mut().filter(|l| !l.erase) {
            layer.mark_final_dirty(region);
        }
        for texture in &mut self.textures {
            texture.mark_dirty(region);
        }
        true
    }

    /// Blend one texel against the committed weights. A painting layer takes
    /// priority and other layers are scaled down proportionally to fit the
    /// remaining budget; an erase removes `delta` from the other layers in
    /// proportion to their share.
    fn apply_texel(&mut self, paint_layer: usize, index: usize, delta: u8, erase: bool) {
        let others = |i: usize, l: &PaintLayer| i != paint_layer && !l.erase;
        let sum: u32 = self
            .layers
            .iter()
            .enumerate()
            .filter(|(i, l)| others(*i, *l))
            .map(|(_, l)| l.weights[index] as u32)
            .sum();

        let target = self.layers[paint_layer].weights[index].saturating_add(delta);
        let budget = 255 - target as u32;
        let removed = (delta as u32).min(sum);

        for (i, layer) in self.layers.iter().enumerate() {
            let Some(texture) = layer.texture else {
                continue;
            };
            let weight = layer.weights[index] as u32;
            let value = if i == paint_layer {
                if erase {
                    continue;
                }
                target
            } else if !others(i, layer) || sum == 0 {
                continue;
            } else if erase {
                (weight * (sum - removed) / sum) as u8
            } else if sum > budget {
                (weight * budget / sum) as u8
            } else {
                layer.weights[index]
            };
            self.textures[texture].set_channel(index, layer.channel, value);
        }
    }

    /// Commit previewed weights, drop empty layers and repack if needed
    pub fn end_paint(&mut self) -> Option<PaintCommit> {
        let stroke = self.stroke.take()?;
        let mut commit = PaintCommit::default();
        let stride = self.stored_size().width as usize;

        let textures = &self.textures;
        for layer in self.layers.iter_mut() {
            layer.paint_buffer = None;
            layer.dirty = None;
            if layer.erase {
                continue;
            }
            let (Some(region), Some(texture)) = (layer.final_dirty.take(), layer.texture) else {
                continue;
            };
            let mut changed = false;
            for (x, y) in region.cells() {
                let i = x as usize + y as usize * stride;
                let value = textures[texture].channel(i, layer.channel);
                if layer.weights[i] != value {
                    layer.weights[i] = value;
                    changed = true;
                }
            }
            if changed {
                layer.recount_references();
                layer.modified = true;
            }
        }

        let mut removed_material_layer = false;
        self.layers.retain(|layer| {
            let keep = !layer.erase && layer.reference_count > 0;
            if !keep {
                removed_material_layer |= !layer.erase;
                if layer.layer_id > 0 {
                    commit.removed_layer_ids.push(layer.layer_id);
                }
            }
            keep
        });
        if removed_material_layer {
            self.optimize_layers();
        }

        commit.modified_layers = self
            .layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.modified)
            .map(|(i, _)| i)
            .collect();

        log::debug!(
            "Paint stroke committed on layer {} ({} modified, {} removed)",
            stroke.layer,
            commit.modified_layers.len(),
            commit.removed_layer_ids.len()
        );
        Some(commit)
    }

    /// Pack layers into batches and combined-texture channels.
    ///
    /// Each batch takes up to two bump-mapped layers, then fills up to four
    /// with plain layers. Batches of at most two layers share a texture in
    /// pairs, the second one reading the blue/alpha channels. Returns whether
    /// any layer changed texture or channel.
    pub fn optimize_layers(&mut self) -> bool {
        let (bump, plain): (Vec<usize>, Vec<usize>) = (0..self.layers.len())
            .filter(|i| !self.layers[*i].erase)
            .partition(|i| self.layers[*i].has_normal_map());
        let mut bump = VecDeque::from(bump);
        let mut plain = VecDeque::from(plain);

        let mut groups: Vec<Vec<usize>> = Vec::new();
        loop {
            let mut group = Vec::with_capacity(MAX_LAYERS_PER_PASS);
            while group.len() < MAX_BUMP_LAYERS_PER_PASS {
                match bump.pop_front() {
                    Some(i) => group.push(i),
                    None => break,
                }
            }
            while group.len() < MAX_LAYERS_PER_PASS {
                match plain.pop_front() {
                    Some(i) => group.push(i),
                    None => break,
                }
            }
            if group.is_empty() {
                break;
            }
            groups.push(group);
        }

        let mut assignment: Vec<Option<(usize, usize)>> = vec![None; self.layers.len()];
        let mut batches = Vec::with_capacity(groups.len());
        let mut texture_count = 0;
        let mut half_open: Option<usize> = None;
        for layers in groups {
            let (texture, base, swizzle) = if layers.len() <= 2 {
                match half_open.take() {
                    Some(t) => (t, 2, true),
                    None => {
                        half_open = Some(texture_count);
                        texture_count += 1;
                        (texture_count - 1, 0, false)
                    }
                }
            } else {
                texture_count += 1;
                (texture_count - 1, 0, false)
            };
            for (slot, layer) in layers.iter().enumerate() {
                assignment[*layer] = Some((texture, base + slot));
            }
            batches.push(RenderBatch { layers, texture, swizzle });
        }

        let texel_count = self.stored_size().area();
        let full = self.stored_rect();
        while self.textures.len() < texture_count {
            self.textures.push(CombinedBlendTexture::new(texel_count, full));
        }
        while self.textures.len() > texture_count {
            if let Some(handle) = self.textures.pop().and_then(|t| t.handle) {
                self.pending_release.push(handle);
            }
        }

        let mut changed = false;
        let mut masks = vec![0u8; texture_count];
        for (layer, slot) in self.layers.iter_mut().zip(&assignment) {
            if let Some((texture, channel)) = *slot {
                masks[texture] |= 1 << channel;
            }
            if layer.assignment() == *slot {
                continue;
            }
            changed = true;
            layer.texture = slot.map(|(t, _)| t);
            layer.channel = slot.map_or(0, |(_, c)| c);
            if let Some((texture, channel)) = *slot {
                let target = &mut self.textures[texture];
                for (i, w) in layer.weights.iter().enumerate() {
                    target.set_channel(i, channel, *w);
                }
                target.mark_dirty(full);
            }
        }

        for (texture, mask) in self.textures.iter_mut().zip(masks) {
            let released = texture.channel_mask & !mask;
            for channel in (0..4).filter(|c| released & (1 << c) != 0) {
                for i in 0..texel_count {
                    texture.set_channel(i, channel, 0);
                }
                texture.mark_dirty(full);
            }
            texture.channel_mask = mask;
        }

        self.batches = batches;
        if changed {
            log::debug!(
                "Packed {} paint layers into {} batches over {} textures",
                self.layers.len(),
                self.batches.len(),
                self.textures.len()
            );
        }
        changed
    }

    /// Create missing textures and upload dirty regions
    pub fn upload(&mut self, provider: &mut dyn ResourceProvider) -> Result<()> {
        for handle in self.pending_release.drain(..) {
            provider.release(handle);
        }

        let stored = self.stored_size();
        let full = self.stored_rect();
        for texture in &mut self.textures {
            let handle = match texture.handle {
                Some(handle) => handle,
                None => {
                    let desc = TextureDesc {
                        width: stored.width,
                        height: stored.height,
                        format: TextureFormat::Rgba8,
                        dynamic: true,
                    };
                    let handle = provider
                        .create_texture(&desc)
                        .ok_or_else(|| Error::Resource("combined blend texture".into()))?;
                    texture.handle = Some(handle);
                    texture.dirty = Some(full);
                    handle
                }
            };

            let Some(rect) = texture.dirty.take() else {
                continue;
            };
            let Some(rect) = rect.intersect(&full) else {
                continue;
            };
            let stride = stored.width as usize;
            let mut texels = Vec::with_capacity(rect.size().area() * 4);
            for y in rect.top..rect.bottom {
                let start = (rect.left as usize + y as usize * stride) * 4;
                let end = (rect.right as usize + y as usize * stride) * 4;
                texels.extend_from_slice(&texture.data[start..end]);
            }
            if !write_texture_rect(provider, handle, rect, 4, &texels) {
                texture.dirty = Some(rect);
                return Err(Error::Resource("blend texture upload".into()));
            }
        }
        Ok(())
    }

    pub fn release(&mut self, provider: &mut dyn ResourceProvider) {
        for handle in self.pending_release.drain(..) {
            provider.release(handle);
        }
        let full = self.stored_rect();
        for texture in &mut self.textures {
            if let Some(handle) = texture.handle.take() {
                provider.release(handle);
            }
            texture.dirty = Some(full);
        }
    }

    /// Reset pass iteration; false when there is nothing to draw
    pub fn begin_draw(&mut self) -> bool {
        self.current_pass = 0;
        !self.batches.is_empty()
    }

    /// Bind blend state, samplers, constants and the pixel shader of the
    /// current pass. Returns `Ok(false)` once every pass has been drawn.
    pub fn begin_draw_pass(&mut self, driver: &mut dyn RenderDriver, states: &PaintDrawStates) -> Result<bool> {
        let Some(batch) = self.batches.get(self.current_pass) else {
            return Ok(false);
        };
        let Some(texture) = self.textures.get(batch.texture) else {
            return Ok(false);
        };

        driver.set_blend_state(if self.current_pass == 0 {
            states.opaque_blend
        } else {
            states.additive_blend
        });
        driver.set_sampler(0, states.blend_map_sampler, texture.handle);

        let mut constants = LayerShaderData::default();
        let mut args = vec![
            PermutationArg::Int(batch.layer_count() as i32),
            PermutationArg::Bool(batch.swizzle),
        ];
        let mut normals = [false; MAX_BUMP_LAYERS_PER_PASS];

        for slot in 0..MAX_LAYERS_PER_PASS {
            let material = batch
                .layers
                .get(slot)
                .and_then(|i| self.layers[*i].material.as_ref());
            let color = material.and_then(|m| m.color_map).or(states.default_color);
            driver.set_sampler(COLOR_SAMPLER_SLOT + slot as u32, states.material_sampler, color);

            if let Some(material) = material {
                let (sin, cos) = material.rotation.sin_cos();
                constants.layers[slot] = LayerTransform {
                    uv_matrix: [
                        cos * material.scale.x,
                        -sin * material.scale.y,
                        sin * material.scale.x,
                        cos * material.scale.y,
                    ],
                    offset: material.offset.to_array(),
                    base_scale: material.base_scale.to_array(),
                };
                if slot < MAX_BUMP_LAYERS_PER_PASS && material.normal_map.is_some() {
                    normals[slot] = true;
                    driver.set_sampler(NORMAL_SAMPLER_SLOT + slot as u32, states.material_sampler, material.normal_map);
                }
            }
            args.push(PermutationArg::Bool(material.is_some_and(|m| m.tiling_reduction)));
        }

        for (slot, has_normal) in normals.iter().enumerate() {
            if !has_normal {
                driver.set_sampler(NORMAL_SAMPLER_SLOT + slot as u32, states.material_sampler, states.default_normal);
            }
            args.push(PermutationArg::Bool(*has_normal));
        }

        if !driver.update_constant_buffer(states.layer_constants, bytemuck::bytes_of(&constants)) {
            return Err(Error::Render("layer constants update failed".into()));
        }
        driver.set_constant_buffer_auto(states.layer_constants);

        if !driver.select_pixel_shader("TerrainPainted", &args) {
            return Err(Error::Render("no TerrainPainted pixel shader permutation".into()));
        }
        Ok(true)
    }

    /// Advance to the next pass; false after the last one
    pub fn end_draw_pass(&mut self) -> bool {
        self.current_pass += 1;
        self.current_pass < self.batches.len()
    }
}

fn texel_center(world_min: Vec2, texel: Vec2, x: i32, y: i32) -> Vec2 {
    world_min + (Vec2::new((x - 1) as f32, (y - 1) as f32) + 0.5) * texel
}

fn distance_to_segment(p: Vec2, a: Vec2, b: Vec2) -> f32 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq <= f32::EPSILON {
        return p.distance(a);
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    p.distance(a + ab * t)
}
