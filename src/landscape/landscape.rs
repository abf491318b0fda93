//! Landscape orchestrator
//!
//! Owns the height field, the block grid, the shared LOD table, the culling
//! quadtree and the procedural layer list. Per frame the host calls
//! [`Landscape::compute_visibility`] and then [`Landscape::render_pass`] for
//! each pass it renders; visibility must run first because skirt selection
//! reads the LOD each visible neighbour picked this frame.

use std::time::Duration;

use crate::core::types::{Mat4, Result, Vec2, Vec3};
use crate::core::{Camera, Error, FrameClock};
use crate::culling::{
    HorizonBuffer, LeafInput, ObjectCullTable, ObjectId, ObjectRegistry, OcclusionStats, SpatialQuadtree,
    Traversal, VisibilitySet, VisibilitySink,
};
use crate::math::{Aabb, Frustum, Plane, Ray, Rect, Size};
use crate::paint::{
    LandscapeTextureData, MaterialHandle, MaterialLibrary, PaintDrawStates, PaintParams, PaintSnapshot,
    SurfaceSampler,
};
use crate::persistence::database::{
    decode_colors, decode_heights, decode_weights, encode_colors, encode_heights, encode_weights,
};
use crate::persistence::{
    transaction, BlockRow, LandscapeRow, PaintLayerRow, ProceduralLayerRow, RowId, WorldDatabase,
};
use crate::render::{PermutationArg, RenderDriver, ResourceHandle, ResourceProvider};
use crate::terrain::{BlockGeometry, EdgeSide, HeightField, LodTable, RenderMode, TerrainBlock, TerrainTransform};
use super::config::LandscapeConfig;
use super::procedural::{batch_procedural_draws, ProceduralConstants, ProceduralDrawBatch, ProceduralLayer};
use super::states::{LandscapeStates, TerrainBaseData};

/// First sampler slot of procedural layer color maps
const PROCEDURAL_SAMPLER_SLOT: u32 = 1;
/// Refinement steps once a ray march crosses the surface
const RAY_BISECTION_STEPS: usize = 16;
/// Smallest ray march step, as a fraction of the ray length
const MIN_RAY_STEP: f32 = 1e-4;

/// Passes the landscape can be drawn in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderPass {
    /// Depth-only prepass
    DepthFill,
    /// Depth into a shadow map
    ShadowFill,
    /// Painted layers, then procedural layers
    GBufferFill,
    /// Full-screen terrain post-process
    GBufferPostProcess,
    Wireframe,
}

#[derive(Clone, Debug)]
struct ActiveStroke {
    material: Option<MaterialHandle>,
    params: PaintParams,
}

/// Height field rendered as a grid of LOD blocks
pub struct Landscape {
    config: LandscapeConfig,
    field: HeightField,
    geometry: BlockGeometry,
    layout: Size,
    lod_table: LodTable,
    /// Indexed by `x + y * layout.width`; `None` where no block fits
    blocks: Vec<Option<TerrainBlock>>,
    quadtree: SpatialQuadtree,
    horizon: HorizonBuffer,
    states: LandscapeStates,
    procedural_layers: Vec<ProceduralLayer>,
    procedural_batches: Vec<ProceduralDrawBatch>,
    cull_table: ObjectCullTable,
    objects: ObjectRegistry,
    visible: VisibilitySet,
    occlusion_enabled: bool,
    next_occlusion_test: Duration,
    occlusion_stats: OcclusionStats,
    stroke: Option<ActiveStroke>,
    db_id: RowId,
}

impl Landscape {
    /// Build a landscape from a height field, inserting it into `db` when one
    /// is given. Nothing stays allocated or stored if any step fails.
    pub fn import(
        field: HeightField,
        config: LandscapeConfig,
        provider: &mut dyn ResourceProvider,
        db: Option<&mut dyn WorldDatabase>,
    ) -> Result<Self> {
        let mut landscape = Self::assemble(field, config, provider)?;
        if let Some(db) = db {
            if let Err(e) = landscape.save(db) {
                landscape.release(provider);
                return Err(e);
            }
        }
        log::info!(
            "Imported {}x{} landscape ({} blocks of {} vertices)",
            landscape.layout.width,
            landscape.layout.height,
            landscape.blocks.iter().flatten().count(),
            landscape.config.block_size
        );
        Ok(landscape)
    }

    /// Rebuild a landscape stored by [`Self::import`] or [`Self::save`]
    pub fn load(
        db: &dyn WorldDatabase,
        landscape_id: RowId,
        materials: &MaterialLibrary,
        provider: &mut dyn ResourceProvider,
    ) -> Result<Self> {
        let row = db
            .landscape(landscape_id)?
            .ok_or_else(|| Error::Persistence(format!("no landscape with id {}", landscape_id)))?;
        let config = LandscapeConfig::from_json(&row.config)?;

        let mut field = HeightField::new(Size::new(row.field_width, row.field_height))?;
        let block_rows = db.blocks(landscape_id)?;
        for block in &block_rows {
            let rect = Rect::new(block.left, block.top, block.right, block.bottom);
            field.write_rect(rect, &decode_heights(&block.heights)?)?;
            if !block.colors.is_empty() {
                field.write_color_rect(rect, &decode_colors(&block.colors)?)?;
            }
        }

        let mut landscape = Self::assemble(field, config, provider)?;
        landscape.db_id = landscape_id;
        if let Err(e) = landscape.restore(db, &block_rows, materials, provider) {
            landscape.release(provider);
            return Err(e);
        }
        log::info!(
            "Loaded landscape {} ({} blocks, {} procedural layers)",
            landscape_id,
            block_rows.len(),
            landscape.procedural_layers.len()
        );
        Ok(landscape)
    }

    fn assemble(field: HeightField, config: LandscapeConfig, provider: &mut dyn ResourceProvider) -> Result<Self> {
        config.validate()?;
        let layout = config.layout_for(field.size());
        if layout.is_empty() {
            return Err(Error::Degenerate(format!(
                "{}x{} height field holds no block of {} samples",
                field.width(),
                field.height(),
                config.block_size
            )));
        }

        let geometry = BlockGeometry {
            block_size: config.block_size,
            field_size: field.size(),
            transform: config.transform(field.size()),
            variance_scale: config.variance_scale,
        };
        let mut lod_table = LodTable::new(config.block_size)?;
        let mut blocks = create_blocks(&config, &geometry, layout);

        let states = LandscapeStates::create(provider)?;
        let built = upload_geometry(&mut lod_table, &mut blocks, &field, &geometry, provider)
            .and_then(|_| build_quadtree(&blocks, layout, &geometry));
        let quadtree = match built {
            Ok(tree) => tree,
            Err(e) => {
                log::error!("Landscape construction failed: {}", e);
                for block in blocks.iter_mut().flatten() {
                    block.release(provider);
                }
                lod_table.release(provider);
                states.release(provider);
                return Err(e);
            }
        };

        let cull_table = ObjectCullTable::new(&config.cull_descriptors, config.object_cull_distance);
        Ok(Self {
            config,
            field,
            geometry,
            layout,
            lod_table,
            blocks,
            quadtree,
            horizon: HorizonBuffer::new(1, 1),
            states,
            procedural_layers: Vec::new(),
            procedural_batches: Vec::new(),
            cull_table,
            objects: ObjectRegistry::new(),
            visible: VisibilitySet::new(),
            occlusion_enabled: true,
            next_occlusion_test: Duration::ZERO,
            occlusion_stats: OcclusionStats::default(),
            stroke: None,
            db_id: 0,
        })
    }

    /// Apply stored ids, variance, paint layers and procedural layers
    fn restore(
        &mut self,
        db: &dyn WorldDatabase,
        rows: &[BlockRow],
        materials: &MaterialLibrary,
        provider: &mut dyn ResourceProvider,
    ) -> Result<()> {
        for row in rows {
            let Some(block) = self.blocks.get_mut(row.block_index as usize).and_then(Option::as_mut) else {
                log::warn!("Stored block {} has no slot in the landscape; skipped", row.block_index);
                continue;
            };
            block.set_db_id(row.id);

            let variance = db.variance(row.id)?;
            if variance.len() == block.lod_variance().len() {
                block.set_lod_variance(variance);
            } else {
                log::warn!(
                    "Block {} stores {} variance levels, expected {}; keeping computed values",
                    row.block_index,
                    variance.len(),
                    block.lod_variance().len()
                );
            }

            let data = block.texture_data_mut();
            for layer in db.paint_layers(row.id)? {
                let Some(material) = materials.get(layer.material_id) else {
                    log::warn!("Paint layer {} uses unknown material {}; skipped", layer.id, layer.material_id);
                    continue;
                };
                data.add_layer(material, decode_weights(&layer.weights)?, layer.id)?;
            }
            if !data.layers().is_empty() {
                data.optimize_layers();
                data.upload(provider)?;
            }
        }

        self.procedural_layers = db
            .procedural_layers(self.db_id)?
            .iter()
            .map(|row| ProceduralLayer::from_row(row, materials))
            .collect::<Result<_>>()?;
        self.rebatch_procedural();
        Ok(())
    }

    /// Write the landscape, its blocks, unsaved paint layers and procedural
    /// layers in one transaction, inserting rows that have no id yet
    pub fn save(&mut self, db: &mut dyn WorldDatabase) -> Result<()> {
        let landscape_row = LandscapeRow {
            id: self.db_id,
            config: self.config.to_json()?,
            field_width: self.field.width(),
            field_height: self.field.height(),
        };
        let block_rows = self
            .blocks
            .iter()
            .flatten()
            .map(|b| block_row(&self.field, b).map(|row| (row, b.lod_variance().to_vec())))
            .collect::<Result<Vec<_>>>()?;

        let mut layer_slots = Vec::new();
        let mut layer_rows = Vec::new();
        for block in self.blocks.iter().flatten() {
            for (index, layer) in block.texture_data().layers().iter().enumerate() {
                if layer.is_erase() || (layer.layer_id() > 0 && !layer.is_modified()) {
                    continue;
                }
                layer_slots.push((block.index(), index));
                layer_rows.push(PaintLayerRow {
                    id: layer.layer_id(),
                    block_id: block.db_id(),
                    material_id: layer.material_id().unwrap_or_default(),
                    reference_count: layer.reference_count(),
                    weights: encode_weights(layer.weights()),
                });
            }
        }
        let procedural_rows = self.procedural_rows()?;

        let (landscape_id, block_ids, layer_ids, procedural_ids) = transaction(db, |db| {
            let landscape_id = if landscape_row.id > 0 {
                db.update_landscape(&landscape_row)?;
                landscape_row.id
            } else {
                db.insert_landscape(landscape_row)?
            };

            let mut block_ids = Vec::with_capacity(block_rows.len());
            for (mut row, variance) in block_rows {
                let block_index = row.block_index;
                let id = if row.id > 0 {
                    let id = row.id;
                    db.update_block_data(id, row.heights, row.colors)?;
                    id
                } else {
                    row.landscape_id = landscape_id;
                    db.insert_block(row)?
                };
                db.replace_variance(id, &variance)?;
                block_ids.push((block_index, id));
            }

            let mut layer_ids = Vec::with_capacity(layer_rows.len());
            for ((block_index, _), mut row) in layer_slots.iter().zip(layer_rows) {
                if let Some((_, id)) = block_ids.iter().find(|(index, _)| index == block_index) {
                    row.block_id = *id;
                }
                let id = if row.id > 0 {
                    db.update_paint_layer(&row)?;
                    row.id
                } else {
                    db.insert_paint_layer(row)?
                };
                layer_ids.push(id);
            }

            let procedural_ids = db.replace_procedural_layers(landscape_id, procedural_rows)?;
            Ok((landscape_id, block_ids, layer_ids, procedural_ids))
        })?;

        self.db_id = landscape_id;
        for (index, id) in block_ids {
            if let Some(block) = self.block_mut(index) {
                block.set_db_id(id);
            }
        }
        for ((index, layer), id) in layer_slots.into_iter().zip(layer_ids) {
            if let Some(block) = self.block_mut(index) {
                block.texture_data_mut().mark_saved(layer, id);
            }
        }
        for (layer, id) in self.procedural_layers.iter_mut().zip(procedural_ids) {
            layer.layer_id = id;
        }
        log::info!("Saved landscape {}", self.db_id);
        Ok(())
    }

    fn procedural_rows(&self) -> Result<Vec<ProceduralLayerRow>> {
        self.procedural_layers
            .iter()
            .enumerate()
            .map(|(position, layer)| {
                let mut row = layer.to_row()?;
                row.landscape_id = self.db_id;
                row.position = position as u32;
                Ok(row)
            })
            .collect()
    }

    /// Release every device resource owned by the landscape
    pub fn release(&mut self, provider: &mut dyn ResourceProvider) {
        for block in self.blocks.iter_mut().flatten() {
            block.release(provider);
        }
        self.lod_table.release(provider);
        self.states.release(provider);
        log::debug!("Released landscape {}", self.db_id);
    }

    pub fn config(&self) -> &LandscapeConfig {
        &self.config
    }

    pub fn db_id(&self) -> RowId {
        self.db_id
    }

    pub fn height_field(&self) -> &HeightField {
        &self.field
    }

    /// Edit samples, then report the touched rectangle with
    /// [`Self::height_map_updated`]
    pub fn height_field_mut(&mut self) -> &mut HeightField {
        &mut self.field
    }

    pub fn transform(&self) -> &TerrainTransform {
        &self.geometry.transform
    }

    pub fn layout(&self) -> Size {
        self.layout
    }

    pub fn blocks(&self) -> &[Option<TerrainBlock>] {
        &self.blocks
    }

    pub fn block(&self, index: u32) -> Option<&TerrainBlock> {
        self.blocks.get(index as usize).and_then(Option::as_ref)
    }

    fn block_mut(&mut self, index: u32) -> Option<&mut TerrainBlock> {
        self.blocks.get_mut(index as usize).and_then(Option::as_mut)
    }

    pub fn lod_table(&self) -> &LodTable {
        &self.lod_table
    }

    pub fn quadtree(&self) -> &SpatialQuadtree {
        &self.quadtree
    }

    pub fn states(&self) -> &LandscapeStates {
        &self.states
    }

    /// Host textures bound to layer slots without their own maps
    pub fn set_default_textures(&mut self, color: Option<ResourceHandle>, normal: Option<ResourceHandle>) {
        self.states = self.states.with_default_textures(color, normal);
    }

    /// World bounds of everything the landscape draws
    pub fn bounds(&self) -> Aabb {
        self.quadtree.bounds()
    }

    pub fn terrain_detail(&self) -> f32 {
        self.config.terrain_detail
    }

    pub fn set_terrain_detail(&mut self, detail: f32) {
        self.config.terrain_detail = detail.max(0.0);
    }

    /// Blocks and objects found visible by the last visibility pass
    pub fn visible(&self) -> &VisibilitySet {
        &self.visible
    }

    pub fn occlusion_stats(&self) -> OcclusionStats {
        self.occlusion_stats
    }

    pub fn is_occlusion_enabled(&self) -> bool {
        self.occlusion_enabled
    }

    /// Clock time at which suspended occlusion is tried again
    pub fn next_occlusion_test(&self) -> Duration {
        self.next_occlusion_test
    }

    /// Cull the quadtree against `camera`, report visible blocks and
    /// objects to `sink`, and pick the LOD of every visible block.
    ///
    /// Horizon occlusion is suspended for `retest_delay` whenever it rejects
    /// too small a share of the nodes it tests, and never runs for
    /// orthographic cameras.
    pub fn compute_visibility(
        &mut self,
        camera: &Camera,
        clock: &FrameClock,
        sink: &mut dyn VisibilitySink,
    ) -> OcclusionStats {
        let now = clock.now();
        let view_projection = camera.view_projection();
        let frustum = Frustum::from_view_projection(&view_projection);

        let forward = camera.forward();
        let flat_forward = Vec3::new(forward.x, 0.0, forward.z).normalize_or_zero();
        let mut occlusion =
            self.config.occlusion.enabled && !camera.is_orthographic() && flat_forward != Vec3::ZERO;
        if occlusion && !self.occlusion_enabled && now >= self.next_occlusion_test {
            self.occlusion_enabled = true;
            log::debug!("Landscape occlusion culling re-enabled");
        }
        occlusion &= self.occlusion_enabled;

        if occlusion {
            let (width, height) = (camera.viewport.x.max(1), camera.viewport.y.max(1));
            if self.horizon.width() != width || self.horizon.height() != height {
                self.horizon.resize(width, height);
            }
            self.horizon.reset(view_projection);
        }

        self.visible.clear();
        let mut traversal = Traversal {
            frustum: &frustum,
            eye: camera.position,
            horizon: occlusion.then_some(&mut self.horizon),
            near_plane: Plane::from_point_normal(camera.position, flat_forward),
            near_margin: camera.near,
            cull: &self.cull_table,
            objects: &self.objects,
        };
        let stats = self.quadtree.traverse(&mut traversal, &mut self.visible);

        if occlusion {
            if let Some(ratio) = stats.success_ratio() {
                if ratio < self.config.occlusion.min_success_ratio {
                    let delay = Duration::from_secs_f32(self.config.occlusion.retest_delay.max(0.0));
                    self.occlusion_enabled = false;
                    self.next_occlusion_test = now + delay;
                    log::debug!(
                        "Landscape occlusion rejected {}/{} nodes; suspended for {:?}",
                        stats.occluded,
                        stats.tested,
                        delay
                    );
                }
            }
        }
        self.occlusion_stats = stats;

        let config = &self.config;
        for block in self.blocks.iter_mut().flatten() {
            let visible = self.visible.contains_block(block.index());
            block.set_visible(visible);
            if visible {
                block.calculate_lod(camera.position, config.terrain_detail, config.lod_bias, config.lod_ignore_y);
            }
        }

        for block in self.visible.blocks() {
            sink.add_visible_group(*block);
        }
        for object in self.visible.objects() {
            sink.add_visible_object(*object);
        }
        stats
    }

    /// Draw the blocks found visible by the last [`Self::compute_visibility`]
    pub fn render_pass(&mut self, pass: RenderPass, driver: &mut dyn RenderDriver) -> Result<()> {
        if pass == RenderPass::GBufferPostProcess {
            return self.draw_post_process(driver);
        }

        self.bind_base_constants(driver)?;
        select_vertex_shader(driver, "TerrainBase", &[])?;
        match pass {
            RenderPass::DepthFill | RenderPass::ShadowFill => {
                driver.set_depth_stencil_state(self.states.depth_fill_depth);
                driver.set_blend_state(self.states.depth_fill_blend);
                driver.set_rasterizer_state(self.states.rasterizer);
                select_pixel_shader(driver, "TerrainDepth", &[PermutationArg::Bool(pass == RenderPass::ShadowFill)])?;
                self.draw_visible(driver, RenderMode::Simple)
            }
            RenderPass::Wireframe => {
                driver.set_depth_stencil_state(self.states.depth_fill_depth);
                driver.set_blend_state(self.states.opaque_blend);
                driver.set_rasterizer_state(self.states.wire_rasterizer);
                select_pixel_shader(driver, "TerrainWire", &[])?;
                self.draw_visible(driver, RenderMode::Wire)
            }
            RenderPass::GBufferFill => {
                driver.set_depth_stencil_state(self.states.painted_depth);
                driver.set_rasterizer_state(self.states.rasterizer);
                self.draw_painted(driver)?;
                if self.config.render_procedural {
                    self.draw_procedural(driver)?;
                }
                Ok(())
            }
            RenderPass::GBufferPostProcess => Ok(()),
        }
    }

    fn bind_base_constants(&self, driver: &mut dyn RenderDriver) -> Result<()> {
        let dimensions = self.config.dimensions;
        let data = TerrainBaseData {
            color: [1.0; 4],
            terrain_size: [
                dimensions.x,
                dimensions.y,
                dimensions.z,
                1.0 / self.config.blend_map_size.width.max(1) as f32,
            ],
            terrain_offset: self.config.offset.to_array(),
            height_scale: self.geometry.transform.scale.y,
        };
        if !driver.update_constant_buffer(self.states.base_constants, bytemuck::bytes_of(&data)) {
            return Err(Error::Render("terrain base constants update failed".into()));
        }
        driver.set_constant_buffer_auto(self.states.base_constants);
        Ok(())
    }

    fn draw_visible(&mut self, driver: &mut dyn RenderDriver, mode: RenderMode) -> Result<()> {
        let visible = self.visible.blocks().to_vec();
        for index in visible {
            self.draw_block(index, driver, mode, None)?;
        }
        Ok(())
    }

    /// Painted blocks draw one pass per layer batch; unpainted blocks get
    /// the base material
    fn draw_painted(&mut self, driver: &mut dyn RenderDriver) -> Result<()> {
        let (painted, plain): (Vec<u32>, Vec<u32>) = self
            .visible
            .blocks()
            .iter()
            .copied()
            .filter(|index| self.block(*index).is_some())
            .partition(|index| self.block(*index).is_some_and(|b| !b.texture_data().batches().is_empty()));

        if !plain.is_empty() {
            driver.set_blend_state(self.states.opaque_blend);
            select_pixel_shader(driver, "TerrainBase", &[])?;
            for index in plain {
                self.draw_block(index, driver, RenderMode::Simple, None)?;
            }
        }

        let paint_states = self.states.paint_states();
        for index in painted {
            self.draw_block(index, driver, RenderMode::Painted, Some(&paint_states))?;
        }
        Ok(())
    }

    fn draw_procedural(&mut self, driver: &mut dyn RenderDriver) -> Result<()> {
        if self.procedural_batches.is_empty() {
            return Ok(());
        }
        driver.set_depth_stencil_state(self.states.procedural_depth);
        driver.set_blend_state(self.states.additive_blend);

        for batch in 0..self.procedural_batches.len() {
            let ProceduralDrawBatch { layers, blocks } = &self.procedural_batches[batch];
            let blocks: Vec<u32> = blocks.iter().copied().filter(|b| self.visible.contains_block(*b)).collect();
            if blocks.is_empty() {
                continue;
            }

            let mut constants = ProceduralConstants::default();
            for (slot, layer) in layers.iter().filter_map(|i| self.procedural_layers.get(*i)).enumerate() {
                constants.layers[slot] = layer.shader_data();
                let color = layer
                    .material
                    .as_ref()
                    .and_then(|m| m.color_map)
                    .or(self.states.default_color);
                driver.set_sampler(PROCEDURAL_SAMPLER_SLOT + slot as u32, self.states.material_sampler, color);
            }
            if !driver.update_constant_buffer(self.states.procedural_constants, bytemuck::bytes_of(&constants)) {
                return Err(Error::Render("procedural constants update failed".into()));
            }
            driver.set_constant_buffer_auto(self.states.procedural_constants);
            select_pixel_shader(driver, "TerrainProcedural", &[PermutationArg::Int(layers.len() as i32)])?;

            for index in blocks {
                self.draw_block(index, driver, RenderMode::Procedural, None)?;
            }
        }
        Ok(())
    }

    fn draw_post_process(&self, driver: &mut dyn RenderDriver) -> Result<()> {
        driver.set_depth_stencil_state(self.states.post_process_depth);
        driver.set_blend_state(self.states.opaque_blend);
        select_vertex_shader(driver, "TerrainPostProcess", &[])?;
        select_pixel_shader(driver, "TerrainPostProcess", &[])?;
        driver.draw_screen_quad();
        Ok(())
    }

    fn draw_block(
        &mut self,
        index: u32,
        driver: &mut dyn RenderDriver,
        mode: RenderMode,
        paint_states: Option<&PaintDrawStates>,
    ) -> Result<()> {
        let neighbor_lods = self.neighbor_lods(index);
        let Some(block) = self.blocks.get_mut(index as usize).and_then(Option::as_mut) else {
            return Ok(());
        };
        block.draw(driver, mode, &self.lod_table, neighbor_lods, &Mat4::IDENTITY, paint_states)
    }

    /// LOD across each edge; hidden neighbours are not drawn and do not constrain skirts
    fn neighbor_lods(&self, index: u32) -> [Option<usize>; 4] {
        let mut lods = [None; 4];
        let Some(block) = self.block(index) else {
            return lods;
        };
        for side in EdgeSide::ALL {
            lods[side as usize] = block
                .neighbor(side)
                .and_then(|n| self.block(n))
                .filter(|n| n.is_visible())
                .map(TerrainBlock::lod);
        }
        lods
    }

    /// Register or move an object; it is owned by every leaf it overlaps in XZ
    pub fn update_object_ownership(&mut self, object: ObjectId, bounds: Aabb) {
        self.objects.insert(object, bounds);
        self.quadtree.update_object_ownership(object, &bounds);
    }

    pub fn remove_object(&mut self, object: ObjectId) {
        self.objects.remove(object);
        self.quadtree.remove_object(object);
    }

    /// World height of the height field at world XZ
    pub fn terrain_height(&self, x: f32, z: f32) -> Option<f32> {
        field_height(&self.field, &self.geometry.transform, x, z)
    }

    /// World height as the block under XZ currently renders it
    pub fn terrain_height_lod(&self, x: f32, z: f32) -> Option<f32> {
        let transform = &self.geometry.transform;
        let (sx, sy) = transform.world_to_sample(x, z);
        if sx < 0.0 || sy < 0.0 {
            return None;
        }
        let quads = (self.config.block_size - 1) as f32;
        let gx = ((sx / quads) as u32).min(self.layout.width.saturating_sub(1));
        let gy = ((sy / quads) as u32).min(self.layout.height.saturating_sub(1));
        self.block(gx + gy * self.layout.width)?
            .lod_height(&self.field, transform, x, z)
    }

    /// Interpolated surface normal at world XZ
    pub fn height_map_normal(&self, x: f32, z: f32) -> Vec3 {
        field_normal(&self.field, &self.geometry.transform, x, z)
    }

    /// First point where the segment `origin`..`origin + velocity` meets the
    /// terrain, marching in steps of `accuracy` world units and refining by
    /// bisection
    pub fn ray_intersect(&self, origin: Vec3, velocity: Vec3, accuracy: f32) -> Option<Vec3> {
        let length = velocity.length();
        if length <= f32::EPSILON {
            return None;
        }
        let ray = Ray::new(origin, velocity);
        let (t_near, t_far) = ray.intersects_aabb(&self.bounds())?;
        if t_near > 1.0 {
            return None;
        }
        let t_far = t_far.min(1.0);
        let step = (accuracy.max(0.0) / length).max(MIN_RAY_STEP);

        let below = |t: f32| {
            let p = ray.at(t);
            self.terrain_height(p.x, p.z).is_some_and(|h| p.y <= h)
        };
        let surface = |t: f32| {
            let p = ray.at(t);
            Vec3::new(p.x, self.terrain_height(p.x, p.z).unwrap_or(p.y), p.z)
        };

        if below(t_near) {
            return Some(surface(t_near));
        }
        let mut previous = t_near;
        while previous < t_far {
            let t = (previous + step).min(t_far);
            if below(t) {
                let (mut above, mut under) = (previous, t);
                for _ in 0..RAY_BISECTION_STEPS {
                    let mid = 0.5 * (above + under);
                    if below(mid) {
                        under = mid;
                    } else {
                        above = mid;
                    }
                }
                return Some(surface(under));
            }
            previous = t;
        }
        None
    }

    /// Rebuild blocks whose samples overlap `rect` after the height field
    /// was edited, then store their height data
    pub fn height_map_updated(
        &mut self,
        rect: Rect,
        provider: &mut dyn ResourceProvider,
        db: Option<&mut dyn WorldDatabase>,
    ) -> Result<()> {
        let Some(rect) = rect.intersect(&Rect::from_size(self.field.size())) else {
            return Ok(());
        };

        let mut updated = Vec::new();
        for block in self.blocks.iter_mut().flatten() {
            if block.managed_rect().intersect(&rect).is_none() {
                continue;
            }
            block.data_updated(&self.field, &self.geometry, self.lod_table.lookup(), provider)?;
            self.quadtree.update_leaf(block.index(), *block.bounds(), &block_samples(block));
            updated.push(block.index());
        }
        if updated.is_empty() {
            return Ok(());
        }
        self.quadtree.update_internal_nodes();
        self.rebatch_procedural();
        log::debug!("Height edit over {:?} rebuilt {} blocks", rect, updated.len());

        match db {
            Some(db) if self.db_id > 0 => self.save_block_data(db, &updated),
            _ => Ok(()),
        }
    }

    fn save_block_data(&self, db: &mut dyn WorldDatabase, indices: &[u32]) -> Result<()> {
        let rows = indices
            .iter()
            .filter_map(|index| self.block(*index))
            .filter(|block| block.db_id() > 0)
            .map(|b| block_row(&self.field, b).map(|row| (row, b.lod_variance().to_vec())))
            .collect::<Result<Vec<_>>>()?;
        transaction(db, |db| {
            for (row, variance) in rows {
                db.update_block_data(row.id, row.heights, row.colors)?;
                db.replace_variance(row.id, &variance)?;
            }
            Ok(())
        })
    }

    /// Rescale the landscape to new world dimensions and rebuild every block
    pub fn set_dimensions(
        &mut self,
        dimensions: Vec3,
        provider: &mut dyn ResourceProvider,
        db: Option<&mut dyn WorldDatabase>,
    ) -> Result<()> {
        let config = LandscapeConfig { dimensions, ..self.config.clone() };
        config.validate()?;
        self.config = config;
        self.geometry.transform = self.config.transform(self.field.size());

        let quads = self.config.block_size - 1;
        for block in self.blocks.iter_mut().flatten() {
            let (gx, gy) = block.grid();
            let (min, max) = block_world_xz(&self.geometry.transform, quads, gx, gy);
            block.texture_data_mut().set_world_bounds(min, max);
            block.data_updated(&self.field, &self.geometry, self.lod_table.lookup(), provider)?;
        }

        self.quadtree = build_quadtree(&self.blocks, self.layout, &self.geometry)?;
        for (object, bounds) in self.objects.iter() {
            self.quadtree.update_object_ownership(object, bounds);
        }
        self.rebatch_procedural();
        log::info!("Landscape resized to {}", dimensions);

        match db {
            Some(db) if self.db_id > 0 => self.save(db),
            _ => Ok(()),
        }
    }

    pub fn procedural_layers(&self) -> &[ProceduralLayer] {
        &self.procedural_layers
    }

    pub fn procedural_layer(&self, index: usize) -> Option<&ProceduralLayer> {
        self.procedural_layers.get(index)
    }

    pub fn procedural_batches(&self) -> &[ProceduralDrawBatch] {
        &self.procedural_batches
    }

    /// Replace one procedural layer; false when `index` is out of range
    pub fn set_procedural_layer(
        &mut self,
        index: usize,
        layer: ProceduralLayer,
        db: Option<&mut dyn WorldDatabase>,
    ) -> Result<bool> {
        let Some(slot) = self.procedural_layers.get_mut(index) else {
            return Ok(false);
        };
        *slot = layer;
        self.procedural_layers_changed(db)?;
        Ok(true)
    }

    /// Replace the whole procedural layer list, in draw order
    pub fn update_procedural_layers(
        &mut self,
        layers: Vec<ProceduralLayer>,
        db: Option<&mut dyn WorldDatabase>,
    ) -> Result<()> {
        self.procedural_layers = layers;
        self.procedural_layers_changed(db)
    }

    fn procedural_layers_changed(&mut self, db: Option<&mut dyn WorldDatabase>) -> Result<()> {
        self.rebatch_procedural();
        let Some(db) = db else {
            return Ok(());
        };
        if self.db_id == 0 {
            return Ok(());
        }
        let rows = self.procedural_rows()?;
        let landscape_id = self.db_id;
        let ids = transaction(db, |db| db.replace_procedural_layers(landscape_id, rows))?;
        for (layer, id) in self.procedural_layers.iter_mut().zip(ids) {
            layer.layer_id = id;
        }
        Ok(())
    }

    fn rebatch_procedural(&mut self) {
        self.procedural_batches = batch_procedural_draws(&self.procedural_layers, &self.blocks);
    }

    /// Start a stroke; blocks join it as the brush reaches them.
    /// Returns false while another stroke is active or when a non-erase
    /// stroke has no material.
    pub fn begin_paint(&mut self, material: Option<MaterialHandle>, params: PaintParams) -> bool {
        if self.stroke.is_some() || (!params.erase && material.is_none()) {
            return false;
        }
        self.stroke = Some(ActiveStroke { material, params });
        true
    }

    pub fn is_painting(&self) -> bool {
        self.stroke.is_some()
    }

    /// Stamp the brush at world XZ
    pub fn paint(&mut self, center: Vec2) -> bool {
        self.paint_line(center, center)
    }

    /// Stamp the brush along a world XZ segment
    pub fn paint_line(&mut self, from: Vec2, to: Vec2) -> bool {
        let Some(stroke) = &self.stroke else {
            return false;
        };
        let reach = stroke.params.outer_radius.max(stroke.params.radius());
        let (lo, hi) = (from.min(to) - reach, from.max(to) + reach);

        let mut painted = false;
        for block in self.blocks.iter_mut().flatten() {
            let data = block.texture_data_mut();
            let (min, max) = data.blend_map_world_area();
            if hi.x < min.x || hi.y < min.y || lo.x > max.x || lo.y > max.y {
                continue;
            }
            if !data.is_painting() {
                // Nothing to erase on a block without layers
                if stroke.params.erase && data.layers().is_empty() {
                    continue;
                }
                if !data.begin_paint(stroke.material.clone(), stroke.params.clone()) {
                    continue;
                }
            }
            painted |= data.paint_line(from, to);
        }
        painted
    }

    /// Accumulated stroke coverage over a global blend-map rectangle
    pub fn blend_map_paint_data(&self, rect: Rect) -> PaintSnapshot {
        let mut data = vec![0u8; rect.size().area()];
        for block in self.blocks.iter().flatten() {
            block.texture_data().copy_paint_into(rect, &mut data);
        }
        PaintSnapshot::new(rect, data)
    }

    /// Filter pending coverage into every painting block and upload the
    /// changed blend textures
    pub fn update_paint_preview(&mut self, provider: &mut dyn ResourceProvider) -> Result<bool> {
        let Some(rect) = self
            .blocks
            .iter()
            .flatten()
            .filter_map(|b| b.texture_data().paint_snapshot_rect())
            .reduce(|a, b| a.union(&b))
        else {
            return Ok(false);
        };
        let snapshot = self.blend_map_paint_data(rect);
        let surface = HeightSurface { field: &self.field, transform: self.geometry.transform };

        let mut updated = false;
        for block in self.blocks.iter_mut().flatten() {
            let data = block.texture_data_mut();
            if !data.is_painting() {
                continue;
            }
            updated |= data.update_paint_preview(&snapshot, &surface);
            data.upload(provider)?;
        }
        Ok(updated)
    }

    /// Finish the stroke, committing previewed weights; changed layers are
    /// stored when the landscape is persisted
    pub fn end_paint(
        &mut self,
        provider: &mut dyn ResourceProvider,
        db: Option<&mut dyn WorldDatabase>,
    ) -> Result<bool> {
        if self.stroke.take().is_none() {
            return Ok(false);
        }
        self.update_paint_preview(provider)?;

        let mut removed = Vec::new();
        let mut touched = 0;
        for block in self.blocks.iter_mut().flatten() {
            let data = block.texture_data_mut();
            let Some(commit) = data.end_paint() else {
                continue;
            };
            data.upload(provider)?;
            touched += 1;
            removed.extend(commit.removed_layer_ids);
        }
        log::debug!("Paint stroke finished on {} blocks", touched);

        match db {
            Some(db) if self.db_id > 0 => self.save_paint_layers(db, &removed)?,
            _ => {}
        }
        Ok(true)
    }

    fn save_paint_layers(&mut self, db: &mut dyn WorldDatabase, removed: &[RowId]) -> Result<()> {
        let mut slots = Vec::new();
        let mut rows = Vec::new();
        for block in self.blocks.iter().flatten() {
            for (index, layer) in block.texture_data().layers().iter().enumerate() {
                if layer.is_erase() || (layer.layer_id() > 0 && !layer.is_modified()) {
                    continue;
                }
                slots.push((block.index(), index));
                rows.push(PaintLayerRow {
                    id: layer.layer_id(),
                    block_id: block.db_id(),
                    material_id: layer.material_id().unwrap_or_default(),
                    reference_count: layer.reference_count(),
                    weights: encode_weights(layer.weights()),
                });
            }
        }

        let ids = transaction(db, |db| {
            for id in removed {
                db.delete_paint_layer(*id)?;
            }
            let mut ids = Vec::with_capacity(rows.len());
            for row in rows {
                if row.id > 0 {
                    db.update_paint_layer(&row)?;
                    ids.push(row.id);
                } else {
                    ids.push(db.insert_paint_layer(row)?);
                }
            }
            Ok(ids)
        })?;

        for ((block, layer), id) in slots.into_iter().zip(ids) {
            if let Some(block) = self.block_mut(block) {
                block.texture_data_mut().mark_saved(layer, id);
            }
        }
        Ok(())
    }
}

/// Height and normal queries over the landscape's height field
struct HeightSurface<'a> {
    field: &'a HeightField,
    transform: TerrainTransform,
}

impl SurfaceSampler for HeightSurface<'_> {
    fn height(&self, x: f32, z: f32) -> Option<f32> {
        field_height(self.field, &self.transform, x, z)
    }

    fn normal(&self, x: f32, z: f32) -> Vec3 {
        field_normal(self.field, &self.transform, x, z)
    }
}

fn field_height(field: &HeightField, transform: &TerrainTransform, x: f32, z: f32) -> Option<f32> {
    let (sx, sy) = transform.world_to_sample(x, z);
    field.interpolated(sx, sy).map(|h| transform.height_to_world(h))
}

fn field_normal(field: &HeightField, transform: &TerrainTransform, x: f32, z: f32) -> Vec3 {
    let (sx, sy) = transform.world_to_sample(x, z);
    let sx = sx.clamp(0.0, (field.width() - 1) as f32);
    let sy = sy.clamp(0.0, (field.height() - 1) as f32);
    let (x0, y0) = (sx.floor() as i32, sy.floor() as i32);
    let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);

    let n = |dx: i32, dy: i32| field.normal_at(x0 + dx, y0 + dy, transform.scale);
    let top = n(0, 0).lerp(n(1, 0), fx);
    let bottom = n(0, 1).lerp(n(1, 1), fx);
    top.lerp(bottom, fy).normalize_or(Vec3::Y)
}

/// World XZ corners of a block's active area
fn block_world_xz(transform: &TerrainTransform, quads: u32, gx: u32, gy: u32) -> (Vec2, Vec2) {
    let min = transform.sample_to_world((gx * quads) as f32, (gy * quads) as f32, 0.0);
    let max = transform.sample_to_world(((gx + 1) * quads) as f32, ((gy + 1) * quads) as f32, 0.0);
    (Vec2::new(min.x, min.z), Vec2::new(max.x, max.z))
}

fn create_blocks(config: &LandscapeConfig, geometry: &BlockGeometry, layout: Size) -> Vec<Option<TerrainBlock>> {
    let quads = config.block_size - 1;
    let field = geometry.field_size;
    let blend = config.blend_map_size;

    let mut blocks = Vec::with_capacity(layout.area());
    for gy in 0..layout.height {
        for gx in 0..layout.width {
            let index = gx + gy * layout.width;
            if (gx + 1) * quads >= field.width || (gy + 1) * quads >= field.height {
                log::warn!(
                    "Block {} at ({}, {}) does not fit the {}x{} height field; skipped",
                    index,
                    gx,
                    gy,
                    field.width,
                    field.height
                );
                blocks.push(None);
                continue;
            }
            let (min, max) = block_world_xz(&geometry.transform, quads, gx, gy);
            let origin = ((gx * blend.width) as i32, (gy * blend.height) as i32);
            let texture_data = LandscapeTextureData::new(blend, origin, min, max);
            blocks.push(Some(TerrainBlock::new(index, (gx, gy), geometry, texture_data)));
        }
    }
    link_neighbors(&mut blocks, layout);
    blocks
}

fn link_neighbors(blocks: &mut [Option<TerrainBlock>], layout: Size) {
    let present: Vec<bool> = blocks.iter().map(Option::is_some).collect();
    for block in blocks.iter_mut().flatten() {
        let (gx, gy) = block.grid();
        for side in EdgeSide::ALL {
            let (dx, dy) = side.neighbor_offset();
            let (nx, ny) = (gx as i32 + dx, gy as i32 + dy);
            let inside = nx >= 0 && ny >= 0 && (nx as u32) < layout.width && (ny as u32) < layout.height;
            let neighbor = inside
                .then(|| nx as u32 + ny as u32 * layout.width)
                .filter(|n| present[*n as usize]);
            block.set_neighbor(side, neighbor);
        }
    }
}

fn upload_geometry(
    lod_table: &mut LodTable,
    blocks: &mut [Option<TerrainBlock>],
    field: &HeightField,
    geometry: &BlockGeometry,
    provider: &mut dyn ResourceProvider,
) -> Result<()> {
    lod_table.upload(provider)?;
    for block in blocks.iter_mut().flatten() {
        block.data_updated(field, geometry, lod_table.lookup(), provider)?;
    }
    Ok(())
}

fn build_quadtree(blocks: &[Option<TerrainBlock>], layout: Size, geometry: &BlockGeometry) -> Result<SpatialQuadtree> {
    let transform = &geometry.transform;
    let quads = (geometry.block_size - 1) as f32;
    let origin = Vec2::new(transform.offset.x, transform.offset.z);
    let cell_size = Vec2::new(transform.scale.x, transform.scale.z) * quads;
    let inputs = blocks
        .iter()
        .map(|b| {
            b.as_ref().map(|block| LeafInput {
                block_index: block.index(),
                bounds: *block.bounds(),
                samples: block_samples(block),
            })
        })
        .collect();
    SpatialQuadtree::build(layout, origin, cell_size, inputs, transform.height_to_world(0.0))
}

fn block_samples(block: &TerrainBlock) -> Vec<Vec3> {
    block.vertices().iter().map(|v| Vec3::from_array(v.position)).collect()
}

fn block_row(field: &HeightField, block: &TerrainBlock) -> Result<BlockRow> {
    let rect = block.managed_rect();
    let heights = encode_heights(&field.read_rect(rect)?);
    let colors = field
        .read_color_rect(rect)?
        .map(|c| encode_colors(&c))
        .unwrap_or_default();
    Ok(BlockRow {
        id: block.db_id(),
        landscape_id: 0,
        block_index: block.index(),
        left: rect.left,
        top: rect.top,
        right: rect.right,
        bottom: rect.bottom,
        heights,
        colors,
    })
}

fn select_vertex_shader(driver: &mut dyn RenderDriver, name: &str, args: &[PermutationArg]) -> Result<()> {
    if driver.select_vertex_shader(name, args) {
        Ok(())
    } else {
        Err(Error::Render(format!("no {} vertex shader permutation", name)))
    }
}

fn select_pixel_shader(driver: &mut dyn RenderDriver, name: &str, args: &[PermutationArg]) -> Result<()> {
    if driver.select_pixel_shader(name, args) {
        Ok(())
    } else {
        Err(Error::Render(format!("no {} pixel shader permutation", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProjectionMode;
    use crate::paint::LayerMaterial;
    use crate::persistence::MemoryDatabase;
    use crate::render::{CommandRecorder, RecordedCommand};
    use crate::terrain::{HeightFieldGenerator, NoiseParams};

    fn config(block_size: u32, extent: f32) -> LandscapeConfig {
        LandscapeConfig {
            block_size,
            blend_map_size: Size::new(8, 8),
            dimensions: Vec3::new(extent, 100.0, extent),
            ..Default::default()
        }
    }

    fn flat_field(layout: Size, block_size: u32, height: i16) -> HeightField {
        let quads = block_size - 1;
        let size = Size::new(layout.width * quads + 1, layout.height * quads + 1);
        HeightField::from_samples(size, vec![height; size.area()]).unwrap()
    }

    fn import(field: HeightField, config: LandscapeConfig, recorder: &mut CommandRecorder) -> Landscape {
        Landscape::import(field, config, recorder, None).unwrap()
    }

    /// Looks down onto a 20x20 landscape from the -Z side
    fn overview_camera() -> Camera {
        Camera::look_at(Vec3::new(10.0, 40.0, -20.0), Vec3::new(10.0, 0.0, 10.0), Vec3::Y)
    }

    fn without_occlusion(mut config: LandscapeConfig) -> LandscapeConfig {
        config.occlusion.enabled = false;
        config
    }

    fn pixel_shaders(recorder: &CommandRecorder) -> Vec<(String, Vec<PermutationArg>)> {
        recorder
            .commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::PixelShader { name, args } => Some((name.clone(), args.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_flat_landscape_has_zero_variance() {
        let mut recorder = CommandRecorder::new();
        let landscape = import(flat_field(Size::new(2, 2), 3, 0), config(3, 20.0), &mut recorder);
        assert_eq!(landscape.layout(), Size::new(2, 2));
        for block in landscape.blocks().iter().flatten() {
            assert!(block.lod_variance().iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn test_flat_blocks_pick_coarsest_lod() {
        let mut recorder = CommandRecorder::new();
        let mut landscape = import(
            flat_field(Size::new(2, 2), 9, 0),
            without_occlusion(config(9, 20.0)),
            &mut recorder,
        );
        let mut sink = VisibilitySet::new();
        landscape.compute_visibility(&overview_camera(), &FrameClock::manual(), &mut sink);
        assert!(!sink.blocks().is_empty());
        let coarsest = landscape.lod_table().level_count() - 1;
        for index in sink.blocks() {
            let block = landscape.block(*index).unwrap();
            assert!(block.is_visible());
            assert_eq!(block.lod(), coarsest);
        }
    }

    #[test]
    fn test_quadtree_leaves_map_to_blocks() {
        let mut recorder = CommandRecorder::new();
        let landscape = import(flat_field(Size::new(4, 4), 3, 0), config(3, 40.0), &mut recorder);
        let tree = landscape.quadtree();
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.leaves().len(), 16);
        for leaf in tree.leaves() {
            assert_eq!(leaf.block, Some(leaf.cell.0 + leaf.cell.1 * 4));
        }
    }

    #[test]
    fn test_blocks_outside_field_are_skipped() {
        let mut recorder = CommandRecorder::new();
        let field = HeightField::new(Size::new(5, 5)).unwrap();
        let config = LandscapeConfig { block_layout: Size::new(3, 3), ..config(3, 20.0) };
        let landscape = import(field, config, &mut recorder);
        assert_eq!(landscape.blocks().len(), 9);
        assert_eq!(landscape.blocks().iter().flatten().count(), 4);
        assert!(landscape.block(2).is_none());
        assert_eq!(landscape.block(1).unwrap().neighbor(EdgeSide::East), None);
        assert_eq!(landscape.block(1).unwrap().neighbor(EdgeSide::West), Some(0));
        assert_eq!(landscape.block(0).unwrap().neighbor(EdgeSide::South), Some(3));
        for block in landscape.blocks().iter().flatten() {
            for side in EdgeSide::ALL {
                if let Some(neighbor) = block.neighbor(side).and_then(|n| landscape.block(n)) {
                    assert_eq!(neighbor.neighbor(side.opposite()), Some(block.index()));
                }
            }
        }
    }

    #[test]
    fn test_field_without_blocks_is_rejected() {
        let mut recorder = CommandRecorder::new();
        let field = HeightField::new(Size::new(4, 4)).unwrap();
        let result = Landscape::import(field, config(9, 20.0), &mut recorder, None);
        assert!(matches!(result, Err(Error::Degenerate(_))));
        assert_eq!(recorder.live_resources(), 0);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let mut recorder = CommandRecorder::new();
        let mut library = MaterialLibrary::new();
        let rock = library.insert(LayerMaterial::new(3, "rock"));
        let field = HeightFieldGenerator::new(NoiseParams::default())
            .generate(Size::new(33, 33))
            .unwrap()
            .with_colors((0..33 * 33).map(|i| 0xFF00_0000 | i as u32).collect())
            .unwrap();

        let mut db = MemoryDatabase::new();
        let mut landscape = Landscape::import(field, config(9, 64.0), &mut recorder, Some(&mut db)).unwrap();
        assert!(landscape.db_id() > 0);
        assert_eq!(db.block_count(), 16);
        landscape
            .update_procedural_layers(
                vec![ProceduralLayer::new("rock", rock).with_height_range(-10.0, 10.0, 2.0)],
                Some(&mut db),
            )
            .unwrap();
        assert!(landscape.procedural_layer(0).unwrap().layer_id > 0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.db");
        db.save(&path).unwrap();
        let reopened = MemoryDatabase::open(&path).unwrap();

        let mut other = CommandRecorder::new();
        let loaded = Landscape::load(&reopened, landscape.db_id(), &library, &mut other).unwrap();
        assert_eq!(loaded.config(), landscape.config());
        assert_eq!(loaded.height_field().samples(), landscape.height_field().samples());
        assert_eq!(loaded.height_field().colors(), landscape.height_field().colors());
        for (a, b) in loaded.blocks().iter().flatten().zip(landscape.blocks().iter().flatten()) {
            assert_eq!(a.bounds(), b.bounds());
            assert_eq!(a.lod_variance(), b.lod_variance());
            assert_eq!(a.db_id(), b.db_id());
        }
        let layer = loaded.procedural_layer(0).unwrap();
        assert_eq!(layer.name, "rock");
        assert_eq!(layer.material.as_ref().map(|m| m.id), Some(3));
        assert_eq!(loaded.procedural_batches(), landscape.procedural_batches());
    }

    #[test]
    fn test_failed_import_leaves_nothing_behind() {
        let mut recorder = CommandRecorder::new();
        let mut db = MemoryDatabase::new();
        db.fail_writes_after(2);
        let result = Landscape::import(flat_field(Size::new(2, 2), 3, 0), config(3, 20.0), &mut recorder, Some(&mut db));
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(db.block_count(), 0);
        assert_eq!(recorder.live_resources(), 0);
    }

    #[test]
    fn test_load_unknown_landscape() {
        let mut recorder = CommandRecorder::new();
        let result = Landscape::load(&MemoryDatabase::new(), 42, &MaterialLibrary::new(), &mut recorder);
        assert!(matches!(result, Err(Error::Persistence(_))));
    }

    #[test]
    fn test_adaptive_occlusion_backs_off() {
        let mut recorder = CommandRecorder::new();
        let field = HeightField::new(Size::new(3, 7)).unwrap();
        let config = LandscapeConfig {
            dimensions: Vec3::new(10.0, 100.0, 30.0),
            ..config(3, 10.0)
        };
        let mut landscape = import(field, config, &mut recorder);
        let camera = Camera::look_at(Vec3::new(5.0, 5.0, -5.0), Vec3::new(5.0, 0.0, 15.0), Vec3::Y);
        let mut clock = FrameClock::manual();
        let mut sink = VisibilitySet::new();

        // Flat ground hides nothing, so the first test disables occlusion
        let stats = landscape.compute_visibility(&camera, &clock, &mut sink);
        assert!(stats.tested > 0);
        assert_eq!(stats.occluded, 0);
        assert!(!landscape.is_occlusion_enabled());
        assert_eq!(landscape.next_occlusion_test(), Duration::from_secs(1));

        clock.advance(Duration::from_millis(500));
        let stats = landscape.compute_visibility(&camera, &clock, &mut sink);
        assert_eq!(stats.tested, 0);

        clock.advance(Duration::from_millis(1000));
        let stats = landscape.compute_visibility(&camera, &clock, &mut sink);
        assert!(stats.tested > 0);
        assert_eq!(landscape.next_occlusion_test(), Duration::from_millis(2500));

        clock.advance(Duration::from_millis(2000));
        let mut ortho = camera.clone();
        ortho.projection = ProjectionMode::Orthographic { height: 40.0 };
        let stats = landscape.compute_visibility(&ortho, &clock, &mut sink);
        assert_eq!(stats.tested, 0);
        assert!(!sink.blocks().is_empty());
    }

    #[test]
    fn test_render_passes() {
        let mut recorder = CommandRecorder::new();
        let mut library = MaterialLibrary::new();
        let grass = library.insert(LayerMaterial::new(1, "grass").with_color_map(ResourceHandle(500)));
        let dirt = library.insert(LayerMaterial::new(2, "dirt"));
        let mut landscape = import(
            flat_field(Size::new(2, 2), 3, 0),
            without_occlusion(config(3, 20.0)),
            &mut recorder,
        );
        landscape.set_default_textures(Some(ResourceHandle(600)), None);
        landscape
            .update_procedural_layers(
                vec![ProceduralLayer::new("grass", grass), ProceduralLayer::new("dirt", dirt)],
                None,
            )
            .unwrap();
        let mut sink = VisibilitySet::new();
        landscape.compute_visibility(&overview_camera(), &FrameClock::manual(), &mut sink);
        assert_eq!(sink.blocks().len(), 4);

        recorder.clear_commands();
        landscape.render_pass(RenderPass::DepthFill, &mut recorder).unwrap();
        assert!(recorder.draw_call_count() >= 4);
        assert_eq!(pixel_shaders(&recorder), vec![("TerrainDepth".to_string(), vec![PermutationArg::Bool(false)])]);

        recorder.clear_commands();
        landscape.render_pass(RenderPass::GBufferFill, &mut recorder).unwrap();
        assert_eq!(
            pixel_shaders(&recorder),
            vec![
                ("TerrainBase".to_string(), vec![]),
                ("TerrainProcedural".to_string(), vec![PermutationArg::Int(2)]),
            ]
        );
        assert!(recorder.draw_call_count() >= 8);
        let textures: Vec<_> = recorder
            .commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::Sampler { slot, texture, .. } if *slot >= PROCEDURAL_SAMPLER_SLOT => Some(*texture),
                _ => None,
            })
            .collect();
        assert_eq!(textures, vec![Some(ResourceHandle(500)), Some(ResourceHandle(600))]);

        recorder.clear_commands();
        landscape.render_pass(RenderPass::GBufferPostProcess, &mut recorder).unwrap();
        assert!(recorder.commands().iter().any(|c| matches!(c, RecordedCommand::ScreenQuad)));
        assert_eq!(recorder.draw_call_count(), 0);

        recorder.remove_shader("TerrainDepth");
        let result = landscape.render_pass(RenderPass::ShadowFill, &mut recorder);
        assert!(matches!(result, Err(Error::Render(_))));
    }

    #[test]
    fn test_paint_layers_persist() {
        let mut recorder = CommandRecorder::new();
        let mut library = MaterialLibrary::new();
        let sand = library.insert(LayerMaterial::new(5, "sand"));
        let mut db = MemoryDatabase::new();
        let mut landscape =
            Landscape::import(flat_field(Size::new(2, 2), 9, 0), config(9, 32.0), &mut recorder, Some(&mut db)).unwrap();

        assert!(!landscape.begin_paint(None, PaintParams::new(100.0, 2.0, 4.0)));
        assert!(landscape.begin_paint(Some(sand), PaintParams::new(100.0, 2.0, 4.0)));
        assert!(!landscape.begin_paint(None, PaintParams { erase: true, ..PaintParams::new(100.0, 2.0, 4.0) }));
        // The brush sits on the corner shared by all four blocks
        assert!(landscape.paint(Vec2::splat(16.0)));
        assert!(landscape.update_paint_preview(&mut recorder).unwrap());
        assert!(landscape.end_paint(&mut recorder, Some(&mut db)).unwrap());
        assert!(!landscape.is_painting());
        assert_eq!(db.paint_layer_count(), 4);

        let mut other = CommandRecorder::new();
        let loaded = Landscape::load(&db, landscape.db_id(), &library, &mut other).unwrap();
        for (a, b) in loaded.blocks().iter().flatten().zip(landscape.blocks().iter().flatten()) {
            let (a, b) = (a.texture_data(), b.texture_data());
            assert_eq!(a.layers().len(), 1);
            assert_eq!(a.layers()[0].reference_count(), b.layers()[0].reference_count());
            assert_eq!(a.layers()[0].weights(), b.layers()[0].weights());
        }
    }

    #[test]
    fn test_ray_intersection() {
        let mut recorder = CommandRecorder::new();
        let landscape = import(flat_field(Size::new(2, 2), 3, 16383), config(3, 20.0), &mut recorder);
        let ground = landscape.terrain_height(5.0, 5.0).unwrap();
        assert!((ground - landscape.transform().height_to_world(16383.0)).abs() < 1e-4);

        let hit = landscape
            .ray_intersect(Vec3::new(5.0, 50.0, 5.0), Vec3::new(0.0, -100.0, 0.0), 0.5)
            .unwrap();
        assert!((hit.y - ground).abs() < 1e-3);
        assert!(landscape.ray_intersect(Vec3::new(5.0, 50.0, 5.0), Vec3::new(0.0, 100.0, 0.0), 0.5).is_none());
        assert!(landscape.ray_intersect(Vec3::new(5.0, 50.0, 5.0), Vec3::new(0.0, -10.0, 0.0), 0.5).is_none());

        let slanted = landscape
            .ray_intersect(Vec3::new(0.0, ground + 10.0, 10.0), Vec3::new(30.0, -30.0, 0.0), 0.25)
            .unwrap();
        assert!((slanted.x - 10.0).abs() < 0.01);
        assert_eq!(landscape.height_map_normal(5.0, 5.0), Vec3::Y);
        assert!((landscape.terrain_height_lod(5.0, 5.0).unwrap() - ground).abs() < 1e-3);
    }

    #[test]
    fn test_height_edit_rebuilds_touched_blocks() {
        let mut recorder = CommandRecorder::new();
        let mut db = MemoryDatabase::new();
        let mut landscape =
            Landscape::import(flat_field(Size::new(2, 2), 9, 0), config(9, 32.0), &mut recorder, Some(&mut db)).unwrap();
        let untouched = *landscape.block(3).unwrap().bounds();

        let rect = Rect::new(0, 0, 5, 5);
        for (x, y) in rect.cells() {
            landscape.height_field_mut().set_cell(x as u32, y as u32, 20000);
        }
        landscape.height_map_updated(rect, &mut recorder, Some(&mut db)).unwrap();

        let raised = landscape.transform().height_to_world(20000.0);
        assert!(landscape.block(0).unwrap().bounds().max.y >= raised);
        assert_eq!(*landscape.block(3).unwrap().bounds(), untouched);
        assert!(landscape.bounds().max.y >= raised);
        assert!(landscape.block(0).unwrap().lod_variance().iter().any(|v| *v > 0.0));

        let rows = db.blocks(landscape.db_id()).unwrap();
        let first = rows.iter().find(|r| r.block_index == 0).unwrap();
        assert!(decode_heights(&first.heights).unwrap().contains(&20000));
        let stored = db.variance(first.id).unwrap();
        assert_eq!(stored, landscape.block(0).unwrap().lod_variance());
    }

    #[test]
    fn test_procedural_batches_split_by_height() {
        let mut recorder = CommandRecorder::new();
        let mut field = HeightField::new(Size::new(5, 3)).unwrap();
        for y in 0..3 {
            field.set_cell(3, y, 30000);
            field.set_cell(4, y, 30000);
        }
        let mut landscape = import(field, config(3, 20.0), &mut recorder);

        let mut library = MaterialLibrary::new();
        let mut layer = |id: u32, name: &str| ProceduralLayer::new(name, library.insert(LayerMaterial::new(id, name)));
        let layers = vec![
            layer(1, "grass"),
            layer(2, "snow").with_height_range(30.0, 60.0, 0.0),
            layer(3, "dirt"),
            layer(4, "sand"),
            layer(5, "rock").with_weight(0.0),
        ];
        landscape.update_procedural_layers(layers, None).unwrap();
        assert_eq!(
            landscape.procedural_batches(),
            &[
                ProceduralDrawBatch { layers: vec![0, 2, 3], blocks: vec![0] },
                ProceduralDrawBatch { layers: vec![0, 1, 2], blocks: vec![1] },
                ProceduralDrawBatch { layers: vec![3], blocks: vec![1] },
            ]
        );

        let dirt = landscape.procedural_layer(2).unwrap().clone().with_weight(0.0);
        assert!(landscape.set_procedural_layer(2, dirt.clone(), None).unwrap());
        assert!(!landscape.set_procedural_layer(9, dirt, None).unwrap());
        assert_eq!(landscape.procedural_batches()[0].layers, vec![0, 3]);
    }

    #[test]
    fn test_set_dimensions_rescales_blocks() {
        let mut recorder = CommandRecorder::new();
        let mut landscape = import(flat_field(Size::new(2, 2), 3, 0), config(3, 20.0), &mut recorder);
        landscape.update_object_ownership(ObjectId(1), Aabb::new(Vec3::new(24.0, 0.0, 24.0), Vec3::new(25.0, 1.0, 25.0)));
        assert!(landscape.quadtree().leaves().iter().all(|l| l.objects.is_empty()));

        landscape.set_dimensions(Vec3::new(40.0, 100.0, 40.0), &mut recorder, None).unwrap();
        assert_eq!(landscape.bounds().max.x, 40.0);
        assert_eq!(landscape.block(3).unwrap().bounds().max.z, 40.0);
        let (_, max) = landscape.block(3).unwrap().texture_data().blend_map_world_area();
        assert!(max.x > 40.0);
        assert!(landscape.quadtree().leaves().iter().any(|l| l.objects.contains(&ObjectId(1))));
        assert!(landscape.set_dimensions(Vec3::ZERO, &mut recorder, None).is_err());
    }

    #[test]
    fn test_objects_follow_visible_leaves() {
        let mut recorder = CommandRecorder::new();
        let mut landscape = import(
            flat_field(Size::new(2, 2), 3, 0),
            without_occlusion(config(3, 20.0)),
            &mut recorder,
        );
        let rock = ObjectId(7);
        landscape.update_object_ownership(rock, Aabb::new(Vec3::new(4.0, 0.0, 4.0), Vec3::new(6.0, 2.0, 6.0)));

        let mut sink = VisibilitySet::new();
        landscape.compute_visibility(&overview_camera(), &FrameClock::manual(), &mut sink);
        assert!(sink.contains_object(rock));
        assert!(landscape.visible().contains_object(rock));

        landscape.remove_object(rock);
        let mut sink = VisibilitySet::new();
        landscape.compute_visibility(&overview_camera(), &FrameClock::manual(), &mut sink);
        assert!(!sink.contains_object(rock));
    }

    #[test]
    fn test_terrain_detail_refines_lods() {
        let mut recorder = CommandRecorder::new();
        let field = HeightFieldGenerator::new(NoiseParams::default()).generate(Size::new(33, 33)).unwrap();
        let mut landscape = import(field, without_occlusion(config(9, 64.0)), &mut recorder);
        let camera = Camera::look_at(Vec3::new(32.0, 80.0, -40.0), Vec3::new(32.0, 0.0, 32.0), Vec3::Y);
        let lod_sum = |landscape: &mut Landscape| {
            let mut sink = VisibilitySet::new();
            landscape.compute_visibility(&camera, &FrameClock::manual(), &mut sink);
            sink.blocks().iter().map(|i| landscape.block(*i).unwrap().lod()).sum::<usize>()
        };

        landscape.set_terrain_detail(-1.0);
        assert_eq!(landscape.terrain_detail(), 0.0);
        let coarse = lod_sum(&mut landscape);
        landscape.set_terrain_detail(100.0);
        let fine = lod_sum(&mut landscape);
        assert!(fine <= coarse);
    }

    #[test]
    fn test_release_frees_everything() {
        let mut recorder = CommandRecorder::new();
        let mut landscape = import(flat_field(Size::new(2, 2), 3, 0), config(3, 20.0), &mut recorder);
        assert!(recorder.live_resources() > 0);
        landscape.release(&mut recorder);
        assert_eq!(recorder.live_resources(), 0);
    }
}
