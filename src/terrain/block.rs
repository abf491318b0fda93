//! Terrain blocks: one vertex buffer per block, drawn with a shared LOD table

use bytemuck::{Pod, Zeroable};

use crate::core::types::{Mat4, Result, Vec3};
use crate::core::Error;
use crate::math::{Aabb, Ray, Rect, Size};
use crate::paint::{LandscapeTextureData, PaintDrawStates};
use crate::render::{
    write_buffer, ElementFormat, PrimitiveTopology, RenderDriver, ResourceHandle, ResourceProvider,
    VertexElement, VertexFormat, VertexSemantic,
};
use super::heightfield::{HeightField, TerrainTransform};
use super::lod::{EdgeSide, IndexRange, LodTable, MipLookup};

/// Terrain vertex (28 bytes)
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TerrainVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    /// Packed ARGB vertex colour
    pub color: u32,
}

const TERRAIN_VERTEX_ELEMENTS: [VertexElement; 3] = [
    VertexElement { offset: 0, format: ElementFormat::Float3, semantic: VertexSemantic::Position },
    VertexElement { offset: 12, format: ElementFormat::Float3, semantic: VertexSemantic::Normal },
    VertexElement { offset: 24, format: ElementFormat::Unorm4, semantic: VertexSemantic::Color },
];

pub const TERRAIN_VERTEX_FORMAT: VertexFormat = VertexFormat {
    stride: std::mem::size_of::<TerrainVertex>() as u32,
    elements: &TERRAIN_VERTEX_ELEMENTS,
};

/// How a block is shaded by `draw`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderMode {
    Wire,
    /// Geometry only (depth and shadow fills)
    Simple,
    /// Geometry for an already-bound procedural batch
    Procedural,
    /// One pass per painted layer batch
    Painted,
}

/// Block-local settings shared by every block of a landscape
#[derive(Clone, Copy, Debug)]
pub struct BlockGeometry {
    pub block_size: u32,
    pub field_size: Size,
    pub transform: TerrainTransform,
    /// Multiplier turning height variance into a switch distance
    pub variance_scale: f32,
}

/// A `block_size` x `block_size` vertex patch of the landscape
#[derive(Debug)]
pub struct TerrainBlock {
    index: u32,
    grid: (u32, u32),
    /// Samples this block reads, active rect plus a 1-sample border
    managed_rect: Rect,
    /// Samples mapped to vertices
    active_rect: Rect,
    bounds: Aabb,
    lod: usize,
    /// Squared switch distance per LOD, ascending
    lod_variance: Vec<f32>,
    neighbors: [Option<u32>; 4],
    vertices: Vec<TerrainVertex>,
    vertex_buffer: Option<ResourceHandle>,
    texture_data: LandscapeTextureData,
    visible: bool,
    db_id: i64,
}

impl TerrainBlock {
    pub fn new(index: u32, grid: (u32, u32), geometry: &BlockGeometry, texture_data: LandscapeTextureData) -> Self {
        let quads = geometry.block_size as i32 - 1;
        let left = grid.0 as i32 * quads;
        let top = grid.1 as i32 * quads;
        let active_rect = Rect::new(left, top, left + quads + 1, top + quads + 1);
        let field = Rect::from_size(geometry.field_size);
        let managed_rect = active_rect.inflate(1).intersect(&field).unwrap_or(active_rect);

        Self {
            index,
            grid,
            managed_rect,
            active_rect,
            bounds: Aabb::EMPTY,
            lod: 0,
            lod_variance: Vec::new(),
            neighbors: [None; 4],
            vertices: Vec::new(),
            vertex_buffer: None,
            texture_data,
            visible: false,
            db_id: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn grid(&self) -> (u32, u32) {
        self.grid
    }

    pub fn managed_rect(&self) -> Rect {
        self.managed_rect
    }

    pub fn active_rect(&self) -> Rect {
        self.active_rect
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn lod(&self) -> usize {
        self.lod
    }

    pub fn set_lod(&mut self, lod: usize) {
        self.lod = lod.min(self.lod_variance.len().saturating_sub(1));
    }

    pub fn lod_variance(&self) -> &[f32] {
        &self.lod_variance
    }

    pub fn set_lod_variance(&mut self, variance: Vec<f32>) {
        self.lod_variance = variance;
    }

    pub fn neighbor(&self, side: EdgeSide) -> Option<u32> {
        self.neighbors[side as usize]
    }

    pub fn set_neighbor(&mut self, side: EdgeSide, block: Option<u32>) {
        self.neighbors[side as usize] = block;
    }

    pub fn vertices(&self) -> &[TerrainVertex] {
        &self.vertices
    }

    pub fn vertex_buffer(&self) -> Option<ResourceHandle> {
        self.vertex_buffer
    }

    pub fn texture_data(&self) -> &LandscapeTextureData {
        &self.texture_data
    }

    pub fn texture_data_mut(&mut self) -> &mut LandscapeTextureData {
        &mut self.texture_data
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn db_id(&self) -> i64 {
        self.db_id
    }

    pub fn set_db_id(&mut self, id: i64) {
        self.db_id = id;
    }

    /// Rebuild vertices, bounds and variance from the height field and
    /// upload the vertex buffer. Called on import, load and height edits.
    pub fn data_updated(
        &mut self,
        field: &HeightField,
        geometry: &BlockGeometry,
        lookup: &MipLookup,
        provider: &mut dyn ResourceProvider,
    ) -> Result<()> {
        self.build_vertices(field, geometry, lookup);
        self.lod_variance = self.compute_variance(field, geometry, lookup);
        self.lod = self.lod.min(self.lod_variance.len().saturating_sub(1));
        self.upload_vertices(provider)
    }

    /// CPU side of [`Self::data_updated`]
    pub fn build_vertices(&mut self, field: &HeightField, geometry: &BlockGeometry, lookup: &MipLookup) {
        let transform = &geometry.transform;
        let (left, top) = (self.active_rect.left, self.active_rect.top);

        self.vertices.clear();
        self.vertices.reserve(lookup.positions().len());
        let mut bounds = Aabb::EMPTY;
        for &(x, y) in lookup.positions() {
            let (sx, sy) = (left + x as i32, top + y as i32);
            let position = transform.sample_to_world(sx as f32, sy as f32, field.cell(sx, sy) as f32);
            bounds.expand(position);
            self.vertices.push(TerrainVertex {
                position: position.to_array(),
                normal: field.normal_at(sx, sy, transform.scale).to_array(),
                color: field.color(sx, sy),
            });
        }

        bounds.min.y -= 1.0;
        bounds.max.y += 1.0;
        self.bounds = bounds;
    }

    /// Squared switch distance for each LOD.
    ///
    /// The error of level `i` is the largest gap between a real sample and
    /// what the level's coarse quads interpolate at their edge midpoints and
    /// centers, clamped so coarser levels never report less error.
    pub fn compute_variance(&self, field: &HeightField, geometry: &BlockGeometry, lookup: &MipLookup) -> Vec<f32> {
        let quads = lookup.quads();
        let level_count = (quads.trailing_zeros() as usize).min(super::lod::MAX_LANDSCAPE_LOD);
        let (left, top) = (self.active_rect.left, self.active_rect.top);
        let h = |x: u32, y: u32| field.cell(left + x as i32, top + y as i32) as f32;

        let mut variance = vec![0.0f32; level_count.max(1)];
        let mut previous = 0.0f32;
        for (level, slot) in variance.iter_mut().enumerate().skip(1) {
            let step = 1u32 << level;
            let half = step / 2;
            let mut error = 0.0f32;
            for y in (0..quads).step_by(step as usize) {
                for x in (0..quads).step_by(step as usize) {
                    let (h00, h10) = (h(x, y), h(x + step, y));
                    let (h01, h11) = (h(x, y + step), h(x + step, y + step));
                    let checks = [
                        (h(x + half, y), (h00 + h10) * 0.5),
                        (h(x + half, y + step), (h01 + h11) * 0.5),
                        (h(x, y + half), (h00 + h01) * 0.5),
                        (h(x + step, y + half), (h10 + h11) * 0.5),
                        (h(x + half, y + half), (h00 + h11) * 0.5),
                    ];
                    for (actual, interpolated) in checks {
                        error = error.max((actual - interpolated).abs());
                    }
                }
            }
            let world_error = (error * geometry.transform.scale.y.abs()).max(previous);
            previous = world_error;
            let distance = world_error * geometry.variance_scale * step as f32;
            *slot = distance * distance;
        }
        variance
    }

    fn upload_vertices(&mut self, provider: &mut dyn ResourceProvider) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(&self.vertices);
        let handle = match self.vertex_buffer {
            Some(handle) => handle,
            None => {
                let handle = provider
                    .create_vertex_buffer(bytes.len(), TERRAIN_VERTEX_FORMAT.stride)
                    .ok_or_else(|| Error::Resource(format!("vertex buffer for block {}", self.index)))?;
                self.vertex_buffer = Some(handle);
                handle
            }
        };
        if !write_buffer(provider, handle, bytes) {
            return Err(Error::Resource(format!("vertex upload for block {}", self.index)));
        }
        Ok(())
    }

    pub fn release(&mut self, provider: &mut dyn ResourceProvider) {
        if let Some(handle) = self.vertex_buffer.take() {
            provider.release(handle);
        }
        self.texture_data.release(provider);
    }

    /// Pick the LOD for a camera position.
    ///
    /// Distance is measured to where the camera-to-center ray enters the
    /// bounds. The coarsest level whose threshold (scaled by `detail`) the
    /// squared distance reaches wins; `bias` then shifts the result.
    pub fn calculate_lod(&mut self, eye: Vec3, detail: f32, bias: i32, ignore_y: bool) -> usize {
        if self.lod_variance.is_empty() {
            self.lod = 0;
            return 0;
        }
        let center = self.bounds.center();
        let eye = if ignore_y { Vec3::new(eye.x, center.y, eye.z) } else { eye };

        let length = eye.distance(center);
        let distance = if length <= f32::EPSILON || self.bounds.contains_point(eye) {
            0.0
        } else {
            Ray::between(eye, center)
                .intersects_aabb(&self.bounds)
                .map_or(length, |(t_near, _)| t_near * length)
        };
        let distance_sq = distance * distance;

        let mut lod = 0;
        for (level, threshold) in self.lod_variance.iter().enumerate() {
            if distance_sq >= threshold * detail {
                lod = level;
            }
        }
        let max = self.lod_variance.len() as i32 - 1;
        self.lod = (lod as i32 + bias).clamp(0, max) as usize;
        self.lod
    }

    /// World height at world XZ, interpolated the way the current LOD
    /// triangulates the block
    pub fn lod_height(&self, field: &HeightField, transform: &TerrainTransform, x: f32, z: f32) -> Option<f32> {
        let (sx, sy) = transform.world_to_sample(x, z);
        let lx = sx - self.active_rect.left as f32;
        let ly = sy - self.active_rect.top as f32;
        let quads = (self.active_rect.width() - 1) as f32;
        if lx < 0.0 || ly < 0.0 || lx > quads || ly > quads {
            return None;
        }

        let step = (1u32 << self.lod) as f32;
        let cx = ((lx / step).floor() * step).min(quads - step);
        let cy = ((ly / step).floor() * step).min(quads - step);
        let (fx, fy) = ((lx - cx) / step, (ly - cy) / step);

        let h = |x: f32, y: f32| field.cell(self.active_rect.left + x as i32, self.active_rect.top + y as i32) as f32;
        let h00 = h(cx, cy);
        let h10 = h(cx + step, cy);
        let h01 = h(cx, cy + step);
        let h11 = h(cx + step, cy + step);
        let height = if fx >= fy {
            h00 + fx * (h10 - h00) + fy * (h11 - h10)
        } else {
            h00 + fy * (h01 - h00) + fx * (h11 - h01)
        };
        Some(transform.height_to_world(height))
    }

    /// Submit the block at its current LOD.
    ///
    /// `neighbor_lods` holds the LOD across each edge (`None` at the
    /// landscape border); coarser neighbours select the matching skirts.
    pub fn draw(
        &mut self,
        driver: &mut dyn RenderDriver,
        mode: RenderMode,
        table: &LodTable,
        neighbor_lods: [Option<usize>; 4],
        world: &Mat4,
        paint_states: Option<&PaintDrawStates>,
    ) -> Result<()> {
        let Some(vertex_buffer) = self.vertex_buffer else {
            return Ok(());
        };
        let Some(level) = table.level(self.lod) else {
            return Err(Error::Render(format!("block {} has no LOD level {}", self.index, self.lod)));
        };
        let Some(index_buffer) = level.index_buffer() else {
            return Err(Error::Render(format!("LOD level {} not uploaded", self.lod)));
        };

        let mut deltas = [0usize; 4];
        for edge in EdgeSide::ALL {
            let variants = level.skirt_variants(edge);
            let neighbor = neighbor_lods[edge as usize].unwrap_or(self.lod);
            deltas[edge as usize] = neighbor.saturating_sub(self.lod).min(variants.saturating_sub(1));
        }
        let ranges = level.draw_ranges(deltas);
        let vertex_count = level.vertex_count();

        driver.set_stream_source(0, vertex_buffer, TERRAIN_VERTEX_FORMAT.stride);
        driver.set_indices(index_buffer);
        driver.set_vertex_format(&TERRAIN_VERTEX_FORMAT);
        driver.set_world_transform(world);

        if mode != RenderMode::Painted {
            submit(driver, &ranges, vertex_count);
            return Ok(());
        }

        let Some(states) = paint_states else {
            return Ok(());
        };
        if !self.texture_data.begin_draw() {
            return Ok(());
        }
        loop {
            if !self.texture_data.begin_draw_pass(driver, states)? {
                break;
            }
            submit(driver, &ranges, vertex_count);
            if !self.texture_data.end_draw_pass() {
                break;
            }
        }
        Ok(())
    }
}

fn submit(driver: &mut dyn RenderDriver, ranges: &[IndexRange], vertex_count: u32) {
    for range in ranges {
        driver.draw_indexed_primitive(
            PrimitiveTopology::TriangleList,
            0,
            0,
            vertex_count,
            range.start,
            range.primitive_count,
        );
    }
}
