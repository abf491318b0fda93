//! Shared LOD index data for terrain blocks
//!
//! Every block uses one vertex buffer whose vertices are ordered by the
//! [`MipLookup`] so that the vertices of coarser levels come first. A level
//! `L` (step `2^L`) therefore only touches the first `(quads / 2^L + 1)^2`
//! vertices, and the same index data serves every block.
//!
//! Each [`LodLevel`] stores, in one index buffer:
//! - the interior triangles (quads not touching the block border), then
//! - for each edge (N, E, S, W) and each relative neighbour LOD `delta`, a
//!   mitered skirt joining the border to the ring one step inside it.
//!
//! A skirt for `delta` walks the outer edge at the neighbour's step
//! (`2^(L + delta)`) and the inner ring at the block's own step, so a finer
//! block always matches the vertices of a coarser neighbour exactly.

use crate::core::error::Error;
use crate::core::types::Result;
use crate::render::{ResourceHandle, ResourceProvider};
use crate::render::driver::write_buffer;

/// Hard cap on the number of levels per landscape
pub const MAX_LANDSCAPE_LOD: usize = 7;

/// Index buffers hold `u32` indices
pub const BYTES_PER_INDEX: usize = std::mem::size_of::<u32>();

/// Block edge, in skirt storage order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeSide {
    /// Row 0 (minimum Z)
    North = 0,
    /// Last column (maximum X)
    East = 1,
    /// Last row (maximum Z)
    South = 2,
    /// Column 0 (minimum X)
    West = 3,
}

impl EdgeSide {
    pub const ALL: [EdgeSide; 4] = [EdgeSide::North, EdgeSide::East, EdgeSide::South, EdgeSide::West];

    /// Block-grid offset of the neighbour across this edge
    pub fn neighbor_offset(self) -> (i32, i32) {
        match self {
            EdgeSide::North => (0, -1),
            EdgeSide::East => (1, 0),
            EdgeSide::South => (0, 1),
            EdgeSide::West => (-1, 0),
        }
    }

    pub fn opposite(self) -> EdgeSide {
        match self {
            EdgeSide::North => EdgeSide::South,
            EdgeSide::East => EdgeSide::West,
            EdgeSide::South => EdgeSide::North,
            EdgeSide::West => EdgeSide::East,
        }
    }

    /// Map (position along edge, depth inward) to block-local grid coordinates
    fn to_grid(self, along: u32, depth: u32, quads: u32) -> (u32, u32) {
        match self {
            EdgeSide::North => (along, depth),
            EdgeSide::South => (along, quads - depth),
            EdgeSide::West => (depth, along),
            EdgeSide::East => (quads - depth, along),
        }
    }
}

/// Validate a block size and return its quad count per side
pub fn block_quads(block_size: u32) -> Result<u32> {
    let quads = block_size.saturating_sub(1);
    if quads < 2 || !quads.is_power_of_two() {
        return Err(Error::Geometry(format!(
            "block size {} is not 2^n + 1 vertices (n >= 1)",
            block_size
        )));
    }
    Ok(quads)
}

/// Number of LOD levels for a block size
pub fn level_count(block_size: u32) -> Result<usize> {
    let quads = block_quads(block_size)?;
    Ok((quads.trailing_zeros() as usize).min(MAX_LANDSCAPE_LOD))
}

/// Grid position to vertex slot table, coarse vertices first
#[derive(Clone, Debug, PartialEq)]
pub struct MipLookup {
    block_size: u32,
    slots: Vec<u32>,
    positions: Vec<(u32, u32)>,
}

impl MipLookup {
    pub fn new(block_size: u32) -> Result<Self> {
        let quads = block_quads(block_size)?;
        let count = (block_size * block_size) as usize;
        let mut slots = vec![u32::MAX; count];
        let mut positions = Vec::with_capacity(count);

        let mut step = quads;
        loop {
            for y in (0..=quads).step_by(step as usize) {
                for x in (0..=quads).step_by(step as usize) {
                    let i = (x + y * block_size) as usize;
                    if slots[i] == u32::MAX {
                        slots[i] = positions.len() as u32;
                        positions.push((x, y));
                    }
                }
            }
            if step == 1 {
                break;
            }
            step /= 2;
        }

        Ok(Self { block_size, slots, positions })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn quads(&self) -> u32 {
        self.block_size - 1
    }

    /// Vertex slot of block-local grid position `(x, y)`
    pub fn slot(&self, x: u32, y: u32) -> u32 {
        self.slots[(x + y * self.block_size) as usize]
    }

    /// Block-local grid positions in slot order
    pub fn positions(&self) -> &[(u32, u32)] {
        &self.positions
    }

    /// Vertices referenced by a level
    pub fn vertex_count(&self, level: usize) -> u32 {
        let n = (self.quads() >> level) + 1;
        n * n
    }
}

/// A run of triangles in a level's index buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexRange {
    pub start: u32,
    pub primitive_count: u32,
}

impl IndexRange {
    pub fn end(&self) -> u32 {
        self.start + self.primitive_count * 3
    }
}

/// Index layout of one LOD level
#[derive(Clone, Debug)]
pub struct LodLevel {
    level: usize,
    interior: IndexRange,
    skirts: [Vec<IndexRange>; 4],
    indices: Vec<u32>,
    vertex_count: u32,
    index_buffer: Option<ResourceHandle>,
}

struct TriangleWriter<'a> {
    lookup: &'a MipLookup,
    indices: Vec<u32>,
}

impl TriangleWriter<'_> {
    /// Emit a triangle counter-clockwise in grid space (x right, y down)
    fn push(&mut self, a: (u32, u32), b: (u32, u32), c: (u32, u32)) {
        let cross = (b.0 as i64 - a.0 as i64) * (c.1 as i64 - a.1 as i64)
            - (b.1 as i64 - a.1 as i64) * (c.0 as i64 - a.0 as i64);
        let (b, c) = if cross < 0 { (c, b) } else { (b, c) };
        for (x, y) in [a, b, c] {
            self.indices.push(self.lookup.slot(x, y));
        }
    }

    fn len(&self) -> u32 {
        self.indices.len() as u32
    }
}

impl LodLevel {
    /// Build the CPU index layout for `level`
    pub fn generate(lookup: &MipLookup, level: usize, level_count: usize) -> Self {
        let quads = lookup.quads();
        let step = 1u32 << level;
        let n = quads / step;
        let mut writer = TriangleWriter { lookup, indices: Vec::new() };

        // Interior quads, split along the (0,0)-(1,1) diagonal
        for qy in 1..n.saturating_sub(1) {
            for qx in 1..n.saturating_sub(1) {
                let (x0, y0) = (qx * step, qy * step);
                let (x1, y1) = (x0 + step, y0 + step);
                writer.push((x0, y0), (x1, y0), (x1, y1));
                writer.push((x0, y0), (x1, y1), (x0, y1));
            }
        }
        let interior = IndexRange { start: 0, primitive_count: writer.len() / 3 };

        let mut skirts: [Vec<IndexRange>; 4] = Default::default();
        for edge in EdgeSide::ALL {
            for delta in 0..level_count - level {
                let start = writer.len();
                Self::emit_skirt(&mut writer, edge, quads, step, step << delta);
                skirts[edge as usize].push(IndexRange {
                    start,
                    primitive_count: (writer.len() - start) / 3,
                });
            }
        }

        Self {
            level,
            interior,
            skirts,
            indices: writer.indices,
            vertex_count: lookup.vertex_count(level),
            index_buffer: None,
        }
    }

    /// Zip the outer edge (neighbour step) against the inner ring (own step).
    ///
    /// The outer edge has `quads / outer_step` segments and the inner ring
    /// `quads / step - 2`, so the skirt has their sum in triangles. When both
    /// candidates sit at the same position the outer vertex is taken first.
    fn emit_skirt(writer: &mut TriangleWriter, edge: EdgeSide, quads: u32, step: u32, outer_step: u32) {
        let outer_segments = quads / outer_step;
        let inner_segments = quads / step - 2;
        let outer = |i: u32| edge.to_grid(i * outer_step, 0, quads);
        let inner = |j: u32| edge.to_grid(step * (j + 1), step, quads);

        let (mut i, mut j) = (0u32, 0u32);
        while i < outer_segments || j < inner_segments {
            let advance_outer = if i == outer_segments {
                false
            } else if j == inner_segments {
                true
            } else {
                (i + 1) * outer_step <= step * (j + 2)
            };

            if advance_outer {
                writer.push(outer(i), outer(i + 1), inner(j));
                i += 1;
            } else {
                writer.push(outer(i), inner(j + 1), inner(j));
                j += 1;
            }
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn interior(&self) -> IndexRange {
        self.interior
    }

    /// Skirt for `edge` against a neighbour `delta` levels coarser
    pub fn skirt(&self, edge: EdgeSide, delta: usize) -> Option<IndexRange> {
        self.skirts[edge as usize].get(delta).copied()
    }

    pub fn skirt_variants(&self, edge: EdgeSide) -> usize {
        self.skirts[edge as usize].len()
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn byte_len(&self) -> usize {
        self.indices.len() * BYTES_PER_INDEX
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_buffer(&self) -> Option<ResourceHandle> {
        self.index_buffer
    }

    /// Index runs to draw for the given per-edge neighbour deltas, with
    /// adjacent runs merged so the block needs as few draw calls as possible.
    pub fn draw_ranges(&self, deltas: [usize; 4]) -> Vec<IndexRange> {
        let mut ranges: Vec<IndexRange> = Vec::with_capacity(5);
        let skirts = EdgeSide::ALL.iter().filter_map(|&edge| {
            let variants = self.skirt_variants(edge);
            if variants == 0 {
                return None;
            }
            self.skirt(edge, deltas[edge as usize].min(variants - 1))
        });

        for range in std::iter::once(self.interior).chain(skirts) {
            if range.primitive_count == 0 {
                continue;
            }
            match ranges.last_mut() {
                Some(last) if last.end() == range.start => last.primitive_count += range.primitive_count,
                _ => ranges.push(range),
            }
        }
        ranges
    }

    fn upload(&mut self, provider: &mut dyn ResourceProvider) -> Result<()> {
        let handle = provider.create_index_buffer(self.byte_len()).ok_or_else(|| {
            Error::Resource(format!("failed to allocate index buffer for LOD {}", self.level))
        })?;
        if !write_buffer(provider, handle, bytemuck::cast_slice(&self.indices)) {
            provider.release(handle);
            return Err(Error::Resource(format!("failed to fill index buffer for LOD {}", self.level)));
        }
        self.index_buffer = Some(handle);
        Ok(())
    }
}

/// All LOD levels of a landscape plus the lookup they were built from
#[derive(Clone, Debug)]
pub struct LodTable {
    lookup: MipLookup,
    levels: Vec<LodLevel>,
}

impl LodTable {
    /// Build CPU index data for every level
    pub fn new(block_size: u32) -> Result<Self> {
        let lookup = MipLookup::new(block_size)?;
        let count = level_count(block_size)?;
        let levels = (0..count).map(|level| LodLevel::generate(&lookup, level, count)).collect();
        Ok(Self { lookup, levels })
    }

    /// Create and fill one index buffer per level
    pub fn upload(&mut self, provider: &mut dyn ResourceProvider) -> Result<()> {
        for i in 0..self.levels.len() {
            if let Err(e) = self.levels[i].upload(provider) {
                log::error!("LOD table upload failed: {}", e);
                self.release(provider);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn release(&mut self, provider: &mut dyn ResourceProvider) {
        for level in &mut self.levels {
            if let Some(handle) = level.index_buffer.take() {
                provider.release(handle);
            }
        }
    }

    pub fn lookup(&self) -> &MipLookup {
        &self.lookup
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> Option<&LodLevel> {
        self.levels.get(level)
    }

    pub fn levels(&self) -> &[LodLevel] {
        &self.levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::CommandRecorder;
    use std::collections::HashSet;

    #[test]
    fn test_block_size_validation() {
        assert!(block_quads(33).is_ok());
        assert!(block_quads(3).is_ok());
        assert!(block_quads(2).is_err());
        assert!(block_quads(32).is_err());
        assert_eq!(level_count(3).unwrap(), 1);
        assert_eq!(level_count(33).unwrap(), 5);
        assert_eq!(level_count(513).unwrap(), MAX_LANDSCAPE_LOD);
    }

    #[test]
    fn test_mip_lookup_orders_coarse_first() {
        let lookup = MipLookup::new(9).unwrap();
        // Corners are the coarsest vertices
        let corners: HashSet<u32> = [(0, 0), (8, 0), (0, 8), (8, 8)]
            .iter()
            .map(|&(x, y)| lookup.slot(x, y))
            .collect();
        assert_eq!(corners, (0..4).collect::<HashSet<u32>>());

        for level in 0..3 {
            let step = 1 << level;
            let limit = lookup.vertex_count(level);
            for y in (0..=8).step_by(step) {
                for x in (0..=8).step_by(step) {
                    assert!(lookup.slot(x, y) < limit);
                }
            }
        }

        let unique: HashSet<u32> = (0..81).map(|i| lookup.slot(i % 9, i / 9)).collect();
        assert_eq!(unique.len(), 81);
        assert_eq!(lookup.positions().len(), 81);
    }

    #[test]
    fn test_index_buffer_length_matches_primitive_counts() {
        let table = LodTable::new(33).unwrap();
        for level in table.levels() {
            let mut primitives = level.interior().primitive_count as usize;
            for edge in EdgeSide::ALL {
                for delta in 0..level.skirt_variants(edge) {
                    primitives += level.skirt(edge, delta).unwrap().primitive_count as usize;
                }
            }
            assert_eq!(primitives * 3 * BYTES_PER_INDEX, level.byte_len());
        }
    }

    #[test]
    fn test_skirt_triangle_counts() {
        let table = LodTable::new(17).unwrap();
        let quads = 16;
        for level in table.levels() {
            let n = quads >> level.level();
            for edge in EdgeSide::ALL {
                for delta in 0..level.skirt_variants(edge) {
                    let neighbor = quads >> (level.level() + delta);
                    let skirt = level.skirt(edge, delta).unwrap();
                    assert_eq!(skirt.primitive_count as usize, n + neighbor - 2);
                }
            }
        }
    }

    #[test]
    fn test_level_covers_block_area() {
        // Every triangle is non-degenerate and total area equals the block area
        let lookup = MipLookup::new(17).unwrap();
        let table = LodTable::new(17).unwrap();
        for level in table.levels() {
            let positions = lookup.positions();
            let mut area2 = 0i64;
            let interior = level.interior();
            let n_tris = |r: IndexRange| (r.start as usize / 3)..(r.end() as usize / 3);
            let mut ranges = vec![interior];
            for edge in EdgeSide::ALL {
                ranges.push(level.skirt(edge, 0).unwrap());
            }
            for range in ranges {
                for t in n_tris(range) {
                    let tri: Vec<(i64, i64)> = level.indices()[t * 3..t * 3 + 3]
                        .iter()
                        .map(|&i| (positions[i as usize].0 as i64, positions[i as usize].1 as i64))
                        .collect();
                    let cross = (tri[1].0 - tri[0].0) * (tri[2].1 - tri[0].1)
                        - (tri[1].1 - tri[0].1) * (tri[2].0 - tri[0].0);
                    assert!(cross > 0);
                    area2 += cross;
                }
            }
            assert_eq!(area2, 2 * 16 * 16);
        }
    }

    #[test]
    fn test_coarser_skirt_uses_neighbor_vertices_only() {
        let lookup = MipLookup::new(17).unwrap();
        let table = LodTable::new(17).unwrap();
        let level = table.level(0).unwrap();
        let skirt = level.skirt(EdgeSide::North, 2).unwrap();
        let positions = lookup.positions();
        for &i in &level.indices()[skirt.start as usize..skirt.end() as usize] {
            let (x, y) = positions[i as usize];
            if y == 0 {
                assert_eq!(x % 4, 0, "outer vertex {} not on the neighbour grid", x);
            }
        }
    }

    #[test]
    fn test_draw_ranges_merge_contiguous() {
        let table = LodTable::new(9).unwrap();
        let coarsest = table.level(table.level_count() - 1).unwrap();
        // Only delta 0 exists at the coarsest level, so everything is contiguous
        let ranges = coarsest.draw_ranges([0; 4]);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].end() as usize, coarsest.indices().len());

        let finest = table.level(0).unwrap();
        let ranges = finest.draw_ranges([0, 1, 2, 0]);
        let total: u32 = ranges.iter().map(|r| r.primitive_count).sum();
        let expected = finest.interior().primitive_count
            + finest.skirt(EdgeSide::North, 0).unwrap().primitive_count
            + finest.skirt(EdgeSide::East, 1).unwrap().primitive_count
            + finest.skirt(EdgeSide::South, 2).unwrap().primitive_count
            + finest.skirt(EdgeSide::West, 0).unwrap().primitive_count;
        assert_eq!(total, expected);
        // Interior and the north delta-0 skirt are adjacent
        assert_eq!(ranges[0].primitive_count,
            finest.interior().primitive_count + finest.skirt(EdgeSide::North, 0).unwrap().primitive_count);
    }

    #[test]
    fn test_upload_and_allocation_failure() {
        let mut recorder = CommandRecorder::new();
        let mut table = LodTable::new(17).unwrap();
        table.upload(&mut recorder).unwrap();
        for level in table.levels() {
            let handle = level.index_buffer().unwrap();
            assert_eq!(recorder.contents(handle).unwrap().len(), level.byte_len());
        }

        let mut failing = CommandRecorder::new();
        failing.limit_allocations(1);
        let mut table = LodTable::new(17).unwrap();
        assert!(matches!(table.upload(&mut failing), Err(Error::Resource(_))));
        assert_eq!(failing.live_resources(), 0);
        assert!(table.levels().iter().all(|l| l.index_buffer().is_none()));
    }
}
