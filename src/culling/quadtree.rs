//! Quadtree over the terrain block grid
//!
//! Nodes live in an arena and are pushed children-first, so walking the
//! arena in index order visits every child before its parent. Each node
//! carries two horizon planes fitted to the terrain under it: the minimum
//! plane lies below every sample and is rasterized as an occluder, the
//! maximum plane lies above every sample and is tested as an occludee.
//!
//! A leaf rasterizes its occluder as soon as it passes the occlusion test, so
//! everything behind it is tested against the updated horizon. Internal nodes
//! only test; their floor is the union of their leaves' floors.

use crate::core::types::{Vec2, Vec3};
use crate::core::{Error, Result};
use crate::math::{Aabb, Containment, Frustum, HeightPlane, Plane, PlaneFit, Size};
use super::horizon::{flipped, HorizonBuffer, QuadVisibility};
use super::visibility::{ObjectCullTable, ObjectId, ObjectRegistry, VisibilitySink};

pub type NodeId = u32;

/// Angle (radians) under which sibling minimum planes share their parent's quad
pub const COLLAPSE_TOLERANCE: f32 = 0.1;

/// Horizon occlusion geometry of one node
#[derive(Clone, Copy, Debug)]
pub struct NodeHorizon {
    pub min_plane: HeightPlane,
    pub max_plane: HeightPlane,
    /// Occluder outline of a leaf; `None` for internal nodes and for leaves
    /// that draw the shared plane of a collapsed ancestor
    pub min_quad: Option<[Vec3; 4]>,
    pub max_quad: [Vec3; 4],
    /// Leaves below draw `min_plane` over their own footprint
    pub shared: bool,
}

impl NodeHorizon {
    fn flat(height: f32, bounds: &Aabb) -> Self {
        let plane = HeightPlane::flat(height);
        Self {
            min_plane: plane,
            max_plane: plane,
            min_quad: Some(quad_points(bounds, &plane)),
            max_quad: quad_points(bounds, &plane),
            shared: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QuadNode {
    pub bounds: Aabb,
    /// 0 = (min X, min Z), 1 = (max X, min Z), 2 = (min X, max Z), 3 = (max X, max Z)
    pub children: [Option<NodeId>; 4],
    /// World XZ where the children split
    pub split: Vec2,
    pub leaf: Option<u32>,
    pub horizon: NodeHorizon,
}

impl QuadNode {
    pub fn is_leaf(&self) -> bool {
        self.leaf.is_some()
    }
}

/// One grid cell of the tree
#[derive(Clone, Debug)]
pub struct Leaf {
    pub cell: (u32, u32),
    pub bounds: Aabb,
    /// Block drawn for this cell, `None` where no block fits
    pub block: Option<u32>,
    pub objects: Vec<ObjectId>,
}

/// Block data a leaf is built from
#[derive(Clone, Debug)]
pub struct LeafInput {
    pub block_index: u32,
    pub bounds: Aabb,
    /// World positions of the block's height samples
    pub samples: Vec<Vec3>,
}

/// Per-frame occlusion counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OcclusionStats {
    /// Nodes whose maximum quad had at least one testable edge
    pub tested: u32,
    pub occluded: u32,
}

impl OcclusionStats {
    /// Fraction of tested nodes that were rejected
    pub fn success_ratio(&self) -> Option<f32> {
        (self.tested > 0).then(|| self.occluded as f32 / self.tested as f32)
    }
}

/// Inputs of one visibility traversal
pub struct Traversal<'a> {
    pub frustum: &'a Frustum,
    pub eye: Vec3,
    /// Occlusion runs only when a horizon buffer is supplied
    pub horizon: Option<&'a mut HorizonBuffer>,
    /// Vertical plane through the eye facing the flattened view direction
    pub near_plane: Plane,
    pub near_margin: f32,
    pub cull: &'a ObjectCullTable,
    pub objects: &'a ObjectRegistry,
}

/// Depth-bounded quadtree over a `layout` grid of terrain blocks
#[derive(Clone, Debug)]
pub struct SpatialQuadtree {
    nodes: Vec<QuadNode>,
    leaves: Vec<Leaf>,
    root: Option<NodeId>,
    layout: Size,
    origin: Vec2,
    cell_size: Vec2,
    depth: u32,
}

impl SpatialQuadtree {
    /// Build the tree. `inputs` is indexed by `x + y * layout.width`;
    /// cells without input become flat leaves at `flat_y`.
    pub fn build(
        layout: Size,
        origin: Vec2,
        cell_size: Vec2,
        mut inputs: Vec<Option<LeafInput>>,
        flat_y: f32,
    ) -> Result<Self> {
        if layout.is_empty() {
            return Err(Error::Degenerate("quadtree layout has no cells".into()));
        }
        if cell_size.x <= 0.0 || cell_size.y <= 0.0 {
            return Err(Error::Degenerate(format!("quadtree cell size {cell_size}")));
        }
        if inputs.len() != layout.area() {
            return Err(Error::Degenerate(format!(
                "{} leaf inputs for a {}x{} layout",
                inputs.len(),
                layout.width,
                layout.height
            )));
        }

        let largest = layout.width.max(layout.height);
        let depth = largest.next_power_of_two().trailing_zeros();
        let mut tree = Self {
            nodes: Vec::new(),
            leaves: Vec::new(),
            root: None,
            layout,
            origin,
            cell_size,
            depth,
        };
        let root = tree.build_node(0, 0, 1 << depth, &mut inputs, flat_y);
        tree.root = Some(root);
        tree.update_internal_nodes();

        log::debug!(
            "Built landscape quadtree: depth {}, {} nodes, {} leaves",
            depth,
            tree.nodes.len(),
            tree.leaves.len()
        );
        Ok(tree)
    }

    fn build_node(&mut self, x0: u32, y0: u32, span: u32, inputs: &mut [Option<LeafInput>], flat_y: f32) -> NodeId {
        let split = self.origin + Vec2::new((x0 + span / 2) as f32, (y0 + span / 2) as f32) * self.cell_size;

        if span == 1 {
            let cell_min = self.origin + Vec2::new(x0 as f32, y0 as f32) * self.cell_size;
            let cell_max = cell_min + self.cell_size;
            let input = inputs[(x0 + y0 * self.layout.width) as usize].take();
            let (leaf, horizon) = match input {
                Some(input) => {
                    let horizon = leaf_horizon(&input.bounds, &input.samples);
                    let leaf = Leaf {
                        cell: (x0, y0),
                        bounds: input.bounds,
                        block: Some(input.block_index),
                        objects: Vec::new(),
                    };
                    (leaf, horizon)
                }
                None => {
                    let bounds = Aabb::new(
                        Vec3::new(cell_min.x, flat_y, cell_min.y),
                        Vec3::new(cell_max.x, flat_y, cell_max.y),
                    );
                    let leaf = Leaf { cell: (x0, y0), bounds, block: None, objects: Vec::new() };
                    (leaf, NodeHorizon::flat(flat_y, &bounds))
                }
            };

            let bounds = leaf.bounds;
            self.leaves.push(leaf);
            self.nodes.push(QuadNode {
                bounds,
                children: [None; 4],
                split,
                leaf: Some(self.leaves.len() as u32 - 1),
                horizon,
            });
            return self.nodes.len() as NodeId - 1;
        }

        let half = span / 2;
        let mut children = [None; 4];
        let corners = [(x0, y0), (x0 + half, y0), (x0, y0 + half), (x0 + half, y0 + half)];
        for (slot, (cx, cy)) in corners.into_iter().enumerate() {
            if cx < self.layout.width && cy < self.layout.height {
                children[slot] = Some(self.build_node(cx, cy, half, inputs, flat_y));
            }
        }

        self.nodes.push(QuadNode {
            bounds: Aabb::EMPTY,
            children,
            split,
            leaf: None,
            horizon: NodeHorizon::flat(flat_y, &Aabb::default()),
        });
        self.nodes.len() as NodeId - 1
    }

    /// Recompute bounds and horizon geometry of every internal node from
    /// its children, collapsing matching siblings.
    pub fn update_internal_nodes(&mut self) {
        for id in 0..self.nodes.len() {
            if self.nodes[id].is_leaf() {
                let node = &mut self.nodes[id];
                node.horizon.min_quad = Some(quad_points(&node.bounds, &node.horizon.min_plane));
                node.horizon.max_quad = quad_points(&node.bounds, &node.horizon.max_plane);
                continue;
            }

            let children: Vec<usize> = self.nodes[id].children.iter().flatten().map(|c| *c as usize).collect();
            let mut bounds = Aabb::EMPTY;
            let mut min_corners = Vec::with_capacity(16);
            let mut max_corners = Vec::with_capacity(16);
            for &child in &children {
                let node = &self.nodes[child];
                bounds = bounds.merged(&node.bounds);
                min_corners.extend(quad_points(&node.bounds, &node.horizon.min_plane));
                max_corners.extend(quad_points(&node.bounds, &node.horizon.max_plane));
            }

            let mut fit = PlaneFit::new();
            fit.extend(&min_corners);
            fit.extend(&max_corners);
            let plane = fit.solve();
            let min_plane = plane.supporting_below(&min_corners);
            let max_plane = plane.supporting_above(&max_corners);

            let collapse = children.len() == 4
                && children.iter().all(|a| {
                    children.iter().all(|b| {
                        let (pa, pb) = (&self.nodes[*a].horizon.min_plane, &self.nodes[*b].horizon.min_plane);
                        pa.angle_to(pb) < COLLAPSE_TOLERANCE
                    })
                });
            if collapse {
                for &child in &children {
                    self.nodes[child].horizon.min_quad = None;
                }
            }

            let node = &mut self.nodes[id];
            node.bounds = bounds;
            node.horizon = NodeHorizon {
                min_plane,
                max_plane,
                min_quad: None,
                max_quad: quad_points(&bounds, &max_plane),
                shared: collapse,
            };
        }
    }

    /// Refit the leaf of `block_index` after a height edit. Call
    /// [`Self::update_internal_nodes`] once all edited leaves are refit.
    pub fn update_leaf(&mut self, block_index: u32, bounds: Aabb, samples: &[Vec3]) -> bool {
        let Some(leaf) = self.leaves.iter().position(|l| l.block == Some(block_index)) else {
            return false;
        };
        self.leaves[leaf].bounds = bounds;
        let Some(node) = self.nodes.iter_mut().find(|n| n.leaf == Some(leaf as u32)) else {
            return false;
        };
        node.bounds = bounds;
        node.horizon = leaf_horizon(&bounds, samples);
        true
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&QuadNode> {
        self.nodes.get(id as usize)
    }

    pub fn nodes(&self) -> &[QuadNode] {
        &self.nodes
    }

    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn layout(&self) -> Size {
        self.layout
    }

    pub fn bounds(&self) -> Aabb {
        self.root.map_or(Aabb::EMPTY, |r| self.nodes[r as usize].bounds)
    }

    /// Assign an object to every leaf its XZ footprint overlaps
    pub fn update_object_ownership(&mut self, object: ObjectId, bounds: &Aabb) {
        self.remove_object(object);
        for leaf in &mut self.leaves {
            if leaf.bounds.intersects_xz(bounds) {
                leaf.objects.push(object);
            }
        }
    }

    pub fn remove_object(&mut self, object: ObjectId) {
        for leaf in &mut self.leaves {
            leaf.objects.retain(|o| *o != object);
        }
    }

    /// Frustum and horizon-occlusion traversal, front to back
    pub fn traverse(&self, traversal: &mut Traversal<'_>, sink: &mut dyn VisibilitySink) -> OcclusionStats {
        let mut stats = OcclusionStats::default();
        if let Some(root) = self.root {
            self.visit(root, None, false, traversal, sink, &mut stats);
        }
        stats
    }

    fn visit(
        &self,
        id: NodeId,
        shared: Option<&HeightPlane>,
        mut inside: bool,
        traversal: &mut Traversal<'_>,
        sink: &mut dyn VisibilitySink,
        stats: &mut OcclusionStats,
    ) {
        let node = &self.nodes[id as usize];
        if !inside {
            match traversal.frustum.classify_aabb(&node.bounds) {
                Containment::Outside => return,
                Containment::Inside => inside = true,
                Containment::Intersects => {}
            }
        }

        if let Some(horizon) = traversal.horizon.as_deref() {
            if traversal.near_plane.aabb_in_front(&node.bounds, traversal.near_margin) {
                let max_quad = facing(&node.horizon.max_quad, &node.horizon.max_plane, traversal.eye);
                match horizon.test_quad(&max_quad) {
                    QuadVisibility::Occluded => {
                        stats.tested += 1;
                        stats.occluded += 1;
                        return;
                    }
                    QuadVisibility::Visible => stats.tested += 1,
                    QuadVisibility::Untested => {}
                }
            }
        }

        match node.leaf {
            Some(leaf) => {
                if let Some(horizon) = traversal.horizon.as_deref_mut() {
                    let occluder = match (node.horizon.min_quad, shared) {
                        (Some(quad), _) => Some((quad, node.horizon.min_plane)),
                        (None, Some(plane)) => Some((quad_points(&node.bounds, plane), *plane)),
                        (None, None) => None,
                    };
                    if let Some((quad, plane)) = occluder {
                        horizon.draw_quad(&facing(&quad, &plane, traversal.eye));
                    }
                }
                self.visit_leaf(&self.leaves[leaf as usize], inside, traversal, sink);
            }
            None => {
                let shared = if node.horizon.shared { Some(&node.horizon.min_plane) } else { shared };
                for child in front_to_back(node, traversal.eye) {
                    self.visit(child, shared, inside, traversal, sink, stats);
                }
            }
        }
    }

    fn visit_leaf(&self, leaf: &Leaf, inside: bool, traversal: &Traversal<'_>, sink: &mut dyn VisibilitySink) {
        if let Some(block) = leaf.block {
            sink.add_visible_group(block);
        }
        for object in &leaf.objects {
            let Some(bounds) = traversal.objects.get(*object) else {
                continue;
            };
            if !traversal.cull.admits(bounds, traversal.eye) {
                continue;
            }
            if inside || traversal.frustum.intersects_aabb(bounds) {
                sink.add_visible_object(*object);
            }
        }
    }
}

/// Wind a quad so its upper screen outline runs left to right, reversing
/// it when the eye is below its plane
fn facing(quad: &[Vec3; 4], plane: &HeightPlane, eye: Vec3) -> [Vec3; 4] {
    if eye.y < plane.height_at(eye.x, eye.z) { flipped(quad) } else { *quad }
}

/// Children ordered nearest-first by which side of the split the eye is on
fn front_to_back(node: &QuadNode, eye: Vec3) -> impl Iterator<Item = NodeId> + '_ {
    let q = (eye.x >= node.split.x) as usize | ((eye.z >= node.split.y) as usize) << 1;
    [q, q ^ 1, q ^ 2, q ^ 3].into_iter().filter_map(|slot| node.children[slot])
}

fn leaf_horizon(bounds: &Aabb, samples: &[Vec3]) -> NodeHorizon {
    if samples.is_empty() {
        let mut horizon = NodeHorizon::flat(bounds.min.y, bounds);
        horizon.max_plane = HeightPlane::flat(bounds.max.y);
        horizon.max_quad = quad_points(bounds, &horizon.max_plane);
        return horizon;
    }
    let mut fit = PlaneFit::new();
    fit.extend(samples);
    let plane = fit.solve();
    let min_plane = plane.supporting_below(samples);
    let max_plane = plane.supporting_above(samples);
    NodeHorizon {
        min_plane,
        max_plane,
        min_quad: Some(quad_points(bounds, &min_plane)),
        max_quad: quad_points(bounds, &max_plane),
        shared: false,
    }
}

/// Plane heights at the XZ corners of `bounds`, clockwise on screen when
/// seen from above
fn quad_points(bounds: &Aabb, plane: &HeightPlane) -> [Vec3; 4] {
    let (min, max) = (bounds.min, bounds.max);
    [(min.x, min.z), (max.x, min.z), (max.x, max.z), (min.x, max.z)]
        .map(|(x, z)| Vec3::new(x, plane.height_at(x, z), z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Camera;
    use crate::culling::visibility::VisibilitySet;

    const CELL: f32 = 10.0;

    fn flat_input(index: u32, x: u32, y: u32, height: f32) -> LeafInput {
        let min = Vec3::new(x as f32 * CELL, height, y as f32 * CELL);
        let samples = (0..=4)
            .flat_map(|j| (0..=4).map(move |i| min + Vec3::new(i as f32 * 2.5, 0.0, j as f32 * 2.5)))
            .collect();
        LeafInput {
            block_index: index,
            bounds: Aabb::new(min - Vec3::Y, min + Vec3::new(CELL, 1.0, CELL)),
            samples,
        }
    }

    fn grid(width: u32, height: u32, heights: &[f32]) -> SpatialQuadtree {
        let inputs = (0..width * height)
            .map(|i| Some(flat_input(i, i % width, i / width, heights[i as usize])))
            .collect();
        SpatialQuadtree::build(Size::new(width, height), Vec2::ZERO, Vec2::splat(CELL), inputs, 0.0).unwrap()
    }

    fn run(tree: &SpatialQuadtree, camera: &Camera, occlusion: bool) -> (VisibilitySet, OcclusionStats) {
        let frustum = Frustum::from_view_projection(&camera.view_projection());
        let mut horizon = HorizonBuffer::new(camera.viewport.x, camera.viewport.y);
        horizon.reset(camera.view_projection());
        let forward = camera.forward() * Vec3::new(1.0, 0.0, 1.0);
        let cull = ObjectCullTable::default();
        let objects = ObjectRegistry::new();
        let mut traversal = Traversal {
            frustum: &frustum,
            eye: camera.position,
            horizon: occlusion.then_some(&mut horizon),
            near_plane: Plane::from_point_normal(camera.position, forward),
            near_margin: camera.near,
            cull: &cull,
            objects: &objects,
        };
        let mut set = VisibilitySet::new();
        let stats = tree.traverse(&mut traversal, &mut set);
        (set, stats)
    }

    #[test]
    fn test_depth_and_pruning() {
        let tree = grid(3, 2, &[0.0; 6]);
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.leaves().len(), 6);
        let bounds = tree.bounds();
        assert_eq!(bounds.min.x, 0.0);
        assert_eq!(bounds.max.x, 30.0);
        assert_eq!(bounds.max.z, 20.0);
    }

    #[test]
    fn test_missing_blocks_become_flat_leaves() {
        let inputs = vec![Some(flat_input(0, 0, 0, 5.0)), None];
        let tree = SpatialQuadtree::build(Size::new(2, 1), Vec2::ZERO, Vec2::splat(CELL), inputs, -3.0).unwrap();
        let empty = tree.leaves().iter().find(|l| l.block.is_none()).unwrap();
        assert_eq!(empty.bounds.min.y, -3.0);
        assert_eq!(empty.bounds.max.y, -3.0);
        assert_eq!(empty.bounds.min.x, CELL);
    }

    #[test]
    fn test_build_rejects_degenerate_input() {
        assert!(matches!(
            SpatialQuadtree::build(Size::new(0, 2), Vec2::ZERO, Vec2::ONE, vec![], 0.0),
            Err(Error::Degenerate(_))
        ));
        assert!(matches!(
            SpatialQuadtree::build(Size::new(1, 1), Vec2::ZERO, Vec2::ZERO, vec![None], 0.0),
            Err(Error::Degenerate(_))
        ));
    }

    #[test]
    fn test_horizon_planes_bracket_samples() {
        let tree = grid(2, 2, &[0.0, 4.0, 8.0, 2.0]);
        let root = tree.node(tree.root().unwrap()).unwrap();
        for leaf_node in tree.nodes().iter().filter(|n| n.is_leaf()) {
            for corner in quad_points(&leaf_node.bounds, &leaf_node.horizon.max_plane) {
                assert!(root.horizon.max_plane.height_at(corner.x, corner.z) >= corner.y - 1e-3);
            }
            for corner in quad_points(&leaf_node.bounds, &leaf_node.horizon.min_plane) {
                assert!(root.horizon.min_plane.height_at(corner.x, corner.z) <= corner.y + 1e-3);
            }
        }
    }

    #[test]
    fn test_flat_siblings_collapse() {
        let tree = grid(2, 2, &[0.0; 4]);
        let root = tree.node(tree.root().unwrap()).unwrap();
        assert!(root.horizon.shared);
        assert!(root.horizon.min_quad.is_none());
        assert!(tree.nodes().iter().filter(|n| n.is_leaf()).all(|n| n.horizon.min_quad.is_none()));
    }

    #[test]
    fn test_collapsed_floor_does_not_hide_its_own_leaves() {
        let tree = grid(2, 2, &[0.0; 4]);
        let camera = Camera::look_at(Vec3::new(10.0, 20.0, -5.0), Vec3::new(10.0, 0.0, 20.0), Vec3::Y);
        let (set, stats) = run(&tree, &camera, true);
        let mut blocks = set.blocks().to_vec();
        blocks.sort_unstable();
        assert_eq!(blocks, vec![0, 1, 2, 3]);
        assert_eq!(stats.occluded, 0);
    }

    #[test]
    fn test_collapsed_plateau_hides_lowland_behind_it() {
        // Rows 0-1 form one collapsed plateau group, rows 2-3 a lowland group
        let tree = grid(2, 4, &[50.0, 50.0, 50.0, 50.0, 0.0, 0.0, 0.0, 0.0]);
        let plateau = tree.nodes().iter().filter(|n| !n.is_leaf() && n.horizon.shared).count();
        assert_eq!(plateau, 2);

        let camera = Camera::look_at(Vec3::new(10.0, 80.0, -5.0), Vec3::new(10.0, 0.0, 30.0), Vec3::Y);
        let (set, stats) = run(&tree, &camera, true);
        let mut blocks = set.blocks().to_vec();
        blocks.sort_unstable();
        assert_eq!(blocks, vec![0, 1, 2, 3]);
        assert!(stats.occluded >= 1);
    }

    #[test]
    fn test_quads_seen_from_below_are_flipped() {
        let plane = HeightPlane::flat(10.0);
        let bounds = Aabb::new(Vec3::ZERO, Vec3::new(10.0, 10.0, 10.0));
        let quad = quad_points(&bounds, &plane);
        assert_eq!(facing(&quad, &plane, Vec3::new(5.0, 20.0, -5.0)), quad);
        assert_eq!(facing(&quad, &plane, Vec3::new(5.0, 0.0, -5.0)), flipped(&quad));
    }

    #[test]
    fn test_traversal_is_front_to_back() {
        let tree = grid(1, 3, &[0.0; 3]);
        let camera = Camera::look_at(Vec3::new(5.0, 20.0, -5.0), Vec3::new(5.0, 0.0, 20.0), Vec3::Y);
        let (set, _) = run(&tree, &camera, false);
        assert_eq!(set.blocks(), &[0, 1, 2]);

        let camera = Camera::look_at(Vec3::new(5.0, 20.0, 35.0), Vec3::new(5.0, 0.0, 10.0), Vec3::Y);
        let (set, _) = run(&tree, &camera, false);
        assert_eq!(set.blocks(), &[2, 1, 0]);
    }

    #[test]
    fn test_frustum_rejects_blocks_behind_camera() {
        let tree = grid(1, 3, &[0.0; 3]);
        let camera = Camera::look_at(Vec3::new(5.0, 2.0, 15.0), Vec3::new(5.0, 2.0, 40.0), Vec3::Y);
        let (set, _) = run(&tree, &camera, false);
        assert!(!set.contains_block(0));
        assert!(set.contains_block(2));
    }

    #[test]
    fn test_plateau_occludes_terrain_behind_it() {
        let tree = grid(1, 3, &[50.0, 0.0, 0.0]);
        let camera = Camera::look_at(Vec3::new(5.0, 52.0, -5.0), Vec3::new(5.0, 0.0, 40.0), Vec3::Y);

        let (set, stats) = run(&tree, &camera, true);
        assert_eq!(set.blocks(), &[0]);
        assert_eq!(stats.occluded, 2);
        assert!(stats.success_ratio().unwrap() > 0.0);

        let (set, stats) = run(&tree, &camera, false);
        assert_eq!(set.blocks(), &[0, 1, 2]);
        assert_eq!(stats, OcclusionStats::default());
    }

    #[test]
    fn test_objects_follow_leaf_visibility() {
        let mut tree = grid(1, 3, &[0.0; 3]);
        let mut objects = ObjectRegistry::new();
        let rock = Aabb::new(Vec3::new(4.0, 0.0, 24.0), Vec3::new(6.0, 2.0, 26.0));
        objects.insert(ObjectId(7), rock);
        tree.update_object_ownership(ObjectId(7), &rock);
        assert_eq!(tree.leaves().iter().filter(|l| l.objects.contains(&ObjectId(7))).count(), 1);

        let camera = Camera::look_at(Vec3::new(5.0, 20.0, -5.0), Vec3::new(5.0, 0.0, 20.0), Vec3::Y);
        let frustum = Frustum::from_view_projection(&camera.view_projection());
        let cull = ObjectCullTable::default();
        let mut traversal = Traversal {
            frustum: &frustum,
            eye: camera.position,
            horizon: None,
            near_plane: Plane::from_point_normal(camera.position, Vec3::Z),
            near_margin: camera.near,
            cull: &cull,
            objects: &objects,
        };
        let mut set = VisibilitySet::new();
        tree.traverse(&mut traversal, &mut set);
        assert_eq!(set.objects(), &[ObjectId(7)]);

        let spanning = Aabb::new(Vec3::new(4.0, 0.0, 8.0), Vec3::new(6.0, 2.0, 12.0));
        tree.update_object_ownership(ObjectId(7), &spanning);
        assert_eq!(tree.leaves().iter().filter(|l| l.objects.contains(&ObjectId(7))).count(), 2);
        tree.remove_object(ObjectId(7));
        assert!(tree.leaves().iter().all(|l| l.objects.is_empty()));
    }

    #[test]
    fn test_update_leaf_refits_parents() {
        let mut tree = grid(2, 2, &[0.0; 4]);
        let raised = flat_input(3, 1, 1, 30.0);
        assert!(tree.update_leaf(3, raised.bounds, &raised.samples));
        tree.update_internal_nodes();
        assert!(tree.bounds().max.y >= 31.0);
        let root = tree.node(tree.root().unwrap()).unwrap();
        assert!(root.horizon.max_plane.height_at(20.0, 20.0) >= 30.0 - 1e-3);
        assert!(!tree.update_leaf(99, raised.bounds, &raised.samples));
    }
}
