//! Visible set collection and coarse object culling

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::types::Vec3;
use crate::math::Aabb;

/// Host identifier of a scene object placed on the landscape
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Receives the results of a visibility traversal
pub trait VisibilitySink {
    /// A leaf's terrain block survived culling
    fn add_visible_group(&mut self, block_index: u32);
    fn add_visible_object(&mut self, object: ObjectId);
}

/// Deduplicated visible blocks and objects, in discovery order
#[derive(Clone, Debug, Default)]
pub struct VisibilitySet {
    blocks: Vec<u32>,
    block_set: HashSet<u32>,
    objects: Vec<ObjectId>,
    object_set: HashSet<ObjectId>,
}

impl VisibilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.block_set.clear();
        self.objects.clear();
        self.object_set.clear();
    }

    /// Visible blocks, front to back
    pub fn blocks(&self) -> &[u32] {
        &self.blocks
    }

    pub fn objects(&self) -> &[ObjectId] {
        &self.objects
    }

    pub fn contains_block(&self, block_index: u32) -> bool {
        self.block_set.contains(&block_index)
    }

    pub fn contains_object(&self, object: ObjectId) -> bool {
        self.object_set.contains(&object)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.objects.is_empty()
    }
}

impl VisibilitySink for VisibilitySet {
    fn add_visible_group(&mut self, block_index: u32) {
        if self.block_set.insert(block_index) {
            self.blocks.push(block_index);
        }
    }

    fn add_visible_object(&mut self, object: ObjectId) {
        if self.object_set.insert(object) {
            self.objects.push(object);
        }
    }
}

/// World bounds of every object placed on the landscape
#[derive(Clone, Debug, Default)]
pub struct ObjectRegistry {
    bounds: HashMap<ObjectId, Aabb>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store new bounds, returning the previous ones
    pub fn insert(&mut self, object: ObjectId, bounds: Aabb) -> Option<Aabb> {
        self.bounds.insert(object, bounds)
    }

    pub fn remove(&mut self, object: ObjectId) -> Option<Aabb> {
        self.bounds.remove(&object)
    }

    pub fn get(&self, object: ObjectId) -> Option<&Aabb> {
        self.bounds.get(&object)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &Aabb)> + '_ {
        self.bounds.iter().map(|(id, bounds)| (*id, bounds))
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

/// Objects up to `maximum_size` are dropped beyond `distance`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CullDescriptor {
    pub maximum_size: f32,
    pub distance: f32,
}

/// Size-bucketed distance culling for objects owned by quadtree leaves
#[derive(Clone, Debug, Default)]
pub struct ObjectCullTable {
    /// `(maximum_size, distance²)`, ascending by size
    entries: Vec<(f32, f32)>,
    global_distance_sq: Option<f32>,
}

impl ObjectCullTable {
    pub fn new(descriptors: &[CullDescriptor], global_distance: Option<f32>) -> Self {
        let mut entries: Vec<(f32, f32)> = descriptors
            .iter()
            .map(|d| (d.maximum_size, d.distance * d.distance))
            .collect();
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self {
            entries,
            global_distance_sq: global_distance.filter(|d| *d > 0.0).map(|d| d * d),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.global_distance_sq.is_none()
    }

    /// Whether an object with these bounds survives from `eye`
    pub fn admits(&self, bounds: &Aabb, eye: Vec3) -> bool {
        let distance_sq = bounds.distance_squared(eye);
        if self.global_distance_sq.is_some_and(|limit| distance_sq > limit) {
            return false;
        }
        let size = bounds.size().max_element();
        match self.entries.iter().find(|(maximum, _)| size <= *maximum) {
            Some((_, limit)) => distance_sq <= *limit,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(center: Vec3, size: f32) -> Aabb {
        Aabb::new(center - size * 0.5, center + size * 0.5)
    }

    #[test]
    fn test_visibility_set_deduplicates() {
        let mut set = VisibilitySet::new();
        set.add_visible_group(3);
        set.add_visible_group(1);
        set.add_visible_group(3);
        set.add_visible_object(ObjectId(9));
        set.add_visible_object(ObjectId(9));
        assert_eq!(set.blocks(), &[3, 1]);
        assert_eq!(set.objects(), &[ObjectId(9)]);
        assert!(set.contains_block(1));
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_cull_table_buckets_by_size() {
        let table = ObjectCullTable::new(
            &[
                CullDescriptor { maximum_size: 10.0, distance: 200.0 },
                CullDescriptor { maximum_size: 1.0, distance: 50.0 },
            ],
            None,
        );
        let eye = Vec3::ZERO;
        assert!(table.admits(&cube(Vec3::new(40.0, 0.0, 0.0), 0.5), eye));
        assert!(!table.admits(&cube(Vec3::new(100.0, 0.0, 0.0), 0.5), eye));
        assert!(table.admits(&cube(Vec3::new(100.0, 0.0, 0.0), 5.0), eye));
        assert!(table.admits(&cube(Vec3::new(900.0, 0.0, 0.0), 50.0), eye));
    }

    #[test]
    fn test_registry_replaces_bounds() {
        let mut registry = ObjectRegistry::new();
        let first = cube(Vec3::ZERO, 1.0);
        assert!(registry.insert(ObjectId(1), first).is_none());
        assert_eq!(registry.insert(ObjectId(1), cube(Vec3::ONE, 1.0)), Some(first));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(ObjectId(1)).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_global_distance_applies_to_everything() {
        let table = ObjectCullTable::new(&[], Some(300.0));
        assert!(!table.admits(&cube(Vec3::new(900.0, 0.0, 0.0), 50.0), Vec3::ZERO));
        assert!(table.admits(&cube(Vec3::new(200.0, 0.0, 0.0), 50.0), Vec3::ZERO));
        assert!(ObjectCullTable::default().is_empty());
    }
}
