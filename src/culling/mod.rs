//! Landscape visibility: quadtree traversal, horizon occlusion and object culling

pub mod horizon;
pub mod quadtree;
pub mod visibility;

pub use horizon::{DrawResult, HorizonBuffer, QuadVisibility};
pub use quadtree::{LeafInput, NodeId, OcclusionStats, SpatialQuadtree, Traversal, COLLAPSE_TOLERANCE};
pub use visibility::{
    CullDescriptor, ObjectCullTable, ObjectId, ObjectRegistry, VisibilitySet, VisibilitySink,
};
