//! Mathematical utilities and data structures

pub mod aabb;
pub mod ray;
pub mod frustum;
pub mod rect;
pub mod plane_fit;

pub use aabb::Aabb;
pub use ray::Ray;
pub use frustum::{Plane, Frustum, Containment};
pub use rect::{Rect, Size};
pub use plane_fit::{HeightPlane, PlaneFit};
