//! View frustum for culling

use crate::core::types::{Vec3, Vec4, Mat4};
use super::aabb::Aabb;

/// A plane defined by normal and distance from origin
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    /// Plane through `point` facing along `normal` (normalized here)
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        let normal = normal.normalize_or_zero();
        Self { normal, distance: -normal.dot(point) }
    }

    /// Signed distance from point to plane (positive = in front)
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    /// True when the whole box lies in front of the plane by more than `margin`
    pub fn aabb_in_front(&self, aabb: &Aabb, margin: f32) -> bool {
        self.distance_to_point(aabb.negative_vertex(self.normal)) > margin
    }
}

/// Result of classifying a volume against the frustum
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Containment {
    Outside,
    Intersects,
    Inside,
}

/// View frustum with 6 planes (Near, Far, Left, Right, Top, Bottom)
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract frustum planes from view-projection matrix (Gribb/Hartmann, depth in [0, 1])
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];

        let near = Self::normalize_plane(rows[2]);
        let far = Self::normalize_plane(rows[3] - rows[2]);
        let left = Self::normalize_plane(rows[3] + rows[0]);
        let right = Self::normalize_plane(rows[3] - rows[0]);
        let top = Self::normalize_plane(rows[3] - rows[1]);
        let bottom = Self::normalize_plane(rows[3] + rows[1]);

        Self {
            planes: [near, far, left, right, top, bottom],
        }
    }

    fn normalize_plane(plane: Vec4) -> Plane {
        let normal = plane.truncate();
        let len = normal.length();
        if len > 0.0 {
            Plane {
                normal: normal / len,
                distance: plane.w / len,
            }
        } else {
            Plane { normal: Vec3::ZERO, distance: plane.w }
        }
    }

    /// Check if point is inside frustum
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.distance_to_point(point) >= 0.0)
    }

    /// Check if AABB intersects frustum (conservative test)
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.classify_aabb(aabb) != Containment::Outside
    }

    /// Classify an AABB as fully outside, straddling, or fully inside
    pub fn classify_aabb(&self, aabb: &Aabb) -> Containment {
        let mut result = Containment::Inside;
        for plane in &self.planes {
            // p-vertex behind the plane means the whole box is
            if plane.distance_to_point(aabb.positive_vertex(plane.normal)) < 0.0 {
                return Containment::Outside;
            }
            if plane.distance_to_point(aabb.negative_vertex(plane.normal)) < 0.0 {
                result = Containment::Intersects;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frustum() -> Frustum {
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        Frustum::from_view_projection(&(proj * view))
    }

    #[test]
    fn test_plane_distance() {
        let plane = Plane::new(Vec3::Y, 0.0);
        assert_eq!(plane.distance_to_point(Vec3::new(0.0, 5.0, 0.0)), 5.0);
        assert_eq!(plane.distance_to_point(Vec3::new(0.0, -3.0, 0.0)), -3.0);
    }

    #[test]
    fn test_plane_from_point_normal() {
        let plane = Plane::from_point_normal(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 4.0, 0.0));
        assert!((plane.distance_to_point(Vec3::new(7.0, 3.0, -1.0)) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_frustum_contains_point() {
        let frustum = test_frustum();
        assert!(frustum.contains_point(Vec3::ZERO));
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, 10.0)));
    }

    #[test]
    fn test_classify_aabb() {
        let frustum = test_frustum();
        let inside = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        let straddling = Aabb::new(Vec3::new(-100.0, -0.5, -0.5), Vec3::new(0.5, 0.5, 0.5));
        let behind = Aabb::new(Vec3::new(-1.0, -1.0, 8.0), Vec3::new(1.0, 1.0, 9.0));
        assert_eq!(frustum.classify_aabb(&inside), Containment::Inside);
        assert_eq!(frustum.classify_aabb(&straddling), Containment::Intersects);
        assert_eq!(frustum.classify_aabb(&behind), Containment::Outside);
        assert!(!frustum.intersects_aabb(&behind));
    }
}
