//! Math utilities
//!
//! Re-exports from glam plus the small set of helpers the physics layer
//! needs: bounds, rigid transforms with scale, and tolerant comparisons.

pub use glam::{Mat3, Mat4, Quat, Vec2, Vec3, Vec4};

use serde::{Deserialize, Serialize};

/// Tolerance used by the approximate comparisons below
pub const CMP_EPSILON: f32 = 0.00001;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Create an empty AABB
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    /// Create an AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB from center and half-extents
    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// Get the center of the AABB
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the full size of the AABB
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Length of the box diagonal
    pub fn diagonal(&self) -> f32 {
        self.size().length()
    }

    /// Check if the AABB is empty
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Check if this AABB intersects another
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y &&
        self.min.z <= other.max.z && self.max.z >= other.min.z
    }

    /// Merge with another AABB
    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Bounding sphere
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    /// Center of the sphere
    pub center: Vec3,
    /// Radius of the sphere
    pub radius: f32,
}

impl BoundingSphere {
    /// Create a new bounding sphere
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Check if this sphere intersects an AABB
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        let closest = self.center.clamp(aabb.min, aabb.max);
        self.center.distance_squared(closest) <= self.radius * self.radius
    }

    /// Smallest AABB enclosing the sphere
    pub fn aabb(&self) -> Aabb {
        Aabb::from_center_half_extents(self.center, Vec3::splat(self.radius))
    }
}

/// Rigid transform with a scale component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// World position
    pub position: Vec3,
    /// World rotation
    pub rotation: Quat,
    /// Scale, applied in local space
    pub scale: Vec3,
}

impl Transform {
    /// Identity transform
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    /// Create a new transform with the given position
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    /// Create a new transform with position and rotation
    pub fn from_position_rotation(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            scale: Vec3::ONE,
        }
    }

    /// Create a new transform from all components
    pub fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// Decompose a 4x4 matrix. The scale is returned as absolute values.
    pub fn from_matrix(matrix: Mat4) -> Self {
        let (scale, rotation, position) = matrix.to_scale_rotation_translation();
        Self {
            position,
            rotation: rotation.normalize(),
            scale: scale.abs(),
        }
    }

    /// Compose the 4x4 matrix
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Transform a point from local space to world space
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.position + self.rotation * (point * self.scale)
    }

    /// True when position, rotation and scale all match within tolerance
    pub fn is_equal_approx(&self, other: &Transform) -> bool {
        vec3_is_equal_approx(self.position, other.position)
            && quat_is_equal_approx(self.rotation, other.rotation)
            && vec3_is_equal_approx(self.scale, other.scale)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Tolerant float comparison, relative for large magnitudes
pub fn is_equal_approx(a: f32, b: f32) -> bool {
    if a == b {
        return true;
    }
    let tolerance = (CMP_EPSILON * a.abs()).max(CMP_EPSILON);
    (a - b).abs() < tolerance
}

/// Tolerant float comparison with an explicit tolerance
pub fn is_equal_approx_eps(a: f32, b: f32, tolerance: f32) -> bool {
    (a - b).abs() < tolerance
}

/// Component-wise tolerant comparison
pub fn vec3_is_equal_approx(a: Vec3, b: Vec3) -> bool {
    is_equal_approx(a.x, b.x) && is_equal_approx(a.y, b.y) && is_equal_approx(a.z, b.z)
}

/// Rotation comparison that treats `q` and `-q` as the same rotation
pub fn quat_is_equal_approx(a: Quat, b: Quat) -> bool {
    let same = is_equal_approx(a.x, b.x)
        && is_equal_approx(a.y, b.y)
        && is_equal_approx(a.z, b.z)
        && is_equal_approx(a.w, b.w);
    same || (is_equal_approx(a.x, -b.x)
        && is_equal_approx(a.y, -b.y)
        && is_equal_approx(a.z, -b.z)
        && is_equal_approx(a.w, -b.w))
}

/// Round up to the closest power of two. Zero maps to one.
pub fn next_power_of_two(value: u32) -> u32 {
    value.max(1).next_power_of_two()
}

/// Move `from` toward `to` by at most `speed`, snapping when close
pub fn move_toward(from: Vec3, to: Vec3, speed: f32) -> Vec3 {
    let delta = to - from;
    let len = delta.length();
    if len <= 0.001 || len < speed {
        to
    } else {
        from + (delta / len) * speed
    }
}

/// Linear interpolation
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_intersection() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(0.5), Vec3::splat(1.5));
        let c = Aabb::new(Vec3::splat(2.0), Vec3::splat(3.0));

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.merge(&c).size(), Vec3::splat(3.0));
    }

    #[test]
    fn test_sphere_aabb_overlap() {
        let sphere = BoundingSphere::new(Vec3::ZERO, 1.0);
        assert!(sphere.intersects_aabb(&Aabb::new(Vec3::splat(0.5), Vec3::splat(2.0))));
        assert!(!sphere.intersects_aabb(&Aabb::new(Vec3::splat(1.0), Vec3::splat(2.0))));
    }

    #[test]
    fn test_transform_matrix_roundtrip() {
        let t = Transform::new(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::from_rotation_y(0.5),
            Vec3::new(2.0, 1.0, 0.5),
        );
        let back = Transform::from_matrix(t.to_matrix());
        assert!((back.position - t.position).length() < 0.001);
        assert!(back.rotation.angle_between(t.rotation) < 0.001);
        assert!((back.scale - t.scale).length() < 0.001);
    }

    #[test]
    fn test_quat_sign_is_ignored() {
        let q = Quat::from_rotation_x(1.0);
        assert!(quat_is_equal_approx(q, -q));
    }

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(10_000), 16_384);
        assert_eq!(next_power_of_two(64), 64);
    }

    #[test]
    fn test_move_toward() {
        let v = move_toward(Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0), 2.0);
        assert_eq!(v, Vec3::new(2.0, 0.0, 0.0));

        // Snaps once within one step.
        let v = move_toward(Vec3::new(9.0, 0.0, 0.0), Vec3::new(10.0, 0.0, 0.0), 2.0);
        assert_eq!(v, Vec3::new(10.0, 0.0, 0.0));
    }

    #[test]
    fn test_lerp() {
        assert!(is_equal_approx(lerp(0.3, 0.9, 0.5), 0.6));
        assert_eq!(lerp(0.0, 2.0, 1.0), 2.0);
    }
}
