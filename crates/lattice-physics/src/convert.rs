//! glam <-> nalgebra conversions at the engine boundary.

use glam::{Quat, Vec3};
use lattice_core::Aabb;
use rapier3d::na::{Quaternion, Translation3, UnitQuaternion};
use rapier3d::parry::bounding_volume::Aabb as EngineAabb;
use rapier3d::prelude::{Isometry, Point, Real, Vector};

#[inline]
pub fn to_vector(v: Vec3) -> Vector<Real> {
    Vector::new(v.x, v.y, v.z)
}

#[inline]
pub fn from_vector(v: &Vector<Real>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

#[inline]
pub fn to_point(v: Vec3) -> Point<Real> {
    Point::new(v.x, v.y, v.z)
}

#[inline]
pub fn from_point(p: &Point<Real>) -> Vec3 {
    Vec3::new(p.x, p.y, p.z)
}

#[inline]
pub fn to_rotation(q: Quat) -> UnitQuaternion<Real> {
    UnitQuaternion::new_normalize(Quaternion::new(q.w, q.x, q.y, q.z))
}

#[inline]
pub fn from_rotation(r: &UnitQuaternion<Real>) -> Quat {
    // coords are stored as [i, j, k, w]
    let c = r.quaternion().coords;
    Quat::from_xyzw(c.x, c.y, c.z, c.w)
}

#[inline]
pub fn to_isometry(position: Vec3, rotation: Quat) -> Isometry<Real> {
    Isometry::from_parts(Translation3::from(to_vector(position)), to_rotation(rotation))
}

#[inline]
pub fn from_isometry(iso: &Isometry<Real>) -> (Vec3, Quat) {
    (from_vector(&iso.translation.vector), from_rotation(&iso.rotation))
}

pub fn to_engine_aabb(aabb: &Aabb) -> EngineAabb {
    EngineAabb::new(to_point(aabb.min), to_point(aabb.max))
}

pub fn from_engine_aabb(aabb: &EngineAabb) -> Aabb {
    Aabb::new(from_point(&aabb.mins), from_point(&aabb.maxs))
}
