//! World queries
//!
//! Ray casts, shape sweeps, shape overlaps and sphere broad-phase queries.
//! Every query takes a layer whitelist and an ignore list, and sees the
//! acceleration structure as of the last step or `optimize_broadphase`.

use ahash::AHashMap;
use glam::{Quat, Vec3};
use lattice_core::math::vec3_is_equal_approx;
use lattice_core::{BoundingSphere, Transform};
use rapier3d::parry::bounding_volume::BoundingVolume;
use rapier3d::parry::query::{self as parry_query, ShapeCastOptions};
use rapier3d::parry::shape::Shape as EngineShape;
use rapier3d::prelude::{
    Collider, ColliderHandle, Isometry, QueryFilter, Ray, Real, SharedShape, Vector,
};

use crate::body_id::{BodyId, BodyKey};
use crate::convert::{
    from_point, from_vector, to_engine_aabb, to_isometry, to_point, to_vector,
};
use crate::error::{PhysicsError, PhysicsResult};
use crate::layers::ObjectLayerFilter;
use crate::world::{PhysicsWorld, unpack_user_data};

/// Closest ray hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub body: BodyId,
    pub owner: BodyKey,
    pub position: Vec3,
    pub normal: Vec3,
    /// Fraction of the ray length, in 0..=1
    pub fraction: f32,
}

/// Hit of a shape sweep or overlap
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeHit {
    pub body: BodyId,
    pub owner: BodyKey,
    /// Fraction of the sweep at impact; 0 for overlaps
    pub fraction: f32,
    pub depth: f32,
    pub contact_on_shape: Vec3,
    pub contact_on_body: Vec3,
    /// Points from the hit body toward the query shape
    pub normal: Vec3,
}

/// Result of `high_level_ray_or_shape_cast`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CastHit {
    pub body: BodyId,
    pub owner: BodyKey,
    /// Contact point on the hit body
    pub position: Vec3,
    pub normal: Vec3,
    pub fraction: f32,
    pub depth: f32,
}

impl PhysicsWorld {
    fn admitted(
        &self,
        collider: &Collider,
        layers: &ObjectLayerFilter,
        ignore: &[BodyId],
    ) -> Option<(BodyId, BodyKey)> {
        let (id, layer) = unpack_user_data(collider.user_data);
        if !layers.admits(layer) || ignore.contains(&id) {
            return None;
        }
        let owner = self.owner_of(id)?;
        Some((id, owner))
    }

    /// Closest hit of the segment `from -> to`
    pub fn cast_ray(
        &self,
        from: Vec3,
        to: Vec3,
        layers: &ObjectLayerFilter,
        ignore: &[BodyId],
    ) -> Option<RayHit> {
        let ray = Ray::new(to_point(from), to_vector(to - from));
        let predicate =
            |_: ColliderHandle, collider: &Collider| self.admitted(collider, layers, ignore).is_some();
        let filter = QueryFilter::default().predicate(&predicate);

        let (handle, hit) = self.query_pipeline.cast_ray_and_get_normal(
            &self.bodies,
            &self.colliders,
            &ray,
            1.0,
            true,
            filter,
        )?;
        let collider = self.colliders.get(handle)?;
        let (body, owner) = self.admitted(collider, layers, ignore)?;
        Some(RayHit {
            body,
            owner,
            position: from_point(&ray.point_at(hit.time_of_impact)),
            normal: from_vector(&hit.normal),
            fraction: hit.time_of_impact,
        })
    }

    /// Every hit of the segment `from -> to`, one per collider
    pub fn cast_ray_all(
        &self,
        from: Vec3,
        to: Vec3,
        layers: &ObjectLayerFilter,
        ignore: &[BodyId],
    ) -> Vec<RayHit> {
        let ray = Ray::new(to_point(from), to_vector(to - from));
        let predicate =
            |_: ColliderHandle, collider: &Collider| self.admitted(collider, layers, ignore).is_some();
        let filter = QueryFilter::default().predicate(&predicate);

        let mut hits = Vec::new();
        self.query_pipeline.intersections_with_ray(
            &self.bodies,
            &self.colliders,
            &ray,
            1.0,
            true,
            filter,
            |handle, hit| {
                let admitted = self
                    .colliders
                    .get(handle)
                    .and_then(|collider| self.admitted(collider, layers, ignore));
                if let Some((body, owner)) = admitted {
                    hits.push(RayHit {
                        body,
                        owner,
                        position: from_point(&ray.point_at(hit.time_of_impact)),
                        normal: from_vector(&hit.normal),
                        fraction: hit.time_of_impact,
                    });
                }
                true
            },
        );
        hits
    }

    /// Sweep `shape` from `position` along `motion`; every blocking hit
    pub fn cast_shape(
        &self,
        shape: &dyn EngineShape,
        position: &Isometry<Real>,
        motion: Vec3,
        layers: &ObjectLayerFilter,
        ignore: &[BodyId],
    ) -> Vec<ShapeHit> {
        let _span = tracing::trace_span!("cast_shape", world = self.id()).entered();

        let velocity = to_vector(motion);
        let end = Isometry::from_parts(
            (position.translation.vector + velocity).into(),
            position.rotation,
        );
        let swept = shape.compute_aabb(position).merged(&shape.compute_aabb(&end));

        let mut candidates = Vec::new();
        self.query_pipeline
            .colliders_with_aabb_intersecting_aabb(&swept, |handle| {
                candidates.push(*handle);
                true
            });

        let options = ShapeCastOptions {
            max_time_of_impact: 1.0,
            stop_at_penetration: true,
            compute_impact_geometry_on_penetration: true,
            ..ShapeCastOptions::default()
        };

        let mut hits = Vec::new();
        for handle in candidates {
            let Some(collider) = self.colliders.get(handle) else {
                continue;
            };
            let Some((body, owner)) = self.admitted(collider, layers, ignore) else {
                continue;
            };
            let cast = parry_query::cast_shapes(
                position,
                &velocity,
                shape,
                collider.position(),
                &Vector::zeros(),
                collider.shape(),
                options,
            );
            let hit = match cast {
                Ok(Some(hit)) => hit,
                Ok(None) => continue,
                Err(_) => {
                    log::trace!("Unsupported shape cast against body {:?}", body);
                    continue;
                }
            };

            let at_impact = Isometry::from_parts(
                (position.translation.vector + velocity * hit.time_of_impact).into(),
                position.rotation,
            );
            let depth = if hit.time_of_impact <= 0.0 {
                match parry_query::contact(position, shape, collider.position(), collider.shape(), 0.0) {
                    Ok(Some(contact)) => (-contact.dist).max(0.0),
                    _ => 0.0,
                }
            } else {
                0.0
            };
            hits.push(ShapeHit {
                body,
                owner,
                fraction: hit.time_of_impact,
                depth,
                contact_on_shape: from_point(&(at_impact * hit.witness1)),
                contact_on_body: from_point(&(collider.position() * hit.witness2)),
                normal: -from_vector(&(at_impact.rotation * hit.normal1.into_inner())),
            });
        }
        hits
    }

    /// Every body overlapping `shape` at `position`
    pub fn collide_shape(
        &self,
        shape: &dyn EngineShape,
        position: &Isometry<Real>,
        layers: &ObjectLayerFilter,
        ignore: &[BodyId],
    ) -> Vec<ShapeHit> {
        let predicate =
            |_: ColliderHandle, collider: &Collider| self.admitted(collider, layers, ignore).is_some();
        let filter = QueryFilter::default().predicate(&predicate);

        let mut candidates = Vec::new();
        self.query_pipeline.intersections_with_shape(
            &self.bodies,
            &self.colliders,
            position,
            shape,
            filter,
            |handle| {
                candidates.push(handle);
                true
            },
        );

        let mut hits = Vec::new();
        for handle in candidates {
            let Some(collider) = self.colliders.get(handle) else {
                continue;
            };
            let Some((body, owner)) = self.admitted(collider, layers, ignore) else {
                continue;
            };
            let hit = match parry_query::contact(position, shape, collider.position(), collider.shape(), 0.0) {
                Ok(Some(contact)) => ShapeHit {
                    body,
                    owner,
                    fraction: 0.0,
                    depth: (-contact.dist).max(0.0),
                    contact_on_shape: from_point(&contact.point1),
                    contact_on_body: from_point(&contact.point2),
                    normal: from_vector(&contact.normal2),
                },
                Ok(None) => continue,
                // Composite vs composite: report the overlap without geometry.
                Err(_) => ShapeHit {
                    body,
                    owner,
                    fraction: 0.0,
                    depth: 0.0,
                    contact_on_shape: from_vector(&position.translation.vector),
                    contact_on_body: from_vector(&collider.position().translation.vector),
                    normal: Vec3::ZERO,
                },
            };
            hits.push(hit);
        }
        hits
    }

    /// Bodies whose bounds touch the sphere
    pub fn bodies_in_sphere(
        &self,
        center: Vec3,
        radius: f32,
        layers: &ObjectLayerFilter,
        ignore: &[BodyId],
    ) -> Vec<BodyId> {
        let sphere = BoundingSphere::new(center, radius);
        let bounds = to_engine_aabb(&sphere.aabb());

        let mut found = Vec::new();
        self.query_pipeline
            .colliders_with_aabb_intersecting_aabb(&bounds, |handle| {
                let Some(collider) = self.colliders.get(*handle) else {
                    return true;
                };
                if let Some((body, _)) = self.admitted(collider, layers, ignore) {
                    let aabb = crate::convert::from_engine_aabb(&collider.compute_aabb());
                    if sphere.intersects_aabb(&aabb) {
                        found.push(body);
                    }
                }
                true
            });
        found
    }

    /// Sphere sweep when `radius > 0`, ray otherwise. With a negative
    /// `length` the direction is the sweep itself.
    ///
    /// Keeps the best hit per body, sorted by fraction then by depth.
    pub fn high_level_ray_or_shape_cast(
        &self,
        from: Vec3,
        direction: Vec3,
        length: f32,
        radius: f32,
        layers: &ObjectLayerFilter,
        ignore: &[BodyId],
    ) -> Vec<CastHit> {
        let sweep = if length < 0.0 {
            direction
        } else {
            direction.normalize_or_zero() * length
        };

        let hits: Vec<CastHit> = if radius > 0.0 {
            let sphere = SharedShape::ball(radius);
            let position = to_isometry(from, Quat::IDENTITY);
            self.cast_shape(sphere.as_ref(), &position, sweep, layers, ignore)
                .into_iter()
                .map(|hit| CastHit {
                    body: hit.body,
                    owner: hit.owner,
                    position: hit.contact_on_body,
                    normal: hit.normal,
                    fraction: hit.fraction,
                    depth: hit.depth,
                })
                .collect()
        } else {
            self.cast_ray_all(from, from + sweep, layers, ignore)
                .into_iter()
                .map(|hit| CastHit {
                    body: hit.body,
                    owner: hit.owner,
                    position: hit.position,
                    normal: hit.normal,
                    fraction: hit.fraction,
                    depth: 0.0,
                })
                .collect()
        };

        let mut best: AHashMap<BodyId, CastHit> = AHashMap::new();
        for hit in hits {
            best.entry(hit.body)
                .and_modify(|current| {
                    if is_better_hit(&hit, current) {
                        *current = hit;
                    }
                })
                .or_insert(hit);
        }

        let mut result: Vec<CastHit> = best.into_values().collect();
        result.sort_by(|a, b| {
            a.fraction
                .total_cmp(&b.fraction)
                .then(b.depth.total_cmp(&a.depth))
        });
        result
    }

    /// Sweep a body's own shape along `motion`, ignoring itself
    pub fn cast_body(
        &self,
        id: BodyId,
        motion: Vec3,
        layers: &ObjectLayerFilter,
    ) -> PhysicsResult<Vec<ShapeHit>> {
        let collider = self
            .engine_collider(id)
            .ok_or(PhysicsError::NoSimulatedBody(id))?;
        Ok(self.cast_shape(collider.shape(), collider.position(), motion, layers, &[id]))
    }

    /// Overlaps of a body's own shape, ignoring itself
    pub fn collide_body(&self, id: BodyId, layers: &ObjectLayerFilter) -> PhysicsResult<Vec<ShapeHit>> {
        let collider = self
            .engine_collider(id)
            .ok_or(PhysicsError::NoSimulatedBody(id))?;
        Ok(self.collide_shape(collider.shape(), collider.position(), layers, &[id]))
    }

    /// Overlaps of a body's shape placed at `transform`; a different scale
    /// builds a rescaled shape for the query.
    pub fn collide_body_at(
        &self,
        id: BodyId,
        transform: &Transform,
        layers: &ObjectLayerFilter,
    ) -> PhysicsResult<Vec<ShapeHit>> {
        let entry = self.entry(id).ok_or(PhysicsError::NoSimulatedBody(id))?;
        let collider = self
            .engine_collider(id)
            .ok_or(PhysicsError::NoSimulatedBody(id))?;
        let position = to_isometry(transform.position, transform.rotation);

        let scale = transform.scale.abs();
        if vec3_is_equal_approx(scale, entry.scale) {
            return Ok(self.collide_shape(collider.shape(), &position, layers, &[id]));
        }
        let scaled = entry.shape.build_scaled(scale)?;
        Ok(self.collide_shape(scaled.as_ref(), &position, layers, &[id]))
    }
}

fn is_better_hit(candidate: &CastHit, current: &CastHit) -> bool {
    candidate.fraction < current.fraction
        || (candidate.fraction == current.fraction && candidate.depth > current.depth)
}

/// Nearest blocking hit of a sweep
pub fn nearest_hit(hits: &[ShapeHit]) -> Option<&ShapeHit> {
    hits.iter().min_by(|a, b| a.fraction.total_cmp(&b.fraction))
}

/// Deepest penetrating hit
pub fn max_penetration_hit(hits: &[ShapeHit]) -> Option<&ShapeHit> {
    hits.iter().max_by(|a, b| a.depth.total_cmp(&b.depth))
}
