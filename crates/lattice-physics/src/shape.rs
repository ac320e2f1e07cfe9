//! Collision shapes
//!
//! A [`ShapeDesc`] is the editable description; a [`Shape`] is the shared
//! resource bodies hold. The engine shape is built lazily and cached until
//! the description changes, at which point every subscribed body is
//! reported back to the caller for a rebuild.

use std::sync::Arc;

use glam::Vec3;
use lattice_core::Transform;
use lattice_core::math::vec3_is_equal_approx;
use parking_lot::{Mutex, RwLock};
use rapier3d::parry::shape::TriMeshFlags;
use rapier3d::prelude::{Point, Real, SharedShape};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::body_id::BodyKey;
use crate::convert::{to_isometry, to_point};
use crate::error::ShapeError;

/// Extents below this are inflated so boxes never degenerate
const BOX_MIN_HALF_EXTENT: f32 = 0.001;

/// Editable shape description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShapeDesc {
    Box {
        size: Vec3,
    },
    Sphere {
        radius: f32,
    },
    Capsule {
        radius: f32,
        height: f32,
    },
    Cylinder {
        radius: f32,
        height: f32,
    },
    /// Square grid of heights, row-major
    HeightField {
        samples: Vec<f32>,
        offset: Vec3,
        scale: Vec3,
        block_size: u32,
    },
    ConvexHull {
        points: Vec<Vec3>,
    },
    /// Triangle soup, three vertices per face
    Mesh {
        faces: Vec<Vec3>,
        double_sided: bool,
    },
    Compound {
        children: Vec<(ShapeDesc, Transform)>,
    },
}

impl ShapeDesc {
    pub fn cube(size: f32) -> Self {
        Self::Box {
            size: Vec3::splat(size),
        }
    }

    pub fn sphere() -> Self {
        Self::Sphere { radius: 0.5 }
    }

    pub fn capsule() -> Self {
        Self::Capsule {
            radius: 0.5,
            height: 2.0,
        }
    }

    pub fn height_field(samples: Vec<f32>) -> Self {
        Self::HeightField {
            samples,
            offset: Vec3::ZERO,
            scale: Vec3::ONE,
            block_size: 2,
        }
    }

    pub fn mesh(faces: Vec<Vec3>) -> Self {
        Self::Mesh {
            faces,
            double_sided: true,
        }
    }

    /// Whether dynamic simulation is possible with this shape
    pub fn is_convex(&self) -> bool {
        match self {
            Self::HeightField { .. } | Self::Mesh { .. } => false,
            Self::Compound { children } => children.iter().all(|(child, _)| child.is_convex()),
            _ => true,
        }
    }

    /// Description rescaled by `scale`. Primitives that need a uniform
    /// scale use the largest relevant axis.
    pub fn scaled(&self, scale: Vec3) -> ShapeDesc {
        let scale = scale.abs();
        match self {
            Self::Box { size } => Self::Box {
                size: *size * scale,
            },
            Self::Sphere { radius } => Self::Sphere {
                radius: radius * scale.max_element(),
            },
            Self::Capsule { radius, height } => Self::Capsule {
                radius: radius * scale.x.max(scale.z),
                height: height * scale.y,
            },
            Self::Cylinder { radius, height } => Self::Cylinder {
                radius: radius * scale.x.max(scale.z),
                height: height * scale.y,
            },
            Self::HeightField {
                samples,
                offset,
                scale: field_scale,
                block_size,
            } => Self::HeightField {
                samples: samples.clone(),
                offset: *offset * scale,
                scale: *field_scale * scale,
                block_size: *block_size,
            },
            Self::ConvexHull { points } => Self::ConvexHull {
                points: points.iter().map(|p| *p * scale).collect(),
            },
            Self::Mesh {
                faces,
                double_sided,
            } => Self::Mesh {
                faces: faces.iter().map(|p| *p * scale).collect(),
                double_sided: *double_sided,
            },
            Self::Compound { children } => Self::Compound {
                children: children
                    .iter()
                    .map(|(child, transform)| {
                        let mut transform = *transform;
                        transform.position *= scale;
                        (child.scaled(scale), transform)
                    })
                    .collect(),
            },
        }
    }

    /// Build the engine shape
    pub fn build(&self) -> Result<SharedShape, ShapeError> {
        match self {
            Self::Box { size } => {
                let mut half_extents = size.abs() * 0.5;
                if half_extents.min_element() - BOX_MIN_HALF_EXTENT < 0.0 {
                    half_extents += Vec3::splat(BOX_MIN_HALF_EXTENT);
                }
                Ok(SharedShape::cuboid(
                    half_extents.x,
                    half_extents.y,
                    half_extents.z,
                ))
            }
            Self::Sphere { radius } => Ok(SharedShape::ball(radius.abs())),
            Self::Capsule { radius, height } => {
                let radius = radius.abs();
                let half_height = (height.abs() - radius * 2.0).max(0.0) * 0.5;
                Ok(SharedShape::capsule_y(half_height, radius))
            }
            Self::Cylinder { radius, height } => {
                Ok(SharedShape::cylinder(height.abs() * 0.5, radius.abs()))
            }
            Self::HeightField {
                samples,
                offset,
                scale,
                block_size,
            } => build_height_field(samples, *offset, *scale, *block_size),
            Self::ConvexHull { points } => {
                if points.is_empty() {
                    return Err(ShapeError::EmptyData);
                }
                let points: Vec<Point<Real>> = points.iter().map(|p| to_point(*p)).collect();
                SharedShape::convex_hull(&points).ok_or(ShapeError::DegenerateConvexHull)
            }
            Self::Mesh {
                faces,
                double_sided,
            } => build_mesh(faces, *double_sided),
            Self::Compound { children } => build_compound(children),
        }
    }
}

impl Default for ShapeDesc {
    fn default() -> Self {
        Self::cube(1.0)
    }
}

fn build_height_field(
    samples: &[f32],
    offset: Vec3,
    scale: Vec3,
    block_size: u32,
) -> Result<SharedShape, ShapeError> {
    let side = ((samples.len() as f32).sqrt() + f32::EPSILON) as usize;
    if side < 2 {
        return Err(ShapeError::HeightFieldTooSmall(samples.len()));
    }
    if side * side != samples.len() {
        return Err(ShapeError::HeightFieldNotSquare(samples.len()));
    }
    if block_size == 0 || side % block_size as usize != 0 {
        return Err(ShapeError::HeightFieldBlockMismatch { side, block_size });
    }

    let vertices: Vec<Point<Real>> = samples
        .iter()
        .enumerate()
        .map(|(i, height)| {
            let x = (i % side) as f32;
            let z = (i / side) as f32;
            to_point(offset + Vec3::new(x, *height, z) * scale)
        })
        .collect();

    let mut indices = Vec::with_capacity((side - 1) * (side - 1) * 2);
    for z in 0..side - 1 {
        for x in 0..side - 1 {
            let i = (z * side + x) as u32;
            let right = i + 1;
            let down = i + side as u32;
            let diagonal = down + 1;
            indices.push([i, down, right]);
            indices.push([right, down, diagonal]);
        }
    }

    SharedShape::trimesh(vertices, indices).map_err(|err| ShapeError::Engine(format!("{err:?}")))
}

fn build_mesh(faces: &[Vec3], double_sided: bool) -> Result<SharedShape, ShapeError> {
    if faces.is_empty() {
        return Err(ShapeError::EmptyMesh);
    }
    if faces.len() % 3 != 0 {
        return Err(ShapeError::MeshNotTriangulated(faces.len()));
    }

    let vertices: Vec<Point<Real>> = faces.iter().map(|p| to_point(*p)).collect();
    let indices: Vec<[u32; 3]> = (0..faces.len() as u32 / 3)
        .map(|t| [t * 3, t * 3 + 1, t * 3 + 2])
        .collect();

    let built = if double_sided {
        SharedShape::trimesh(vertices, indices)
    } else {
        SharedShape::trimesh_with_flags(vertices, indices, TriMeshFlags::ORIENTED)
    };
    built.map_err(|err| ShapeError::Engine(format!("{err:?}")))
}

fn build_compound(children: &[(ShapeDesc, Transform)]) -> Result<SharedShape, ShapeError> {
    let mut parts = Vec::with_capacity(children.len());
    flatten_compound(children, &Transform::IDENTITY, &mut parts)?;
    if parts.is_empty() {
        return Err(ShapeError::EmptyData);
    }
    Ok(SharedShape::compound(parts))
}

fn flatten_compound(
    children: &[(ShapeDesc, Transform)],
    parent: &Transform,
    parts: &mut Vec<(rapier3d::prelude::Isometry<Real>, SharedShape)>,
) -> Result<(), ShapeError> {
    for (child, local) in children {
        let position = parent.transform_point(local.position);
        let rotation = parent.rotation * local.rotation;
        let scale = parent.scale * local.scale;

        match child {
            ShapeDesc::Mesh { .. } | ShapeDesc::HeightField { .. } => {
                return Err(ShapeError::NestedComposite);
            }
            ShapeDesc::Compound { children } => {
                let frame = Transform::new(position, rotation, scale);
                flatten_compound(children, &frame, parts)?;
            }
            _ => {
                let shape = if vec3_is_equal_approx(scale, Vec3::ONE) {
                    child.build()?
                } else {
                    child.scaled(scale).build()?
                };
                parts.push((to_isometry(position, rotation), shape));
            }
        }
    }
    Ok(())
}

/// Shared shape handle
pub type ShapeRef = Arc<Shape>;

/// Shape resource shared by bodies
#[derive(Debug)]
pub struct Shape {
    desc: RwLock<ShapeDesc>,
    cache: Mutex<Option<SharedShape>>,
    subscribers: Mutex<SmallVec<[BodyKey; 4]>>,
}

impl Shape {
    pub fn new(desc: ShapeDesc) -> ShapeRef {
        Arc::new(Self {
            desc: RwLock::new(desc),
            cache: Mutex::new(None),
            subscribers: Mutex::new(SmallVec::new()),
        })
    }

    pub fn desc(&self) -> ShapeDesc {
        self.desc.read().clone()
    }

    /// Replace the description. Returns the bodies that must rebuild.
    pub fn set_desc(&self, desc: ShapeDesc) -> SmallVec<[BodyKey; 4]> {
        *self.desc.write() = desc;
        *self.cache.lock() = None;
        self.subscribers.lock().clone()
    }

    pub fn is_convex(&self) -> bool {
        self.desc.read().is_convex()
    }

    /// Built engine shape, cached
    pub fn build(&self) -> Result<SharedShape, ShapeError> {
        let mut cache = self.cache.lock();
        if let Some(shape) = cache.as_ref() {
            return Ok(shape.clone());
        }
        let shape = self.desc.read().build()?;
        *cache = Some(shape.clone());
        Ok(shape)
    }

    /// Engine shape with `scale` baked in; unit scale shares the cache
    pub fn build_scaled(&self, scale: Vec3) -> Result<SharedShape, ShapeError> {
        if vec3_is_equal_approx(scale.abs(), Vec3::ONE) {
            self.build()
        } else {
            self.desc.read().scaled(scale).build()
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.build() {
            Ok(_) => true,
            Err(err) => {
                log::error!("Invalid shape: {}", err);
                false
            }
        }
    }

    pub fn subscribe(&self, key: BodyKey) {
        let mut subscribers = self.subscribers.lock();
        if !subscribers.contains(&key) {
            subscribers.push(key);
        }
    }

    pub fn unsubscribe(&self, key: BodyKey) {
        let mut subscribers = self.subscribers.lock();
        if let Some(index) = subscribers.iter().position(|k| *k == key) {
            subscribers.swap_remove(index);
        }
    }

    pub fn subscribers(&self) -> SmallVec<[BodyKey; 4]> {
        self.subscribers.lock().clone()
    }
}
