//! Error types for the physics layer.

use thiserror::Error;

use crate::body_id::BodyId;
use crate::world::WorldId;

/// Shape building errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("Shape has no data")]
    EmptyData,
    #[error("Height field needs at least 2x2 samples, got {0}")]
    HeightFieldTooSmall(usize),
    #[error("Height field sample count {0} is not a square number")]
    HeightFieldNotSquare(usize),
    #[error("Height field side {side} is not a multiple of the block size {block_size}")]
    HeightFieldBlockMismatch { side: usize, block_size: u32 },
    #[error("Convex hull points are degenerate")]
    DegenerateConvexHull,
    #[error("Mesh has no faces")]
    EmptyMesh,
    #[error("Mesh vertex count {0} is not a multiple of 3")]
    MeshNotTriangulated(usize),
    #[error("Meshes and height fields can't be compound children")]
    NestedComposite,
    #[error("Engine rejected the shape: {0}")]
    Engine(String),
}

/// Physics layer errors
#[derive(Error, Debug)]
pub enum PhysicsError {
    #[error("Unknown layer `{0}`")]
    UnknownLayer(String),
    #[error("World {0} does not exist")]
    InvalidWorld(WorldId),
    #[error("World {0} can't be destroyed")]
    WorldNotDestroyable(WorldId),
    #[error("Body index {index} exceeds the world capacity of {max_bodies}")]
    WorldCapacity { index: u32, max_bodies: u32 },
    #[error("The desired body id `{0}` is already in use")]
    DesiredIdOccupied(u32),
    #[error("Body {0:?} has no simulated backing")]
    NoSimulatedBody(BodyId),
    #[error("Body has no valid shape")]
    InvalidShape,
    #[error("You can't use `{0}` while the physics is processing")]
    PhysicsProcessing(&'static str),
    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("Interaction {0} is not registered")]
    InteractionNotRegistered(u8),
    #[error("Interaction `{0}` is unknown")]
    UnknownInteraction(String),
    #[error("Body {0:?} is not in the body table")]
    UnknownBody(crate::body_id::BodyKey),
    #[error("Operation not allowed: {0}")]
    NotAllowed(&'static str),
    #[error("State restore failed: {0}")]
    StateRestore(String),
    #[error("Job pool error: {0}")]
    Job(#[from] lattice_core::JobError),
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("Config IO error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

/// Result type for physics operations
pub type PhysicsResult<T> = Result<T, PhysicsError>;
