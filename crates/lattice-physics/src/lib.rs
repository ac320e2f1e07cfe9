//! # Lattice Physics
//!
//! Integration layer between a rigid-body engine and a networked scene.
//!
//! ## Features
//! - Worlds with id-stable bodies, scaled shapes and CCD policy
//! - Binary state snapshots, filtered per sync group
//! - Sensor overlap events with a one-frame exit grace
//! - Kinematic characters and authority-driven NPC movers
//! - Spatial sync groups deciding what each peer receives, and how often

pub mod body;
pub mod body_id;
pub mod character;
pub mod config;
pub mod contact_listener;
pub mod convert;
pub mod error;
pub mod events;
pub mod layers;
pub mod manager;
pub mod query;
pub mod recorder;
pub mod session;
pub mod shape;
pub mod snapshot;
pub mod state_filter;
pub mod sync_groups;
pub mod world;

pub use body::{Body, BodyBehavior, BodyMode, BodySettings, NetworkRole, PhysicsContext};
pub use body_id::{BodyId, BodyIdAllocator, BodyIdManager, BodyKey};
pub use character::{
    CharacterController, CharacterInput, CharacterSettings, CharacterVirtual, GroundState,
    NpcMover, PendingInteraction,
};
pub use config::{BodyIdSettings, LayerTableConfig, SessionConfig, SyncGroupSettings, WorldSettings};
pub use contact_listener::{ContactListener, ContactStats, OverlapStatus, SensorOverlap};
pub use error::{PhysicsError, PhysicsResult, ShapeError};
pub use events::{BodyEvent, EventQueue};
pub use layers::{LayerIndex, LayerTable, ObjectLayerFilter};
pub use manager::{MAIN_WORLD, WorldManager};
pub use query::{CastHit, RayHit, ShapeHit};
pub use recorder::StateRecorder;
pub use session::PhysicsSession;
pub use shape::{Shape, ShapeDesc, ShapeRef};
pub use snapshot::BodyState;
pub use state_filter::{StateRecorderFilter, StateRecorderState, SyncStateFilter};
pub use sync_groups::{PeerId, SpatialSyncGroups, SyncGroupId, SyncGroupMetadata};
pub use world::{BodyCreateInfo, PhysicsWorld, WorldId};
