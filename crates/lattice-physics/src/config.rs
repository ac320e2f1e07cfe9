//! Session configuration
//!
//! Every tunable of the physics layer, loadable from JSON. Missing fields
//! fall back to their defaults.

use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::PhysicsResult;

/// Sizing and stepping of a single physics world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSettings {
    pub max_bodies: u32,
    pub num_body_mutexes: u32,
    pub max_body_pairs: u32,
    pub max_contact_constraints: u32,
    /// Retained scratch memory per world, in bytes
    pub temp_allocator_bytes: usize,
    pub gravity: Vec3,
    /// Collision sub-steps per `step` call
    pub collision_steps: u32,
    /// Worker threads; `None` uses hardware concurrency - 1
    pub worker_threads: Option<usize>,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            max_bodies: 10_000,
            num_body_mutexes: 0,
            max_body_pairs: 10_000,
            max_contact_constraints: 10_000,
            temp_allocator_bytes: 10 * 1024 * 1024,
            gravity: Vec3::new(0.0, -9.81, 0.0),
            collision_steps: 1,
            worker_threads: None,
        }
    }
}

/// Body id allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyIdSettings {
    /// Ids below this threshold are unsynchronized
    pub max_unsync_bodies: u32,
}

impl Default for BodyIdSettings {
    fn default() -> Self {
        Self {
            max_unsync_bodies: 500,
        }
    }
}

/// Relevancy tunables for spatial sync groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncGroupSettings {
    pub physics_simulation_radius: f32,
    pub trickled_size_over_distance_max: f32,
    pub trickled_size_over_distance_min: f32,
    pub trickled_size_over_distance_stop_sync: f32,
    pub deferred_relevancy_low_rate: f32,
    pub deferred_relevancy_min_rate: f32,
    pub deferred_relevancy_max_rate: f32,
    pub character_group_threshold_distance: f32,
    pub simulated_timeout_ms: u64,
    pub simulated_character_timeout_ms: u64,
    pub trickled_high_precision_timeout_ms: u64,
    pub trickled_high_precision_rate: f32,
    pub character_min_trickle_rate: f32,
}

impl Default for SyncGroupSettings {
    fn default() -> Self {
        Self {
            physics_simulation_radius: 40.0,
            trickled_size_over_distance_max: 0.5,
            trickled_size_over_distance_min: 0.025,
            trickled_size_over_distance_stop_sync: 0.009,
            deferred_relevancy_low_rate: 0.15,
            deferred_relevancy_min_rate: 0.30,
            deferred_relevancy_max_rate: 0.90,
            character_group_threshold_distance: 8.0,
            simulated_timeout_ms: 3000,
            simulated_character_timeout_ms: 10_000,
            trickled_high_precision_timeout_ms: 1000,
            trickled_high_precision_rate: 1.0,
            character_min_trickle_rate: 0.4,
        }
    }
}

/// A named layer and its broad-phase bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDef {
    pub name: String,
    pub broadphase: u8,
}

impl LayerDef {
    pub fn new(name: impl Into<String>, broadphase: u8) -> Self {
        Self {
            name: name.into(),
            broadphase,
        }
    }
}

/// Declarative layer table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerTableConfig {
    pub layers: Vec<LayerDef>,
    pub collide_with: Vec<(String, String)>,
}

impl Default for LayerTableConfig {
    fn default() -> Self {
        let layers = vec![
            LayerDef::new("", 0),
            LayerDef::new("NO_COLLIDE", 0),
            LayerDef::new("STATIC", 0),
            LayerDef::new("KINEMATIC", 1),
            LayerDef::new("CHARACTER", 1),
            LayerDef::new("DYNAMIC", 1),
            LayerDef::new("TRIGGER", 1),
        ];

        let movers = ["KINEMATIC", "CHARACTER", "DYNAMIC", "TRIGGER"];
        let targets = ["STATIC", "KINEMATIC", "CHARACTER", "DYNAMIC", "TRIGGER"];
        let mut collide_with = Vec::new();
        for a in movers {
            for b in targets {
                collide_with.push((a.to_string(), b.to_string()));
            }
        }

        Self {
            layers,
            collide_with,
        }
    }
}

/// Aggregated configuration of a physics session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub world: WorldSettings,
    pub body_ids: BodyIdSettings,
    pub sync_groups: SyncGroupSettings,
    pub layers: LayerTableConfig,
}

impl SessionConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> PhysicsResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON file
    pub fn load(path: impl AsRef<Path>) -> PhysicsResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&text)?;
        log::debug!("Loaded session config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Serialize as pretty JSON
    pub fn to_json_string(&self) -> PhysicsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
