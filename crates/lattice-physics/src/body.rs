//! Bodies
//!
//! A [`Body`] is the owner-side view of one simulated entity: its shape,
//! motion mode, layer and physical settings, plus the behaviour variant
//! (plain rigid body, player character or NPC). The engine body is created
//! lazily once a valid shape is assigned and recreated when the desired id
//! changes.

use glam::{Quat, Vec2, Vec3};
use lattice_core::{Millis, Transform};
use rapier3d::prelude::RigidBodyType;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::body_id::{BodyId, BodyIdAllocator, BodyKey};
use crate::character::{
    CharacterController, CharacterInput, CharacterSettings, NpcMoveParams, NpcMover,
    PendingInteraction,
};
use crate::error::{PhysicsError, PhysicsResult};
use crate::events::{BodyEvent, EventQueue};
use crate::layers::{LayerIndex, LayerTable, ObjectLayerFilter};
use crate::manager::{MAIN_WORLD, WorldManager};
use crate::query::{ShapeHit, nearest_hit};
use crate::recorder::StateRecorder;
use crate::shape::ShapeRef;
use crate::sync_groups::{PeerId, SyncGroupId};
use crate::world::{BodyCreateInfo, PhysicsWorld, WorldId};

/// A peer that hasn't heard about a moving body for this long stops
/// considering it updating
pub const NET_SYNC_UPDATE_TIMEOUT_MS: Millis = 10_000;

/// Motion mode
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyMode {
    #[default]
    Static = 0,
    Kinematic = 1,
    Dynamic = 2,
    /// Kinematic sensor, detects static bodies too
    Sensor = 3,
    /// Static sensor, only detects moving bodies
    SensorOnlyActive = 4,
}

impl BodyMode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Static),
            1 => Some(Self::Kinematic),
            2 => Some(Self::Dynamic),
            3 => Some(Self::Sensor),
            4 => Some(Self::SensorOnlyActive),
            _ => None,
        }
    }

    /// Engine motion type backing this mode
    pub fn engine_type(self) -> RigidBodyType {
        match self {
            Self::Static | Self::SensorOnlyActive => RigidBodyType::Fixed,
            Self::Kinematic | Self::Sensor => RigidBodyType::KinematicPositionBased,
            Self::Dynamic => RigidBodyType::Dynamic,
        }
    }

    pub fn is_static(self) -> bool {
        matches!(self, Self::Static | Self::SensorOnlyActive)
    }

    pub fn is_sensor(self) -> bool {
        matches!(self, Self::Sensor | Self::SensorOnlyActive)
    }

    pub fn is_dynamic(self) -> bool {
        self == Self::Dynamic
    }

    pub fn is_kinematic(self) -> bool {
        self == Self::Kinematic
    }
}

/// Side of the network a session runs on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkRole {
    /// Server: owns the simulation and never stops updating bodies
    #[default]
    Authority,
    Peer,
}

/// Physical properties of a body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodySettings {
    pub friction: f32,
    pub restitution: f32,
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub max_linear_velocity: f32,
    pub max_angular_velocity_deg: f32,
    pub gravity_scale: f32,
    pub use_ccd: bool,
    pub allow_sleeping: bool,
    /// Kinematic bodies also report contacts with static ones
    pub kinematic_detects_static: bool,
    pub report_precise_touch: bool,
}

impl Default for BodySettings {
    fn default() -> Self {
        Self {
            friction: 0.2,
            restitution: 0.0,
            mass: 1.0,
            linear_damping: 0.05,
            angular_damping: 0.05,
            max_linear_velocity: 500.0,
            max_angular_velocity_deg: 0.25 * 180.0 * 60.0,
            gravity_scale: 1.0,
            use_ccd: false,
            allow_sleeping: true,
            kinematic_detects_static: false,
            report_precise_touch: false,
        }
    }
}

impl BodySettings {
    /// Mass handed to the engine
    pub fn engine_mass(&self) -> f32 {
        self.mass.max(0.001) * 100.0
    }

    pub fn max_angular_velocity_rad(&self) -> f32 {
        self.max_angular_velocity_deg.to_radians()
    }
}

/// Pack a layer index and a mode into one byte: `layer << 3 | mode`
pub fn combine_layer_and_mode(layer: LayerIndex, mode: BodyMode) -> u8 {
    (layer << 3) | mode.as_u8()
}

/// Inverse of [`combine_layer_and_mode`]
pub fn split_layer_and_mode(combined: u8) -> (LayerIndex, Option<BodyMode>) {
    (combined >> 3, BodyMode::from_u8(combined & 0x7))
}

/// Behaviour variant of a body
#[derive(Debug, Clone, Default)]
pub enum BodyBehavior {
    #[default]
    Rigid,
    Character(CharacterController),
    /// Space object that can be driven by the authority while kinematic
    Npc(NpcMover),
}

/// Services a body needs for its lifecycle
pub struct PhysicsContext<'a> {
    pub worlds: &'a mut WorldManager,
    pub layers: &'a LayerTable,
    pub ids: &'a mut dyn BodyIdAllocator,
    pub events: &'a mut EventQueue,
    pub role: NetworkRole,
    pub now: Millis,
}

/// Owner-side body
#[derive(Debug, Clone)]
pub struct Body {
    key: BodyKey,
    world: WorldId,
    id: Option<BodyId>,
    desired_id: Option<u32>,
    layer: String,
    mode: BodyMode,
    settings: BodySettings,
    shape: Option<ShapeRef>,
    transform: Transform,
    behavior: BodyBehavior,

    ignore_state_sync: bool,
    last_state: Vec<u8>,
    last_received_update_ms: Option<Millis>,
    net_sync_updating: bool,

    interactions: Vec<String>,
    selected_by_peers: SmallVec<[PeerId; 4]>,
    static_updated_groups: SmallVec<[SyncGroupId; 4]>,
}

impl Body {
    pub fn new(key: BodyKey) -> Self {
        Self {
            key,
            world: MAIN_WORLD,
            id: None,
            desired_id: None,
            layer: String::new(),
            mode: BodyMode::default(),
            settings: BodySettings::default(),
            shape: None,
            transform: Transform::IDENTITY,
            behavior: BodyBehavior::Rigid,
            ignore_state_sync: false,
            last_state: Vec::new(),
            last_received_update_ms: None,
            net_sync_updating: false,
            interactions: Vec::new(),
            selected_by_peers: SmallVec::new(),
            static_updated_groups: SmallVec::new(),
        }
    }

    /// Kinematic player character on the `CHARACTER` layer
    pub fn character(key: BodyKey, settings: CharacterSettings) -> Self {
        let mass = settings.mass;
        let mut body = Self::new(key)
            .with_layer("CHARACTER")
            .with_mode(BodyMode::Kinematic)
            .with_behavior(BodyBehavior::Character(CharacterController::new(settings)));
        body.settings.mass = mass;
        body
    }

    /// Space object that can be moved as an NPC while kinematic
    pub fn npc(key: BodyKey) -> Self {
        Self::new(key)
            .with_mode(BodyMode::Kinematic)
            .with_behavior(BodyBehavior::Npc(NpcMover::new()))
    }

    pub fn with_world(mut self, world: WorldId) -> Self {
        self.world = world;
        self
    }

    pub fn with_shape(mut self, shape: ShapeRef) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = layer.into();
        self
    }

    pub fn with_mode(mut self, mode: BodyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_settings(mut self, settings: BodySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_desired_id(mut self, desired_id: u32) -> Self {
        self.desired_id = Some(desired_id);
        self
    }

    pub fn with_behavior(mut self, behavior: BodyBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn key(&self) -> BodyKey {
        self.key
    }

    pub fn world(&self) -> WorldId {
        self.world
    }

    /// Id of the simulated backing, if any
    pub fn id(&self) -> Option<BodyId> {
        self.id
    }

    pub fn has_body(&self) -> bool {
        self.id.is_some()
    }

    pub fn desired_id(&self) -> Option<u32> {
        self.desired_id
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn mode(&self) -> BodyMode {
        self.mode
    }

    pub fn settings(&self) -> &BodySettings {
        &self.settings
    }

    pub fn shape(&self) -> Option<&ShapeRef> {
        self.shape.as_ref()
    }

    /// Last known transform
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn behavior(&self) -> &BodyBehavior {
        &self.behavior
    }

    pub fn behavior_mut(&mut self) -> &mut BodyBehavior {
        &mut self.behavior
    }

    pub fn is_static(&self) -> bool {
        self.mode.is_static()
    }

    pub fn is_sensor(&self) -> bool {
        self.mode.is_sensor()
    }

    pub fn is_dynamic(&self) -> bool {
        self.mode.is_dynamic()
    }

    pub fn is_kinematic(&self) -> bool {
        self.mode.is_kinematic()
    }

    pub fn is_character(&self) -> bool {
        matches!(self.behavior, BodyBehavior::Character(_))
    }

    /// NPCs are kinematic space objects
    pub fn is_npc(&self) -> bool {
        matches!(self.behavior, BodyBehavior::Npc(_)) && self.mode == BodyMode::Kinematic
    }

    pub fn character_controller(&self) -> Option<&CharacterController> {
        match &self.behavior {
            BodyBehavior::Character(controller) => Some(controller),
            _ => None,
        }
    }

    pub fn character_controller_mut(&mut self) -> Option<&mut CharacterController> {
        match &mut self.behavior {
            BodyBehavior::Character(controller) => Some(controller),
            _ => None,
        }
    }

    pub fn set_ignore_state_sync(&mut self, ignore: bool) {
        self.ignore_state_sync = ignore;
    }

    // ------------------------------------------------------------ Lifecycle

    /// Reconcile the engine body with the current shape and desired id
    pub fn update_body(&mut self, ctx: &mut PhysicsContext<'_>) -> PhysicsResult<()> {
        let shape_valid = self.shape.as_ref().is_some_and(|shape| shape.is_valid());

        match (shape_valid, self.id) {
            (true, Some(id)) => {
                let desired_changed = self.desired_id.is_some_and(|desired| desired != id.index());
                if desired_changed {
                    self.destroy_body(ctx)?;
                    self.create_body(ctx)
                } else if let Some(shape) = self.shape.clone() {
                    self.reset_movers();
                    ctx.worlds.world_mut(self.world)?.set_shape(id, shape)
                } else {
                    Ok(())
                }
            }
            (true, None) => self.create_body(ctx),
            (false, Some(_)) => self.destroy_body(ctx),
            (false, None) => Ok(()),
        }
    }

    fn create_info(&self) -> PhysicsResult<BodyCreateInfo> {
        let Some(shape) = self.shape.clone() else {
            return Err(PhysicsError::InvalidShape);
        };
        let mut info = BodyCreateInfo::new(self.key, shape, self.transform)
            .with_layer(self.layer.clone())
            .with_mode(self.mode)
            .with_settings(self.settings.clone());
        if let Some(desired_id) = self.desired_id {
            info = info.with_desired_id(desired_id);
        }
        info.is_character = self.is_character();
        Ok(info)
    }

    fn create_body(&mut self, ctx: &mut PhysicsContext<'_>) -> PhysicsResult<()> {
        let info = self.create_info()?;
        let world = ctx.worlds.world_mut(self.world)?;
        let id = world.create_body(ctx.layers, &mut *ctx.ids, &info)?;

        self.id = Some(id);
        if let Some(mode) = world.mode_of(id) {
            self.mode = mode;
        }
        self.reset_movers();
        ctx.events.push(BodyEvent::BodyCreated { body: self.key, id });
        Ok(())
    }

    fn destroy_body(&mut self, ctx: &mut PhysicsContext<'_>) -> PhysicsResult<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        self.reset_movers();
        ctx.worlds
            .world_mut(self.world)?
            .destroy_body(id, &mut *ctx.ids, true)?;
        ctx.events.push(BodyEvent::BodyDestroyed { body: self.key, id });
        Ok(())
    }

    fn reset_movers(&mut self) {
        match &mut self.behavior {
            BodyBehavior::Rigid => {}
            BodyBehavior::Character(controller) => controller.reset_virtual(),
            BodyBehavior::Npc(npc) => npc.reset_virtual(),
        }
    }

    /// The owner is going away: drop the engine body and release a desired id
    pub fn on_owner_destroyed(&mut self, ctx: &mut PhysicsContext<'_>) -> PhysicsResult<()> {
        let result = self.destroy_body(ctx);
        ctx.ids.on_owner_destroyed(self.desired_id);
        if let Some(shape) = &self.shape {
            shape.unsubscribe(self.key);
        }
        result
    }

    pub fn set_shape(&mut self, ctx: &mut PhysicsContext<'_>, shape: Option<ShapeRef>) -> PhysicsResult<()> {
        self.shape = shape;
        self.update_body(ctx)
    }

    pub fn set_desired_id(&mut self, ctx: &mut PhysicsContext<'_>, desired_id: Option<u32>) -> PhysicsResult<()> {
        self.desired_id = desired_id;
        self.update_body(ctx)
    }

    /// Switch the motion mode. Dynamic falls back to Static for
    /// non-convex shapes.
    pub fn set_mode(&mut self, worlds: &mut WorldManager, mode: BodyMode) -> PhysicsResult<()> {
        let non_convex = self.shape.as_ref().is_some_and(|shape| !shape.is_convex());
        self.mode = if mode == BodyMode::Dynamic && non_convex {
            BodyMode::Static
        } else {
            mode
        };
        if let Some(id) = self.id {
            self.mode = worlds.world_mut(self.world)?.set_motion(id, self.mode)?;
        }
        Ok(())
    }

    pub fn set_layer(
        &mut self,
        worlds: &mut WorldManager,
        layers: &LayerTable,
        layer: &str,
    ) -> PhysicsResult<()> {
        let Some(index) = layers.find(layer) else {
            log::error!("The layer `{}` doesn't exist", layer);
            return Err(PhysicsError::UnknownLayer(layer.to_string()));
        };
        self.layer = layer.to_string();
        if let Some(id) = self.id {
            worlds.world_mut(self.world)?.set_layer(id, index, layers)?;
        }
        Ok(())
    }

    pub fn set_settings(&mut self, worlds: &mut WorldManager, settings: BodySettings) -> PhysicsResult<()> {
        self.settings = settings;
        if let Some(id) = self.id {
            worlds.world_mut(self.world)?.apply_settings(id, &self.settings)?;
        }
        Ok(())
    }

    /// Teleport the body; static and sensor bodies are flagged as changed
    pub fn set_transform(&mut self, worlds: &mut WorldManager, transform: Transform) -> PhysicsResult<()> {
        self.transform = transform;
        if self.is_static() || self.is_sensor() {
            self.mark_as_changed();
        }
        if let BodyBehavior::Character(controller) = &mut self.behavior {
            if let Some(mover) = controller.virtual_character_mut() {
                mover.set_position(transform.position);
                mover.set_rotation(transform.rotation);
            }
        }
        if let Some(id) = self.id {
            worlds.world_mut(self.world)?.set_transform(id, &transform)?;
        }
        Ok(())
    }

    /// Store a transform read back from the engine
    pub(crate) fn apply_synced_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    // ------------------------------------------------------------ Motion

    fn on_engine_body<R>(
        &self,
        worlds: &mut WorldManager,
        apply: impl FnOnce(&mut PhysicsWorld, BodyId) -> PhysicsResult<R>,
    ) -> PhysicsResult<Option<R>> {
        let Some(id) = self.id else {
            log::debug!("Body {:?} has no simulated backing", self.key);
            return Ok(None);
        };
        let world = worlds.world_mut(self.world)?;
        apply(world, id).map(Some)
    }

    /// Characters accumulate forces until their next `process_character`
    pub fn add_force(&mut self, worlds: &mut WorldManager, force: Vec3) -> PhysicsResult<()> {
        if let BodyBehavior::Character(controller) = &mut self.behavior {
            controller.add_force(force);
            return Ok(());
        }
        self.on_engine_body(worlds, |world, id| world.add_force(id, force))?;
        Ok(())
    }

    pub fn add_force_at(&mut self, worlds: &mut WorldManager, force: Vec3, point: Vec3) -> PhysicsResult<()> {
        self.on_engine_body(worlds, |world, id| world.add_force_at(id, force, point))?;
        Ok(())
    }

    pub fn add_torque(&mut self, worlds: &mut WorldManager, torque: Vec3) -> PhysicsResult<()> {
        self.on_engine_body(worlds, |world, id| world.add_torque(id, torque))?;
        Ok(())
    }

    pub fn add_impulse(&mut self, worlds: &mut WorldManager, impulse: Vec3) -> PhysicsResult<()> {
        if let BodyBehavior::Character(controller) = &mut self.behavior {
            controller.add_impulse(impulse);
            return Ok(());
        }
        self.on_engine_body(worlds, |world, id| world.add_impulse(id, impulse))?;
        Ok(())
    }

    pub fn add_impulse_at(&mut self, worlds: &mut WorldManager, impulse: Vec3, point: Vec3) -> PhysicsResult<()> {
        self.on_engine_body(worlds, |world, id| world.add_impulse_at(id, impulse, point))?;
        Ok(())
    }

    pub fn add_angular_impulse(&mut self, worlds: &mut WorldManager, impulse: Vec3) -> PhysicsResult<()> {
        self.on_engine_body(worlds, |world, id| world.add_angular_impulse(id, impulse))?;
        Ok(())
    }

    pub fn linear_velocity(&self, worlds: &WorldManager) -> Vec3 {
        if let Some(mover) = self.character_controller().and_then(|c| c.virtual_character()) {
            return mover.linear_velocity();
        }
        self.id
            .and_then(|id| worlds.world(self.world).ok()?.linear_velocity(id))
            .unwrap_or(Vec3::ZERO)
    }

    pub fn angular_velocity(&self, worlds: &WorldManager) -> Vec3 {
        self.id
            .and_then(|id| worlds.world(self.world).ok()?.angular_velocity(id))
            .unwrap_or(Vec3::ZERO)
    }

    pub fn set_linear_velocity(&mut self, worlds: &mut WorldManager, velocity: Vec3) -> PhysicsResult<()> {
        if let Some(mover) = self
            .character_controller_mut()
            .and_then(CharacterController::virtual_character_mut)
        {
            mover.set_linear_velocity(velocity);
            return Ok(());
        }
        self.on_engine_body(worlds, |world, id| world.set_linear_velocity(id, velocity))?;
        Ok(())
    }

    pub fn set_angular_velocity(&mut self, worlds: &mut WorldManager, velocity: Vec3) -> PhysicsResult<()> {
        self.on_engine_body(worlds, |world, id| world.set_angular_velocity(id, velocity))?;
        Ok(())
    }

    /// Wake a sleeping body
    pub fn activate(&self, worlds: &mut WorldManager) -> PhysicsResult<()> {
        self.on_engine_body(worlds, |world, id| {
            world.activate(id);
            Ok(())
        })?;
        Ok(())
    }

    pub fn is_sleeping(&self, worlds: &WorldManager) -> bool {
        self.id
            .and_then(|id| worlds.world(self.world).ok().map(|world| world.is_sleeping(id)))
            .unwrap_or(false)
    }

    /// Drive a kinematic body toward a pose over the next step
    pub fn move_kinematic(
        &mut self,
        worlds: &mut WorldManager,
        position: Vec3,
        rotation: Quat,
    ) -> PhysicsResult<()> {
        self.on_engine_body(worlds, |world, id| world.move_kinematic(id, position, rotation))?;
        Ok(())
    }

    /// Sweep the body along `motion` and stop at the nearest blocking hit.
    /// Hits the body is moving away from don't block.
    pub fn move_and_collide(
        &mut self,
        worlds: &mut WorldManager,
        motion: Vec3,
        layers: &ObjectLayerFilter,
    ) -> PhysicsResult<Option<ShapeHit>> {
        let Some(id) = self.id else {
            return Err(PhysicsError::NoSimulatedBody(BodyId::INVALID));
        };
        let world = worlds.world_mut(self.world)?;
        let hits: Vec<ShapeHit> = world
            .cast_body(id, motion, layers)?
            .into_iter()
            .filter(|hit| motion.dot(hit.normal) < 0.0)
            .collect();
        let hit = nearest_hit(&hits).copied();
        let fraction = hit.map(|hit| hit.fraction).unwrap_or(1.0);

        let Some(mut transform) = world.transform(id) else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };
        transform.position += motion * fraction;
        if self.mode.engine_type() == RigidBodyType::KinematicPositionBased {
            world.move_kinematic(id, transform.position, transform.rotation)?;
        } else {
            world.set_transform(id, &transform)?;
        }
        self.transform = transform;
        Ok(hit)
    }

    pub fn cast_body(
        &self,
        worlds: &WorldManager,
        motion: Vec3,
        layers: &ObjectLayerFilter,
    ) -> PhysicsResult<Vec<ShapeHit>> {
        let Some(id) = self.id else {
            return Ok(Vec::new());
        };
        worlds.world(self.world)?.cast_body(id, motion, layers)
    }

    pub fn collide_body(&self, worlds: &WorldManager, layers: &ObjectLayerFilter) -> PhysicsResult<Vec<ShapeHit>> {
        let Some(id) = self.id else {
            return Ok(Vec::new());
        };
        worlds.world(self.world)?.collide_body(id, layers)
    }

    // ------------------------------------------------------------ State sync

    pub fn combined_layer_and_mode(&self, layers: &LayerTable) -> u8 {
        combine_layer_and_mode(layers.layer_for_name(&self.layer), self.mode)
    }

    pub fn set_combined_layer_and_mode(
        &mut self,
        worlds: &mut WorldManager,
        layers: &LayerTable,
        combined: u8,
    ) -> PhysicsResult<()> {
        let (layer, mode) = split_layer_and_mode(combined);
        let Some(mode) = mode else {
            return Err(PhysicsError::StateRestore(format!(
                "invalid body mode in {combined:#04x}"
            )));
        };
        self.set_mode(worlds, mode)?;
        let name = layers.name_for_layer(layer).to_string();
        self.set_layer(worlds, layers, &name)
    }

    /// `[layer << 3 | mode][body state]`, or the last received blob while
    /// there is no engine body
    pub fn get_state(&self, worlds: &WorldManager, layers: &LayerTable) -> Vec<u8> {
        let Some(id) = self.id else {
            return self.last_state.clone();
        };
        let Ok(world) = worlds.world(self.world) else {
            return self.last_state.clone();
        };
        let mut recorder = StateRecorder::new();
        recorder.write(&self.combined_layer_and_mode(layers));
        if !world.body_save_state(id, &mut recorder) {
            return self.last_state.clone();
        }
        recorder.into_data()
    }

    /// Apply a blob produced by `get_state`. Returns whether a body state
    /// was restored.
    pub fn set_state(&mut self, ctx: &mut PhysicsContext<'_>, data: &[u8]) -> PhysicsResult<bool> {
        self.last_state = data.to_vec();
        self.notify_received_net_sync_update(ctx.now);

        if data.is_empty() || self.ignore_state_sync {
            return Ok(false);
        }

        let mut recorder = StateRecorder::from_data(data.to_vec());
        let Some(combined) = recorder.read_value::<u8>() else {
            return Err(PhysicsError::StateRestore("empty body state".to_string()));
        };
        self.set_combined_layer_and_mode(ctx.worlds, ctx.layers, combined)?;

        if self.id.is_none() && self.desired_id.is_some() {
            self.create_body(ctx)?;
        }
        let Some(id) = self.id else {
            return Ok(false);
        };

        let world = ctx.worlds.world_mut(self.world)?;
        if !world.body_restore_state(id, &mut recorder) {
            return Err(PhysicsError::StateRestore(format!(
                "body state of {:?} is corrupted",
                self.key
            )));
        }
        if let Some(transform) = world.transform(id) {
            self.transform = transform;
        }
        Ok(true)
    }

    /// Character sync blob. A peer that never received one reports empty,
    /// matching the authority before the mover exists.
    pub fn character_state(&self, role: NetworkRole) -> Vec<u8> {
        let Some(controller) = self.character_controller() else {
            return Vec::new();
        };
        if role == NetworkRole::Peer && !controller.has_received_state() {
            return Vec::new();
        }
        controller.get_state()
    }

    pub fn set_character_state(&mut self, ctx: &mut PhysicsContext<'_>, data: &[u8]) -> PhysicsResult<bool> {
        self.notify_received_net_sync_update(ctx.now);
        if !self.is_character() {
            return Err(PhysicsError::NotAllowed("character state on a non-character body"));
        }
        if !data.is_empty() && self.id.is_none() && self.desired_id.is_some() {
            self.create_body(ctx)?;
        }

        let world = ctx.worlds.world(self.world)?;
        let id = self.id;
        let Some(controller) = self.character_controller_mut() else {
            return Ok(false);
        };
        match id {
            Some(id) if !data.is_empty() => Ok(controller.set_state(data, world, id)),
            _ => {
                controller.remember_state(data);
                Ok(false)
            }
        }
    }

    pub fn notify_received_net_sync_update(&mut self, now: Millis) {
        self.last_received_update_ms = Some(now);
    }

    pub fn is_net_sync_updating(&self) -> bool {
        self.net_sync_updating
    }

    /// Refresh the updating flag and emit its transitions.
    ///
    /// `locally_simulated` tells whether this peer simulates the body.
    pub fn update_net_sync(
        &mut self,
        role: NetworkRole,
        now: Millis,
        locally_simulated: bool,
        events: &mut EventQueue,
    ) {
        let updating = match role {
            NetworkRole::Authority => true,
            NetworkRole::Peer if self.is_dynamic() || self.is_kinematic() => {
                let recent = self
                    .last_received_update_ms
                    .is_some_and(|last| now.saturating_sub(last) < NET_SYNC_UPDATE_TIMEOUT_MS);
                recent || (self.net_sync_updating && locally_simulated)
            }
            NetworkRole::Peer => true,
        };

        if updating != self.net_sync_updating {
            self.net_sync_updating = updating;
            events.push(if updating {
                BodyEvent::StartUpdating { body: self.key }
            } else {
                BodyEvent::StopUpdating { body: self.key }
            });
        }
    }

    // ------------------------------------------------------------ Interactions

    /// Register an interaction name, returning its id
    pub fn register_interaction(&mut self, name: &str) -> u8 {
        if let Some(id) = self.interaction_id(name) {
            return id;
        }
        self.interactions.push(name.to_string());
        (self.interactions.len() - 1) as u8
    }

    pub fn interaction_id(&self, name: &str) -> Option<u8> {
        self.interactions
            .iter()
            .position(|registered| registered == name)
            .map(|index| index as u8)
    }

    pub fn interactions(&self) -> &[String] {
        &self.interactions
    }

    pub fn call_interaction(
        &self,
        interaction_id: u8,
        argument: &[u8],
        events: &mut EventQueue,
    ) -> PhysicsResult<()> {
        let Some(name) = self.interactions.get(interaction_id as usize) else {
            log::error!(
                "Body {:?} has no interaction {}",
                self.key,
                interaction_id
            );
            return Err(PhysicsError::InteractionNotRegistered(interaction_id));
        };
        events.push(BodyEvent::InteractionCalled {
            body: self.key,
            interaction: name.clone(),
            argument: argument.to_vec(),
        });
        Ok(())
    }

    /// Queue an interaction on `target` for the next interaction buffer
    pub fn queue_interaction(&mut self, target: &Body, name: &str, argument: Vec<u8>) -> PhysicsResult<()> {
        let Some(interaction_id) = target.interaction_id(name) else {
            return Err(PhysicsError::UnknownInteraction(name.to_string()));
        };
        let Some(controller) = self.character_controller_mut() else {
            return Err(PhysicsError::NotAllowed("only characters queue interactions"));
        };
        controller.queue_interaction(PendingInteraction {
            target: target.key,
            interaction_id,
            argument,
        });
        Ok(())
    }

    // ------------------------------------------------------------ Sync groups

    pub fn selected_by_peers(&self) -> &[PeerId] {
        &self.selected_by_peers
    }

    pub fn is_selected(&self) -> bool {
        !self.selected_by_peers.is_empty()
    }

    pub fn notify_peer_selection_start(&mut self, peer: PeerId) {
        if !self.selected_by_peers.contains(&peer) {
            self.selected_by_peers.push(peer);
        }
    }

    pub fn notify_peer_selection_end(&mut self, peer: PeerId) {
        self.selected_by_peers.retain(|selected| *selected != peer);
    }

    /// Every sync group has to receive this body again
    pub fn mark_as_changed(&mut self) {
        self.static_updated_groups.clear();
    }

    /// True once per group after each change
    pub fn static_sync_group_needs_update(&mut self, group: SyncGroupId) -> bool {
        if self.static_updated_groups.contains(&group) {
            return false;
        }
        self.static_updated_groups.push(group);
        true
    }

    // ------------------------------------------------------------ Movers

    /// Run the character controller for one tick
    pub fn process_character(
        &mut self,
        ctx: &mut PhysicsContext<'_>,
        dt: f32,
        input: CharacterInput,
        gravity: f32,
    ) -> PhysicsResult<()> {
        let Some(id) = self.id else {
            return Ok(());
        };
        let key = self.key;
        let world = ctx.worlds.world_mut(self.world)?;
        let BodyBehavior::Character(controller) = &mut self.behavior else {
            return Err(PhysicsError::NotAllowed("process_character on a non-character body"));
        };
        controller.process(world, id, key, ctx.events, dt, input, gravity)
    }

    /// Authority-only NPC movement of a kinematic space object
    #[allow(clippy::too_many_arguments)]
    pub fn server_npc_move_velocity(
        &mut self,
        ctx: &mut PhysicsContext<'_>,
        dt: f32,
        direction: Vec2,
        acceleration: f32,
        deceleration: f32,
        max_speed: f32,
        step_height: f32,
        max_push_force: f32,
        supporting_height: f32,
        gravity: f32,
    ) -> PhysicsResult<()> {
        if self.mode != BodyMode::Kinematic {
            return Err(PhysicsError::NotAllowed("NPC movement needs a kinematic body"));
        }
        if ctx.role != NetworkRole::Authority {
            return Err(PhysicsError::NotAllowed("NPC movement runs on the authority only"));
        }
        let Some(id) = self.id else {
            return Err(PhysicsError::NoSimulatedBody(BodyId::INVALID));
        };
        let mass = self.settings.mass;
        let world = ctx.worlds.world_mut(self.world)?;
        let BodyBehavior::Npc(npc) = &mut self.behavior else {
            return Err(PhysicsError::NotAllowed("NPC movement on a non-NPC body"));
        };
        let params = NpcMoveParams {
            direction,
            acceleration,
            deceleration,
            max_speed,
            step_height,
            max_push_force,
            supporting_height,
            gravity,
        };
        npc.move_velocity(world, id, mass, dt, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body_id::BodyIdManager;
    use crate::config::WorldSettings;
    use crate::shape::{Shape, ShapeDesc};

    struct Fixture {
        worlds: WorldManager,
        layers: LayerTable,
        ids: BodyIdManager,
        events: EventQueue,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                worlds: WorldManager::new(&WorldSettings {
                    max_bodies: 1024,
                    worker_threads: Some(1),
                    ..WorldSettings::default()
                })
                .unwrap(),
                layers: LayerTable::new(),
                ids: BodyIdManager::default(),
                events: EventQueue::new(),
            }
        }

        fn ctx(&mut self) -> PhysicsContext<'_> {
            PhysicsContext {
                worlds: &mut self.worlds,
                layers: &self.layers,
                ids: &mut self.ids,
                events: &mut self.events,
                role: NetworkRole::Authority,
                now: 0,
            }
        }
    }

    fn crate_body(key: u32) -> Body {
        Body::new(BodyKey(key))
            .with_layer("DYNAMIC")
            .with_mode(BodyMode::Dynamic)
            .with_shape(Shape::new(ShapeDesc::cube(1.0)))
    }

    #[test]
    fn test_layer_and_mode_byte() {
        let combined = combine_layer_and_mode(5, BodyMode::Dynamic);
        assert_eq!(combined, (5 << 3) | 2);
        assert_eq!(split_layer_and_mode(combined), (5, Some(BodyMode::Dynamic)));
        assert_eq!(split_layer_and_mode(31 << 3 | 4), (31, Some(BodyMode::SensorOnlyActive)));
        assert_eq!(split_layer_and_mode(7).1, None);
    }

    #[test]
    fn test_mode_predicates() {
        assert!(BodyMode::SensorOnlyActive.is_static());
        assert!(BodyMode::SensorOnlyActive.is_sensor());
        assert!(BodyMode::Sensor.is_sensor());
        assert!(!BodyMode::Sensor.is_static());
        assert_eq!(BodyMode::Sensor.engine_type(), RigidBodyType::KinematicPositionBased);
        assert_eq!(BodyMode::SensorOnlyActive.engine_type(), RigidBodyType::Fixed);
        for value in 0..5 {
            assert_eq!(BodyMode::from_u8(value).unwrap().as_u8(), value);
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = BodySettings::default();
        assert_eq!(settings.engine_mass(), 100.0);
        assert!((settings.max_angular_velocity_rad() - 2700f32.to_radians()).abs() < 1e-3);
        let tiny = BodySettings {
            mass: 0.0,
            ..BodySettings::default()
        };
        assert!((tiny.engine_mass() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_lazy_creation_and_destruction() {
        let mut fx = Fixture::new();
        let mut body = Body::new(BodyKey(1)).with_layer("DYNAMIC");
        body.update_body(&mut fx.ctx()).unwrap();
        assert!(!body.has_body());

        body.set_shape(&mut fx.ctx(), Some(Shape::new(ShapeDesc::cube(1.0))))
            .unwrap();
        let id = body.id().unwrap();
        assert!(fx.worlds.main().contains(id));

        body.set_shape(&mut fx.ctx(), None).unwrap();
        assert!(!body.has_body());
        assert!(!fx.worlds.main().contains(id));

        let events = fx.events.drain();
        assert!(matches!(events[0], BodyEvent::BodyCreated { body: BodyKey(1), .. }));
        assert!(matches!(events[1], BodyEvent::BodyDestroyed { body: BodyKey(1), .. }));
    }

    #[test]
    fn test_desired_id_change_recreates() {
        let mut fx = Fixture::new();
        let mut body = crate_body(1).with_desired_id(600);
        body.update_body(&mut fx.ctx()).unwrap();
        assert_eq!(body.id().unwrap().index(), 600);

        body.set_desired_id(&mut fx.ctx(), Some(601)).unwrap();
        assert_eq!(body.id().unwrap().index(), 601);
        assert!(fx.worlds.main().id_at_index(600).is_none());
    }

    #[test]
    fn test_occupied_desired_id_leaves_no_body() {
        let mut fx = Fixture::new();
        let mut first = crate_body(1).with_desired_id(700);
        first.update_body(&mut fx.ctx()).unwrap();

        let mut second = crate_body(2).with_desired_id(700);
        assert!(matches!(
            second.update_body(&mut fx.ctx()),
            Err(PhysicsError::DesiredIdOccupied(700))
        ));
        assert!(!second.has_body());
    }

    #[test]
    fn test_non_convex_dynamic_falls_back_to_static() {
        let mut fx = Fixture::new();
        let faces = vec![Vec3::ZERO, Vec3::X, Vec3::Z];
        let mut body = Body::new(BodyKey(1))
            .with_layer("STATIC")
            .with_shape(Shape::new(ShapeDesc::mesh(faces)));
        body.update_body(&mut fx.ctx()).unwrap();

        body.set_mode(&mut fx.worlds, BodyMode::Dynamic).unwrap();
        assert_eq!(body.mode(), BodyMode::Static);
        assert_eq!(fx.worlds.main().mode_of(body.id().unwrap()), Some(BodyMode::Static));
    }

    #[test]
    fn test_sensor_mode_toggles_registration() {
        let mut fx = Fixture::new();
        let mut body = Body::new(BodyKey(1))
            .with_layer("TRIGGER")
            .with_mode(BodyMode::Kinematic)
            .with_shape(Shape::new(ShapeDesc::cube(2.0)));
        body.update_body(&mut fx.ctx()).unwrap();
        let id = body.id().unwrap();
        assert!(fx.worlds.main().sensors().is_empty());

        body.set_mode(&mut fx.worlds, BodyMode::Sensor).unwrap();
        assert_eq!(fx.worlds.main().sensors(), &[id]);
        body.set_mode(&mut fx.worlds, BodyMode::Kinematic).unwrap();
        assert!(fx.worlds.main().sensors().is_empty());
    }

    #[test]
    fn test_unknown_layer_is_rejected() {
        let mut fx = Fixture::new();
        let mut body = crate_body(1);
        body.update_body(&mut fx.ctx()).unwrap();
        assert!(matches!(
            body.set_layer(&mut fx.worlds, &fx.layers, "NOPE"),
            Err(PhysicsError::UnknownLayer(_))
        ));
        assert_eq!(body.layer(), "DYNAMIC");
    }

    #[test]
    fn test_state_blob_roundtrip() {
        let mut fx = Fixture::new();
        let mut body = crate_body(1)
            .with_desired_id(600)
            .with_transform(Transform::from_position(Vec3::new(1.0, 5.0, 0.0)));
        body.update_body(&mut fx.ctx()).unwrap();
        fx.worlds.main_mut().step(1.0 / 60.0);

        let blob = body.get_state(&fx.worlds, &fx.layers);
        let layer = fx.layers.layer_for_name("DYNAMIC");
        assert_eq!(blob[0], combine_layer_and_mode(layer, BodyMode::Dynamic));

        // A second session receiving the blob creates the body on demand.
        let mut remote = Fixture::new();
        let mut mirror = Body::new(BodyKey(1))
            .with_shape(Shape::new(ShapeDesc::cube(1.0)))
            .with_desired_id(600);
        assert!(mirror.set_state(&mut remote.ctx(), &blob).unwrap());
        assert_eq!(mirror.mode(), BodyMode::Dynamic);
        assert_eq!(mirror.layer(), "DYNAMIC");
        assert_eq!(mirror.transform().position, fx.worlds.main().transform(body.id().unwrap()).unwrap().position);
        assert_eq!(mirror.get_state(&remote.worlds, &remote.layers), blob);
    }

    #[test]
    fn test_state_without_body_echoes_last_blob() {
        let mut fx = Fixture::new();
        let mut body = Body::new(BodyKey(1));
        assert!(body.get_state(&fx.worlds, &fx.layers).is_empty());

        body.set_ignore_state_sync(true);
        let blob = vec![combine_layer_and_mode(5, BodyMode::Dynamic), 1, 2, 3];
        assert!(!body.set_state(&mut fx.ctx(), &blob).unwrap());
        assert_eq!(body.get_state(&fx.worlds, &fx.layers), blob);
    }

    #[test]
    fn test_net_sync_updating_transitions() {
        let mut events = EventQueue::new();
        let mut body = crate_body(1);

        body.update_net_sync(NetworkRole::Peer, 0, false, &mut events);
        assert!(!body.is_net_sync_updating());
        assert!(events.is_empty());

        body.notify_received_net_sync_update(1_000);
        body.update_net_sync(NetworkRole::Peer, 2_000, false, &mut events);
        assert!(body.is_net_sync_updating());

        // Still simulated locally, so it keeps updating past the timeout.
        body.update_net_sync(NetworkRole::Peer, 20_000, true, &mut events);
        assert!(body.is_net_sync_updating());

        body.update_net_sync(NetworkRole::Peer, 20_000, false, &mut events);
        assert!(!body.is_net_sync_updating());

        body.update_net_sync(NetworkRole::Authority, 20_000, false, &mut events);
        assert!(body.is_net_sync_updating());

        let events = events.drain();
        assert_eq!(
            events,
            vec![
                BodyEvent::StartUpdating { body: BodyKey(1) },
                BodyEvent::StopUpdating { body: BodyKey(1) },
                BodyEvent::StartUpdating { body: BodyKey(1) },
            ]
        );

        let mut static_body = Body::new(BodyKey(2));
        let mut events = EventQueue::new();
        static_body.update_net_sync(NetworkRole::Peer, 50_000, false, &mut events);
        assert!(static_body.is_net_sync_updating());
    }

    #[test]
    fn test_interactions() {
        let mut events = EventQueue::new();
        let mut door = Body::new(BodyKey(9));
        assert_eq!(door.register_interaction("open"), 0);
        assert_eq!(door.register_interaction("close"), 1);
        assert_eq!(door.register_interaction("open"), 0);
        assert_eq!(door.interaction_id("close"), Some(1));
        assert_eq!(door.interaction_id("lock"), None);

        door.call_interaction(1, b"now", &mut events).unwrap();
        assert!(matches!(
            door.call_interaction(2, &[], &mut events),
            Err(PhysicsError::InteractionNotRegistered(2))
        ));
        assert_eq!(
            events.drain(),
            vec![BodyEvent::InteractionCalled {
                body: BodyKey(9),
                interaction: "close".to_string(),
                argument: b"now".to_vec(),
            }]
        );

        let mut player = Body::character(BodyKey(1), CharacterSettings::default());
        player.queue_interaction(&door, "open", vec![1]).unwrap();
        assert!(player.queue_interaction(&door, "lock", vec![]).is_err());
        let pending = player.character_controller().unwrap().pending_interactions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, BodyKey(9));
    }

    #[test]
    fn test_static_change_tracking() {
        let mut fx = Fixture::new();
        let mut body = Body::new(BodyKey(1))
            .with_layer("STATIC")
            .with_shape(Shape::new(ShapeDesc::cube(1.0)));
        body.update_body(&mut fx.ctx()).unwrap();

        assert!(body.static_sync_group_needs_update(0));
        assert!(!body.static_sync_group_needs_update(0));
        assert!(body.static_sync_group_needs_update(1));

        body.set_transform(&mut fx.worlds, Transform::from_position(Vec3::X))
            .unwrap();
        assert!(body.static_sync_group_needs_update(0));
    }

    #[test]
    fn test_peer_selection() {
        let mut body = Body::new(BodyKey(1));
        body.notify_peer_selection_start(3);
        body.notify_peer_selection_start(3);
        body.notify_peer_selection_start(4);
        assert_eq!(body.selected_by_peers(), &[3, 4]);
        body.notify_peer_selection_end(3);
        assert_eq!(body.selected_by_peers(), &[4]);
        assert!(body.is_selected());
    }

    #[test]
    fn test_move_and_collide_stops_at_wall() {
        let mut fx = Fixture::new();
        let mut wall = Body::new(BodyKey(1))
            .with_layer("STATIC")
            .with_shape(Shape::new(ShapeDesc::Box {
                size: Vec3::new(1.0, 4.0, 4.0),
            }))
            .with_transform(Transform::from_position(Vec3::new(5.0, 0.0, 0.0)));
        wall.update_body(&mut fx.ctx()).unwrap();

        let mut mover = Body::new(BodyKey(2))
            .with_layer("KINEMATIC")
            .with_mode(BodyMode::Kinematic)
            .with_shape(Shape::new(ShapeDesc::cube(1.0)));
        mover.update_body(&mut fx.ctx()).unwrap();
        fx.worlds.main_mut().optimize_broadphase();

        let hit = mover
            .move_and_collide(&mut fx.worlds, Vec3::X * 10.0, &ObjectLayerFilter::all())
            .unwrap()
            .unwrap();
        assert_eq!(hit.owner, BodyKey(1));
        // Faces meet at x = 4.5.
        assert!((mover.transform().position.x - 4.0).abs() < 0.05);

        let free = mover
            .move_and_collide(&mut fx.worlds, Vec3::NEG_X * 2.0, &ObjectLayerFilter::all())
            .unwrap();
        assert!(free.is_none());
    }

    #[test]
    fn test_character_forces_accumulate() {
        let mut fx = Fixture::new();
        let mut player = Body::character(BodyKey(1), CharacterSettings::default())
            .with_shape(Shape::new(ShapeDesc::capsule()));
        player.update_body(&mut fx.ctx()).unwrap();
        assert!(player.world() == MAIN_WORLD && player.is_kinematic());

        player.add_force(&mut fx.worlds, Vec3::X).unwrap();
        player.add_impulse(&mut fx.worlds, Vec3::Y).unwrap();
        assert!(player.character_state(NetworkRole::Peer).is_empty());
    }

    #[test]
    fn test_npc_requires_authority_and_kinematic() {
        let mut fx = Fixture::new();
        let mut npc = Body::npc(BodyKey(1))
            .with_layer("KINEMATIC")
            .with_shape(Shape::new(ShapeDesc::capsule()))
            .with_transform(Transform::from_position(Vec3::Y * 5.0));
        npc.update_body(&mut fx.ctx()).unwrap();
        assert!(npc.is_npc());

        let mut ctx = fx.ctx();
        ctx.role = NetworkRole::Peer;
        assert!(
            npc.server_npc_move_velocity(&mut ctx, 0.016, Vec2::X, 10.0, 10.0, 2.0, 0.2, 0.0, 0.1, 9.81)
                .is_err()
        );

        let mut ctx = fx.ctx();
        npc.server_npc_move_velocity(&mut ctx, 0.016, Vec2::X, 10.0, 10.0, 2.0, 0.2, 0.0, 0.1, 9.81)
            .unwrap();

        npc.set_mode(&mut fx.worlds, BodyMode::Dynamic).unwrap();
        assert!(!npc.is_npc());
        assert!(
            npc.server_npc_move_velocity(&mut fx.ctx(), 0.016, Vec2::X, 10.0, 10.0, 2.0, 0.2, 0.0, 0.1, 9.81)
                .is_err()
        );
    }
}
