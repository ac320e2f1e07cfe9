//! Characters
//!
//! Kinematic capsule movers solved with sweep-and-slide instead of rigid
//! body dynamics. A [`CharacterVirtual`] carries the mover state, the
//! [`CharacterController`] turns player input into velocities and the
//! [`NpcMover`] does the same for authority-driven kinematic bodies.
//!
//! Also hosts the pending interaction buffers characters send to invoke
//! interactions on other bodies.

use glam::{Quat, Vec2, Vec3};
use lattice_core::math::{is_equal_approx_eps, move_toward};
use rapier3d::control::{CharacterAutostep, CharacterLength, KinematicCharacterController};
use rapier3d::prelude::{QueryFilter, Real, Vector};
use serde::{Deserialize, Serialize};

use crate::body_id::{BodyId, BodyKey};
use crate::convert::{from_vector, to_isometry, to_vector};
use crate::error::{PhysicsError, PhysicsResult};
use crate::events::{BodyEvent, EventQueue};
use crate::layers::ObjectLayerFilter;
use crate::query::nearest_hit;
use crate::recorder::StateRecorder;
use crate::world::PhysicsWorld;

/// Character tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterSettings {
    pub height: f32,
    pub radius: f32,
    /// Contacts this far below the shape bottom still support the character
    pub supporting_offset: f32,
    pub max_walking_slope_deg: f32,
    pub walk_speed: f32,
    pub run_speed: f32,
    pub jump_height: f32,
    pub ground_acceleration: f32,
    pub ground_deceleration: f32,
    pub air_acceleration: f32,
    pub air_deceleration: f32,
    pub step_height: f32,
    pub max_push_strength_newton: f32,
    pub predictive_contact_margin: f32,
    pub shape_margin: f32,
    pub frozen: bool,
    pub movement_scale: f32,
    pub mass: f32,
}

impl Default for CharacterSettings {
    fn default() -> Self {
        Self {
            height: 1.75,
            radius: 0.3,
            supporting_offset: 0.1,
            max_walking_slope_deg: 50.0,
            walk_speed: 5.0,
            run_speed: 9.0,
            jump_height: 2.0,
            ground_acceleration: 40.0,
            ground_deceleration: 25.0,
            air_acceleration: 15.0,
            air_deceleration: 5.0,
            step_height: 0.2,
            max_push_strength_newton: 50_000.0,
            predictive_contact_margin: 0.3,
            shape_margin: 0.02,
            frozen: false,
            movement_scale: 1.0,
            mass: 70.0,
        }
    }
}

/// Support state of a character
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroundState {
    OnGround,
    /// Touching ground steeper than the max slope
    OnSteepGround,
    /// Touching something that doesn't support the character
    NotSupported,
    #[default]
    InAir,
}

/// Serializable mover state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CharacterVirtualState {
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub ground_state: GroundState,
    pub ground_normal: Vec3,
    pub ground_velocity: Vec3,
}

impl Default for CharacterVirtualState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            ground_state: GroundState::InAir,
            ground_normal: Vec3::ZERO,
            ground_velocity: Vec3::ZERO,
        }
    }
}

/// Mover configuration fixed at creation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacterVirtualConfig {
    pub max_slope_rad: f32,
    pub mass: f32,
    pub max_strength: f32,
    pub supporting_offset: f32,
    pub predictive_contact_margin: f32,
    pub shape_margin: f32,
}

impl From<&CharacterSettings> for CharacterVirtualConfig {
    fn from(settings: &CharacterSettings) -> Self {
        Self {
            max_slope_rad: settings.max_walking_slope_deg.to_radians(),
            mass: settings.mass,
            max_strength: settings.max_push_strength_newton,
            supporting_offset: settings.supporting_offset,
            predictive_contact_margin: settings.predictive_contact_margin,
            shape_margin: settings.shape_margin,
        }
    }
}

/// Sweep-and-slide mover using a body's collision shape
#[derive(Debug, Clone)]
pub struct CharacterVirtual {
    state: CharacterVirtualState,
    config: CharacterVirtualConfig,
}

impl CharacterVirtual {
    pub fn new(position: Vec3, rotation: Quat, config: CharacterVirtualConfig) -> Self {
        Self {
            state: CharacterVirtualState {
                position,
                rotation,
                ..CharacterVirtualState::default()
            },
            config,
        }
    }

    pub fn config(&self) -> &CharacterVirtualConfig {
        &self.config
    }

    pub fn state(&self) -> &CharacterVirtualState {
        &self.state
    }

    pub fn position(&self) -> Vec3 {
        self.state.position
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.state.position = position;
    }

    pub fn rotation(&self) -> Quat {
        self.state.rotation
    }

    pub fn set_rotation(&mut self, rotation: Quat) {
        self.state.rotation = rotation;
    }

    pub fn linear_velocity(&self) -> Vec3 {
        self.state.linear_velocity
    }

    pub fn set_linear_velocity(&mut self, velocity: Vec3) {
        self.state.linear_velocity = velocity;
    }

    pub fn ground_state(&self) -> GroundState {
        self.state.ground_state
    }

    pub fn ground_velocity(&self) -> Vec3 {
        self.state.ground_velocity
    }

    pub fn is_supported(&self) -> bool {
        matches!(
            self.state.ground_state,
            GroundState::OnGround | GroundState::OnSteepGround
        )
    }

    pub fn set_max_strength(&mut self, strength: f32) {
        self.config.max_strength = strength;
    }

    pub fn save_state(&self, recorder: &mut StateRecorder) {
        recorder.write(&self.state);
    }

    /// Read the mover state; only applied outside validating mode
    pub fn restore_state(&mut self, recorder: &mut StateRecorder) -> bool {
        let mut state = self.state;
        if !recorder.read(&mut state) {
            return false;
        }
        if !recorder.is_validating() {
            self.state = state;
        }
        true
    }

    fn collision_layers(world: &PhysicsWorld, body: BodyId) -> ObjectLayerFilter {
        let mask = world
            .engine_collider(body)
            .map(|collider| collider.collision_groups().filter.bits())
            .unwrap_or(0);
        ObjectLayerFilter::from_layers((0..32u8).filter(|layer| mask & (1 << layer) != 0))
    }

    /// Probe below the shape and refresh ground state, normal and velocity
    pub fn pre_step(&mut self, world: &PhysicsWorld, body: BodyId) {
        let Some(collider) = world.engine_collider(body) else {
            self.state.ground_state = GroundState::InAir;
            return;
        };
        let layers = Self::collision_layers(world, body);
        let probe = self.config.supporting_offset + self.config.predictive_contact_margin;
        let position = to_isometry(self.state.position, self.state.rotation);

        let hits: Vec<_> = world
            .cast_shape(collider.shape(), &position, Vec3::NEG_Y * probe, &layers, &[body])
            .into_iter()
            .filter(|hit| world.mode_of(hit.body).is_some_and(|mode| !mode.is_sensor()))
            .collect();

        let Some(ground) = nearest_hit(&hits) else {
            self.state.ground_state = GroundState::InAir;
            self.state.ground_normal = Vec3::ZERO;
            self.state.ground_velocity = Vec3::ZERO;
            return;
        };

        let normal = ground.normal.normalize_or_zero();
        self.state.ground_normal = normal;
        self.state.ground_state = if normal == Vec3::ZERO {
            GroundState::NotSupported
        } else if normal.angle_between(Vec3::Y) <= self.config.max_slope_rad {
            GroundState::OnGround
        } else {
            GroundState::OnSteepGround
        };

        let center = world
            .transform(ground.body)
            .map(|t| t.position)
            .unwrap_or(ground.contact_on_body);
        let linear = world.linear_velocity(ground.body).unwrap_or(Vec3::ZERO);
        let angular = world.angular_velocity(ground.body).unwrap_or(Vec3::ZERO);
        self.state.ground_velocity = linear + angular.cross(ground.contact_on_body - center);
    }

    fn controller(&self, step_height: f32) -> KinematicCharacterController {
        let autostep = (step_height > 0.0).then_some(CharacterAutostep {
            max_height: CharacterLength::Absolute(step_height),
            min_width: CharacterLength::Relative(0.5),
            include_dynamic_bodies: false,
        });
        KinematicCharacterController {
            up: Vector::y_axis(),
            offset: CharacterLength::Absolute(self.config.shape_margin.max(0.001)),
            slide: true,
            autostep,
            max_slope_climb_angle: self.config.max_slope_rad,
            min_slope_slide_angle: self.config.max_slope_rad,
            snap_to_ground: (step_height > 0.0).then_some(CharacterLength::Absolute(step_height)),
            ..KinematicCharacterController::default()
        }
    }

    /// Sweep the shape along `velocity * dt`, sliding along obstacles and
    /// pushing dynamic bodies up to the configured strength.
    pub fn step(
        &mut self,
        world: &mut PhysicsWorld,
        body: BodyId,
        dt: f32,
        velocity: Vec3,
        step_height: f32,
    ) -> PhysicsResult<()> {
        let _span = tracing::trace_span!("character_step", body = body.raw()).entered();

        let Some(entry) = world.entry(body) else {
            return Err(PhysicsError::NoSimulatedBody(body));
        };
        let (body_handle, collider_handle) = (entry.body, entry.collider);
        let controller = self.controller(step_height);
        let position = to_isometry(self.state.position, self.state.rotation);

        let Some(collider) = world.colliders.get(collider_handle) else {
            return Err(PhysicsError::NoSimulatedBody(body));
        };
        let filter = QueryFilter::default()
            .exclude_rigid_body(body_handle)
            .exclude_sensors()
            .groups(collider.collision_groups());

        let mut collisions = Vec::new();
        let movement = controller.move_shape(
            dt as Real,
            &world.bodies,
            &world.colliders,
            &world.query_pipeline,
            collider.shape(),
            &position,
            to_vector(velocity * dt),
            filter,
            |collision| collisions.push(collision),
        );

        if self.config.max_strength > 0.0 && !collisions.is_empty() {
            controller.solve_character_collision_impulses(
                dt as Real,
                &mut world.bodies,
                &world.colliders,
                &world.query_pipeline,
                collider.shape(),
                self.config.mass,
                &collisions,
                filter,
            );
        }

        let translation = from_vector(&movement.translation);
        self.state.position += translation;
        self.state.linear_velocity = if dt > 0.0 { translation / dt } else { Vec3::ZERO };
        if movement.grounded && !self.is_supported() {
            self.state.ground_state = GroundState::OnGround;
        }
        Ok(())
    }
}

/// Player input of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CharacterInput {
    /// Horizontal direction on the XZ plane
    pub move_direction: Vec2,
    pub run: bool,
    pub jump: bool,
}

/// Input-driven character controller
#[derive(Debug, Clone, Default)]
pub struct CharacterController {
    pub settings: CharacterSettings,
    virtual_character: Option<CharacterVirtual>,
    previous_move_velocity: Vec3,
    accumulated_force: Vec3,
    accumulated_impulse: Vec3,
    cached_is_running: bool,
    last_state: Vec<u8>,
    pending_interactions: Vec<PendingInteraction>,
}

impl CharacterController {
    pub fn new(settings: CharacterSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Drop the mover; it is rebuilt from the body on the next use
    pub fn reset_virtual(&mut self) {
        self.virtual_character = None;
    }

    pub fn virtual_character(&self) -> Option<&CharacterVirtual> {
        self.virtual_character.as_ref()
    }

    pub fn virtual_character_mut(&mut self) -> Option<&mut CharacterVirtual> {
        self.virtual_character.as_mut()
    }

    /// Build the mover at the body pose if missing
    pub fn ensure_virtual(&mut self, world: &PhysicsWorld, body: BodyId) -> bool {
        if self.virtual_character.is_some() {
            return true;
        }
        let Some(transform) = world.transform(body) else {
            return false;
        };
        self.virtual_character = Some(CharacterVirtual::new(
            transform.position,
            transform.rotation,
            CharacterVirtualConfig::from(&self.settings),
        ));
        true
    }

    pub fn is_on_floor(&self) -> bool {
        self.virtual_character
            .as_ref()
            .is_some_and(CharacterVirtual::is_supported)
    }

    pub fn is_on_ceiling(&self) -> bool {
        false
    }

    pub fn ground_velocity(&self) -> Vec3 {
        self.virtual_character
            .as_ref()
            .map(CharacterVirtual::ground_velocity)
            .unwrap_or(Vec3::ZERO)
    }

    /// Velocity relative to the supporting ground
    pub fn relative_velocity(&self) -> Vec3 {
        self.virtual_character
            .as_ref()
            .map(|v| v.linear_velocity() - v.ground_velocity())
            .unwrap_or(Vec3::ZERO)
    }

    pub fn cached_max_walk_speed(&self) -> f32 {
        if self.cached_is_running {
            self.settings.run_speed
        } else {
            self.settings.walk_speed
        }
    }

    pub fn previous_move_velocity(&self) -> Vec3 {
        self.previous_move_velocity
    }

    pub fn add_force(&mut self, force: Vec3) {
        self.accumulated_force += force;
    }

    /// Impulses are applied on the next `process`, wherever they hit
    pub fn add_impulse(&mut self, impulse: Vec3) {
        self.accumulated_impulse += impulse;
    }

    /// Advance the character by one tick and drive its kinematic body
    pub fn process(
        &mut self,
        world: &mut PhysicsWorld,
        body: BodyId,
        owner: BodyKey,
        events: &mut EventQueue,
        dt: f32,
        input: CharacterInput,
        gravity: f32,
    ) -> PhysicsResult<()> {
        if self.settings.frozen {
            if let Some(mover) = &self.virtual_character {
                world.move_kinematic(body, mover.position(), mover.rotation())?;
            }
            return Ok(());
        }

        if !self.ensure_virtual(world, body) {
            return Ok(());
        }
        let settings = &self.settings;
        let Some(mover) = self.virtual_character.as_mut() else {
            return Ok(());
        };

        mover.pre_step(world, body);

        let on_ground = mover.is_supported();
        self.cached_is_running = input.run;
        let scale = settings.movement_scale;
        let speed = if input.run { settings.run_speed } else { settings.walk_speed } * scale;
        let (acceleration, deceleration) = if on_ground {
            (settings.ground_acceleration, settings.ground_deceleration)
        } else {
            (settings.air_acceleration, settings.air_deceleration)
        };

        let mut velocity = Vec3::ZERO;
        if on_ground {
            velocity += mover.ground_velocity();
        }

        let inverse_mass = 1.0 / settings.mass.max(0.001);
        velocity += dt * self.accumulated_force * inverse_mass;
        velocity += self.accumulated_impulse * inverse_mass;
        self.accumulated_force = Vec3::ZERO;
        self.accumulated_impulse = Vec3::ZERO;

        let direction = Vec3::new(input.move_direction.x, 0.0, input.move_direction.y)
            .normalize_or_zero();
        let rate = if input.move_direction.length_squared() < 1e-8 {
            deceleration
        } else {
            acceleration
        };
        let move_velocity = move_toward(
            self.previous_move_velocity,
            direction * speed,
            rate * scale * dt,
        );
        self.previous_move_velocity = move_velocity;
        velocity += move_velocity;

        if !on_ground {
            velocity.y += mover.linear_velocity().y;
            velocity.y -= gravity * dt * 1.5;
        } else if input.jump {
            velocity.y = (2.0 * settings.jump_height * gravity * scale).sqrt();
            events.push(BodyEvent::Jump {
                body: owner,
                velocity,
            });
        }

        let step_height = settings.step_height;
        mover.step(world, body, dt, velocity, step_height)?;
        world.move_kinematic(body, mover.position(), mover.rotation())
    }

    /// Sync blob: `[previous move velocity][mover state]`, or the last
    /// received blob while no mover exists
    pub fn get_state(&self) -> Vec<u8> {
        let Some(mover) = &self.virtual_character else {
            return self.last_state.clone();
        };
        let mut recorder = StateRecorder::new();
        recorder.write(&self.previous_move_velocity);
        mover.save_state(&mut recorder);
        recorder.into_data()
    }

    /// Apply a sync blob; the mover is rebuilt from the body if needed
    pub fn set_state(&mut self, data: &[u8], world: &PhysicsWorld, body: BodyId) -> bool {
        self.remember_state(data);
        if data.is_empty() {
            return false;
        }

        let mut recorder = StateRecorder::from_data(data.to_vec());
        if !recorder.read(&mut self.previous_move_velocity) {
            return false;
        }
        if !self.ensure_virtual(world, body) {
            return false;
        }
        self.virtual_character
            .as_mut()
            .is_some_and(|mover| mover.restore_state(&mut recorder))
    }

    /// Keep a received blob without applying it
    pub fn remember_state(&mut self, data: &[u8]) {
        self.last_state = data.to_vec();
    }

    /// Whether a state blob was ever received
    pub fn has_received_state(&self) -> bool {
        !self.last_state.is_empty()
    }

    pub fn queue_interaction(&mut self, interaction: PendingInteraction) {
        self.pending_interactions.push(interaction);
    }

    pub fn pending_interactions(&self) -> &[PendingInteraction] {
        &self.pending_interactions
    }

    /// Serialize and clear the queued interactions
    pub fn write_pending_interactions_to_buffer(&mut self, out: &mut StateRecorder) {
        write_interactions(&self.pending_interactions, out);
        self.pending_interactions.clear();
    }
}

/// Per-call NPC movement parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NpcMoveParams {
    pub direction: Vec2,
    pub acceleration: f32,
    pub deceleration: f32,
    pub max_speed: f32,
    pub step_height: f32,
    pub max_push_force: f32,
    pub supporting_height: f32,
    pub gravity: f32,
}

/// Slope limit for NPC movers
pub const NPC_MAX_SLOPE_DEG: f32 = 80.0;

/// Authority-side mover for NPC kinematic bodies
#[derive(Debug, Clone, Default)]
pub struct NpcMover {
    virtual_character: Option<CharacterVirtual>,
    supporting_height: f32,
    previous_move_velocity: Vec3,
}

impl NpcMover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_virtual(&mut self) {
        self.virtual_character = None;
    }

    pub fn virtual_character(&self) -> Option<&CharacterVirtual> {
        self.virtual_character.as_ref()
    }

    /// Ease toward `direction * max_speed`, apply gravity when airborne and
    /// sweep. No ground velocity is inherited.
    pub fn move_velocity(
        &mut self,
        world: &mut PhysicsWorld,
        body: BodyId,
        mass: f32,
        dt: f32,
        params: &NpcMoveParams,
    ) -> PhysicsResult<()> {
        let Some(transform) = world.transform(body) else {
            return Err(PhysicsError::NoSimulatedBody(body));
        };

        let stale = !is_equal_approx_eps(self.supporting_height, params.supporting_height, 0.01);
        if self.virtual_character.is_none() || stale {
            self.supporting_height = params.supporting_height;
            self.virtual_character = Some(CharacterVirtual::new(
                transform.position,
                transform.rotation,
                CharacterVirtualConfig {
                    max_slope_rad: NPC_MAX_SLOPE_DEG.to_radians(),
                    mass,
                    max_strength: params.max_push_force,
                    supporting_offset: params.supporting_height,
                    predictive_contact_margin: 0.3,
                    shape_margin: 0.02,
                },
            ));
            log::debug!("Body {:?} spawned a new NPC mover", body);
        }
        let Some(mover) = self.virtual_character.as_mut() else {
            return Ok(());
        };

        mover.set_max_strength(params.max_push_force);
        mover.set_position(transform.position);
        mover.set_rotation(transform.rotation);
        mover.set_linear_velocity(world.linear_velocity(body).unwrap_or(Vec3::ZERO));
        mover.pre_step(world, body);

        let on_ground = mover.is_supported();
        let direction = Vec3::new(params.direction.x, 0.0, params.direction.y).normalize_or_zero();
        let rate = if params.direction.length_squared() < 1e-8 {
            params.deceleration
        } else {
            params.acceleration
        };
        let move_velocity = move_toward(
            self.previous_move_velocity,
            direction * params.max_speed,
            rate * dt,
        );
        self.previous_move_velocity = move_velocity;

        let mut velocity = move_velocity;
        if !on_ground {
            velocity.y += mover.linear_velocity().y;
            velocity.y -= params.gravity * dt * 1.5;
        }

        mover.step(world, body, dt, velocity, params.step_height)?;
        world.move_kinematic(body, mover.position(), mover.rotation())
    }
}

/// Interaction a character wants to invoke on another body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInteraction {
    pub target: BodyKey,
    pub interaction_id: u8,
    pub argument: Vec<u8>,
}

/// `[true][target: u32][interaction: u8][len: u32][argument]...[false]`
pub fn write_interactions(interactions: &[PendingInteraction], out: &mut StateRecorder) {
    for interaction in interactions {
        out.write(&true);
        out.write(&interaction.target.0);
        out.write(&interaction.interaction_id);
        out.write(&(interaction.argument.len() as u32));
        out.write_bytes(&interaction.argument);
    }
    out.write(&false);
}

fn read_interaction(buffer: &mut StateRecorder) -> Option<Option<PendingInteraction>> {
    let has_next: bool = buffer.read_value()?;
    if !has_next {
        return Some(None);
    }
    let target: u32 = buffer.read_value()?;
    let interaction_id: u8 = buffer.read_value()?;
    let len: u32 = buffer.read_value()?;
    if len as usize > buffer.len() - buffer.read_cursor() {
        log::error!("Interaction argument of {} bytes overruns the buffer", len);
        return None;
    }
    let mut argument = vec![0u8; len as usize];
    if !buffer.read_bytes(&mut argument) {
        return None;
    }
    Some(Some(PendingInteraction {
        target: BodyKey(target),
        interaction_id,
        argument,
    }))
}

/// Decode a whole interaction buffer from its start
pub fn read_interactions(buffer: &mut StateRecorder) -> Option<Vec<PendingInteraction>> {
    buffer.begin_read();
    let mut interactions = Vec::new();
    while let Some(interaction) = read_interaction(buffer)? {
        interactions.push(interaction);
    }
    Some(interactions)
}

/// Invoke every interaction of a buffer through `call`, stopping at the
/// first failure. Returns the number executed.
pub fn execute_interactions(
    buffer: &mut StateRecorder,
    mut call: impl FnMut(PendingInteraction) -> PhysicsResult<()>,
) -> PhysicsResult<usize> {
    buffer.begin_read();
    let mut executed = 0;
    loop {
        let Some(next) = read_interaction(buffer) else {
            return Err(PhysicsError::StateRestore(
                "truncated interaction buffer".to_string(),
            ));
        };
        let Some(interaction) = next else {
            return Ok(executed);
        };
        call(interaction)?;
        executed += 1;
    }
}

/// True when the buffers carry different interactions; unreadable
/// buffers count as different
pub fn are_interactions_different(a: &mut StateRecorder, b: &mut StateRecorder) -> bool {
    match (read_interactions(a), read_interactions(b)) {
        (Some(a), Some(b)) => a != b,
        _ => true,
    }
}

/// Encoded size of the interaction list at the start of the buffer
pub fn count_interactions_buffer_size(buffer: &mut StateRecorder) -> usize {
    buffer.begin_read();
    while let Some(Some(_)) = read_interaction(buffer) {}
    if buffer.is_failed() {
        return 0;
    }
    buffer.read_cursor()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyMode;
    use crate::body_id::BodyIdManager;
    use crate::config::WorldSettings;
    use crate::layers::LayerTable;
    use crate::shape::{Shape, ShapeDesc};
    use crate::world::BodyCreateInfo;
    use lattice_core::Transform;

    const DT: f32 = 1.0 / 60.0;
    const GRAVITY: f32 = 9.81;

    fn interaction(target: u32, id: u8, argument: &[u8]) -> PendingInteraction {
        PendingInteraction {
            target: BodyKey(target),
            interaction_id: id,
            argument: argument.to_vec(),
        }
    }

    // Flat ground with its top at y = 0 and a capsule character above it.
    fn character_scene(height: f32) -> (PhysicsWorld, BodyId) {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = PhysicsWorld::new(
            0,
            &WorldSettings {
                worker_threads: Some(1),
                ..WorldSettings::default()
            },
        )
        .unwrap();

        let ground = BodyCreateInfo::new(
            BodyKey(1),
            Shape::new(ShapeDesc::Box {
                size: Vec3::new(100.0, 1.0, 100.0),
            }),
            Transform::from_position(Vec3::Y * -0.5),
        )
        .with_layer("STATIC")
        .with_mode(BodyMode::Static);
        world.create_body(&layers, &mut ids, &ground).unwrap();

        let character = BodyCreateInfo::new(
            BodyKey(2),
            Shape::new(ShapeDesc::capsule()),
            Transform::from_position(Vec3::Y * height),
        )
        .with_layer("CHARACTER")
        .with_mode(BodyMode::Kinematic);
        let character = world.create_body(&layers, &mut ids, &character).unwrap();
        world.optimize_broadphase();
        (world, character)
    }

    fn tick(
        controller: &mut CharacterController,
        world: &mut PhysicsWorld,
        body: BodyId,
        events: &mut EventQueue,
        input: CharacterInput,
    ) {
        controller
            .process(world, body, BodyKey(2), events, DT, input, GRAVITY)
            .unwrap();
        world.step(DT);
    }

    #[test]
    fn test_character_falls_and_lands() {
        let (mut world, body) = character_scene(3.0);
        let mut controller = CharacterController::new(CharacterSettings::default());
        let mut events = EventQueue::new();

        for _ in 0..180 {
            tick(&mut controller, &mut world, body, &mut events, CharacterInput::default());
        }

        assert!(controller.is_on_floor());
        let y = controller.virtual_character().unwrap().position().y;
        // The capsule is 2 units tall.
        assert!(y > 0.9 && y < 1.3, "resting height {y}");
        assert!((world.transform(body).unwrap().position.y - y).abs() < 0.05);
    }

    #[test]
    fn test_character_walks_and_jumps() {
        let (mut world, body) = character_scene(1.05);
        let mut controller = CharacterController::new(CharacterSettings::default());
        let mut events = EventQueue::new();

        for _ in 0..30 {
            tick(&mut controller, &mut world, body, &mut events, CharacterInput::default());
        }
        assert!(controller.is_on_floor());

        let walk = CharacterInput {
            move_direction: Vec2::X,
            ..CharacterInput::default()
        };
        for _ in 0..30 {
            tick(&mut controller, &mut world, body, &mut events, walk);
        }
        assert!(controller.virtual_character().unwrap().position().x > 1.0);
        assert!((controller.previous_move_velocity().x - 5.0).abs() < 1e-3);

        let jump = CharacterInput {
            jump: true,
            ..CharacterInput::default()
        };
        tick(&mut controller, &mut world, body, &mut events, jump);
        let jumps: Vec<_> = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, BodyEvent::Jump { .. }))
            .collect();
        assert_eq!(jumps.len(), 1);
    }

    #[test]
    fn test_frozen_character_keeps_pose() {
        let (mut world, body) = character_scene(3.0);
        let mut controller = CharacterController::new(CharacterSettings::default());
        let mut events = EventQueue::new();
        tick(&mut controller, &mut world, body, &mut events, CharacterInput::default());
        let before = controller.virtual_character().unwrap().position();

        controller.settings.frozen = true;
        for _ in 0..10 {
            tick(&mut controller, &mut world, body, &mut events, CharacterInput::default());
        }
        assert_eq!(controller.virtual_character().unwrap().position(), before);
    }

    #[test]
    fn test_state_blob_roundtrip() {
        let (mut world, body) = character_scene(3.0);
        let mut controller = CharacterController::new(CharacterSettings::default());
        assert!(controller.get_state().is_empty());

        let mut events = EventQueue::new();
        for _ in 0..5 {
            tick(&mut controller, &mut world, body, &mut events, CharacterInput::default());
        }
        let blob = controller.get_state();
        let saved = *controller.virtual_character().unwrap().state();

        let mut other = CharacterController::new(CharacterSettings::default());
        assert!(other.set_state(&blob, &world, body));
        assert_eq!(*other.virtual_character().unwrap().state(), saved);
        assert_eq!(other.get_state(), blob);
    }

    #[test]
    fn test_impulses_feed_the_next_tick() {
        let (mut world, body) = character_scene(1.05);
        let mut controller = CharacterController::new(CharacterSettings::default());
        let mut events = EventQueue::new();
        for _ in 0..30 {
            tick(&mut controller, &mut world, body, &mut events, CharacterInput::default());
        }
        let before = controller.virtual_character().unwrap().position();

        controller.add_impulse(Vec3::Z * 70.0 * 6.0);
        tick(&mut controller, &mut world, body, &mut events, CharacterInput::default());
        let after = controller.virtual_character().unwrap().position();
        assert!(after.z - before.z > 0.05);
    }

    #[test]
    fn test_npc_moves_on_ground() {
        let (mut world, body) = character_scene(1.05);
        let mut npc = NpcMover::new();
        let params = NpcMoveParams {
            direction: Vec2::Y,
            acceleration: 20.0,
            deceleration: 20.0,
            max_speed: 3.0,
            step_height: 0.2,
            max_push_force: 0.0,
            supporting_height: 0.1,
            gravity: GRAVITY,
        };
        for _ in 0..60 {
            npc.move_velocity(&mut world, body, 70.0, DT, &params).unwrap();
            world.step(DT);
        }
        let position = world.transform(body).unwrap().position;
        assert!(position.z > 1.0);
        assert!(npc.virtual_character().unwrap().is_supported());

        // A new supporting height rebuilds the mover.
        let params = NpcMoveParams {
            supporting_height: 0.5,
            ..params
        };
        npc.move_velocity(&mut world, body, 70.0, DT, &params).unwrap();
        assert_eq!(npc.supporting_height, 0.5);
    }

    #[test]
    fn test_interaction_buffers() {
        let mut controller = CharacterController::new(CharacterSettings::default());
        controller.queue_interaction(interaction(7, 1, b"open"));
        controller.queue_interaction(interaction(9, 0, &[]));

        let mut a = StateRecorder::new();
        controller.write_pending_interactions_to_buffer(&mut a);
        assert!(controller.pending_interactions().is_empty());

        let decoded = read_interactions(&mut a).unwrap();
        assert_eq!(decoded, vec![interaction(7, 1, b"open"), interaction(9, 0, &[])]);
        assert_eq!(count_interactions_buffer_size(&mut a), a.len());

        let mut executed = Vec::new();
        let count = execute_interactions(&mut a, |i| {
            executed.push(i.target);
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(executed, vec![BodyKey(7), BodyKey(9)]);

        let mut b = StateRecorder::new();
        write_interactions(&[interaction(7, 1, b"open"), interaction(9, 0, &[])], &mut b);
        assert!(!are_interactions_different(&mut a, &mut b));

        let mut c = StateRecorder::new();
        write_interactions(&[interaction(7, 1, b"shut")], &mut c);
        assert!(are_interactions_different(&mut a, &mut c));

        let mut empty = StateRecorder::new();
        write_interactions(&[], &mut empty);
        assert!(read_interactions(&mut empty).unwrap().is_empty());
        assert_eq!(count_interactions_buffer_size(&mut empty), 1);
    }

    #[test]
    fn test_truncated_interaction_buffer_fails() {
        let mut buffer = StateRecorder::new();
        buffer.write(&true);
        buffer.write(&3u32);
        assert!(read_interactions(&mut buffer).is_none());
        assert!(execute_interactions(&mut buffer, |_| Ok(())).is_err());
    }
}
