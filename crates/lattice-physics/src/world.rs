//! Physics World
//!
//! One simulation instance backed by rapier, plus the side table mapping
//! engine bodies back to their owners.
//! Features:
//! - Dense slot table indexed by body id; slot sequences reject stale ids
//! - Engine `user_data` carries the raw id and layer, never a pointer
//! - Per-world worker pool for contact scanning and a budgeted scratch buffer
//! - Neighbour wake-up on destroy and on large teleports

use glam::{Quat, Vec3};
use lattice_core::math::{next_power_of_two, quat_is_equal_approx, vec3_is_equal_approx};
use lattice_core::{Aabb, JobPool, ScratchBuffer, Transform};
use rapier3d::parry::bounding_volume::Aabb as EngineAabb;
use rapier3d::parry::query;
use rapier3d::prelude::*;
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::body::{BodyMode, BodySettings};
use crate::body_id::{BodyId, BodyIdAllocator, BodyKey};
use crate::config::WorldSettings;
use crate::contact_listener::{ContactCandidate, ContactListener, ContactSide, ContactStats};
use crate::convert::{from_engine_aabb, from_isometry, from_vector, to_isometry, to_point, to_vector};
use crate::error::{PhysicsError, PhysicsResult};
use crate::events::EventQueue;
use crate::layers::{LayerIndex, LayerTable};
use crate::shape::ShapeRef;

/// World identifier; world 0 is the main world
pub type WorldId = u32;

/// Dynamic bodies whose smallest extent is at or below this always use CCD
pub const CCD_SIZE_THRESHOLD: f32 = 1.3;

/// Sizing of a world, rounded at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldCapacity {
    pub max_bodies: u32,
    /// 0 lets the engine decide
    pub num_body_mutexes: u32,
    pub max_body_pairs: u32,
    pub max_contact_constraints: u32,
}

impl WorldCapacity {
    pub fn from_settings(settings: &WorldSettings) -> Self {
        Self {
            max_bodies: next_power_of_two(settings.max_bodies),
            num_body_mutexes: settings.num_body_mutexes.min(64),
            max_body_pairs: next_power_of_two(settings.max_body_pairs),
            max_contact_constraints: next_power_of_two(settings.max_contact_constraints),
        }
    }
}

/// Everything needed to create a body
#[derive(Debug, Clone)]
pub struct BodyCreateInfo {
    pub owner: BodyKey,
    /// Externally assigned index, usually from the synchronized range
    pub desired_id: Option<u32>,
    pub layer: String,
    pub shape: ShapeRef,
    /// Initial transform; its scale is baked into the collision shape
    pub transform: Transform,
    pub mode: BodyMode,
    pub settings: BodySettings,
    /// Characters sync their transform even when static
    pub is_character: bool,
}

impl BodyCreateInfo {
    pub fn new(owner: BodyKey, shape: ShapeRef, transform: Transform) -> Self {
        Self {
            owner,
            desired_id: None,
            layer: String::new(),
            shape,
            transform,
            mode: BodyMode::default(),
            settings: BodySettings::default(),
            is_character: false,
        }
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = layer.into();
        self
    }

    pub fn with_mode(mut self, mode: BodyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_desired_id(mut self, desired_id: u32) -> Self {
        self.desired_id = Some(desired_id);
        self
    }

    pub fn with_settings(mut self, settings: BodySettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Side table entry of a live body
#[derive(Debug, Clone)]
pub(crate) struct BodyEntry {
    pub owner: BodyKey,
    pub body: RigidBodyHandle,
    pub collider: ColliderHandle,
    pub layer: LayerIndex,
    pub mode: BodyMode,
    pub settings: BodySettings,
    pub shape: ShapeRef,
    pub scale: Vec3,
    pub is_character: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct BodySlot {
    pub sequence: u8,
    pub entry: Option<BodyEntry>,
}

pub(crate) fn slot_entry(slots: &[BodySlot], id: BodyId) -> Option<&BodyEntry> {
    let slot = slots.get(id.index() as usize)?;
    if slot.sequence != id.sequence() {
        return None;
    }
    slot.entry.as_ref()
}

#[derive(Debug, Clone, Copy)]
struct ScannedPair {
    colliders: (ColliderHandle, ColliderHandle),
    contact: ContactCandidate,
}

/// Engine `user_data` packing: raw id in the low 32 bits, layer above
pub(crate) fn pack_user_data(id: BodyId, layer: LayerIndex) -> u128 {
    id.raw() as u128 | ((layer as u128) << 32)
}

pub(crate) fn unpack_user_data(user_data: u128) -> (BodyId, LayerIndex) {
    (
        BodyId::from_raw(user_data as u32),
        ((user_data >> 32) & 0xFF) as LayerIndex,
    )
}

pub(crate) fn interaction_groups(layers: &LayerTable, layer: LayerIndex) -> InteractionGroups {
    InteractionGroups::new(
        Group::from_bits_truncate(1u32 << (layer as u32 & 31)),
        Group::from_bits_truncate(layers.collision_mask(layer)),
    )
}

fn collision_types(mode: BodyMode, settings: &BodySettings) -> ActiveCollisionTypes {
    if mode.is_sensor() {
        ActiveCollisionTypes::all()
    } else if settings.kinematic_detects_static {
        ActiveCollisionTypes::default() | ActiveCollisionTypes::KINEMATIC_FIXED
    } else {
        ActiveCollisionTypes::default()
    }
}

/// CCD policy: thin dynamic bodies always sweep
pub fn should_use_ccd(mode: BodyMode, use_ccd: bool, world_aabb: &Aabb) -> bool {
    if mode.engine_type() != RigidBodyType::Dynamic {
        return false;
    }
    if use_ccd {
        return true;
    }
    world_aabb.size().min_element() <= CCD_SIZE_THRESHOLD
}

fn penetration_depth(colliders: &ColliderSet, a: ColliderHandle, b: ColliderHandle) -> f32 {
    let (Some(c1), Some(c2)) = (colliders.get(a), colliders.get(b)) else {
        return 0.0;
    };
    match query::contact(c1.position(), c1.shape(), c2.position(), c2.shape(), 0.0) {
        Ok(Some(contact)) => -contact.dist,
        Ok(None) => 0.0,
        // Unsupported pair: trust the narrow phase.
        Err(_) => f32::MAX,
    }
}

/// A single simulation instance
pub struct PhysicsWorld {
    id: WorldId,
    capacity: WorldCapacity,
    pub(crate) gravity: Vector<Real>,
    pub(crate) integration_parameters: IntegrationParameters,
    pipeline: PhysicsPipeline,
    pub(crate) islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    pub(crate) narrow_phase: NarrowPhase,
    pub(crate) bodies: RigidBodySet,
    pub(crate) colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    pub(crate) query_pipeline: QueryPipeline,

    pub(crate) slots: Vec<BodySlot>,
    pub(crate) sensors: Vec<BodyId>,
    pub(crate) contact_listener: ContactListener,
    job_pool: JobPool,
    contact_scratch: ScratchBuffer<ScannedPair>,
    collision_steps: u32,
    broadphase_dirty: bool,
    pub(crate) processing: bool,
}

impl PhysicsWorld {
    pub fn new(id: WorldId, settings: &WorldSettings) -> PhysicsResult<Self> {
        let capacity = WorldCapacity::from_settings(settings);
        let job_pool = JobPool::new(&format!("physics-world-{id}"), settings.worker_threads)?;

        log::debug!(
            "Creating physics world {}: {} bodies, {} pairs, {} contacts, {} workers",
            id,
            capacity.max_bodies,
            capacity.max_body_pairs,
            capacity.max_contact_constraints,
            job_pool.num_workers()
        );

        Ok(Self {
            id,
            capacity,
            gravity: to_vector(settings.gravity),
            integration_parameters: IntegrationParameters::default(),
            pipeline: PhysicsPipeline::new(),
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            slots: Vec::new(),
            sensors: Vec::new(),
            contact_listener: ContactListener::new(),
            job_pool,
            contact_scratch: ScratchBuffer::new(settings.temp_allocator_bytes),
            collision_steps: settings.collision_steps.max(1),
            broadphase_dirty: true,
            processing: false,
        })
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn capacity(&self) -> WorldCapacity {
        self.capacity
    }

    pub fn gravity(&self) -> Vec3 {
        from_vector(&self.gravity)
    }

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = to_vector(gravity);
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn contact_listener(&self) -> &ContactListener {
        &self.contact_listener
    }

    pub fn job_pool(&self) -> &JobPool {
        &self.job_pool
    }

    /// Number of live bodies
    pub fn body_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Ids of every live body
    pub fn body_ids(&self) -> impl Iterator<Item = BodyId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|_| BodyId::new(index as u32, slot.sequence))
        })
    }

    /// Live id currently stored at `index`, whatever its sequence
    pub fn id_at_index(&self, index: u32) -> Option<BodyId> {
        let slot = self.slots.get(index as usize)?;
        slot.entry.as_ref().map(|_| BodyId::new(index, slot.sequence))
    }

    pub fn contains(&self, id: BodyId) -> bool {
        self.entry(id).is_some()
    }

    pub fn owner_of(&self, id: BodyId) -> Option<BodyKey> {
        self.entry(id).map(|entry| entry.owner)
    }

    pub fn mode_of(&self, id: BodyId) -> Option<BodyMode> {
        self.entry(id).map(|entry| entry.mode)
    }

    pub fn layer_of(&self, id: BodyId) -> Option<LayerIndex> {
        self.entry(id).map(|entry| entry.layer)
    }

    pub(crate) fn entry(&self, id: BodyId) -> Option<&BodyEntry> {
        slot_entry(&self.slots, id)
    }

    pub(crate) fn entry_mut(&mut self, id: BodyId) -> Option<&mut BodyEntry> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.sequence != id.sequence() {
            return None;
        }
        slot.entry.as_mut()
    }

    pub(crate) fn engine_body(&self, id: BodyId) -> Option<&RigidBody> {
        let handle = self.entry(id)?.body;
        self.bodies.get(handle)
    }

    pub(crate) fn engine_body_mut(&mut self, id: BodyId) -> Option<&mut RigidBody> {
        let handle = self.entry(id)?.body;
        self.bodies.get_mut(handle)
    }

    pub(crate) fn engine_collider(&self, id: BodyId) -> Option<&Collider> {
        let handle = self.entry(id)?.collider;
        self.colliders.get(handle)
    }

    /// Body id stored on an engine collider
    pub(crate) fn body_of_collider(&self, handle: ColliderHandle) -> Option<BodyId> {
        let collider = self.colliders.get(handle)?;
        let (id, _) = unpack_user_data(collider.user_data);
        self.contains(id).then_some(id)
    }

    pub(crate) fn ensure_not_processing(&self, operation: &'static str) -> PhysicsResult<()> {
        if self.processing {
            log::error!("You can't use `{}` while the physics is processing.", operation);
            return Err(PhysicsError::PhysicsProcessing(operation));
        }
        Ok(())
    }

    /// Create a body, activated iff dynamic.
    ///
    /// Fails when the desired index is taken, the index exceeds the
    /// world capacity or the shape can't be built.
    pub fn create_body(
        &mut self,
        layers: &LayerTable,
        ids: &mut dyn BodyIdAllocator,
        info: &BodyCreateInfo,
    ) -> PhysicsResult<BodyId> {
        let fetched = info.desired_id.is_none();
        let index = match info.desired_id {
            Some(index) => {
                if self.id_at_index(index).is_some() {
                    log::error!(
                        "The body id `{}` is already in use; body {:?} was not created",
                        index,
                        info.owner
                    );
                    return Err(PhysicsError::DesiredIdOccupied(index));
                }
                index
            }
            None => ids.fetch_free_id(),
        };

        if index >= self.capacity.max_bodies || index > BodyId::MAX_INDEX {
            if fetched {
                ids.on_body_destroyed(index);
            }
            log::error!(
                "Body index {} exceeds the capacity of world {}",
                index,
                self.id
            );
            return Err(PhysicsError::WorldCapacity {
                index,
                max_bodies: self.capacity.max_bodies,
            });
        }

        let scale = info.transform.scale.abs();
        let shape = match info.shape.build_scaled(scale) {
            Ok(shape) => shape,
            Err(err) => {
                if fetched {
                    ids.on_body_destroyed(index);
                }
                log::error!("Can't create body {:?}: {}", info.owner, err);
                return Err(err.into());
            }
        };

        let mut mode = info.mode;
        if mode.engine_type() == RigidBodyType::Dynamic && !info.shape.is_convex() {
            mode = BodyMode::Static;
        }

        let layer = layers.layer_for_name(&info.layer);
        if index as usize >= self.slots.len() {
            self.slots.resize_with(index as usize + 1, BodySlot::default);
        }
        let id = BodyId::new(index, self.slots[index as usize].sequence);

        let iso = to_isometry(info.transform.position, info.transform.rotation);
        let world_aabb = from_engine_aabb(&shape.compute_aabb(&iso));
        let settings = &info.settings;
        let body = RigidBodyBuilder::new(mode.engine_type())
            .position(iso)
            .linear_damping(settings.linear_damping)
            .angular_damping(settings.angular_damping)
            .gravity_scale(settings.gravity_scale)
            .can_sleep(settings.allow_sleeping)
            .ccd_enabled(should_use_ccd(mode, settings.use_ccd, &world_aabb))
            .user_data(pack_user_data(id, layer))
            .build();
        let collider = ColliderBuilder::new(shape)
            .friction(settings.friction)
            .restitution(settings.restitution)
            .sensor(mode.is_sensor())
            .mass(settings.engine_mass())
            .collision_groups(interaction_groups(layers, layer))
            .active_collision_types(collision_types(mode, settings))
            .user_data(pack_user_data(id, layer))
            .build();

        let body_handle = self.bodies.insert(body);
        let collider_handle =
            self.colliders
                .insert_with_parent(collider, body_handle, &mut self.bodies);
        if let Some(body) = self.bodies.get_mut(body_handle) {
            if mode.engine_type() == RigidBodyType::Dynamic {
                body.wake_up(true);
            } else if mode.engine_type() != RigidBodyType::Fixed {
                body.sleep();
            }
        }

        self.slots[index as usize].entry = Some(BodyEntry {
            owner: info.owner,
            body: body_handle,
            collider: collider_handle,
            layer,
            mode,
            settings: info.settings.clone(),
            shape: info.shape.clone(),
            scale,
            is_character: info.is_character,
        });
        info.shape.subscribe(info.owner);
        ids.on_body_created(index);
        if mode.is_sensor() {
            self.register_sensor(id);
        }
        self.broadphase_dirty = true;

        log::debug!(
            "Created body {:?} (index {}) for {:?} in world {} as {:?}",
            id,
            index,
            info.owner,
            self.id,
            mode
        );
        Ok(id)
    }

    /// Remove a body. With `wake_neighbors`, dynamic bodies overlapping its
    /// last bounds are woken so they don't rest on nothing.
    pub fn destroy_body(
        &mut self,
        id: BodyId,
        ids: &mut dyn BodyIdAllocator,
        wake_neighbors: bool,
    ) -> PhysicsResult<BodyKey> {
        let Some(entry) = self.entry(id).cloned() else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };

        let bounds = self
            .colliders
            .get(entry.collider)
            .map(|collider| collider.compute_aabb());

        self.bodies.remove(
            entry.body,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );

        self.unregister_sensor(id);
        entry.shape.unsubscribe(entry.owner);
        let slot = &mut self.slots[id.index() as usize];
        slot.entry = None;
        slot.sequence = slot.sequence.wrapping_add(1);
        ids.on_body_destroyed(id.index());

        if wake_neighbors {
            if let Some(bounds) = bounds {
                self.wake_dynamic_in(&bounds);
            }
        }
        self.broadphase_dirty = true;

        log::debug!("Destroyed body {:?} of {:?} in world {}", id, entry.owner, self.id);
        Ok(entry.owner)
    }

    fn wake_dynamic_in(&mut self, bounds: &EngineAabb) {
        let mut found: SmallVec<[RigidBodyHandle; 16]> = SmallVec::new();
        let colliders = &self.colliders;
        self.query_pipeline
            .colliders_with_aabb_intersecting_aabb(bounds, |handle| {
                if let Some(parent) = colliders.get(*handle).and_then(|c| c.parent()) {
                    found.push(parent);
                }
                true
            });
        for handle in found {
            if let Some(body) = self.bodies.get_mut(handle) {
                if body.is_dynamic() {
                    body.wake_up(true);
                }
            }
        }
    }

    /// Rebuild the query acceleration structure
    pub fn optimize_broadphase(&mut self) {
        self.query_pipeline.update(&self.colliders);
        self.broadphase_dirty = false;
    }

    /// Advance the simulation by `delta` seconds
    pub fn step(&mut self, delta: f32) -> ContactStats {
        let _span = tracing::trace_span!("physics_step", world = self.id).entered();

        if self.broadphase_dirty {
            self.optimize_broadphase();
        }

        self.processing = true;
        self.integration_parameters.dt = delta / self.collision_steps as f32;
        for _ in 0..self.collision_steps {
            self.pipeline.step(
                &self.gravity,
                &self.integration_parameters,
                &mut self.islands,
                &mut self.broad_phase,
                &mut self.narrow_phase,
                &mut self.bodies,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                &mut self.ccd_solver,
                Some(&mut self.query_pipeline),
                &(),
                &(),
            );
        }
        let stats = self.scan_contacts();
        self.clamp_velocities();
        self.processing = false;
        stats
    }

    fn contact_side(&self, handle: ColliderHandle) -> Option<ContactSide> {
        let id = self.body_of_collider(handle)?;
        let entry = self.entry(id)?;
        Some(ContactSide {
            id,
            key: entry.owner,
            is_sensor: entry.mode.is_sensor(),
        })
    }

    fn scan_contacts(&mut self) -> ContactStats {
        let _span = tracing::trace_span!("contact_scan", world = self.id).entered();

        let mut pairs = self.contact_scratch.take();
        for (h1, h2, intersecting) in self.narrow_phase.intersection_pairs() {
            if !intersecting {
                continue;
            }
            let (Some(a), Some(b)) = (self.contact_side(h1), self.contact_side(h2)) else {
                continue;
            };
            pairs.push(ScannedPair {
                colliders: (h1, h2),
                contact: ContactCandidate { a, b, depth: 0.0 },
            });
        }

        if pairs.len() > self.capacity.max_body_pairs as usize {
            log::warn!(
                "World {} has {} sensor pairs, above the configured {}",
                self.id,
                pairs.len(),
                self.capacity.max_body_pairs
            );
        }

        let colliders = &self.colliders;
        let listener = &self.contact_listener;
        self.job_pool.install(|| {
            pairs.par_iter_mut().for_each(|pair| {
                pair.contact.depth = penetration_depth(colliders, pair.colliders.0, pair.colliders.1);
                listener.contact_detected(&pair.contact);
            });
        });

        let stats = self
            .contact_listener
            .classify(pairs.iter().map(|pair| &pair.contact));
        self.contact_scratch.restore(pairs);
        stats
    }

    fn clamp_velocities(&mut self) {
        for handle in self.islands.active_dynamic_bodies() {
            let Some(body) = self.bodies.get_mut(*handle) else {
                continue;
            };
            let (id, _) = unpack_user_data(body.user_data);
            let Some(entry) = slot_entry(&self.slots, id) else {
                continue;
            };
            let max_linear = entry.settings.max_linear_velocity;
            let max_angular = entry.settings.max_angular_velocity_rad();

            let linvel = *body.linvel();
            if linvel.norm() > max_linear {
                body.set_linvel(linvel.normalize() * max_linear, false);
            }
            let angvel = *body.angvel();
            if angvel.norm() > max_angular {
                body.set_angvel(angvel.normalize() * max_angular, false);
            }
        }
    }

    /// Copy engine transforms to owners, then flush sensor overlap events.
    ///
    /// Without `force_all` only active bodies are visited.
    pub fn sync_transforms(
        &mut self,
        force_all: bool,
        events: &mut EventQueue,
        mut apply: impl FnMut(BodyKey, Transform),
    ) {
        let _span = tracing::trace_span!("sync_transforms", world = self.id).entered();

        let mut visit = |body: &RigidBody| {
            let (id, _) = unpack_user_data(body.user_data);
            let Some(entry) = slot_entry(&self.slots, id) else {
                return;
            };
            if !entry.is_character && entry.mode.is_static() {
                return;
            }
            let (position, rotation) = from_isometry(body.position());
            apply(entry.owner, Transform::new(position, rotation, entry.scale));
        };

        if force_all {
            for (_, body) in self.bodies.iter() {
                visit(body);
            }
        } else {
            let active = self
                .islands
                .active_dynamic_bodies()
                .iter()
                .chain(self.islands.active_kinematic_bodies());
            for handle in active {
                if let Some(body) = self.bodies.get(*handle) {
                    visit(body);
                }
            }
        }

        self.flush_overlap_events(events);
    }

    /// Emit the overlap events of every registered sensor
    pub fn flush_overlap_events(&self, events: &mut EventQueue) {
        let slots = &self.slots;
        let resolve = |other: BodyId| slot_entry(slots, other).map(|entry| entry.owner);
        for sensor in &self.sensors {
            let Some(entry) = self.entry(*sensor) else {
                continue;
            };
            self.contact_listener
                .overlaps()
                .flush(*sensor, entry.owner, events, resolve);
        }
    }

    pub fn register_sensor(&mut self, id: BodyId) {
        if !self.sensors.contains(&id) {
            self.sensors.push(id);
        }
    }

    pub fn unregister_sensor(&mut self, id: BodyId) {
        if let Some(position) = self.sensors.iter().position(|s| *s == id) {
            self.sensors.swap_remove(position);
        }
        self.contact_listener.overlaps().remove_sensor(id);
    }

    pub fn sensors(&self) -> &[BodyId] {
        &self.sensors
    }

    /// Current transform including the baked scale
    pub fn transform(&self, id: BodyId) -> Option<Transform> {
        let entry = self.entry(id)?;
        let body = self.bodies.get(entry.body)?;
        let (position, rotation) = from_isometry(body.position());
        Some(Transform::new(position, rotation, entry.scale))
    }

    /// Teleport a body. A scale change rebuilds its shape; a large move
    /// wakes dynamic neighbours at both ends.
    pub fn set_transform(&mut self, id: BodyId, transform: &Transform) -> PhysicsResult<()> {
        let Some(entry) = self.entry(id).cloned() else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };
        let Some(current) = self.transform(id) else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };

        let new_scale = transform.scale.abs();
        let scale_changed = !vec3_is_equal_approx(new_scale, entry.scale);
        let is_great_move = !vec3_is_equal_approx(transform.position, current.position)
            || scale_changed
            || !quat_is_equal_approx(transform.rotation, current.rotation);

        let before = self
            .colliders
            .get(entry.collider)
            .map(|collider| collider.compute_aabb());

        let iso = to_isometry(transform.position, transform.rotation);
        let is_dynamic = entry.mode.engine_type() == RigidBodyType::Dynamic;
        if let Some(body) = self.bodies.get_mut(entry.body) {
            body.set_position(iso, is_dynamic);
        }

        if scale_changed {
            let shape = entry.shape.build_scaled(new_scale)?;
            if let Some(collider) = self.colliders.get_mut(entry.collider) {
                collider.set_shape(shape);
            }
            if let Some(entry) = self.entry_mut(id) {
                entry.scale = new_scale;
            }
            self.apply_ccd(id);
        }

        // Keep queries coherent until the next step syncs colliders.
        if let Some(collider) = self.colliders.get_mut(entry.collider) {
            collider.set_position(iso);
        }

        if is_great_move {
            if let Some(before) = before {
                self.wake_dynamic_in(&before);
            }
            if let Some(after) = self.colliders.get(entry.collider).map(|c| c.compute_aabb()) {
                self.wake_dynamic_in(&after);
            }
        }
        Ok(())
    }

    /// World bounds of a body
    pub fn body_aabb(&self, id: BodyId) -> Option<Aabb> {
        self.engine_collider(id)
            .map(|collider| from_engine_aabb(&collider.compute_aabb()))
    }

    /// Whether CCD applies to this body right now
    pub fn should_use_ccd(&self, id: BodyId) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let Some(aabb) = self.body_aabb(id) else {
            return false;
        };
        should_use_ccd(entry.mode, entry.settings.use_ccd, &aabb)
    }

    pub(crate) fn apply_ccd(&mut self, id: BodyId) {
        let enabled = self.should_use_ccd(id);
        if let Some(body) = self.engine_body_mut(id) {
            body.enable_ccd(enabled);
        }
    }

    /// Switch the motion mode. Non-convex shapes can't be dynamic and fall
    /// back to static; the effective mode is returned.
    ///
    /// Forces, torques and velocities are reset.
    pub fn set_motion(&mut self, id: BodyId, mode: BodyMode) -> PhysicsResult<BodyMode> {
        let Some(entry) = self.entry(id).cloned() else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };

        let mode = if mode.engine_type() == RigidBodyType::Dynamic && !entry.shape.is_convex() {
            log::debug!("Body {:?} has a non-convex shape, using Static", entry.owner);
            BodyMode::Static
        } else {
            mode
        };
        let is_dynamic = mode.engine_type() == RigidBodyType::Dynamic;

        if let Some(body) = self.bodies.get_mut(entry.body) {
            body.set_body_type(mode.engine_type(), is_dynamic);
            body.reset_forces(false);
            body.reset_torques(false);
            body.set_linvel(Vector::zeros(), false);
            body.set_angvel(Vector::zeros(), false);
            if is_dynamic {
                body.wake_up(true);
            }
        }
        if let Some(collider) = self.colliders.get_mut(entry.collider) {
            collider.set_sensor(mode.is_sensor());
            collider.set_active_collision_types(collision_types(mode, &entry.settings));
            collider.set_mass(entry.settings.engine_mass());
        }
        if let Some(entry) = self.entry_mut(id) {
            entry.mode = mode;
        }
        self.apply_ccd(id);

        if mode.is_sensor() {
            self.register_sensor(id);
        } else {
            self.unregister_sensor(id);
        }
        Ok(mode)
    }

    /// Move a body to another layer
    pub fn set_layer(&mut self, id: BodyId, layer: LayerIndex, layers: &LayerTable) -> PhysicsResult<()> {
        let Some(entry) = self.entry_mut(id) else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };
        entry.layer = layer;
        let (body, collider) = (entry.body, entry.collider);

        if let Some(collider) = self.colliders.get_mut(collider) {
            collider.set_collision_groups(interaction_groups(layers, layer));
            collider.user_data = pack_user_data(id, layer);
        }
        if let Some(body) = self.bodies.get_mut(body) {
            body.user_data = pack_user_data(id, layer);
        }
        Ok(())
    }

    /// Re-apply collision groups after the layer table changed
    pub fn apply_layer_table(&mut self, layers: &LayerTable) {
        for slot in &self.slots {
            let Some(entry) = slot.entry.as_ref() else {
                continue;
            };
            if let Some(collider) = self.colliders.get_mut(entry.collider) {
                collider.set_collision_groups(interaction_groups(layers, entry.layer));
            }
        }
    }

    /// Swap the collision shape, keeping the baked scale
    pub fn set_shape(&mut self, id: BodyId, shape: ShapeRef) -> PhysicsResult<()> {
        let Some(entry) = self.entry(id).cloned() else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };
        let built = shape.build_scaled(entry.scale)?;
        if let Some(collider) = self.colliders.get_mut(entry.collider) {
            collider.set_shape(built);
        }
        if !std::sync::Arc::ptr_eq(&entry.shape, &shape) {
            entry.shape.unsubscribe(entry.owner);
            shape.subscribe(entry.owner);
        }
        if let Some(entry) = self.entry_mut(id) {
            entry.shape = shape;
        }
        self.apply_ccd(id);
        self.broadphase_dirty = true;
        Ok(())
    }

    /// Apply physical properties
    pub fn apply_settings(&mut self, id: BodyId, settings: &BodySettings) -> PhysicsResult<()> {
        let Some(entry) = self.entry_mut(id) else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };
        entry.settings = settings.clone();
        let (body, collider, mode) = (entry.body, entry.collider, entry.mode);

        if let Some(body) = self.bodies.get_mut(body) {
            body.set_linear_damping(settings.linear_damping);
            body.set_angular_damping(settings.angular_damping);
            body.set_gravity_scale(settings.gravity_scale, false);
            *body.activation_mut() = if settings.allow_sleeping {
                RigidBodyActivation::active()
            } else {
                RigidBodyActivation::cannot_sleep()
            };
        }
        if let Some(collider) = self.colliders.get_mut(collider) {
            collider.set_friction(settings.friction);
            collider.set_restitution(settings.restitution);
            collider.set_mass(settings.engine_mass());
            collider.set_active_collision_types(collision_types(mode, settings));
        }
        self.apply_ccd(id);
        Ok(())
    }

    pub fn is_active(&self, id: BodyId) -> bool {
        self.engine_body(id)
            .map(|body| !body.is_sleeping())
            .unwrap_or(false)
    }

    /// True when asleep or without a body
    pub fn is_sleeping(&self, id: BodyId) -> bool {
        !self.is_active(id)
    }

    /// Wake a sleeping dynamic or kinematic body
    pub fn activate(&mut self, id: BodyId) {
        if let Some(body) = self.engine_body_mut(id) {
            if !body.is_fixed() && body.is_sleeping() {
                body.wake_up(true);
            }
        }
    }

    pub fn linear_velocity(&self, id: BodyId) -> Option<Vec3> {
        self.engine_body(id).map(|body| from_vector(body.linvel()))
    }

    pub fn angular_velocity(&self, id: BodyId) -> Option<Vec3> {
        self.engine_body(id).map(|body| from_vector(body.angvel()))
    }

    /// Set the linear velocity, clamped to the body's cap
    pub fn set_linear_velocity(&mut self, id: BodyId, velocity: Vec3) -> PhysicsResult<()> {
        self.ensure_not_processing("set_linear_velocity")?;
        let Some(max) = self.entry(id).map(|e| e.settings.max_linear_velocity) else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };
        let velocity = velocity.clamp_length_max(max);
        if let Some(body) = self.engine_body_mut(id) {
            body.set_linvel(to_vector(velocity), velocity != Vec3::ZERO);
        }
        Ok(())
    }

    /// Set the angular velocity, clamped to the body's cap
    pub fn set_angular_velocity(&mut self, id: BodyId, velocity: Vec3) -> PhysicsResult<()> {
        self.ensure_not_processing("set_angular_velocity")?;
        let Some(max) = self.entry(id).map(|e| e.settings.max_angular_velocity_rad()) else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };
        let velocity = velocity.clamp_length_max(max);
        if let Some(body) = self.engine_body_mut(id) {
            body.set_angvel(to_vector(velocity), velocity != Vec3::ZERO);
        }
        Ok(())
    }

    fn with_body_for_force(
        &mut self,
        id: BodyId,
        operation: &'static str,
        apply: impl FnOnce(&mut RigidBody),
    ) -> PhysicsResult<()> {
        self.ensure_not_processing(operation)?;
        let Some(body) = self.engine_body_mut(id) else {
            log::error!("`{}` called on body {:?} without a simulated body", operation, id);
            return Err(PhysicsError::NoSimulatedBody(id));
        };
        apply(body);
        self.activate(id);
        Ok(())
    }

    pub fn add_force(&mut self, id: BodyId, force: Vec3) -> PhysicsResult<()> {
        self.with_body_for_force(id, "add_force", |body| body.add_force(to_vector(force), true))
    }

    pub fn add_force_at(&mut self, id: BodyId, force: Vec3, point: Vec3) -> PhysicsResult<()> {
        self.with_body_for_force(id, "add_force_at", |body| {
            body.add_force_at_point(to_vector(force), to_point(point), true)
        })
    }

    pub fn add_torque(&mut self, id: BodyId, torque: Vec3) -> PhysicsResult<()> {
        self.with_body_for_force(id, "add_torque", |body| body.add_torque(to_vector(torque), true))
    }

    pub fn add_impulse(&mut self, id: BodyId, impulse: Vec3) -> PhysicsResult<()> {
        self.with_body_for_force(id, "add_impulse", |body| {
            body.apply_impulse(to_vector(impulse), true)
        })
    }

    pub fn add_impulse_at(&mut self, id: BodyId, impulse: Vec3, point: Vec3) -> PhysicsResult<()> {
        self.with_body_for_force(id, "add_impulse_at", |body| {
            body.apply_impulse_at_point(to_vector(impulse), to_point(point), true)
        })
    }

    pub fn add_angular_impulse(&mut self, id: BodyId, impulse: Vec3) -> PhysicsResult<()> {
        self.with_body_for_force(id, "add_angular_impulse", |body| {
            body.apply_torque_impulse(to_vector(impulse), true)
        })
    }

    /// Drive a kinematic body toward a pose; the engine derives the
    /// velocity over the next step.
    pub fn move_kinematic(&mut self, id: BodyId, position: Vec3, rotation: Quat) -> PhysicsResult<()> {
        let Some(body) = self.engine_body_mut(id) else {
            return Err(PhysicsError::NoSimulatedBody(id));
        };
        if !body.is_kinematic() {
            return Err(PhysicsError::NotAllowed("move_kinematic on a non-kinematic body"));
        }
        body.wake_up(true);
        body.set_next_kinematic_position(to_isometry(position, rotation));
        Ok(())
    }
}

impl std::fmt::Debug for PhysicsWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsWorld")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("bodies", &self.body_count())
            .field("sensors", &self.sensors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body_id::BodyIdManager;
    use crate::events::BodyEvent;
    use crate::shape::{Shape, ShapeDesc};

    fn world() -> PhysicsWorld {
        PhysicsWorld::new(
            0,
            &WorldSettings {
                worker_threads: Some(2),
                ..WorldSettings::default()
            },
        )
        .unwrap()
    }

    fn cube_at(owner: u32, position: Vec3) -> BodyCreateInfo {
        BodyCreateInfo::new(
            BodyKey(owner),
            Shape::new(ShapeDesc::cube(1.0)),
            Transform::from_position(position),
        )
        .with_layer("DYNAMIC")
        .with_mode(BodyMode::Dynamic)
    }

    #[test]
    fn test_capacity_rounding() {
        let capacity = WorldCapacity::from_settings(&WorldSettings {
            max_bodies: 1000,
            num_body_mutexes: 100,
            max_body_pairs: 65,
            max_contact_constraints: 64,
            ..WorldSettings::default()
        });
        assert_eq!(capacity.max_bodies, 1024);
        assert_eq!(capacity.num_body_mutexes, 64);
        assert_eq!(capacity.max_body_pairs, 128);
        assert_eq!(capacity.max_contact_constraints, 64);
    }

    #[test]
    fn test_dynamic_box_falls() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();

        let id = world
            .create_body(&layers, &mut ids, &cube_at(1, Vec3::ZERO))
            .unwrap();
        world.step(1.0 / 60.0);

        let transform = world.transform(id).unwrap();
        assert!(transform.position.y < 0.0);
        assert!(!world.is_sleeping(id));
    }

    #[test]
    fn test_desired_id_collision_is_rejected() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();

        let first = world
            .create_body(&layers, &mut ids, &cube_at(1, Vec3::ZERO).with_desired_id(600))
            .unwrap();
        assert_eq!(first.index(), 600);

        let second = world.create_body(
            &layers,
            &mut ids,
            &cube_at(2, Vec3::X * 5.0).with_desired_id(600),
        );
        assert!(matches!(second, Err(PhysicsError::DesiredIdOccupied(600))));
        assert_eq!(world.body_count(), 1);
    }

    #[test]
    fn test_stale_ids_are_rejected() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();

        let old = world
            .create_body(&layers, &mut ids, &cube_at(1, Vec3::ZERO))
            .unwrap();
        assert_eq!(world.destroy_body(old, &mut ids, true).unwrap(), BodyKey(1));

        let new = world
            .create_body(&layers, &mut ids, &cube_at(2, Vec3::ZERO))
            .unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert!(!world.contains(old));
        assert_eq!(world.owner_of(new), Some(BodyKey(2)));
        assert!(world.destroy_body(old, &mut ids, true).is_err());
    }

    #[test]
    fn test_destroy_wakes_resting_neighbours() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();

        let support = world
            .create_body(&layers, &mut ids, &cube_at(1, Vec3::ZERO))
            .unwrap();
        let resting = world
            .create_body(&layers, &mut ids, &cube_at(2, Vec3::Y * 0.9))
            .unwrap();
        world.optimize_broadphase();
        if let Some(body) = world.engine_body_mut(resting) {
            body.sleep();
        }
        assert!(world.is_sleeping(resting));

        world.destroy_body(support, &mut ids, true).unwrap();
        assert!(!world.is_sleeping(resting));
    }

    #[test]
    fn test_non_convex_dynamic_falls_back_to_static() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();

        let mesh = Shape::new(ShapeDesc::mesh(vec![
            Vec3::ZERO,
            Vec3::X,
            Vec3::Z,
        ]));
        let info = BodyCreateInfo::new(BodyKey(1), mesh, Transform::IDENTITY)
            .with_layer("STATIC")
            .with_mode(BodyMode::Static);
        let id = world.create_body(&layers, &mut ids, &info).unwrap();

        assert_eq!(world.set_motion(id, BodyMode::Dynamic).unwrap(), BodyMode::Static);
        assert_eq!(world.mode_of(id), Some(BodyMode::Static));
        assert_eq!(world.set_motion(id, BodyMode::Kinematic).unwrap(), BodyMode::Kinematic);
    }

    #[test]
    fn test_thin_dynamic_bodies_force_ccd() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();

        let plank = BodyCreateInfo::new(
            BodyKey(1),
            Shape::new(ShapeDesc::Box {
                size: Vec3::new(4.0, 0.2, 4.0),
            }),
            Transform::IDENTITY,
        )
        .with_layer("DYNAMIC")
        .with_mode(BodyMode::Dynamic);
        let plank = world.create_body(&layers, &mut ids, &plank).unwrap();
        assert!(world.should_use_ccd(plank));
        assert!(world.engine_body(plank).unwrap().is_ccd_enabled());

        let crate_ = BodyCreateInfo::new(
            BodyKey(2),
            Shape::new(ShapeDesc::cube(2.0)),
            Transform::from_position(Vec3::X * 10.0),
        )
        .with_layer("DYNAMIC")
        .with_mode(BodyMode::Dynamic);
        let crate_ = world.create_body(&layers, &mut ids, &crate_).unwrap();
        assert!(!world.should_use_ccd(crate_));

        world.set_motion(plank, BodyMode::Kinematic).unwrap();
        assert!(!world.should_use_ccd(plank));
    }

    #[test]
    fn test_ccd_rule() {
        let thin = Aabb::new(Vec3::ZERO, Vec3::new(5.0, 1.3, 5.0));
        let thick = Aabb::new(Vec3::ZERO, Vec3::splat(2.0));
        assert!(should_use_ccd(BodyMode::Dynamic, false, &thin));
        assert!(!should_use_ccd(BodyMode::Dynamic, false, &thick));
        assert!(should_use_ccd(BodyMode::Dynamic, true, &thick));
        assert!(!should_use_ccd(BodyMode::Static, true, &thin));
    }

    #[test]
    fn test_forces_are_rejected_while_processing() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();
        let id = world
            .create_body(&layers, &mut ids, &cube_at(1, Vec3::ZERO))
            .unwrap();

        world.processing = true;
        assert!(matches!(
            world.add_force(id, Vec3::Y),
            Err(PhysicsError::PhysicsProcessing("add_force"))
        ));
        world.processing = false;
        assert!(world.add_impulse(id, Vec3::Y).is_ok());
        assert!(world.add_force(BodyId::new(99, 0), Vec3::Y).is_err());
    }

    #[test]
    fn test_velocity_is_clamped() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();
        let id = world
            .create_body(&layers, &mut ids, &cube_at(1, Vec3::ZERO))
            .unwrap();

        world.set_linear_velocity(id, Vec3::X * 10_000.0).unwrap();
        let velocity = world.linear_velocity(id).unwrap();
        assert!((velocity.length() - 500.0).abs() < 0.01);
    }

    #[test]
    fn test_sensor_overlap_through_the_world() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();
        world.set_gravity(Vec3::ZERO);

        let sensor = BodyCreateInfo::new(
            BodyKey(1),
            Shape::new(ShapeDesc::cube(2.0)),
            Transform::IDENTITY,
        )
        .with_layer("TRIGGER")
        .with_mode(BodyMode::Sensor);
        let sensor = world.create_body(&layers, &mut ids, &sensor).unwrap();
        assert_eq!(world.sensors(), &[sensor]);

        let ball = BodyCreateInfo::new(
            BodyKey(2),
            Shape::new(ShapeDesc::sphere()),
            Transform::from_position(Vec3::X * 10.0),
        )
        .with_layer("DYNAMIC")
        .with_mode(BodyMode::Dynamic);
        let ball = world.create_body(&layers, &mut ids, &ball).unwrap();

        let mut events = EventQueue::new();
        let mut tick = |world: &mut PhysicsWorld| {
            world.step(1.0 / 60.0);
            world.sync_transforms(false, &mut events, |_, _| {});
            events.drain()
        };
        let starts = |frame: &[BodyEvent]| {
            frame
                .iter()
                .filter(|e| matches!(e, BodyEvent::OverlapStart { .. }))
                .count()
        };
        let ends = |frame: &[BodyEvent]| {
            frame
                .iter()
                .filter(|e| matches!(e, BodyEvent::OverlapEnd { .. }))
                .count()
        };

        assert_eq!(starts(&tick(&mut world)), 0);

        world
            .set_transform(ball, &Transform::from_position(Vec3::new(0.2, 0.0, 0.0)))
            .unwrap();
        let inside: Vec<_> = (0..2).map(|_| tick(&mut world)).collect();
        assert_eq!(inside.iter().map(|f| starts(f)).sum::<usize>(), 1);
        assert!(inside[0].contains(&BodyEvent::TriggerEntered {
            sensor: BodyKey(1),
            other: BodyKey(2),
        }));

        world
            .set_transform(ball, &Transform::from_position(Vec3::X * 10.0))
            .unwrap();
        let outside: Vec<_> = (0..3).map(|_| tick(&mut world)).collect();
        assert_eq!(ends(&outside[0]), 0);
        assert_eq!(ends(&outside[1]), 1);
        assert_eq!(ends(&outside[2]), 0);
    }

    #[test]
    fn test_sync_skips_static_bodies() {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = world();

        let ground = BodyCreateInfo::new(
            BodyKey(1),
            Shape::new(ShapeDesc::cube(1.0)),
            Transform::from_position(Vec3::Y * -5.0),
        )
        .with_layer("STATIC")
        .with_mode(BodyMode::Static);
        world.create_body(&layers, &mut ids, &ground).unwrap();
        world
            .create_body(&layers, &mut ids, &cube_at(2, Vec3::Y * 5.0))
            .unwrap();
        world.step(1.0 / 60.0);

        let mut synced = Vec::new();
        let mut events = EventQueue::new();
        world.sync_transforms(true, &mut events, |owner, _| synced.push(owner));
        assert_eq!(synced, vec![BodyKey(2)]);
    }

    #[test]
    fn test_user_data_packing() {
        let id = BodyId::new(42, 3);
        assert_eq!(unpack_user_data(pack_user_data(id, 6)), (id, 6));
    }
}
