//! Physics session
//!
//! Owns every service of a simulated scene: layer table, worlds, id
//! allocator, body table, sync groups and the event queue. One session
//! runs per process side (authority or peer) and is ticked from a single
//! thread.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;
use lattice_core::{Clock, Millis, SystemClock};

use crate::body::{Body, NetworkRole, PhysicsContext};
use crate::body_id::{BodyIdAllocator, BodyIdManager, BodyKey};
use crate::character::{CharacterInput, execute_interactions};
use crate::config::SessionConfig;
use crate::contact_listener::ContactStats;
use crate::error::{PhysicsError, PhysicsResult};
use crate::events::{BodyEvent, EventQueue};
use crate::layers::LayerTable;
use crate::manager::{MAIN_WORLD, WorldManager};
use crate::recorder::StateRecorder;
use crate::state_filter::{StateRecorderFilter, StateRecorderState, SyncStateFilter};
use crate::sync_groups::{PeerId, SpatialSyncGroups, SyncGroupId};

pub struct PhysicsSession {
    role: NetworkRole,
    layers: LayerTable,
    worlds: WorldManager,
    ids: Box<dyn BodyIdAllocator>,
    bodies: IndexMap<BodyKey, Body>,
    sync_groups: SpatialSyncGroups,
    events: EventQueue,
    clock: Arc<dyn Clock>,
    pending_state: Option<StateRecorder>,
    locally_simulated: AHashSet<BodyKey>,
    peer_filter: SyncStateFilter,
    character_inputs: AHashMap<BodyKey, CharacterInput>,
    next_key: u32,
}

impl PhysicsSession {
    pub fn new(config: &SessionConfig, role: NetworkRole) -> PhysicsResult<Self> {
        Self::with_clock(config, role, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        config: &SessionConfig,
        role: NetworkRole,
        clock: Arc<dyn Clock>,
    ) -> PhysicsResult<Self> {
        let layers = LayerTable::from_config(&config.layers);
        let worlds = WorldManager::new(&config.world)?;
        log::debug!(
            "Physics session started as {:?} with layers [{}]",
            role,
            layers.layers_comma_separated()
        );
        Ok(Self {
            role,
            layers,
            worlds,
            ids: Box::new(BodyIdManager::new(&config.body_ids)),
            bodies: IndexMap::new(),
            sync_groups: SpatialSyncGroups::new(config.sync_groups.clone()),
            events: EventQueue::new(),
            clock,
            pending_state: None,
            locally_simulated: AHashSet::new(),
            peer_filter: SyncStateFilter::new(),
            character_inputs: AHashMap::new(),
            next_key: 0,
        })
    }

    /// Replace the id allocator. Only valid before any body exists.
    pub fn set_id_allocator(&mut self, ids: Box<dyn BodyIdAllocator>) -> PhysicsResult<()> {
        if !self.bodies.is_empty() {
            return Err(PhysicsError::NotAllowed("the id allocator is in use"));
        }
        self.ids = ids;
        Ok(())
    }

    pub fn role(&self) -> NetworkRole {
        self.role
    }

    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    pub fn layers(&self) -> &LayerTable {
        &self.layers
    }

    /// Swap the layer table and re-apply it to every live body
    pub fn set_layer_table(&mut self, layers: LayerTable) {
        self.layers = layers;
        self.worlds.apply_layer_table(&self.layers);
    }

    pub fn worlds(&self) -> &WorldManager {
        &self.worlds
    }

    pub fn worlds_mut(&mut self) -> &mut WorldManager {
        &mut self.worlds
    }

    pub fn sync_groups(&self) -> &SpatialSyncGroups {
        &self.sync_groups
    }

    pub fn sync_groups_mut(&mut self) -> &mut SpatialSyncGroups {
        &mut self.sync_groups
    }

    // ------------------------------------------------------------ Bodies

    /// Fresh key for a body owned by this session
    pub fn next_body_key(&mut self) -> BodyKey {
        while self.bodies.contains_key(&BodyKey(self.next_key)) {
            self.next_key = self.next_key.wrapping_add(1);
        }
        let key = BodyKey(self.next_key);
        self.next_key = self.next_key.wrapping_add(1);
        key
    }

    /// Insert a body and create its engine body if it has a valid shape.
    /// The body stays in the table even when the creation fails.
    pub fn add_body(&mut self, body: Body) -> PhysicsResult<BodyKey> {
        let key = body.key();
        if self.bodies.contains_key(&key) {
            return Err(PhysicsError::NotAllowed("body key already in use"));
        }
        self.bodies.insert(key, body);
        self.with_body(key, |body, ctx| body.update_body(ctx))?;
        Ok(key)
    }

    /// Destroy a body and forget it
    pub fn remove_body(&mut self, key: BodyKey) -> PhysicsResult<()> {
        let result = self.with_body(key, |body, ctx| body.on_owner_destroyed(ctx));
        self.bodies.shift_remove(&key);
        self.sync_groups.remove_body(key);
        self.locally_simulated.remove(&key);
        self.character_inputs.remove(&key);
        result
    }

    pub fn body(&self, key: BodyKey) -> Option<&Body> {
        self.bodies.get(&key)
    }

    pub fn body_mut(&mut self, key: BodyKey) -> Option<&mut Body> {
        self.bodies.get_mut(&key)
    }

    pub fn bodies(&self) -> impl Iterator<Item = &Body> {
        self.bodies.values()
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Run `apply` on a body with the session services
    pub fn with_body<R>(
        &mut self,
        key: BodyKey,
        apply: impl FnOnce(&mut Body, &mut PhysicsContext<'_>) -> PhysicsResult<R>,
    ) -> PhysicsResult<R> {
        let now = self.clock.now_ms();
        let Some(body) = self.bodies.get_mut(&key) else {
            return Err(PhysicsError::UnknownBody(key));
        };
        let mut ctx = PhysicsContext {
            worlds: &mut self.worlds,
            layers: &self.layers,
            ids: self.ids.as_mut(),
            events: &mut self.events,
            role: self.role,
            now,
        };
        apply(body, &mut ctx)
    }

    // ------------------------------------------------------------ Network

    pub fn register_listener(&mut self, peer: PeerId, character: BodyKey) {
        self.sync_groups.register_listener(peer, character);
    }

    pub fn remove_listener(&mut self, peer: PeerId) {
        self.sync_groups.remove_listener(peer);
    }

    /// Bodies this peer simulates itself
    pub fn set_locally_simulated(&mut self, bodies: impl IntoIterator<Item = BodyKey>) {
        self.locally_simulated = bodies.into_iter().collect();
    }

    pub fn is_locally_simulated(&self, key: BodyKey) -> bool {
        self.role == NetworkRole::Authority || self.locally_simulated.contains(&key)
    }

    pub fn set_character_input(&mut self, key: BodyKey, input: CharacterInput) {
        self.character_inputs.insert(key, input);
    }

    /// Queue a world state to be applied at the start of the next tick
    pub fn set_pending_state(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            self.pending_state = None;
            return;
        }
        self.pending_state = Some(StateRecorder::from_data(data));
    }

    pub fn has_pending_state(&self) -> bool {
        self.pending_state.is_some()
    }

    /// Main world state for a sync group: the group's simulated bodies on
    /// the authority, `None` for the global group. Peers always send the
    /// bodies they simulate.
    pub fn snapshot_custom_data(&mut self, group: Option<SyncGroupId>) -> PhysicsResult<Vec<u8>> {
        let _span = tracing::trace_span!("snapshot_custom_data").entered();

        let filter: Option<&dyn StateRecorderFilter> = match self.role {
            NetworkRole::Authority => match group {
                Some(group) => match self.sync_groups.updated_recorder_filter(group) {
                    Some(filter) => Some(filter),
                    None => return Err(PhysicsError::NotAllowed("unknown sync group")),
                },
                None => None,
            },
            NetworkRole::Peer => {
                self.peer_filter.clear();
                for key in &self.locally_simulated {
                    if let Some(id) = self.bodies.get(key).and_then(Body::id) {
                        self.peer_filter.mark_as_sync(id);
                    }
                }
                Some(&self.peer_filter)
            }
        };

        let mut recorder = StateRecorder::new();
        self.worlds
            .world(MAIN_WORLD)?
            .save_state(&mut recorder, StateRecorderState::CONTACTS, filter);
        Ok(recorder.into_data())
    }

    /// Advance one tick: apply a pending state, move characters, step the
    /// main world and sync transforms, overlaps and net-sync flags
    pub fn process(&mut self, dt: f32) -> PhysicsResult<ContactStats> {
        let _span = tracing::trace_span!("session_process").entered();
        let now = self.clock.now_ms();

        if let Some(mut state) = self.pending_state.take() {
            state.begin_read();
            let world = self.worlds.world_mut(MAIN_WORLD)?;
            if !world.restore_state(&mut state) {
                log::error!("The pending world state could not be restored");
            } else if !state.is_at_end() {
                log::warn!(
                    "The pending world state has {} unread bytes",
                    state.len() - state.read_cursor()
                );
            }
        }

        self.process_characters(dt)?;

        let stats = self.worlds.world_mut(MAIN_WORLD)?.step(dt);

        let bodies = &mut self.bodies;
        self.worlds
            .world_mut(MAIN_WORLD)?
            .sync_transforms(false, &mut self.events, |key, transform| {
                if let Some(body) = bodies.get_mut(&key) {
                    body.apply_synced_transform(transform);
                }
            });

        for (key, body) in self.bodies.iter_mut() {
            let simulated = self.role == NetworkRole::Authority || self.locally_simulated.contains(key);
            body.update_net_sync(self.role, now, simulated, &mut self.events);
        }

        if self.role == NetworkRole::Authority {
            self.update_relevancy();
        }
        Ok(stats)
    }

    fn process_characters(&mut self, dt: f32) -> PhysicsResult<()> {
        let gravity = self.worlds.world(MAIN_WORLD)?.gravity().y.abs();
        let characters: Vec<BodyKey> = self
            .bodies
            .values()
            .filter(|body| body.is_character() && body.world() == MAIN_WORLD)
            .map(Body::key)
            .filter(|key| self.is_locally_simulated(*key))
            .collect();

        for key in characters {
            let input = self.character_inputs.get(&key).copied().unwrap_or_default();
            self.with_body(key, |body, ctx| body.process_character(ctx, dt, input, gravity))?;
        }
        Ok(())
    }

    /// Recompute sync groups against the main world
    pub fn update_relevancy(&mut self) {
        let now = self.clock.now_ms();
        let world = self.worlds.main();
        self.sync_groups.update(world, &mut self.bodies, now);
    }

    // ------------------------------------------------------------ Interactions

    /// Serialize and clear the interactions a character queued
    pub fn take_interaction_buffer(&mut self, character: BodyKey) -> PhysicsResult<Vec<u8>> {
        let Some(body) = self.bodies.get_mut(&character) else {
            return Err(PhysicsError::UnknownBody(character));
        };
        let Some(controller) = body.character_controller_mut() else {
            return Err(PhysicsError::NotAllowed("only characters queue interactions"));
        };
        let mut buffer = StateRecorder::new();
        controller.write_pending_interactions_to_buffer(&mut buffer);
        Ok(buffer.into_data())
    }

    /// Invoke every interaction of a buffer against the body table
    pub fn execute_interactions(&mut self, buffer: &[u8]) -> PhysicsResult<usize> {
        let mut recorder = StateRecorder::from_data(buffer.to_vec());
        let bodies = &self.bodies;
        let events = &mut self.events;
        execute_interactions(&mut recorder, |interaction| {
            let Some(target) = bodies.get(&interaction.target) else {
                return Err(PhysicsError::UnknownBody(interaction.target));
            };
            target.call_interaction(interaction.interaction_id, &interaction.argument, events)
        })
    }

    // ------------------------------------------------------------ Events

    pub fn drain_events(&mut self) -> Vec<BodyEvent> {
        self.events.drain()
    }

    pub fn pending_event_count(&self) -> usize {
        self.events.len()
    }

    /// Destroy every body, keeping the session services
    pub fn clear(&mut self) -> PhysicsResult<()> {
        let keys: Vec<BodyKey> = self.bodies.keys().copied().collect();
        for key in keys {
            self.remove_body(key)?;
        }
        self.sync_groups.clear();
        self.pending_state = None;
        self.ids.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyMode;
    use crate::character::CharacterSettings;
    use crate::config::WorldSettings;
    use crate::shape::{Shape, ShapeDesc};
    use glam::{Vec2, Vec3};
    use lattice_core::{ManualClock, Transform};

    fn session(role: NetworkRole) -> (PhysicsSession, Arc<ManualClock>) {
        let config = SessionConfig {
            world: WorldSettings {
                worker_threads: Some(1),
                ..WorldSettings::default()
            },
            ..SessionConfig::default()
        };
        let clock = Arc::new(ManualClock::new(0));
        let session = PhysicsSession::with_clock(&config, role, clock.clone()).unwrap();
        (session, clock)
    }

    fn add_crate(session: &mut PhysicsSession, position: Vec3) -> BodyKey {
        let key = session.next_body_key();
        session
            .add_body(
                Body::new(key)
                    .with_layer("DYNAMIC")
                    .with_mode(BodyMode::Dynamic)
                    .with_shape(Shape::new(ShapeDesc::cube(1.0)))
                    .with_transform(Transform::from_position(position)),
            )
            .unwrap()
    }

    #[test]
    fn test_dynamic_body_falls() {
        let (mut session, _) = session(NetworkRole::Authority);
        let key = add_crate(&mut session, Vec3::new(0.0, 10.0, 0.0));

        session.process(1.0 / 60.0).unwrap();
        let body = session.body(key).unwrap();
        assert!(body.transform().position.y < 10.0);
        assert!(!body.is_sleeping(session.worlds()));

        let events = session.drain_events();
        assert!(matches!(events[0], BodyEvent::BodyCreated { .. }));
        assert!(events.contains(&BodyEvent::StartUpdating { body: key }));
    }

    fn add_sensor(session: &mut PhysicsSession, position: Vec3) -> BodyKey {
        let key = session.next_body_key();
        session
            .add_body(
                Body::new(key)
                    .with_layer("TRIGGER")
                    .with_mode(BodyMode::Sensor)
                    .with_shape(Shape::new(ShapeDesc::cube(4.0)))
                    .with_transform(Transform::from_position(position)),
            )
            .unwrap()
    }

    fn overlap_count(data: Vec<u8>) -> u32 {
        let mut recorder = StateRecorder::from_data(data);
        assert_eq!(recorder.read_value::<u8>(), Some(StateRecorderState::CONTACTS.bits()));
        recorder.read_value::<u32>().unwrap()
    }

    #[test]
    fn test_group_snapshot_only_carries_simulated_bodies() {
        let (mut session, _) = session(NetworkRole::Authority);
        let player = session.next_body_key();
        session
            .add_body(
                Body::character(player, CharacterSettings::default())
                    .with_shape(Shape::new(ShapeDesc::capsule())),
            )
            .unwrap();
        add_crate(&mut session, Vec3::new(5.0, 0.0, 0.0));
        add_sensor(&mut session, Vec3::new(5.0, 0.0, 0.0));
        add_crate(&mut session, Vec3::new(500.0, 0.0, 0.0));
        add_sensor(&mut session, Vec3::new(500.0, 0.0, 0.0));
        session.register_listener(1, player);
        session.process(1.0 / 60.0).unwrap();

        let group = session.sync_groups().group_of_peer(1).unwrap();
        let filtered = session.snapshot_custom_data(Some(group)).unwrap();
        let global = session.snapshot_custom_data(None).unwrap();
        assert_eq!(overlap_count(filtered), 1);
        assert_eq!(overlap_count(global.clone()), 2);

        let world = session.worlds().main();
        assert!(world.validate_state(&mut StateRecorder::from_data(global)));
    }

    #[test]
    fn test_unknown_group_is_rejected() {
        let (mut session, _) = session(NetworkRole::Authority);
        assert!(session.snapshot_custom_data(Some(3)).is_err());
    }

    #[test]
    fn test_pending_state_applied_next_tick() {
        let (mut authority, _) = session(NetworkRole::Authority);
        let key = add_crate(&mut authority, Vec3::new(0.0, 10.0, 0.0));
        authority.process(1.0 / 60.0).unwrap();

        let mut full = StateRecorder::new();
        authority
            .worlds()
            .main()
            .save_state(&mut full, StateRecorderState::ALL, None);

        let (mut peer, _) = session(NetworkRole::Peer);
        let mirror = add_crate(&mut peer, Vec3::new(0.0, 10.0, 0.0));
        assert_eq!(key, mirror);

        peer.set_pending_state(full.into_data());
        assert!(peer.has_pending_state());
        peer.process(1.0 / 600.0).unwrap();
        assert!(!peer.has_pending_state());

        let expected = authority.body(key).unwrap().transform().position;
        let actual = peer.body(mirror).unwrap().transform().position;
        assert!((expected - actual).length() < 1e-2);
    }

    #[test]
    fn test_peer_snapshot_uses_locally_simulated_bodies() {
        let (mut peer, _) = session(NetworkRole::Peer);
        let mine = add_crate(&mut peer, Vec3::ZERO);
        add_sensor(&mut peer, Vec3::ZERO);
        add_crate(&mut peer, Vec3::new(50.0, 0.0, 0.0));
        add_sensor(&mut peer, Vec3::new(50.0, 0.0, 0.0));
        peer.process(1.0 / 60.0).unwrap();

        assert_eq!(overlap_count(peer.snapshot_custom_data(None).unwrap()), 0);
        peer.set_locally_simulated([mine]);
        assert_eq!(overlap_count(peer.snapshot_custom_data(None).unwrap()), 1);
        assert!(peer.is_locally_simulated(mine));
    }

    #[test]
    fn test_peer_stops_updating_without_states() {
        let (mut peer, clock) = session(NetworkRole::Peer);
        let key = add_crate(&mut peer, Vec3::ZERO);
        peer.with_body(key, |body, ctx| {
            body.notify_received_net_sync_update(ctx.now);
            Ok(())
        })
        .unwrap();

        peer.process(1.0 / 60.0).unwrap();
        assert!(peer.body(key).unwrap().is_net_sync_updating());

        clock.advance(11_000);
        peer.process(1.0 / 60.0).unwrap();
        assert!(!peer.body(key).unwrap().is_net_sync_updating());
        assert!(peer.drain_events().contains(&BodyEvent::StopUpdating { body: key }));
    }

    #[test]
    fn test_character_interactions_roundtrip() {
        let (mut session, _) = session(NetworkRole::Authority);
        let player = session.next_body_key();
        session
            .add_body(Body::character(player, CharacterSettings::default()))
            .unwrap();
        let door_key = session.next_body_key();
        let mut door = Body::new(door_key);
        door.register_interaction("open");
        session.add_body(door).unwrap();

        let door = session.body(door_key).unwrap().clone();
        session
            .body_mut(player)
            .unwrap()
            .queue_interaction(&door, "open", vec![7])
            .unwrap();

        let buffer = session.take_interaction_buffer(player).unwrap();
        assert_eq!(session.execute_interactions(&buffer).unwrap(), 1);
        assert!(session.drain_events().contains(&BodyEvent::InteractionCalled {
            body: door_key,
            interaction: "open".to_string(),
            argument: vec![7],
        }));

        let empty = session.take_interaction_buffer(player).unwrap();
        assert_eq!(session.execute_interactions(&empty).unwrap(), 0);
    }

    #[test]
    fn test_character_moves_with_input() {
        let (mut session, _) = session(NetworkRole::Authority);
        let ground = session.next_body_key();
        session
            .add_body(
                Body::new(ground)
                    .with_layer("STATIC")
                    .with_shape(Shape::new(ShapeDesc::Box {
                        size: Vec3::new(100.0, 1.0, 100.0),
                    }))
                    .with_transform(Transform::from_position(Vec3::new(0.0, -0.5, 0.0))),
            )
            .unwrap();
        let player = session.next_body_key();
        session
            .add_body(
                Body::character(player, CharacterSettings::default())
                    .with_shape(Shape::new(ShapeDesc::capsule()))
                    .with_transform(Transform::from_position(Vec3::new(0.0, 1.1, 0.0))),
            )
            .unwrap();
        session.worlds_mut().main_mut().optimize_broadphase();

        session.set_character_input(
            player,
            CharacterInput {
                move_direction: Vec2::new(1.0, 0.0),
                ..CharacterInput::default()
            },
        );
        for _ in 0..30 {
            session.process(1.0 / 60.0).unwrap();
        }
        assert!(session.body(player).unwrap().transform().position.x > 0.5);
    }

    #[test]
    fn test_remove_and_clear() {
        let (mut session, _) = session(NetworkRole::Authority);
        let a = add_crate(&mut session, Vec3::ZERO);
        add_crate(&mut session, Vec3::X * 3.0);
        session.remove_body(a).unwrap();
        assert_eq!(session.body_count(), 1);
        assert!(matches!(session.remove_body(a), Err(PhysicsError::UnknownBody(_))));

        session.clear().unwrap();
        assert_eq!(session.body_count(), 0);
        assert_eq!(session.worlds().main().body_count(), 0);
    }
}
