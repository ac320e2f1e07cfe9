//! Spatial sync groups
//!
//! Listeners (one per connected peer, anchored on its character) are
//! clustered by distance. Every cluster owns a sync group, and each tick
//! every body in the scene is classified against every group as
//! simulated, trickled at some rate, or not synced at all.
//!
//! Classification order:
//! - a body a listener of the group is selecting is simulated
//! - NPCs are never simulated and trickle like characters
//! - characters and moving bodies inside the relevancy radius are simulated
//! - bodies simulated within the timeout stay simulated
//! - anything else goes through [`compute_update_rate`]

use ahash::{AHashMap, AHashSet};
use glam::Vec3;
use indexmap::IndexMap;
use lattice_core::Millis;
use lattice_core::math::lerp;
use smallvec::SmallVec;

use crate::body::Body;
use crate::body_id::{BodyId, BodyKey};
use crate::config::SyncGroupSettings;
use crate::layers::ObjectLayerFilter;
use crate::state_filter::SyncStateFilter;
use crate::world::PhysicsWorld;

/// Network peer
pub type PeerId = u32;

/// Index of a sync group
pub type SyncGroupId = u32;

/// A peer listening to the scene through its character
#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub peer: PeerId,
    pub character: BodyKey,
    group: Option<SyncGroupId>,
}

impl Listener {
    pub fn group(&self) -> Option<SyncGroupId> {
        self.group
    }
}

/// Body synced at full fidelity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedBody {
    pub body: BodyKey,
    pub id: BodyId,
}

/// Body synced at a reduced rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrickledBody {
    pub body: BodyKey,
    /// 0..=1, fraction of the full update frequency
    pub update_rate: f32,
}

/// Per-group relevancy state
#[derive(Debug, Clone, Default)]
pub struct SyncGroupMetadata {
    id: SyncGroupId,
    listeners: SmallVec<[PeerId; 4]>,
    origin: Vec3,
    relevancy_radius: f32,
    simulated_since: AHashMap<BodyKey, Millis>,
    recorder_filter: SyncStateFilter,
    simulated: Vec<SimulatedBody>,
    trickled: Vec<TrickledBody>,
    realtime_changed: bool,
}

impl SyncGroupMetadata {
    fn new(id: SyncGroupId) -> Self {
        Self {
            id,
            relevancy_radius: 1.0,
            ..Self::default()
        }
    }

    pub fn id(&self) -> SyncGroupId {
        self.id
    }

    pub fn listeners(&self) -> &[PeerId] {
        &self.listeners
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Centroid of the listeners
    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn relevancy_radius(&self) -> f32 {
        self.relevancy_radius
    }

    pub fn simulated(&self) -> &[SimulatedBody] {
        &self.simulated
    }

    pub fn trickled(&self) -> &[TrickledBody] {
        &self.trickled
    }

    pub fn is_simulated(&self, body: BodyKey) -> bool {
        self.simulated.iter().any(|simulated| simulated.body == body)
    }

    pub fn trickle_rate(&self, body: BodyKey) -> Option<f32> {
        self.trickled
            .iter()
            .find(|trickled| trickled.body == body)
            .map(|trickled| trickled.update_rate)
    }

    /// Whether the simulated set changed since the filter was last built
    pub fn is_realtime_changed(&self) -> bool {
        self.realtime_changed
    }

    fn replace_bodies(&mut self, simulated: Vec<SimulatedBody>, trickled: Vec<TrickledBody>) {
        if simulated != self.simulated {
            self.realtime_changed = true;
        }
        self.simulated = simulated;
        self.trickled = trickled;
    }
}

/// Everything the rate function needs to know about a non-simulated body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrickleInput {
    pub is_static_or_sensor: bool,
    /// The group hasn't received this static body since it last changed
    pub needs_static_update: bool,
    pub selected: bool,
    /// Bounds diagonal over distance to the group origin
    pub size_over_distance: f32,
    pub sleeping: bool,
    /// Time since the body left the simulated set, `Millis::MAX` if never
    pub since_simulated_ms: Millis,
    pub is_character: bool,
}

/// Bounds diagonal over distance to the group origin. A body sitting on
/// the origin yields a large ratio, never NaN.
pub fn size_over_distance(size: f32, origin: Vec3, position: Vec3) -> f32 {
    size / origin.distance(position).max(f32::EPSILON)
}

/// Trickle rate of a non-simulated body; `None` drops it from sync.
///
/// Dropping below `trickled_size_over_distance_stop_sync` wins over a peer
/// selection, so a selected speck is still not sent.
pub fn compute_update_rate(settings: &SyncGroupSettings, input: &TrickleInput) -> Option<f32> {
    if input.is_static_or_sensor {
        return if input.needs_static_update {
            Some(1.0)
        } else if input.selected {
            Some(0.0)
        } else {
            None
        };
    }

    if input.size_over_distance <= settings.trickled_size_over_distance_stop_sync {
        return None;
    }
    if input.selected {
        return Some(settings.trickled_high_precision_rate);
    }
    if input.size_over_distance <= settings.trickled_size_over_distance_min || input.sleeping {
        return Some(settings.deferred_relevancy_low_rate);
    }

    let timeout = if input.is_character {
        settings.simulated_character_timeout_ms
    } else {
        settings.simulated_timeout_ms
    };
    if input.since_simulated_ms < timeout.saturating_add(settings.trickled_high_precision_timeout_ms) {
        return Some(settings.trickled_high_precision_rate);
    }

    let min = settings.trickled_size_over_distance_min;
    let max = settings.trickled_size_over_distance_max;
    let alpha = (input.size_over_distance - min).clamp(0.0, max - min) / (max - min);
    let rate = lerp(
        settings.deferred_relevancy_min_rate,
        settings.deferred_relevancy_max_rate,
        alpha,
    );
    if input.is_character {
        Some(rate.max(settings.character_min_trickle_rate))
    } else {
        Some(rate)
    }
}

/// Single-link clustering: two positions within `threshold` share a
/// cluster, transitively. Returns clusters of indices in discovery order.
pub fn cluster(positions: &[Vec3], threshold: f32) -> Vec<Vec<usize>> {
    let mut ungrouped: Vec<usize> = (0..positions.len()).collect();
    let mut clusters = Vec::new();

    while !ungrouped.is_empty() {
        let mut members = vec![ungrouped.remove(0)];
        let mut cursor = 0;
        while cursor < members.len() {
            let anchor = positions[members[cursor]];
            let mut i = 0;
            while i < ungrouped.len() {
                if positions[ungrouped[i]].distance(anchor) <= threshold {
                    members.push(ungrouped.remove(i));
                } else {
                    i += 1;
                }
            }
            cursor += 1;
        }
        clusters.push(members);
    }
    clusters
}

/// Owner of the listeners and their sync groups
#[derive(Debug, Clone, Default)]
pub struct SpatialSyncGroups {
    settings: SyncGroupSettings,
    listeners: Vec<Listener>,
    groups: Vec<SyncGroupMetadata>,
}

impl SpatialSyncGroups {
    pub fn new(settings: SyncGroupSettings) -> Self {
        Self {
            settings,
            listeners: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn settings(&self) -> &SyncGroupSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: SyncGroupSettings) {
        self.settings = settings;
    }

    pub fn register_listener(&mut self, peer: PeerId, character: BodyKey) {
        if let Some(listener) = self.listeners.iter_mut().find(|l| l.peer == peer) {
            listener.character = character;
            return;
        }
        self.listeners.push(Listener {
            peer,
            character,
            group: None,
        });
    }

    pub fn remove_listener(&mut self, peer: PeerId) {
        let Some(index) = self.listeners.iter().position(|l| l.peer == peer) else {
            return;
        };
        let listener = self.listeners.remove(index);
        if let Some(group) = listener.group.and_then(|g| self.groups.get_mut(g as usize)) {
            group.listeners.retain(|p| *p != peer);
        }
    }

    /// Forget a body: drops the listener it anchors and its timestamps
    pub fn remove_body(&mut self, body: BodyKey) {
        let peers: Vec<PeerId> = self
            .listeners
            .iter()
            .filter(|l| l.character == body)
            .map(|l| l.peer)
            .collect();
        for peer in peers {
            self.remove_listener(peer);
        }
        for group in &mut self.groups {
            group.simulated_since.remove(&body);
        }
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn groups(&self) -> &[SyncGroupMetadata] {
        &self.groups
    }

    pub fn group(&self, id: SyncGroupId) -> Option<&SyncGroupMetadata> {
        self.groups.get(id as usize)
    }

    pub fn group_of_peer(&self, peer: PeerId) -> Option<SyncGroupId> {
        self.listeners.iter().find(|l| l.peer == peer)?.group
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        for listener in &mut self.listeners {
            listener.group = None;
        }
    }

    /// Recluster the listeners, then reclassify every body for every
    /// group with listeners
    pub fn update(&mut self, world: &PhysicsWorld, bodies: &mut IndexMap<BodyKey, Body>, now: Millis) {
        let _span = tracing::trace_span!("sync_groups_update").entered();

        self.update_listeners(bodies);
        for index in 0..self.groups.len() {
            if self.groups[index].is_empty() {
                continue;
            }
            self.update_group_origin(index, bodies);
            self.update_group_bodies(index, world, bodies, now);
        }
    }

    fn listener_position(bodies: &IndexMap<BodyKey, Body>, listener: &Listener) -> Vec3 {
        bodies
            .get(&listener.character)
            .map(|body| body.transform().position)
            .unwrap_or(Vec3::ZERO)
    }

    fn update_listeners(&mut self, bodies: &IndexMap<BodyKey, Body>) {
        let positions: Vec<Vec3> = self
            .listeners
            .iter()
            .map(|listener| Self::listener_position(bodies, listener))
            .collect();
        let clusters = cluster(&positions, self.settings.character_group_threshold_distance);

        while self.groups.len() < clusters.len() {
            let id = self.groups.len() as SyncGroupId;
            log::debug!("Created sync group {}", id);
            self.groups.push(SyncGroupMetadata::new(id));
        }

        for (group, members) in clusters.iter().enumerate() {
            for member in members {
                self.assign_listener(*member, group as SyncGroupId);
            }
        }
    }

    fn assign_listener(&mut self, listener: usize, group: SyncGroupId) {
        let peer = self.listeners[listener].peer;
        if self.groups[group as usize].listeners.contains(&peer) {
            return;
        }
        if let Some(previous) = self.listeners[listener].group {
            if let Some(previous) = self.groups.get_mut(previous as usize) {
                previous.listeners.retain(|p| *p != peer);
            }
        }
        self.groups[group as usize].listeners.push(peer);
        self.listeners[listener].group = Some(group);
        log::trace!("Peer {} moved to sync group {}", peer, group);
    }

    fn update_group_origin(&mut self, index: usize, bodies: &IndexMap<BodyKey, Body>) {
        let positions: SmallVec<[Vec3; 8]> = self.groups[index]
            .listeners
            .iter()
            .filter_map(|peer| self.listeners.iter().find(|l| l.peer == *peer))
            .map(|listener| Self::listener_position(bodies, listener))
            .collect();
        if positions.is_empty() {
            return;
        }

        let origin = positions.iter().copied().sum::<Vec3>() / positions.len() as f32;
        let spread = positions
            .iter()
            .map(|position| position.distance(origin))
            .fold(0.0_f32, f32::max);

        let group = &mut self.groups[index];
        group.origin = origin;
        group.relevancy_radius = spread + self.settings.physics_simulation_radius;
    }

    fn update_group_bodies(
        &mut self,
        index: usize,
        world: &PhysicsWorld,
        bodies: &mut IndexMap<BodyKey, Body>,
        now: Millis,
    ) {
        let settings = &self.settings;
        let group = &mut self.groups[index];
        let in_radius: AHashSet<BodyId> = world
            .bodies_in_sphere(group.origin, group.relevancy_radius, &ObjectLayerFilter::all(), &[])
            .into_iter()
            .collect();

        let mut simulated = Vec::with_capacity(in_radius.len());
        let mut trickled = Vec::new();

        for (key, body) in bodies.iter_mut() {
            let Some(id) = body.id() else {
                continue;
            };
            if body.world() != world.id() {
                continue;
            }

            let mut is_character = body.is_character();
            let mut since_simulated = 0;
            let selected_here = body
                .selected_by_peers()
                .iter()
                .any(|peer| group.listeners.contains(peer));

            let is_simulated = if selected_here {
                group.simulated_since.insert(*key, now);
                true
            } else if body.is_npc() {
                is_character = true;
                false
            } else if in_radius.contains(&id)
                && (is_character || (!body.is_static() && !body.is_sensor()))
            {
                group.simulated_since.insert(*key, now);
                true
            } else {
                since_simulated = group
                    .simulated_since
                    .get(key)
                    .map_or(Millis::MAX, |since| now.saturating_sub(*since));
                let timeout = if is_character {
                    settings.simulated_character_timeout_ms
                } else {
                    settings.simulated_timeout_ms
                };
                since_simulated < timeout
            };

            if is_simulated {
                simulated.push(SimulatedBody { body: *key, id });
                continue;
            }

            let is_static_or_sensor = body.is_static() || body.is_sensor();
            let needs_static_update =
                is_static_or_sensor && body.static_sync_group_needs_update(group.id);
            let size_over_distance = if is_static_or_sensor {
                0.0
            } else {
                let size = world.body_aabb(id).map_or(0.0, |aabb| aabb.diagonal());
                size_over_distance(size, group.origin, body.transform().position)
            };

            let input = TrickleInput {
                is_static_or_sensor,
                needs_static_update,
                selected: body.is_selected(),
                size_over_distance,
                sleeping: world.is_sleeping(id),
                since_simulated_ms: since_simulated,
                is_character,
            };
            if let Some(update_rate) = compute_update_rate(settings, &input) {
                trickled.push(TrickledBody {
                    body: *key,
                    update_rate,
                });
            }
        }

        group.replace_bodies(simulated, trickled);
    }

    /// Recorder filter of a group's simulated bodies, rebuilt only when
    /// the simulated set changed
    pub fn updated_recorder_filter(&mut self, id: SyncGroupId) -> Option<&SyncStateFilter> {
        let Some(group) = self.groups.get_mut(id as usize) else {
            log::error!("The sync group {} has no metadata", id);
            return None;
        };
        if group.realtime_changed {
            group.recorder_filter.clear();
            for simulated in &group.simulated {
                group.recorder_filter.mark_as_sync(simulated.id);
            }
            group.realtime_changed = false;
        }
        Some(&group.recorder_filter)
    }
}
