//! World snapshots
//!
//! Save/restore of world state through a [`StateRecorder`].
//!
//! Layout:
//! - `[mode: u8]`
//! - GLOBAL: `[gravity: Vec3]`
//! - BODIES: `[count: u32]` then per body `[id: u32][BodyState]`
//! - CONTACTS: `[count: u32]` then per sensor `[sensor id: u32][records: u32]`
//!   then per record `[other id: u32][status: u8]`
//!
//! Restores mirror the save path: every read starts from the value the
//! save would have written, so a validating recorder compares the buffer
//! against the live world without touching it.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::body_id::{BodyId, BodyKey};
use crate::contact_listener::{OverlapStatus, SensorOverlap};
use crate::convert::{from_isometry, from_vector, to_isometry, to_vector};
use crate::recorder::StateRecorder;
use crate::state_filter::{StateRecorderFilter, StateRecorderState};
use crate::world::PhysicsWorld;

/// Encoded sizes of the fixed-width snapshot records
const BODY_RECORD_BYTES: usize = 4 + 12 + 16 + 12 + 12 + 1;
const SENSOR_HEADER_BYTES: usize = 4 + 4;
const OVERLAP_RECORD_BYTES: usize = 4 + 1;

/// False when `count` records of `size` bytes can't fit in what is left to read
fn fits_remaining(recorder: &StateRecorder, count: u32, size: usize) -> bool {
    let remaining = recorder.len().saturating_sub(recorder.read_cursor());
    (count as usize).saturating_mul(size) <= remaining
}

/// Engine state of one body
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyState {
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub sleeping: bool,
}

impl Default for BodyState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            sleeping: false,
        }
    }
}

impl PhysicsWorld {
    /// Current engine state of a body
    pub fn body_state(&self, id: BodyId) -> Option<BodyState> {
        let body = self.engine_body(id)?;
        let (position, rotation) = from_isometry(body.position());
        Some(BodyState {
            position,
            rotation,
            linear_velocity: from_vector(body.linvel()),
            angular_velocity: from_vector(body.angvel()),
            sleeping: body.is_sleeping(),
        })
    }

    /// Overwrite the engine state of a body
    pub fn apply_body_state(&mut self, id: BodyId, state: &BodyState) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let (body_handle, collider_handle) = (entry.body, entry.collider);
        let iso = to_isometry(state.position, state.rotation);

        let Some(body) = self.bodies.get_mut(body_handle) else {
            return false;
        };
        body.set_position(iso, false);
        body.set_linvel(to_vector(state.linear_velocity), false);
        body.set_angvel(to_vector(state.angular_velocity), false);
        if state.sleeping {
            body.sleep();
        } else if !body.is_fixed() {
            body.wake_up(true);
        }
        if let Some(collider) = self.colliders.get_mut(collider_handle) {
            collider.set_position(iso);
        }
        true
    }

    /// Append the state of one body
    pub fn body_save_state(&self, id: BodyId, recorder: &mut StateRecorder) -> bool {
        let Some(state) = self.body_state(id) else {
            return false;
        };
        recorder.write(&state);
        true
    }

    /// Read the state of one body; only applied outside validating mode
    pub fn body_restore_state(&mut self, id: BodyId, recorder: &mut StateRecorder) -> bool {
        let mut state = self.body_state(id).unwrap_or_default();
        if !recorder.read(&mut state) {
            return false;
        }
        if recorder.is_validating() {
            return true;
        }
        self.apply_body_state(id, &state)
    }

    fn saved_bodies(&self, filter: Option<&dyn StateRecorderFilter>) -> Vec<BodyId> {
        self.body_ids()
            .filter(|id| filter.is_none_or(|f| f.should_save_body(*id)))
            .collect()
    }

    fn saved_overlaps(
        &self,
        filter: Option<&dyn StateRecorderFilter>,
    ) -> Vec<(BodyId, Vec<SensorOverlap>)> {
        self.sensors
            .iter()
            .filter_map(|sensor| {
                let records: Vec<SensorOverlap> = self
                    .contact_listener
                    .overlaps()
                    .records(*sensor)
                    .into_iter()
                    .filter(|record| {
                        filter.is_none_or(|f| f.should_save_contact(*sensor, record.other_id))
                    })
                    .collect();
                (!records.is_empty()).then_some((*sensor, records))
            })
            .collect()
    }

    /// Serialize the world. With a filter only the bodies and contacts it
    /// admits are written.
    pub fn save_state(
        &self,
        recorder: &mut StateRecorder,
        mode: StateRecorderState,
        filter: Option<&dyn StateRecorderFilter>,
    ) {
        let _span = tracing::trace_span!("save_state", world = self.id()).entered();

        recorder.write(&mode.bits());

        if mode.contains(StateRecorderState::GLOBAL) {
            recorder.write(&self.gravity());
        }

        if mode.contains(StateRecorderState::BODIES) {
            let bodies = self.saved_bodies(filter);
            recorder.write(&(bodies.len() as u32));
            for id in bodies {
                recorder.write(&id.raw());
                self.body_save_state(id, recorder);
            }
        }

        if mode.contains(StateRecorderState::CONTACTS) {
            let overlaps = self.saved_overlaps(filter);
            recorder.write(&(overlaps.len() as u32));
            for (sensor, records) in overlaps {
                recorder.write(&sensor.raw());
                recorder.write(&(records.len() as u32));
                for record in records {
                    recorder.write(&record.other_id.raw());
                    recorder.write(&(record.status as u8));
                }
            }
        }

        #[cfg(debug_assertions)]
        if filter.is_none() {
            let mut check = StateRecorder::from_data(recorder.data().to_vec());
            check.set_validating(true);
            self.validate_state(&mut check);
            debug_assert!(
                !check.is_failed(),
                "World {} snapshot does not round trip",
                self.id()
            );
        }
    }

    /// Compare a snapshot against the live world without applying it
    pub fn validate_state(&self, recorder: &mut StateRecorder) -> bool {
        let validating = recorder.is_validating();
        recorder.set_validating(true);
        recorder.begin_read();
        let decoded = self.decode_state(recorder);
        recorder.set_validating(validating);
        decoded.is_some() && !recorder.is_failed()
    }

    /// Read a snapshot and apply it, unless the recorder is validating.
    ///
    /// Bodies missing from this world are logged and skipped. A buffer that
    /// is truncated, claims more records than it holds or carries an unknown
    /// overlap status is rejected before anything is applied.
    pub fn restore_state(&mut self, recorder: &mut StateRecorder) -> bool {
        let _span = tracing::trace_span!("restore_state", world = self.id()).entered();

        let Some(decoded) = self.decode_state(recorder) else {
            return false;
        };
        if recorder.is_validating() {
            return true;
        }

        if let Some(gravity) = decoded.gravity {
            self.set_gravity(gravity);
        }
        for (id, state) in &decoded.bodies {
            self.apply_body_state(*id, state);
        }
        if let Some(overlaps) = decoded.overlaps {
            let resolve = |id: BodyId| self.owner_of(id);
            let lists: Vec<(BodyId, Vec<SensorOverlap>)> = overlaps
                .into_iter()
                .filter_map(|(sensor, records)| {
                    let sensor = self.id_at_index(sensor.index())?;
                    let records = records
                        .into_iter()
                        .map(|(other_id, status)| SensorOverlap {
                            other: resolve(other_id).unwrap_or(BodyKey(u32::MAX)),
                            other_id,
                            status,
                        })
                        .collect();
                    Some((sensor, records))
                })
                .collect();
            self.contact_listener.overlaps().clear();
            for (sensor, records) in lists {
                self.contact_listener.overlaps().set_records(sensor, records);
            }
        }

        if !recorder.is_at_end() {
            log::warn!(
                "World {} restore left {} unread bytes",
                self.id(),
                recorder.len() - recorder.read_cursor()
            );
        }
        true
    }

    fn decode_state(&self, recorder: &mut StateRecorder) -> Option<DecodedState> {
        let mut decoded = DecodedState::default();

        let mut mode_bits = StateRecorderState::ALL.bits();
        if let Some(&first) = recorder.data().get(recorder.read_cursor()) {
            // The mode byte is the one thing the live world can't predict.
            mode_bits = first;
        }
        if !recorder.read(&mut mode_bits) {
            return None;
        }
        let mode = StateRecorderState::from_bits_truncate(mode_bits);

        if mode.contains(StateRecorderState::GLOBAL) {
            let mut gravity = self.gravity();
            if !recorder.read(&mut gravity) {
                return None;
            }
            decoded.gravity = Some(gravity);
        }

        if mode.contains(StateRecorderState::BODIES) {
            let expected = self.saved_bodies(None);
            let mut count = expected.len() as u32;
            if !recorder.read(&mut count) {
                return None;
            }
            if !fits_remaining(recorder, count, BODY_RECORD_BYTES) {
                log::error!("World {}: snapshot claims {} bodies past its end", self.id(), count);
                return None;
            }
            for i in 0..count as usize {
                let mut raw = expected.get(i).map(|id| id.raw()).unwrap_or(u32::MAX);
                if !recorder.read(&mut raw) {
                    return None;
                }
                let saved = BodyId::from_raw(raw);
                let local = self.id_at_index(saved.index());

                let mut state = local
                    .and_then(|id| self.body_state(id))
                    .unwrap_or_default();
                if !recorder.read(&mut state) {
                    return None;
                }
                match local {
                    Some(id) => decoded.bodies.push((id, state)),
                    None => log::warn!(
                        "World {}: snapshot body {:?} does not exist here",
                        self.id(),
                        saved
                    ),
                }
            }
        }

        if mode.contains(StateRecorderState::CONTACTS) {
            let expected = self.saved_overlaps(None);
            let mut count = expected.len() as u32;
            if !recorder.read(&mut count) {
                return None;
            }
            if !fits_remaining(recorder, count, SENSOR_HEADER_BYTES) {
                log::error!("World {}: snapshot claims {} sensors past its end", self.id(), count);
                return None;
            }
            let mut overlaps = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                let current = expected.get(i);
                let mut sensor_raw = current.map(|(id, _)| id.raw()).unwrap_or(u32::MAX);
                let mut records_count = current.map(|(_, r)| r.len() as u32).unwrap_or(0);
                if !recorder.read(&mut sensor_raw) || !recorder.read(&mut records_count) {
                    return None;
                }
                if !fits_remaining(recorder, records_count, OVERLAP_RECORD_BYTES) {
                    log::error!(
                        "World {}: sensor {:?} claims {} overlaps past the snapshot end",
                        self.id(),
                        BodyId::from_raw(sensor_raw),
                        records_count
                    );
                    return None;
                }

                let mut records = Vec::with_capacity(records_count as usize);
                for j in 0..records_count as usize {
                    let record = current.and_then(|(_, r)| r.get(j));
                    let mut other_raw = record.map(|r| r.other_id.raw()).unwrap_or(u32::MAX);
                    let mut status = record.map(|r| r.status as u8).unwrap_or(0);
                    if !recorder.read(&mut other_raw) || !recorder.read(&mut status) {
                        return None;
                    }
                    let Some(status) = OverlapStatus::from_u8(status) else {
                        log::error!("World {}: unknown overlap status {}", self.id(), status);
                        return None;
                    };
                    records.push((BodyId::from_raw(other_raw), status));
                }
                overlaps.push((BodyId::from_raw(sensor_raw), records));
            }
            decoded.overlaps = Some(overlaps);
        }

        Some(decoded)
    }
}

#[derive(Debug, Default)]
struct DecodedState {
    gravity: Option<Vec3>,
    bodies: Vec<(BodyId, BodyState)>,
    overlaps: Option<Vec<(BodyId, Vec<(BodyId, OverlapStatus)>)>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyMode;
    use crate::body_id::BodyIdManager;
    use crate::config::WorldSettings;
    use crate::events::EventQueue;
    use crate::layers::LayerTable;
    use crate::shape::{Shape, ShapeDesc};
    use crate::state_filter::SyncStateFilter;
    use crate::world::BodyCreateInfo;
    use lattice_core::Transform;

    fn world_with_bodies(count: u32) -> (PhysicsWorld, Vec<BodyId>) {
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
        let bodies = (0..count)
            .map(|i| {
                let info = BodyCreateInfo::new(
                    BodyKey(i + 1),
                    Shape::new(ShapeDesc::cube(1.0)),
                    Transform::from_position(Vec3::new(i as f32 * 3.0, 5.0, 0.0)),
                )
                .with_layer("DYNAMIC")
                .with_mode(BodyMode::Dynamic);
                world.create_body(&layers, &mut ids, &info).unwrap()
            })
            .collect();
        (world, bodies)
    }

    #[test]
    fn test_save_then_validate_never_fails() {
        let (mut world, _) = world_with_bodies(3);
        world.step(1.0 / 60.0);

        let mut recorder = StateRecorder::new();
        world.save_state(&mut recorder, StateRecorderState::ALL, None);

        recorder.begin_read();
        recorder.set_validating(true);
        assert!(world.restore_state(&mut recorder));
        assert!(!recorder.is_failed());
        assert!(recorder.is_at_end());
    }

    #[test]
    fn test_restore_rolls_back() {
        let (mut world, bodies) = world_with_bodies(2);
        world.step(1.0 / 60.0);

        let mut recorder = StateRecorder::new();
        world.save_state(&mut recorder, StateRecorderState::BODIES, None);
        let saved = world.body_state(bodies[0]).unwrap();

        for _ in 0..10 {
            world.step(1.0 / 60.0);
        }
        assert!(world.body_state(bodies[0]).unwrap().position.y < saved.position.y);

        let mut validating = StateRecorder::from_data(recorder.data().to_vec());
        validating.set_validating(true);
        assert!(!world.restore_state(&mut validating));
        assert!(validating.is_failed());

        recorder.begin_read();
        assert!(world.restore_state(&mut recorder));
        assert_eq!(world.body_state(bodies[0]).unwrap(), saved);
    }

    #[test]
    fn test_filter_limits_bodies() {
        let (world, bodies) = world_with_bodies(3);
        let mut filter = SyncStateFilter::new();
        filter.mark_as_sync(bodies[1]);

        let mut full = StateRecorder::new();
        world.save_state(&mut full, StateRecorderState::BODIES, None);
        let mut partial = StateRecorder::new();
        world.save_state(&mut partial, StateRecorderState::BODIES, Some(&filter));
        assert!(partial.len() < full.len());

        let mut count = 0u32;
        partial.read_value::<u8>().unwrap();
        partial.read(&mut count);
        assert_eq!(count, 1);
        assert_eq!(partial.read_value::<u32>(), Some(bodies[1].raw()));
    }

    #[test]
    fn test_body_blob_roundtrip() {
        let (mut world, bodies) = world_with_bodies(1);
        let mut recorder = StateRecorder::new();
        assert!(world.body_save_state(bodies[0], &mut recorder));

        world
            .set_linear_velocity(bodies[0], Vec3::new(3.0, 0.0, 0.0))
            .unwrap();
        recorder.begin_read();
        assert!(world.body_restore_state(bodies[0], &mut recorder));
        assert_eq!(world.linear_velocity(bodies[0]), Some(Vec3::ZERO));
        assert!(!world.body_save_state(BodyId::new(77, 0), &mut recorder));
    }

    fn sensor_world() -> (PhysicsWorld, BodyId, BodyId) {
        let layers = LayerTable::new();
        let mut ids = BodyIdManager::default();
        let mut world = PhysicsWorld::new(
            0,
            &WorldSettings {
                worker_threads: Some(1),
                gravity: Vec3::ZERO,
                ..WorldSettings::default()
            },
        )
        .unwrap();
        let sensor = BodyCreateInfo::new(
            BodyKey(1),
            Shape::new(ShapeDesc::cube(2.0)),
            Transform::IDENTITY,
        )
        .with_layer("TRIGGER")
        .with_mode(BodyMode::Sensor);
        let sensor = world.create_body(&layers, &mut ids, &sensor).unwrap();
        let ball = BodyCreateInfo::new(
            BodyKey(2),
            Shape::new(ShapeDesc::sphere()),
            Transform::IDENTITY,
        )
        .with_layer("DYNAMIC")
        .with_mode(BodyMode::Dynamic);
        let ball = world.create_body(&layers, &mut ids, &ball).unwrap();

        world.step(1.0 / 60.0);
        let mut events = EventQueue::new();
        world.sync_transforms(false, &mut events, |_, _| {});
        (world, sensor, ball)
    }

    #[test]
    fn test_contacts_section_restores_overlaps() {
        let (mut world, sensor, _) = sensor_world();
        let before = world.contact_listener().overlaps().records(sensor);
        assert_eq!(before.len(), 1);

        let mut recorder = StateRecorder::new();
        world.save_state(&mut recorder, StateRecorderState::CONTACTS, None);
        world.contact_listener().overlaps().clear();

        recorder.begin_read();
        assert!(world.restore_state(&mut recorder));
        assert_eq!(world.contact_listener().overlaps().records(sensor), before);
    }

    #[test]
    fn test_oversized_contact_count_is_rejected() {
        let (mut world, sensor, _) = sensor_world();
        let before = world.contact_listener().overlaps().records(sensor);

        let mut recorder = StateRecorder::new();
        recorder.write(&StateRecorderState::CONTACTS.bits());
        recorder.write(&u32::MAX);

        recorder.begin_read();
        assert!(!world.restore_state(&mut recorder));
        assert_eq!(world.contact_listener().overlaps().records(sensor), before);
    }

    #[test]
    fn test_oversized_overlap_count_is_rejected() {
        let (mut world, sensor, _) = sensor_world();
        let before = world.contact_listener().overlaps().records(sensor);

        let mut recorder = StateRecorder::new();
        recorder.write(&StateRecorderState::CONTACTS.bits());
        recorder.write(&1u32);
        recorder.write(&sensor.raw());
        recorder.write(&u32::MAX);

        recorder.begin_read();
        assert!(!world.restore_state(&mut recorder));
        assert_eq!(world.contact_listener().overlaps().records(sensor), before);
    }

    #[test]
    fn test_oversized_body_count_is_rejected() {
        let (mut world, bodies) = world_with_bodies(1);
        let before = world.body_state(bodies[0]).unwrap();

        let mut recorder = StateRecorder::new();
        recorder.write(&StateRecorderState::BODIES.bits());
        recorder.write(&u32::MAX);
        recorder.write(&bodies[0].raw());
        recorder.write(&BodyState::default());

        recorder.begin_read();
        assert!(!world.restore_state(&mut recorder));
        assert_eq!(world.body_state(bodies[0]).unwrap(), before);
    }

    #[test]
    fn test_truncated_overlap_records_are_rejected() {
        let (mut world, sensor, ball) = sensor_world();
        world.contact_listener().overlaps().clear();

        let mut recorder = StateRecorder::new();
        recorder.write(&StateRecorderState::CONTACTS.bits());
        recorder.write(&1u32);
        recorder.write(&sensor.raw());
        recorder.write(&2u32);
        recorder.write(&ball.raw());
        recorder.write(&(OverlapStatus::Inside as u8));

        recorder.begin_read();
        assert!(!world.restore_state(&mut recorder));
        assert!(world.contact_listener().overlaps().records(sensor).is_empty());
    }

    #[test]
    fn test_unknown_overlap_status_is_rejected() {
        let (mut world, sensor, ball) = sensor_world();
        world.contact_listener().overlaps().clear();

        let mut recorder = StateRecorder::new();
        recorder.write(&StateRecorderState::CONTACTS.bits());
        recorder.write(&1u32);
        recorder.write(&sensor.raw());
        recorder.write(&1u32);
        recorder.write(&ball.raw());
        recorder.write(&9u8);

        recorder.begin_read();
        assert!(!world.restore_state(&mut recorder));
        assert!(world.contact_listener().overlaps().records(sensor).is_empty());
    }
}
