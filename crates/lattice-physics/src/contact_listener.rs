//! Contact Listener
//!
//! Turns per-step contact reports into stable sensor overlap records.
//! Features:
//! - Marking is called from worker threads and takes the overlap lock
//! - Flushing runs once per sync point on the owning thread
//! - Separation is detected by the absence of persisted contacts, never by
//!   removal reports, so a state restore can't fake an exit

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::body_id::{BodyId, BodyKey};
use crate::events::{BodyEvent, EventQueue};

/// Contacts shallower than this are ignored
pub const MIN_OVERLAP_DEPTH: f32 = 0.001;

/// Overlap record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OverlapStatus {
    /// First seen this frame
    Start = 0,
    /// Seen again this frame
    Inside = 1,
    /// Not seen this frame yet
    EndPending = 2,
    /// Missed a whole frame, reported and removed on the next flush
    End = 3,
}

impl OverlapStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Start),
            1 => Some(Self::Inside),
            2 => Some(Self::EndPending),
            3 => Some(Self::End),
            _ => None,
        }
    }
}

/// One body overlapping a sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorOverlap {
    pub other: BodyKey,
    pub other_id: BodyId,
    pub status: OverlapStatus,
}

type OverlapList = SmallVec<[SensorOverlap; 4]>;

/// Overlap records of every sensor in a world
#[derive(Debug, Default)]
pub struct SensorOverlaps {
    lists: Mutex<AHashMap<BodyId, OverlapList>>,
}

impl SensorOverlaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `other` touches `sensor` during this frame
    pub fn mark(&self, sensor: BodyId, other: BodyKey, other_id: BodyId) {
        let mut lists = self.lists.lock();
        let overlaps = lists.entry(sensor).or_default();
        match overlaps.iter_mut().find(|o| o.other_id == other_id) {
            // Several contact points in the same frame.
            Some(overlap) if overlap.status == OverlapStatus::Start => {}
            Some(overlap) => overlap.status = OverlapStatus::Inside,
            None => overlaps.push(SensorOverlap {
                other,
                other_id,
                status: OverlapStatus::Start,
            }),
        }
    }

    /// Emit the pending events of `sensor` and age its records.
    ///
    /// `resolve` maps an id back to its live owner; ended overlaps use it
    /// because the other body may be gone.
    pub fn flush(
        &self,
        sensor: BodyId,
        sensor_key: BodyKey,
        events: &mut EventQueue,
        resolve: impl Fn(BodyId) -> Option<BodyKey>,
    ) {
        let mut lists = self.lists.lock();
        let Some(overlaps) = lists.get_mut(&sensor) else {
            return;
        };

        for i in (0..overlaps.len()).rev() {
            let overlap = &mut overlaps[i];
            match overlap.status {
                OverlapStatus::Start => {
                    events.push(BodyEvent::OverlapStart {
                        sensor: sensor_key,
                        other_id: overlap.other_id,
                        other: overlap.other,
                    });
                    events.push(BodyEvent::TriggerEntered {
                        sensor: sensor_key,
                        other: overlap.other,
                    });
                    overlap.status = OverlapStatus::EndPending;
                }
                OverlapStatus::Inside => overlap.status = OverlapStatus::EndPending,
                OverlapStatus::EndPending => overlap.status = OverlapStatus::End,
                OverlapStatus::End => {
                    let other = resolve(overlap.other_id);
                    events.push(BodyEvent::OverlapEnd {
                        sensor: sensor_key,
                        other_id: overlap.other_id,
                        other,
                    });
                    events.push(BodyEvent::TriggerExited {
                        sensor: sensor_key,
                        other,
                    });
                    overlaps.swap_remove(i);
                }
            }
        }

        if overlaps.is_empty() {
            lists.remove(&sensor);
        }
    }

    /// Current records of a sensor
    pub fn records(&self, sensor: BodyId) -> Vec<SensorOverlap> {
        self.lists
            .lock()
            .get(&sensor)
            .map(|list| list.to_vec())
            .unwrap_or_default()
    }

    /// Replace the records of a sensor
    pub fn set_records(&self, sensor: BodyId, records: Vec<SensorOverlap>) {
        let mut lists = self.lists.lock();
        if records.is_empty() {
            lists.remove(&sensor);
        } else {
            lists.insert(sensor, records.into_iter().collect());
        }
    }

    /// Forget a sensor's records without emitting anything
    pub fn remove_sensor(&self, sensor: BodyId) {
        self.lists.lock().remove(&sensor);
    }

    pub fn clear(&self) {
        self.lists.lock().clear();
    }

    /// Number of live records across all sensors
    pub fn len(&self) -> usize {
        self.lists.lock().values().map(|list| list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One side of a reported contact
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactSide {
    pub id: BodyId,
    pub key: BodyKey,
    pub is_sensor: bool,
}

/// A contact reported by the narrow phase for this step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactCandidate {
    pub a: ContactSide,
    pub b: ContactSide,
    pub depth: f32,
}

impl ContactCandidate {
    /// Order-independent pair key
    pub fn pair_key(&self) -> (u32, u32) {
        let (a, b) = (self.a.id.raw(), self.b.id.raw());
        if a <= b { (a, b) } else { (b, a) }
    }
}

/// Contact counts of the last step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactStats {
    pub added: usize,
    pub persisted: usize,
    pub removed: usize,
}

/// Per-world contact listener
#[derive(Debug, Default)]
pub struct ContactListener {
    overlaps: SensorOverlaps,
    previous_pairs: AHashSet<(u32, u32)>,
    stats: ContactStats,
}

impl ContactListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one added or persisted contact. Safe to call concurrently.
    pub fn contact_detected(&self, contact: &ContactCandidate) {
        if !contact.a.is_sensor && !contact.b.is_sensor {
            return;
        }
        if contact.depth <= MIN_OVERLAP_DEPTH {
            return;
        }
        self.process_contact(&contact.a, &contact.b);
        self.process_contact(&contact.b, &contact.a);
    }

    fn process_contact(&self, maybe_sensor: &ContactSide, body: &ContactSide) {
        if maybe_sensor.is_sensor {
            self.overlaps.mark(maybe_sensor.id, body.key, body.id);
        }
    }

    /// Split this step's contacts into added and persisted.
    /// Removed pairs are only counted.
    pub fn classify<'a>(
        &mut self,
        contacts: impl IntoIterator<Item = &'a ContactCandidate>,
    ) -> ContactStats {
        let current: AHashSet<(u32, u32)> =
            contacts.into_iter().map(|c| c.pair_key()).collect();
        let persisted = current
            .iter()
            .filter(|pair| self.previous_pairs.contains(*pair))
            .count();
        let removed = self
            .previous_pairs
            .iter()
            .filter(|pair| !current.contains(*pair))
            .count();
        self.stats = ContactStats {
            added: current.len() - persisted,
            persisted,
            removed,
        };
        self.previous_pairs = current;
        self.stats
    }

    pub fn stats(&self) -> ContactStats {
        self.stats
    }

    pub fn overlaps(&self) -> &SensorOverlaps {
        &self.overlaps
    }

    /// Drop every record and pair, e.g. before a full state restore
    pub fn reset(&mut self) {
        self.overlaps.clear();
        self.previous_pairs.clear();
        self.stats = ContactStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor_id() -> BodyId {
        BodyId::new(1, 0)
    }

    fn side(index: u32, key: u32, is_sensor: bool) -> ContactSide {
        ContactSide {
            id: BodyId::new(index, 0),
            key: BodyKey(key),
            is_sensor,
        }
    }

    fn contact(depth: f32) -> ContactCandidate {
        ContactCandidate {
            a: side(1, 10, true),
            b: side(2, 20, false),
            depth,
        }
    }

    fn count(events: &[BodyEvent], start: bool) -> usize {
        events
            .iter()
            .filter(|e| match e {
                BodyEvent::OverlapStart { .. } => start,
                BodyEvent::OverlapEnd { .. } => !start,
                _ => false,
            })
            .count()
    }

    #[test]
    fn test_overlap_lifecycle_has_one_grace_frame() {
        let listener = ContactListener::new();
        let mut events = EventQueue::new();
        let resolve = |id: BodyId| (id.index() == 2).then_some(BodyKey(20));

        // contact, contact, no contact, no contact
        let script = [true, true, false, false];
        let mut per_frame = Vec::new();
        for touching in script {
            if touching {
                listener.contact_detected(&contact(0.05));
                // Second manifold point in the same frame.
                listener.contact_detected(&contact(0.02));
            }
            listener
                .overlaps()
                .flush(sensor_id(), BodyKey(10), &mut events, resolve);
            per_frame.push(events.drain());
        }

        assert_eq!(count(&per_frame[0], true), 1);
        assert_eq!(count(&per_frame[1], true), 0);
        assert_eq!(count(&per_frame[2], false), 0);
        assert_eq!(count(&per_frame[3], false), 1);

        let total_starts: usize = per_frame.iter().map(|f| count(f, true)).sum();
        let total_ends: usize = per_frame.iter().map(|f| count(f, false)).sum();
        assert_eq!((total_starts, total_ends), (1, 1));
        assert!(listener.overlaps().is_empty());
        assert!(per_frame[3].contains(&BodyEvent::TriggerExited {
            sensor: BodyKey(10),
            other: Some(BodyKey(20)),
        }));
    }

    #[test]
    fn test_shallow_and_non_sensor_contacts_are_ignored() {
        let listener = ContactListener::new();
        listener.contact_detected(&contact(MIN_OVERLAP_DEPTH));
        listener.contact_detected(&ContactCandidate {
            a: side(3, 30, false),
            b: side(4, 40, false),
            depth: 1.0,
        });
        assert!(listener.overlaps().is_empty());
    }

    #[test]
    fn test_both_sensors_mark_each_other() {
        let listener = ContactListener::new();
        listener.contact_detected(&ContactCandidate {
            a: side(5, 50, true),
            b: side(6, 60, true),
            depth: 0.5,
        });
        assert_eq!(listener.overlaps().records(BodyId::new(5, 0)).len(), 1);
        assert_eq!(listener.overlaps().records(BodyId::new(6, 0)).len(), 1);
    }

    #[test]
    fn test_destroyed_other_ends_without_owner() {
        let overlaps = SensorOverlaps::new();
        let mut events = EventQueue::new();
        overlaps.mark(sensor_id(), BodyKey(20), BodyId::new(2, 0));
        for _ in 0..3 {
            overlaps.flush(sensor_id(), BodyKey(10), &mut events, |_| None);
        }
        assert!(events.iter().any(|e| matches!(
            e,
            BodyEvent::OverlapEnd { other: None, .. }
        )));
    }

    #[test]
    fn test_classify_added_and_persisted() {
        let mut listener = ContactListener::new();
        let first = listener.classify(&[contact(0.1)]);
        assert_eq!(first, ContactStats { added: 1, persisted: 0, removed: 0 });
        let second = listener.classify(&[contact(0.1)]);
        assert_eq!(second, ContactStats { added: 0, persisted: 1, removed: 0 });
        let third = listener.classify(std::iter::empty());
        assert_eq!(third, ContactStats { added: 0, persisted: 0, removed: 1 });
    }

    #[test]
    fn test_records_roundtrip_and_status_codes() {
        let overlaps = SensorOverlaps::new();
        overlaps.mark(sensor_id(), BodyKey(20), BodyId::new(2, 0));
        let records = overlaps.records(sensor_id());
        overlaps.clear();
        overlaps.set_records(sensor_id(), records.clone());
        assert_eq!(overlaps.records(sensor_id()), records);
        assert!(overlaps.records(BodyId::new(9, 0)).is_empty());
        assert_eq!(OverlapStatus::from_u8(3), Some(OverlapStatus::End));
        assert_eq!(OverlapStatus::from_u8(4), None);
    }
}
