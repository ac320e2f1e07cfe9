//! Body notifications
//!
//! Typed events emitted at fixed points of the step/sync cycle and polled
//! by the scene layer.

use glam::Vec3;

use crate::body_id::{BodyId, BodyKey};

/// Body event types
#[derive(Debug, Clone, PartialEq)]
pub enum BodyEvent {
    /// An engine body was created for the owner
    BodyCreated { body: BodyKey, id: BodyId },
    /// The owner's engine body was destroyed
    BodyDestroyed { body: BodyKey, id: BodyId },
    /// The body started receiving updates
    StartUpdating { body: BodyKey },
    /// The body stopped receiving updates
    StopUpdating { body: BodyKey },
    /// A body started overlapping the sensor
    OverlapStart {
        sensor: BodyKey,
        other_id: BodyId,
        other: BodyKey,
    },
    /// A body stopped overlapping the sensor; `other` is gone if it was destroyed
    OverlapEnd {
        sensor: BodyKey,
        other_id: BodyId,
        other: Option<BodyKey>,
    },
    /// A body entered the trigger
    TriggerEntered { sensor: BodyKey, other: BodyKey },
    /// A body left the trigger
    TriggerExited {
        sensor: BodyKey,
        other: Option<BodyKey>,
    },
    /// A character jumped
    Jump { body: BodyKey, velocity: Vec3 },
    /// A registered interaction was invoked
    InteractionCalled {
        body: BodyKey,
        interaction: String,
        argument: Vec<u8>,
    },
}

impl BodyEvent {
    /// Body the event is emitted on
    pub fn body(&self) -> BodyKey {
        match self {
            Self::BodyCreated { body, .. }
            | Self::BodyDestroyed { body, .. }
            | Self::StartUpdating { body }
            | Self::StopUpdating { body }
            | Self::Jump { body, .. }
            | Self::InteractionCalled { body, .. } => *body,
            Self::OverlapStart { sensor, .. }
            | Self::OverlapEnd { sensor, .. }
            | Self::TriggerEntered { sensor, .. }
            | Self::TriggerExited { sensor, .. } => *sensor,
        }
    }
}

/// Pending events, in emission order
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Vec<BodyEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: BodyEvent) {
        log::trace!("Event {:?}", event);
        self.events.push(event);
    }

    /// Take every pending event
    pub fn drain(&mut self) -> Vec<BodyEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BodyEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
