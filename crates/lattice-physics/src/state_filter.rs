//! Snapshot selection: which sections and which bodies get recorded.

use bitflags::bitflags;

use crate::body_id::BodyId;

bitflags! {
    /// Sections of a world snapshot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateRecorderState: u8 {
        const GLOBAL = 1 << 0;
        const BODIES = 1 << 1;
        const CONTACTS = 1 << 2;
        const CONSTRAINTS = 1 << 3;
        const ALL = Self::GLOBAL.bits() | Self::BODIES.bits() | Self::CONTACTS.bits() | Self::CONSTRAINTS.bits();
    }
}

/// Restricts which bodies a snapshot carries
pub trait StateRecorderFilter {
    fn should_save_body(&self, id: BodyId) -> bool;

    /// A contact is saved when either side is
    fn should_save_contact(&self, a: BodyId, b: BodyId) -> bool {
        self.should_save_body(a) || self.should_save_body(b)
    }

    fn should_save_constraint(&self, _a: BodyId, _b: BodyId) -> bool {
        false
    }
}

/// Flat per-index inclusion table
#[derive(Debug, Clone, Default)]
pub struct SyncStateFilter {
    should_sync: Vec<bool>,
}

impl SyncStateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.should_sync.clear();
    }

    pub fn mark_as_sync(&mut self, id: BodyId) {
        let index = id.index() as usize;
        if index >= self.should_sync.len() {
            self.should_sync.resize(index + 1, false);
        }
        self.should_sync[index] = true;
    }

    /// Number of marked bodies
    pub fn count(&self) -> usize {
        self.should_sync.iter().filter(|&&marked| marked).count()
    }
}

impl StateRecorderFilter for SyncStateFilter {
    fn should_save_body(&self, id: BodyId) -> bool {
        self.should_sync
            .get(id.index() as usize)
            .copied()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_marks_by_index() {
        let mut filter = SyncStateFilter::new();
        filter.mark_as_sync(BodyId::new(10, 3));
        assert!(filter.should_save_body(BodyId::new(10, 3)));
        assert!(filter.should_save_body(BodyId::new(10, 4)));
        assert!(!filter.should_save_body(BodyId::new(9, 0)));
        assert!(!filter.should_save_body(BodyId::new(500, 0)));
        assert_eq!(filter.count(), 1);
    }

    #[test]
    fn test_contacts_and_constraints() {
        let mut filter = SyncStateFilter::new();
        let a = BodyId::new(1, 0);
        let b = BodyId::new(2, 0);
        let c = BodyId::new(3, 0);
        filter.mark_as_sync(a);
        assert!(filter.should_save_contact(a, b));
        assert!(filter.should_save_contact(b, a));
        assert!(!filter.should_save_contact(b, c));
        assert!(!filter.should_save_constraint(a, a));

        filter.clear();
        assert!(!filter.should_save_contact(a, b));
    }

    #[test]
    fn test_state_bits() {
        assert!(StateRecorderState::ALL.contains(StateRecorderState::CONTACTS));
        let mode = StateRecorderState::BODIES | StateRecorderState::CONTACTS;
        assert!(!mode.contains(StateRecorderState::GLOBAL));
        assert_eq!(StateRecorderState::from_bits_truncate(mode.bits()), mode);
    }
}
