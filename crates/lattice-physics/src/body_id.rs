//! Body identifiers and their allocation
//!
//! A [`BodyId`] packs a slot index and a reuse sequence. Indices come from
//! a [`BodyIdAllocator`]; sequences are owned by the world slot so a stale
//! id never resolves to a newer body in the same slot.
//!
//! Index ranges:
//! - `[0, max_unsync)`: unsynchronized, recycled aggressively
//! - `[max_unsync, ..)`: synchronized, agreed between authority and peers

use serde::{Deserialize, Serialize};

use crate::config::BodyIdSettings;

/// Opaque body identifier with a stale-reference sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyId(u32);

impl BodyId {
    /// Number of bits used by the index
    pub const INDEX_BITS: u32 = 23;
    /// Largest index that fits
    pub const MAX_INDEX: u32 = (1 << Self::INDEX_BITS) - 1;
    /// Reserved invalid id
    pub const INVALID: BodyId = BodyId(u32::MAX);

    /// Build an id from an index and a sequence number
    pub fn new(index: u32, sequence: u8) -> Self {
        debug_assert!(index <= Self::MAX_INDEX);
        Self((index & Self::MAX_INDEX) | ((sequence as u32) << Self::INDEX_BITS))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> u32 {
        self.0 & Self::MAX_INDEX
    }

    pub fn sequence(self) -> u8 {
        ((self.0 >> Self::INDEX_BITS) & 0xFF) as u8
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for BodyId {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Identity of the owning scene object (its network id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyKey(pub u32);

/// Pluggable body index allocator
pub trait BodyIdAllocator: Send {
    /// Next free unsynchronized index, tracked until its body is destroyed
    fn fetch_free_id(&mut self) -> u32;

    /// Hook for specialized trackers
    fn on_body_created(&mut self, _index: u32) {}

    /// Releases the index if it was handed out by `fetch_free_id`
    fn on_body_destroyed(&mut self, index: u32);

    /// Releases the externally assigned index of a destroyed owner
    fn on_owner_destroyed(&mut self, desired_index: Option<u32>);

    /// Next free synchronized index
    fn fetch_free_sync_id(&mut self) -> u32;

    /// Return an index to its range's free list
    fn release_id(&mut self, index: u32);

    /// Forget every allocation
    fn reset(&mut self);
}

/// Default allocator with disjoint unsynchronized/synchronized ranges
#[derive(Debug, Clone)]
pub struct BodyIdManager {
    max_unsync_bodies: u32,
    unsync_generation: u32,
    free_unsync_ids: Vec<u32>,
    sync_generation: u32,
    free_sync_ids: Vec<u32>,
    untracked_ids: Vec<u32>,
}

impl BodyIdManager {
    pub fn new(settings: &BodyIdSettings) -> Self {
        Self {
            max_unsync_bodies: settings.max_unsync_bodies,
            unsync_generation: 0,
            free_unsync_ids: Vec::new(),
            sync_generation: 0,
            free_sync_ids: Vec::new(),
            untracked_ids: Vec::new(),
        }
    }

    /// The unsynchronized/synchronized threshold
    pub fn max_unsync_bodies(&self) -> u32 {
        self.max_unsync_bodies
    }

    pub fn is_sync_index(&self, index: u32) -> bool {
        index >= self.max_unsync_bodies
    }

    /// Indices handed out by `fetch_free_id` and not yet destroyed
    pub fn untracked_ids(&self) -> &[u32] {
        &self.untracked_ids
    }
}

impl Default for BodyIdManager {
    fn default() -> Self {
        Self::new(&BodyIdSettings::default())
    }
}

impl BodyIdAllocator for BodyIdManager {
    fn fetch_free_id(&mut self) -> u32 {
        let index = match self.free_unsync_ids.pop() {
            Some(index) => index,
            None => {
                let index = self.unsync_generation;
                assert!(
                    index < self.max_unsync_bodies,
                    "Unsynchronized body ids exhausted: the pool holds {} ids",
                    self.max_unsync_bodies
                );
                self.unsync_generation += 1;
                index
            }
        };
        self.untracked_ids.push(index);
        index
    }

    fn on_body_destroyed(&mut self, index: u32) {
        if let Some(position) = self.untracked_ids.iter().position(|&i| i == index) {
            self.untracked_ids.swap_remove(position);
            self.release_id(index);
        }
    }

    fn on_owner_destroyed(&mut self, desired_index: Option<u32>) {
        if let Some(index) = desired_index {
            self.release_id(index);
        }
    }

    fn fetch_free_sync_id(&mut self) -> u32 {
        match self.free_sync_ids.pop() {
            Some(index) => index,
            None => {
                let index = self.max_unsync_bodies + self.sync_generation;
                assert!(index <= BodyId::MAX_INDEX, "Synchronized body ids exhausted");
                self.sync_generation += 1;
                index
            }
        }
    }

    fn release_id(&mut self, index: u32) {
        let free_list = if self.is_sync_index(index) {
            &mut self.free_sync_ids
        } else {
            &mut self.free_unsync_ids
        };
        if free_list.contains(&index) {
            log::warn!("Body index {} released twice", index);
            return;
        }
        free_list.push(index);
    }

    fn reset(&mut self) {
        self.unsync_generation = 0;
        self.free_unsync_ids.clear();
        self.sync_generation = 0;
        self.free_sync_ids.clear();
        self.untracked_ids.clear();
    }
}
