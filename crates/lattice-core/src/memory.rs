//! Memory Management
//!
//! Scratch storage for per-step temporary data:
//! - Reusable buffers that keep their capacity between steps
//! - A byte budget above which retained capacity is released
//! - Memory tracking statistics

use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory tracking statistics
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// Total bytes retained
    pub allocated: AtomicUsize,
    /// Peak bytes retained
    pub peak: AtomicUsize,
    /// Number of allocations
    pub allocation_count: AtomicUsize,
}

impl MemoryStats {
    /// Create new memory stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    pub fn record_alloc(&self, size: usize) {
        let new_size = self.allocated.fetch_add(size, Ordering::Relaxed) + size;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(new_size, Ordering::Relaxed);
    }

    /// Record a deallocation
    pub fn record_dealloc(&self, size: usize) {
        self.allocated.fetch_sub(size, Ordering::Relaxed);
    }

    /// Get current allocated bytes
    pub fn current(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get peak allocated bytes
    pub fn peak_usage(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Get total allocation count
    pub fn count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }
}

/// Reusable scratch vector with a retained-capacity budget.
///
/// `take` hands out an empty vector that keeps the capacity from the
/// previous step; `restore` gives it back. Capacity above the budget is
/// released on restore so one large step does not pin memory forever.
#[derive(Debug)]
pub struct ScratchBuffer<T> {
    storage: Vec<T>,
    budget_bytes: usize,
    retained_bytes: usize,
    stats: MemoryStats,
}

impl<T> ScratchBuffer<T> {
    /// Create a scratch buffer that retains at most `budget_bytes`
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            storage: Vec::new(),
            budget_bytes,
            retained_bytes: 0,
            stats: MemoryStats::new(),
        }
    }

    /// Borrow the storage as an empty vector
    pub fn take(&mut self) -> Vec<T> {
        let mut buffer = std::mem::take(&mut self.storage);
        buffer.clear();
        buffer
    }

    /// Return the storage taken with [`ScratchBuffer::take`]
    pub fn restore(&mut self, mut buffer: Vec<T>) {
        buffer.clear();
        let item_size = std::mem::size_of::<T>().max(1);
        if buffer.capacity() * item_size > self.budget_bytes {
            log::debug!(
                "Scratch buffer grew to {} bytes, trimming to {}",
                buffer.capacity() * item_size,
                self.budget_bytes
            );
            buffer.shrink_to(self.budget_bytes / item_size);
        }

        let bytes = buffer.capacity() * item_size;
        if bytes != self.retained_bytes {
            self.stats.record_dealloc(self.retained_bytes);
            self.stats.record_alloc(bytes);
            self.retained_bytes = bytes;
        }
        self.storage = buffer;
    }

    /// Bytes currently retained between steps
    pub fn retained_bytes(&self) -> usize {
        self.retained_bytes
    }

    /// Configured budget
    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Get memory statistics
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }
}
