//! # Lattice Core
//!
//! Foundational, engine-agnostic pieces shared by the Lattice crates.
//!
//! - **Math**: Bounds, rigid transforms with scale, tolerant comparisons
//! - **Time**: Fixed-step helpers and injectable millisecond clocks
//! - **Jobs**: Dedicated work-stealing worker pools
//! - **Memory**: Budgeted scratch buffers with usage tracking

pub mod job;
pub mod math;
pub mod memory;
pub mod time;

pub use job::{JobError, JobPool};
pub use math::{Aabb, BoundingSphere, Transform};
pub use memory::{MemoryStats, ScratchBuffer};
pub use time::{Clock, DeltaTime, FixedTimeStep, ManualClock, Millis, SystemClock};
