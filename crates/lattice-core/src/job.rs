//! Job Pool
//!
//! Dedicated worker pools, one per simulation instance.
//! Features:
//! - Worker count defaults to hardware concurrency minus one
//! - Work is scoped: `install` blocks until the closure and its
//!   parallel iterators finish

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Job pool errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to build worker pool: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),
}

/// Worker count matching the machine: all cores but the calling one
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Work-stealing worker pool owned by a single subsystem
pub struct JobPool {
    pool: rayon::ThreadPool,
    workers: usize,
    /// Number of `install` calls served
    batches: Arc<AtomicUsize>,
}

impl JobPool {
    /// Create a pool with `workers` threads, or the default count when `None`
    pub fn new(name: &str, workers: Option<usize>) -> Result<Self, JobError> {
        let workers = workers.unwrap_or_else(default_worker_count).max(1);
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("{prefix}-worker-{i}"))
            .build()?;

        log::debug!("Job pool `{}` started with {} workers", name, workers);

        Ok(Self {
            pool,
            workers,
            batches: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Get the number of worker threads
    pub fn num_workers(&self) -> usize {
        self.workers
    }

    /// Run `func` inside the pool. Parallel iterators used by `func`
    /// are scheduled on this pool's workers.
    pub fn install<R, F>(&self, func: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.pool.install(func)
    }

    /// Number of batches run so far
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPool")
            .field("workers", &self.workers)
            .field("batches", &self.batches())
            .finish()
    }
}
