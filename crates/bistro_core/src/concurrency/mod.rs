//! Worker pools, scheduling, ranked locks and the error sink.
//!
//! [`Executors`] bundles the long-lived pools an application needs:
//!
//! | Pool      | Size                 | Used for                         |
//! |-----------|----------------------|----------------------------------|
//! | general   | `max(4, 2 x cores)`  | fire-and-forget work, async APIs |
//! | io        | `max(2, cores)`      | store queries, external tools    |
//! | compute   | `cores`              | CPU-bound work                   |
//! | scheduler | 2 threads            | delayed and fixed-rate jobs      |

mod error_sink;
mod locks;
mod pool;
mod scheduler;

pub use error_sink::{ErrorSink, TaskFailure};
pub use locks::{held_ranks, LockRank, RankedReadGuard, RankedRwLock, RankedWriteGuard};
pub use pool::{TaskHandle, WorkerPool};
pub use scheduler::{ScheduledHandle, Scheduler};

use crate::config::{Config, MIN_IO_THREADS};
use crate::error::CoreResult;
use std::sync::Arc;
use std::time::Duration;

/// The application's worker pools.
#[derive(Debug)]
pub struct Executors {
    general: WorkerPool,
    io: WorkerPool,
    compute: WorkerPool,
    scheduler: Scheduler,
    errors: Arc<ErrorSink>,
}

impl Executors {
    /// Starts all pools sized from `config`.
    pub fn new(config: &Config) -> CoreResult<Self> {
        let errors = Arc::new(ErrorSink::default());
        Ok(Self {
            general: WorkerPool::new(
                "bistro-general",
                config.general_threads,
                Arc::clone(&errors),
            )?,
            io: WorkerPool::new(
                "bistro-io",
                config.io_threads.max(MIN_IO_THREADS),
                Arc::clone(&errors),
            )?,
            compute: WorkerPool::new(
                "bistro-compute",
                config.compute_threads,
                Arc::clone(&errors),
            )?,
            scheduler: Scheduler::new(config.scheduler_threads, Arc::clone(&errors))?,
            errors,
        })
    }

    /// Pool for fire-and-forget and async API work.
    pub fn general(&self) -> &WorkerPool {
        &self.general
    }

    /// Pool for blocking store and subprocess work.
    pub fn io(&self) -> &WorkerPool {
        &self.io
    }

    /// Pool for CPU-bound work.
    pub fn compute(&self) -> &WorkerPool {
        &self.compute
    }

    /// Delayed and periodic jobs.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The shared error sink.
    pub fn errors(&self) -> &Arc<ErrorSink> {
        &self.errors
    }

    /// Shuts down every pool. Returns false if any pool had stuck workers.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let sched = self.scheduler.shutdown(timeout);
        let general = self.general.shutdown(timeout);
        let io = self.io.shutdown(timeout);
        let compute = self.compute.shutdown(timeout);
        sched && general && io && compute
    }
}
