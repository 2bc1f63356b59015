//! Runtime configuration.

use std::thread;
use std::time::Duration;

/// Smallest I/O pool allowed. A restore occupies one I/O worker for its
/// whole run, so store queries need at least one more.
pub const MIN_IO_THREADS: usize = 2;

fn cores() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

/// Configuration for an [`AppContext`](crate::AppContext).
#[derive(Debug, Clone)]
pub struct Config {
    /// How long `open()` waits for a concurrent open to finish.
    pub open_wait: Duration,

    /// Pause between close and open during a restart.
    pub settle_delay: Duration,

    /// Idle sessions kept by the persistence handle.
    pub max_idle_sessions: usize,

    /// Attempts a cache reload makes before giving up.
    pub reload_attempts: u32,

    /// Base backoff between reload attempts, multiplied by the attempt number.
    pub reload_backoff: Duration,

    /// Minimum difference before a recomputed rating is written back.
    pub rating_epsilon: f64,

    /// Threads in the general pool.
    pub general_threads: usize,

    /// Threads in the I/O pool, at least [`MIN_IO_THREADS`].
    pub io_threads: usize,

    /// Threads in the compute pool.
    pub compute_threads: usize,

    /// Threads serving scheduled jobs.
    pub scheduler_threads: usize,

    /// How long pool shutdown waits before discarding queued work.
    pub shutdown_timeout: Duration,

    /// Periodic full cache refresh (disabled when `None`).
    pub refresh_interval: Option<Duration>,

    /// Change events retained for polling.
    pub change_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        let cores = cores();
        Self {
            open_wait: Duration::from_secs(1),
            settle_delay: Duration::from_millis(500),
            max_idle_sessions: 4,
            reload_attempts: 3,
            reload_backoff: Duration::from_secs(1),
            rating_epsilon: 1e-6,
            general_threads: (cores * 2).max(4),
            io_threads: cores.max(MIN_IO_THREADS),
            compute_threads: cores,
            scheduler_threads: 2,
            shutdown_timeout: Duration::from_secs(5),
            refresh_interval: None,
            change_history: 10_000,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with short delays, for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self::default()
            .open_wait(Duration::from_millis(200))
            .settle_delay(Duration::from_millis(5))
            .reload_backoff(Duration::from_millis(5))
            .shutdown_timeout(Duration::from_millis(500))
    }

    /// Sets how long `open()` waits on a concurrent open.
    #[must_use]
    pub const fn open_wait(mut self, wait: Duration) -> Self {
        self.open_wait = wait;
        self
    }

    /// Sets the restart settle delay.
    #[must_use]
    pub const fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the number of idle sessions kept.
    #[must_use]
    pub const fn max_idle_sessions(mut self, n: usize) -> Self {
        self.max_idle_sessions = n;
        self
    }

    /// Sets the number of reload attempts. Zero is treated as one.
    #[must_use]
    pub const fn reload_attempts(mut self, attempts: u32) -> Self {
        self.reload_attempts = attempts;
        self
    }

    /// Sets the base reload backoff.
    #[must_use]
    pub const fn reload_backoff(mut self, backoff: Duration) -> Self {
        self.reload_backoff = backoff;
        self
    }

    /// Sets the rating write-back epsilon.
    #[must_use]
    pub const fn rating_epsilon(mut self, epsilon: f64) -> Self {
        self.rating_epsilon = epsilon;
        self
    }

    /// Sets the general pool size.
    #[must_use]
    pub const fn general_threads(mut self, n: usize) -> Self {
        self.general_threads = n;
        self
    }

    /// Sets the I/O pool size. Values below [`MIN_IO_THREADS`] are raised
    /// to it.
    #[must_use]
    pub const fn io_threads(mut self, n: usize) -> Self {
        self.io_threads = if n < MIN_IO_THREADS { MIN_IO_THREADS } else { n };
        self
    }

    /// Sets the compute pool size.
    #[must_use]
    pub const fn compute_threads(mut self, n: usize) -> Self {
        self.compute_threads = n;
        self
    }

    /// Sets the pool shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enables a periodic full refresh.
    #[must_use]
    pub const fn refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }
}
