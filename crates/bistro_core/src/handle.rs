//! Lifecycle of the connection to the relational store.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use bistro_store::{StoreBackend, StoreSession};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// State of a [`PersistenceHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// No live sessions; the next `session()` opens lazily.
    Closed,
    /// An `open()` is verifying the store.
    Opening,
    /// Sessions can be handed out.
    Open,
    /// A `close()` is tearing down idle sessions.
    Closing,
    /// Closed for maintenance; nothing reopens until `resume()`.
    Suspended,
}

impl HandleState {
    /// Returns true while an open or close is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, HandleState::Opening | HandleState::Closing)
    }
}

struct Inner {
    state: HandleState,
    generation: u64,
    idle: Vec<Box<dyn StoreSession>>,
    last_error: Option<String>,
}

/// Owns the session factory for the store.
///
/// All lifecycle transitions go through one coarse state flag guarded by a
/// mutex and condition variable, so `open`, `close`, `restart` and
/// `suspend` are totally ordered. At most one generation of sessions is
/// live: closing bumps the generation and sessions from an older
/// generation are discarded instead of being returned to the pool.
pub struct PersistenceHandle {
    backend: Arc<dyn StoreBackend>,
    inner: Mutex<Inner>,
    changed: Condvar,
    open_wait: Duration,
    settle_delay: Duration,
    max_idle: usize,
}

impl PersistenceHandle {
    /// Creates a closed handle over `backend`.
    pub fn new(backend: Arc<dyn StoreBackend>, config: &Config) -> Self {
        Self {
            backend,
            inner: Mutex::new(Inner {
                state: HandleState::Closed,
                generation: 0,
                idle: Vec::new(),
                last_error: None,
            }),
            changed: Condvar::new(),
            open_wait: config.open_wait,
            settle_delay: config.settle_delay,
            max_idle: config.max_idle_sessions,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandleState {
        self.inner.lock().state
    }

    /// Returns true if sessions can be handed out without opening.
    pub fn is_open(&self) -> bool {
        self.state() == HandleState::Open
    }

    /// Increases every time the handle is opened or closed.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Message of the last failed open, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Name of the underlying backend.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Blocks while an open or close is in flight, at most until `deadline`.
    fn wait_stable(&self, inner: &mut MutexGuard<'_, Inner>, deadline: Instant) -> bool {
        while inner.state.is_transitioning() {
            if self.changed.wait_until(inner, deadline).timed_out() {
                return !inner.state.is_transitioning();
            }
        }
        true
    }

    /// Opens the handle and verifies the store with a round trip.
    ///
    /// Idempotent. If another thread is opening, waits up to the configured
    /// open wait and returns that attempt's outcome.
    pub fn open(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let deadline = Instant::now() + self.open_wait;
        loop {
            match inner.state {
                HandleState::Open => return Ok(()),
                HandleState::Suspended => {
                    return Err(CoreError::connection(
                        "persistence handle is suspended for maintenance",
                    ))
                }
                HandleState::Closed => break,
                HandleState::Opening => {
                    let generation = inner.generation;
                    if !self.wait_stable(&mut inner, deadline) {
                        return Err(CoreError::connection("timed out waiting for concurrent open"));
                    }
                    // The concurrent open failed if it left the handle closed
                    // without moving the generation.
                    if inner.state == HandleState::Closed && inner.generation == generation {
                        let message = inner
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "concurrent open failed".to_string());
                        return Err(CoreError::connection(message));
                    }
                }
                HandleState::Closing => {
                    if !self.wait_stable(&mut inner, deadline) {
                        return Err(CoreError::connection("timed out waiting for close"));
                    }
                }
            }
        }

        inner.state = HandleState::Opening;
        drop(inner);

        let result = self.backend.connect().and_then(|mut session| {
            session.ping()?;
            Ok(session)
        });

        let mut inner = self.inner.lock();
        let outcome = match result {
            Ok(session) => {
                inner.state = HandleState::Open;
                inner.generation += 1;
                inner.last_error = None;
                inner.idle.push(session);
                tracing::info!(
                    backend = self.backend.name(),
                    generation = inner.generation,
                    "persistence handle opened"
                );
                Ok(())
            }
            Err(e) => {
                inner.state = HandleState::Closed;
                inner.last_error = Some(e.to_string());
                tracing::warn!(
                    backend = self.backend.name(),
                    error = %e,
                    "persistence handle failed to open"
                );
                Err(CoreError::connection(format!("cannot open store: {e}")))
            }
        };
        drop(inner);
        self.changed.notify_all();
        outcome
    }

    /// Closes the handle, dropping idle sessions.
    ///
    /// Idempotent. Waits for an in-flight open to finish first. Sessions
    /// currently checked out are discarded when returned.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        while inner.state.is_transitioning() {
            self.changed.wait(&mut inner);
        }
        if inner.state != HandleState::Open {
            return;
        }
        self.teardown(inner, HandleState::Closed);
    }

    fn teardown(&self, mut inner: MutexGuard<'_, Inner>, target: HandleState) {
        inner.state = HandleState::Closing;
        inner.generation += 1;
        let idle = std::mem::take(&mut inner.idle);
        drop(inner);

        let dropped = idle.len();
        drop(idle);

        let mut inner = self.inner.lock();
        inner.state = target;
        tracing::info!(sessions = dropped, state = ?target, "persistence handle closed");
        drop(inner);
        self.changed.notify_all();
    }

    /// Closes, waits the settle delay, and opens again.
    pub fn restart(&self) -> CoreResult<()> {
        if self.state() == HandleState::Suspended {
            return Err(CoreError::connection(
                "persistence handle is suspended for maintenance",
            ));
        }
        tracing::info!("restarting persistence handle");
        self.close();
        thread::sleep(self.settle_delay);
        self.open()
    }

    /// Closes the handle and keeps it closed until [`resume`](Self::resume).
    ///
    /// While suspended, `session()` and `open()` fail with a connection
    /// error instead of reconnecting.
    pub fn suspend(&self) {
        let mut inner = self.inner.lock();
        while inner.state.is_transitioning() {
            self.changed.wait(&mut inner);
        }
        match inner.state {
            HandleState::Suspended => {}
            HandleState::Open => self.teardown(inner, HandleState::Suspended),
            _ => {
                inner.state = HandleState::Suspended;
                inner.generation += 1;
                drop(inner);
                self.changed.notify_all();
            }
        }
    }

    /// Leaves the suspended state, waits the settle delay and opens.
    pub fn resume(&self) -> CoreResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state == HandleState::Suspended {
                inner.state = HandleState::Closed;
            }
        }
        self.changed.notify_all();
        thread::sleep(self.settle_delay);
        self.open()
    }

    /// Checks out a session, opening the handle lazily if it is closed.
    pub fn session(&self) -> CoreResult<SessionGuard<'_>> {
        loop {
            let mut inner = self.inner.lock();
            match inner.state {
                HandleState::Open => {
                    let generation = inner.generation;
                    if let Some(session) = inner.idle.pop() {
                        return Ok(SessionGuard::new(self, session, generation));
                    }
                    drop(inner);
                    let session = self.backend.connect()?;
                    return Ok(SessionGuard::new(self, session, generation));
                }
                HandleState::Closed => {
                    drop(inner);
                    self.open()?;
                }
                HandleState::Suspended => {
                    return Err(CoreError::connection(
                        "persistence handle is suspended for maintenance",
                    ))
                }
                HandleState::Opening | HandleState::Closing => {
                    let deadline = Instant::now() + self.open_wait;
                    if !self.wait_stable(&mut inner, deadline) {
                        return Err(CoreError::connection("timed out waiting for handle"));
                    }
                }
            }
        }
    }

    /// Runs `f` with a checked-out session.
    ///
    /// A session that hit a connection-class error is discarded rather than
    /// returned to the idle pool.
    pub fn with_session<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut dyn StoreSession) -> CoreResult<T>,
    {
        let mut guard = self.session()?;
        let result = f(&mut *guard);
        if matches!(&result, Err(e) if e.is_retryable()) {
            guard.discard();
        }
        result
    }

    fn give_back(&self, session: Box<dyn StoreSession>, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.state == HandleState::Open
            && inner.generation == generation
            && inner.idle.len() < self.max_idle
            && !session.in_transaction()
        {
            inner.idle.push(session);
        }
    }

    /// Sessions currently idle in the pool.
    pub fn idle_sessions(&self) -> usize {
        self.inner.lock().idle.len()
    }
}

impl std::fmt::Debug for PersistenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PersistenceHandle")
            .field("backend", &self.backend.name())
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .finish()
    }
}

/// A session checked out of a [`PersistenceHandle`].
///
/// Returned to the idle pool on drop if the handle has not been closed
/// since it was checked out.
pub struct SessionGuard<'a> {
    handle: &'a PersistenceHandle,
    session: Option<Box<dyn StoreSession>>,
    generation: u64,
}

impl<'a> SessionGuard<'a> {
    fn new(handle: &'a PersistenceHandle, session: Box<dyn StoreSession>, generation: u64) -> Self {
        Self {
            handle,
            session: Some(session),
            generation,
        }
    }

    /// Drops the session instead of returning it to the pool.
    pub fn discard(mut self) {
        self.session = None;
    }
}

impl Deref for SessionGuard<'_> {
    type Target = dyn StoreSession;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(s) => s.as_ref(),
            None => unreachable!("session used after discard"),
        }
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.session {
            Some(s) => s.as_mut(),
            None => unreachable!("session used after discard"),
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.handle.give_back(session, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bistro_store::{MemoryBackend, Table};

    fn handle() -> (MemoryBackend, Arc<PersistenceHandle>) {
        let backend = MemoryBackend::new();
        let handle = Arc::new(PersistenceHandle::new(
            Arc::new(backend.clone()),
            &Config::fast(),
        ));
        (backend, handle)
    }

    #[test]
    fn open_is_idempotent() {
        let (_, handle) = handle();
        handle.open().unwrap();
        let generation = handle.generation();
        handle.open().unwrap();
        assert_eq!(handle.generation(), generation);
        assert!(handle.is_open());
    }

    #[test]
    fn open_fails_when_store_down() {
        let (backend, handle) = handle();
        backend.set_offline(true);
        let err = handle.open().unwrap_err();
        assert!(matches!(err, CoreError::Connection { .. }));
        assert_eq!(handle.state(), HandleState::Closed);
        assert!(handle.last_error().is_some());

        backend.set_offline(false);
        handle.open().unwrap();
    }

    #[test]
    fn sessions_are_pooled_until_close() {
        let (backend, handle) = handle();
        handle.open().unwrap();
        {
            let mut s = handle.session().unwrap();
            assert_eq!(s.count(Table::Restaurants).unwrap(), 0);
        }
        assert_eq!(handle.idle_sessions(), 1);

        let held = handle.session().unwrap();
        handle.close();
        drop(held);
        assert_eq!(handle.idle_sessions(), 0);
        assert_eq!(backend.open_sessions(), 0);
    }

    #[test]
    fn session_opens_lazily() {
        let (_, handle) = handle();
        assert_eq!(handle.state(), HandleState::Closed);
        handle.session().unwrap().ping().unwrap();
        assert!(handle.is_open());
    }

    #[test]
    fn suspend_blocks_sessions_until_resume() {
        let (_, handle) = handle();
        handle.open().unwrap();
        handle.suspend();
        assert_eq!(handle.state(), HandleState::Suspended);
        assert!(handle.session().is_err());
        assert!(handle.open().is_err());
        assert!(handle.restart().is_err());

        handle.resume().unwrap();
        assert!(handle.is_open());
    }

    #[test]
    fn restart_bumps_generation() {
        let (_, handle) = handle();
        handle.open().unwrap();
        let before = handle.generation();
        handle.restart().unwrap();
        assert!(handle.generation() > before);
        assert!(handle.is_open());
    }

    #[test]
    fn connection_errors_discard_session() {
        let (backend, handle) = handle();
        handle.open().unwrap();
        assert_eq!(handle.idle_sessions(), 1);
        backend.set_offline(true);
        let result: CoreResult<()> = handle.with_session(|s| Ok(s.ping()?));
        assert!(result.is_err());
        assert_eq!(handle.idle_sessions(), 0);
    }

    #[test]
    fn concurrent_opens_yield_one_generation() {
        let (backend, handle) = handle();
        backend.set_query_delay(Some(Duration::from_millis(20)));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || handle.open())
            })
            .collect();
        for t in threads {
            t.join().unwrap().unwrap();
        }
        assert_eq!(handle.generation(), 1);
    }
}
