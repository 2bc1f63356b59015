//! Change feed for observing cache state changes.
//!
//! The feed carries "state changed" notifications only: which entity, what
//! kind of change, and the natural key. Listeners re-read `get()`/`list()`
//! from the cache afterwards; payloads never travel through the feed.
//!
//! # Usage
//!
//! ```rust,ignore
//! let receiver = ctx.feed().subscribe();
//!
//! std::thread::spawn(move || {
//!     while let Ok(event) = receiver.recv() {
//!         println!("{} {:?} {}", event.entity, event.kind, event.key);
//!     }
//! });
//! ```

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// The cached entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Restaurants, keyed by name.
    Restaurant,
    /// Reviews, keyed by id.
    Review,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Restaurant => "restaurant",
            Self::Review => "review",
        })
    }
}

/// What happened to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new entry was added.
    Insert,
    /// An entry changed. `previous_key` is set when the key itself changed.
    Update {
        /// The key before a rename.
        previous_key: Option<String>,
    },
    /// An entry was removed.
    Delete,
    /// The whole map was replaced from the store.
    Reloaded {
        /// Entries after the reload.
        count: usize,
    },
    /// A reload gave up; the cache is empty.
    SyncFailed {
        /// Last underlying error.
        message: String,
    },
}

/// A single notification from the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Position in the feed, starting at 1.
    pub sequence: u64,
    /// Which cache changed.
    pub entity: EntityKind,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Natural key of the affected entry (empty for whole-cache events).
    pub key: String,
}

/// Distributes cache notifications to subscribers.
///
/// The change feed:
/// - Emits only after the cache lock is released
/// - Preserves emission order
/// - Supports multiple subscribers
/// - Keeps a bounded history for polling
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
    history: RwLock<VecDeque<ChangeEvent>>,
    max_history: usize,
    sequence: AtomicU64,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    /// Creates a new change feed.
    pub fn new() -> Self {
        Self::with_max_history(10_000)
    }

    /// Creates a change feed with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
            sequence: AtomicU64::new(0),
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes an event and returns its sequence number.
    pub fn emit(&self, entity: EntityKind, kind: ChangeKind, key: impl Into<String>) -> u64 {
        let mut history = self.history.write();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = ChangeEvent {
            sequence,
            entity,
            kind,
            key: key.into(),
        };
        if self.max_history > 0 {
            if history.len() == self.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // History lock is held so subscribers observe sequence order.
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        sequence
    }

    /// Returns events with sequence > cursor, up to limit.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest sequence number emitted.
    pub fn latest_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("latest_sequence", &self.latest_sequence())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
