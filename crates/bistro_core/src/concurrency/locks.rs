//! Read/write locks with a fixed acquisition order.
//!
//! Each [`RankedRwLock`] carries a [`LockRank`]. A thread may only acquire
//! a lock whose rank is strictly greater than every rank it already holds.
//! With `Review < Restaurant` this enforces the system-wide order
//! "review cache, then restaurant cache".
//!
//! A violation is a programming error: it panics in debug builds and is
//! logged in release builds.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

/// Position of a lock in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    /// The review cache map.
    Review = 1,
    /// The restaurant cache map.
    Restaurant = 2,
}

thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

fn enter(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(top) = held.iter().max() {
            if *top >= rank {
                tracing::error!(?rank, held = ?*held, "lock order violation");
                if cfg!(debug_assertions) {
                    panic!("lock order violation: acquiring {rank:?} while holding {held:?}");
                }
            }
        }
        held.push(rank);
    });
}

fn exit(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|r| *r == rank) {
            held.remove(pos);
        }
    });
}

/// Ranks held by the current thread, in acquisition order.
pub fn held_ranks() -> Vec<LockRank> {
    HELD.with(|held| held.borrow().clone())
}

/// A `parking_lot` read/write lock that checks acquisition order.
#[derive(Debug)]
pub struct RankedRwLock<T> {
    rank: LockRank,
    inner: RwLock<T>,
}

impl<T> RankedRwLock<T> {
    /// Creates a lock at `rank`.
    pub fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: RwLock::new(value),
        }
    }

    /// The lock's rank.
    pub fn rank(&self) -> LockRank {
        self.rank
    }

    /// Acquires shared access.
    pub fn read(&self) -> RankedReadGuard<'_, T> {
        enter(self.rank);
        RankedReadGuard {
            guard: self.inner.read(),
            rank: self.rank,
        }
    }

    /// Acquires exclusive access.
    pub fn write(&self) -> RankedWriteGuard<'_, T> {
        enter(self.rank);
        RankedWriteGuard {
            guard: self.inner.write(),
            rank: self.rank,
        }
    }

    /// Runs `f` under the read lock. The lock is released on every exit
    /// path, including unwinding.
    pub fn with_read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.read();
        f(&guard)
    }

    /// Runs `f` under the write lock. The lock is released on every exit
    /// path, including unwinding.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.write();
        f(&mut guard)
    }
}

/// Shared guard for a [`RankedRwLock`].
pub struct RankedReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for RankedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for RankedReadGuard<'_, T> {
    fn drop(&mut self) {
        exit(self.rank);
    }
}

/// Exclusive guard for a [`RankedRwLock`].
pub struct RankedWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for RankedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedWriteGuard<'_, T> {
    fn drop(&mut self) {
        exit(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ordered_acquisition_is_allowed() {
        let reviews = RankedRwLock::new(LockRank::Review, 1);
        let restaurants = RankedRwLock::new(LockRank::Restaurant, 2);

        let r = reviews.read();
        let mut w = restaurants.write();
        *w += *r;
        assert_eq!(held_ranks(), vec![LockRank::Review, LockRank::Restaurant]);
        drop(w);
        drop(r);
        assert!(held_ranks().is_empty());
        assert_eq!(*restaurants.read(), 3);
    }

    #[test]
    fn guards_release_on_panic() {
        let lock = Arc::new(RankedRwLock::new(LockRank::Review, 0));
        let cloned = Arc::clone(&lock);
        let result = thread::spawn(move || {
            cloned.with_write(|v| {
                *v = 1;
                panic!("boom");
            })
        })
        .join();
        assert!(result.is_err());
        assert_eq!(lock.with_read(|v| *v), 1);
        assert!(held_ranks().is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn reverse_order_panics_in_debug() {
        let reviews = RankedRwLock::new(LockRank::Review, ());
        let restaurants = RankedRwLock::new(LockRank::Restaurant, ());
        let _r = restaurants.read();
        let _w = reviews.write();
    }
}
