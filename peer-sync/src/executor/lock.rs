//! Per-(owner, peer) exclusivity for sync attempts.

use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

type LockKey = (i64, i64);

/// Registry of pairs with an attempt in flight. Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct SyncLocks {
    held: Arc<DashMap<LockKey, DateTime<Utc>>>,
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `(owner_id, peer_id)` or fail immediately.
    pub fn try_acquire(&self, owner_id: i64, peer_id: i64) -> Result<SyncLockGuard> {
        match self.held.entry((owner_id, peer_id)) {
            Entry::Occupied(_) => Err(SyncError::AlreadyRunning { owner_id, peer_id }),
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Ok(SyncLockGuard {
                    held: Arc::clone(&self.held),
                    key: (owner_id, peer_id),
                })
            }
        }
    }

    pub fn is_held(&self, owner_id: i64, peer_id: i64) -> bool {
        self.held.contains_key(&(owner_id, peer_id))
    }

    /// When the current holder took the lock.
    pub fn held_since(&self, owner_id: i64, peer_id: i64) -> Option<DateTime<Utc>> {
        self.held.get(&(owner_id, peer_id)).map(|at| *at)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Releases its pair when dropped, including on early return and unwind.
#[derive(Debug)]
pub struct SyncLockGuard {
    held: Arc<DashMap<LockKey, DateTime<Utc>>>,
    key: LockKey,
}

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_fast() {
        let locks = SyncLocks::new();
        let guard = locks.try_acquire(5, 1).unwrap();
        assert!(locks.is_held(5, 1));
        assert!(locks.held_since(5, 1).is_some());

        let err = locks.try_acquire(5, 1).unwrap_err();
        assert!(err.is_already_running());

        drop(guard);
        assert!(!locks.is_held(5, 1));
        assert!(locks.try_acquire(5, 1).is_ok());
    }

    #[test]
    fn test_pairs_are_independent() {
        let locks = SyncLocks::new();
        let _a = locks.try_acquire(5, 1).unwrap();
        let _b = locks.try_acquire(5, 2).unwrap();
        let _c = locks.try_acquire(6, 1).unwrap();
        assert_eq!(locks.held_count(), 3);
    }

    #[test]
    fn test_released_on_panic() {
        let locks = SyncLocks::new();
        let shared = locks.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = shared.try_acquire(1, 1).unwrap();
            panic!("attempt blew up");
        }));
        assert!(result.is_err());
        assert!(!locks.is_held(1, 1));
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let locks = SyncLocks::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                std::thread::spawn(move || locks.try_acquire(9, 9).map(std::mem::forget).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
