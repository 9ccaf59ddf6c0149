//! Advisory lock registry.
//!
//! Hands out one lease per key at a time. A session holds the lease for its
//! device for its whole lifetime; the stager holds one per media path while
//! writing. Dropping the lease releases it, so every exit path, including
//! cancellation and panics, unlocks.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of per-key advisory locks.
#[derive(Debug)]
pub struct LockRegistry<K> {
    slots: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
}

/// Per-device locks.
pub type DeviceLocks = LockRegistry<IpAddr>;

/// Per-media-path locks.
pub type MediaLocks = LockRegistry<PathBuf>;

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct Lease<K> {
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K> Lease<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Clone for LockRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K> Default for LockRegistry<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> LockRegistry<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Take the lock for `key` if it is free.
    pub fn try_acquire(&self, key: &K) -> Option<Lease<K>> {
        let guard = self.slot(key).try_lock_owned().ok()?;
        tracing::debug!("Acquired lock for {:?}", key);
        Some(Lease {
            key: key.clone(),
            _guard: guard,
        })
    }

    /// Wait for the lock for `key`.
    pub async fn acquire(&self, key: &K) -> Lease<K> {
        let guard = self.slot(key).lock_owned().await;
        tracing::debug!("Acquired lock for {:?}", key);
        Lease {
            key: key.clone(),
            _guard: guard,
        }
    }

    /// Whether `key` is currently held.
    pub fn is_locked(&self, key: &K) -> bool {
        self.slot(key).try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_second_lease_is_refused_until_release() {
        let locks = DeviceLocks::new();
        let tv = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40));

        let lease = locks.try_acquire(&tv).expect("first lease");
        assert!(locks.try_acquire(&tv).is_none());
        assert!(locks.is_locked(&tv));

        drop(lease);
        assert!(!locks.is_locked(&tv));
        assert!(locks.try_acquire(&tv).is_some());
    }

    #[test]
    fn test_keys_are_independent() {
        let locks = DeviceLocks::new();
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let _la = locks.try_acquire(&a).unwrap();
        assert!(locks.clone().try_acquire(&b).is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let locks = MediaLocks::new();
        let media = PathBuf::from("/media/usb");
        let lease = locks.acquire(&media).await;

        let waiter = {
            let locks = locks.clone();
            let media = media.clone();
            tokio::spawn(async move { locks.acquire(&media).await.key().clone() })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(lease);
        assert_eq!(waiter.await.unwrap(), media);
    }
}
