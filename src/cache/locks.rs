//! Keyed async mutual exclusion.
//!
//! A map of per-key `tokio::sync::Mutex`es. Keys are created on first use and removed
//! again when the last holder or waiter goes away, so the map only ever contains keys
//! that are actively contended.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    map: Arc<Mutex<LockMap>>,
}

/// Exclusive hold on one key. Released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<Mutex<LockMap>>,
}

impl KeyedLocks {
    /// Wait for exclusive access to `key`, or until `cancel` fires.
    pub(crate) async fn lock(&self, key: &str, cancel: &CancellationToken) -> Result<KeyGuard> {
        let mutex = {
            let mut map = lock_map(&self.map);
            map.entry(key.to_owned()).or_default().clone()
        };

        // Built before waiting so that a cancelled waiter still prunes the map on drop.
        let mut pending = KeyGuard {
            key: key.to_owned(),
            guard: None,
            map: self.map.clone(),
        };

        let acquired = tokio::select! {
            guard = mutex.lock_owned() => Some(guard),
            _ = cancel.cancelled() => None,
        };

        match acquired {
            Some(guard) => {
                pending.guard = Some(guard);
                Ok(pending)
            }
            None => Err(Error::Cancelled),
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        lock_map(&self.map).len()
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so the strong count below only reflects the map and other waiters.
        drop(self.guard.take());

        let mut map = lock_map(&self.map);
        let idle = map
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1);
        if idle {
            map.remove(&self.key);
        }
    }
}

fn lock_map(map: &Mutex<LockMap>) -> std::sync::MutexGuard<'_, LockMap> {
    // Nothing in the map can be left half-updated by a panicking holder.
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
