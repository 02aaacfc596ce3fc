//! In-flight builds, keyed by fingerprint digest.
//!
//! The first caller to claim a key leads the build; everyone who claims the same key while
//! the lease is alive follows it and receives whatever index the leader publishes, whether
//! or not that index ends up persisted. A leader that drops its lease without publishing
//! (error, cancellation) releases the followers empty-handed so one of them can lead.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::book_index::BookIndex;
use crate::error::{Error, Result};

type Published = watch::Receiver<Option<BookIndex>>;
type BuildMap = HashMap<String, Published>;

#[derive(Default)]
pub(crate) struct InFlightBuilds {
    map: Arc<Mutex<BuildMap>>,
}

/// Outcome of [`ArtifactCache::claim_build`](crate::cache::ArtifactCache::claim_build).
#[derive(Debug)]
pub enum BuildClaim {
    /// No build was running; the caller runs the pipeline.
    Lead(BuildLease),
    /// Another caller is building the same observation.
    Follow(BuildWatch),
}

/// Held by the one caller running the pipeline for a fingerprint. Dropping it ends the
/// build; followers that have not seen a published index are released with nothing.
pub struct BuildLease {
    key: String,
    tx: watch::Sender<Option<BookIndex>>,
    map: Arc<Mutex<BuildMap>>,
}

/// A follower's view of someone else's build.
pub struct BuildWatch {
    rx: Published,
}

impl InFlightBuilds {
    pub(crate) fn claim(&self, key: &str) -> BuildClaim {
        let mut map = lock_map(&self.map);
        if let Some(rx) = map.get(key) {
            return BuildClaim::Follow(BuildWatch { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(None);
        map.insert(key.to_owned(), rx);
        BuildClaim::Lead(BuildLease {
            key: key.to_owned(),
            tx,
            map: self.map.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        lock_map(&self.map).len()
    }
}

impl fmt::Debug for InFlightBuilds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightBuilds")
            .field("builds", &lock_map(&self.map).len())
            .finish()
    }
}

impl BuildLease {
    /// Hand `index` to every current and late-arriving follower of this build.
    pub fn publish(&self, index: &BookIndex) {
        self.tx.send_replace(Some(index.clone()));
    }
}

impl fmt::Debug for BuildLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildLease").field("key", &self.key).finish()
    }
}

impl fmt::Debug for BuildWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildWatch").finish_non_exhaustive()
    }
}

impl Drop for BuildLease {
    fn drop(&mut self) {
        // Unregister before `tx` drops, so a new claim can never find a closed channel.
        lock_map(&self.map).remove(&self.key);
    }
}

impl BuildWatch {
    /// Wait for the leader to finish.
    ///
    /// `Ok(Some(index))` when the leader published an index, `Ok(None)` when it gave up
    /// without one.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<Option<BookIndex>> {
        let finished = async {
            match self.rx.wait_for(Option::is_some).await {
                Ok(published) => published.clone(),
                Err(_) => None,
            }
        };

        tokio::select! {
            index = finished => Ok(index),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

fn lock_map(map: &Mutex<BuildMap>) -> MutexGuard<'_, BuildMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
