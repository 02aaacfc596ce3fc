//! Persistent artifact cache for computed book indexes.
//!
//! # Architecture
//!
//! * [`store`]: the [`ArtifactCache`] itself (lookup, atomic publish, invalidation).
//! * [`entry`]: the self-describing on-disk entry format and its validation.
//! * [`api`]: stateless convenience functions for hosts that only have a source path.
//! * `locks`: keyed async mutual exclusion serializing writers per slot.
//! * `flight`: the in-flight build registry behind [`ArtifactCache::claim_build`].
//!
//! # Invalidation
//!
//! Entries are keyed by the source's canonical path and validated against the full
//! [`Fingerprint`](crate::fingerprint::Fingerprint) (size, mtime, optional content hash).
//! If any of these change the stored entry is stale: lookups miss and the next write
//! replaces it.

pub mod api;
pub mod entry;
mod flight;
mod locks;
pub mod store;

pub use api::{default_cache_root, try_load, write};
pub use entry::CacheEntry;
pub use flight::{BuildClaim, BuildLease, BuildWatch};
pub use store::{ArtifactCache, SetOutcome};
