//! Stateless cache entry points for hosting applications.
//!
//! These wrap a short-lived [`ArtifactCache`]; hosts that process many sources
//! concurrently should share one `ArtifactCache` (or a [`Processor`](crate::Processor))
//! so the per-key locks are shared too.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tokio_util::sync::CancellationToken;

use crate::book_index::BookIndex;
use crate::cache::store::{ArtifactCache, SetOutcome};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::opts::FingerprintMode;

/// Fallback cache root: the platform cache directory for `bookindex`.
///
/// e.g. `~/.cache/bookindex` on Linux, `~/Library/Caches/bookindex` on macOS and
/// `%LOCALAPPDATA%\bookindex\cache` on Windows. The directory is not created here; the
/// cache creates it on first write.
pub fn default_cache_root() -> Result<PathBuf> {
    ProjectDirs::from("", "", "bookindex")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .ok_or_else(|| Error::msg("could not determine a home directory for the default cache root"))
}

/// Load the cached index for the source at `source_path`, if one is present and current.
///
/// Uses metadata fingerprinting. Source resolution failures are reported as errors;
/// every flavor of cache miss is `Ok(None)`.
pub async fn try_load(
    source_path: impl AsRef<Path>,
    cache_root: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<Option<BookIndex>> {
    let cache = open(cache_root)?;
    let fingerprint = Fingerprint::of(source_path, FingerprintMode::Metadata, cancel).await?;
    cache.get(&fingerprint, cancel).await
}

/// Persist `index` under its embedded fingerprint.
pub async fn write(
    index: &BookIndex,
    cache_root: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<SetOutcome> {
    open(cache_root)?.set(index, cancel).await
}

fn open(cache_root: Option<&Path>) -> Result<ArtifactCache> {
    let root = match cache_root {
        Some(root) => root.to_path_buf(),
        None => default_cache_root()?,
    };
    Ok(ArtifactCache::new(root))
}
