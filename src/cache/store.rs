//! Persistent, fingerprint-keyed store of computed book indexes.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/entries/<slot[0..2]>/<slot>.bookindex
//! ```
//!
//! where `slot` is [`Fingerprint::slot_key`]. Writes are staged into a temporary file in
//! the same directory and renamed over the final path, so a reader sees either the
//! previous complete entry or the new complete entry, never a partial one.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::book_index::BookIndex;
use crate::cache::entry::{self, CacheEntry};
use crate::cache::flight::{BuildClaim, InFlightBuilds};
use crate::cache::locks::KeyedLocks;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// Subdirectory holding entry files.
const ENTRIES_DIR: &str = "entries";

/// File extension for entry files.
const ENTRY_EXT: &str = "bookindex";

/// Prefix of staging files. Never matches a published entry.
const STAGING_PREFIX: &str = ".staging-";

/// What a successful [`ArtifactCache::set`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// A new entry was published (possibly superseding an older one).
    Written,
    /// An identical entry was already present; nothing was written.
    Unchanged,
}

/// Asynchronous, concurrency-safe artifact cache rooted at a caller-supplied directory.
///
/// Operations on different fingerprints are independent. For a given slot:
/// - writers are serialized (at most one `set`/`invalidate` in flight),
/// - [`ArtifactCache::claim_build`] lets concurrent callers share one expensive build.
#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    writers: KeyedLocks,
    builds: InFlightBuilds,
}

impl ArtifactCache {
    /// Create a cache rooted at `root`. The directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: KeyedLocks::default(),
            builds: InFlightBuilds::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of the entry for `fingerprint`.
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.slot_path(&fingerprint.slot_key())
    }

    fn slot_path(&self, slot: &str) -> PathBuf {
        self.root
            .join(ENTRIES_DIR)
            .join(&slot[..2])
            .join(format!("{slot}.{ENTRY_EXT}"))
    }

    /// Look up the index stored for `fingerprint`.
    ///
    /// Returns `Ok(None)` on a miss. Absent, stale (same source, different fingerprint),
    /// unreadable and corrupt entries are all misses; corrupt entries are additionally
    /// removed on a best-effort basis. Only cancellation is reported as an error.
    pub async fn get(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<Option<BookIndex>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let path = self.entry_path(fingerprint);
        let read = tokio::select! {
            res = tokio::fs::read(&path) => res,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(%fingerprint, "cache miss: no entry");
                return Ok(None);
            }
            Err(err) => {
                warn!(%fingerprint, path = %path.display(), error = %err, "cache entry unreadable; treating as miss");
                return Ok(None);
            }
        };

        let entry = match CacheEntry::decode(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%fingerprint, path = %path.display(), error = %err, "discarding corrupt cache entry");
                self.discard_corrupt(&fingerprint.slot_key(), &path, &bytes, cancel)
                    .await?;
                return Ok(None);
            }
        };

        if entry.index.fingerprint != *fingerprint {
            debug!(
                %fingerprint,
                stored = %entry.index.fingerprint,
                "cache miss: entry belongs to an older observation of the source"
            );
            return Ok(None);
        }

        debug!(%fingerprint, written_at = %entry.header.written_at, "cache hit");
        Ok(Some(entry.index))
    }

    /// Persist `index` under its own fingerprint.
    ///
    /// Writing content identical to what is already stored is a no-op
    /// ([`SetOutcome::Unchanged`]). Otherwise the new entry atomically replaces whatever
    /// occupied the slot. On failure or cancellation the staged file is removed and the
    /// previous entry, if any, is left untouched.
    pub async fn set(&self, index: &BookIndex, cancel: &CancellationToken) -> Result<SetOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let fingerprint = &index.fingerprint;
        let _writer = self.writers.lock(&fingerprint.slot_key(), cancel).await?;

        let path = self.entry_path(fingerprint);
        let (entry, bytes) = CacheEntry::new(index.clone())?;

        if self.holds_identical(&path, &entry).await {
            debug!(%fingerprint, "identical entry already stored");
            return Ok(SetOutcome::Unchanged);
        }

        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| Error::io(&dir, err))?;

        // Dropping a `NamedTempFile` deletes it, so abandoning the staged file on any early
        // return (including cancellation while the blocking task is still running) cleans up.
        let stage_dir = dir.clone();
        let staging = tokio::task::spawn_blocking(move || stage_entry(&stage_dir, &bytes));
        let staged = tokio::select! {
            res = staging => res??,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let final_path = path.clone();
        tokio::task::spawn_blocking(move || {
            staged
                .persist(&final_path)
                .map(|_| ())
                .map_err(|err| Error::io(&final_path, err.error))
        })
        .await??;

        info!(%fingerprint, path = %path.display(), chapters = index.chapters.len(), "cache entry written");
        Ok(SetOutcome::Written)
    }

    /// Remove the entry for `fingerprint` if the slot currently holds it.
    ///
    /// Returns whether an entry was removed. Entries for other observations of the same
    /// source are left alone.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let _writer = self
            .writers
            .lock(&fingerprint.slot_key(), &CancellationToken::new())
            .await?;

        let path = self.entry_path(fingerprint);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(Error::io(&path, err)),
        };

        let matches = match entry::decode_header(&bytes) {
            Ok(header) => header.fingerprint == *fingerprint,
            // Unreadable entries are removed regardless; they can never be a hit.
            Err(_) => true,
        };
        if !matches {
            return Ok(false);
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(%fingerprint, "cache entry invalidated");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::io(&path, err)),
        }
    }

    /// Remove whatever entry occupies the slot for the source at `source_path`.
    ///
    /// Unlike [`ArtifactCache::invalidate`] this needs no current fingerprint, so it also
    /// clears entries for sources that changed, were recorded in another fingerprint mode,
    /// or no longer exist. The path is canonicalized when it still resolves and made
    /// absolute otherwise.
    pub async fn invalidate_source(&self, source_path: impl AsRef<Path>) -> Result<bool> {
        let source_path = source_path.as_ref();
        let resolved = match tokio::fs::canonicalize(source_path).await {
            Ok(canonical) => canonical,
            Err(_) => std::path::absolute(source_path).map_err(|err| Error::io(source_path, err))?,
        };

        let slot = Fingerprint::slot_key_for(&resolved);
        let _writer = self.writers.lock(&slot, &CancellationToken::new()).await?;

        let path = self.slot_path(&slot);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(source = %resolved.display(), "cache slot cleared");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::io(&path, err)),
        }
    }

    /// Remove every entry (and stray staging file). Returns the number of entries removed.
    pub async fn clear(&self) -> Result<usize> {
        let entries_dir = self.root.join(ENTRIES_DIR);
        let mut shards = match tokio::fs::read_dir(&entries_dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(Error::io(&entries_dir, err)),
        };

        let mut removed = 0usize;
        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|err| Error::io(&entries_dir, err))?
        {
            let shard_path = shard.path();
            let is_dir = shard
                .file_type()
                .await
                .map_err(|err| Error::io(&shard_path, err))?
                .is_dir();
            if !is_dir {
                continue;
            }

            let mut files = tokio::fs::read_dir(&shard_path)
                .await
                .map_err(|err| Error::io(&shard_path, err))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|err| Error::io(&shard_path, err))?
            {
                let file_path = file.path();
                let is_entry = file_path.extension().is_some_and(|ext| ext == ENTRY_EXT);
                let is_staging = file
                    .file_name()
                    .to_string_lossy()
                    .starts_with(STAGING_PREFIX);
                if !is_entry && !is_staging {
                    continue;
                }

                match tokio::fs::remove_file(&file_path).await {
                    Ok(()) if is_entry => removed += 1,
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(Error::io(&file_path, err)),
                }
            }
        }

        info!(root = %self.root.display(), removed, "cache cleared");
        Ok(removed)
    }

    /// Lead the build for `fingerprint`, or follow the one already running.
    ///
    /// A leader should re-check [`ArtifactCache::get`] before building (a previous leader
    /// may have persisted in the meantime) and [`publish`](crate::cache::BuildLease::publish)
    /// its index before dropping the lease.
    pub fn claim_build(&self, fingerprint: &Fingerprint) -> BuildClaim {
        self.builds.claim(&fingerprint.digest())
    }

    /// Remove a corrupt entry, unless a writer replaced it after `seen` was read.
    async fn discard_corrupt(
        &self,
        slot: &str,
        path: &Path,
        seen: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _writer = self.writers.lock(slot, cancel).await?;

        match tokio::fs::read(path).await {
            Ok(current) if current == seen => {}
            _ => return Ok(()),
        }
        if let Err(err) = tokio::fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %err, "failed to remove corrupt cache entry");
            }
        }
        Ok(())
    }

    async fn holds_identical(&self, path: &Path, entry: &CacheEntry) -> bool {
        let Ok(bytes) = tokio::fs::read(path).await else {
            return false;
        };
        match entry::decode_header(&bytes) {
            Ok(existing) => {
                existing.fingerprint == entry.header.fingerprint
                    && existing.checksum == entry.header.checksum
                    && CacheEntry::decode(&bytes).is_ok()
            }
            Err(_) => false,
        }
    }
}

fn stage_entry(dir: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let mut staged = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|err| Error::io(dir, err))?;

    staged
        .write_all(bytes)
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|err| Error::io(staged.path(), err))?;

    Ok(staged)
}
