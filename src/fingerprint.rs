//! Source identity resolution.
//!
//! A [`Fingerprint`] captures everything about a source document that can change the
//! outcome of processing it. Resolution only reads filesystem metadata, plus the file
//! contents when [`FingerprintMode::ContentHash`] is requested.
//!
//! Fingerprints are conservative: any change in size, modification time (or content, in
//! hashing mode) yields a different fingerprint, so the worst case is a spurious cache
//! miss, never a stale hit.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::opts::FingerprintMode;

/// Block size used when streaming a file through the content hasher.
const HASH_BLOCK_BYTES: usize = 64 * 1024;

/// A resolved observation of a source file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// Canonical absolute path.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
    /// Hex BLAKE3 digest of the contents, when resolved in content-hash mode.
    pub content_hash: Option<String>,
}

/// Stable identity of a [`SourceDocument`]'s processing-relevant state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Canonical source path. Serialized as a string, or as raw bytes when it is not UTF-8.
    #[serde(with = "path_repr")]
    pub path: PathBuf,
    pub size: u64,
    pub modified_secs: i64,
    pub modified_nanos: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl SourceDocument {
    /// Resolve `path` into a source document, reading the same metadata fields every call.
    ///
    /// Fails with [`Error::SourceNotFound`] when the path does not resolve to a regular
    /// file, and with [`Error::Io`] when metadata (or contents) cannot be read.
    pub async fn resolve(
        path: impl AsRef<Path>,
        mode: FingerprintMode,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let path = path.as_ref();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|err| not_found_or_io(path, err))?;
        let meta = tokio::fs::metadata(&canonical)
            .await
            .map_err(|err| not_found_or_io(&canonical, err))?;

        if !meta.is_file() {
            return Err(Error::SourceNotFound { path: canonical });
        }

        let modified = meta.modified().map_err(|err| Error::io(&canonical, err))?;

        let content_hash = match mode {
            FingerprintMode::Metadata => None,
            FingerprintMode::ContentHash => Some(hash_file(&canonical, cancel).await?),
        };

        debug!(path = %canonical.display(), size = meta.len(), ?mode, "resolved source document");

        Ok(Self {
            path: canonical,
            size: meta.len(),
            modified,
            content_hash,
        })
    }

    /// Derive the cache fingerprint for this observation.
    pub fn fingerprint(&self) -> Fingerprint {
        let (modified_secs, modified_nanos) = split_system_time(self.modified);
        Fingerprint {
            path: self.path.clone(),
            size: self.size,
            modified_secs,
            modified_nanos,
            content_hash: self.content_hash.clone(),
        }
    }

    /// Human-friendly title derived from the file name.
    pub fn file_stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl Fingerprint {
    /// Convenience wrapper: resolve `path` and derive its fingerprint.
    pub async fn of(
        path: impl AsRef<Path>,
        mode: FingerprintMode,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        Ok(SourceDocument::resolve(path, mode, cancel).await?.fingerprint())
    }

    /// Hex BLAKE3 digest over every field. Equal fingerprints have equal digests.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hash_path(&mut hasher, &self.path);
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.modified_secs.to_le_bytes());
        hasher.update(&self.modified_nanos.to_le_bytes());
        match &self.content_hash {
            Some(hash) => {
                hasher.update(&[1]);
                hasher.update(hash.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Hex BLAKE3 digest of the source path only.
    ///
    /// Selects the persistent slot, so a newer observation of the same source replaces the
    /// older one instead of accumulating next to it.
    pub fn slot_key(&self) -> String {
        Self::slot_key_for(&self.path)
    }

    /// Slot key for a canonical source path, without resolving the source.
    pub fn slot_key_for(path: &Path) -> String {
        let mut hasher = blake3::Hasher::new();
        hash_path(&mut hasher, path);
        hasher.finalize().to_hex().to_string()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let digest = self.digest();
        f.write_str(&digest[..16])
    }
}

fn hash_path(hasher: &mut blake3::Hasher, path: &Path) {
    let raw = path.as_os_str().as_encoded_bytes();
    hasher.update(&(raw.len() as u64).to_le_bytes());
    hasher.update(raw);
}

/// Serde representation of source paths that survives non-UTF-8 file names.
mod path_repr {
    use std::path::{Path, PathBuf};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        match path.to_str() {
            Some(text) => serializer.serialize_str(text),
            None => raw_bytes(path).serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => PathBuf::from(text),
            Repr::Bytes(bytes) => from_raw_bytes(bytes),
        })
    }

    #[cfg(unix)]
    fn raw_bytes(path: &Path) -> Vec<u8> {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    }

    #[cfg(not(unix))]
    fn raw_bytes(path: &Path) -> Vec<u8> {
        path.to_string_lossy().into_owned().into_bytes()
    }

    #[cfg(unix)]
    fn from_raw_bytes(bytes: Vec<u8>) -> PathBuf {
        use std::os::unix::ffi::OsStringExt;
        std::ffi::OsString::from_vec(bytes).into()
    }

    #[cfg(not(unix))]
    fn from_raw_bytes(bytes: Vec<u8>) -> PathBuf {
        String::from_utf8_lossy(&bytes).into_owned().into()
    }
}

fn not_found_or_io(path: &Path, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::SourceNotFound {
            path: path.to_path_buf(),
        }
    } else {
        Error::io(path, err)
    }
}

/// Split a timestamp into signed seconds and sub-second nanos relative to the Unix epoch.
///
/// Pre-epoch times keep a non-negative nanos component (floor semantics).
fn split_system_time(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => (after.as_secs() as i64, after.subsec_nanos()),
        Err(err) => {
            let before = err.duration();
            let secs = before.as_secs() as i64;
            let nanos = before.subsec_nanos();
            if nanos == 0 {
                (-secs, 0)
            } else {
                (-secs - 1, 1_000_000_000 - nanos)
            }
        }
    }
}

async fn hash_file(path: &Path, cancel: &CancellationToken) -> Result<String> {
    let owned = path.to_path_buf();
    let token = cancel.clone();
    let task = tokio::task::spawn_blocking(move || hash_file_blocking(&owned, &token));

    tokio::select! {
        res = task => res?,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

fn hash_file_blocking(path: &Path, cancel: &CancellationToken) -> Result<String> {
    let mut file = File::open(path).map_err(|err| not_found_or_io(path, err))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BLOCK_BYTES];

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = file.read(&mut buf).map_err(|err| Error::io(path, err))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}
