//! On-disk cache entry format.
//!
//! An entry is a single-line JSON header, a newline, then the serialized [`BookIndex`]:
//!
//! ```text
//! {"magic":"bookindex-cache","format_version":1,"schema_version":1,...}\n
//! {"schema_version":1,"fingerprint":{...},"title":"...","chapters":[...]}
//! ```
//!
//! The header records the payload length and BLAKE3 checksum so truncation and bit rot
//! are detected before the payload is parsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::book_index::{BookIndex, SCHEMA_VERSION};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// Magic string identifying a bookindex cache entry.
const ENTRY_MAGIC: &str = "bookindex-cache";

/// Current entry envelope version. Increment on breaking changes to the header layout.
pub const ENTRY_FORMAT_VERSION: u32 = 1;

/// Header written in front of every persisted index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub magic: String,
    pub format_version: u32,
    pub schema_version: u32,
    pub fingerprint: Fingerprint,
    pub written_at: DateTime<Utc>,
    pub payload_len: u64,
    /// Hex BLAKE3 digest of the payload bytes.
    pub checksum: String,
}

/// A decoded cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub header: EntryHeader,
    pub index: BookIndex,
}

impl CacheEntry {
    /// Wrap `index` in a fresh header stamped with the current time.
    pub fn new(index: BookIndex) -> Result<(Self, Vec<u8>)> {
        let payload = index.to_bytes()?;
        let header = EntryHeader {
            magic: ENTRY_MAGIC.to_owned(),
            format_version: ENTRY_FORMAT_VERSION,
            schema_version: index.schema_version,
            fingerprint: index.fingerprint.clone(),
            written_at: Utc::now(),
            payload_len: payload.len() as u64,
            checksum: blake3::hash(&payload).to_hex().to_string(),
        };

        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&payload);

        Ok((Self { header, index }, bytes))
    }

    /// Decode and validate an entry read from disk.
    ///
    /// Every validation failure (bad magic, unknown version, truncation, checksum mismatch,
    /// malformed JSON) is reported as [`Error::CorruptEntry`] or [`Error::SchemaMismatch`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = decode_header(bytes)?;
        let split = header_len(bytes)?;
        let payload = &bytes[split + 1..];

        if payload.len() as u64 != header.payload_len {
            return Err(Error::CorruptEntry(format!(
                "payload is {} bytes, header declares {}",
                payload.len(),
                header.payload_len
            )));
        }

        let checksum = blake3::hash(payload).to_hex().to_string();
        if checksum != header.checksum {
            return Err(Error::CorruptEntry("payload checksum mismatch".into()));
        }

        let index = BookIndex::from_bytes(payload).map_err(|err| match err {
            Error::SchemaMismatch { .. } => err,
            other => Error::CorruptEntry(format!("payload did not parse: {other}")),
        })?;

        if index.fingerprint != header.fingerprint {
            return Err(Error::CorruptEntry(
                "payload fingerprint disagrees with header".into(),
            ));
        }

        Ok(Self { header, index })
    }
}

/// Decode only the header, validating magic and versions.
///
/// Cheap enough to run before a write to detect an identical existing entry.
pub fn decode_header(bytes: &[u8]) -> Result<EntryHeader> {
    let split = header_len(bytes)?;
    let header: EntryHeader = serde_json::from_slice(&bytes[..split])
        .map_err(|err| Error::CorruptEntry(format!("header did not parse: {err}")))?;

    if header.magic != ENTRY_MAGIC {
        return Err(Error::CorruptEntry(format!(
            "unexpected magic '{}'",
            header.magic
        )));
    }
    if header.format_version != ENTRY_FORMAT_VERSION {
        return Err(Error::CorruptEntry(format!(
            "unsupported entry format version {}",
            header.format_version
        )));
    }
    if header.schema_version != SCHEMA_VERSION {
        return Err(Error::SchemaMismatch {
            found: header.schema_version,
            expected: SCHEMA_VERSION,
        });
    }

    Ok(header)
}

fn header_len(bytes: &[u8]) -> Result<usize> {
    bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::CorruptEntry("missing header terminator".into()))
}
