//! The persisted result of processing one source document.

use serde::{Deserialize, Serialize};

use crate::asr::{AsrResponse, WordToken};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// Current BookIndex schema version.
///
/// Increment on any incompatible change to the serialized form. Readers treat other
/// versions as a cache miss rather than attempting to upgrade them.
pub const SCHEMA_VERSION: u32 = 1;

/// Structured index of a processed source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookIndex {
    pub schema_version: u32,
    /// Identity of the source observation this index was derived from.
    pub fingerprint: Fingerprint,
    pub title: String,
    pub duration_seconds: f64,
    /// Chapters in segmentation order.
    pub chapters: Vec<Chapter>,
}

/// One chapter descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    /// Zero-based position in segmentation order.
    pub index: usize,
    pub title: String,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub transcript: ChapterTranscript,
}

/// Transcription outcome for a chapter.
///
/// A failed chapter keeps its slot in the index with the failure reason; it is never
/// dropped or filled with placeholder text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChapterTranscript {
    Transcribed(AsrResponse),
    Failed { reason: String },
}

impl BookIndex {
    pub fn new(
        fingerprint: Fingerprint,
        title: impl Into<String>,
        duration_seconds: f64,
        chapters: Vec<Chapter>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            fingerprint,
            title: title.into(),
            duration_seconds,
            chapters,
        }
    }

    /// Whether every chapter was transcribed successfully.
    pub fn is_complete(&self) -> bool {
        self.chapters
            .iter()
            .all(|chapter| chapter.transcript.is_transcribed())
    }

    /// Chapters carrying a failure marker.
    pub fn failed_chapters(&self) -> impl Iterator<Item = &Chapter> {
        self.chapters
            .iter()
            .filter(|chapter| !chapter.transcript.is_transcribed())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize an index, rejecting schema versions this build does not understand.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let index: Self = serde_json::from_slice(bytes)?;
        if index.schema_version != SCHEMA_VERSION {
            return Err(Error::SchemaMismatch {
                found: index.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(index)
    }
}

impl Chapter {
    pub fn duration_seconds(&self) -> f64 {
        (self.end_seconds - self.start_seconds).max(0.0)
    }

    /// Transcribed tokens shifted from chapter-relative into book time.
    ///
    /// Empty for failed chapters.
    pub fn absolute_tokens(&self) -> Vec<WordToken> {
        match &self.transcript {
            ChapterTranscript::Transcribed(resp) => resp
                .tokens
                .iter()
                .map(|token| token.offset_by(self.start_seconds))
                .collect(),
            ChapterTranscript::Failed { .. } => Vec::new(),
        }
    }
}

impl ChapterTranscript {
    pub fn is_transcribed(&self) -> bool {
        matches!(self, Self::Transcribed(_))
    }

    pub fn response(&self) -> Option<&AsrResponse> {
        match self {
            Self::Transcribed(resp) => Some(resp),
            Self::Failed { .. } => None,
        }
    }
}
