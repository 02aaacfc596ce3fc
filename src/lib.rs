//! `bookindex` — a content-fingerprinted, concurrency-safe cache of audiobook chapter
//! transcriptions.
//!
//! This crate provides:
//! - Source identity resolution (path, size, mtime, optional BLAKE3 content hash)
//! - A persistent artifact cache with atomic publish and per-key build/write locks
//! - A transcription service contract plus HTTP and whisper.cpp adapters
//! - The [`Processor`] that ties them together: cache hit, or segment → transcribe →
//!   assemble → persist
//!
//! Most consumers should start with [`Processor`] and an [`ArtifactCache`], or the
//! stateless [`cache::try_load`] / [`cache::write`] functions.

// High-level API (most consumers should start here).
pub mod opts;
pub mod processor;

// Data model.
pub mod asr;
pub mod book_index;
pub mod fingerprint;

// Persistent cache.
pub mod cache;

// Segmentation and transcription contracts.
pub mod segmenter;
pub mod transcription;

// Audio preparation.
pub mod buffer;
pub mod decoder;
pub mod wav;

// Built-in transcription service adapters.
pub mod backends;

// Logging configuration.
#[cfg(feature = "logging")]
pub mod logging;

mod audio_pipeline;
mod decode;
mod demux;
mod error;

pub use asr::{AsrResponse, WordToken};
pub use audio_pipeline::TARGET_SAMPLE_RATE;
pub use book_index::{BookIndex, Chapter, ChapterTranscript, SCHEMA_VERSION};
pub use buffer::AudioBuffer;
pub use cache::{ArtifactCache, SetOutcome};
pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, SourceDocument};
pub use opts::{FingerprintMode, ProcessOpts, TranscribeOpts};
pub use processor::{CacheStatus, PersistStatus, ProcessOutcome, Processor, Stage};
pub use segmenter::{ChapterContext, FixedWindowSegmenter, Segmentation, Segmenter};
pub use transcription::TranscriptionService;

#[cfg(feature = "logging")]
pub use logging::init as init_logging;

/// Re-exported so callers don't need a direct `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
