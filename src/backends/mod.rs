//! Built-in [`TranscriptionService`](crate::TranscriptionService) adapters.

/// Remote ASR service over HTTP.
#[cfg(feature = "http-asr")]
pub mod http;

/// In-process whisper.cpp.
#[cfg(feature = "whisper")]
pub mod whisper;
