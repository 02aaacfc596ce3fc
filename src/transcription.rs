//! The transcription service contract consumed by the processor.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::asr::AsrResponse;
use crate::buffer::{AudioBuffer, prepare_chapter_buffer};
use crate::error::Result;
use crate::opts::TranscribeOpts;
use crate::segmenter::ChapterContext;

/// A (possibly remote, possibly slow, possibly failing) speech recognizer.
///
/// Implementations surface failures (`UnsupportedFormat`, `Decode`,
/// `ServiceUnavailable`, ...) to the caller instead of retrying internally, and return
/// [`Error::Cancelled`](crate::Error::Cancelled) promptly once `cancel` fires.
pub trait TranscriptionService: Send + Sync {
    /// Produce the audio the service will transcribe for `chapter`.
    ///
    /// Must be deterministic for identical chapter context and source bytes, and must not
    /// cache anything itself. The default decodes the chapter's slice of the source to
    /// 16 kHz mono.
    fn prepare_buffer(
        &self,
        chapter: &ChapterContext,
    ) -> impl Future<Output = Result<AudioBuffer>> + Send {
        prepare_chapter_buffer(chapter)
    }

    /// Transcribe a prepared chapter buffer.
    fn transcribe(
        &self,
        chapter: &ChapterContext,
        audio: AudioBuffer,
        opts: &TranscribeOpts,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<AsrResponse>> + Send;
}
