//! Chapter buffer preparation.
//!
//! Seeks the source to the chapter start, decodes and normalizes it to 16 kHz mono and
//! keeps only the samples that fall inside the chapter. The result depends only on the
//! chapter bounds and the source bytes.

use tracing::debug;

use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::decoder::{SamplesSink, StreamDecodeOpts, decode_file_to_stream};
use crate::error::{Error, Result};
use crate::segmenter::ChapterContext;

/// Mono PCM for one chapter, ready for a transcription service.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Position of the first sample in book time.
    pub offset_seconds: f64,
}

impl AudioBuffer {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode the chapter's slice of its source into an [`AudioBuffer`].
///
/// Decoding runs on a blocking thread, starts near the chapter start and stops as soon
/// as the chapter end is reached.
pub async fn prepare_chapter_buffer(chapter: &ChapterContext) -> Result<AudioBuffer> {
    let context = chapter.clone();
    let buffer = tokio::task::spawn_blocking(move || decode_chapter(&context)).await??;

    debug!(
        chapter = chapter.index,
        samples = buffer.samples.len(),
        "prepared chapter buffer"
    );
    Ok(buffer)
}

fn decode_chapter(chapter: &ChapterContext) -> Result<AudioBuffer> {
    let mut slice = ChapterSlice::new(chapter);
    let opts = StreamDecodeOpts {
        start_seconds: chapter.start_seconds,
        ..StreamDecodeOpts::default()
    };
    decode_file_to_stream(&chapter.source_path, opts, &mut slice)
        .map_err(classify_decode_error)?;

    Ok(AudioBuffer {
        samples: slice.samples,
        sample_rate: TARGET_SAMPLE_RATE,
        offset_seconds: chapter.start_seconds,
    })
}

fn classify_decode_error(err: anyhow::Error) -> Error {
    let message = format!("{err:#}");
    if message.contains("failed to probe") || message.contains("no audio track") {
        Error::UnsupportedFormat(message)
    } else {
        Error::Decode(message)
    }
}

/// Sink that keeps the samples in `[start, end)` and asks the decoder to stop after `end`.
struct ChapterSlice {
    start_frame: u64,
    end_frame: u64,
    position: u64,
    samples: Vec<f32>,
}

impl ChapterSlice {
    fn new(chapter: &ChapterContext) -> Self {
        let start_frame = seconds_to_frames(chapter.start_seconds);
        let end_frame = seconds_to_frames(chapter.end_seconds).max(start_frame);
        Self {
            start_frame,
            end_frame,
            position: 0,
            samples: Vec::with_capacity((end_frame - start_frame) as usize),
        }
    }
}

impl SamplesSink for ChapterSlice {
    fn begin_at(&mut self, start_seconds: f64) {
        self.position = seconds_to_frames(start_seconds);
    }

    fn on_samples(&mut self, chunk: &[f32]) -> anyhow::Result<bool> {
        let chunk_start = self.position;
        let chunk_end = chunk_start + chunk.len() as u64;
        self.position = chunk_end;

        let keep_from = self.start_frame.max(chunk_start);
        let keep_to = self.end_frame.min(chunk_end);
        if keep_from < keep_to {
            let lo = (keep_from - chunk_start) as usize;
            let hi = (keep_to - chunk_start) as usize;
            self.samples.extend_from_slice(&chunk[lo..hi]);
        }

        Ok(self.position < self.end_frame)
    }
}

fn seconds_to_frames(seconds: f64) -> u64 {
    (seconds.max(0.0) * f64::from(TARGET_SAMPLE_RATE)).round() as u64
}
