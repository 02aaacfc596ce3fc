// src/decoder.rs

//! Stream-decode media (audiobook containers, plain audio files) into mono `f32` at the
//! transcription sample rate, emitting fixed-size chunks via a callback.
//!
//! This module is intentionally small and orchestration-focused:
//! - `demux` handles probing + packet iteration
//! - `decode` handles seeking and codec decoding
//! - `audio_pipeline` handles PCM normalization (downmix + resample) + chunking

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::audio_pipeline::AudioPipeline;
use crate::decode::TrackDecoder;

/// Consumer callback for decoded samples.
///
/// The sink receives **mono** `f32` samples at the transcription sample rate.
/// Returning `Ok(false)` signals "stop decoding early"; no further packets are read.
pub trait SamplesSink {
    /// Source time, in seconds, of the first sample the sink is about to receive.
    ///
    /// Called once before any samples. It is `0.0` unless the decode started from a
    /// seek, and may sit somewhat before the requested start.
    fn begin_at(&mut self, _start_seconds: f64) {}

    fn on_samples(&mut self, samples_16k_mono: &[f32]) -> Result<bool>;
}

/// Streaming decode configuration.
#[derive(Debug, Clone)]
pub struct StreamDecodeOpts {
    /// Chunk size *after* resampling (target-rate frames).
    ///
    /// Examples:
    /// - 320  = 20ms
    /// - 1600 = 100ms
    pub target_chunk_frames: usize,

    /// Where to start decoding, in source seconds. Containers that cannot seek are
    /// decoded from the beginning instead.
    pub start_seconds: f64,
}

impl Default for StreamDecodeOpts {
    fn default() -> Self {
        Self {
            target_chunk_frames: 1024,
            start_seconds: 0.0,
        }
    }
}

/// Decode a file on disk and emit normalized chunks into `sink`.
pub fn decode_file_to_stream(
    path: &Path,
    opts: StreamDecodeOpts,
    sink: &mut dyn SamplesSink,
) -> Result<()> {
    let mut track = TrackDecoder::open(path)?;
    if opts.start_seconds > 0.0 {
        if let Err(err) = track.seek(opts.start_seconds) {
            debug!(
                path = %path.display(),
                start_seconds = opts.start_seconds,
                error = %format!("{err:#}"),
                "seek failed; decoding from the beginning"
            );
            // The reader's position is unknown after a failed seek.
            track = TrackDecoder::open(path)?;
        }
    }

    let mut pipeline = AudioPipeline::new();
    let mut started = false;
    let mut keep_going = true;

    while keep_going {
        // Decode packet → normalized audio pipeline → emit chunks.
        let more = track.decode_next(|decoded, at_seconds| {
            if !started {
                sink.begin_at(at_seconds);
                started = true;
            }
            keep_going = pipeline
                .push_decoded_and_emit(&decoded, opts.target_chunk_frames, |chunk| {
                    sink.on_samples(chunk)
                })
                .context("audio pipeline failed while processing decoded samples")?;
            Ok(())
        })?;
        if !more {
            break;
        }
    }

    if !keep_going {
        return Ok(());
    }

    // Flush any buffered resampler tail.
    pipeline
        .finalize(opts.target_chunk_frames, |chunk| sink.on_samples(chunk))
        .context("audio pipeline failed during finalize")?;

    Ok(())
}
