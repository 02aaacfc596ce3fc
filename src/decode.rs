// src/decode.rs

//! Track-level decoding on top of Symphonia.
//!
//! [`TrackDecoder`] owns one source's default audio track and the codec attached to it.
//! It can be positioned near a chapter start and then pulled packet by packet, with
//! Symphonia's error model folded into three outcomes: a decoded buffer, end of stream,
//! or a fatal error.
//!
//! Error handling policy:
//! - `DecodeError` → skip the bad frame (common with some codecs)
//! - `IoError`     → end of stream
//! - anything else → fatal, with context

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use symphonia::core::audio::AudioBufferRef;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatReader, SeekMode, SeekTo};
use symphonia::core::units::{Time, TimeBase};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::demux::{next_packet, open_default_track};

/// The default audio track of a source, ready to decode.
pub struct TrackDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    time_base: Option<TimeBase>,
    declared_frames: Option<u64>,
}

impl TrackDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        let (format, track) = open_default_track(path)?;
        let params = &track.codec_params;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| anyhow!("audio track has no sample rate"))?;
        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| anyhow!(e))
            .context("failed to create decoder for audio track")?;

        Ok(Self {
            format,
            decoder,
            track_id: track.id,
            sample_rate,
            time_base: params.time_base,
            declared_frames: params.n_frames,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frame count the container declares for the track, if any.
    pub fn declared_frames(&self) -> Option<u64> {
        self.declared_frames
    }

    /// Position the track at or before `seconds`.
    ///
    /// The next decoded packet reports where decoding actually resumes; callers discard
    /// whatever precedes the time they asked for.
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        if !(seconds.is_finite() && seconds >= 0.0) {
            bail!("cannot seek to {seconds} s");
        }
        let time = Time {
            seconds: seconds.trunc() as u64,
            frac: seconds.fract(),
        };

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| anyhow!(e))
            .context("failed to seek")?;
        self.decoder.reset();

        trace!(
            required_ts = seeked.required_ts,
            actual_ts = seeked.actual_ts,
            "seeked track"
        );
        Ok(())
    }

    /// Decode the next packet of the track and hand the PCM to `on_decoded`, along with
    /// the packet's start time in seconds.
    ///
    /// Returns `Ok(false)` at end of stream.
    pub fn decode_next(
        &mut self,
        mut on_decoded: impl FnMut(AudioBufferRef<'_>, f64) -> Result<()>,
    ) -> Result<bool> {
        loop {
            let Some(packet) = next_packet(&mut self.format)? else {
                return Ok(false);
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let at_seconds = self.seconds_at(packet.ts());
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    on_decoded(decoded, at_seconds)?;
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(reason)) => {
                    debug!(at_seconds, reason, "skipping undecodable frame");
                }
                Err(SymphoniaError::IoError(_)) => return Ok(false),
                Err(e) => return Err(anyhow!(e)).context("decoder failure"),
            }
        }
    }

    /// Decode from the current position to the end of the track, counting frames.
    ///
    /// Checks `cancel` between packets and bails out once it fires.
    pub fn count_frames(&mut self, cancel: &CancellationToken) -> Result<u64> {
        let mut frames = 0_u64;
        while self.decode_next(|decoded, _| {
            frames += decoded.frames() as u64;
            Ok(())
        })? {
            if cancel.is_cancelled() {
                bail!("cancelled while counting frames");
            }
        }
        Ok(frames)
    }

    fn seconds_at(&self, ts: u64) -> f64 {
        match self.time_base {
            Some(time_base) => {
                let time = time_base.calc_time(ts);
                time.seconds as f64 + time.frac
            }
            None => ts as f64 / f64::from(self.sample_rate),
        }
    }
}

/// Playable duration of the default audio track of `path`, in seconds.
///
/// Uses the frame count the container declares. Containers that leave it out (raw ADTS,
/// some streamed MP3s) are decoded once end to end and their frames counted.
pub fn file_duration_seconds(path: &Path, cancel: &CancellationToken) -> Result<f64> {
    let track = TrackDecoder::open(path)?;
    track_duration(track, cancel)
        .with_context(|| format!("failed to measure '{}'", path.display()))
}

fn track_duration(mut track: TrackDecoder, cancel: &CancellationToken) -> Result<f64> {
    let frames = match track.declared_frames() {
        Some(frames) => frames,
        None => {
            debug!("container declares no duration; counting frames");
            track.count_frames(cancel)?
        }
    };
    Ok(frames as f64 / f64::from(track.sample_rate()))
}
