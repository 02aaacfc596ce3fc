//! Audio normalization pipeline used to prepare chapter buffers.
//!
//! Responsibilities:
//! - Convert Symphonia-decoded PCM into interleaved `f32`
//! - Downmix to mono
//! - Resample to the transcription sample rate (when needed)
//! - Emit fixed-size chunks via a callback, stopping as soon as the consumer has enough
//!
//! Notes:
//! - `finalize()` must be called at end-of-stream to flush the resampler's partial block.
//! - Output is a pure function of the decoded input, so identical sources always produce
//!   identical buffers.

use anyhow::{Context, Result, anyhow, bail};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};

/// Target mono sample rate (Hz) handed to transcription services.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Source frames fed to the resampler per block.
const RESAMPLE_BLOCK_FRAMES: usize = 2048;

/// A small stateful pipeline that converts decoded audio into mono 16 kHz `f32` chunks.
#[derive(Default)]
pub struct AudioPipeline {
    // Interleaved copy of the current decoded packet, reused across packets.
    scratch: Option<SampleBuffer<f32>>,

    // Created on the first packet whose rate differs from the target.
    resampler: Option<MonoResampler>,
}

impl AudioPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a decoded Symphonia buffer through the pipeline and emit 16 kHz mono chunks.
    ///
    /// Returns `Ok(false)` once `emit` has asked to stop; the caller should stop feeding
    /// packets and skip [`AudioPipeline::finalize`].
    pub fn push_decoded_and_emit(
        &mut self,
        decoded: &AudioBufferRef<'_>,
        target_chunk_frames: usize,
        mut emit: impl FnMut(&[f32]) -> Result<bool>,
    ) -> Result<bool> {
        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 {
            bail!("decoded audio had zero channels");
        }

        let needed = decoded.capacity() * channels;
        if self.scratch.as_ref().is_none_or(|buf| buf.capacity() < needed) {
            self.scratch = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }
        let scratch = self
            .scratch
            .as_mut()
            .ok_or_else(|| anyhow!("sample buffer not initialized"))?;
        scratch.copy_interleaved_ref(decoded.clone());
        let mono = downmix_to_mono(scratch.samples(), channels);

        if spec.rate == TARGET_SAMPLE_RATE {
            return emit_mono_chunks(&mono, target_chunk_frames, &mut emit);
        }

        if self.resampler.is_none() {
            self.resampler = Some(MonoResampler::new(spec.rate)?);
        }
        let resampler = self
            .resampler
            .as_mut()
            .ok_or_else(|| anyhow!("resampler not initialized"))?;
        if resampler.source_rate != spec.rate {
            bail!(
                "sample rate changed mid-stream ({} Hz -> {} Hz)",
                resampler.source_rate,
                spec.rate
            );
        }
        resampler.push(&mono, target_chunk_frames, &mut emit)
    }

    /// Flush remaining buffered samples at end-of-stream.
    ///
    /// If resampling was never needed, this is a no-op.
    pub fn finalize(
        &mut self,
        target_chunk_frames: usize,
        mut emit: impl FnMut(&[f32]) -> Result<bool>,
    ) -> Result<()> {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.flush(target_chunk_frames, &mut emit)?;
        }
        Ok(())
    }
}

/// Fixed-block sinc resampler for a single channel, with its pending input.
///
/// Output is aligned with the input: the filter's leading delay is dropped, and `flush`
/// drains the filter so the stream ends at `input_frames * ratio` frames.
struct MonoResampler {
    source_rate: u32,
    inner: SincFixedIn<f32>,
    pending: Vec<f32>,
    out: Vec<Vec<f32>>,
    delay_remaining: usize,
    input_frames: u64,
    emitted_frames: u64,
}

impl MonoResampler {
    fn new(source_rate: u32) -> Result<Self> {
        if source_rate == 0 {
            bail!("decoded audio reported a 0 Hz sample rate");
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(
            f64::from(TARGET_SAMPLE_RATE) / f64::from(source_rate),
            2.0,
            params,
            RESAMPLE_BLOCK_FRAMES,
            1,
        )
        .map_err(|e| anyhow!(e))
        .context("failed to init resampler")?;
        let out = inner.output_buffer_allocate(true);
        let delay_remaining = inner.output_delay();

        Ok(Self {
            source_rate,
            inner,
            pending: Vec::with_capacity(RESAMPLE_BLOCK_FRAMES * 2),
            out,
            delay_remaining,
            input_frames: 0,
            emitted_frames: 0,
        })
    }

    fn block_len(&self) -> usize {
        self.inner.input_frames_next()
    }

    /// Output frames the input seen so far corresponds to.
    fn expected_output_frames(&self) -> u64 {
        let ratio = f64::from(TARGET_SAMPLE_RATE) / f64::from(self.source_rate);
        (self.input_frames as f64 * ratio).round() as u64
    }

    /// Queue `mono` and resample every complete block.
    fn push(
        &mut self,
        mono: &[f32],
        target_chunk_frames: usize,
        emit: &mut impl FnMut(&[f32]) -> Result<bool>,
    ) -> Result<bool> {
        self.input_frames += mono.len() as u64;
        self.pending.extend_from_slice(mono);

        while self.pending.len() >= self.block_len() {
            if self.process_block(None, target_chunk_frames, emit)?.is_none() {
                self.pending.clear();
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Feed zeros until the filter has released every frame owed for the real input,
    /// then drop the padding's own output.
    fn flush(
        &mut self,
        target_chunk_frames: usize,
        emit: &mut impl FnMut(&[f32]) -> Result<bool>,
    ) -> Result<bool> {
        let expected = self.expected_output_frames();
        while self.emitted_frames < expected {
            let block = self.block_len();
            if self.pending.len() < block {
                self.pending.resize(block, 0.0);
            }
            match self.process_block(Some(expected), target_chunk_frames, emit)? {
                None => {
                    self.pending.clear();
                    return Ok(false);
                }
                Some(0) => break,
                Some(_) => {}
            }
        }
        self.pending.clear();
        Ok(true)
    }

    /// Resample one block from `pending` and emit its signal frames, never letting the
    /// total emitted pass `limit`.
    ///
    /// Returns `Ok(None)` once `emit` asked to stop, otherwise the number of frames the
    /// filter produced (delay included).
    fn process_block(
        &mut self,
        limit: Option<u64>,
        target_chunk_frames: usize,
        emit: &mut impl FnMut(&[f32]) -> Result<bool>,
    ) -> Result<Option<usize>> {
        let block = self.block_len();
        let (consumed, produced) = self
            .inner
            .process_into_buffer(&[&self.pending[..block]], &mut self.out, None)
            .map_err(|e| anyhow!(e))
            .context("resampler process failed")?;
        self.pending.drain(..consumed);

        let skip = self.delay_remaining.min(produced);
        self.delay_remaining -= skip;
        let mut signal = &self.out[0][skip..produced];
        if let Some(limit) = limit {
            let room = usize::try_from(limit.saturating_sub(self.emitted_frames))
                .unwrap_or(usize::MAX);
            signal = &signal[..signal.len().min(room)];
        }
        self.emitted_frames += signal.len() as u64;

        if !emit_mono_chunks(signal, target_chunk_frames, emit)? {
            return Ok(None);
        }
        Ok(Some(produced))
    }
}

/// Downmix interleaved samples into mono by averaging channels.
fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }

    let scale = 1.0 / channels as f32;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Emit mono 16 kHz samples to the callback in fixed-size chunks.
///
/// Returns `Ok(false)` as soon as the callback asks to stop.
fn emit_mono_chunks(
    mono_16k: &[f32],
    chunk_frames: usize,
    emit: &mut impl FnMut(&[f32]) -> Result<bool>,
) -> Result<bool> {
    for chunk in mono_16k.chunks(chunk_frames.max(1)) {
        if !emit(chunk)? {
            return Ok(false);
        }
    }
    Ok(true)
}
