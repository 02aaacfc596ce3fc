//! Minimal WAV I/O for prepared chapter buffers.
//!
//! Services that take a file rather than raw samples (the HTTP ASR adapter) receive a
//! 16-bit PCM mono WAV written here.

use std::io::{Seek, Write};
use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};

use crate::audio_pipeline::TARGET_SAMPLE_RATE;

fn mono_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Write mono `f32` samples in `[-1.0, 1.0]` as 16-bit PCM.
///
/// Out-of-range samples are clamped.
pub fn write_wav_mono<W>(writer: W, samples: &[f32], sample_rate: u32) -> Result<()>
where
    W: Write + Seek,
{
    let mut wav = WavWriter::new(writer, mono_spec(sample_rate)).context("failed to start WAV")?;
    for &sample in samples {
        let pcm = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        wav.write_sample(pcm).context("failed to write WAV sample")?;
    }
    wav.finalize().context("failed to finalize WAV")?;
    Ok(())
}

/// Write a 16 kHz mono WAV file at `path`.
pub fn write_wav_16k_mono(path: &Path, samples: &[f32]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create '{}'", path.display()))?;
    write_wav_mono(std::io::BufWriter::new(file), samples, TARGET_SAMPLE_RATE)
}
