use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext};

use crate::asr::{AsrResponse, WordToken};
use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::buffer::AudioBuffer;
use crate::error::{Error, Result};
use crate::opts::TranscribeOpts;
use crate::segmenter::ChapterContext;
use crate::transcription::TranscriptionService;

mod ctx;
mod words;

use words::{merge_pieces, pieces_from_segment};

/// In-process transcription powered by `whisper-rs` / `whisper.cpp`.
///
/// The model is loaded once; each chapter gets its own whisper state on a blocking
/// thread. `TranscribeOpts::model` is ignored since the model is fixed at construction.
pub struct WhisperTranscriber {
    ctx: Arc<WhisperContext>,
    model_version: String,
}

impl WhisperTranscriber {
    /// Load a whisper.cpp model from disk.
    pub fn new(model_path: &str) -> Result<Self> {
        if model_path.trim().is_empty() {
            return Err(Error::msg("model path must be provided"));
        }
        let ctx = ctx::load_context(model_path)?;

        let model_version = Path::new(model_path)
            .file_stem()
            .map(|stem| format!("whisper.cpp/{}", stem.to_string_lossy()))
            .unwrap_or_else(|| "whisper.cpp".to_owned());

        Ok(Self {
            ctx: Arc::new(ctx),
            model_version,
        })
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }
}

impl TranscriptionService for WhisperTranscriber {
    async fn transcribe(
        &self,
        chapter: &ChapterContext,
        audio: AudioBuffer,
        opts: &TranscribeOpts,
        cancel: &CancellationToken,
    ) -> Result<AsrResponse> {
        if audio.sample_rate != TARGET_SAMPLE_RATE {
            return Err(Error::UnsupportedFormat(format!(
                "whisper expects {TARGET_SAMPLE_RATE} Hz input, got {} Hz",
                audio.sample_rate
            )));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let tokens = if audio.is_empty() {
            Vec::new()
        } else {
            let ctx = self.ctx.clone();
            let language = opts.language.clone();
            let abort = cancel.clone();
            tokio::task::spawn_blocking(move || {
                run_whisper(&ctx, language.as_deref(), &audio.samples, abort)
            })
            .await??
        };

        // whisper.cpp returns an error when aborted; report it as cancellation.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!(chapter = chapter.index, words = tokens.len(), "whisper transcription done");
        Ok(AsrResponse {
            model_version: self.model_version.clone(),
            tokens,
        })
    }
}

fn run_whisper(
    ctx: &WhisperContext,
    language: Option<&str>,
    samples: &[f32],
    abort: CancellationToken,
) -> Result<Vec<WordToken>> {
    let mut params = FullParams::new(SamplingStrategy::BeamSearch {
        beam_size: 5,
        patience: 1.0,
    });

    params.set_n_threads(num_cpus::get() as i32);
    params.set_language(language);
    params.set_no_context(true);
    params.set_single_segment(false);

    params.set_print_progress(false);
    params.set_print_special(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);

    params.set_token_timestamps(true);
    params.set_abort_callback_safe(move || abort.is_cancelled());

    let mut state = ctx
        .create_state()
        .context("failed to create whisper state")?;

    state
        .full(params, samples)
        .map_err(|err| Error::Decode(format!("whisper full() failed: {err}")))?;

    let mut pieces = Vec::new();
    for segment in state.as_iter() {
        pieces.extend(pieces_from_segment(&segment)?);
    }

    Ok(merge_pieces(pieces))
}
