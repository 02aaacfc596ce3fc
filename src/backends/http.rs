//! Adapter for an out-of-process ASR service speaking JSON over HTTP.
//!
//! Wire contract:
//!
//! ```text
//! POST {base}/asr
//! {"audio_path": "/tmp/.../chapter-0003.wav", "model": null, "language": "en"}
//!
//! 200 {"modelVersion": "...", "tokens": [{"t": 0.42, "d": 0.31, "w": "Call"}, ...]}
//! ```
//!
//! The service reads the audio from a path, so the prepared buffer is staged as a
//! 16-bit mono WAV in a scratch directory that lives until the response arrives.

use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::asr::AsrResponse;
use crate::buffer::AudioBuffer;
use crate::error::{Error, Result};
use crate::opts::TranscribeOpts;
use crate::segmenter::ChapterContext;
use crate::transcription::TranscriptionService;
use crate::wav::write_wav_mono;

/// Default per-request timeout. Long chapters on a cold model can take minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Serialize)]
struct AsrRequest<'a> {
    audio_path: &'a Path,
    model: Option<&'a str>,
    language: Option<&'a str>,
}

/// [`TranscriptionService`] backed by a remote ASR endpoint.
#[derive(Debug, Clone)]
pub struct HttpAsrClient {
    http_client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpAsrClient {
    /// Client for the service at `base_url` (e.g. `http://127.0.0.1:8000`).
    pub fn new(base_url: impl AsRef<str>) -> Self {
        let base = base_url.as_ref().trim_end_matches('/');
        Self {
            http_client: reqwest::Client::new(),
            endpoint: format!("{base}/asr"),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use a preconfigured client (proxies, TLS roots, connection pool limits).
    pub fn with_client(mut self, http_client: reqwest::Client) -> Self {
        self.http_client = http_client;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, audio_path: &Path, opts: &TranscribeOpts) -> Result<AsrResponse> {
        let request = AsrRequest {
            audio_path,
            model: opts.model.as_deref(),
            language: opts.language.as_deref(),
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| Error::ServiceUnavailable(format!("{}: {err}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(status_error(status, detail));
        }

        response
            .json::<AsrResponse>()
            .await
            .map_err(|err| Error::msg(format!("malformed ASR response: {err}")))
    }
}

impl TranscriptionService for HttpAsrClient {
    async fn transcribe(
        &self,
        chapter: &ChapterContext,
        audio: AudioBuffer,
        opts: &TranscribeOpts,
        cancel: &CancellationToken,
    ) -> Result<AsrResponse> {
        let scratch = tempfile::Builder::new()
            .prefix("bookindex-asr-")
            .tempdir()
            .map_err(|err| Error::io(std::env::temp_dir(), err))?;
        let audio_path = scratch
            .path()
            .join(format!("chapter-{:04}.wav", chapter.index));

        let staged = audio_path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&staged).map_err(|err| Error::io(&staged, err))?;
            write_wav_mono(
                std::io::BufWriter::new(file),
                &audio.samples,
                audio.sample_rate,
            )?;
            Ok::<_, Error>(())
        })
        .await??;

        debug!(chapter = chapter.index, endpoint = %self.endpoint, "posting chapter to ASR service");

        // Dropping the request future on cancel aborts the connection.
        let response = tokio::select! {
            response = self.post(&audio_path, opts) => response,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        match &response {
            Err(err) if !err.is_cancelled() => {
                warn!(chapter = chapter.index, error = %err, "ASR request failed");
            }
            _ => {}
        }

        drop(scratch);
        response
    }
}

fn status_error(status: StatusCode, detail: String) -> Error {
    let detail = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {detail}")
    };

    match status {
        StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY => {
            Error::UnsupportedFormat(detail)
        }
        StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => Error::Decode(detail),
        s if s.is_server_error() => Error::ServiceUnavailable(detail),
        _ => Error::msg(format!("ASR service rejected request: {detail}")),
    }
}
