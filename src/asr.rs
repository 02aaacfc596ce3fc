use serde::{Deserialize, Serialize};

/// A single timed word produced by a transcription service.
///
/// Field names match the ASR service wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordToken {
    /// Start time in seconds, relative to the start of the transcribed audio.
    #[serde(rename = "t")]
    pub start_seconds: f64,
    /// Duration in seconds.
    #[serde(rename = "d")]
    pub duration_seconds: f64,
    /// Word text.
    #[serde(rename = "w")]
    pub word: String,
}

/// Transcription output for one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsrResponse {
    /// Identifier of the model that produced the tokens.
    #[serde(rename = "modelVersion")]
    pub model_version: String,
    pub tokens: Vec<WordToken>,
}

impl WordToken {
    pub fn end_seconds(&self) -> f64 {
        self.start_seconds + self.duration_seconds
    }

    /// Copy of this token shifted by `offset_seconds`.
    pub fn offset_by(&self, offset_seconds: f64) -> Self {
        Self {
            start_seconds: self.start_seconds + offset_seconds,
            duration_seconds: self.duration_seconds,
            word: self.word.clone(),
        }
    }
}

impl AsrResponse {
    /// Words joined with single spaces.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            let word = token.word.trim();
            if word.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
        out
    }
}

/// whisper.cpp reports token times in centiseconds and uses `-1` for unknown.
#[cfg_attr(not(feature = "whisper"), allow(dead_code))]
pub(crate) fn centiseconds_to_seconds(value: i64) -> f64 {
    if value < 0 { 0.0 } else { value as f64 / 100.0 }
}
