use anyhow::{Context, Result};
use whisper_rs::WhisperSegment;

use crate::asr::{WordToken, centiseconds_to_seconds};

/// One whisper.cpp token: text plus `t0`/`t1` in centiseconds.
pub(super) struct Piece {
    pub text: String,
    pub t0: i64,
    pub t1: i64,
}

pub(super) fn pieces_from_segment(segment: &WhisperSegment) -> Result<Vec<Piece>> {
    let token_count = segment.n_tokens();
    let token_count_usize = usize::try_from(token_count)
        .with_context(|| format!("segment reported negative token count: {token_count}"))?;
    let mut pieces = Vec::with_capacity(token_count_usize);

    for token_idx in 0..token_count_usize {
        let token = segment
            .get_token(token_idx as i32)
            .context("failed to get token from segment")?;

        let data = token.token_data();
        let text = token
            .to_str()
            .with_context(|| format!("failed to get token text at index {token_idx}"))?
            .to_owned();

        pieces.push(Piece {
            text,
            t0: data.t0,
            t1: data.t1,
        });
    }

    Ok(pieces)
}

/// Merge sub-word pieces into timed words.
///
/// A piece that starts with whitespace opens a new word; anything else extends the
/// previous one. Control tokens (`[_BEG_]`, `[_TT_50]`, ...) are dropped.
pub(super) fn merge_pieces(pieces: impl IntoIterator<Item = Piece>) -> Vec<WordToken> {
    let mut words: Vec<WordToken> = Vec::new();
    let mut extend_last = false;

    for piece in pieces {
        if is_control(&piece.text) {
            continue;
        }

        let starts_word = piece.text.starts_with(char::is_whitespace);
        let text = piece.text.trim();
        if text.is_empty() {
            extend_last = false;
            continue;
        }

        let start = centiseconds_to_seconds(piece.t0);
        let end = centiseconds_to_seconds(piece.t1).max(start);

        match words.last_mut() {
            Some(last) if extend_last && !starts_word => {
                last.word.push_str(text);
                last.duration_seconds = (end - last.start_seconds).max(last.duration_seconds);
            }
            _ => words.push(WordToken {
                start_seconds: start,
                duration_seconds: end - start,
                word: text.to_owned(),
            }),
        }
        extend_last = true;
    }

    words
}

fn is_control(text: &str) -> bool {
    text.starts_with("[_") && text.ends_with("_]")
}
