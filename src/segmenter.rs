//! Splitting a source document into chapter-scoped contexts.
//!
//! Segmentation must be a pure function of the source contents: the same fingerprint
//! has to segment identically every time, or cached indexes would disagree with fresh
//! ones.

use std::future::Future;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::decode::file_duration_seconds;
use crate::error::{Error, Result};
use crate::fingerprint::SourceDocument;

/// The scoped slice of a source document handed to the transcription service.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterContext {
    /// Canonical path of the source document.
    pub source_path: PathBuf,
    /// Zero-based position in segmentation order.
    pub index: usize,
    pub title: String,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl ChapterContext {
    pub fn duration_seconds(&self) -> f64 {
        (self.end_seconds - self.start_seconds).max(0.0)
    }
}

/// Output of a segmenter: book-level metadata plus chapters in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub title: String,
    pub duration_seconds: f64,
    pub chapters: Vec<ChapterContext>,
}

/// Produces the chapter layout of a source document.
///
/// Implementations that read the source should stop promptly once `cancel` fires and
/// return [`Error::Cancelled`].
pub trait Segmenter: Send + Sync {
    fn segment(
        &self,
        source: &SourceDocument,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Segmentation>> + Send;
}

/// Splits the audio into consecutive chapters of a fixed length.
///
/// The final chapter holds the remainder and is shorter than the rest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedWindowSegmenter {
    pub chapter_seconds: f64,
}

impl FixedWindowSegmenter {
    pub const DEFAULT_CHAPTER_SECONDS: f64 = 600.0;

    pub fn new(chapter_seconds: f64) -> Self {
        Self { chapter_seconds }
    }

    /// Chapter layout for a book of `duration_seconds`.
    pub fn windows(
        &self,
        source: &SourceDocument,
        duration_seconds: f64,
    ) -> Result<Vec<ChapterContext>> {
        if !(self.chapter_seconds.is_finite() && self.chapter_seconds > 0.0) {
            return Err(Error::Segmentation(format!(
                "chapter length must be positive, got {}",
                self.chapter_seconds
            )));
        }

        let mut chapters = Vec::new();
        let mut start = 0.0;
        while start < duration_seconds {
            let index = chapters.len();
            // Multiply rather than accumulate so boundaries do not drift.
            let end = (((index + 1) as f64) * self.chapter_seconds).min(duration_seconds);
            chapters.push(ChapterContext {
                source_path: source.path.clone(),
                index,
                title: format!("Chapter {}", index + 1),
                start_seconds: start,
                end_seconds: end,
            });
            start = end;
        }
        Ok(chapters)
    }
}

impl Default for FixedWindowSegmenter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHAPTER_SECONDS)
    }
}

impl Segmenter for FixedWindowSegmenter {
    async fn segment(
        &self,
        source: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<Segmentation> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let path = source.path.clone();
        let stop = cancel.clone();
        let measuring = tokio::task::spawn_blocking(move || file_duration_seconds(&path, &stop));
        let measured = tokio::select! {
            measured = measuring => measured?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let duration_seconds = match measured {
            Ok(seconds) => seconds,
            Err(_) if cancel.is_cancelled() => return Err(Error::Cancelled),
            Err(err) => return Err(Error::UnsupportedFormat(format!("{err:#}"))),
        };

        let chapters = self.windows(source, duration_seconds)?;
        debug!(
            path = %source.path.display(),
            duration_seconds,
            chapters = chapters.len(),
            "segmented source"
        );

        Ok(Segmentation {
            title: source.file_stem(),
            duration_seconds,
            chapters,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::audio_pipeline::TARGET_SAMPLE_RATE;
    use crate::wav::write_wav_16k_mono;

    fn document(path: PathBuf) -> SourceDocument {
        SourceDocument {
            path,
            size: 0,
            modified: SystemTime::UNIX_EPOCH,
            content_hash: None,
        }
    }

    #[test]
    fn windows_cover_the_whole_duration_in_order() -> Result<()> {
        let source = document(PathBuf::from("/books/book.m4b"));
        let chapters = FixedWindowSegmenter::new(10.0).windows(&source, 25.0)?;

        let bounds: Vec<_> = chapters
            .iter()
            .map(|c| (c.index, c.start_seconds, c.end_seconds))
            .collect();
        assert_eq!(bounds, vec![(0, 0.0, 10.0), (1, 10.0, 20.0), (2, 20.0, 25.0)]);
        assert_eq!(chapters[2].title, "Chapter 3");
        assert!(chapters.iter().all(|c| c.source_path == source.path));
        Ok(())
    }

    #[test]
    fn empty_audio_has_no_chapters() -> Result<()> {
        let source = document(PathBuf::from("/books/empty.wav"));
        assert!(FixedWindowSegmenter::default().windows(&source, 0.0)?.is_empty());
        Ok(())
    }

    #[test]
    fn non_positive_window_is_rejected() {
        let source = document(PathBuf::from("/books/book.m4b"));
        let err = FixedWindowSegmenter::new(0.0).windows(&source, 5.0).unwrap_err();
        assert!(matches!(err, Error::Segmentation(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn segments_a_wav_by_its_duration() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("Moby Dick.wav");
        let three_seconds = vec![0.0_f32; TARGET_SAMPLE_RATE as usize * 3];
        write_wav_16k_mono(&path, &three_seconds)?;

        let segmentation = FixedWindowSegmenter::new(1.0)
            .segment(&document(path), &CancellationToken::new())
            .await?;

        assert_eq!(segmentation.title, "Moby Dick");
        assert!((segmentation.duration_seconds - 3.0).abs() < 1.0e-9);
        assert_eq!(segmentation.chapters.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_container_is_unsupported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"definitely not audio")?;

        let err = FixedWindowSegmenter::default()
            .segment(&document(path), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)), "got {err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_segmentation_does_not_read_the_source() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("long.wav");
        write_wav_16k_mono(&path, &vec![0.0_f32; TARGET_SAMPLE_RATE as usize])?;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = FixedWindowSegmenter::default()
            .segment(&document(path), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "got {err:?}");
        Ok(())
    }
}
