use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use filetime::FileTime;

use bookindex::wav::write_wav_16k_mono;
use bookindex::{
    ArtifactCache, AsrResponse, AudioBuffer, CacheStatus, CancellationToken, ChapterContext,
    ChapterTranscript, Error, FingerprintMode, FixedWindowSegmenter, PersistStatus, ProcessOpts,
    Processor, Segmentation, Segmenter, SourceDocument, Stage, TARGET_SAMPLE_RATE,
    TranscribeOpts, TranscriptionService, WordToken,
};

/// Splits every source into `chapters` ten-second chapters without reading it.
struct StaticSegmenter {
    chapters: usize,
}

impl Segmenter for StaticSegmenter {
    async fn segment(
        &self,
        source: &SourceDocument,
        _cancel: &CancellationToken,
    ) -> bookindex::Result<Segmentation> {
        let chapters = (0..self.chapters)
            .map(|index| ChapterContext {
                source_path: source.path.clone(),
                index,
                title: format!("Part {}", index + 1),
                start_seconds: index as f64 * 10.0,
                end_seconds: (index + 1) as f64 * 10.0,
            })
            .collect();
        Ok(Segmentation {
            title: source.file_stem(),
            duration_seconds: self.chapters as f64 * 10.0,
            chapters,
        })
    }
}

/// Counts transcriptions; optionally delays per chapter and fails one chapter.
#[derive(Clone, Default)]
struct FakeAsr {
    calls: Arc<AtomicUsize>,
    delays_ms: Vec<u64>,
    fail_chapter: Option<usize>,
}

impl FakeAsr {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TranscriptionService for FakeAsr {
    async fn prepare_buffer(&self, chapter: &ChapterContext) -> bookindex::Result<AudioBuffer> {
        Ok(AudioBuffer {
            samples: Vec::new(),
            sample_rate: TARGET_SAMPLE_RATE,
            offset_seconds: chapter.start_seconds,
        })
    }

    async fn transcribe(
        &self,
        chapter: &ChapterContext,
        _audio: AudioBuffer,
        _opts: &TranscribeOpts,
        cancel: &CancellationToken,
    ) -> bookindex::Result<AsrResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delays_ms.get(chapter.index).copied().unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }

        if self.fail_chapter == Some(chapter.index) {
            return Err(Error::ServiceUnavailable("asr backend offline".into()));
        }

        Ok(AsrResponse {
            model_version: "fake-asr-1".into(),
            tokens: vec![WordToken {
                start_seconds: 0.25,
                duration_seconds: 0.5,
                word: format!("chapter-{}", chapter.index),
            }],
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    source: PathBuf,
    cache_root: PathBuf,
}

fn fixture() -> Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let source = dir.path().join("Moby Dick.m4b");
    std::fs::write(&source, b"not really an audiobook")?;
    let cache_root = dir.path().join("cache");
    Ok(Fixture {
        source,
        cache_root,
        _dir: dir,
    })
}

fn processor(asr: FakeAsr, chapters: usize, root: &Path) -> Processor<FakeAsr, StaticSegmenter> {
    Processor::new(asr)
        .with_segmenter(StaticSegmenter { chapters })
        .with_cache(ArtifactCache::new(root))
}

fn serial() -> ProcessOpts {
    ProcessOpts {
        max_concurrent_chapters: 1,
        ..ProcessOpts::default()
    }
}

fn entry_files(root: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, out);
            } else {
                out.push(path);
            }
        }
    }
    let mut out = Vec::new();
    walk(root, &mut out);
    out
}

#[tokio::test]
async fn second_call_is_served_from_cache_without_transcribing() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr::default();
    let processor = processor(asr.clone(), 12, &fx.cache_root);
    let cancel = CancellationToken::new();

    let first = processor.process_detailed(&fx.source, &serial(), &cancel).await?;
    assert_eq!(first.cache, CacheStatus::Miss);
    assert_eq!(first.persist, PersistStatus::Written);
    assert_eq!(first.index.chapters.len(), 12);
    assert_eq!(first.index.title, "Moby Dick");
    assert_eq!(asr.calls(), 12);

    let second = processor.process_detailed(&fx.source, &serial(), &cancel).await?;
    assert_eq!(second.cache, CacheStatus::Hit);
    assert_eq!(second.persist, PersistStatus::NotNeeded);
    assert_eq!(second.index, first.index);
    assert_eq!(asr.calls(), 12, "cache hit must not transcribe");

    assert_eq!(
        second.stages,
        vec![
            Stage::Start,
            Stage::FingerprintResolved,
            Stage::CacheChecked,
            Stage::CacheHit,
            Stage::Done
        ]
    );
    Ok(())
}

#[tokio::test]
async fn miss_runs_every_stage_in_order() -> Result<()> {
    let fx = fixture()?;
    let outcome = processor(FakeAsr::default(), 2, &fx.cache_root)
        .process_detailed(&fx.source, &serial(), &CancellationToken::new())
        .await?;

    assert_eq!(
        outcome.stages,
        vec![
            Stage::Start,
            Stage::FingerprintResolved,
            Stage::CacheChecked,
            Stage::CacheMiss,
            Stage::Segmenting,
            Stage::TranscribingChapters,
            Stage::Assembling,
            Stage::Persisting,
            Stage::Done
        ]
    );
    Ok(())
}

#[tokio::test]
async fn changed_mtime_invalidates_and_recomputes() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr::default();
    let processor = processor(asr.clone(), 3, &fx.cache_root);
    let cancel = CancellationToken::new();

    let first = processor.process(&fx.source, &serial(), &cancel).await?;
    assert_eq!(asr.calls(), 3);

    filetime::set_file_mtime(&fx.source, FileTime::from_unix_time(1_600_000_000, 0))?;

    let second = processor.process_detailed(&fx.source, &serial(), &cancel).await?;
    assert_eq!(second.cache, CacheStatus::Miss);
    assert_eq!(asr.calls(), 6);
    assert_ne!(second.index.fingerprint, first.fingerprint);
    assert_eq!(second.index.fingerprint.modified_secs, 1_600_000_000);

    // The new entry superseded the stale one.
    let third = processor.process_detailed(&fx.source, &serial(), &cancel).await?;
    assert_eq!(third.cache, CacheStatus::Hit);
    assert_eq!(third.index, second.index);
    assert_eq!(asr.calls(), 6);
    Ok(())
}

#[tokio::test]
async fn changed_size_invalidates_and_recomputes() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr::default();
    let processor = processor(asr.clone(), 2, &fx.cache_root);
    let cancel = CancellationToken::new();

    processor.process(&fx.source, &serial(), &cancel).await?;
    let mtime = FileTime::from_last_modification_time(&std::fs::metadata(&fx.source)?);
    std::fs::write(&fx.source, b"a longer, re-encoded audiobook file")?;
    filetime::set_file_mtime(&fx.source, mtime)?;

    let outcome = processor.process_detailed(&fx.source, &serial(), &cancel).await?;
    assert_eq!(outcome.cache, CacheStatus::Miss);
    assert_eq!(asr.calls(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_build_once() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr {
        delays_ms: vec![40; 4],
        ..FakeAsr::default()
    };
    let processor = Arc::new(processor(asr.clone(), 4, &fx.cache_root));

    let outcomes = process_concurrently(processor, &fx.source, 8).await?;

    assert_eq!(asr.calls(), 4, "only one caller should run the pipeline");
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| o.cache == CacheStatus::Miss)
            .count(),
        1
    );
    assert!(outcomes.iter().all(|o| o.index == outcomes[0].index));
    assert!(outcomes.iter().all(|o| o.cache.is_hit() || o.cache == CacheStatus::Miss));
    Ok(())
}

/// Runs `callers` concurrent `process_detailed` calls for the same source.
async fn process_concurrently(
    processor: Arc<Processor<FakeAsr, StaticSegmenter>>,
    source: &Path,
    callers: usize,
) -> Result<Vec<bookindex::ProcessOutcome>> {
    let mut tasks = Vec::new();
    for _ in 0..callers {
        let processor = processor.clone();
        let source = source.to_path_buf();
        tasks.push(tokio::spawn(async move {
            processor
                .process_detailed(&source, &ProcessOpts::default(), &CancellationToken::new())
                .await
        }));
    }

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await??);
    }
    Ok(outcomes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_share_an_incomplete_build() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr {
        delays_ms: vec![40; 4],
        fail_chapter: Some(1),
        ..FakeAsr::default()
    };
    let processor = Arc::new(processor(asr.clone(), 4, &fx.cache_root));

    let outcomes = process_concurrently(processor, &fx.source, 8).await?;

    assert_eq!(asr.calls(), 4, "waiters must reuse the unpersisted index");
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| o.cache == CacheStatus::Miss)
            .count(),
        1
    );
    assert!(
        outcomes
            .iter()
            .filter(|o| o.cache != CacheStatus::Miss)
            .all(|o| o.cache == CacheStatus::Joined)
    );
    assert!(outcomes.iter().all(|o| !o.index.is_complete()));
    assert!(outcomes.iter().all(|o| o.index == outcomes[0].index));
    assert!(entry_files(&fx.cache_root).is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_share_a_build_that_failed_to_persist() -> Result<()> {
    let fx = fixture()?;
    std::fs::write(&fx.cache_root, b"in the way")?;
    let asr = FakeAsr {
        delays_ms: vec![40; 4],
        ..FakeAsr::default()
    };
    let processor = Arc::new(processor(asr.clone(), 4, &fx.cache_root));

    let outcomes = process_concurrently(processor, &fx.source, 8).await?;

    assert_eq!(asr.calls(), 4);
    let leaders: Vec<_> = outcomes
        .iter()
        .filter(|o| o.cache == CacheStatus::Miss)
        .collect();
    assert_eq!(leaders.len(), 1);
    assert!(matches!(leaders[0].persist, PersistStatus::Failed(_)));
    assert!(outcomes.iter().all(|o| o.index.is_complete()));
    assert!(outcomes.iter().all(|o| o.index == outcomes[0].index));
    Ok(())
}

#[tokio::test]
async fn later_call_rebuilds_after_an_unpersisted_build() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr {
        fail_chapter: Some(0),
        ..FakeAsr::default()
    };
    let processor = processor(asr.clone(), 2, &fx.cache_root);
    let cancel = CancellationToken::new();

    processor.process(&fx.source, &serial(), &cancel).await?;
    let second = processor.process_detailed(&fx.source, &serial(), &cancel).await?;

    // Sharing ends with the build; nothing stale lingers for sequential callers.
    assert_eq!(second.cache, CacheStatus::Miss);
    assert_eq!(asr.calls(), 4);
    Ok(())
}

#[tokio::test]
async fn chapter_order_follows_segmentation_not_completion() -> Result<()> {
    let fx = fixture()?;
    // Later chapters finish first.
    let asr = FakeAsr {
        delays_ms: vec![120, 90, 60, 30, 0],
        ..FakeAsr::default()
    };
    let opts = ProcessOpts {
        max_concurrent_chapters: 5,
        ..ProcessOpts::default()
    };

    let index = processor(asr, 5, &fx.cache_root)
        .process(&fx.source, &opts, &CancellationToken::new())
        .await?;

    for (position, chapter) in index.chapters.iter().enumerate() {
        assert_eq!(chapter.index, position);
        let text = chapter.transcript.response().map(AsrResponse::text);
        assert_eq!(text, Some(format!("chapter-{position}")));
    }
    Ok(())
}

#[tokio::test]
async fn failed_chapter_is_marked_and_not_cached() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr {
        fail_chapter: Some(2),
        ..FakeAsr::default()
    };
    let processor = processor(asr.clone(), 4, &fx.cache_root);
    let cancel = CancellationToken::new();

    let outcome = processor.process_detailed(&fx.source, &serial(), &cancel).await?;
    let index = &outcome.index;

    assert_eq!(index.chapters.len(), 4);
    assert!(!index.is_complete());
    assert_eq!(
        index.failed_chapters().map(|c| c.index).collect::<Vec<_>>(),
        vec![2]
    );
    match &index.chapters[2].transcript {
        ChapterTranscript::Failed { reason } => assert!(reason.contains("offline"), "{reason}"),
        other => panic!("expected failure marker, got {other:?}"),
    }
    assert!(index.chapters[3].transcript.is_transcribed());
    assert_eq!(outcome.persist, PersistStatus::SkippedIncomplete);
    assert!(!outcome.stages.contains(&Stage::Persisting));

    // Nothing was cached, so the next call retries.
    processor.process(&fx.source, &serial(), &cancel).await?;
    assert_eq!(asr.calls(), 8);
    Ok(())
}

#[tokio::test]
async fn cancellation_unwinds_without_leaving_cache_files() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr {
        delays_ms: vec![10_000; 3],
        ..FakeAsr::default()
    };
    let processor = processor(asr, 3, &fx.cache_root);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = processor
        .process(&fx.source, &ProcessOpts::default(), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(entry_files(&fx.cache_root).is_empty());
    Ok(())
}

#[tokio::test]
async fn already_cancelled_token_does_nothing() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = processor(asr.clone(), 2, &fx.cache_root)
        .process(&fx.source, &ProcessOpts::default(), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(asr.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn persist_failure_still_returns_the_index() -> Result<()> {
    let fx = fixture()?;
    // A regular file where the cache directory should be.
    std::fs::write(&fx.cache_root, b"in the way")?;

    let outcome = processor(FakeAsr::default(), 2, &fx.cache_root)
        .process_detailed(&fx.source, &serial(), &CancellationToken::new())
        .await?;

    assert!(outcome.index.is_complete());
    assert!(matches!(outcome.persist, PersistStatus::Failed(_)), "{:?}", outcome.persist);
    Ok(())
}

#[tokio::test]
async fn refresh_rebuilds_and_identical_result_is_unchanged() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr::default();
    let processor = processor(asr.clone(), 2, &fx.cache_root);
    let cancel = CancellationToken::new();

    processor.process(&fx.source, &serial(), &cancel).await?;

    let opts = ProcessOpts {
        refresh: true,
        ..serial()
    };
    let outcome = processor.process_detailed(&fx.source, &opts, &cancel).await?;

    assert_eq!(outcome.cache, CacheStatus::Bypassed);
    assert_eq!(outcome.persist, PersistStatus::Unchanged);
    assert_eq!(asr.calls(), 4);
    Ok(())
}

#[tokio::test]
async fn processor_without_cache_always_transcribes() -> Result<()> {
    let fx = fixture()?;
    let asr = FakeAsr::default();
    let processor = Processor::new(asr.clone()).with_segmenter(StaticSegmenter { chapters: 2 });
    let cancel = CancellationToken::new();

    let outcome = processor.process_detailed(&fx.source, &serial(), &cancel).await?;
    processor.process(&fx.source, &serial(), &cancel).await?;

    assert_eq!(outcome.cache, CacheStatus::Disabled);
    assert_eq!(outcome.persist, PersistStatus::Disabled);
    assert_eq!(asr.calls(), 4);
    Ok(())
}

#[tokio::test]
async fn missing_source_is_reported() -> Result<()> {
    let fx = fixture()?;
    let err = processor(FakeAsr::default(), 1, &fx.cache_root)
        .process(fx.source.with_extension("mp3"), &serial(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SourceNotFound { .. }), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn content_hash_mode_records_the_digest() -> Result<()> {
    let fx = fixture()?;
    let opts = ProcessOpts {
        fingerprint_mode: FingerprintMode::ContentHash,
        ..serial()
    };

    let index = processor(FakeAsr::default(), 1, &fx.cache_root)
        .process(&fx.source, &opts, &CancellationToken::new())
        .await?;

    let expected = blake3::hash(b"not really an audiobook").to_hex().to_string();
    assert_eq!(index.fingerprint.content_hash, Some(expected));
    Ok(())
}

/// Reports how many samples each prepared chapter buffer held.
struct SampleCounter;

impl TranscriptionService for SampleCounter {
    async fn transcribe(
        &self,
        _chapter: &ChapterContext,
        audio: AudioBuffer,
        _opts: &TranscribeOpts,
        _cancel: &CancellationToken,
    ) -> bookindex::Result<AsrResponse> {
        Ok(AsrResponse {
            model_version: "counter".into(),
            tokens: vec![WordToken {
                start_seconds: 0.0,
                duration_seconds: audio.duration_seconds(),
                word: audio.samples.len().to_string(),
            }],
        })
    }
}

#[tokio::test]
async fn wav_source_is_segmented_and_sliced_end_to_end() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = dir.path().join("short story.wav");
    write_wav_16k_mono(&source, &vec![0.1; TARGET_SAMPLE_RATE as usize * 3])?;

    let processor = Processor::new(SampleCounter)
        .with_segmenter(FixedWindowSegmenter::new(1.0))
        .with_cache(ArtifactCache::new(dir.path().join("cache")));

    let index = processor
        .process(&source, &ProcessOpts::default(), &CancellationToken::new())
        .await?;

    assert_eq!(index.title, "short story");
    assert_eq!(index.chapters.len(), 3);
    for chapter in &index.chapters {
        let text = chapter.transcript.response().map(AsrResponse::text);
        assert_eq!(text.as_deref(), Some("16000"));
    }
    assert!((index.chapters[2].absolute_tokens()[0].start_seconds - 2.0).abs() < 1.0e-9);
    Ok(())
}
