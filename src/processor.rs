//! High-level entry point: turn a source document into a [`BookIndex`], using the cache
//! when it can and the transcription pipeline when it must.
//!
//! The intent is:
//! - The transcription service and segmenter are constructed once and reused.
//! - One shared [`ArtifactCache`] lets concurrent calls for the same source cooperate
//!   (only one of them runs the pipeline; the others share its result).
//! - Callers pick behavior per call via [`ProcessOpts`].
//!
//! Control flow of one call:
//!
//! ```text
//! Start → FingerprintResolved → CacheChecked ─┬─ CacheHit → Done
//!                                             └─ CacheMiss → Segmenting → TranscribingChapters
//!                                                → Assembling → Persisting → Done
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use futures_util::stream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::asr::AsrResponse;
use crate::book_index::{BookIndex, Chapter, ChapterTranscript};
use crate::cache::{ArtifactCache, BuildClaim, BuildLease, SetOutcome};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, SourceDocument};
use crate::opts::{ProcessOpts, TranscribeOpts};
use crate::segmenter::{ChapterContext, FixedWindowSegmenter, Segmenter};
use crate::transcription::TranscriptionService;

/// Phases of one [`Processor::process`] call, in the order they were entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    FingerprintResolved,
    CacheChecked,
    CacheHit,
    CacheMiss,
    Segmenting,
    TranscribingChapters,
    Assembling,
    Persisting,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::FingerprintResolved => "fingerprint_resolved",
            Self::CacheChecked => "cache_checked",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::Segmenting => "segmenting",
            Self::TranscribingChapters => "transcribing_chapters",
            Self::Assembling => "assembling",
            Self::Persisting => "persisting",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the cache lookup went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the cache; no transcription happened.
    Hit,
    /// Found in the cache after an earlier build for the same fingerprint finished.
    HitAfterWait,
    /// Another call was already building this fingerprint; its index was shared with this
    /// one, whether or not it could be persisted.
    Joined,
    /// Nothing usable was cached; the pipeline ran.
    Miss,
    /// `ProcessOpts::refresh` skipped the lookup.
    Bypassed,
    /// The processor has no cache.
    Disabled,
}

impl CacheStatus {
    pub fn is_hit(self) -> bool {
        matches!(self, Self::Hit | Self::HitAfterWait | Self::Joined)
    }
}

/// What happened to the freshly built index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistStatus {
    /// Served from the cache; nothing to write.
    NotNeeded,
    Written,
    /// An identical entry was already present.
    Unchanged,
    /// Some chapters failed; the index was returned but not cached so the next call retries.
    SkippedIncomplete,
    /// The write failed. The index was still returned.
    Failed(String),
    /// The processor has no cache.
    Disabled,
}

/// Full result of [`Processor::process_detailed`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub index: BookIndex,
    pub cache: CacheStatus,
    pub persist: PersistStatus,
    pub stages: Vec<Stage>,
}

/// The document processing orchestrator.
///
/// `Processor` owns the long-lived collaborators:
/// - a [`TranscriptionService`] (model handle or remote client)
/// - a [`Segmenter`]
/// - optionally an [`ArtifactCache`], shared via `Arc` so several processors (or other
///   cache users) coordinate through the same locks
pub struct Processor<T, S = FixedWindowSegmenter> {
    transcriber: T,
    segmenter: S,
    cache: Option<Arc<ArtifactCache>>,
}

impl<T: TranscriptionService> Processor<T> {
    /// Processor with the default fixed-window segmenter and no cache.
    pub fn new(transcriber: T) -> Self {
        Self {
            transcriber,
            segmenter: FixedWindowSegmenter::default(),
            cache: None,
        }
    }
}

impl<T, S> Processor<T, S>
where
    T: TranscriptionService,
    S: Segmenter,
{
    pub fn with_segmenter<S2: Segmenter>(self, segmenter: S2) -> Processor<T, S2> {
        Processor {
            transcriber: self.transcriber,
            segmenter,
            cache: self.cache,
        }
    }

    pub fn with_cache(self, cache: ArtifactCache) -> Self {
        self.with_shared_cache(Arc::new(cache))
    }

    pub fn with_shared_cache(mut self, cache: Arc<ArtifactCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&ArtifactCache> {
        self.cache.as_deref()
    }

    pub fn transcriber(&self) -> &T {
        &self.transcriber
    }

    /// Return the [`BookIndex`] for the source at `path`.
    ///
    /// Served from the cache when the source is unchanged since it was last processed;
    /// otherwise segments and transcribes it, then persists the result. Cancellation
    /// returns [`Error::Cancelled`] and leaves no partial cache entry behind.
    pub async fn process(
        &self,
        path: impl AsRef<Path>,
        opts: &ProcessOpts,
        cancel: &CancellationToken,
    ) -> Result<BookIndex> {
        Ok(self.process_detailed(path, opts, cancel).await?.index)
    }

    /// Like [`Processor::process`], but also reports cache and persistence outcomes.
    pub async fn process_detailed(
        &self,
        path: impl AsRef<Path>,
        opts: &ProcessOpts,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        let path = path.as_ref();
        let span = info_span!(
            "process",
            run_id = %Uuid::new_v4(),
            path = %path.display()
        );
        self.run(path, opts, cancel).instrument(span).await
    }

    async fn run(
        &self,
        path: &Path,
        opts: &ProcessOpts,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let mut run = Run::default();
        run.enter(Stage::Start);

        let source = SourceDocument::resolve(path, opts.fingerprint_mode, cancel).await?;
        let fingerprint = source.fingerprint();
        run.enter(Stage::FingerprintResolved);
        debug!(fingerprint = %fingerprint, "fingerprint resolved");

        // The lease is held until the fresh index is published so concurrent calls for the
        // same fingerprint follow this build instead of starting their own.
        let (cache_status, lease) = match self.cache.as_deref() {
            None => (CacheStatus::Disabled, None),
            Some(cache) => match acquire(cache, &fingerprint, opts, cancel).await? {
                Acquired::Ready(index, status) => return Ok(run.hit(index, status, started)),
                Acquired::Build(status, lease) => (status, Some(lease)),
            },
        };
        run.enter(Stage::CacheChecked);
        run.enter(Stage::CacheMiss);

        run.enter(Stage::Segmenting);
        let segmentation = self.segmenter.segment(&source, cancel).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        run.enter(Stage::TranscribingChapters);
        let chapters = self
            .transcribe_chapters(&segmentation.chapters, opts, cancel)
            .await?;

        run.enter(Stage::Assembling);
        let index = BookIndex::new(
            fingerprint,
            segmentation.title,
            segmentation.duration_seconds,
            chapters,
        );

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let persist = match self.cache.as_deref() {
            None => PersistStatus::Disabled,
            Some(_) if !index.is_complete() => {
                warn!(
                    failed = index.failed_chapters().count(),
                    chapters = index.chapters.len(),
                    "index incomplete; not caching"
                );
                PersistStatus::SkippedIncomplete
            }
            Some(cache) => {
                run.enter(Stage::Persisting);
                match cache.set(&index, cancel).await {
                    Ok(SetOutcome::Written) => PersistStatus::Written,
                    Ok(SetOutcome::Unchanged) => PersistStatus::Unchanged,
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        warn!(error = %err, "failed to persist index; returning it uncached");
                        PersistStatus::Failed(err.to_string())
                    }
                }
            }
        };

        if let Some(lease) = &lease {
            lease.publish(&index);
        }

        run.enter(Stage::Done);
        info!(
            chapters = index.chapters.len(),
            complete = index.is_complete(),
            cache = ?cache_status,
            persist = ?persist,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processed source"
        );

        Ok(ProcessOutcome {
            index,
            cache: cache_status,
            persist,
            stages: run.stages,
        })
    }

    /// Transcribe every chapter with bounded concurrency, keeping segmentation order.
    async fn transcribe_chapters(
        &self,
        contexts: &[ChapterContext],
        opts: &ProcessOpts,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chapter>> {
        let runs: Vec<_> = contexts
            .iter()
            .map(|context| self.run_chapter(context, &opts.transcribe, cancel))
            .collect();
        let pending = stream::iter(runs)
            .buffered(opts.chapter_concurrency())
            .collect::<Vec<_>>();

        let results = tokio::select! {
            results = pending => results,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        results.into_iter().collect()
    }

    /// Prepare and transcribe one chapter. Only cancellation is an error; every other
    /// failure becomes a marker on the chapter.
    async fn run_chapter(
        &self,
        context: &ChapterContext,
        opts: &TranscribeOpts,
        cancel: &CancellationToken,
    ) -> Result<Chapter> {
        let outcome: Result<AsrResponse> = async {
            let audio = self.transcriber.prepare_buffer(context).await?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.transcriber
                .transcribe(context, audio, opts, cancel)
                .await
        }
        .await;

        let transcript = match outcome {
            Ok(response) => {
                debug!(chapter = context.index, tokens = response.tokens.len(), "chapter transcribed");
                ChapterTranscript::Transcribed(response)
            }
            Err(err) if err.is_cancelled() || cancel.is_cancelled() => {
                return Err(Error::Cancelled);
            }
            Err(err) => {
                warn!(chapter = context.index, error = %err, "chapter transcription failed");
                ChapterTranscript::Failed {
                    reason: err.to_string(),
                }
            }
        };

        Ok(Chapter {
            index: context.index,
            title: context.title.clone(),
            start_seconds: context.start_seconds,
            end_seconds: context.end_seconds,
            transcript,
        })
    }
}

enum Acquired {
    /// Nothing left to build.
    Ready(BookIndex, CacheStatus),
    /// This call leads the build.
    Build(CacheStatus, BuildLease),
}

/// Find a usable index or claim the build for `fingerprint`.
///
/// Followers whose leader gave up without an index loop back and try again; one of them
/// becomes the next leader.
async fn acquire(
    cache: &ArtifactCache,
    fingerprint: &Fingerprint,
    opts: &ProcessOpts,
    cancel: &CancellationToken,
) -> Result<Acquired> {
    let mut waited = false;
    loop {
        if !opts.refresh {
            if let Some(index) = cache.get(fingerprint, cancel).await? {
                let status = if waited {
                    CacheStatus::HitAfterWait
                } else {
                    CacheStatus::Hit
                };
                return Ok(Acquired::Ready(index, status));
            }
        }

        match cache.claim_build(fingerprint) {
            BuildClaim::Lead(lease) => {
                if opts.refresh {
                    return Ok(Acquired::Build(CacheStatus::Bypassed, lease));
                }
                // A build that finished between the lookup and the claim has persisted.
                if let Some(index) = cache.get(fingerprint, cancel).await? {
                    return Ok(Acquired::Ready(index, CacheStatus::HitAfterWait));
                }
                return Ok(Acquired::Build(CacheStatus::Miss, lease));
            }
            BuildClaim::Follow(build) => {
                debug!("following in-flight build");
                if let Some(index) = build.wait(cancel).await? {
                    return Ok(Acquired::Ready(index, CacheStatus::Joined));
                }
                waited = true;
            }
        }
    }
}

#[derive(Default)]
struct Run {
    stages: Vec<Stage>,
}

impl Run {
    fn enter(&mut self, stage: Stage) {
        debug!(stage = stage.as_str(), "entering stage");
        self.stages.push(stage);
    }

    fn hit(mut self, index: BookIndex, cache: CacheStatus, started: Instant) -> ProcessOutcome {
        self.enter(Stage::CacheChecked);
        self.enter(Stage::CacheHit);
        self.enter(Stage::Done);
        info!(
            chapters = index.chapters.len(),
            cache = ?cache,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "served from cache"
        );
        ProcessOutcome {
            index,
            cache,
            persist: PersistStatus::NotNeeded,
            stages: self.stages,
        }
    }
}
