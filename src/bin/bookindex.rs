use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use bookindex::backends::http::HttpAsrClient;
use bookindex::cache::default_cache_root;
use bookindex::{
    ArtifactCache, CancellationToken, Fingerprint, FingerprintMode, FixedWindowSegmenter,
    ProcessOpts, Processor, TranscribeOpts,
};

#[derive(Parser, Debug)]
#[command(name = "bookindex")]
#[command(about = "Build and cache chapter transcripts for audiobooks")]
struct Params {
    /// Cache root directory. Defaults to the platform cache directory.
    #[arg(long = "cache-dir", env = "BOOKINDEX_CACHE_DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// Fingerprint sources by content hash as well as size and mtime.
    #[arg(long = "content-hash", global = true, default_value_t = false)]
    content_hash: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the book index for a source, building and caching it if needed.
    Process {
        source: PathBuf,

        /// Base URL of the ASR service.
        #[arg(long = "asr-url", env = "BOOKINDEX_ASR_URL", default_value = "http://127.0.0.1:8000")]
        asr_url: String,

        /// Model hint forwarded to the ASR service.
        #[arg(short = 'm', long = "model", env = "BOOKINDEX_MODEL")]
        model: Option<String>,

        /// Language hint forwarded to the ASR service (e.g. `en`).
        #[arg(short = 'l', long = "language", env = "BOOKINDEX_LANGUAGE")]
        language: Option<String>,

        /// Chapter length in seconds.
        #[arg(long = "chapter-seconds", default_value_t = FixedWindowSegmenter::DEFAULT_CHAPTER_SECONDS)]
        chapter_seconds: f64,

        /// Maximum chapters transcribed at once.
        #[arg(short = 'j', long = "concurrency", env = "BOOKINDEX_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Ignore any cached index and rebuild.
        #[arg(long = "refresh", default_value_t = false)]
        refresh: bool,
    },

    /// Print the cached book index for a source; exits with status 1 when absent.
    Show { source: PathBuf },

    /// Remove the cached index for a source.
    Invalidate { source: PathBuf },

    /// Remove every cached index.
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    bookindex::init_logging();

    let params = Params::parse();
    let cancel = CancellationToken::new();

    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; cancelling");
            on_interrupt.cancel();
        }
    });

    match run(params, &cancel).await {
        Ok(code) => code,
        Err(err) => {
            let cancelled = err
                .downcast_ref::<bookindex::Error>()
                .is_some_and(bookindex::Error::is_cancelled);
            if cancelled {
                eprintln!("cancelled");
                return ExitCode::from(130);
            }
            error!(error = ?err, "bookindex failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(params: Params, cancel: &CancellationToken) -> Result<ExitCode> {
    let cache = ArtifactCache::new(cache_root(params.cache_dir.as_deref())?);
    let mode = if params.content_hash {
        FingerprintMode::ContentHash
    } else {
        FingerprintMode::Metadata
    };

    match params.command {
        Command::Process {
            source,
            asr_url,
            model,
            language,
            chapter_seconds,
            concurrency,
            refresh,
        } => {
            let mut opts = ProcessOpts {
                fingerprint_mode: mode,
                refresh,
                transcribe: TranscribeOpts { model, language },
                ..ProcessOpts::default()
            };
            if let Some(concurrency) = concurrency {
                opts.max_concurrent_chapters = concurrency;
            }

            let processor = Processor::new(HttpAsrClient::new(&asr_url))
                .with_segmenter(FixedWindowSegmenter::new(chapter_seconds))
                .with_cache(cache);

            let outcome = processor.process_detailed(&source, &opts, cancel).await?;
            info!(cache = ?outcome.cache, persist = ?outcome.persist, "done");
            print_json(&outcome.index)?;

            if outcome.index.is_complete() {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!(
                    "warning: {} chapter(s) failed to transcribe; result not cached",
                    outcome.index.failed_chapters().count()
                );
                Ok(ExitCode::from(2))
            }
        }

        Command::Show { source } => {
            let fingerprint = Fingerprint::of(&source, mode, cancel).await?;
            match cache.get(&fingerprint, cancel).await? {
                Some(index) => {
                    print_json(&index)?;
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("no cached index for {}", source.display());
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Command::Invalidate { source } => {
            // By path: a source that changed or vanished since it was cached still has a slot.
            let removed = cache.invalidate_source(&source).await?;
            eprintln!(
                "{} {}",
                if removed { "invalidated" } else { "nothing cached for" },
                source.display()
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::Clear => {
            let removed = cache.clear().await?;
            eprintln!("removed {removed} cached index(es) from {}", cache.root().display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cache_root(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(root) => Ok(root.to_path_buf()),
        None => default_cache_root().context("no --cache-dir given"),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    serde_json::to_writer_pretty(&mut writer, value).context("failed to write JSON")?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}
