/// How a source document's identity is derived.
///
/// `Metadata` is cheap and sufficient for local, single-writer workflows. `ContentHash`
/// additionally streams the whole file through BLAKE3, which survives mtime-preserving
/// copies and clock skew at the cost of reading every byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FingerprintMode {
    /// Path, size and modification time.
    #[default]
    Metadata,

    /// Path, size, modification time and a BLAKE3 digest of the contents.
    ContentHash,
}

/// Options forwarded to the transcription service for every chapter.
///
/// This struct represents *library-level configuration*, not CLI flags directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscribeOpts {
    /// Optional model hint understood by the transcription service.
    ///
    /// When `None`, the service picks its default model.
    pub model: Option<String>,

    /// Optional language hint (e.g. `"en"`, `"es"`).
    pub language: Option<String>,
}

/// Options that control one `Processor::process` call.
#[derive(Debug, Clone)]
pub struct ProcessOpts {
    /// How the source fingerprint is computed.
    pub fingerprint_mode: FingerprintMode,

    /// Upper bound on chapters transcribed concurrently. `0` is treated as `1`.
    ///
    /// Result order never depends on this value.
    pub max_concurrent_chapters: usize,

    /// Skip the cache lookup and always rebuild. The result is still persisted.
    pub refresh: bool,

    /// Options handed to the transcription service.
    pub transcribe: TranscribeOpts,
}

impl Default for ProcessOpts {
    fn default() -> Self {
        Self {
            fingerprint_mode: FingerprintMode::Metadata,
            max_concurrent_chapters: num_cpus::get().clamp(1, 4),
            refresh: false,
            transcribe: TranscribeOpts::default(),
        }
    }
}

impl ProcessOpts {
    pub(crate) fn chapter_concurrency(&self) -> usize {
        self.max_concurrent_chapters.max(1)
    }
}
