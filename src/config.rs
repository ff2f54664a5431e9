//! Configuration types for large-document conversion.
//!
//! All pipeline behaviour is controlled through [`ProcessingConfig`], built
//! via its [`ProcessingConfigBuilder`]. Keeping every knob in one struct makes
//! it trivial to share a config across concurrent invocations and to log it
//! next to an outcome when diagnosing why two runs behaved differently.

use crate::error::DocConvError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Configuration for the adaptive conversion pipeline.
///
/// Built via [`ProcessingConfig::builder()`] or using
/// [`ProcessingConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_docconv::ProcessingConfig;
///
/// let config = ProcessingConfig::builder()
///     .chunk_size(5 * 1024 * 1024)
///     .memory_limit_mb(2048)
///     .converter("/usr/local/bin/pandoc")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ProcessingConfig {
    /// Target size of one fragment in bytes. Default: 10 MiB.
    pub chunk_size: u64,

    /// Resident-memory ceiling for one converter process, in MB. Default: 4096.
    ///
    /// Enforced by active supervision, not by cgroups: the monitor samples
    /// the child once per [`poll_interval`](Self::poll_interval) and
    /// terminates it when the ceiling is crossed.
    pub memory_limit_mb: u64,

    /// Per-chunk timeout in seconds. Default: 600.
    ///
    /// Whole-file attempts get three times this budget because there is no
    /// chunk boundary to retry against.
    pub timeout_secs: u64,

    /// Markup inputs at or above this size are chunked. Default: 50 MiB.
    pub chunking_threshold: u64,

    /// Markup inputs larger than this are split line by line without a
    /// structural parse. Default: 200 MiB.
    pub line_split_threshold: u64,

    /// Minimum fraction of chunks that must convert for the merged output to
    /// be used. Default: 0.5.
    pub success_rate_threshold: f64,

    /// Absolute ceiling on input size. Default: 2 GiB.
    pub max_input_size: u64,

    /// Memory sampling interval of the supervisor. Default: 1 s.
    pub poll_interval: Duration,

    /// Time between SIGTERM and SIGKILL. Default: 2 s.
    pub grace_period: Duration,

    /// Converter executable name or path. Default: `pandoc`.
    pub converter: String,

    /// Converter data directory, checked during pre-flight and passed as
    /// `--data-dir` when set.
    pub data_dir: Option<PathBuf>,

    /// Durable directory that receives finalized artifacts.
    /// Default: `<system temp>/docconv/downloads`.
    pub output_dir: PathBuf,

    /// Parent directory for per-invocation scoped working directories.
    /// If None, uses the system temp directory.
    pub work_root: Option<PathBuf>,

    /// Degrade a failed single-file attempt on markup input to text
    /// extraction instead of failing. Default: false.
    pub fallback_on_single_file_failure: bool,

    /// Optional per-chunk progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10 * MIB,
            memory_limit_mb: 4096,
            timeout_secs: 600,
            chunking_threshold: 50 * MIB,
            line_split_threshold: 200 * MIB,
            success_rate_threshold: 0.5,
            max_input_size: 2 * 1024 * MIB,
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(2),
            converter: "pandoc".to_string(),
            data_dir: None,
            output_dir: std::env::temp_dir().join("docconv").join("downloads"),
            work_root: None,
            fallback_on_single_file_failure: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ProcessingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingConfig")
            .field("chunk_size", &self.chunk_size)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("timeout_secs", &self.timeout_secs)
            .field("chunking_threshold", &self.chunking_threshold)
            .field("line_split_threshold", &self.line_split_threshold)
            .field("success_rate_threshold", &self.success_rate_threshold)
            .field("max_input_size", &self.max_input_size)
            .field("converter", &self.converter)
            .field("data_dir", &self.data_dir)
            .field("output_dir", &self.output_dir)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ProcessingConfig {
    /// Create a new builder for `ProcessingConfig`.
    pub fn builder() -> ProcessingConfigBuilder {
        ProcessingConfigBuilder {
            config: Self::default(),
        }
    }

    /// Timeout for one chunk attempt.
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Timeout for a whole-file attempt (3× the chunk timeout).
    pub fn single_file_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.saturating_mul(3))
    }
}

/// Builder for [`ProcessingConfig`].
#[derive(Debug)]
pub struct ProcessingConfigBuilder {
    config: ProcessingConfig,
}

impl ProcessingConfigBuilder {
    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.config.chunk_size = bytes;
        self
    }

    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.config.memory_limit_mb = mb;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn chunking_threshold(mut self, bytes: u64) -> Self {
        self.config.chunking_threshold = bytes;
        self
    }

    pub fn line_split_threshold(mut self, bytes: u64) -> Self {
        self.config.line_split_threshold = bytes;
        self
    }

    pub fn success_rate_threshold(mut self, ratio: f64) -> Self {
        self.config.success_rate_threshold = ratio;
        self
    }

    pub fn max_input_size(mut self, bytes: u64) -> Self {
        self.config.max_input_size = bytes;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period = grace;
        self
    }

    pub fn converter(mut self, binary: impl Into<String>) -> Self {
        self.config.converter = binary.into();
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn work_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_root = Some(dir.into());
        self
    }

    pub fn fallback_on_single_file_failure(mut self, v: bool) -> Self {
        self.config.fallback_on_single_file_failure = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProcessingConfig, DocConvError> {
        let c = &self.config;
        if c.chunk_size == 0 {
            return Err(DocConvError::InvalidConfig("Chunk size must be ≥ 1 byte".into()));
        }
        if c.memory_limit_mb == 0 {
            return Err(DocConvError::InvalidConfig("Memory limit must be ≥ 1 MB".into()));
        }
        if c.timeout_secs == 0 {
            return Err(DocConvError::InvalidConfig("Timeout must be ≥ 1 second".into()));
        }
        if !(c.success_rate_threshold > 0.0 && c.success_rate_threshold <= 1.0) {
            return Err(DocConvError::InvalidConfig(format!(
                "Success rate threshold must be in (0, 1], got {}",
                c.success_rate_threshold
            )));
        }
        if c.max_input_size == 0 {
            return Err(DocConvError::InvalidConfig("Max input size must be ≥ 1 byte".into()));
        }
        if c.poll_interval.is_zero() {
            return Err(DocConvError::InvalidConfig("Poll interval must be non-zero".into()));
        }
        if c.converter.trim().is_empty() {
            return Err(DocConvError::InvalidConfig("Converter binary must be set".into()));
        }
        Ok(self.config)
    }
}

// ── Output formats ───────────────────────────────────────────────────────

/// Coarse grouping of output formats, used to pick merge separators and the
/// text-fallback wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatFamily {
    Markdown,
    PlainText,
    Html,
    Other,
}

impl FormatFamily {
    /// Classify a converter format name. Feature toggles are ignored.
    pub fn of(format: &str) -> Self {
        match base_format(format).to_ascii_lowercase().as_str() {
            "md" | "markdown" | "gfm" | "commonmark" | "commonmark_x" | "markdown_strict"
            | "markdown_mmd" | "markdown_phpextra" | "markdown_github" => FormatFamily::Markdown,
            "txt" | "plain" => FormatFamily::PlainText,
            "html" | "html4" | "html5" | "htm" => FormatFamily::Html,
            _ => FormatFamily::Other,
        }
    }

    /// Separator inserted between merged fragment outputs.
    pub fn merge_separator(&self) -> String {
        match self {
            FormatFamily::Markdown => "\n\n---\n\n".to_string(),
            FormatFamily::PlainText => format!("\n\n{}\n\n", "=".repeat(50)),
            FormatFamily::Html | FormatFamily::Other => "\n\n".to_string(),
        }
    }
}

/// Strip `+feature` / `-feature` toggles from a writer name.
pub fn base_format(format: &str) -> &str {
    format
        .find(['+', '-'])
        .map(|i| &format[..i])
        .unwrap_or(format)
}

/// Map a converter format name to the file extension of its output.
pub fn output_extension(format: &str) -> String {
    let base = base_format(format).to_ascii_lowercase();
    let ext = match base.as_str() {
        "plain" | "txt" => "txt",
        "markdown" | "md" | "gfm" | "commonmark" | "commonmark_x" | "markdown_strict" => "md",
        "html" | "html4" | "html5" => "html",
        "latex" => "tex",
        "pdf" => "pdf",
        "docx" => "docx",
        "odt" => "odt",
        "rtf" => "rtf",
        "epub" | "epub2" | "epub3" => "epub",
        "json" => "json",
        _ => return base,
    };
    ext.to_string()
}
