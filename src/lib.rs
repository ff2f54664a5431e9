//! # edgequake-docconv
//!
//! Convert large documents with an external converter (pandoc by default)
//! without letting one oversized input take the host down.
//!
//! ## Why this crate?
//!
//! Handing a 300 MB HTML export to a document converter in one go tends to
//! end in one of three ways: it succeeds, it runs for an hour, or it eats all
//! the memory on the box. This crate wraps the converter in a pipeline that
//! picks a strategy from the input's size and type, supervises every child
//! process against a memory ceiling and a timeout, splits oversized markup
//! into independently convertible fragments, and degrades to plain text
//! extraction when conversion keeps failing.
//!
//! ## Pipeline Overview
//!
//! ```text
//! input
//!  │
//!  ├─ 1. Stage     validate size, create a scoped working directory
//!  ├─ 2. Check     converter pre-flight (`--version`, data directory)
//!  ├─ 3. Select    single-file below the chunking threshold, chunked above
//!  ├─ 4. Convert   supervised converter runs (SIGTERM → grace → SIGKILL)
//!  ├─ 5. Degrade   text extraction when too few chunks succeed
//!  └─ 6. Finalize  move the artifact out, discard the working directory
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docconv::{convert, ConversionRequest, ProcessingConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProcessingConfig::default();
//!     let request = ConversionRequest::from_path("export.html", "markdown");
//!     let output = convert(request, &config).await?;
//!     println!("{}", output.file_path.display());
//!     eprintln!(
//!         "strategy: {} ({} chunks, {:.0}% converted)",
//!         output.conversion_details.strategy,
//!         output.conversion_details.chunk_count,
//!         output.conversion_details.success_ratio * 100.0
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docconv` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-docconv = { version = "0.1", default-features = false }
//! ```
//!
//! ## Tuning
//!
//! | Knob | Default | Effect |
//! |------|---------|--------|
//! | `chunking_threshold` | 50 MiB | markup at or above this is chunked |
//! | `chunk_size` | 10 MiB | upper bound for one fragment file |
//! | `line_split_threshold` | 200 MiB | above this, split lines without parsing |
//! | `memory_limit_mb` | 4096 | converter RSS ceiling |
//! | `timeout_secs` | 600 | per chunk; single-file runs get 3× |
//! | `success_rate_threshold` | 0.5 | below this a chunked run degrades |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod options;
pub mod output;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{output_extension, FormatFamily, ProcessingConfig, ProcessingConfigBuilder};
pub use convert::{
    convert, convert_from_bytes, convert_sync, convert_to_file, inspect_converter, ConversionRequest,
    ConverterInfo,
};
pub use error::{remediation_hint, resource_hint, ChunkError, DocConvError, ResourceKind};
pub use options::{AdvancedOptions, FeatureToggles};
pub use output::{
    ChunkRecord, ConversionDetails, ConversionOutcome, ConversionOutput, InputDiagnostics, MemoryReport,
    MemorySnapshot, OutputDiagnostics, SplitMode, Strategy,
};
pub use pipeline::staging::InputSource;
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
