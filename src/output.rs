//! Result types returned by the conversion pipeline.
//!
//! [`ConversionOutcome`] is the terminal value a strategy produces; the
//! top-level entry points wrap it, together with staging and finalization
//! diagnostics, into a [`ConversionOutput`] that mirrors the calling layer's
//! `{filePath, fileName, conversionDetails}` shape.

use crate::error::ChunkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A complete method for producing an output artifact from an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One converter invocation over the whole input.
    SingleFile,
    /// Split, convert fragments sequentially, merge.
    Chunked,
    /// Direct text extraction without the converter.
    TextExtraction,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::SingleFile => f.write_str("single_file"),
            Strategy::Chunked => f.write_str("chunked"),
            Strategy::TextExtraction => f.write_str("text_extraction"),
        }
    }
}

/// How the chunking engine split the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SplitMode {
    /// Cut at element boundaries of a parsed document.
    Structural,
    /// Streamed line by line without parsing.
    LineOriented,
    /// Splitting failed; the original file is the single fragment.
    Degraded { reason: String },
}

/// Point-in-time memory sample. Zeroed when sampling is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    /// Resident memory of this process in MB.
    pub process_memory_mb: f64,
    /// Total system memory in GB.
    pub system_memory_gb: f64,
    /// Available system memory in GB.
    pub available_memory_gb: f64,
    /// Percentage of system memory in use.
    pub memory_usage_percent: f64,
}

/// Memory samples taken around a strategy run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReport {
    pub before: MemorySnapshot,
    pub after: MemorySnapshot,
}

/// Per-fragment result of a chunked run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    /// 1-indexed fragment ordinal.
    pub id: usize,
    /// Fragment file fed to the converter.
    pub source: PathBuf,
    /// Converter output, present only on success.
    pub output: Option<PathBuf>,
    pub success: bool,
    /// Set when `success` is false.
    pub error: Option<ChunkError>,
    pub duration_ms: u64,
}

/// Terminal value of one strategy run. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionOutcome {
    pub success: bool,
    /// Artifact inside the scoped working directory (before finalization).
    pub output_path: Option<PathBuf>,
    pub strategy: Strategy,
    pub chunk_count: usize,
    /// Set whenever the input went through the chunking engine.
    pub split_mode: Option<SplitMode>,
    /// Fraction of chunks converted; 1.0 for non-chunked strategies.
    pub success_ratio: f64,
    pub memory: MemoryReport,
    /// Per-chunk records (chunked runs only).
    pub chunks: Vec<ChunkRecord>,
    /// True when the text fallback could only write a diagnostic placeholder.
    pub placeholder: bool,
    pub error: Option<String>,
}

impl ConversionOutcome {
    pub(crate) fn succeeded(strategy: Strategy, output_path: PathBuf, memory: MemoryReport) -> Self {
        Self {
            success: true,
            output_path: Some(output_path),
            strategy,
            chunk_count: 0,
            split_mode: None,
            success_ratio: 1.0,
            memory,
            chunks: Vec::new(),
            placeholder: false,
            error: None,
        }
    }
}

/// Facts about the staged input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDiagnostics {
    pub filename: String,
    pub file_size: u64,
    pub size_mb: f64,
    pub extension: String,
}

/// Facts about the finalized artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDiagnostics {
    pub file_name: String,
    pub file_size: u64,
    pub extension: String,
    /// First line of `<converter> --version`.
    pub converter_version: String,
    /// The text fallback failed and wrote a diagnostic placeholder.
    pub placeholder: bool,
}

/// Everything the calling layer reports about a conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionDetails {
    pub strategy: Strategy,
    pub chunk_count: usize,
    /// `None` when the input was never split.
    pub split_mode: Option<SplitMode>,
    pub success_ratio: f64,
    pub memory_snapshots: MemoryReport,
    pub input_diagnostics: InputDiagnostics,
    pub output_diagnostics: OutputDiagnostics,
    pub chunks: Vec<ChunkRecord>,
    pub total_duration_ms: u64,
}

/// Successful result of [`crate::convert()`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionOutput {
    /// Durable path of the finalized artifact.
    pub file_path: PathBuf,
    pub file_name: String,
    pub conversion_details: ConversionDetails,
}

/// Round a byte count to megabytes with two decimals.
pub(crate) fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}
