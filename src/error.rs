//! Error types for the edgequake-docconv library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DocConvError`]: **Fatal**: the conversion cannot proceed at all
//!   (bad input, converter missing, single-file attempt killed). Returned as
//!   `Err(DocConvError)` from the top-level `convert*` functions.
//!
//! * [`ChunkError`]: **Non-fatal**: one fragment of a chunked run failed
//!   but the others may still be fine. Stored inside
//!   [`crate::output::ChunkRecord`] so callers can inspect partial success
//!   rather than losing the whole document to one bad fragment.
//!
//! A chunked run whose success ratio falls below the configured minimum is
//! *not* an error: it degrades to text extraction and returns `Ok`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Why a converter process was forcibly terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Resident memory crossed the configured ceiling (or the OS killed it).
    Memory,
    /// The wall-clock timeout elapsed.
    Timeout,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => f.write_str("memory ceiling"),
            ResourceKind::Timeout => f.write_str("timeout"),
        }
    }
}

/// All fatal errors returned by the edgequake-docconv library.
///
/// Chunk-level failures use [`ChunkError`] and are stored in
/// [`crate::output::ChunkRecord`] rather than propagated here.
#[derive(Debug, Error)]
pub enum DocConvError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Empty or oversized file, malformed option syntax, disallowed option content.
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    // ── Converter errors ──────────────────────────────────────────────────
    /// The converter binary or its data files cannot be used at all.
    #[error("Converter '{binary}' is not usable: {detail}\n{hint}")]
    ConverterMissingResources {
        binary: String,
        detail: String,
        hint: String,
    },

    /// The converter exited non-zero on its own.
    #[error("Converter failed with exit code {exit_code}\n{stderr}\n{hint}")]
    ConverterFailure {
        exit_code: i32,
        stderr: String,
        stdout: String,
        hint: String,
    },

    /// The converter was killed for exceeding its memory ceiling or timeout.
    #[error("Converter terminated: exceeded {kind} ({limit})\n{stderr}\n{hint}")]
    ResourceExceeded {
        kind: ResourceKind,
        limit: String,
        stderr: String,
        hint: String,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create, move, or write an output artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocConvError {
    pub(crate) fn invalid_input(reason: impl Into<String>) -> Self {
        DocConvError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Short machine-readable label, used in logs and CLI JSON.
    pub fn kind(&self) -> &'static str {
        match self {
            DocConvError::InvalidInput { .. } => "invalid_input",
            DocConvError::ConverterMissingResources { .. } => "converter_missing_resources",
            DocConvError::ConverterFailure { .. } => "converter_failure",
            DocConvError::ResourceExceeded { .. } => "resource_exceeded",
            DocConvError::OutputWriteFailed { .. } => "output_write_failed",
            DocConvError::InvalidConfig(_) => "invalid_config",
            DocConvError::Internal(_) => "internal",
        }
    }
}

/// A non-fatal error for a single fragment of a chunked conversion.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ChunkError {
    /// The converter exited non-zero for this fragment.
    #[error("Chunk {chunk}: converter exited with code {exit_code}: {detail}")]
    ConverterFailed {
        chunk: usize,
        exit_code: i32,
        detail: String,
    },

    /// The converter was killed while processing this fragment.
    #[error("Chunk {chunk}: converter killed for exceeding {kind}")]
    ResourceExceeded { chunk: usize, kind: ResourceKind },

    /// The converter reported success but wrote no output file.
    #[error("Chunk {chunk}: converter completed but produced no output")]
    MissingOutput { chunk: usize },

    /// The converter process could not be started.
    #[error("Chunk {chunk}: could not start converter: {detail}")]
    Spawn { chunk: usize, detail: String },
}

// ── Remediation hints ────────────────────────────────────────────────────

/// Human-readable remediation hint for a failed converter run.
///
/// Exit codes follow pandoc's documented codes; stderr signatures catch the
/// failures that share a generic code.
pub fn remediation_hint(exit_code: i32, stderr: &str) -> String {
    let by_code = match exit_code {
        21 => Some("The input format is not recognised by the converter. Check the input file extension."),
        22 => Some("The requested output format is not supported. Run `pandoc --list-output-formats`."),
        23 => Some("A feature toggle is not supported by this format. Run `pandoc --list-extensions=<format>`."),
        43 | 47 => Some("PDF output needs a PDF engine (e.g. pdflatex, wkhtmltopdf) on PATH."),
        64 => Some("The input could not be parsed; the document is likely malformed or truncated."),
        92 => Some("The input is not valid UTF-8. Re-encode it (e.g. `iconv -t utf-8`) and retry."),
        97 | 99 => Some("The converter cannot find a data file or resource. Check --data-dir and resource paths."),
        _ => None,
    };
    if let Some(hint) = by_code {
        return format!("Hint: {hint}");
    }

    if stderr.contains("Permission denied") {
        return "Hint: permission issue detected; check that the working and output directories are writable."
            .to_string();
    }
    if stderr.contains("No such file or directory") {
        return "Hint: a referenced file is missing; the input may be corrupted or reference external resources."
            .to_string();
    }
    if stderr.contains("Unknown output format") || stderr.contains("Unknown extension") {
        return "Hint: check the output format name and feature toggles.".to_string();
    }

    "Hint: inspect the converter output above; retry with a smaller chunk size or simpler options."
        .to_string()
}

/// Remediation hint for a run the supervisor terminated.
pub fn resource_hint(kind: ResourceKind) -> String {
    match kind {
        ResourceKind::Memory => "Hint: raise --memory-limit-mb, or lower --chunk-size-mb / \
             --chunking-threshold-mb so the input is chunked."
            .to_string(),
        ResourceKind::Timeout => {
            "Hint: raise --timeout, or lower --chunk-size-mb so each converter run is shorter."
                .to_string()
        }
    }
}
