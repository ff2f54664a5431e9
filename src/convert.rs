//! Conversion entry points.
//!
//! Every call runs the same sequence:
//!
//! ```text
//! validate ─► stage ─► pre-flight ─► workspace ─► strategy ─► finalize ─► cleanup
//! ```
//!
//! Validation and staging are local checks, so a malformed request never
//! spawns a converter. The finalized artifact is moved out of the scoped
//! workspace before the workspace is consumed by [`cleanup`].

use crate::config::ProcessingConfig;
use crate::error::DocConvError;
use crate::options::{validate_format, AdvancedOptions, FeatureToggles};
use crate::output::{ConversionDetails, ConversionOutcome, ConversionOutput, OutputDiagnostics};
use crate::pipeline::executor::ConverterExecutor;
use crate::pipeline::monitor::ResourceMonitor;
use crate::pipeline::staging::{cleanup, stage, InputDescriptor, InputSource, ScopedWorkspace};
use crate::pipeline::strategy::{self, StrategyContext};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// One conversion job.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Name of the uploaded file; only its final component is used.
    pub filename: String,
    pub source: InputSource,
    /// Bare writer name, e.g. `markdown`, `plain`, `html5`.
    pub output_format: String,
    pub advanced_options: AdvancedOptions,
    pub features: FeatureToggles,
    /// Ask the converter to embed external resources.
    pub self_contained: bool,
}

impl ConversionRequest {
    /// Convert a file already on disk.
    pub fn from_path(path: impl Into<PathBuf>, output_format: impl Into<String>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(filename, InputSource::Path(path), output_format)
    }

    /// Convert bytes held in memory.
    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>, output_format: impl Into<String>) -> Self {
        Self::new(filename.into(), InputSource::Bytes(bytes), output_format)
    }

    fn new(filename: String, source: InputSource, output_format: impl Into<String>) -> Self {
        Self {
            filename,
            source,
            output_format: output_format.into(),
            advanced_options: AdvancedOptions::default(),
            features: FeatureToggles::default(),
            self_contained: false,
        }
    }

    pub fn advanced_options(mut self, options: AdvancedOptions) -> Self {
        self.advanced_options = options;
        self
    }

    pub fn features(mut self, features: FeatureToggles) -> Self {
        self.features = features;
        self
    }

    pub fn self_contained(mut self, v: bool) -> Self {
        self.self_contained = v;
        self
    }
}

/// Result of [`inspect_converter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterInfo {
    pub binary: String,
    /// First line of `<binary> --version`.
    pub version: String,
    pub data_dir: Option<PathBuf>,
}

/// Convert a document to the requested format.
///
/// # Errors
/// Returns `Err(DocConvError)` for:
/// - invalid input (empty, oversized, bad format name)
/// - a converter that fails its pre-flight check
/// - a failed single-file attempt (unless
///   [`ProcessingConfig::fallback_on_single_file_failure`] is set)
/// - output that cannot be written
///
/// A chunked run whose success ratio falls short is *not* an error; it
/// comes back as `Ok` with strategy `TextExtraction`.
pub async fn convert(request: ConversionRequest, config: &ProcessingConfig) -> Result<ConversionOutput, DocConvError> {
    let total_start = Instant::now();
    info!("Starting conversion: {} -> {}", request.filename, request.output_format);

    // ── Step 1: Local validation ─────────────────────────────────────────
    validate_format(&request.output_format)?;
    let format = request.features.complete_format(&request.output_format);
    let size = match &request.source {
        InputSource::Bytes(bytes) => bytes.len() as u64,
        InputSource::Path(path) => tokio::fs::metadata(path)
            .await
            .map_err(|e| DocConvError::invalid_input(format!("Cannot read input '{}': {e}", path.display())))?
            .len(),
    };
    let mut descriptor = stage(&request.filename, size, config.max_input_size)?;

    // ── Step 2: Converter pre-flight ─────────────────────────────────────
    let monitor = ResourceMonitor::new(config.poll_interval, config.grace_period);
    let executor = ConverterExecutor::new(&config.converter, config.data_dir.clone(), monitor.clone());
    let version = executor.preflight().await?;

    // ── Step 3: Run inside a scoped workspace ────────────────────────────
    let workspace = ScopedWorkspace::create(config.work_root.as_deref())?;
    let result = async {
        workspace.materialize(&mut descriptor, &request.source).await?;
        let ctx = StrategyContext {
            config,
            executor: &executor,
            monitor: &monitor,
            work_dir: workspace.path(),
            input: &descriptor,
            format: &format,
            options: &request.advanced_options,
            self_contained: request.self_contained,
        };
        let outcome = strategy::run(&ctx).await?;
        finalize(&workspace, &descriptor, outcome, config, version).await
    }
    .await;
    cleanup(workspace);

    let mut output = result?;
    output.conversion_details.total_duration_ms = total_start.elapsed().as_millis() as u64;
    info!(
        "Conversion complete: {} via {} in {}ms",
        output.file_name, output.conversion_details.strategy, output.conversion_details.total_duration_ms
    );
    Ok(output)
}

/// Convert bytes in memory. Shorthand for [`ConversionRequest::from_bytes`] + [`convert`].
pub async fn convert_from_bytes(
    filename: impl Into<String>,
    bytes: Vec<u8>,
    output_format: impl Into<String>,
    config: &ProcessingConfig,
) -> Result<ConversionOutput, DocConvError> {
    convert(ConversionRequest::from_bytes(filename, bytes, output_format), config).await
}

/// Convert and place the artifact at `output_path`.
///
/// Uses atomic write (temp file + rename) to prevent partial files. The
/// returned output points at `output_path`.
pub async fn convert_to_file(
    request: ConversionRequest,
    output_path: impl AsRef<Path>,
    config: &ProcessingConfig,
) -> Result<ConversionOutput, DocConvError> {
    let mut output = convert(request, config).await?;
    let path = output_path.as_ref();
    let write_err = |e: std::io::Error| DocConvError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    tokio::fs::copy(&output.file_path, &tmp_path).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;

    if let Err(e) = tokio::fs::remove_file(&output.file_path).await {
        warn!("Could not remove {} after copying: {e}", output.file_path.display());
    }
    output.file_path = path.to_path_buf();
    output.file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(output)
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(request: ConversionRequest, config: &ProcessingConfig) -> Result<ConversionOutput, DocConvError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| DocConvError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(request, config))
}

/// Run the converter pre-flight check without converting anything.
pub async fn inspect_converter(config: &ProcessingConfig) -> Result<ConverterInfo, DocConvError> {
    let monitor = ResourceMonitor::new(config.poll_interval, config.grace_period);
    let executor = ConverterExecutor::new(&config.converter, config.data_dir.clone(), monitor);
    let version = executor.preflight().await?;
    Ok(ConverterInfo {
        binary: config.converter.clone(),
        version,
        data_dir: config.data_dir.clone(),
    })
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Move the outcome's artifact to the durable output directory and
/// assemble the caller-facing result.
async fn finalize(
    workspace: &ScopedWorkspace,
    input: &InputDescriptor,
    outcome: ConversionOutcome,
    config: &ProcessingConfig,
    converter_version: String,
) -> Result<ConversionOutput, DocConvError> {
    let temp_output = outcome
        .output_path
        .as_deref()
        .ok_or_else(|| DocConvError::Internal("Strategy finished without an output file".into()))?;

    let extension = temp_output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let desired_name = if extension.is_empty() {
        input.stem()
    } else {
        format!("{}.{extension}", input.stem())
    };
    let file_path = workspace
        .finalize(temp_output, &desired_name, &config.output_dir)
        .await?;

    let file_size = tokio::fs::metadata(&file_path)
        .await
        .map(|m| m.len())
        .map_err(|e| DocConvError::OutputWriteFailed {
            path: file_path.clone(),
            source: e,
        })?;
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(ConversionOutput {
        conversion_details: ConversionDetails {
            strategy: outcome.strategy,
            chunk_count: outcome.chunk_count,
            split_mode: outcome.split_mode,
            success_ratio: outcome.success_ratio,
            memory_snapshots: outcome.memory,
            input_diagnostics: input.diagnostics(),
            output_diagnostics: OutputDiagnostics {
                file_name: file_name.clone(),
                file_size,
                extension,
                converter_version,
                placeholder: outcome.placeholder,
            },
            chunks: outcome.chunks,
            total_duration_ms: 0,
        },
        file_path,
        file_name,
    })
}
