//! Strategy selection and the three conversion strategies.
//!
//! ```text
//! Staged ─► select ─┬─► SingleFile ──────────────┬─► outcome
//!                   │      └─(opt-in, on failure)─┤
//!                   └─► Chunked ─► ratio ≥ min ───┤
//!                          └─► ratio < min ─► TextExtraction ─► outcome
//! ```
//!
//! Transitions only move forward: a failed chunk is never re-run, and a
//! degraded run never returns to the converter.

use crate::config::{output_extension, ProcessingConfig};
use crate::error::{ChunkError, DocConvError, ResourceKind};
use crate::options::AdvancedOptions;
use crate::output::{ChunkRecord, ConversionOutcome, MemoryReport, MemorySnapshot, SplitMode, Strategy};
use crate::pipeline::chunking::{is_markup, should_chunk, ChunkingEngine};
use crate::pipeline::executor::ConverterExecutor;
use crate::pipeline::extract::TextFallbackExtractor;
use crate::pipeline::monitor::ResourceMonitor;
use crate::pipeline::staging::InputDescriptor;
use crate::progress::{ConversionProgressCallback, NoopProgressCallback};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

static NOOP_PROGRESS: NoopProgressCallback = NoopProgressCallback;

/// Everything a strategy needs for one run.
pub struct StrategyContext<'a> {
    pub config: &'a ProcessingConfig,
    pub executor: &'a ConverterExecutor,
    pub monitor: &'a ResourceMonitor,
    pub work_dir: &'a Path,
    pub input: &'a InputDescriptor,
    /// Writer name with feature toggles applied.
    pub format: &'a str,
    pub options: &'a AdvancedOptions,
    pub self_contained: bool,
}

impl StrategyContext<'_> {
    fn progress(&self) -> &dyn ConversionProgressCallback {
        self.config
            .progress_callback
            .as_deref()
            .unwrap_or(&NOOP_PROGRESS as &dyn ConversionProgressCallback)
    }

    fn converted_path(&self, stem: &str) -> PathBuf {
        self.work_dir
            .join(format!("{stem}_converted.{}", output_extension(self.format)))
    }
}

/// Pick the initial strategy from input size and type.
///
/// Markup at or above the chunking threshold is chunked; everything else is
/// converted in one go. Text extraction is only ever reached by degrading.
pub fn select(input: &InputDescriptor, config: &ProcessingConfig) -> Strategy {
    if should_chunk(input.size, &input.extension, config.chunking_threshold) {
        Strategy::Chunked
    } else {
        Strategy::SingleFile
    }
}

/// Whether a chunked run with `ratio` must fall back to text extraction.
pub fn should_degrade(ratio: f64, minimum: f64) -> bool {
    ratio == 0.0 || ratio < minimum
}

/// Select a strategy and run it to a terminal outcome.
pub async fn run(ctx: &StrategyContext<'_>) -> Result<ConversionOutcome, DocConvError> {
    let strategy = select(ctx.input, ctx.config);
    info!(
        "Selected {strategy} strategy for {} ({:.1}MB)",
        ctx.input.filename,
        ctx.input.size as f64 / (1024.0 * 1024.0)
    );
    strategy.execute(ctx).await
}

impl Strategy {
    /// Run this strategy. Converter failures of a single-file run are fatal
    /// unless `fallback_on_single_file_failure` is set and the input is markup.
    pub async fn execute(self, ctx: &StrategyContext<'_>) -> Result<ConversionOutcome, DocConvError> {
        match self {
            Strategy::SingleFile => match single_file(ctx).await {
                Err(e @ (DocConvError::ConverterFailure { .. } | DocConvError::ResourceExceeded { .. }))
                    if ctx.config.fallback_on_single_file_failure && is_markup(&ctx.input.extension) =>
                {
                    warn!("Single-file conversion failed, falling back to text extraction: {e}");
                    let before = ctx.monitor.snapshot();
                    text_extraction(ctx, before, 0.0, 1, Vec::new(), Some(e.to_string())).await
                }
                other => other,
            },
            Strategy::Chunked => chunked(ctx).await,
            Strategy::TextExtraction => {
                let before = ctx.monitor.snapshot();
                text_extraction(ctx, before, 1.0, 1, Vec::new(), None).await
            }
        }
    }
}

// ── Single file ──────────────────────────────────────────────────────────

async fn single_file(ctx: &StrategyContext<'_>) -> Result<ConversionOutcome, DocConvError> {
    let before = ctx.monitor.snapshot();
    let progress = ctx.progress();
    progress.on_conversion_start(1);
    progress.on_chunk_start(1, 1);

    let output = ctx.converted_path(&ctx.input.stem());
    let argv = ctx.executor.build_command(
        &ctx.input.path,
        &output,
        ctx.format,
        ctx.options,
        ctx.self_contained,
    );
    let timeout = ctx.config.single_file_timeout();
    let result = ctx
        .executor
        .execute(&argv, ctx.work_dir, ctx.config.memory_limit_mb, timeout, "single")
        .await?;

    if let Some(err) = result.to_error(ctx.config.memory_limit_mb, timeout) {
        progress.on_chunk_error(1, 1, &err.to_string());
        progress.on_conversion_complete(1, 0);
        return Err(err);
    }
    let Ok(meta) = tokio::fs::metadata(&output).await else {
        let err = DocConvError::ConverterFailure {
            exit_code: 0,
            stderr: result.stderr_excerpt(),
            stdout: result.stdout_excerpt(),
            hint: "Hint: the converter exited successfully but wrote no output file; check the output format."
                .to_string(),
        };
        progress.on_chunk_error(1, 1, &err.to_string());
        progress.on_conversion_complete(1, 0);
        return Err(err);
    };
    progress.on_chunk_complete(1, 1, meta.len());
    progress.on_conversion_complete(1, 1);

    let after = ctx.monitor.snapshot();
    let mut outcome = ConversionOutcome::succeeded(Strategy::SingleFile, output, MemoryReport { before, after });
    outcome.chunk_count = 1;
    Ok(outcome)
}

// ── Chunked ──────────────────────────────────────────────────────────────

async fn chunked(ctx: &StrategyContext<'_>) -> Result<ConversionOutcome, DocConvError> {
    let before = ctx.monitor.snapshot();
    let engine = ChunkingEngine::new(ctx.config.line_split_threshold);

    let split = {
        let engine = engine.clone();
        let input = ctx.input.path.clone();
        let work_dir = ctx.work_dir.to_path_buf();
        let max = ctx.config.chunk_size;
        tokio::task::spawn_blocking(move || engine.split(&input, &work_dir, max))
            .await
            .map_err(|e| DocConvError::Internal(format!("Split task failed: {e}")))?
    };
    if let SplitMode::Degraded { ref reason } = split.mode {
        warn!("Structural split degraded ({reason}); converting the original file as one chunk");
    }

    let total = split.fragments.len();
    let progress = ctx.progress();
    progress.on_conversion_start(total);
    info!("Processing {total} chunks sequentially");

    let mut records = Vec::with_capacity(total);
    for (i, fragment) in split.fragments.iter().enumerate() {
        let id = i + 1;
        progress.on_chunk_start(id, total);
        let stem = fragment
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("chunk_{id:03}"));
        let output = ctx.converted_path(&stem);
        let record = convert_chunk(ctx, id, &fragment.path, output).await;

        match (&record.output, &record.error) {
            (Some(out), _) => {
                let bytes = std::fs::metadata(out).map(|m| m.len()).unwrap_or(0);
                info!("Chunk {id}/{total} converted successfully");
                progress.on_chunk_complete(id, total, bytes);
            }
            (None, Some(err)) => {
                warn!("Chunk {id}/{total} failed: {err}");
                progress.on_chunk_error(id, total, &err.to_string());
            }
            (None, None) => {}
        }
        records.push(record);
    }

    let succeeded: Vec<PathBuf> = records.iter().filter_map(|r| r.output.clone()).collect();
    progress.on_conversion_complete(total, succeeded.len());
    let ratio = if total == 0 {
        0.0
    } else {
        succeeded.len() as f64 / total as f64
    };
    info!(
        "Chunk processing completed: {}/{} successful ({:.1}%)",
        succeeded.len(),
        total,
        ratio * 100.0
    );

    if should_degrade(ratio, ctx.config.success_rate_threshold) {
        warn!(
            "Chunk success rate {:.1}% below {:.1}%, falling back to text extraction",
            ratio * 100.0,
            ctx.config.success_rate_threshold * 100.0
        );
        let reason = format!(
            "{} of {} chunks converted, below the {:.0}% minimum",
            succeeded.len(),
            total,
            ctx.config.success_rate_threshold * 100.0
        );
        let mut outcome = text_extraction(ctx, before, ratio, total, records, Some(reason)).await?;
        outcome.split_mode = Some(split.mode);
        return Ok(outcome);
    }

    let merged = {
        let engine = engine.clone();
        let format = ctx.format.to_string();
        let work_dir = ctx.work_dir.to_path_buf();
        let stem = ctx.input.stem();
        tokio::task::spawn_blocking(move || engine.merge(&succeeded, &format, &work_dir, &stem))
            .await
            .map_err(|e| DocConvError::Internal(format!("Merge task failed: {e}")))??
    };

    let after = ctx.monitor.snapshot();
    let mut outcome = ConversionOutcome::succeeded(Strategy::Chunked, merged, MemoryReport { before, after });
    outcome.chunk_count = total;
    outcome.split_mode = Some(split.mode);
    outcome.success_ratio = ratio;
    outcome.chunks = records;
    Ok(outcome)
}

async fn convert_chunk(ctx: &StrategyContext<'_>, id: usize, source: &Path, output: PathBuf) -> ChunkRecord {
    let started = Instant::now();
    let argv = ctx
        .executor
        .build_command(source, &output, ctx.format, ctx.options, ctx.self_contained);
    let label = format!("chunk_{id}");

    let error = match ctx
        .executor
        .execute(
            &argv,
            ctx.work_dir,
            ctx.config.memory_limit_mb,
            ctx.config.chunk_timeout(),
            &label,
        )
        .await
    {
        Ok(result) => match result.to_chunk_error(id) {
            Some(err) => Some(err),
            None if output.exists() => None,
            None => Some(ChunkError::MissingOutput { chunk: id }),
        },
        Err(e) => {
            error!("Error processing chunk {id}: {e}");
            Some(ChunkError::Spawn {
                chunk: id,
                detail: e.to_string(),
            })
        }
    };

    ChunkRecord {
        id,
        source: source.to_path_buf(),
        output: error.is_none().then_some(output),
        success: error.is_none(),
        error,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

// ── Text extraction ──────────────────────────────────────────────────────

async fn text_extraction(
    ctx: &StrategyContext<'_>,
    before: MemorySnapshot,
    success_ratio: f64,
    chunk_count: usize,
    chunks: Vec<ChunkRecord>,
    reason: Option<String>,
) -> Result<ConversionOutcome, DocConvError> {
    info!("Using text extraction strategy for {}", ctx.input.filename);
    let extraction = {
        let input = ctx.input.path.clone();
        let format = ctx.format.to_string();
        let stem = ctx.input.stem();
        let work_dir = ctx.work_dir.to_path_buf();
        tokio::task::spawn_blocking(move || TextFallbackExtractor::new().extract(&input, &format, &stem, &work_dir))
            .await
            .map_err(|e| DocConvError::Internal(format!("Text extraction task failed: {e}")))??
    };

    let after = ctx.monitor.snapshot();
    let mut outcome = ConversionOutcome::succeeded(
        Strategy::TextExtraction,
        extraction.path,
        MemoryReport { before, after },
    );
    outcome.chunk_count = chunk_count;
    outcome.success_ratio = success_ratio;
    outcome.chunks = chunks;
    outcome.placeholder = extraction.placeholder;
    outcome.error = reason;
    Ok(outcome)
}

/// Count chunks killed for each resource, for logs and the CLI summary.
pub fn resource_kills(chunks: &[ChunkRecord]) -> (usize, usize) {
    chunks.iter().fold((0, 0), |(mem, time), r| match r.error {
        Some(ChunkError::ResourceExceeded { kind: ResourceKind::Memory, .. }) => (mem + 1, time),
        Some(ChunkError::ResourceExceeded { kind: ResourceKind::Timeout, .. }) => (mem, time + 1),
        _ => (mem, time),
    })
}
