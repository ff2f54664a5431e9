//! CLI binary for edgequake-docconv.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ProcessingConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_docconv::pipeline::strategy::resource_kills;
use edgequake_docconv::{
    convert, convert_to_file, inspect_converter, AdvancedOptions, ConversionOutput, ConversionProgressCallback,
    ConversionRequest, FeatureToggles, ProcessingConfig, ProgressCallback, SplitMode, Strategy,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const MIB: u64 = 1024 * 1024;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar over the chunks of the run plus a
/// log line per chunk. Chunks run sequentially, so one start time suffices.
struct CliProgressCallback {
    bar: ProgressBar,
    chunk_started: Mutex<Option<Instant>>,
}

impl CliProgressCallback {
    /// Spinner until `on_conversion_start` tells us how many chunks there are.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Staging input…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            chunk_started: Mutex::new(None),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} chunks  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self) -> f64 {
        self.chunk_started
            .lock()
            .unwrap()
            .take()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_chunks: usize) {
        self.activate_bar(total_chunks);
        if total_chunks > 1 {
            self.bar.println(format!(
                "{} {}",
                cyan("◆"),
                bold(&format!("Document split into {total_chunks} chunks…"))
            ));
        }
    }

    fn on_chunk_start(&self, chunk: usize, _total: usize) {
        *self.chunk_started.lock().unwrap() = Some(Instant::now());
        self.bar.set_message(format!("chunk {chunk}"));
    }

    fn on_chunk_complete(&self, chunk: usize, total: usize, output_bytes: u64) {
        let secs = self.elapsed_secs();
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {:<10}  {}",
            green("✓"),
            chunk,
            total,
            dim(&format!("{:>6} KB", output_bytes / 1024)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_chunk_error(&self, chunk: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs();

        let first_line = error.lines().next().unwrap_or(error);
        let msg = match first_line.char_indices().nth(79) {
            Some((i, _)) => format!("{}\u{2026}", &first_line[..i]),
            None => first_line.to_string(),
        };

        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}  {}",
            red("✗"),
            chunk,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_chunks: usize, success_count: usize) {
        let failed = total_chunks.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed > 0 {
            eprintln!(
                "{} {}/{} chunks converted  ({} failed)",
                if failed == total_chunks { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_chunks,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert to Markdown (artifact lands in the output directory)
  docconv export.html

  # Convert to a specific file
  docconv export.html --to plain -o export.txt

  # Pass converter options and format features
  docconv report.html --to markdown --features "smart,-raw_html" --options "--wrap=none"

  # Tighter limits for a small container
  docconv big.html --memory-limit-mb 1024 --chunk-size-mb 5 --timeout 120

  # Check the converter installation
  docconv --check

  # JSON report of strategy, chunks and diagnostics
  docconv big.html --json > report.json

STRATEGIES:
  single_file      one converter run, inputs below the chunking threshold
  chunked          markup at or above the threshold is split, converted
                   chunk by chunk, and merged
  text_extraction  used when fewer than --min-success-ratio of the chunks
                   convert; plain text wrapped for the target format

ENVIRONMENT VARIABLES:
  Every flag can also be set through DOCCONV_<FLAG>, e.g.
  DOCCONV_CONVERTER=/opt/pandoc/bin/pandoc or DOCCONV_MEMORY_LIMIT_MB=2048.
  RUST_LOG overrides the log filter.
"#;

#[derive(Parser, Debug)]
#[command(
    name = "docconv",
    version,
    about = "Convert large documents with pandoc, chunking and degrading as needed",
    long_about = "Convert documents with an external converter (pandoc by default). Large HTML \
inputs are split into chunks converted one at a time under a memory ceiling and timeout; when too \
many chunks fail the tool falls back to plain text extraction instead of failing outright.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[arg(required_unless_present = "check")]
    input: Option<PathBuf>,

    #[arg(short = 't', long = "to", env = "DOCCONV_TO", default_value = "markdown")]
    to: String,

    #[arg(short, long, env = "DOCCONV_OUTPUT")]
    output: Option<PathBuf>,

    #[arg(long, env = "DOCCONV_OPTIONS", allow_hyphen_values = true)]
    options: Option<String>,

    #[arg(long, env = "DOCCONV_FEATURES", allow_hyphen_values = true)]
    features: Option<String>,

    #[arg(long, env = "DOCCONV_SELF_CONTAINED")]
    self_contained: bool,

    #[arg(long, env = "DOCCONV_CONVERTER", default_value = "pandoc")]
    converter: String,

    #[arg(long, env = "DOCCONV_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, env = "DOCCONV_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    #[arg(long, env = "DOCCONV_WORK_DIR")]
    work_dir: Option<PathBuf>,

    #[arg(long, env = "DOCCONV_CHUNK_SIZE_MB", default_value_t = 10)]
    chunk_size_mb: u64,

    #[arg(long, env = "DOCCONV_CHUNKING_THRESHOLD_MB", default_value_t = 50)]
    chunking_threshold_mb: u64,

    #[arg(long, env = "DOCCONV_LINE_SPLIT_THRESHOLD_MB", default_value_t = 200)]
    line_split_threshold_mb: u64,

    #[arg(long, env = "DOCCONV_MEMORY_LIMIT_MB", default_value_t = 4096)]
    memory_limit_mb: u64,

    #[arg(long, env = "DOCCONV_TIMEOUT", default_value_t = 600)]
    timeout: u64,

    #[arg(long, env = "DOCCONV_MIN_SUCCESS_RATIO", default_value_t = 0.5)]
    min_success_ratio: f64,

    #[arg(long, env = "DOCCONV_FALLBACK_ON_FAILURE")]
    fallback_on_failure: bool,

    #[arg(long, env = "DOCCONV_JSON")]
    json: bool,

    #[arg(long, env = "DOCCONV_NO_PROGRESS")]
    no_progress: bool,

    #[arg(long)]
    check: bool,

    #[arg(short, long, env = "DOCCONV_VERBOSE")]
    verbose: bool,

    #[arg(short, long, env = "DOCCONV_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs unless --verbose.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.check;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Check mode ───────────────────────────────────────────────────────
    if cli.check {
        let info = inspect_converter(&config)
            .await
            .context("Converter check failed")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&info).context("Failed to serialize converter info")?
            );
        } else {
            println!("Converter:    {}", info.binary);
            println!("Version:      {}", info.version);
            if let Some(ref dir) = info.data_dir {
                println!("Data dir:     {}", dir.display());
            }
        }
        return Ok(());
    }

    // ── Build request ────────────────────────────────────────────────────
    let input = cli.input.clone().context("An input file is required")?;
    let mut request = ConversionRequest::from_path(&input, &cli.to).self_contained(cli.self_contained);
    if let Some(ref raw) = cli.options {
        request = request.advanced_options(AdvancedOptions::parse(raw).context("Invalid --options")?);
    }
    if let Some(ref raw) = cli.features {
        request = request.features(FeatureToggles::parse(raw).context("Invalid --features")?);
    }

    // ── Run conversion ───────────────────────────────────────────────────
    let output = match cli.output {
        Some(ref path) => convert_to_file(request, path, &config).await,
        None => convert(request, &config).await,
    }
    .with_context(|| format!("Conversion of {} failed", input.display()))?;

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else {
        println!("{}", output.file_path.display());
        if !cli.quiet {
            print_summary(&output);
        }
    }

    Ok(())
}

fn print_summary(output: &ConversionOutput) {
    let details = &output.conversion_details;
    let mark = match details.strategy {
        Strategy::TextExtraction => cyan("⚠"),
        _ => green("✔"),
    };
    eprintln!(
        "{}  {}  {} chunk(s)  {:.0}% converted  {}ms  →  {}",
        mark,
        bold(&details.strategy.to_string()),
        details.chunk_count,
        details.success_ratio * 100.0,
        details.total_duration_ms,
        bold(&output.file_name),
    );

    let (memory_kills, timeouts) = resource_kills(&details.chunks);
    if memory_kills + timeouts > 0 {
        eprintln!(
            "   {} chunk(s) hit the memory ceiling, {} timed out",
            red(&memory_kills.to_string()),
            red(&timeouts.to_string()),
        );
    }
    if let Some(SplitMode::Degraded { reason }) = &details.split_mode {
        eprintln!("   {}", cyan(&format!("split degraded, converted as one chunk: {reason}")));
    }
    if details.output_diagnostics.placeholder {
        eprintln!("   {}", red("text extraction failed; the output is a diagnostic placeholder"));
    }
    eprintln!(
        "   {}",
        dim(&format!(
            "{} ({:.2} MB) with {}",
            details.input_diagnostics.filename,
            details.input_diagnostics.size_mb,
            details.output_diagnostics.converter_version
        )),
    );
}

fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ProcessingConfig> {
    let mut builder = ProcessingConfig::builder()
        .converter(cli.converter.clone())
        .chunk_size(cli.chunk_size_mb.saturating_mul(MIB))
        .chunking_threshold(cli.chunking_threshold_mb.saturating_mul(MIB))
        .line_split_threshold(cli.line_split_threshold_mb.saturating_mul(MIB))
        .memory_limit_mb(cli.memory_limit_mb)
        .timeout_secs(cli.timeout)
        .success_rate_threshold(cli.min_success_ratio)
        .fallback_on_single_file_failure(cli.fallback_on_failure);

    if let Some(ref dir) = cli.data_dir {
        builder = builder.data_dir(dir.clone());
    }
    if let Some(ref dir) = cli.output_dir {
        builder = builder.output_dir(dir.clone());
    }
    if let Some(ref dir) = cli.work_dir {
        builder = builder.work_root(dir.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
