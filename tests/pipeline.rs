//! Integration tests for the conversion pipeline.
//!
//! A fake converter written as a POSIX shell script stands in for pandoc:
//! it answers `--version`, then copies its input to the `-o` path (or fails,
//! or hangs, depending on the variant). Sizes are scaled down from the
//! production defaults with the same ratios (80/50/10 becomes KiB instead
//! of MiB) so the suite stays fast.

#![cfg(unix)]

use edgequake_docconv::{
    convert, convert_from_bytes, convert_to_file, inspect_converter, AdvancedOptions, ChunkError,
    ConversionProgressCallback, ConversionRequest, DocConvError, ProcessingConfig, ProcessingConfigBuilder,
    ResourceKind, SplitMode, Strategy,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const KIB: u64 = 1024;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write an executable fake converter. `body` runs after `--version` handling
/// with `$input` and `$out` parsed from the argv.
fn fake_converter(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!(
        r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "fakedoc 1.0.0"
  echo "second line ignored"
  exit 0
fi
out=""
input=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -t) shift 2 ;;
    -*) shift ;;
    *) input="$1"; shift ;;
  esac
done
echo "call" >> "{calls}"
{body}
"#,
        calls = dir.join(format!("{name}.calls")).display(),
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn identity_converter(dir: &Path) -> PathBuf {
    fake_converter(dir, "identity.sh", r#"cat "$input" > "$out""#)
}

fn failing_converter(dir: &Path) -> PathBuf {
    fake_converter(
        dir,
        "failing.sh",
        r#"echo "Error parsing document at line 1" >&2
exit 64"#,
    )
}

fn call_count(converter: &Path) -> usize {
    let calls = PathBuf::from(format!("{}.calls", converter.display()));
    std::fs::read_to_string(calls)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn base_config(dir: &Path, converter: &Path) -> ProcessingConfigBuilder {
    ProcessingConfig::builder()
        .converter(converter.display().to_string())
        .output_dir(dir.join("out"))
        .work_root(dir.join("work"))
        .poll_interval(Duration::from_millis(50))
        .grace_period(Duration::from_millis(200))
        .chunking_threshold(50 * KIB)
        .chunk_size(10 * KIB)
        .timeout_secs(30)
}

/// An HTML document of roughly `target` bytes made of numbered paragraphs.
fn html_document(target: usize) -> String {
    let mut body = String::new();
    let mut i = 0;
    while body.len() < target {
        body.push_str(&format!(
            "<p>Paragraph {i:05}: the quick brown fox jumps over the lazy dog.</p>\n"
        ));
        i += 1;
    }
    format!("<!DOCTYPE html>\n<html><head><title>Export</title></head><body>\n{body}</body></html>\n")
}

fn assert_paragraphs_in_order(text: &str, count: usize) {
    let mut cursor = 0;
    for i in 0..count {
        let needle = format!("Paragraph {i:05}:");
        let found = text[cursor..]
            .find(&needle)
            .unwrap_or_else(|| panic!("{needle} missing or out of order"));
        cursor += found + needle.len();
    }
}

fn paragraph_count(html: &str) -> usize {
    html.matches("<p>Paragraph ").count()
}

fn workspace_is_clean(dir: &Path) -> bool {
    std::fs::read_dir(dir.join("work"))
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

// ── Strategy selection ───────────────────────────────────────────────────────

#[tokio::test]
async fn small_plain_text_uses_single_file() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = ProcessingConfig::builder()
        .converter(converter.display().to_string())
        .output_dir(dir.path().join("out"))
        .work_root(dir.path().join("work"))
        .build()
        .unwrap();

    let text = "All work and no play makes Jack a dull boy.\n".repeat(500 * 1024 / 44);
    let output = convert_from_bytes("notes.txt", text.clone().into_bytes(), "markdown", &config)
        .await
        .unwrap();

    let details = &output.conversion_details;
    assert_eq!(details.strategy, Strategy::SingleFile);
    assert_eq!(details.chunk_count, 1);
    assert_eq!(details.success_ratio, 1.0);
    assert_eq!(call_count(&converter), 1);
    assert!(output.file_path.starts_with(dir.path().join("out")));
    assert!(output.file_name.ends_with(".md"));
    assert_eq!(std::fs::read_to_string(&output.file_path).unwrap(), text);
    assert_eq!(details.output_diagnostics.converter_version, "fakedoc 1.0.0");
    assert_eq!(details.input_diagnostics.extension, "txt");
    assert!(workspace_is_clean(dir.path()));
}

#[tokio::test]
async fn markup_below_threshold_is_single_file() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = base_config(dir.path(), &converter).build().unwrap();

    let html = html_document(20 * KIB as usize);
    let output = convert_from_bytes("page.html", html.into_bytes(), "html", &config)
        .await
        .unwrap();
    assert_eq!(output.conversion_details.strategy, Strategy::SingleFile);
    assert_eq!(call_count(&converter), 1);
}

#[tokio::test]
async fn large_markup_is_chunked_and_merged_in_order() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = base_config(dir.path(), &converter).build().unwrap();

    let html = html_document(80 * KIB as usize);
    let paragraphs = paragraph_count(&html);
    let output = convert_from_bytes("export.html", html.into_bytes(), "markdown", &config)
        .await
        .unwrap();

    let details = &output.conversion_details;
    assert_eq!(details.strategy, Strategy::Chunked);
    assert!(details.chunk_count >= 8, "only {} chunks", details.chunk_count);
    assert_eq!(details.split_mode, Some(SplitMode::Structural));
    assert_eq!(details.success_ratio, 1.0);
    assert_eq!(details.chunks.len(), details.chunk_count);
    assert!(details.chunks.iter().all(|c| c.success && c.error.is_none()));
    assert_eq!(call_count(&converter), details.chunk_count);

    let merged = std::fs::read_to_string(&output.file_path).unwrap();
    assert_eq!(merged.matches("\n\n---\n\n").count(), details.chunk_count - 1);
    assert_paragraphs_in_order(&merged, paragraphs);
    assert!(workspace_is_clean(dir.path()));
}

#[tokio::test]
async fn very_large_markup_uses_line_oriented_split() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = base_config(dir.path(), &converter)
        .line_split_threshold(60 * KIB)
        .build()
        .unwrap();

    let html = html_document(80 * KIB as usize);
    let paragraphs = paragraph_count(&html);
    let output = convert_from_bytes("huge.html", html.into_bytes(), "plain", &config)
        .await
        .unwrap();

    let details = &output.conversion_details;
    assert_eq!(details.strategy, Strategy::Chunked);
    assert_eq!(details.split_mode, Some(SplitMode::LineOriented));
    assert!(details
        .chunks
        .iter()
        .all(|c| c.source.file_name().unwrap().to_string_lossy().contains("textchunk")));
    let merged = std::fs::read_to_string(&output.file_path).unwrap();
    assert_eq!(
        merged.matches(&format!("\n\n{}\n\n", "=".repeat(50))).count(),
        details.chunk_count - 1
    );
    assert_paragraphs_in_order(&merged, paragraphs);
}

#[tokio::test]
async fn unsplittable_markup_reports_degraded_split() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = base_config(dir.path(), &converter).build().unwrap();

    // Above the threshold, but the body holds nothing but a comment.
    let html = format!("<html><body><!-- {} --></body></html>", "x".repeat(60 * KIB as usize));
    let output = convert_from_bytes("hollow.html", html.into_bytes(), "html", &config)
        .await
        .unwrap();

    let details = &output.conversion_details;
    assert_eq!(details.strategy, Strategy::Chunked);
    assert_eq!(details.chunk_count, 1);
    assert!(
        matches!(details.split_mode, Some(SplitMode::Degraded { .. })),
        "got {:?}",
        details.split_mode
    );
    assert_eq!(call_count(&converter), 1);

    let json = serde_json::to_value(&output).unwrap();
    assert_eq!(json["conversionDetails"]["splitMode"]["mode"], "degraded");
}

// ── Degradation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn all_chunks_failing_degrades_to_text_extraction() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let converter = failing_converter(dir.path());
    let config = base_config(dir.path(), &converter).build().unwrap();

    let html = html_document(80 * KIB as usize);
    let output = convert_from_bytes("export.html", html.into_bytes(), "markdown", &config)
        .await
        .unwrap();

    let details = &output.conversion_details;
    assert_eq!(details.strategy, Strategy::TextExtraction);
    assert_eq!(details.success_ratio, 0.0);
    assert!(details.chunk_count >= 8);
    assert!(details.chunks.iter().all(|c| matches!(
        c.error,
        Some(ChunkError::ConverterFailed { exit_code: 64, .. })
    )));
    assert!(!details.output_diagnostics.placeholder);

    let text = std::fs::read_to_string(&output.file_path).unwrap();
    assert!(text.starts_with("# export\n\n"));
    assert!(text.contains("Paragraph 00000:"));
    assert!(!text.contains("<p>"));
}

#[tokio::test]
async fn partial_chunk_failure_above_minimum_still_merges() {
    let dir = TempDir::new().unwrap();
    let converter = fake_converter(
        dir.path(),
        "poisoned.sh",
        r#"if grep -q POISON "$input"; then
  echo "cannot parse" >&2
  exit 64
fi
cat "$input" > "$out""#,
    );
    let config = base_config(dir.path(), &converter).build().unwrap();

    let html = html_document(80 * KIB as usize).replacen("Paragraph 00000:", "POISON Paragraph 00000:", 1);
    let output = convert_from_bytes("export.html", html.into_bytes(), "markdown", &config)
        .await
        .unwrap();

    let details = &output.conversion_details;
    assert_eq!(details.strategy, Strategy::Chunked);
    assert!(details.success_ratio < 1.0 && details.success_ratio >= 0.5);
    assert!(!details.chunks[0].success);
    assert!(details.chunks[1..].iter().all(|c| c.success));

    let merged = std::fs::read_to_string(&output.file_path).unwrap();
    assert!(!merged.contains("POISON"));
    assert!(merged.contains("Paragraph 00999:"));
}

#[tokio::test]
async fn ratio_below_minimum_reports_achieved_ratio() {
    let dir = TempDir::new().unwrap();
    let converter = fake_converter(
        dir.path(),
        "poisoned.sh",
        r#"if grep -q POISON "$input"; then exit 64; fi
cat "$input" > "$out""#,
    );
    // Requiring every chunk makes one failure enough to degrade.
    let config = base_config(dir.path(), &converter)
        .success_rate_threshold(1.0)
        .build()
        .unwrap();

    let html = html_document(80 * KIB as usize).replacen("Paragraph 00000:", "POISON Paragraph 00000:", 1);
    let output = convert_from_bytes("export.html", html.into_bytes(), "plain", &config)
        .await
        .unwrap();

    let details = &output.conversion_details;
    assert_eq!(details.strategy, Strategy::TextExtraction);
    assert!(details.success_ratio > 0.0 && details.success_ratio < 1.0);
    assert_eq!(details.output_diagnostics.extension, "txt");
}

#[tokio::test]
async fn single_file_failure_is_an_error_with_hint() {
    let dir = TempDir::new().unwrap();
    let converter = failing_converter(dir.path());
    let config = base_config(dir.path(), &converter).build().unwrap();

    let err = convert_from_bytes("page.html", b"<p>hello</p>".to_vec(), "markdown", &config)
        .await
        .unwrap_err();
    match err {
        DocConvError::ConverterFailure {
            exit_code,
            ref stderr,
            ref hint,
            ..
        } => {
            assert_eq!(exit_code, 64);
            assert!(stderr.contains("Error parsing document"));
            assert!(hint.contains("malformed"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(workspace_is_clean(dir.path()));
}

#[tokio::test]
async fn single_file_failure_can_fall_back_to_text() {
    let dir = TempDir::new().unwrap();
    let converter = failing_converter(dir.path());
    let config = base_config(dir.path(), &converter)
        .fallback_on_single_file_failure(true)
        .build()
        .unwrap();

    let output = convert_from_bytes(
        "page.html",
        b"<html><body><p>hello there</p><script>x()</script></body></html>".to_vec(),
        "plain",
        &config,
    )
    .await
    .unwrap();
    assert_eq!(output.conversion_details.strategy, Strategy::TextExtraction);
    assert_eq!(output.conversion_details.success_ratio, 0.0);
    assert_eq!(std::fs::read_to_string(&output.file_path).unwrap(), "hello there");
}

// ── Resource limits ──────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
#[tokio::test]
async fn memory_ceiling_terminates_single_file_run() {
    init_logging();
    let dir = TempDir::new().unwrap();
    // Holding ~40 MB in a shell variable pushes the shell's own RSS past 8 MB.
    let converter = fake_converter(
        dir.path(),
        "hog.sh",
        r#"hog=$(head -c 40000000 /dev/zero | tr '\0' 'a')
sleep 30
cat "$input" > "$out""#,
    );
    let config = base_config(dir.path(), &converter)
        .memory_limit_mb(8)
        .build()
        .unwrap();

    let started = Instant::now();
    let err = convert_from_bytes("page.html", b"<p>x</p>".to_vec(), "markdown", &config)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(
        matches!(
            err,
            DocConvError::ResourceExceeded {
                kind: ResourceKind::Memory,
                ..
            }
        ),
        "expected memory kill, got {err}"
    );
    assert!(err.to_string().contains("--memory-limit-mb"), "got: {err}");
}

// ── Input validation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn unsafe_options_are_rejected_before_any_spawn() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());

    for bad in ["--toc; rm -rf /", "`id`", "--template=../../secret", "-o /tmp/elsewhere.md"] {
        let err = AdvancedOptions::parse(bad).unwrap_err();
        assert!(matches!(err, DocConvError::InvalidInput { .. }), "{bad}");
    }
    for bad in ["--out=/tmp/elsewhere.md", "-so", "/etc/passwd"] {
        assert!(AdvancedOptions::parse(bad).is_err(), "{bad}");
    }
    let smuggled = r#"["-o","/tmp/evil.md","--x=$(id)","../../etc/passwd"]"#;
    assert!(serde_json::from_str::<AdvancedOptions>(smuggled).is_err());

    let config = base_config(dir.path(), &converter).build().unwrap();
    let err = convert_from_bytes("empty.html", Vec::new(), "markdown", &config)
        .await
        .unwrap_err();
    assert!(matches!(err, DocConvError::InvalidInput { .. }));
    assert_eq!(call_count(&converter), 0);
}

#[tokio::test]
async fn oversized_input_is_rejected() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = base_config(dir.path(), &converter)
        .max_input_size(1024)
        .build()
        .unwrap();

    let err = convert_from_bytes("big.html", vec![b'a'; 2048], "markdown", &config)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("too large"));
    assert_eq!(call_count(&converter), 0);
}

#[tokio::test]
async fn advanced_options_reach_the_converter() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    // Record the raw argv in a wrapper: the shared preamble consumes it.
    let recorder = dir.path().join("argv.txt");
    let wrapper = dir.path().join("wrapper.sh");
    std::fs::write(
        &wrapper,
        format!(
            "#!/bin/sh\n[ \"$1\" != \"--version\" ] && echo \"$@\" > \"{}\"\nexec \"{}\" \"$@\"\n",
            recorder.display(),
            converter.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();
    let config = base_config(dir.path(), &wrapper).build().unwrap();

    let request = ConversionRequest::from_bytes("page.html", b"<p>x</p>".to_vec(), "markdown")
        .advanced_options(AdvancedOptions::parse("--standalone --wrap=none").unwrap())
        .features(edgequake_docconv::FeatureToggles::parse("smart,-raw_html").unwrap())
        .self_contained(true);
    convert(request, &config).await.unwrap();

    let argv = std::fs::read_to_string(recorder).unwrap();
    assert!(argv.starts_with("--standalone --wrap=none "), "{argv}");
    assert!(argv.contains(" -t markdown+smart-raw_html -o "));
    assert!(argv.trim_end().ends_with("--self-contained"));
}

// ── Entry points ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn convert_to_file_writes_caller_path_atomically() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = base_config(dir.path(), &converter).build().unwrap();

    let input = dir.path().join("input.html");
    std::fs::write(&input, "<p>on disk</p>").unwrap();
    let target = dir.path().join("nested/result.md");

    let output = convert_to_file(ConversionRequest::from_path(&input, "markdown"), &target, &config)
        .await
        .unwrap();
    assert_eq!(output.file_path, target);
    assert_eq!(output.file_name, "result.md");
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "<p>on disk</p>");
    assert!(!dir.path().join("nested/result.md.tmp").exists());
}

#[test]
fn convert_sync_runs_without_a_runtime() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = base_config(dir.path(), &converter).build().unwrap();

    let output = edgequake_docconv::convert_sync(
        ConversionRequest::from_bytes("a.txt", b"sync".to_vec(), "plain"),
        &config,
    )
    .unwrap();
    assert_eq!(output.conversion_details.strategy, Strategy::SingleFile);
    assert!(output.file_name.ends_with(".txt"));
}

#[tokio::test]
async fn inspect_converter_reports_first_version_line() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = base_config(dir.path(), &converter).build().unwrap();

    let info = inspect_converter(&config).await.unwrap();
    assert_eq!(info.version, "fakedoc 1.0.0");
    assert_eq!(call_count(&converter), 0);

    let missing = base_config(dir.path(), &dir.path().join("nope")).build().unwrap();
    assert!(matches!(
        inspect_converter(&missing).await,
        Err(DocConvError::ConverterMissingResources { .. })
    ));
}

#[tokio::test]
async fn concurrent_conversions_do_not_share_state() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let config = base_config(dir.path(), &converter).build().unwrap();

    let (a, b) = tokio::join!(
        convert_from_bytes("same.txt", b"first".to_vec(), "plain", &config),
        convert_from_bytes("same.txt", b"second".to_vec(), "plain", &config),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.file_path, b.file_path);
    assert_eq!(std::fs::read_to_string(&a.file_path).unwrap(), "first");
    assert_eq!(std::fs::read_to_string(&b.file_path).unwrap(), "second");
    assert!(workspace_is_clean(dir.path()));
}

// ── Progress events ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    total: AtomicUsize,
    started: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    succeeded_at_end: AtomicUsize,
}

impl ConversionProgressCallback for Recorder {
    fn on_conversion_start(&self, total_chunks: usize) {
        self.total.store(total_chunks, Ordering::SeqCst);
    }
    fn on_chunk_start(&self, _chunk: usize, _total: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn on_chunk_complete(&self, _chunk: usize, _total: usize, output_bytes: u64) {
        assert!(output_bytes > 0);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_chunk_error(&self, _chunk: usize, _total: usize, _error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_conversion_complete(&self, _total: usize, success_count: usize) {
        self.succeeded_at_end.store(success_count, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_callback_sees_every_chunk() {
    let dir = TempDir::new().unwrap();
    let converter = identity_converter(dir.path());
    let recorder = Arc::new(Recorder::default());
    let config = base_config(dir.path(), &converter)
        .progress_callback(recorder.clone())
        .build()
        .unwrap();

    let output = convert_from_bytes(
        "export.html",
        html_document(80 * KIB as usize).into_bytes(),
        "markdown",
        &config,
    )
    .await
    .unwrap();

    let chunks = output.conversion_details.chunk_count;
    assert_eq!(recorder.total.load(Ordering::SeqCst), chunks);
    assert_eq!(recorder.started.load(Ordering::SeqCst), chunks);
    assert_eq!(recorder.completed.load(Ordering::SeqCst), chunks);
    assert_eq!(recorder.failed.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.succeeded_at_end.load(Ordering::SeqCst), chunks);
}
