//! Chunking: split oversized HTML into independently convertible fragments
//! and merge the per-fragment converter outputs back together.
//!
//! ## Two split paths
//!
//! * **Structural**: parse the document and cut between the top-level
//!   children of `<body>`, so every fragment is a well-formed document.
//! * **Line-oriented**: for inputs above `line_split_threshold` a full DOM
//!   would cost several times the file size in memory, so lines are streamed
//!   and wrapped in a minimal document shell without parsing.
//!
//! Fragment files never exceed `max_chunk_size` (shell included), with one
//! escape valve: a single element that no boundary marker can subdivide is
//! emitted on its own and flagged [`Fragment::oversized`].

use crate::config::{output_extension, FormatFamily};
use crate::error::DocConvError;
use crate::output::SplitMode;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Node, Selector};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

static HEAD: Lazy<Selector> = Lazy::new(|| Selector::parse("head").unwrap());
static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());

/// Boundary markers tried, in order, to subdivide an oversized element.
const BOUNDARY_MARKERS: &[&str] = &["</p>", "</li>", "</ul>", "</ol>", "</div>", "</section>", "</table>", "\n\n"];

/// Extensions treated as structured markup.
const MARKUP_EXTENSIONS: &[&str] = &["html", "htm", "xhtml"];

/// One fragment written to the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub path: PathBuf,
    pub size: u64,
    /// Larger than `max_chunk_size` because it could not be subdivided.
    pub oversized: bool,
}

/// Fragments plus the path that produced them.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub fragments: Vec<Fragment>,
    pub mode: SplitMode,
}

/// Whether an input should use the chunked strategy.
///
/// Only markup at or above `threshold` bytes is chunked.
pub fn should_chunk(size: u64, extension: &str, threshold: u64) -> bool {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    MARKUP_EXTENSIONS.contains(&ext.as_str()) && size >= threshold
}

/// Whether an extension is structured markup the text fallback can read.
pub fn is_markup(extension: &str) -> bool {
    MARKUP_EXTENSIONS.contains(&extension.trim_start_matches('.').to_ascii_lowercase().as_str())
}

/// Splits and merges fragments inside one scoped workspace.
#[derive(Debug, Clone)]
pub struct ChunkingEngine {
    line_split_threshold: u64,
}

impl ChunkingEngine {
    pub fn new(line_split_threshold: u64) -> Self {
        Self {
            line_split_threshold,
        }
    }

    /// Split `input` into fragments of at most `max_chunk_size` bytes.
    ///
    /// Blocking; call from `spawn_blocking`. Never fails: if splitting goes
    /// wrong the original file comes back as a single fragment with
    /// [`SplitMode::Degraded`].
    pub fn split(&self, input: &Path, work_dir: &Path, max_chunk_size: u64) -> SplitOutcome {
        info!(
            "Splitting large HTML file: {} (target chunk size: {:.1}MB)",
            input.display(),
            max_chunk_size as f64 / (1024.0 * 1024.0)
        );
        let stem = file_stem(input);
        let max = usize::try_from(max_chunk_size).unwrap_or(usize::MAX);

        let size = match std::fs::metadata(input) {
            Ok(m) => m.len(),
            Err(e) => return degraded(input, format!("cannot stat input: {e}")),
        };

        let result = if size > self.line_split_threshold {
            split_by_lines(input, work_dir, &stem, max).map(|f| (f, SplitMode::LineOriented))
        } else {
            split_structural(input, work_dir, &stem, max).map(|f| (f, SplitMode::Structural))
        };

        match result {
            Ok((fragments, _)) if fragments.is_empty() => degraded(input, "document has no content to split".into()),
            Ok((fragments, mode)) => {
                info!("Split HTML into {} chunks ({:?})", fragments.len(), mode);
                SplitOutcome { fragments, mode }
            }
            Err(e) => {
                error!("Failed to split HTML file: {e}");
                degraded(input, e.to_string())
            }
        }
    }

    /// Concatenate fragment outputs in order with a format-appropriate separator.
    ///
    /// Blocking. If concatenation fails, returns the first fragment output
    /// that exists instead of failing.
    pub fn merge(
        &self,
        outputs: &[PathBuf],
        format: &str,
        work_dir: &Path,
        original_stem: &str,
    ) -> Result<PathBuf, DocConvError> {
        let merged = work_dir.join(format!("{original_stem}_merged.{}", output_extension(format)));
        let separator = FormatFamily::of(format).merge_separator();

        match concatenate(outputs, &merged, &separator) {
            Ok(written) => {
                info!("Merged {written} chunks into: {}", merged.display());
                Ok(merged)
            }
            Err(e) => {
                error!("Failed to merge chunks: {e}");
                outputs
                    .iter()
                    .find(|p| p.exists())
                    .cloned()
                    .ok_or_else(|| DocConvError::Internal(format!("No successful chunks to merge: {e}")))
            }
        }
    }
}

fn degraded(input: &Path, reason: String) -> SplitOutcome {
    warn!("Chunking degraded, using original file as single chunk: {reason}");
    let size = std::fs::metadata(input).map(|m| m.len()).unwrap_or(0);
    SplitOutcome {
        fragments: vec![Fragment {
            path: input.to_path_buf(),
            size,
            oversized: false,
        }],
        mode: SplitMode::Degraded { reason },
    }
}

fn concatenate(outputs: &[PathBuf], merged: &Path, separator: &str) -> io::Result<usize> {
    let mut writer = BufWriter::new(File::create(merged)?);
    let mut written = 0;
    for path in outputs {
        if !path.exists() {
            warn!("Chunk file not found: {}", path.display());
            continue;
        }
        if written > 0 {
            writer.write_all(separator.as_bytes())?;
        }
        io::copy(&mut File::open(path)?, &mut writer)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

// ── Document shells ──────────────────────────────────────────────────────

/// Text before and after a fragment's body content.
struct Shell {
    prefix: String,
    suffix: String,
}

impl Shell {
    fn new(head: &str) -> Self {
        Self {
            prefix: format!("<!DOCTYPE html>\n<html>\n{head}\n<body>\n"),
            suffix: "\n</body>\n</html>\n".to_string(),
        }
    }

    fn minimal(stem: &str) -> Self {
        Self::new(&format!(
            "<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>",
            escape_text(stem)
        ))
    }

    fn overhead(&self) -> usize {
        self.prefix.len() + self.suffix.len()
    }
}

/// Writes numbered fragment files. The first fragment may carry the
/// original `<head>`; the rest get a synthesized minimal one.
struct FragmentWriter<'a> {
    work_dir: &'a Path,
    stem: &'a str,
    kind: &'static str,
    first: Shell,
    rest: Shell,
    max: usize,
    fragments: Vec<Fragment>,
}

impl<'a> FragmentWriter<'a> {
    fn new(work_dir: &'a Path, stem: &'a str, kind: &'static str, head: Option<&str>, max: usize) -> Self {
        let rest = Shell::minimal(stem);
        // An original head that eats more than half the budget is not worth propagating.
        let first = match head {
            Some(h) if Shell::new(h).overhead() <= max / 2 => Shell::new(h),
            _ => Shell::minimal(stem),
        };
        Self {
            work_dir,
            stem,
            kind,
            first,
            rest,
            max,
            fragments: Vec::new(),
        }
    }

    fn shell(&self) -> &Shell {
        if self.fragments.is_empty() {
            &self.first
        } else {
            &self.rest
        }
    }

    /// Content bytes available to the next fragment.
    fn budget(&self) -> usize {
        self.max.saturating_sub(self.shell().overhead())
    }

    /// Budget that holds whichever shell a sub-split piece ends up in.
    fn sub_split_budget(&self) -> usize {
        self.max
            .saturating_sub(self.first.overhead().max(self.rest.overhead()))
    }

    fn write(&mut self, body: &str) -> io::Result<()> {
        let path = self
            .work_dir
            .join(format!("{}_{}_{:03}.html", self.stem, self.kind, self.fragments.len()));
        let shell = self.shell();
        let mut w = BufWriter::new(File::create(&path)?);
        w.write_all(shell.prefix.as_bytes())?;
        w.write_all(body.as_bytes())?;
        w.write_all(shell.suffix.as_bytes())?;
        w.flush()?;

        let size = (shell.overhead() + body.len()) as u64;
        let oversized = size > self.max as u64;
        if oversized {
            warn!("Chunk {} is {size} bytes, above the {} byte target", path.display(), self.max);
        }
        self.fragments.push(Fragment { path, size, oversized });
        Ok(())
    }
}

// ── Line-oriented split ──────────────────────────────────────────────────

fn split_by_lines(input: &Path, work_dir: &Path, stem: &str, max: usize) -> io::Result<Vec<Fragment>> {
    info!("Using line-oriented HTML chunking for very large file");
    let mut writer = FragmentWriter::new(work_dir, stem, "textchunk", None, max);
    let mut reader = BufReader::new(File::open(input)?);
    let mut current = String::new();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        if !current.is_empty() && current.len() + line.len() > writer.budget() {
            writer.write(&current)?;
            current.clear();
        }
        current.push_str(&line);
    }
    if !current.is_empty() {
        writer.write(&current)?;
    }
    Ok(writer.fragments)
}

// ── Structural split ─────────────────────────────────────────────────────

fn split_structural(input: &Path, work_dir: &Path, stem: &str, max: usize) -> io::Result<Vec<Fragment>> {
    let raw = std::fs::read(input)?;
    let content = String::from_utf8_lossy(&raw);
    let document = Html::parse_document(&content);

    let head = document.select(&HEAD).next().map(|h| h.html());
    let container = document
        .select(&BODY)
        .next()
        .unwrap_or_else(|| document.root_element());
    // Whitespace-only text and comments are dropped.
    let pieces: Vec<String> = container
        .children()
        .filter_map(|node| match ElementRef::wrap(node) {
            Some(el) => Some(el.html()),
            None => match node.value() {
                Node::Text(t) if !t.trim().is_empty() => Some(escape_text(t)),
                _ => None,
            },
        })
        .collect();
    drop(document);

    let mut writer = FragmentWriter::new(work_dir, stem, "chunk", head.as_deref(), max);
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;

    for piece in pieces {
        if !current.is_empty() && current_len + 1 + piece.len() > writer.budget() {
            writer.write(&current.join("\n"))?;
            current.clear();
            current_len = 0;
        }

        if current.is_empty() && piece.len() > writer.budget() {
            warn!(
                "Large element ({:.1}MB) detected, attempting sub-chunking",
                piece.len() as f64 / (1024.0 * 1024.0)
            );
            for sub in split_oversized(&piece, writer.sub_split_budget().max(1)) {
                if !sub.trim().is_empty() {
                    writer.write(&sub)?;
                }
            }
            continue;
        }

        current_len += piece.len() + usize::from(!current.is_empty());
        current.push(piece);
    }
    if !current.is_empty() {
        writer.write(&current.join("\n"))?;
    }

    info!("Split HTML into {} chunks using structured parsing", writer.fragments.len());
    Ok(writer.fragments)
}

/// Subdivide an element's markup with the first boundary markers that help,
/// greedily re-merging parts up to `budget`. Parts no marker can shrink
/// come back larger than `budget`.
pub(crate) fn split_oversized(element: &str, budget: usize) -> Vec<String> {
    let mut pieces = vec![element.to_string()];
    for marker in BOUNDARY_MARKERS {
        if pieces.iter().all(|p| p.len() <= budget) {
            break;
        }
        pieces = pieces
            .into_iter()
            .flat_map(|p| {
                if p.len() > budget {
                    regroup(p.split_inclusive(marker), budget)
                } else {
                    vec![p]
                }
            })
            .collect();
    }
    pieces
}

fn regroup<'s>(parts: impl Iterator<Item = &'s str>, budget: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for part in parts {
        if !current.is_empty() && current.len() + part.len() > budget {
            out.push(std::mem::take(&mut current));
        }
        current.push_str(part);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}
