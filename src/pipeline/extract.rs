//! Text fallback: readable text straight from markup, no converter involved.
//!
//! This is the strategy of last resort, so it does not fail: if extraction
//! itself goes wrong a short diagnostic placeholder is written in place of
//! the text and the outcome is flagged accordingly.

use crate::config::{output_extension, FormatFamily};
use crate::error::DocConvError;
use crate::pipeline::chunking::is_markup;
use scraper::{ElementRef, Html, Node};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Elements whose text is never visible content.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Elements after which a line break is implied.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "header", "footer", "h1", "h2", "h3", "h4", "h5", "h6", "li",
    "tr", "br", "pre", "blockquote", "table", "ul", "ol", "title",
];

/// Artifact written by the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub path: PathBuf,
    /// Extraction failed; the file holds a diagnostic message instead of text.
    pub placeholder: bool,
}

/// Extracts visible text and wraps it minimally for the target format.
#[derive(Debug, Clone, Default)]
pub struct TextFallbackExtractor;

impl TextFallbackExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Write `<stem>_text.<ext>` into `work_dir`.
    ///
    /// Blocking. Only errors when even the placeholder cannot be written.
    pub fn extract(
        &self,
        input: &Path,
        format: &str,
        stem: &str,
        work_dir: &Path,
    ) -> Result<Extraction, DocConvError> {
        let family = FormatFamily::of(format);
        let path = work_dir.join(format!("{stem}_text.{}", fallback_extension(format, family)));
        info!("Extracting text from: {}", input.display());

        let (content, placeholder) = match read_text(input) {
            Ok(text) if !text.is_empty() => (wrap(&text, stem, family), false),
            Ok(_) => {
                warn!("No text content found in {}", input.display());
                (wrap(&format!("No text content found in {}", display_name(input)), stem, family), true)
            }
            Err(e) => {
                error!("Text extraction failed: {e}");
                let message = format!("Text extraction failed for {}: {e}", display_name(input));
                (wrap(&message, stem, family), true)
            }
        };

        std::fs::write(&path, content).map_err(|e| DocConvError::OutputWriteFailed {
            path: path.clone(),
            source: e,
        })?;
        info!("Text extraction completed: {}", path.display());
        Ok(Extraction { path, placeholder })
    }
}

/// HTML shells are written for non-text formats, so they get `.html`.
fn fallback_extension(format: &str, family: FormatFamily) -> String {
    match family {
        FormatFamily::Other => "html".to_string(),
        _ => output_extension(format),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_text(input: &Path) -> std::io::Result<String> {
    let raw = std::fs::read(input)?;
    let content = String::from_utf8_lossy(&raw);
    let text = if is_markup(&input.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_default()) {
        visible_text(&content)
    } else {
        content.into_owned()
    };
    Ok(clean_whitespace(&text))
}

/// Text content of a document with non-content elements skipped.
pub(crate) fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    collect_text(document.root_element(), &mut out);
    out
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(el) = ElementRef::wrap(child) {
            let name = el.value().name();
            if SKIPPED_ELEMENTS.contains(&name) {
                continue;
            }
            collect_text(el, out);
            if BLOCK_ELEMENTS.contains(&name) {
                out.push('\n');
            }
        } else if let Node::Text(text) = child.value() {
            out.push_str(text);
        }
    }
}

/// Trim every line, break on runs of two spaces, drop empty pieces.
pub(crate) fn clean_whitespace(text: &str) -> String {
    text.lines()
        .flat_map(|line| line.trim().split("  "))
        .map(str::trim)
        .filter(|phrase| !phrase.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn wrap(text: &str, stem: &str, family: FormatFamily) -> String {
    match family {
        FormatFamily::PlainText => text.to_string(),
        FormatFamily::Markdown => format!("# {stem}\n\n{text}\n"),
        FormatFamily::Html | FormatFamily::Other => format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title} - Text Extraction</title>\n</head>\n<body>\n<h1>{title}</h1>\n<pre>{body}</pre>\n</body>\n</html>\n",
            title = escape(stem),
            body = escape(text),
        ),
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAGE: &str = "<html><head><title>T</title><style>p{color:red}</style></head>\
        <body><script>var secret = 1;</script><h1>Heading</h1>\
        <p>First   paragraph.</p><p>  Second  para  </p><noscript>enable js</noscript></body></html>";

    #[test]
    fn visible_text_skips_scripts_and_styles() {
        let text = clean_whitespace(&visible_text(PAGE));
        assert!(text.contains("Heading"));
        assert!(text.contains("First"));
        assert!(text.contains("Second"));
        assert!(!text.contains("secret"));
        assert!(!text.contains("color:red"));
        assert!(!text.contains("enable js"));
    }

    #[test]
    fn whitespace_is_collapsed_per_line() {
        assert_eq!(clean_whitespace("  a  b \n\n\t c\n"), "a\nb\nc");
        assert_eq!(clean_whitespace("   \n  "), "");
    }

    #[test]
    fn markdown_gets_title_heading() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("doc.html");
        std::fs::write(&input, PAGE).unwrap();

        let out = TextFallbackExtractor::new()
            .extract(&input, "markdown", "doc", dir.path())
            .unwrap();
        assert!(!out.placeholder);
        assert_eq!(out.path.extension().unwrap(), "md");
        let body = std::fs::read_to_string(&out.path).unwrap();
        assert!(body.starts_with("# doc\n\n"));
        assert!(body.contains("Heading"));
    }

    #[test]
    fn plain_text_is_written_as_is() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("doc.html");
        std::fs::write(&input, PAGE).unwrap();

        let out = TextFallbackExtractor::new()
            .extract(&input, "plain", "doc", dir.path())
            .unwrap();
        let body = std::fs::read_to_string(&out.path).unwrap();
        assert!(body.starts_with("T\nHeading"), "got: {body}");
    }

    #[test]
    fn other_formats_get_an_escaped_html_shell() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("notes.txt");
        std::fs::write(&input, "a < b & c").unwrap();

        let out = TextFallbackExtractor::new()
            .extract(&input, "docx", "notes", dir.path())
            .unwrap();
        assert_eq!(out.path.extension().unwrap(), "html");
        let body = std::fs::read_to_string(&out.path).unwrap();
        assert!(body.contains("<pre>a &lt; b &amp; c</pre>"));
    }

    #[test]
    fn unreadable_input_yields_placeholder() {
        let dir = TempDir::new().unwrap();
        let out = TextFallbackExtractor::new()
            .extract(&dir.path().join("missing.html"), "markdown", "missing", dir.path())
            .unwrap();
        assert!(out.placeholder);
        let body = std::fs::read_to_string(&out.path).unwrap();
        assert!(body.contains("Text extraction failed for missing.html"));
    }

    #[test]
    fn unwritable_work_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = TextFallbackExtractor::new()
            .extract(Path::new("x.html"), "plain", "x", &dir.path().join("nope"))
            .unwrap_err();
        assert!(matches!(err, DocConvError::OutputWriteFailed { .. }));
    }
}
