//! Validation of caller-supplied converter options and format features.
//!
//! Advanced options are appended verbatim to the converter's argv, so they
//! are screened before any process is spawned: shell metacharacters,
//! path traversal, and flags that would override the input/output wiring
//! the pipeline controls are rejected with [`DocConvError::InvalidInput`].
//!
//! The converter's option parser accepts unambiguous long-flag prefixes
//! (`--out` for `--output`) and grouped short flags (`-so`), and treats any
//! bare token as another input file. The screen follows the same rules, so
//! option values must be attached (`--toc-depth=2`, `-Vtitle=x`).
//!
//! Deserialized values go through the same checks as parsed ones.

use crate::error::DocConvError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static FEATURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static FORMAT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '<', '>', '(', ')', '\n', '\r'];

/// Long flags whose effect the pipeline owns. `--defaults` is included
/// because a defaults file can set any of the others.
const CONTROLLED_LONG_FLAGS: &[&str] = &["--output", "--to", "--write", "--data-dir", "--defaults"];

/// Short forms of the controlled flags.
const CONTROLLED_SHORT_FLAGS: &[char] = &['o', 't', 'w', 'd'];

/// Short flags that take a value; the rest of a group is that value.
const VALUE_SHORT_FLAGS: &[char] = &['f', 'r', 'V', 'M', 'c', 'H', 'B', 'A', 'T', 'L', 'F', 'D'];

/// Ordered extra converter options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct AdvancedOptions(Vec<String>);

impl AdvancedOptions {
    /// Parse a whitespace-separated option string.
    pub fn parse(raw: &str) -> Result<Self, DocConvError> {
        if raw.contains(['\n', '\r']) {
            return Err(DocConvError::invalid_input(
                "advanced options must not contain line breaks",
            ));
        }
        Self::from_list(raw.split_whitespace().map(str::to_string).collect())
    }

    /// Validate an already tokenised option list.
    pub fn from_list(tokens: Vec<String>) -> Result<Self, DocConvError> {
        let tokens: Vec<String> = tokens
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        for token in &tokens {
            validate_option(token)?;
        }
        Ok(Self(tokens))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<String>> for AdvancedOptions {
    type Error = DocConvError;

    fn try_from(tokens: Vec<String>) -> Result<Self, Self::Error> {
        Self::from_list(tokens)
    }
}

fn validate_option(token: &str) -> Result<(), DocConvError> {
    if let Some(c) = token.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(DocConvError::invalid_input(format!(
            "advanced option '{token}' contains disallowed character {c:?}"
        )));
    }
    if token.contains("../") || token.contains("..\\") {
        return Err(DocConvError::invalid_input(format!(
            "advanced option '{token}' contains a path traversal sequence"
        )));
    }
    if !token.starts_with('-') || token == "-" || token == "--" {
        return Err(DocConvError::invalid_input(format!(
            "advanced option '{token}' is not a flag; attach values as --flag=value"
        )));
    }
    let overridden = if let Some(long) = token.strip_prefix("--") {
        let name = long.split_once('=').map(|(n, _)| n).unwrap_or(long);
        CONTROLLED_LONG_FLAGS
            .iter()
            .find(|c| c[2..].starts_with(name))
            .map(|c| c.to_string())
    } else {
        controlled_short_flag(&token[1..]).map(|c| format!("-{c}"))
    };
    if let Some(flag) = overridden {
        return Err(DocConvError::invalid_input(format!(
            "advanced option '{token}' overrides {flag}, which is controlled by the pipeline"
        )));
    }
    Ok(())
}

/// First controlled flag in a short-flag group such as `-so`.
fn controlled_short_flag(group: &str) -> Option<char> {
    for c in group.chars() {
        if CONTROLLED_SHORT_FLAGS.contains(&c) {
            return Some(c);
        }
        if VALUE_SHORT_FLAGS.contains(&c) {
            return None;
        }
    }
    None
}

/// Ordered format feature toggles, normalised to an explicit sign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct FeatureToggles(Vec<String>);

impl TryFrom<Vec<String>> for FeatureToggles {
    type Error = DocConvError;

    fn try_from(tokens: Vec<String>) -> Result<Self, Self::Error> {
        Self::from_list(tokens)
    }
}

impl FeatureToggles {
    /// Parse a whitespace- or comma-separated toggle string.
    pub fn parse(raw: &str) -> Result<Self, DocConvError> {
        Self::from_list(
            raw.split(|c: char| c.is_whitespace() || c == ',')
                .map(str::to_string)
                .collect(),
        )
    }

    /// Validate a toggle list; unsigned tokens default to enabled.
    pub fn from_list(tokens: Vec<String>) -> Result<Self, DocConvError> {
        let mut out = Vec::with_capacity(tokens.len());
        for token in tokens.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !FEATURE_RE.is_match(token) {
                return Err(DocConvError::invalid_input(format!(
                    "feature '{token}' must match [+-]name"
                )));
            }
            if token.starts_with(['+', '-']) {
                out.push(token.to_string());
            } else {
                out.push(format!("+{token}"));
            }
        }
        Ok(Self(out))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Writer name with toggles appended, e.g. `markdown+smart-raw_html`.
    pub fn complete_format(&self, base: &str) -> String {
        let mut s = base.to_string();
        for t in &self.0 {
            s.push_str(t);
        }
        s
    }
}

/// Check a bare writer name such as `markdown` or `html5`.
///
/// Toggles belong in [`FeatureToggles`], not in the format name.
pub fn validate_format(format: &str) -> Result<(), DocConvError> {
    if FORMAT_RE.is_match(format) {
        Ok(())
    } else {
        Err(DocConvError::invalid_input(format!(
            "output format '{format}' must be a plain writer name (toggles go in features)"
        )))
    }
}
