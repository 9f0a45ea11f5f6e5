//! Supported input file types and the extension normalisation rules shared by
//! the detector, the orchestrator and the task supervisor.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Extensions accepted when nothing else is configured.
pub const DEFAULT_SUPPORTED: &[&str] = &[".csv", ".sas7bdat"];

/// Normalise a raw extension to lowercase with a single leading dot.
///
/// `"CSV"`, `".csv"` and `" .Csv "` all become `".csv"`. An empty input stays empty.
pub fn normalize_extension(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return String::new();
    }
    format!(".{}", trimmed.to_ascii_lowercase())
}

/// Normalised extension of a path, if it has one.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(normalize_extension)
        .filter(|e| !e.is_empty())
}

/// The routing-key word for a file type: `".csv"` becomes `"csv"`.
///
/// Dots inside the word would split it into several topic words, so they are
/// replaced with underscores. An empty type maps to `"unknown"`.
pub fn routing_segment(file_type: &str) -> String {
    let ext = normalize_extension(file_type);
    let word = ext.trim_start_matches('.').replace('.', "_");
    if word.is_empty() {
        "unknown".to_string()
    } else {
        word
    }
}

/// Fixed set of file types the pipeline accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedFileTypes(BTreeSet<String>);

impl SupportedFileTypes {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        )
    }

    /// Parse a comma-separated list such as `".csv,.sas7bdat"`.
    pub fn parse_list(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn contains(&self, file_type: &str) -> bool {
        self.0.contains(&normalize_extension(file_type))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for SupportedFileTypes {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPORTED.iter().copied())
    }
}

impl fmt::Display for SupportedFileTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{}", joined.join(","))
    }
}
