//! File-name exclusion patterns

use std::path::Path;

use glob::{MatchOptions, Pattern};

use crate::error::ArgumentError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Case-insensitive wildcard patterns matched against file names
///
/// Only `*` (any run of characters) and `?` (exactly one character) are
/// wildcards; every other character, brackets included, matches literally.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    patterns: Vec<Pattern>,
}

impl ExclusionFilter {
    /// Compile the given patterns; blank entries are skipped
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ArgumentError> {
        let patterns = patterns
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .map(compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if any pattern matches the file name
    pub fn matches_name(&self, file_name: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(file_name, MATCH_OPTIONS))
    }

    /// True if the final component of `path` is excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        match path.file_name() {
            Some(name) => self.matches_name(&name.to_string_lossy()),
            None => false,
        }
    }
}

fn compile(raw: &str) -> Result<Pattern, ArgumentError> {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '*' | '?' => escaped.push(c),
            _ => escaped.push_str(&Pattern::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    Pattern::new(&escaped).map_err(|e| ArgumentError::Invalid {
        name: "exclusion_filters",
        reason: format!("'{}': {}", raw, e),
    })
}
