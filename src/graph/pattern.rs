//! Session-relative glob patterns for declared outputs.
//!
//! Supported syntax: `*` (any run of characters within one path component),
//! `?` (one character within a component) and `**` (any number of
//! components). Paths always use `/` separators.

use std::fmt;

use regex::Regex;

use crate::error::GraphError;

/// Compiled output glob.
#[derive(Clone)]
pub struct OutputPattern {
    glob: String,
    regex: Regex,
}

impl OutputPattern {
    pub fn new(glob: &str) -> Result<Self, GraphError> {
        if glob.is_empty() || glob.starts_with('/') {
            return Err(GraphError::InvalidPattern {
                pattern: glob.to_string(),
                reason: "pattern must be a non-empty session-relative path".to_string(),
            });
        }
        let regex = Regex::new(&glob_to_regex(glob)).map_err(|e| GraphError::InvalidPattern {
            pattern: glob.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    /// True when the glob contains no wildcard.
    pub fn is_literal(&self) -> bool {
        !self.glob.contains(['*', '?'])
    }

    pub fn matches(&self, relative_path: &str) -> bool {
        self.regex.is_match(relative_path)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                // `**/` also matches zero components
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

impl PartialEq for OutputPattern {
    fn eq(&self, other: &Self) -> bool {
        self.glob == other.glob
    }
}

impl Eq for OutputPattern {}

impl fmt::Debug for OutputPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputPattern({:?})", self.glob)
    }
}

impl fmt::Display for OutputPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.glob)
    }
}
