//! URL block list
//!
//! Patterns use `*` as an any-substring wildcard and match anywhere in the
//! URL, case-insensitively.

use regex::Regex;
use tracing::{debug, warn};

/// Compile a wildcard pattern into a regular expression
pub fn wildcard_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?i){body}"))
}

/// Set of blocked URL patterns, in insertion order
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    rules: Vec<(String, Regex)>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole rule set
    pub fn set_rules<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.clear();
        for pattern in patterns {
            self.add(pattern);
        }
    }

    /// Add a pattern; adding an existing pattern is a no-op
    pub fn add(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if self.contains(&pattern) {
            return;
        }

        match wildcard_to_regex(&pattern) {
            Ok(regex) => {
                debug!("Blocking URL pattern: {}", pattern);
                self.rules.push((pattern, regex));
            }
            Err(e) => warn!("Ignoring unusable block pattern {:?}: {}", pattern, e),
        }
    }

    /// Remove a pattern; removing an unknown pattern is a no-op
    pub fn remove(&mut self, pattern: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|(existing, _)| existing != pattern);
        before != self.rules.len()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.rules.iter().any(|(existing, _)| existing == pattern)
    }

    /// Whether any pattern matches the URL
    pub fn matches(&self, url: &str) -> bool {
        self.rules.iter().any(|(_, regex)| regex.is_match(url))
    }

    pub fn patterns(&self) -> Vec<String> {
        self.rules.iter().map(|(pattern, _)| pattern.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
