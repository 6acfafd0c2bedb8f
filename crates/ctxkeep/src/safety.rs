//! Content-safety checks applied before text enters a store.

use regex::RegexSet;
use tracing::warn;

/// Patterns that mark content as an injection attempt.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    r"<script",
    r"javascript:",
    r"data:text/html",
    r"eval\(",
    r"exec\(",
    r"__import__",
    r"subprocess",
    r"os\.system",
];

/// Decides whether a piece of text may be stored.
pub trait ContentSafety: Send + Sync {
    fn is_safe(&self, text: &str) -> bool;
}

/// Rejects text matching any of a set of case-insensitive patterns.
#[derive(Debug, Clone)]
pub struct PatternSafetyChecker {
    patterns: RegexSet,
}

impl Default for PatternSafetyChecker {
    fn default() -> Self {
        // The built-in patterns are static and known to compile.
        let patterns = RegexSet::new(DANGEROUS_PATTERNS.iter().map(|p| format!("(?i){p}")))
            .unwrap_or_else(|_| RegexSet::empty());
        Self { patterns }
    }
}

impl PatternSafetyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a checker from custom patterns (matched case-insensitively).
    pub fn with_patterns<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = RegexSet::new(
            patterns
                .into_iter()
                .map(|p| format!("(?i){}", p.as_ref())),
        )?;
        Ok(Self { patterns })
    }
}

impl ContentSafety for PatternSafetyChecker {
    fn is_safe(&self, text: &str) -> bool {
        let matched: Vec<usize> = self.patterns.matches(text).into_iter().collect();
        if let Some(&first) = matched.first() {
            warn!(
                pattern = %self.patterns.patterns()[first],
                "potentially dangerous pattern detected"
            );
            return false;
        }
        true
    }
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ContentSafety for AllowAll {
    fn is_safe(&self, _text: &str) -> bool {
        true
    }
}
