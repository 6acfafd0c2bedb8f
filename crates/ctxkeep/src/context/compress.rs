//! Lossy single-item compression used as the optimizer's last resort.
//!
//! Steps are applied in order, returning as soon as the text fits:
//! whitespace collapse, filler-word removal, then hard truncation with a
//! marker. Only the boundary item of an eviction pass is ever compressed.

use std::sync::Arc;

use regex::Regex;

use crate::tokens::TokenMeasure;

/// Appended to text shortened by hard truncation.
pub const COMPRESSED_MARKER: &str = "[...compressed...]";

/// Words removed during the filler pass.
pub const DEFAULT_FILLER_WORDS: &[&str] = &[
    "very",
    "really",
    "quite",
    "rather",
    "somewhat",
    "actually",
    "basically",
];

/// Below this budget compression gives up.
pub const DEFAULT_MIN_USEFUL_TOKENS: usize = 50;

pub struct Compressor {
    measure: Arc<dyn TokenMeasure>,
    filler: Option<Regex>,
    min_useful_tokens: usize,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("filler", &self.filler.as_ref().map(Regex::as_str))
            .field("min_useful_tokens", &self.min_useful_tokens)
            .finish()
    }
}

impl Compressor {
    pub fn new(measure: Arc<dyn TokenMeasure>) -> Self {
        Self {
            measure,
            filler: filler_regex(DEFAULT_FILLER_WORDS),
            min_useful_tokens: DEFAULT_MIN_USEFUL_TOKENS,
        }
    }

    /// Replace the filler vocabulary. An empty list disables the pass.
    pub fn with_filler_words<S: AsRef<str>>(mut self, words: &[S]) -> Self {
        self.filler = filler_regex(words);
        self
    }

    pub fn with_min_useful_tokens(mut self, tokens: usize) -> Self {
        self.min_useful_tokens = tokens;
        self
    }

    /// Shrink `content` to at most `max_tokens`, or `None` if that budget is
    /// too small to be worth filling.
    pub fn compress(&self, content: &str, max_tokens: usize) -> Option<String> {
        if max_tokens < self.min_useful_tokens {
            return None;
        }
        if self.fits(content, max_tokens) {
            return Some(content.to_string());
        }

        let collapsed = collapse_whitespace(content);
        if self.fits(&collapsed, max_tokens) {
            return Some(collapsed);
        }

        let defilled = match &self.filler {
            Some(re) => collapse_whitespace(&re.replace_all(&collapsed, "")),
            None => collapsed,
        };
        if self.fits(&defilled, max_tokens) {
            return Some(defilled);
        }

        self.truncate_with_marker(&defilled, max_tokens)
    }

    fn fits(&self, text: &str, max_tokens: usize) -> bool {
        self.measure.measure(text) <= max_tokens
    }

    /// Longest character prefix such that `prefix + marker` fits.
    fn truncate_with_marker(&self, text: &str, max_tokens: usize) -> Option<String> {
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        let candidate = |n: usize| -> Option<String> {
            let prefix = text.get(..boundaries[n])?.trim_end();
            Some(format!("{prefix} {COMPRESSED_MARKER}"))
        };

        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        let mut best: Option<usize> = None;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if candidate(mid).is_some_and(|c| self.fits(&c, max_tokens)) {
                best = Some(mid);
                lo = mid + 1;
            } else if mid == 0 {
                break;
            } else {
                hi = mid - 1;
            }
        }

        let n = best.filter(|&n| n > 0)?;
        let result = candidate(n)?;
        (result.chars().count() < text.chars().count()).then_some(result)
    }
}

fn filler_regex<S: AsRef<str>>(words: &[S]) -> Option<Regex> {
    if words.is_empty() {
        return None;
    }
    let alternation = words
        .iter()
        .map(|w| regex::escape(w.as_ref()))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).ok()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
