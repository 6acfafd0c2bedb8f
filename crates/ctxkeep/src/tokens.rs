//! Token measurement: the size metric every budget in this crate is expressed in.
//!
//! All budget arithmetic goes through the [`TokenMeasure`] trait so the exact
//! tokenizer can be swapped for the cheap [`CharEstimator`] (about one token
//! per four characters) without touching any other logic. [`TokenCounter`]
//! wraps an optional exact [`Encoder`] and falls back to the estimator when
//! the encoder fails, logging the first failure only.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

/// Default characters per token for the fallback estimator.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Token limit assumed for models missing from [`MODEL_LIMITS`].
pub const DEFAULT_MODEL_LIMIT: usize = 4096;

/// Known model context windows, in tokens.
pub const MODEL_LIMITS: &[(&str, usize)] = &[
    ("claude-3-sonnet-20241022", 200_000),
    ("claude-3-haiku-20240307", 200_000),
    ("claude-3-opus-20240229", 200_000),
    ("gpt-4", 8192),
    ("gpt-4-32k", 32_768),
    ("gpt-3.5-turbo", 4096),
    ("gpt-3.5-turbo-16k", 16_384),
];

/// Measures text in token-units.
///
/// `measure` must be deterministic for identical text and must not decrease
/// when text is extended; truncation relies on that to binary-search.
pub trait TokenMeasure: Send + Sync {
    /// Size of `text` in token-units.
    fn measure(&self, text: &str) -> usize;

    /// Cut `text` so that it measures at most `limit`, preferring to end at a
    /// sentence or word boundary.
    fn truncate_to_limit(&self, text: &str, limit: usize) -> String {
        if self.measure(text) <= limit {
            return text.to_string();
        }

        // Byte offset of every char boundary, including the end of the string.
        let offsets: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        let (mut lo, mut hi) = (0usize, offsets.len() - 1);
        while lo < hi {
            let mid = (lo + hi).div_ceil(2);
            let prefix = text.get(..offsets[mid]).unwrap_or_default();
            if self.measure(prefix) <= limit {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        let cut = text.get(..offsets[lo]).unwrap_or_default();
        trim_to_boundary(cut).to_string()
    }
}

/// Back a cut off to the last sentence end (if it keeps at least 80% of the
/// text) or the last space (if it keeps at least 90%).
fn trim_to_boundary(text: &str) -> &str {
    let len = text.len() as f64;
    for end in [".", "!", "?", "\n\n"] {
        if let Some(pos) = text.rfind(end)
            && pos as f64 > len * 0.8
        {
            return text.get(..pos + end.len()).unwrap_or(text);
        }
    }
    if let Some(pos) = text.rfind(' ')
        && pos as f64 > len * 0.9
    {
        return text.get(..pos).unwrap_or(text);
    }
    text
}

// ── Estimator ─────────────────────────────────────────────────────

/// Character-ratio token estimator.
#[derive(Debug, Clone, Copy)]
pub struct CharEstimator {
    chars_per_token: f64,
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl CharEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the chars-per-token ratio. Non-positive ratios are ignored.
    pub fn with_chars_per_token(mut self, ratio: f64) -> Self {
        if ratio > 0.0 {
            self.chars_per_token = ratio;
        }
        self
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl TokenMeasure for CharEstimator {
    fn measure(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count();
        ((chars as f64 / self.chars_per_token) as usize).max(1)
    }
}

// ── Exact counter with fallback ───────────────────────────────────

/// An exact tokenizer backend (e.g. a BPE vocabulary).
pub trait Encoder: Send + Sync {
    /// Number of tokens `text` encodes to.
    fn encode_len(&self, text: &str) -> Result<usize, String>;
}

/// Model-aware token counter.
///
/// Uses the configured [`Encoder`] when one is present and falls back to a
/// [`CharEstimator`] when it is absent or fails. The first encoder failure is
/// logged at `warn`; later ones are silent.
pub struct TokenCounter {
    model: String,
    encoder: Option<Box<dyn Encoder>>,
    fallback: CharEstimator,
    fallback_warned: AtomicBool,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("model", &self.model)
            .field("has_encoder", &self.encoder.is_some())
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl TokenCounter {
    /// Create a counter for `model` without an exact encoder.
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        debug!(model = %model, "token counter using character estimator");
        Self {
            model,
            encoder: None,
            fallback: CharEstimator::default(),
            fallback_warned: AtomicBool::new(false),
        }
    }

    /// Attach an exact encoder.
    pub fn with_encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.encoder = Some(Box::new(encoder));
        self
    }

    /// Replace the fallback estimator.
    pub fn with_fallback(mut self, fallback: CharEstimator) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Context window of `model`, or of this counter's model when `None`.
    pub fn model_limit(&self, model: Option<&str>) -> usize {
        let model = model.unwrap_or(&self.model);
        MODEL_LIMITS
            .iter()
            .find(|(name, _)| *name == model)
            .map_or(DEFAULT_MODEL_LIMIT, |(_, limit)| *limit)
    }

    /// Whether `text` fits the model window minus `buffer` tokens.
    pub fn check_within_limit(&self, text: &str, buffer: usize) -> bool {
        self.measure(text) <= self.model_limit(None).saturating_sub(buffer)
    }

    /// Split `text` into chunks of at most `max_tokens`, breaking at sentence
    /// ends and carrying up to `overlap` tokens of the previous chunk's tail
    /// into the next one. Sentences longer than a chunk are split by words.
    pub fn split_by_tokens(&self, text: &str, max_tokens: usize, overlap: usize) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        if self.measure(text) <= max_tokens {
            return vec![text.to_string()];
        }

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();

        for sentence in split_sentences(text) {
            if self.measure(sentence) > max_tokens {
                flush_chunk(&mut chunks, &mut current);
                for word in sentence.split_whitespace() {
                    let candidate = format!("{current}{word} ");
                    if self.measure(candidate.trim()) > max_tokens {
                        flush_chunk(&mut chunks, &mut current);
                        current = format!("{word} ");
                    } else {
                        current = candidate;
                    }
                }
                continue;
            }

            let candidate = format!("{current}{sentence} ");
            if self.measure(candidate.trim()) <= max_tokens {
                current = candidate;
                continue;
            }

            let tail = if overlap > 0 {
                self.overlap_tail(&current, overlap)
            } else {
                String::new()
            };
            flush_chunk(&mut chunks, &mut current);
            let with_tail = format!("{tail} {sentence} ");
            current = if !tail.is_empty() && self.measure(with_tail.trim()) <= max_tokens {
                with_tail.trim_start().to_string()
            } else {
                format!("{sentence} ")
            };
        }

        flush_chunk(&mut chunks, &mut current);
        debug!(chunks = chunks.len(), "split text by tokens");
        chunks
    }

    /// Trailing words of `text` that fit in `overlap_tokens`.
    fn overlap_tail(&self, text: &str, overlap_tokens: usize) -> String {
        let mut words: Vec<&str> = Vec::new();
        let mut used = 0;
        for word in text.split_whitespace().rev() {
            let cost = self.measure(&format!("{word} "));
            if used + cost > overlap_tokens {
                break;
            }
            words.push(word);
            used += cost;
        }
        words.reverse();
        words.join(" ")
    }
}

impl TokenMeasure for TokenCounter {
    fn measure(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        if let Some(encoder) = &self.encoder {
            match encoder.encode_len(text) {
                Ok(n) => return n,
                Err(e) => {
                    if !self.fallback_warned.swap(true, Ordering::Relaxed) {
                        warn!(model = %self.model, "tokenizer failed, using estimator: {e}");
                    }
                }
            }
        }
        self.fallback.measure(text)
    }
}

fn flush_chunk(chunks: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
    current.clear();
}

/// Split on whitespace that follows `.`, `!` or `?`.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut prev_terminal = false;
    let mut in_gap = false;

    for (i, c) in text.char_indices() {
        if in_gap {
            if c.is_whitespace() {
                continue;
            }
            in_gap = false;
            start = i;
        }
        if prev_terminal && c.is_whitespace() {
            if let Some(s) = text.get(start..i)
                && !s.is_empty()
            {
                sentences.push(s);
            }
            in_gap = true;
            prev_terminal = false;
            continue;
        }
        prev_terminal = matches!(c, '.' | '!' | '?');
    }

    if !in_gap
        && let Some(s) = text.get(start..)
        && !s.trim().is_empty()
    {
        sentences.push(s.trim_end());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WordEncoder;

    impl Encoder for WordEncoder {
        fn encode_len(&self, text: &str) -> Result<usize, String> {
            Ok(text.split_whitespace().count())
        }
    }

    struct BrokenEncoder;

    impl Encoder for BrokenEncoder {
        fn encode_len(&self, _text: &str) -> Result<usize, String> {
            Err("vocabulary not loaded".into())
        }
    }

    #[test]
    fn estimator_counts_four_chars_per_token() {
        let est = CharEstimator::new();
        assert_eq!(est.measure(""), 0);
        assert_eq!(est.measure("ab"), 1);
        assert_eq!(est.measure(&"a".repeat(400)), 100);
    }

    #[test]
    fn estimator_counts_chars_not_bytes() {
        let est = CharEstimator::new();
        assert_eq!(est.measure(&"é".repeat(40)), 10);
    }

    #[test]
    fn custom_ratio_ignored_when_not_positive() {
        let est = CharEstimator::new().with_chars_per_token(0.0);
        assert_eq!(est.chars_per_token(), DEFAULT_CHARS_PER_TOKEN);
    }

    #[test]
    fn truncate_fits_limit() {
        let est = CharEstimator::new();
        let text = "word ".repeat(200);
        let cut = est.truncate_to_limit(&text, 50);
        assert!(est.measure(&cut) <= 50);
        assert!(cut.len() < text.len());
    }

    #[test]
    fn truncate_returns_short_text_unchanged() {
        let est = CharEstimator::new();
        assert_eq!(est.truncate_to_limit("short", 10), "short");
    }

    #[test]
    fn truncate_prefers_sentence_boundary() {
        let est = CharEstimator::new();
        let text = format!("{}. {}", "a".repeat(90), "b".repeat(100));
        let cut = est.truncate_to_limit(&text, 24);
        assert!(cut.ends_with('.'));
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        let est = CharEstimator::new();
        let text = "日本語のテキスト".repeat(20);
        let cut = est.truncate_to_limit(&text, 5);
        assert!(est.measure(&cut) <= 5);
    }

    #[test]
    fn counter_uses_encoder_when_available() {
        let counter = TokenCounter::new("gpt-4").with_encoder(WordEncoder);
        assert_eq!(counter.measure("one two three"), 3);
    }

    #[test]
    fn counter_falls_back_on_encoder_failure() {
        let counter = TokenCounter::new("gpt-4").with_encoder(BrokenEncoder);
        assert_eq!(counter.measure(&"x".repeat(40)), 10);
        // Second failure takes the same path without panicking.
        assert_eq!(counter.measure(&"x".repeat(8)), 2);
    }

    #[test]
    fn model_limits_lookup() {
        let counter = TokenCounter::new("gpt-4-32k");
        assert_eq!(counter.model_limit(None), 32_768);
        assert_eq!(counter.model_limit(Some("claude-3-opus-20240229")), 200_000);
        assert_eq!(counter.model_limit(Some("mystery")), DEFAULT_MODEL_LIMIT);
    }

    #[test]
    fn within_limit_subtracts_buffer() {
        let counter = TokenCounter::new("gpt-3.5-turbo");
        let text = "a".repeat(4 * 4000);
        assert!(counter.check_within_limit(&text, 0));
        assert!(!counter.check_within_limit(&text, 500));
    }

    #[test]
    fn split_sentences_on_terminal_punctuation() {
        let parts = split_sentences("First one. Second!  Third? tail");
        assert_eq!(parts, vec!["First one.", "Second!", "Third?", "tail"]);
    }

    #[test]
    fn split_by_tokens_respects_chunk_size() {
        let counter = TokenCounter::new("gpt-4");
        let text = "This is a sentence of moderate length. ".repeat(40);
        let chunks = counter.split_by_tokens(&text, 50, 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(counter.measure(chunk) <= 50, "chunk too large: {chunk}");
        }
    }

    #[test]
    fn split_by_tokens_handles_oversized_sentence() {
        let counter = TokenCounter::new("gpt-4");
        let text = "word ".repeat(300);
        let chunks = counter.split_by_tokens(&text, 20, 0);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| counter.measure(c) <= 20));
    }

    #[test]
    fn split_small_text_is_single_chunk() {
        let counter = TokenCounter::new("gpt-4");
        assert_eq!(counter.split_by_tokens("tiny.", 100, 10), vec!["tiny."]);
        assert!(counter.split_by_tokens("", 100, 10).is_empty());
    }
}
