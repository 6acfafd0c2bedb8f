//! Window assembly from named, weighted sections.
//!
//! Each section name maps to a fixed priority. Required sections always go
//! in; when they alone overflow the budget they share it in proportion to
//! their priorities and every optional section is dropped. Otherwise optional
//! sections fill the remaining room highest priority first, and the first one
//! that doesn't fit may be truncated into whatever room is left.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::item::{ContextItem, by_priority_then_recency};
use crate::tokens::TokenMeasure;

/// Appended to sections cut down to fit.
pub const TRUNCATED_MARKER: &str = "\n[...truncated...]";

/// Priority of each well-known section name.
pub const SECTION_PRIORITIES: &[(&str, u8)] = &[
    ("system", 10),
    ("instructions", 9),
    ("tools", 8),
    ("recent_conversation", 7),
    ("relevant_memory", 6),
    ("context_data", 5),
    ("background", 4),
    ("examples", 3),
    ("metadata", 2),
    ("debug", 1),
];

pub const DEFAULT_SECTION_PRIORITY: u8 = 5;

pub fn section_priority(name: &str) -> u8 {
    SECTION_PRIORITIES
        .iter()
        .find(|(n, _)| *n == name)
        .map_or(DEFAULT_SECTION_PRIORITY, |(_, p)| *p)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub max_tokens: usize,
    /// Held back for the model's response.
    pub response_reserve: usize,
    /// An optional section is only truncated into more room than this.
    pub min_truncation_room: usize,
    /// Sections cannot be shrunk below this.
    pub min_section_tokens: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            response_reserve: 4000,
            min_truncation_room: 100,
            min_section_tokens: 50,
        }
    }
}

impl WindowConfig {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_response_reserve(mut self, tokens: usize) -> Self {
        self.response_reserve = tokens;
        self
    }
}

/// A named block of text offered to the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub content: String,
}

impl Section {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// One conversation message for [`WindowBuilder::conversation_window`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Summary of a section that made it into a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncludedSection {
    pub name: String,
    pub priority: u8,
    pub tokens: usize,
    pub required: bool,
    pub truncated: bool,
}

/// Result of [`WindowBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuiltWindow {
    pub text: String,
    /// In render order.
    pub sections: Vec<IncludedSection>,
    pub dropped: Vec<String>,
    /// Measured size of `text`.
    pub tokens: usize,
    pub available: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    pub total_tokens: usize,
    pub max_tokens: usize,
    pub remaining_tokens: usize,
    pub response_reserve: usize,
    pub utilization_percent: f64,
    pub over_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionAnalysis {
    pub name: String,
    pub tokens: usize,
    pub priority: u8,
    pub chars: usize,
    pub required: bool,
    /// Share of the total tokens across all analyzed sections.
    pub share_percent: f64,
}

/// Working copy of a section during a build.
struct Candidate {
    name: String,
    content: String,
    priority: u8,
    tokens: usize,
    required: bool,
    truncated: bool,
}

pub struct WindowBuilder {
    config: WindowConfig,
    required: Vec<String>,
    measure: Arc<dyn TokenMeasure>,
}

impl std::fmt::Debug for WindowBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowBuilder")
            .field("config", &self.config)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl WindowBuilder {
    pub fn new(measure: Arc<dyn TokenMeasure>) -> Self {
        Self {
            config: WindowConfig::default(),
            required: vec!["system".into(), "instructions".into()],
            measure,
        }
    }

    pub fn with_config(mut self, config: WindowConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the set of section names that must always be included.
    pub fn with_required<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Budget for sections once the response reserve is held back.
    pub fn available(&self) -> usize {
        self.config
            .max_tokens
            .saturating_sub(self.config.response_reserve)
    }

    fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|r| r == name)
    }

    pub fn build(&self, sections: &[Section]) -> BuiltWindow {
        let available = self.available();
        let (required, mut optional): (Vec<Candidate>, Vec<Candidate>) = sections
            .iter()
            .map(|s| Candidate {
                name: s.name.clone(),
                tokens: self.measure.measure(&s.content),
                content: s.content.clone(),
                priority: section_priority(&s.name),
                required: self.is_required(&s.name),
                truncated: false,
            })
            .partition(|c| c.required);

        let mut dropped = Vec::new();
        let mut included = Vec::new();
        let required_tokens: usize = required.iter().map(|c| c.tokens).sum();

        if required_tokens > available {
            warn!(
                required_tokens,
                available, "required sections exceed the window, sharing by priority"
            );
            let total_priority: usize = required.iter().map(|c| usize::from(c.priority)).sum();
            for mut candidate in required {
                let quota = available * usize::from(candidate.priority) / total_priority.max(1);
                if candidate.tokens <= quota {
                    included.push(candidate);
                } else if let Some(shrunk) = self.shrink(&candidate.content, quota) {
                    candidate.tokens = self.measure.measure(&shrunk);
                    candidate.content = shrunk;
                    candidate.truncated = true;
                    included.push(candidate);
                } else {
                    debug!(section = %candidate.name, quota, "required section dropped");
                    dropped.push(candidate.name);
                }
            }
            dropped.extend(optional.into_iter().map(|c| c.name));
        } else {
            let mut used = required_tokens;
            included.extend(required);

            optional.sort_by(|a, b| b.priority.cmp(&a.priority));
            let mut remaining = optional.into_iter();
            for mut candidate in remaining.by_ref() {
                if used + candidate.tokens <= available {
                    used += candidate.tokens;
                    included.push(candidate);
                    continue;
                }
                let room = available - used;
                if room > self.config.min_truncation_room
                    && let Some(shrunk) = self.shrink(&candidate.content, room)
                {
                    candidate.tokens = self.measure.measure(&shrunk);
                    candidate.content = shrunk;
                    candidate.truncated = true;
                    included.push(candidate);
                } else {
                    dropped.push(candidate.name);
                }
                break;
            }
            dropped.extend(remaining.map(|c| c.name));
        }

        included.sort_by(|a, b| b.priority.cmp(&a.priority));
        let text = included
            .iter()
            .map(|c| format!("=== {} ===\n{}", c.name.to_uppercase(), c.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let tokens = self.measure.measure(&text);
        info!(tokens, available, dropped = dropped.len(), "built context window");

        BuiltWindow {
            text,
            sections: included
                .into_iter()
                .map(|c| IncludedSection {
                    name: c.name,
                    priority: c.priority,
                    tokens: c.tokens,
                    required: c.required,
                    truncated: c.truncated,
                })
                .collect(),
            dropped,
            tokens,
            available,
        }
    }

    /// Cut `content` to at most `quota` tokens including the truncation
    /// marker, or `None` if the quota is below the useful minimum.
    fn shrink(&self, content: &str, quota: usize) -> Option<String> {
        if quota < self.config.min_section_tokens {
            return None;
        }
        let mut body = self.measure.truncate_to_limit(content, quota);
        loop {
            let candidate = if body.len() < content.len() {
                format!("{body}{TRUNCATED_MARKER}")
            } else {
                body.clone()
            };
            if self.measure.measure(&candidate) <= quota {
                return Some(candidate);
            }
            if body.is_empty() {
                return None;
            }
            let keep = body.chars().count() * 9 / 10;
            body = body.chars().take(keep).collect();
        }
    }

    /// Longest most-important-first prefix of `items` that fits the window
    /// after `reserved` extra tokens. Returns the prefix and its token total.
    pub fn estimate_fit(&self, items: &[ContextItem], reserved: usize) -> (Vec<ContextItem>, usize) {
        let budget = self.available().saturating_sub(reserved);
        let mut sorted: Vec<&ContextItem> = items.iter().collect();
        sorted.sort_by(|a, b| by_priority_then_recency(a, b));

        let mut selected = Vec::new();
        let mut used = 0;
        for item in sorted {
            if used + item.token_count > budget {
                break;
            }
            used += item.token_count;
            selected.push(item.clone());
        }
        (selected, used)
    }

    /// Window of a system prompt plus the last `max_history` messages.
    pub fn conversation_window(
        &self,
        messages: &[ChatTurn],
        system_prompt: &str,
        max_history: usize,
    ) -> BuiltWindow {
        let mut sections = Vec::new();
        if !system_prompt.is_empty() {
            sections.push(Section::new("system", system_prompt));
        }
        if !messages.is_empty() {
            let start = messages.len().saturating_sub(max_history);
            let history = messages[start..]
                .iter()
                .map(|m| format!("{}: {}", capitalize(&m.role), m.content))
                .collect::<Vec<_>>()
                .join("\n\n");
            sections.push(Section::new("recent_conversation", history));
        }

        let builder = WindowBuilder {
            config: self.config.clone(),
            required: vec!["system".into()],
            measure: Arc::clone(&self.measure),
        };
        builder.build(&sections)
    }

    pub fn usage(&self, content: &str) -> WindowUsage {
        let total = self.measure.measure(content);
        let max = self.config.max_tokens;
        WindowUsage {
            total_tokens: total,
            max_tokens: max,
            remaining_tokens: max.saturating_sub(total),
            response_reserve: self.config.response_reserve,
            utilization_percent: if max == 0 {
                0.0
            } else {
                total as f64 / max as f64 * 100.0
            },
            over_limit: total > max,
        }
    }

    pub fn analyze_sections(&self, sections: &[Section]) -> Vec<SectionAnalysis> {
        let measured: Vec<(&Section, usize)> = sections
            .iter()
            .map(|s| (s, self.measure.measure(&s.content)))
            .collect();
        let total: usize = measured.iter().map(|(_, t)| t).sum();

        measured
            .into_iter()
            .map(|(s, tokens)| SectionAnalysis {
                name: s.name.clone(),
                tokens,
                priority: section_priority(&s.name),
                chars: s.content.chars().count(),
                required: self.is_required(&s.name),
                share_percent: if total == 0 {
                    0.0
                } else {
                    tokens as f64 / total as f64 * 100.0
                },
            })
            .collect()
    }

    /// Human-readable hints about oversized or misplaced sections.
    pub fn suggest_optimizations(&self, sections: &[Section]) -> Vec<String> {
        let analysis = self.analyze_sections(sections);
        let total: usize = analysis.iter().map(|a| a.tokens).sum();
        let max = self.config.max_tokens;
        let mut suggestions = Vec::new();

        if total > max {
            suggestions.push(format!("Total tokens ({total}) exceed limit ({max})"));
        }
        for a in &analysis {
            if a.share_percent > 40.0 {
                suggestions.push(format!(
                    "Section '{}' is very large ({:.1}% of total)",
                    a.name, a.share_percent
                ));
            }
            if a.tokens as f64 > max as f64 * 0.3 {
                suggestions.push(format!(
                    "Consider truncating section '{}' ({} tokens)",
                    a.name, a.tokens
                ));
            }
        }

        let low: Vec<&str> = analysis
            .iter()
            .filter(|a| a.priority <= 3 && a.share_percent > 10.0)
            .map(|a| a.name.as_str())
            .collect();
        if !low.is_empty() {
            suggestions.push(format!(
                "Low priority sections using significant space: {}",
                low.join(", ")
            ));
        }
        suggestions
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::CharEstimator;
    use chrono::{Duration, Utc};

    fn builder(max_tokens: usize, reserve: usize) -> WindowBuilder {
        WindowBuilder::new(Arc::new(CharEstimator::new())).with_config(
            WindowConfig::default()
                .with_max_tokens(max_tokens)
                .with_response_reserve(reserve),
        )
    }

    /// Prose of roughly `tokens` estimator tokens.
    fn prose(tokens: usize) -> String {
        "The quick brown fox jumps over the lazy dog. "
            .repeat(tokens * 4 / 45 + 1)
            .chars()
            .take(tokens * 4)
            .collect()
    }

    #[test]
    fn priority_table() {
        assert_eq!(section_priority("system"), 10);
        assert_eq!(section_priority("debug"), 1);
        assert_eq!(section_priority("whatever"), 5);
    }

    #[test]
    fn available_saturates() {
        assert_eq!(builder(3000, 4000).available(), 0);
        assert_eq!(builder(100_000, 4000).available(), 96_000);
    }

    #[test]
    fn everything_fits() {
        let window = builder(10_000, 4000).build(&[
            Section::new("debug", "trace info"),
            Section::new("system", "be helpful"),
            Section::new("tools", "grep, read"),
        ]);
        assert_eq!(
            window.text,
            "=== SYSTEM ===\nbe helpful\n\n=== TOOLS ===\ngrep, read\n\n=== DEBUG ===\ntrace info"
        );
        assert!(window.dropped.is_empty());
        assert_eq!(window.available, 6000);
        assert!(window.sections.iter().all(|s| !s.truncated));
    }

    #[test]
    fn required_overflow_with_equal_priorities_splits_evenly() {
        let window = builder(5000, 4000)
            .with_required(["alpha", "beta"])
            .build(&[
                Section::new("alpha", prose(900)),
                Section::new("beta", prose(900)),
                Section::new("tools", "optional"),
            ]);
        assert_eq!(window.dropped, vec!["tools"]);
        assert_eq!(window.sections.len(), 2);
        for name in ["alpha", "beta"] {
            let section = window
                .sections
                .iter()
                .find(|s| s.name == name)
                .unwrap();
            assert!(section.truncated, "{name}");
            // Both quotas are 1000 / 2.
            assert!(
                section.tokens <= 500 && section.tokens >= 400,
                "{name}: {}",
                section.tokens
            );
        }
    }

    #[test]
    fn required_overflow_shares_by_priority() {
        let window = builder(5000, 4000).build(&[
            Section::new("system", prose(900)),
            Section::new("instructions", prose(900)),
            Section::new("tools", "optional"),
        ]);
        assert_eq!(window.dropped, vec!["tools"]);
        assert_eq!(window.sections.len(), 2);

        let system = &window.sections[0];
        let instructions = &window.sections[1];
        assert_eq!(system.name, "system");
        assert!(system.truncated && instructions.truncated);
        // Quotas are 1000 * 10/19 = 526 and 1000 * 9/19 = 473.
        assert!(system.tokens <= 526 && system.tokens >= 400, "{}", system.tokens);
        assert!(
            instructions.tokens <= 473 && instructions.tokens >= 350,
            "{}",
            instructions.tokens
        );
        assert!(window.text.contains("[...truncated...]"));
    }

    #[test]
    fn tiny_quota_drops_required_section() {
        let window = builder(4080, 4000)
            .with_required(["system", "debug"])
            .build(&[
                Section::new("system", prose(100)),
                Section::new("debug", prose(100)),
            ]);
        // debug quota is 80 * 1/11 = 7 tokens, below the minimum.
        assert_eq!(window.dropped, vec!["debug"]);
        assert_eq!(window.sections.len(), 1);
    }

    #[test]
    fn first_optional_miss_is_truncated_then_stop() {
        let window = builder(5000, 4000).build(&[
            Section::new("system", prose(300)),
            Section::new("tools", prose(400)),
            Section::new("relevant_memory", prose(500)),
            Section::new("debug", "small"),
        ]);
        let names: Vec<&str> = window.sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["system", "tools", "relevant_memory"]);
        assert!(window.sections[2].truncated);
        assert!(window.sections[2].tokens <= 300);
        assert_eq!(window.dropped, vec!["debug"]);
    }

    #[test]
    fn no_truncation_without_enough_room() {
        let window = builder(5000, 4000).build(&[
            Section::new("system", prose(950)),
            Section::new("tools", prose(400)),
        ]);
        assert_eq!(window.sections.len(), 1);
        assert_eq!(window.dropped, vec!["tools"]);
    }

    #[test]
    fn estimate_fit_takes_prefix() {
        let now = Utc::now();
        let est = CharEstimator::new();
        let items = vec![
            ContextItem::new(prose(300), "memory", &est).with_priority(2),
            ContextItem::new(prose(400), "memory", &est)
                .with_priority(8)
                .with_timestamp(now),
            ContextItem::new(prose(400), "memory", &est)
                .with_priority(8)
                .with_timestamp(now - Duration::hours(1)),
        ];
        let (fit, used) = builder(5000, 4000).estimate_fit(&items, 100);
        assert_eq!(fit.len(), 2);
        assert_eq!(used, 800);
        assert_eq!(fit[0].timestamp, now);
    }

    #[test]
    fn conversation_window_keeps_last_messages() {
        let messages = vec![
            ChatTurn::new("user", "first"),
            ChatTurn::new("assistant", "second"),
            ChatTurn::new("user", "third"),
        ];
        let window = builder(10_000, 4000).conversation_window(&messages, "be brief", 2);
        assert_eq!(
            window.text,
            "=== SYSTEM ===\nbe brief\n\n=== RECENT_CONVERSATION ===\nAssistant: second\n\nUser: third"
        );
        assert!(window.sections[0].required);
        assert!(!window.sections[1].required);
    }

    #[test]
    fn usage_reports_utilization() {
        let usage = builder(1000, 100).usage(&"a".repeat(2000));
        assert_eq!(usage.total_tokens, 500);
        assert_eq!(usage.remaining_tokens, 500);
        assert!((usage.utilization_percent - 50.0).abs() < 1e-9);
        assert!(!usage.over_limit);
    }

    #[test]
    fn analysis_and_suggestions() {
        let b = builder(1000, 100);
        let sections = [
            Section::new("system", "a".repeat(400)),
            Section::new("debug", "b".repeat(1600)),
        ];
        let analysis = b.analyze_sections(&sections);
        assert_eq!(analysis[0].tokens, 100);
        assert!(analysis[0].required);
        assert!((analysis[1].share_percent - 80.0).abs() < 1e-9);

        let hints = b.suggest_optimizations(&sections);
        assert!(hints.iter().any(|h| h.contains("'debug' is very large")));
        assert!(hints.iter().any(|h| h.contains("Consider truncating section 'debug'")));
        assert!(hints.iter().any(|h| h.starts_with("Low priority sections")));
        assert!(!hints.iter().any(|h| h.starts_with("Total tokens")));
    }
}
