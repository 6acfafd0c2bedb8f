//! Eviction optimizer: choose which items survive a token budget.
//!
//! Every strategy is a greedy pass over a sorted candidate list; none of them
//! claims optimality. The `compression` and `hybrid` strategies may shrink a
//! single boundary item to fill the leftover room, then stop.
//!
//! The optimizer is pure with respect to its input: it takes ownership of an
//! item collection and returns the survivors. Applying the result back onto a
//! [`ContextStore`](super::ContextStore) is the store's job.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::compress::{Compressor, DEFAULT_FILLER_WORDS, DEFAULT_MIN_USEFUL_TOKENS};
use super::item::{ContextItem, ItemType, by_priority_then_recency, total_tokens};
use super::scoring::{ScoringEngine, ScoringPolicy};
use crate::error::StoreError;
use crate::tokens::TokenMeasure;

/// Fraction of `max_tokens` used when no explicit target is given.
pub const DEFAULT_TARGET_FRACTION: f64 = 0.9;

/// Tag added to every item shrunk by compression.
pub const COMPRESSED_TAG: &str = "compressed";

// ── Strategy ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStrategy {
    PriorityBased,
    RecencyBased,
    RelevanceBased,
    Compression,
    SemanticGrouping,
    #[default]
    Hybrid,
}

impl OptimizationStrategy {
    pub const ALL: [OptimizationStrategy; 6] = [
        OptimizationStrategy::PriorityBased,
        OptimizationStrategy::RecencyBased,
        OptimizationStrategy::RelevanceBased,
        OptimizationStrategy::Compression,
        OptimizationStrategy::SemanticGrouping,
        OptimizationStrategy::Hybrid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OptimizationStrategy::PriorityBased => "priority_based",
            OptimizationStrategy::RecencyBased => "recency_based",
            OptimizationStrategy::RelevanceBased => "relevance_based",
            OptimizationStrategy::Compression => "compression",
            OptimizationStrategy::SemanticGrouping => "semantic_grouping",
            OptimizationStrategy::Hybrid => "hybrid",
        }
    }

    /// Parse a strategy name, falling back to [`Hybrid`](Self::Hybrid) with a
    /// warning when the name is unknown.
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(strategy = name, "unknown optimization strategy, using hybrid");
            OptimizationStrategy::Hybrid
        })
    }
}

impl FromStr for OptimizationStrategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| StoreError::UnknownStrategy(s.to_string()))
    }
}

impl fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Configuration ─────────────────────────────────────────────────

/// Tunables for the eviction strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Minimum composite score for `relevance_based` inclusion.
    pub relevance_threshold: f64,
    /// Non-system items older than this are dropped by `hybrid`.
    pub max_age_hours: f64,
    /// Old items at or above this priority survive the age filter.
    pub old_item_priority_floor: u8,
    /// Leftover room must exceed this before a boundary item is compressed.
    pub min_compression_room: usize,
    /// Compression refuses budgets below this.
    pub min_useful_tokens: usize,
    pub compressed_tag: String,
    pub filler_words: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.5,
            max_age_hours: 168.0,
            old_item_priority_floor: 8,
            min_compression_room: 100,
            min_useful_tokens: DEFAULT_MIN_USEFUL_TOKENS,
            compressed_tag: COMPRESSED_TAG.to_string(),
            filler_words: DEFAULT_FILLER_WORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl OptimizerConfig {
    pub fn with_relevance_threshold(mut self, threshold: f64) -> Self {
        self.relevance_threshold = threshold;
        self
    }

    pub fn with_max_age_hours(mut self, hours: f64) -> Self {
        self.max_age_hours = hours;
        self
    }

    pub fn with_min_compression_room(mut self, tokens: usize) -> Self {
        self.min_compression_room = tokens;
        self
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// Outcome of one optimization pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationMetrics {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub items_before: usize,
    pub items_after: usize,
    pub elapsed: Duration,
    /// `None` when the input was already within budget.
    pub strategy: Option<OptimizationStrategy>,
    /// `1 - after / before`, or 0 when nothing was stored.
    pub compression_ratio: f64,
}

impl OptimizationMetrics {
    fn unchanged(tokens: usize, items: usize) -> Self {
        Self {
            tokens_before: tokens,
            tokens_after: tokens,
            items_before: items,
            items_after: items,
            elapsed: Duration::ZERO,
            strategy: None,
            compression_ratio: 0.0,
        }
    }

    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }

    /// One-line summary for logs and the CLI.
    pub fn to_log_string(&self) -> String {
        let strategy = self.strategy.map_or("none", OptimizationStrategy::as_str);
        format!(
            "{strategy}: {} -> {} tokens, {} -> {} items ({:.1}% saved, {}ms)",
            self.tokens_before,
            self.tokens_after,
            self.items_before,
            self.items_after,
            self.compression_ratio * 100.0,
            self.elapsed.as_millis(),
        )
    }
}

// ── Report ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgeDistribution {
    /// At most 24 hours old.
    pub recent: usize,
    /// At most one week old.
    pub medium: usize,
    pub old: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionPotential {
    pub estimated_ratio: f64,
    pub potential_token_savings: usize,
    /// Non-system items over 200 tokens.
    pub compressible_items: usize,
}

/// Read-only analysis of an item collection against the budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub total_items: usize,
    pub total_tokens: usize,
    pub max_tokens: usize,
    pub tokens_over_limit: usize,
    pub optimization_needed: bool,
    pub suggested_strategy: Option<OptimizationStrategy>,
    pub by_type: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<u8, usize>,
    pub by_age: AgeDistribution,
    pub tokens_by_type: BTreeMap<String, usize>,
    pub compression: CompressionPotential,
}

// ── Optimizer ─────────────────────────────────────────────────────

/// Selects surviving items under a token budget.
pub struct ContextOptimizer {
    max_tokens: usize,
    config: OptimizerConfig,
    scoring: ScoringEngine,
    measure: Arc<dyn TokenMeasure>,
    compressor: Compressor,
}

impl fmt::Debug for ContextOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptimizer")
            .field("max_tokens", &self.max_tokens)
            .field("config", &self.config)
            .field("scoring", &self.scoring)
            .finish_non_exhaustive()
    }
}

impl ContextOptimizer {
    pub fn new(max_tokens: usize, measure: Arc<dyn TokenMeasure>) -> Self {
        let config = OptimizerConfig::default();
        let compressor = build_compressor(&config, &measure);
        Self {
            max_tokens,
            config,
            scoring: ScoringEngine::default(),
            measure,
            compressor,
        }
    }

    pub fn with_config(mut self, config: OptimizerConfig) -> Self {
        self.compressor = build_compressor(&config, &self.measure);
        self.config = config;
        self
    }

    pub fn with_scoring(mut self, policy: ScoringPolicy) -> Self {
        self.scoring = ScoringEngine::new(policy);
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    pub fn default_target(&self) -> usize {
        (self.max_tokens as f64 * DEFAULT_TARGET_FRACTION) as usize
    }

    /// Reduce `items` to fit `target` tokens (default: 90% of `max_tokens`).
    ///
    /// Returns the input untouched when it already fits. Otherwise the result
    /// fits the target, except that `hybrid` keeps every live system item
    /// even when those alone exceed it.
    pub fn optimize(
        &self,
        items: Vec<ContextItem>,
        target: Option<usize>,
        strategy: OptimizationStrategy,
        now: DateTime<Utc>,
    ) -> (Vec<ContextItem>, OptimizationMetrics) {
        let target = target.unwrap_or_else(|| self.default_target());
        let tokens_before = total_tokens(&items);
        let items_before = items.len();

        if tokens_before <= target {
            return (items, OptimizationMetrics::unchanged(tokens_before, items_before));
        }

        let start = Instant::now();
        let kept = match strategy {
            OptimizationStrategy::PriorityBased => self.by_priority(items, target),
            OptimizationStrategy::RecencyBased => self.by_recency(items, target),
            OptimizationStrategy::RelevanceBased => self.by_relevance(items, target, now),
            OptimizationStrategy::Compression => self.by_compression(items, target),
            OptimizationStrategy::SemanticGrouping => self.by_grouping(items, target),
            OptimizationStrategy::Hybrid => self.hybrid(items, target, now),
        };

        let tokens_after = total_tokens(&kept);
        let metrics = OptimizationMetrics {
            tokens_before,
            tokens_after,
            items_before,
            items_after: kept.len(),
            elapsed: start.elapsed(),
            strategy: Some(strategy),
            compression_ratio: if tokens_before == 0 {
                0.0
            } else {
                1.0 - tokens_after as f64 / tokens_before as f64
            },
        };
        info!(target_tokens = target, "{}", metrics.to_log_string());
        (kept, metrics)
    }

    fn by_priority(&self, mut items: Vec<ContextItem>, target: usize) -> Vec<ContextItem> {
        items.sort_by(by_priority_then_recency);
        fill_until_miss(items, target, 0).kept
    }

    fn by_recency(&self, mut items: Vec<ContextItem>, target: usize) -> Vec<ContextItem> {
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        fill_until_miss(items, target, 0).kept
    }

    /// Unlike the other fills, items that do not fit are skipped rather than
    /// ending the scan.
    fn by_relevance(
        &self,
        mut items: Vec<ContextItem>,
        target: usize,
        now: DateTime<Utc>,
    ) -> Vec<ContextItem> {
        self.scoring.score_in_place(&mut items, now);

        let mut kept = Vec::new();
        let mut used = 0;
        for item in items {
            if used >= target {
                break;
            }
            if item.relevance_score >= self.config.relevance_threshold
                && used + item.token_count <= target
            {
                used += item.token_count;
                kept.push(item);
            }
        }
        kept
    }

    fn by_compression(&self, mut items: Vec<ContextItem>, target: usize) -> Vec<ContextItem> {
        items.sort_by(by_priority_then_recency);
        let Fill {
            mut kept,
            used,
            missed,
        } = fill_until_miss(items, target, 0);

        if let Some(item) = missed
            && let Some(compressed) = self.compress_boundary(&item, target.saturating_sub(used))
        {
            kept.push(compressed);
        }
        kept
    }

    /// One representative per `(type, tags)` group.
    fn by_grouping(&self, items: Vec<ContextItem>, target: usize) -> Vec<ContextItem> {
        let mut groups: Vec<(String, Vec<ContextItem>)> = Vec::new();
        for item in items {
            let key = group_key(&item);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(item),
                None => groups.push((key, vec![item])),
            }
        }

        let mut representatives: Vec<ContextItem> = groups
            .into_iter()
            .filter_map(|(_, members)| {
                members.into_iter().max_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then_with(|| a.relevance_score.total_cmp(&b.relevance_score))
                        .then_with(|| a.timestamp.cmp(&b.timestamp))
                })
            })
            .collect();
        representatives.sort_by(|a, b| b.priority.cmp(&a.priority));

        fill_until_miss(representatives, target, 0).kept
    }

    fn hybrid(
        &self,
        items: Vec<ContextItem>,
        target: usize,
        now: DateTime<Utc>,
    ) -> Vec<ContextItem> {
        let (system, mut rest): (Vec<_>, Vec<_>) = items
            .into_iter()
            .filter(|item| self.is_active(item, now))
            .partition(|item| item.item_type == ItemType::System);

        let system_tokens = total_tokens(&system);
        if system_tokens > target {
            warn!(
                system_tokens,
                target_tokens = target,
                "system items alone exceed the optimization target"
            );
        }

        self.scoring.score_in_place(&mut rest, now);
        let Fill { kept, used, missed } = fill_until_miss(rest, target, system_tokens);

        let mut out = system;
        out.extend(kept);
        if let Some(item) = missed
            && let Some(mut compressed) =
                self.compress_boundary(&item, target.saturating_sub(used))
        {
            compressed.priority = compressed.priority.saturating_sub(1).max(1);
            compressed.relevance_score *= 0.9;
            out.push(compressed);
        }
        out
    }

    /// Not expired, and either young enough, a system item, or important
    /// enough to outlive the age limit.
    fn is_active(&self, item: &ContextItem, now: DateTime<Utc>) -> bool {
        if item.is_expired_at(now) {
            debug!(id = %item.id, "dropping expired item");
            return false;
        }
        let too_old = item.item_type != ItemType::System
            && item.priority < self.config.old_item_priority_floor
            && item.age_hours(now) > self.config.max_age_hours;
        if too_old {
            debug!(id = %item.id, "dropping stale item");
        }
        !too_old
    }

    /// Shrink `item` into `room` tokens, if the room is worth filling.
    fn compress_boundary(&self, item: &ContextItem, room: usize) -> Option<ContextItem> {
        if room <= self.config.min_compression_room {
            return None;
        }
        let content = self.compressor.compress(&item.content, room)?;
        let mut compressed = item.clone();
        compressed.content = content;
        compressed.remeasure(self.measure.as_ref());
        if compressed.token_count > room {
            return None;
        }
        compressed.add_tag(self.config.compressed_tag.clone());
        debug!(
            id = %item.id,
            from = item.token_count,
            to = compressed.token_count,
            "compressed boundary item"
        );
        Some(compressed)
    }

    // ── Analysis ──────────────────────────────────────────────────

    /// Recommend a strategy, or `None` when `items` fit within `max_tokens`.
    pub fn suggest_strategy(
        &self,
        items: &[ContextItem],
        _now: DateTime<Utc>,
    ) -> Option<OptimizationStrategy> {
        let total = total_tokens(items);
        if total <= self.max_tokens {
            return None;
        }

        let distinct_types = count_by(items, |i| i.item_type.as_str().to_string()).len();
        let top_priority_share = count_by(items, |i| i.priority)
            .into_values()
            .max()
            .unwrap_or(0);
        let spread = age_spread_hours(items);

        let strategy = if distinct_types > 3 && spread > 48.0 {
            OptimizationStrategy::Hybrid
        } else if top_priority_share as f64 > items.len() as f64 * 0.7 {
            OptimizationStrategy::PriorityBased
        } else if spread > 24.0 {
            OptimizationStrategy::RecencyBased
        } else if total as f64 > self.max_tokens as f64 * 1.5 {
            OptimizationStrategy::Compression
        } else {
            OptimizationStrategy::RelevanceBased
        };
        Some(strategy)
    }

    pub fn report(&self, items: &[ContextItem], now: DateTime<Utc>) -> OptimizationReport {
        let total = total_tokens(items);

        let mut by_age = AgeDistribution::default();
        for item in items {
            let age = item.age_hours(now);
            if age <= 24.0 {
                by_age.recent += 1;
            } else if age <= 168.0 {
                by_age.medium += 1;
            } else {
                by_age.old += 1;
            }
        }

        let mut tokens_by_type = BTreeMap::new();
        for item in items {
            *tokens_by_type
                .entry(item.item_type.as_str().to_string())
                .or_insert(0) += item.token_count;
        }

        OptimizationReport {
            total_items: items.len(),
            total_tokens: total,
            max_tokens: self.max_tokens,
            tokens_over_limit: total.saturating_sub(self.max_tokens),
            optimization_needed: total > self.max_tokens,
            suggested_strategy: self.suggest_strategy(items, now),
            by_type: count_by(items, |i| i.item_type.as_str().to_string()),
            by_priority: count_by(items, |i| i.priority),
            by_age,
            tokens_by_type,
            compression: compression_potential(items),
        }
    }
}

fn build_compressor(config: &OptimizerConfig, measure: &Arc<dyn TokenMeasure>) -> Compressor {
    Compressor::new(Arc::clone(measure))
        .with_filler_words(&config.filler_words)
        .with_min_useful_tokens(config.min_useful_tokens)
}

struct Fill {
    kept: Vec<ContextItem>,
    used: usize,
    /// The first item that did not fit.
    missed: Option<ContextItem>,
}

/// Take items in order while they fit under `target`, stopping at the first
/// one that does not.
fn fill_until_miss(items: Vec<ContextItem>, target: usize, mut used: usize) -> Fill {
    let mut kept = Vec::new();
    for item in items {
        if used + item.token_count <= target {
            used += item.token_count;
            kept.push(item);
        } else {
            return Fill {
                kept,
                used,
                missed: Some(item),
            };
        }
    }
    Fill {
        kept,
        used,
        missed: None,
    }
}

fn group_key(item: &ContextItem) -> String {
    let mut tags: Vec<&str> = item.tags.iter().map(String::as_str).collect();
    tags.sort_unstable();
    let mut key = item.item_type.as_str().to_string();
    for tag in tags {
        key.push('\u{1f}');
        key.push_str(tag);
    }
    key
}

fn count_by<K: Ord>(items: &[ContextItem], key: impl Fn(&ContextItem) -> K) -> BTreeMap<K, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(key(item)).or_insert(0) += 1;
    }
    counts
}

fn age_spread_hours(items: &[ContextItem]) -> f64 {
    let oldest = items.iter().map(|i| i.timestamp).min();
    let newest = items.iter().map(|i| i.timestamp).max();
    match (oldest, newest) {
        (Some(o), Some(n)) => (n - o).num_seconds() as f64 / 3600.0,
        _ => 0.0,
    }
}

fn compression_potential(items: &[ContextItem]) -> CompressionPotential {
    let total_chars: usize = items.iter().map(|i| i.content.chars().count()).sum();
    let whitespace: usize = items
        .iter()
        .map(|i| i.content.chars().filter(|c| c.is_whitespace()).count())
        .sum();
    let ratio = if total_chars == 0 {
        0.0
    } else {
        whitespace as f64 / total_chars as f64
    };
    let estimated_ratio = (ratio * 0.5 + 0.1).min(0.3);

    CompressionPotential {
        estimated_ratio,
        potential_token_savings: (total_tokens(items) as f64 * estimated_ratio) as usize,
        compressible_items: items
            .iter()
            .filter(|i| i.token_count > 200 && i.item_type != ItemType::System)
            .count(),
    }
}
