//! The token-budgeted context store.
//!
//! A [`ContextStore`] owns the items of one owner (typically an agent), keeps
//! their insertion order, and holds the sum of their token counts under
//! `max_tokens` by running the [`ContextOptimizer`] whenever an `add` pushes
//! it over.
//!
//! Expired items stay in storage until [`purge_expired`](ContextStore::purge_expired)
//! or an optimization pass removes them, but every read path skips them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::item::{
    Category, ContextItem, ItemType, ItemUpdate, NewItem, by_priority_then_recency, clamp_priority,
    clamp_relevance,
};
use super::optimizer::{
    ContextOptimizer, OptimizationMetrics, OptimizationReport, OptimizationStrategy,
    OptimizerConfig,
};
use super::scoring::ScoringPolicy;
use super::snapshot::{SnapshotStore, StoreSnapshot};
use crate::config::CtxConfig;
use crate::error::{Result, StoreError};
use crate::safety::{ContentSafety, PatternSafetyChecker};
use crate::tokens::{CharEstimator, TokenMeasure};

/// Budget settings for a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_tokens: usize,
    /// Fraction of `max_tokens` that an automatic optimization aims for.
    pub auto_optimize_fraction: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            auto_optimize_fraction: 0.9,
        }
    }
}

impl StoreConfig {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_auto_optimize_fraction(mut self, fraction: f64) -> Self {
        self.auto_optimize_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn auto_optimize_target(&self) -> usize {
        (self.max_tokens as f64 * self.auto_optimize_fraction) as usize
    }
}

/// Derived counters, recomputed after every structural change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StoreStats {
    pub total_items: usize,
    pub total_tokens: usize,
    pub items_by_type: BTreeMap<String, usize>,
    pub last_optimization: Option<DateTime<Utc>>,
    pub optimization_count: usize,
}

pub struct ContextStore {
    owner: String,
    config: StoreConfig,
    items: HashMap<String, ContextItem>,
    order: Vec<String>,
    stats: StoreStats,
    measure: Arc<dyn TokenMeasure>,
    safety: Arc<dyn ContentSafety>,
    optimizer: ContextOptimizer,
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .field("items", &self.items.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ContextStore {
    /// Create an empty store using the character estimator and the default
    /// pattern safety checker.
    pub fn new(owner: impl Into<String>, config: StoreConfig) -> Self {
        let measure: Arc<dyn TokenMeasure> = Arc::new(CharEstimator::new());
        let optimizer = ContextOptimizer::new(config.max_tokens, Arc::clone(&measure));
        Self {
            owner: owner.into(),
            config,
            items: HashMap::new(),
            order: Vec::new(),
            stats: StoreStats::default(),
            measure,
            safety: Arc::new(PatternSafetyChecker::new()),
            optimizer,
        }
    }

    /// Create an empty store from a full configuration file.
    pub fn from_config(owner: impl Into<String>, config: &CtxConfig) -> Self {
        Self::new(owner, config.store.clone())
            .with_optimizer_config(config.optimizer.clone())
            .with_scoring(config.scoring.clone())
    }

    /// Create a store and restore its last snapshot, if one exists.
    ///
    /// An unreadable snapshot is logged and the store starts empty.
    pub fn open(owner: impl Into<String>, config: StoreConfig, snapshots: &SnapshotStore) -> Self {
        let mut store = Self::new(owner, config);
        store.restore(snapshots);
        store
    }

    pub fn with_measure(mut self, measure: Arc<dyn TokenMeasure>) -> Self {
        self.measure = measure;
        self.rebuild_optimizer(
            self.optimizer.config().clone(),
            self.optimizer.scoring().policy().clone(),
        );
        self
    }

    pub fn with_safety(mut self, safety: Arc<dyn ContentSafety>) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_optimizer_config(mut self, config: OptimizerConfig) -> Self {
        self.rebuild_optimizer(config, self.optimizer.scoring().policy().clone());
        self
    }

    pub fn with_scoring(mut self, policy: ScoringPolicy) -> Self {
        self.rebuild_optimizer(self.optimizer.config().clone(), policy);
        self
    }

    fn rebuild_optimizer(&mut self, config: OptimizerConfig, policy: ScoringPolicy) {
        self.optimizer = ContextOptimizer::new(self.config.max_tokens, Arc::clone(&self.measure))
            .with_config(config)
            .with_scoring(policy);
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &ContextOptimizer {
        &self.optimizer
    }

    // ── Mutation ──────────────────────────────────────────────────

    /// Insert new content, returning its id.
    ///
    /// If the store goes over budget, a hybrid optimization runs before this
    /// returns; the new item itself may be evicted by it.
    pub fn add(&mut self, content: impl Into<String>, opts: NewItem) -> Result<String> {
        let content = content.into();
        if !self.safety.is_safe(&content) {
            warn!(owner = %self.owner, "rejected unsafe context content");
            return Err(StoreError::UnsafeContent);
        }

        let mut item = ContextItem::new(content, opts.item_type, self.measure.as_ref())
            .with_priority(opts.priority)
            .with_tags(opts.tags);
        item.metadata = opts.metadata;
        item.expiry = opts.expiry;

        let id = item.id.clone();
        debug!(
            id = %id,
            item_type = %item.item_type,
            tokens = item.token_count,
            "added context item"
        );
        self.order.push(id.clone());
        self.items.insert(id.clone(), item);
        self.refresh_stats();

        if self.total_tokens() > self.config.max_tokens {
            let target = self.config.auto_optimize_target();
            self.optimize(Some(target), OptimizationStrategy::Hybrid);
        }
        Ok(id)
    }

    /// Merge `update` into an existing item and refresh its timestamp.
    pub fn update(&mut self, id: &str, update: ItemUpdate) -> Result<()> {
        if !self.items.contains_key(id) {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        if let Some(content) = &update.content
            && !self.safety.is_safe(content)
        {
            warn!(owner = %self.owner, id, "rejected unsafe context update");
            return Err(StoreError::UnsafeContent);
        }

        let Some(item) = self.items.get_mut(id) else {
            return Err(StoreError::NotFound { id: id.to_string() });
        };
        if let Some(content) = update.content {
            item.content = content;
            item.remeasure(self.measure.as_ref());
        }
        if let Some(item_type) = update.item_type {
            item.item_type = item_type;
        }
        if let Some(priority) = update.priority {
            item.priority = clamp_priority(priority);
        }
        if let Some(metadata) = update.metadata {
            item.metadata = metadata;
        }
        if let Some(tags) = update.tags {
            item.tags.clear();
            for tag in tags {
                item.add_tag(tag);
            }
        }
        if let Some(expiry) = update.expiry {
            item.expiry = expiry;
        }
        if let Some(score) = update.relevance_score {
            item.relevance_score = clamp_relevance(score);
        }
        item.timestamp = Utc::now();

        debug!(id, tokens = item.token_count, "updated context item");
        self.refresh_stats();
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<ContextItem> {
        let removed = self.items.remove(id)?;
        self.order.retain(|o| o != id);
        self.refresh_stats();
        debug!(id, "removed context item");
        Some(removed)
    }

    /// Drop every item, or only those of one type. Returns how many went.
    pub fn clear(&mut self, item_type: Option<&ItemType>) -> usize {
        let before = self.items.len();
        match item_type {
            None => {
                self.items.clear();
                self.order.clear();
            }
            Some(t) => {
                self.items.retain(|_, item| item.item_type != *t);
                let items = &self.items;
                self.order.retain(|id| items.contains_key(id));
            }
        }
        self.refresh_stats();
        before - self.items.len()
    }

    /// Remove expired items from storage. Idempotent.
    pub fn purge_expired(&mut self) -> usize {
        let now = Utc::now();
        let before = self.items.len();
        self.items.retain(|_, item| !item.is_expired_at(now));
        let removed = before - self.items.len();
        if removed > 0 {
            let items = &self.items;
            self.order.retain(|id| items.contains_key(id));
            self.refresh_stats();
            info!(owner = %self.owner, removed, "purged expired context items");
        }
        removed
    }

    /// Run the optimizer over every stored item and keep its selection.
    ///
    /// Survivors keep their insertion order. `target` defaults to 90% of
    /// `max_tokens`.
    pub fn optimize(
        &mut self,
        target: Option<usize>,
        strategy: OptimizationStrategy,
    ) -> OptimizationMetrics {
        let now = Utc::now();
        let items = self.items_in_order().into_iter().cloned().collect();
        let (kept, metrics) = self.optimizer.optimize(items, target, strategy, now);

        if metrics.strategy.is_some() {
            let survivors: HashMap<String, ContextItem> =
                kept.into_iter().map(|item| (item.id.clone(), item)).collect();
            self.order.retain(|id| survivors.contains_key(id));
            self.items = survivors;
            self.stats.last_optimization = Some(now);
            self.stats.optimization_count += 1;
            self.refresh_stats();
            info!(owner = %self.owner, "{}", metrics.to_log_string());
        }
        metrics
    }

    fn refresh_stats(&mut self) {
        let mut by_type = BTreeMap::new();
        for item in self.items.values() {
            *by_type.entry(item.item_type.to_string()).or_insert(0) += 1;
        }
        self.stats.total_items = self.items.len();
        self.stats.total_tokens = self.total_tokens();
        self.stats.items_by_type = by_type;
    }

    // ── Reads ─────────────────────────────────────────────────────

    /// Look up a live item.
    pub fn get(&self, id: &str) -> Option<&ContextItem> {
        let now = Utc::now();
        self.items.get(id).filter(|item| !item.is_expired_at(now))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Tokens of everything stored, expired or not.
    pub fn total_tokens(&self) -> usize {
        self.items.values().map(|item| item.token_count).sum()
    }

    /// Tokens of non-expired items.
    pub fn live_tokens(&self) -> usize {
        self.live(Utc::now()).map(|item| item.token_count).sum()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// All stored items, expired included, in insertion order.
    pub fn items_in_order(&self) -> Vec<&ContextItem> {
        self.order.iter().filter_map(|id| self.items.get(id)).collect()
    }

    fn live(&self, now: DateTime<Utc>) -> impl Iterator<Item = &ContextItem> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id))
            .filter(move |item| !item.is_expired_at(now))
    }

    /// Ids per category, in insertion order. Uncategorized types are absent.
    pub fn category_index(&self) -> BTreeMap<Category, Vec<String>> {
        let mut index: BTreeMap<Category, Vec<String>> = BTreeMap::new();
        for item in self.live(Utc::now()) {
            if let Some(category) = item.item_type.category() {
                index.entry(category).or_default().push(item.id.clone());
            }
        }
        index
    }

    pub fn get_by_type(&self, item_type: &ItemType) -> Vec<&ContextItem> {
        self.live(Utc::now())
            .filter(|item| item.item_type == *item_type)
            .collect()
    }

    /// Items with priority at least `min`, most important first.
    pub fn get_by_priority(&self, min: u8) -> Vec<&ContextItem> {
        let mut items: Vec<&ContextItem> = self
            .live(Utc::now())
            .filter(|item| item.priority >= min)
            .collect();
        items.sort_by(|a, b| by_priority_then_recency(a, b));
        items
    }

    /// Items touched within `window`, newest first.
    pub fn get_recent(&self, window: chrono::Duration, limit: Option<usize>) -> Vec<&ContextItem> {
        let now = Utc::now();
        // A window reaching past the representable range has no cutoff.
        let cutoff = now.checked_sub_signed(window);
        let mut items: Vec<&ContextItem> = self
            .live(now)
            .filter(|item| cutoff.is_none_or(|c| item.timestamp > c))
            .collect();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        items
    }

    /// Case-insensitive substring search, optionally restricted to one type
    /// and to items carrying any of `tags`.
    pub fn search(
        &self,
        query: &str,
        item_type: Option<&ItemType>,
        tags: &[&str],
    ) -> Vec<&ContextItem> {
        let needle = query.to_lowercase();
        let mut items: Vec<&ContextItem> = self
            .live(Utc::now())
            .filter(|item| item_type.is_none_or(|t| item.item_type == *t))
            .filter(|item| tags.is_empty() || tags.iter().any(|t| item.has_tag(t)))
            .filter(|item| item.content.to_lowercase().contains(&needle))
            .collect();
        items.sort_by(|a, b| by_priority_then_recency(a, b));
        items
    }

    /// Render the most important live items that fit `max_tokens` (default:
    /// the store budget), stopping at the first that does not.
    pub fn get_window(&self, max_tokens: Option<usize>) -> String {
        let budget = max_tokens.unwrap_or(self.config.max_tokens);
        let mut items: Vec<&ContextItem> = self.live(Utc::now()).collect();
        items.sort_by(|a, b| by_priority_then_recency(a, b));

        let mut parts = Vec::new();
        let mut used = 0;
        for item in items {
            if used + item.token_count > budget {
                break;
            }
            used += item.token_count;
            parts.push(item.render());
        }
        parts.join("\n\n")
    }

    /// Analysis of the current contents against the budget.
    pub fn report(&self) -> OptimizationReport {
        let items: Vec<ContextItem> = self.items_in_order().into_iter().cloned().collect();
        self.optimizer.report(&items, Utc::now())
    }

    // ── Persistence ───────────────────────────────────────────────

    pub fn to_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            agent_id: self.owner.clone(),
            contexts: self
                .items
                .iter()
                .map(|(id, item)| (id.clone(), item.clone()))
                .collect(),
            context_order: self.order.clone(),
            stats: self.stats.clone(),
            saved_at: Utc::now(),
        }
    }

    pub fn save(&self, snapshots: &SnapshotStore) -> Result<std::path::PathBuf> {
        snapshots.save(&self.to_snapshot())
    }

    /// Replace the contents with the owner's last snapshot.
    ///
    /// Returns `true` if a snapshot was applied or none exists, `false` if it
    /// could not be read; the store is untouched in both of the latter cases.
    pub fn restore(&mut self, snapshots: &SnapshotStore) -> bool {
        match snapshots.load(&self.owner) {
            Ok(Some(snapshot)) => {
                self.apply_snapshot(snapshot);
                info!(owner = %self.owner, items = self.items.len(), "restored context snapshot");
                true
            }
            Ok(None) => true,
            Err(e) => {
                warn!(owner = %self.owner, error = %e, "could not restore context snapshot");
                false
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: StoreSnapshot) {
        let StoreSnapshot {
            contexts,
            context_order,
            stats,
            ..
        } = snapshot;

        let mut order: Vec<String> = context_order
            .into_iter()
            .filter(|id| contexts.contains_key(id))
            .collect();
        // Ids missing from the order list go last, in map order.
        for id in contexts.keys() {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }

        // Files may come from another measure or a hand edit.
        self.items = contexts
            .into_iter()
            .map(|(id, mut item)| {
                item.remeasure(self.measure.as_ref());
                item.priority = clamp_priority(item.priority);
                item.relevance_score = clamp_relevance(item.relevance_score);
                (id, item)
            })
            .collect();
        self.order = order;
        self.stats.last_optimization = stats.last_optimization;
        self.stats.optimization_count = stats.optimization_count;
        self.refresh_stats();

        if self.total_tokens() > self.config.max_tokens {
            let target = self.config.auto_optimize_target();
            self.optimize(Some(target), OptimizationStrategy::Hybrid);
        }
    }
}
