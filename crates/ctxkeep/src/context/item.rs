//! The context item: the unit of storage, scoring, and eviction.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tokens::TokenMeasure;

/// Lowest allowed priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest allowed priority.
pub const MAX_PRIORITY: u8 = 10;

/// Clamp a caller-supplied priority into `[1, 10]`.
pub fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

/// Clamp a relevance score into `[0, 1]`. NaN becomes 0.
pub fn clamp_relevance(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

// ── Item type ─────────────────────────────────────────────────────

/// What kind of content an item holds.
///
/// The vocabulary is open: any string that isn't one of the known names
/// round-trips through [`ItemType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemType {
    System,
    User,
    Assistant,
    Memory,
    ToolResult,
    #[default]
    General,
    Instructions,
    Conversation,
    Other(String),
}

impl ItemType {
    pub fn as_str(&self) -> &str {
        match self {
            ItemType::System => "system",
            ItemType::User => "user",
            ItemType::Assistant => "assistant",
            ItemType::Memory => "memory",
            ItemType::ToolResult => "tool_result",
            ItemType::General => "general",
            ItemType::Instructions => "instructions",
            ItemType::Conversation => "conversation",
            ItemType::Other(name) => name,
        }
    }

    /// The category index bucket this type belongs to, if any.
    pub fn category(&self) -> Option<Category> {
        match self {
            ItemType::System => Some(Category::System),
            ItemType::User | ItemType::Assistant | ItemType::Conversation => {
                Some(Category::Conversation)
            }
            ItemType::Memory => Some(Category::Memory),
            ItemType::ToolResult => Some(Category::Tool),
            _ => None,
        }
    }
}

impl From<&str> for ItemType {
    fn from(s: &str) -> Self {
        match s {
            "system" => ItemType::System,
            "user" => ItemType::User,
            "assistant" => ItemType::Assistant,
            "memory" => ItemType::Memory,
            "tool_result" => ItemType::ToolResult,
            "general" => ItemType::General,
            "instructions" => ItemType::Instructions,
            "conversation" => ItemType::Conversation,
            other => ItemType::Other(other.to_string()),
        }
    }
}

impl From<String> for ItemType {
    fn from(s: String) -> Self {
        ItemType::from(s.as_str())
    }
}

impl From<ItemType> for String {
    fn from(t: ItemType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category buckets of the derived type index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    System,
    Conversation,
    Memory,
    Tool,
}

// ── Item ──────────────────────────────────────────────────────────

/// A single stored piece of context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextItem {
    /// Opaque unique id, immutable once assigned.
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    #[schemars(with = "String")]
    pub item_type: ItemType,
    /// Importance in `[1, 10]`, higher is more important.
    pub priority: u8,
    /// Last-touched time: creation, refreshed on update.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Measured size of `content`.
    pub token_count: usize,
    /// Relevance in `[0, 1]`; overwritten by composite scoring.
    #[serde(default = "default_relevance")]
    pub relevance_score: f64,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_relevance() -> f64 {
    1.0
}

impl ContextItem {
    /// Create an item with a fresh id, measuring `content` with `measure`.
    pub fn new(
        content: impl Into<String>,
        item_type: impl Into<ItemType>,
        measure: &dyn TokenMeasure,
    ) -> Self {
        let content = content.into();
        let token_count = measure.measure(&content);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content,
            item_type: item_type.into(),
            priority: MIN_PRIORITY,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            token_count,
            relevance_score: default_relevance(),
            expiry: None,
            tags: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_relevance(mut self, score: f64) -> Self {
        self.relevance_score = clamp_relevance(score);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.add_tag(tag);
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the item is dead at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|e| now > e)
    }

    /// Hours since the item was last touched, never negative.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.timestamp).num_milliseconds() as f64 / 1000.0;
        (secs / 3600.0).max(0.0)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Add a tag unless already present.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.has_tag(&tag) {
            self.tags.push(tag);
        }
    }

    /// Recompute `token_count` from the current content.
    pub fn remeasure(&mut self, measure: &dyn TokenMeasure) {
        self.token_count = measure.measure(&self.content);
    }

    /// Render as `[TYPE] #priority Tags: a, b` followed by the content.
    pub fn render(&self) -> String {
        let mut header = format!("[{}]", self.item_type.as_str().to_uppercase());
        if self.priority > MIN_PRIORITY {
            header.push_str(&format!(" #{}", self.priority));
        }
        if !self.tags.is_empty() {
            header.push_str(&format!(" Tags: {}", self.tags.join(", ")));
        }
        format!("{header}\n{}", self.content)
    }
}

/// Sort key shared by every "most important first" ordering: priority, then
/// recency, both descending.
pub fn by_priority_then_recency(a: &ContextItem, b: &ContextItem) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
}

/// Sum of `token_count` over `items`.
pub fn total_tokens<'a>(items: impl IntoIterator<Item = &'a ContextItem>) -> usize {
    items.into_iter().map(|i| i.token_count).sum()
}

// ── Store inputs ──────────────────────────────────────────────────

/// Options for [`ContextStore::add`](super::ContextStore::add).
#[derive(Debug, Clone, Default)]
pub struct NewItem {
    pub item_type: ItemType,
    pub priority: u8,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub tags: Vec<String>,
    pub expiry: Option<DateTime<Utc>>,
}

impl NewItem {
    pub fn new(item_type: impl Into<ItemType>) -> Self {
        Self {
            item_type: item_type.into(),
            priority: MIN_PRIORITY,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Partial update for [`ContextStore::update`](super::ContextStore::update).
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub content: Option<String>,
    pub item_type: Option<ItemType>,
    pub priority: Option<u8>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub tags: Option<Vec<String>>,
    /// `Some(None)` clears the expiry.
    pub expiry: Option<Option<DateTime<Utc>>>,
    pub relevance_score: Option<f64>,
}

impl ItemUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn priority(priority: u8) -> Self {
        Self {
            priority: Some(priority),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_relevance(mut self, score: f64) -> Self {
        self.relevance_score = Some(score);
        self
    }

    pub fn with_expiry(mut self, expiry: Option<DateTime<Utc>>) -> Self {
        self.expiry = Some(expiry);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::CharEstimator;
    use chrono::Duration;

    #[test]
    fn new_item_is_measured() {
        let item = ContextItem::new("a".repeat(40), "memory", &CharEstimator::new());
        assert_eq!(item.token_count, 10);
        assert_eq!(item.item_type, ItemType::Memory);
        assert_eq!(item.priority, 1);
        assert_eq!(item.relevance_score, 1.0);
    }

    #[test]
    fn priority_and_relevance_are_clamped() {
        let item = ContextItem::new("x", "general", &CharEstimator::new())
            .with_priority(42)
            .with_relevance(3.5);
        assert_eq!(item.priority, 10);
        assert_eq!(item.relevance_score, 1.0);
        assert_eq!(clamp_priority(0), 1);
        assert_eq!(clamp_relevance(f64::NAN), 0.0);
    }

    #[test]
    fn unknown_types_round_trip() {
        let t = ItemType::from("scratchpad");
        assert_eq!(t, ItemType::Other("scratchpad".into()));
        assert_eq!(t.as_str(), "scratchpad");
        assert!(t.category().is_none());
    }

    #[test]
    fn categories() {
        assert_eq!(ItemType::User.category(), Some(Category::Conversation));
        assert_eq!(ItemType::Assistant.category(), Some(Category::Conversation));
        assert_eq!(ItemType::ToolResult.category(), Some(Category::Tool));
        assert_eq!(ItemType::General.category(), None);
    }

    #[test]
    fn expiry_is_strictly_after() {
        let now = Utc::now();
        let item = ContextItem::new("x", "general", &CharEstimator::new()).with_expiry(now);
        assert!(!item.is_expired_at(now));
        assert!(item.is_expired_at(now + Duration::seconds(1)));
    }

    #[test]
    fn future_timestamp_has_zero_age() {
        let now = Utc::now();
        let item = ContextItem::new("x", "general", &CharEstimator::new())
            .with_timestamp(now + Duration::hours(3));
        assert_eq!(item.age_hours(now), 0.0);
    }

    #[test]
    fn tags_are_deduplicated() {
        let item = ContextItem::new("x", "general", &CharEstimator::new())
            .with_tags(["a", "b", "a"]);
        assert_eq!(item.tags, vec!["a", "b"]);
    }

    #[test]
    fn render_header() {
        let item = ContextItem::new("body", "tool_result", &CharEstimator::new())
            .with_priority(4)
            .with_tags(["grep", "src"]);
        assert_eq!(item.render(), "[TOOL_RESULT] #4 Tags: grep, src\nbody");

        let plain = ContextItem::new("body", "user", &CharEstimator::new());
        assert_eq!(plain.render(), "[USER]\nbody");
    }

    #[test]
    fn serializes_type_as_plain_string() {
        let item = ContextItem::new("x", "tool_result", &CharEstimator::new()).with_id("i1");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["id"], "i1");
        assert!(json["expiry"].is_null());

        let back: ContextItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn ordering_prefers_priority_then_recency() {
        let now = Utc::now();
        let est = CharEstimator::new();
        let old_high = ContextItem::new("a", "general", &est)
            .with_priority(9)
            .with_timestamp(now - Duration::hours(5));
        let new_low = ContextItem::new("b", "general", &est)
            .with_priority(2)
            .with_timestamp(now);
        let new_high = ContextItem::new("c", "general", &est)
            .with_priority(9)
            .with_timestamp(now);
        let mut items = vec![new_low.clone(), old_high.clone(), new_high.clone()];
        items.sort_by(by_priority_then_recency);
        assert_eq!(items, vec![new_high, old_high, new_low]);
    }
}
