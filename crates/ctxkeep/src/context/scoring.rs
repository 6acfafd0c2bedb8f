//! Composite scoring: priority, recency, raw relevance, and a per-type bonus
//! folded into one number in `[0, 1]`.
//!
//! The optimizer ranks eviction candidates by this score. Scoring is
//! destructive: [`ScoringEngine::score_in_place`] overwrites each item's
//! `relevance_score` with its composite, so a caller that still needs the raw
//! relevance must copy it out first.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::{ContextItem, clamp_relevance};

/// Weights and lookup tables for the composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub priority_weight: f64,
    pub recency_weight: f64,
    pub relevance_weight: f64,
    pub type_weight: f64,
    /// Age at which the recency component reaches zero.
    pub max_age_hours: f64,
    /// Bonus per item type name.
    pub type_bonus: BTreeMap<String, f64>,
    /// Bonus for types absent from `type_bonus`.
    pub default_type_bonus: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        let type_bonus = [
            ("system", 1.0),
            ("instructions", 0.9),
            ("conversation", 0.7),
            ("memory", 0.6),
            ("tool_result", 0.5),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            priority_weight: 0.4,
            recency_weight: 0.3,
            relevance_weight: 0.2,
            type_weight: 0.1,
            max_age_hours: 168.0,
            type_bonus,
            default_type_bonus: 0.5,
        }
    }
}

impl ScoringPolicy {
    pub fn with_weights(mut self, priority: f64, recency: f64, relevance: f64, kind: f64) -> Self {
        self.priority_weight = priority;
        self.recency_weight = recency;
        self.relevance_weight = relevance;
        self.type_weight = kind;
        self
    }

    pub fn with_max_age_hours(mut self, hours: f64) -> Self {
        self.max_age_hours = hours;
        self
    }

    pub fn with_type_bonus(mut self, item_type: impl Into<String>, bonus: f64) -> Self {
        self.type_bonus.insert(item_type.into(), bonus);
        self
    }
}

/// Applies a [`ScoringPolicy`] to items.
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    policy: ScoringPolicy,
}

impl ScoringEngine {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Linear decay from 1 at age zero to 0 at `max_age_hours`.
    pub fn recency(&self, item: &ContextItem, now: DateTime<Utc>) -> f64 {
        if self.policy.max_age_hours <= 0.0 {
            return 0.0;
        }
        (1.0 - item.age_hours(now) / self.policy.max_age_hours).max(0.0)
    }

    pub fn type_bonus(&self, item: &ContextItem) -> f64 {
        self.policy
            .type_bonus
            .get(item.item_type.as_str())
            .copied()
            .unwrap_or(self.policy.default_type_bonus)
    }

    /// Composite score for one item, reading its current `relevance_score`.
    pub fn composite(&self, item: &ContextItem, now: DateTime<Utc>) -> f64 {
        let p = &self.policy;
        let score = p.priority_weight * (f64::from(item.priority) / 10.0)
            + p.recency_weight * self.recency(item, now)
            + p.relevance_weight * item.relevance_score
            + p.type_weight * self.type_bonus(item);
        clamp_relevance(score)
    }

    /// Overwrite every item's relevance with its composite score and sort
    /// descending by that score.
    pub fn score_in_place(&self, items: &mut [ContextItem], now: DateTime<Utc>) {
        for item in items.iter_mut() {
            item.relevance_score = self.composite(item, now);
        }
        items.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::CharEstimator;
    use chrono::Duration;

    fn item(kind: &str, priority: u8, age_hours: i64, now: DateTime<Utc>) -> ContextItem {
        ContextItem::new("content", kind, &CharEstimator::new())
            .with_priority(priority)
            .with_timestamp(now - Duration::hours(age_hours))
    }

    #[test]
    fn fresh_system_item_scores_high() {
        let now = Utc::now();
        let engine = ScoringEngine::default();
        let score = engine.composite(&item("system", 10, 0, now), now);
        // 0.4 * 1.0 + 0.3 * 1.0 + 0.2 * 1.0 + 0.1 * 1.0
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn recency_decays_to_zero() {
        let now = Utc::now();
        let engine = ScoringEngine::default();
        assert!((engine.recency(&item("memory", 5, 84, now), now) - 0.5).abs() < 1e-6);
        assert_eq!(engine.recency(&item("memory", 5, 500, now), now), 0.0);
    }

    #[test]
    fn future_timestamp_counts_as_fresh() {
        let now = Utc::now();
        let engine = ScoringEngine::default();
        assert_eq!(engine.recency(&item("memory", 5, -10, now), now), 1.0);
    }

    #[test]
    fn unknown_type_gets_default_bonus() {
        let now = Utc::now();
        let engine = ScoringEngine::default();
        assert_eq!(engine.type_bonus(&item("scratch", 1, 0, now)), 0.5);
        assert_eq!(engine.type_bonus(&item("instructions", 1, 0, now)), 0.9);
    }

    #[test]
    fn score_in_place_mutates_and_sorts() {
        let now = Utc::now();
        let engine = ScoringEngine::default();
        let mut items = vec![
            item("tool_result", 2, 100, now).with_id("low"),
            item("system", 9, 0, now).with_id("high"),
            item("memory", 5, 10, now).with_id("mid"),
        ];
        engine.score_in_place(&mut items, now);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
        assert!(items.iter().all(|i| (0.0..=1.0).contains(&i.relevance_score)));
        assert!(items[2].relevance_score < 1.0);
    }

    #[test]
    fn policy_deserializes_with_partial_fields() {
        let policy: ScoringPolicy = serde_json::from_str(r#"{"type_weight": 0.0}"#).unwrap();
        assert_eq!(policy.type_weight, 0.0);
        assert_eq!(policy.priority_weight, 0.4);
        assert_eq!(policy.type_bonus.get("system"), Some(&1.0));
    }
}
