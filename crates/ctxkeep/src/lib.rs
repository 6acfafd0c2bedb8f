//! Token-budgeted context storage for LLM agents.
//!
//! `ctxkeep` keeps a working set of short-lived, variably sized text items
//! under a strict token budget. When the set grows past the budget, an
//! optimizer decides what survives: greedy strategies rank items by priority,
//! recency, or a composite score, and may compress one boundary item to use
//! the leftover room. A window builder then assembles a bounded prompt from
//! named, prioritized sections.
//!
//! # Getting started
//!
//! ```
//! use ctxkeep::prelude::*;
//!
//! let mut store = ContextStore::new("agent-1", StoreConfig::default().with_max_tokens(2000));
//! let id = store
//!     .add("You are a careful reviewer.", NewItem::new("system").with_priority(10))
//!     .unwrap();
//! store
//!     .add("The user prefers short answers.", NewItem::new("memory").with_priority(6))
//!     .unwrap();
//!
//! assert!(store.get(&id).is_some());
//! let window = store.get_window(None);
//! assert!(window.starts_with("[SYSTEM] #10"));
//! ```
//!
//! # Where to find things
//!
//! - **Store, query, and persist items:** [`ContextStore`](context::ContextStore)
//!   and [`SnapshotStore`](context::SnapshotStore).
//! - **Control eviction:** [`ContextOptimizer`](context::ContextOptimizer),
//!   [`OptimizationStrategy`](context::OptimizationStrategy), and the
//!   [`ScoringPolicy`](context::ScoringPolicy) weights.
//! - **Assemble a prompt:** [`WindowBuilder`](context::WindowBuilder).
//! - **Plug in a tokenizer or a content filter:** the
//!   [`TokenMeasure`](tokens::TokenMeasure) and
//!   [`ContentSafety`](safety::ContentSafety) traits.
//! - **Load settings from disk:** [`CtxConfig`](config::CtxConfig).
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod config;
pub mod context;
pub mod error;
pub mod prelude;
pub mod safety;
pub mod tokens;

pub use error::{Result, StoreError};
