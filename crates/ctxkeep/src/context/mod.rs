//! Context storage and budget management.
//!
//! Three layers, from the bottom up:
//!
//! - **Items and scoring** ([`item`], [`scoring`]): the unit of storage and
//!   the composite score used to rank it.
//! - **Eviction** ([`optimizer`], [`compress`]): greedy strategies that pick
//!   survivors under a token budget, with single-item compression as a last
//!   resort.
//! - **Storage and assembly** ([`store`], [`window`], [`snapshot`]): the
//!   per-owner store, the section-based window builder, and JSON snapshots.

pub mod compress;
pub mod item;
pub mod optimizer;
pub mod scoring;
pub mod snapshot;
pub mod store;
pub mod window;

pub use compress::Compressor;
pub use item::{Category, ContextItem, ItemType, ItemUpdate, NewItem};
pub use optimizer::{
    ContextOptimizer, OptimizationMetrics, OptimizationReport, OptimizationStrategy,
    OptimizerConfig,
};
pub use scoring::{ScoringEngine, ScoringPolicy};
pub use snapshot::{SnapshotStore, StoreSnapshot, snapshot_schema};
pub use store::{ContextStore, StoreConfig, StoreStats};
pub use window::{BuiltWindow, ChatTurn, Section, WindowBuilder, WindowConfig};
