//! Convenience re-exports for common `ctxkeep` types.
//!
//! ```ignore
//! use ctxkeep::prelude::*;
//! ```
//!
//! Covers the store, its inputs, the optimizer, and the window builder.
//! Report and analysis types are left in their modules.

pub use crate::config::CtxConfig;
pub use crate::context::{
    ChatTurn, ContextItem, ContextOptimizer, ContextStore, ItemType, ItemUpdate, NewItem,
    OptimizationMetrics, OptimizationStrategy, OptimizerConfig, ScoringPolicy, Section,
    SnapshotStore, StoreConfig, WindowBuilder, WindowConfig,
};
pub use crate::error::{Result, StoreError};
pub use crate::safety::{AllowAll, ContentSafety, PatternSafetyChecker};
pub use crate::tokens::{CharEstimator, TokenCounter, TokenMeasure};
