//! Typed errors for store, persistence, and configuration failures.
//!
//! Nothing in this crate is fatal to the process: every failure is returned
//! as a [`StoreError`] and the caller decides whether to retry.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced at the [`ContextStore`](crate::context::ContextStore) boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content rejected by safety check")]
    UnsafeContent,

    #[error("context item {id} not found")]
    NotFound { id: String },

    #[error("invalid snapshot path: {path}")]
    InvalidPath { path: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown optimization strategy '{0}'")]
    UnknownStrategy(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
