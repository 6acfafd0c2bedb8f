//! Top-level configuration for a store, its optimizer, and window assembly.
//!
//! Every field has a default, so a config file only needs the values it
//! overrides:
//!
//! ```json
//! {
//!   "store": { "max_tokens": 32000 },
//!   "optimizer": { "relevance_threshold": 0.4 },
//!   "window": { "response_reserve": 2000 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::optimizer::OptimizerConfig;
use crate::context::scoring::ScoringPolicy;
use crate::context::store::StoreConfig;
use crate::context::window::WindowConfig;
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtxConfig {
    pub store: StoreConfig,
    pub optimizer: OptimizerConfig,
    pub scoring: ScoringPolicy,
    pub window: WindowConfig,
}

impl CtxConfig {
    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        let config: CtxConfig = serde_json::from_str(&json)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.store.auto_optimize_fraction) {
            return Err(StoreError::Config(format!(
                "store.auto_optimize_fraction must be within [0, 1], got {}",
                self.store.auto_optimize_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.optimizer.relevance_threshold) {
            return Err(StoreError::Config(format!(
                "optimizer.relevance_threshold must be within [0, 1], got {}",
                self.optimizer.relevance_threshold
            )));
        }
        if self.scoring.max_age_hours <= 0.0 {
            return Err(StoreError::Config(
                "scoring.max_age_hours must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.json");
        std::fs::write(&path, "{}").unwrap();
        assert_eq!(CtxConfig::load(&path).unwrap(), CtxConfig::default());
    }

    #[test]
    fn partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.json");
        std::fs::write(
            &path,
            r#"{"store": {"max_tokens": 32000}, "window": {"response_reserve": 2000}}"#,
        )
        .unwrap();
        let config = CtxConfig::load(&path).unwrap();
        assert_eq!(config.store.max_tokens, 32000);
        assert_eq!(config.store.auto_optimize_fraction, 0.9);
        assert_eq!(config.window.response_reserve, 2000);
        assert_eq!(config.optimizer.min_compression_room, 100);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(CtxConfig::load(&path), Err(StoreError::Config(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CtxConfig::load(dir.path().join("absent.json")),
            Err(StoreError::Io { .. })
        ));
    }

    #[test]
    fn out_of_range_fraction_rejected() {
        let mut config = CtxConfig::default();
        config.store.auto_optimize_fraction = 1.5;
        assert!(config.validate().is_err());
    }
}
