//! Best-effort JSON snapshots of a store, one file per owner.
//!
//! Layout:
//!
//! ```text
//! <dir>/
//!   <agent_id>_context.json      # current snapshot
//!   <agent_id>_context.json.bak  # previous snapshot, if any
//! ```
//!
//! Writes go to a hidden temp file first and are renamed into place, so a
//! crash mid-write leaves the previous snapshot intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::item::ContextItem;
use super::store::StoreStats;
use crate::error::{Result, StoreError};

/// On-disk form of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StoreSnapshot {
    pub agent_id: String,
    pub contexts: BTreeMap<String, ContextItem>,
    /// Insertion order of ids in `contexts`.
    pub context_order: Vec<String>,
    pub stats: StoreStats,
    pub saved_at: DateTime<Utc>,
}

/// JSON Schema describing [`StoreSnapshot`] files.
pub fn snapshot_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(StoreSnapshot)
}

/// Reads and writes snapshot files under one directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Create a snapshot store, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot for `agent_id`, rejecting ids that would leave
    /// the directory.
    pub fn path_for(&self, agent_id: &str) -> Result<PathBuf> {
        let escapes = agent_id.is_empty()
            || agent_id.contains("..")
            || agent_id.contains(['/', '\\', '\0'])
            || agent_id.starts_with('.');
        if escapes {
            return Err(StoreError::InvalidPath {
                path: agent_id.to_string(),
            });
        }
        Ok(self.dir.join(format!("{agent_id}_context.json")))
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Atomic write, keeping the previous snapshot as `.bak`.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<PathBuf> {
        let final_path = self.path_for(&snapshot.agent_id)?;
        let tmp_path = self
            .dir
            .join(format!(".{}_context.json.tmp", snapshot.agent_id));

        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&tmp_path, json).map_err(|e| StoreError::io(&tmp_path, e))?;

        if final_path.exists() {
            let backup = Self::backup_path(&final_path);
            std::fs::copy(&final_path, &backup).map_err(|e| StoreError::io(&backup, e))?;
            debug!(path = %backup.display(), "kept previous snapshot");
        }
        std::fs::rename(&tmp_path, &final_path).map_err(|e| StoreError::io(&final_path, e))?;

        info!(
            agent = %snapshot.agent_id,
            items = snapshot.contexts.len(),
            path = %final_path.display(),
            "saved context snapshot"
        );
        Ok(final_path)
    }

    /// Load the snapshot for `agent_id`. Returns `None` if none was saved.
    pub fn load(&self, agent_id: &str) -> Result<Option<StoreSnapshot>> {
        let path = self.path_for(agent_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        let snapshot: StoreSnapshot = serde_json::from_str(&json)?;
        Ok(Some(snapshot))
    }

    /// Load the `.bak` copy, if any.
    pub fn load_backup(&self, agent_id: &str) -> Result<Option<StoreSnapshot>> {
        let path = Self::backup_path(&self.path_for(agent_id)?);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Remove the snapshot and its backup. Missing files are fine.
    pub fn delete(&self, agent_id: &str) -> Result<()> {
        let path = self.path_for(agent_id)?;
        for p in [Self::backup_path(&path), path] {
            match std::fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&p, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::CharEstimator;

    fn snapshot(agent: &str, contents: &[&str]) -> StoreSnapshot {
        let items: Vec<ContextItem> = contents
            .iter()
            .enumerate()
            .map(|(i, c)| {
                ContextItem::new(*c, "memory", &CharEstimator::new())
                    .with_id(format!("id-{i}"))
                    .with_tags(["t"])
            })
            .collect();
        StoreSnapshot {
            agent_id: agent.to_string(),
            context_order: items.iter().map(|i| i.id.clone()).collect(),
            contexts: items.into_iter().map(|i| (i.id.clone(), i)).collect(),
            stats: StoreStats::default(),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        let snap = snapshot("agent-1", &["first", "second"]);
        let path = store.save(&snap).unwrap();
        assert_eq!(path, dir.path().join("agent-1_context.json"));

        let loaded = store.load("agent-1").unwrap().unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let path = store.save(&snapshot("a", &["x"])).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        let saved_at = raw["saved_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(saved_at).is_ok());
        assert_eq!(raw["contexts"]["id-0"]["type"], "memory");
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        assert!(store.load("nobody").unwrap().is_none());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        store.save(&snapshot("a", &["x"])).unwrap();
        assert!(!dir.path().join(".a_context.json.tmp").exists());
    }

    #[test]
    fn second_save_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        store.save(&snapshot("a", &["old"])).unwrap();
        store.save(&snapshot("a", &["new"])).unwrap();

        let current = store.load("a").unwrap().unwrap();
        let backup = store.load_backup("a").unwrap().unwrap();
        assert_eq!(current.contexts["id-0"].content, "new");
        assert_eq!(backup.contexts["id-0"].content, "old");
    }

    #[test]
    fn escaping_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        for bad in ["../evil", "a/b", "a\\b", "", ".hidden"] {
            assert!(
                matches!(store.path_for(bad), Err(StoreError::InvalidPath { .. })),
                "{bad:?} accepted"
            );
        }
        assert!(store.save(&snapshot("../evil", &["x"])).is_err());
    }

    #[test]
    fn corrupt_snapshot_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("a_context.json"), "{not json").unwrap();
        assert!(matches!(store.load("a"), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn delete_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        store.save(&snapshot("a", &["x"])).unwrap();
        store.save(&snapshot("a", &["y"])).unwrap();
        store.delete("a").unwrap();
        assert!(store.load("a").unwrap().is_none());
        assert!(store.load_backup("a").unwrap().is_none());
        store.delete("a").unwrap();
    }

    #[test]
    fn schema_describes_snapshot() {
        let schema = serde_json::to_value(snapshot_schema()).unwrap();
        let props = &schema["properties"];
        assert!(props.get("contexts").is_some());
        assert!(props.get("context_order").is_some());
    }
}
