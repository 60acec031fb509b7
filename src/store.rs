//! Durable on-device storage of daily aggregates.
//!
//! One JSON document per (user, date) key under `<data_path>/days/`. Writes
//! go through a temp file and rename so a crash can never leave a torn
//! document behind; a later read sees either the old or the new aggregate.

use crate::core::aggregate::{DailyAggregate, SyncState};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

/// Errors from the durable store.
#[derive(Debug)]
pub enum StoreError {
    Io(String),
    Serialize(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Store IO error: {e}"),
            StoreError::Serialize(e) => write!(f, "Store serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// File-backed key-value store for daily aggregates.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `data_path`.
    pub fn open(data_path: &Path) -> Result<Self, StoreError> {
        let root = data_path.join("days");
        std::fs::create_dir_all(&root).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { root })
    }

    fn key_path(&self, user_id: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(user_id)
            .join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    /// Overwrite the aggregate for its (user, date) key. Atomic per key:
    /// the document is written to a temp file and renamed into place.
    pub fn put(&self, aggregate: &DailyAggregate) -> Result<(), StoreError> {
        let path = self.key_path(&aggregate.user_id, aggregate.date);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(aggregate)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    /// Fetch the aggregate for a key, or `None` if absent.
    pub fn get(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyAggregate>, StoreError> {
        let path = self.key_path(user_id, date);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        let aggregate =
            serde_json::from_str(&content).map_err(|e| StoreError::Serialize(e.to_string()))?;
        Ok(Some(aggregate))
    }

    /// All aggregates still owed to the remote store (`Pending` or `Failed`),
    /// oldest date first so flushes happen in order.
    pub fn list_pending(&self, user_id: &str) -> Result<Vec<DailyAggregate>, StoreError> {
        let mut pending: Vec<DailyAggregate> = self
            .load_all(user_id)?
            .into_iter()
            .filter(|a| matches!(a.sync_state, SyncState::Pending | SyncState::Failed))
            .collect();
        pending.sort_by_key(|a| a.date);
        Ok(pending)
    }

    /// Restart recovery: any aggregate persisted as `Syncing` belongs to a
    /// flush whose acknowledgement was never recorded, so it is demoted to
    /// `Failed` and re-enters the retry pool. Returns the demoted dates.
    pub fn recover(&self, user_id: &str) -> Result<Vec<NaiveDate>, StoreError> {
        let mut demoted = Vec::new();
        for mut aggregate in self.load_all(user_id)? {
            if aggregate.sync_state == SyncState::Syncing {
                aggregate.sync_state = SyncState::Failed;
                self.put(&aggregate)?;
                demoted.push(aggregate.date);
            }
        }
        Ok(demoted)
    }

    fn load_all(&self, user_id: &str) -> Result<Vec<DailyAggregate>, StoreError> {
        let dir = self.root.join(user_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut aggregates = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content =
                    std::fs::read_to_string(&path).map_err(|e| StoreError::Io(e.to_string()))?;
                match serde_json::from_str::<DailyAggregate>(&content) {
                    Ok(aggregate) => aggregates.push(aggregate),
                    Err(e) => {
                        // A corrupt document keeps the rest of the store
                        // readable; it is skipped and logged, not fatal.
                        tracing::warn!("skipping unreadable aggregate {:?}: {e}", path);
                    }
                }
            }
        }
        Ok(aggregates)
    }
}
