//! Crash-recoverable position state
//!
//! One JSON document holds every trading instance, keyed by instance name:
//!
//! ```json
//! {
//!   "reliance-trend": {
//!     "current_position": { "NSE:RELIANCE-EQ": 2 },
//!     "pending_order_action": [
//!       { "update_time": "2025-06-02T10:31:00Z", "order_qty": -3, "instrument": "NSE:RELIANCE-EQ" }
//!     ]
//!   }
//! }
//! ```
//!
//! A missing or unreadable document is treated as "nothing saved".

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

/// Order deferred until the market reopens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub instrument: String,
    /// Signed quantity: positive buys, negative sells
    pub order_qty: i64,
    pub update_time: DateTime<Utc>,
}

/// Saved projection of one instance's positions and pending orders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub current_position: BTreeMap<String, i64>,

    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub pending_order_action: Vec<PendingOrder>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(PendingOrder),
    Many(Vec<PendingOrder>),
}

/// Older documents hold a single pending order object
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<PendingOrder>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(order)) => vec![order],
        Some(OneOrMany::Many(orders)) => orders,
        None => Vec::new(),
    })
}

/// JSON file store shared by every instance in the process
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    backtest: OnceLock<Arc<StateStore>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            backtest: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Separate store next to this one, `positions.json` becoming
    /// `positions.backtest.json`. Replays write there so they never touch
    /// live positions. Every caller gets the same sibling, so its writes
    /// stay serialised.
    pub fn backtest_copy(&self) -> Arc<StateStore> {
        self.backtest
            .get_or_init(|| Arc::new(Self::new(self.path.with_extension("backtest.json"))))
            .clone()
    }

    /// Some(empty) when the file is missing, None when it exists but can't
    /// be used
    fn read_document(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Some(Default::default()),
            Err(e) => {
                warn!("Failed to read state file {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<serde_json::Value>(&contents) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            Ok(_) | Err(_) => {
                warn!(
                    "State file {} is not a JSON object, treating as empty",
                    self.path.display()
                );
                None
            }
        }
    }

    /// Load an instance's saved state, or defaults if there is none
    pub fn load(&self, instance: &str) -> InstanceState {
        let mut document = self.read_document().unwrap_or_default();
        let Some(value) = document.remove(instance) else {
            debug!("No saved state for {}", instance);
            return InstanceState::default();
        };

        match serde_json::from_value(value) {
            Ok(state) => state,
            Err(e) => {
                warn!("Saved state for {} is malformed ({}), starting empty", instance, e);
                InstanceState::default()
            }
        }
    }

    /// Replace an instance's entry wholesale; other instances are kept
    pub fn save(
        &self,
        instance: &str,
        positions: &BTreeMap<String, i64>,
        pending: &[PendingOrder],
    ) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let state = InstanceState {
            current_position: positions.clone(),
            pending_order_action: pending.to_vec(),
        };

        let mut document = self.read_document().unwrap_or_else(|| {
            warn!(
                "Rewriting {} from scratch; entries of other instances in it are lost",
                self.path.display()
            );
            Default::default()
        });
        document.insert(instance.to_string(), serde_json::to_value(&state)?);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&serde_json::Value::Object(document))?;
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!("Saved state for {} to {}", instance, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(entries: &[(&str, i64)]) -> BTreeMap<String, i64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        store.save("alpha", &positions(&[("A", 5), ("B", -2)]), &[]).unwrap();

        let state = store.load("alpha");
        assert_eq!(state.current_position, positions(&[("A", 5), ("B", -2)]));
        assert!(state.pending_order_action.is_empty());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));

        assert_eq!(store.load("alpha"), InstanceState::default());

        // Parent directories are created on first save
        store.save("alpha", &positions(&[("A", 1)]), &[]).unwrap();
        assert_eq!(store.load("alpha").current_position["A"], 1);
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = StateStore::new(&path);

        assert_eq!(store.load("alpha"), InstanceState::default());
        store.save("alpha", &positions(&[("A", 3)]), &[]).unwrap();
        assert_eq!(store.load("alpha").current_position["A"], 3);
    }

    #[test]
    fn test_save_over_corrupt_file_starts_a_fresh_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"beta": {"current_position": {"C": 1}}"#).unwrap();
        let store = StateStore::new(&path);

        store.save("alpha", &positions(&[("A", 2)]), &[]).unwrap();

        // The truncated document is replaced, so beta's entry is gone
        let document: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(document.as_object().unwrap().len(), 1);
        assert_eq!(store.load("alpha").current_position["A"], 2);
        assert_eq!(store.load("beta"), InstanceState::default());
    }

    #[test]
    fn test_backtest_copy_writes_a_sibling_file() {
        let dir = tempfile::tempdir().unwrap();
        let live = StateStore::new(dir.path().join("positions.json"));
        let replay = live.backtest_copy();
        assert_eq!(replay.path(), dir.path().join("positions.backtest.json"));
        assert!(Arc::ptr_eq(&replay, &live.backtest_copy()));

        live.save("alpha", &positions(&[("A", 7)]), &[]).unwrap();
        replay.save("alpha", &positions(&[("A", -2)]), &[]).unwrap();

        assert_eq!(live.load("alpha").current_position["A"], 7);
        assert_eq!(replay.load("alpha").current_position["A"], -2);
    }

    #[test]
    fn test_save_replaces_entry_and_keeps_other_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let pending = PendingOrder {
            instrument: "A".to_string(),
            order_qty: -3,
            update_time: Utc::now(),
        };

        store.save("alpha", &positions(&[("A", 5)]), &[pending.clone()]).unwrap();
        store.save("beta", &positions(&[("C", 1)]), &[]).unwrap();
        assert_eq!(store.load("alpha").pending_order_action, vec![pending]);

        // Wholesale replacement drops the pending order and position "A"
        store.save("alpha", &positions(&[("B", 2)]), &[]).unwrap();
        let alpha = store.load("alpha");
        assert_eq!(alpha.current_position, positions(&[("B", 2)]));
        assert!(alpha.pending_order_action.is_empty());

        assert_eq!(store.load("beta").current_position, positions(&[("C", 1)]));
    }

    #[test]
    fn test_single_pending_object_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"alpha": {
                "current_position": {"A": 1},
                "pending_order_action": {"update_time": "2025-06-02T10:31:00Z", "order_qty": 2, "instrument": "A"}
            }}"#,
        )
        .unwrap();

        let state = StateStore::new(&path).load("alpha");
        assert_eq!(state.pending_order_action.len(), 1);
        assert_eq!(state.pending_order_action[0].order_qty, 2);
    }
}
