//! Crash-recovery persistence of the placement state.

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::{
    core::PoolState,
    errors::{StoreEncode, StoreWrite, SvcError},
};

/// File name of the state document under the orchestrator root.
pub const STATE_FILE: &str = ".container-pool-state.json";

/// Atomic JSON persistence of [`PoolState`]. Single writer: the PoolManager.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store rooted at the orchestrator data root.
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(STATE_FILE),
        }
    }

    /// Where the state document lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state document. A missing file yields empty state; an
    /// unreadable or unparsable one is logged and also yields empty state,
    /// the next successful save replaces it.
    pub fn load(&self) -> PoolState {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "No state file at '{}', starting empty",
                    self.path.display()
                );
                return PoolState::default();
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read state file '{}': {}; starting empty",
                    self.path.display(),
                    e
                );
                return PoolState::default();
            }
        };
        match serde_json::from_str::<PoolState>(&raw) {
            Ok(state) => {
                tracing::info!(
                    "Loaded {} pools and {} bot mappings from '{}'",
                    state.pools.len(),
                    state.bot_mapping.len(),
                    self.path.display()
                );
                state
            }
            Err(e) => {
                tracing::warn!(
                    "State file '{}' is corrupt: {}; starting empty",
                    self.path.display(),
                    e
                );
                PoolState::default()
            }
        }
    }

    /// Serialize and atomically replace the state document
    /// (write temp, then rename).
    pub fn save(&self, state: &PoolState) -> Result<(), SvcError> {
        let body =
            serde_json::to_string_pretty(state).context(StoreEncode)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context(StoreWrite {
                path: self.path.clone(),
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).context(StoreWrite {
            path: tmp.clone(),
        })?;
        std::fs::rename(&tmp, &self.path).context(StoreWrite {
            path: self.path.clone(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn sample_state() -> PoolState {
        let user = UserId::from("alice");
        let pool_id = PoolId::for_user(&user, 1);
        let instance = InstanceId::from("b1");
        let mut state = PoolState::default();
        state.pools.insert(
            pool_id.clone(),
            Pool {
                id: pool_id.clone(),
                container_name: "alice-pool-1".into(),
                user_id: user.clone(),
                max_bots: 3,
                base_port: 9000,
                bots: vec![instance.clone()],
                status: PoolStatus::Running,
                metrics: Default::default(),
                created_at: Utc::now(),
                workdir: PathBuf::from("/tmp/alice/alice-pool-1"),
            },
        );
        state.bot_mapping.insert(
            instance.clone(),
            Slot {
                instance_id: instance,
                pool_id,
                user_id: user,
                slot_index: 0,
                port: 9000,
                status: SlotStatus::Running,
                host: "localhost".into(),
            },
        );
        state.next_pool_id = 2;
        state
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = sample_state();
        store.save(&state).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.next_pool_id, state.next_pool_id);
        assert_eq!(loaded.pools.len(), 1);
        assert_eq!(
            loaded.bot_mapping.get(&InstanceId::from("b1")),
            state.bot_mapping.get(&InstanceId::from("b1"))
        );
    }

    #[test]
    fn schema_keys_are_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample_state()).unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"botMapping\""));
        assert!(raw.contains("\"nextPoolId\""));
        assert!(raw.contains("\"updatedAt\""));
        assert!(raw.contains("\"basePort\""));
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = store.load();
        assert!(state.pools.is_empty());
        assert_eq!(state.next_pool_id, 1);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::write(store.path(), "{not json").unwrap();
        let state = store.load();
        assert!(state.pools.is_empty());
        assert!(state.bot_mapping.is_empty());
    }
}
