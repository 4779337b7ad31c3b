//! One-shot migration of dedicated bots into pools, with a ledger.

pub mod engine;

pub use engine::{LegacyBot, MigrationEngine, MigrationPlan, MigrationReport};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    core::{InstanceId, PoolId, UserId},
    errors::{LedgerIo, LedgerParse, SvcError},
};

/// File name of the migration log under the orchestrator root.
pub const MIGRATION_LOG: &str = ".migration-log.json";

/// Placement a migration produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSummary {
    pub pool_id: PoolId,
    pub slot_index: usize,
    pub port: u16,
}

/// A completed migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub instance_id: InstanceId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub from_mode: String,
    pub to_mode: String,
    pub slot: SlotSummary,
}

/// A migration that did not survive verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRecord {
    pub instance_id: InstanceId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// A migration rolled back by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRecord {
    pub instance_id: InstanceId,
    pub timestamp: DateTime<Utc>,
    pub outcome: String,
}

/// The append-only migration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationLog {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub migrated_bots: Vec<MigrationRecord>,
    #[serde(default)]
    pub failed_bots: Vec<FailedRecord>,
    #[serde(default)]
    pub rollback_history: Vec<RollbackRecord>,
}

impl MigrationLog {
    /// Whether `instance` counts as migrated: it has a `migrated` record
    /// with no later rollback.
    pub fn is_migrated(&self, instance: &InstanceId) -> bool {
        let migrated_at = self
            .migrated_bots
            .iter()
            .filter(|r| &r.instance_id == instance)
            .map(|r| r.timestamp)
            .max();
        let rolled_back_at = self
            .rollback_history
            .iter()
            .filter(|r| &r.instance_id == instance)
            .map(|r| r.timestamp)
            .max();
        match (migrated_at, rolled_back_at) {
            (Some(m), Some(r)) => m > r,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Atomic JSON persistence of [`MigrationLog`].
#[derive(Debug, Clone)]
pub struct MigrationLedger {
    path: PathBuf,
}

impl MigrationLedger {
    /// Ledger under the orchestrator data root.
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(MIGRATION_LOG),
        }
    }

    /// Load the log; a missing file is an empty log, a corrupt one is an
    /// error (the operator must not lose history silently).
    pub fn load(&self) -> Result<MigrationLog, SvcError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(MigrationLog::default())
            }
            Err(e) => {
                return Err(e).context(LedgerIo {
                    path: self.path.clone(),
                })
            }
        };
        serde_json::from_str(&raw).context(LedgerParse {
            path: self.path.clone(),
        })
    }

    /// Atomically replace the log document.
    pub fn save(&self, log: &MigrationLog) -> Result<(), SvcError> {
        let body = serde_json::to_string_pretty(log).context(LedgerParse {
            path: self.path.clone(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).context(LedgerIo { path: tmp.clone() })?;
        std::fs::rename(&tmp, &self.path).context(LedgerIo {
            path: self.path.clone(),
        })?;
        Ok(())
    }

    /// Append one record through a closure over the loaded log.
    pub fn append<F>(&self, mutate: F) -> Result<(), SvcError>
    where
        F: FnOnce(&mut MigrationLog),
    {
        let mut log = self.load()?;
        mutate(&mut log);
        self.save(&log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrated_until_rolled_back() {
        let instance = InstanceId::from("b7");
        let mut log = MigrationLog::default();
        assert!(!log.is_migrated(&instance));

        log.migrated_bots.push(MigrationRecord {
            instance_id: instance.clone(),
            user_id: UserId::from("U"),
            timestamp: Utc::now(),
            from_mode: "dedicated".into(),
            to_mode: "pooled".into(),
            slot: SlotSummary {
                pool_id: PoolId::from("U-pool-1"),
                slot_index: 0,
                port: 9000,
            },
        });
        assert!(log.is_migrated(&instance));

        log.rollback_history.push(RollbackRecord {
            instance_id: instance.clone(),
            timestamp: Utc::now() + chrono::Duration::seconds(1),
            outcome: "restored".into(),
        });
        assert!(!log.is_migrated(&instance));
    }

    #[test]
    fn ledger_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MigrationLedger::new(dir.path());
        assert!(ledger.load().unwrap().migrated_bots.is_empty());

        ledger
            .append(|log| {
                log.started_at = Some(Utc::now());
                log.failed_bots.push(FailedRecord {
                    instance_id: InstanceId::from("b9"),
                    user_id: UserId::from("U"),
                    timestamp: Utc::now(),
                    error: "probe timed out".into(),
                });
            })
            .unwrap();

        let log = ledger.load().unwrap();
        assert!(log.started_at.is_some());
        assert_eq!(log.failed_bots.len(), 1);

        let raw =
            std::fs::read_to_string(dir.path().join(MIGRATION_LOG)).unwrap();
        assert!(raw.contains("\"failedBots\""));
        assert!(raw.contains("\"rollbackHistory\""));
    }

    #[test]
    fn corrupt_ledger_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MIGRATION_LOG), "{oops").unwrap();
        let ledger = MigrationLedger::new(dir.path());
        assert!(matches!(
            ledger.load(),
            Err(SvcError::LedgerParse { .. })
        ));
    }
}
