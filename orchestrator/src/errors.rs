//! Error taxonomy of the orchestrator core.

use std::path::PathBuf;

use snafu::Snafu;

use crate::core::{InstanceId, PoolId, UserId};
use runtime::RuntimeError;

/// Common error type of the control-plane operations. Input errors mutate
/// nothing; runtime errors carry the driver failure as their source.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
#[allow(missing_docs)]
pub enum SvcError {
    #[snafu(display("A userId is required to place instance '{}'", instance))]
    MissingUserId { instance: InstanceId },
    #[snafu(display(
        "Invalid initialBalance {} for instance '{}'",
        balance,
        instance
    ))]
    InvalidBalance { instance: InstanceId, balance: f64 },
    #[snafu(display("Instance '{}' is not mapped to any pool", instance))]
    UnknownInstance { instance: InstanceId },
    #[snafu(display(
        "Pool '{}' is mapped but no longer registered; reconciliation needed",
        pool
    ))]
    PoolMissing { pool: PoolId },
    #[snafu(display(
        "Pool container '{}' is not yet healthy, retry shortly",
        pool
    ))]
    PoolNotReady { pool: PoolId },
    #[snafu(display("Pool '{}' has no free port left in its range", pool))]
    NoFreePort { pool: PoolId },
    #[snafu(display("Failed to create a pool for user '{}': {}", user, source))]
    PoolCreate { user: UserId, source: RuntimeError },
    #[snafu(display("Container runtime request failed: {}", source))]
    Runtime { source: RuntimeError },
    #[snafu(display(
        "Supervisor '{}' in pool '{}' failed: {}",
        action,
        pool,
        detail
    ))]
    Supervisor {
        pool: PoolId,
        action: String,
        detail: String,
    },
    #[snafu(display("Failed to write state file '{}'", path.display()))]
    StoreWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to encode state file"))]
    StoreEncode { source: serde_json::Error },
    #[snafu(display("Failed to prepare directory '{}'", path.display()))]
    LayoutIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "Failed to access files of instance '{}': {}",
        instance,
        source
    ))]
    ConfigIo {
        instance: InstanceId,
        source: std::io::Error,
    },
    #[snafu(display("Config of instance '{}' is not valid JSON", instance))]
    ConfigParse {
        instance: InstanceId,
        source: serde_json::Error,
    },
    #[snafu(display("No instance directory found for '{}'", instance))]
    InstanceDirMissing { instance: InstanceId },
    #[snafu(display(
        "Migrated instance '{}' failed verification: {}",
        instance,
        reason
    ))]
    MigrationVerify { instance: InstanceId, reason: String },
    #[snafu(display("Failed to access migration log '{}'", path.display()))]
    LedgerIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Migration log '{}' is not valid JSON", path.display()))]
    LedgerParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display(
        "Instance '{}' has no completed migration to roll back",
        instance
    ))]
    NotMigrated { instance: InstanceId },
}

impl From<RuntimeError> for SvcError {
    fn from(source: RuntimeError) -> Self {
        SvcError::Runtime { source }
    }
}
