//! Health classification, typed events and bounded automatic recovery.

pub mod ledger;
pub mod monitor;

pub use ledger::{RestartDecision, RestartLedger, RestartScope};
pub use monitor::HealthMonitor;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{InstanceId, PoolId};

/// Classification of one subject or of the whole deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Finding about one pool container.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolHealth {
    pub pool_id: PoolId,
    pub state: HealthState,
    pub recoverable: bool,
    pub detail: String,
}

/// Finding about one bot program.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotHealth {
    pub instance_id: InstanceId,
    pub pool_id: PoolId,
    pub state: HealthState,
    pub recoverable: bool,
    pub detail: String,
}

/// Recovery performed (or skipped) during one sweep.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RecoveryAction {
    PoolRestarted { pool: PoolId, attempt: u32 },
    PoolSkipped { pool: PoolId, cooldown_remaining_ms: u64 },
    PoolFailed { pool: PoolId, error: String },
    BotRestarted { instance: InstanceId, attempt: u32 },
    BotSkipped { instance: InstanceId, cooldown_remaining_ms: u64 },
    BotFailed { instance: InstanceId, error: String },
}

/// Result of one full sweep.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthState,
    pub pools: Vec<PoolHealth>,
    pub bots: Vec<BotHealth>,
    pub recoveries: Vec<RecoveryAction>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Deployment summary: unhealthy when any pool is unhealthy or more
    /// than 20 % of bots are; degraded when anything is degraded.
    pub fn summarize(pools: &[PoolHealth], bots: &[BotHealth]) -> HealthState {
        let pool_unhealthy = pools
            .iter()
            .any(|p| p.state == HealthState::Unhealthy);
        let bots_unhealthy =
            bots.iter().filter(|b| b.state == HealthState::Unhealthy).count();
        if pool_unhealthy
            || (!bots.is_empty()
                && bots_unhealthy * 5 > bots.len())
        {
            return HealthState::Unhealthy;
        }
        let degraded = pools.iter().any(|p| p.state == HealthState::Degraded)
            || bots.iter().any(|b| b.state == HealthState::Degraded)
            || bots_unhealthy > 0;
        if degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

/// Fixed set of events the monitor broadcasts. Subscribers are independent;
/// a lagging receiver only loses its own backlog.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// One sweep finished.
    CheckComplete {
        status: HealthState,
        pools: usize,
        bots: usize,
        unhealthy: usize,
        recoveries: usize,
    },
    PoolRecoveryAttempted {
        pool: PoolId,
        attempt: u32,
    },
    PoolRecoverySkipped {
        pool: PoolId,
        cooldown_remaining: Duration,
    },
    PoolRecoveryFailed {
        pool: PoolId,
        error: String,
    },
    BotRecoveryAttempted {
        instance: InstanceId,
        attempt: u32,
    },
    BotRecoverySkipped {
        instance: InstanceId,
        cooldown_remaining: Duration,
    },
    BotRecoveryFailed {
        instance: InstanceId,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(state: HealthState) -> PoolHealth {
        PoolHealth {
            pool_id: PoolId::from("u-pool-1"),
            state,
            recoverable: true,
            detail: String::new(),
        }
    }

    fn bot(state: HealthState) -> BotHealth {
        BotHealth {
            instance_id: InstanceId::from("b"),
            pool_id: PoolId::from("u-pool-1"),
            state,
            recoverable: true,
            detail: String::new(),
        }
    }

    #[test]
    fn summary_rules() {
        use HealthState::*;
        assert_eq!(HealthReport::summarize(&[pool(Healthy)], &[]), Healthy);
        assert_eq!(
            HealthReport::summarize(&[pool(Unhealthy)], &[]),
            Unhealthy
        );
        assert_eq!(
            HealthReport::summarize(&[pool(Healthy)], &[bot(Degraded)]),
            Degraded
        );
        // 1 of 5 bots unhealthy is exactly 20 %: not over the line
        let bots: Vec<_> = (0..4)
            .map(|_| bot(Healthy))
            .chain(std::iter::once(bot(Unhealthy)))
            .collect();
        assert_eq!(
            HealthReport::summarize(&[pool(Healthy)], &bots),
            Degraded
        );
        // 2 of 5 is over
        let bots: Vec<_> = (0..3)
            .map(|_| bot(Healthy))
            .chain((0..2).map(|_| bot(Unhealthy)))
            .collect();
        assert_eq!(
            HealthReport::summarize(&[pool(Healthy)], &bots),
            Unhealthy
        );
    }
}
