//! Periodic reconciliation of observed health with bounded recovery.
//!
//! The monitor only reads placement state through the manager and drives
//! recoveries through the manager's write operations; it never allocates.
//! It holds no lock across driver calls, so a subject may disappear between
//! observation and recovery; "not found" outcomes are tolerated.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};

use runtime::{ContainerRuntime, ContainerStatus};

use crate::{
    config::Settings,
    core::{InstanceId, PoolId, PoolStatus},
    errors::SvcError,
    health::{
        BotHealth,
        HealthEvent,
        HealthReport,
        HealthState,
        PoolHealth,
        RecoveryAction,
        RestartDecision,
        RestartLedger,
        RestartScope,
    },
    pool::{
        manager::PoolManager,
        supervisor::{program_name, ProgramState, Supervisor},
    },
};

/// Single-instance periodic health reconciler.
pub struct HealthMonitor {
    manager: Arc<PoolManager>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: Settings,
    ledger: Mutex<RestartLedger>,
    events: broadcast::Sender<HealthEvent>,
    pool_states: RwLock<HashMap<PoolId, HealthState>>,
    bot_states: RwLock<HashMap<InstanceId, HealthState>>,
    stop: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl HealthMonitor {
    /// New monitor over the manager and driver; does not start the timer.
    pub fn new(
        manager: Arc<PoolManager>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: Settings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            ledger: Mutex::new(RestartLedger::new(
                settings.max_restart_attempts,
                settings.restart_cooldown,
            )),
            manager,
            runtime,
            settings,
            events,
            pool_states: RwLock::new(HashMap::new()),
            bot_states: RwLock::new(HashMap::new()),
            stop: std::sync::Mutex::new(None),
        })
    }

    /// Subscribe to the monitor's typed events. Every subscriber gets its
    /// own receiver; one lagging receiver does not affect the others.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Spawn the sweep timer.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let (tx, mut rx) = oneshot::channel();
        if let Ok(mut stop) = self.stop.lock() {
            *stop = Some(tx);
        }
        tokio::spawn(async move {
            // first sweep one full period after startup
            let period = monitor.settings.health_interval;
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = monitor.check_once().await;
                        tracing::debug!(
                            "Health sweep finished: {:?}, {} recoveries",
                            report.status,
                            report.recoveries.len()
                        );
                    }
                    _ = &mut rx => {
                        tracing::info!("Health monitor stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the sweep timer.
    pub fn shutdown(&self) {
        if let Ok(mut stop) = self.stop.lock() {
            if let Some(tx) = stop.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Last classification of a pool, if it was ever swept.
    pub async fn pool_health(&self, pool: &PoolId) -> Option<HealthState> {
        self.pool_states.read().await.get(pool).copied()
    }

    /// Last classification of a bot, if it was ever swept.
    pub async fn bot_health(
        &self,
        instance: &InstanceId,
    ) -> Option<HealthState> {
        self.bot_states.read().await.get(instance).copied()
    }

    /// Run one full sweep: classify every non-stopped pool and its bots,
    /// recover what is unhealthy-recoverable within the restart budget.
    pub async fn check_once(&self) -> HealthReport {
        let pools = self.manager.pools().await;
        let mut pool_findings: Vec<PoolHealth> = vec![];
        let mut bot_findings: Vec<BotHealth> = vec![];

        for pool in pools.iter().filter(|p| p.status != PoolStatus::Stopped) {
            let container = match self
                .runtime
                .container_inspect(&pool.container_name)
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    pool_findings.push(PoolHealth {
                        pool_id: pool.id.clone(),
                        state: HealthState::Unhealthy,
                        recoverable: true,
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            if container != ContainerStatus::Running {
                pool_findings.push(PoolHealth {
                    pool_id: pool.id.clone(),
                    state: HealthState::Unhealthy,
                    recoverable: true,
                    detail: match container {
                        ContainerStatus::Missing => "container missing".into(),
                        _ => "container not running".into(),
                    },
                });
                continue;
            }

            if let Ok(stats) = self
                .runtime
                .container_stats(&pool.container_name)
                .await
            {
                self.manager.record_pool_metrics(&pool.id, stats).await;
            }

            let sup = Supervisor::new(
                self.runtime.clone(),
                &pool.container_name,
                &pool.id,
            );
            let programs = match sup.status().await {
                Ok(programs) => programs,
                Err(e) => {
                    pool_findings.push(PoolHealth {
                        pool_id: pool.id.clone(),
                        state: HealthState::Degraded,
                        recoverable: true,
                        detail: format!("supervisor unreachable: {}", e),
                    });
                    continue;
                }
            };
            pool_findings.push(PoolHealth {
                pool_id: pool.id.clone(),
                state: HealthState::Healthy,
                recoverable: false,
                detail: String::new(),
            });

            let by_name: HashMap<String, ProgramState> = programs
                .into_iter()
                .map(|p| (p.name, p.state))
                .collect();
            for instance in &pool.bots {
                let (state, recoverable, detail) =
                    match by_name.get(&program_name(instance)) {
                        Some(ProgramState::Running)
                        | Some(ProgramState::Starting) => {
                            (HealthState::Healthy, false, String::new())
                        }
                        Some(
                            state @ (ProgramState::Stopped
                            | ProgramState::Fatal
                            | ProgramState::Backoff
                            | ProgramState::Exited),
                        ) => (
                            HealthState::Unhealthy,
                            true,
                            format!("{:?}", state),
                        ),
                        Some(ProgramState::Unknown) => (
                            HealthState::Degraded,
                            false,
                            "unknown supervisor state".into(),
                        ),
                        None => (
                            HealthState::Unhealthy,
                            true,
                            "not supervised".into(),
                        ),
                    };
                bot_findings.push(BotHealth {
                    instance_id: instance.clone(),
                    pool_id: pool.id.clone(),
                    state,
                    recoverable,
                    detail,
                });
            }
        }

        let mut recoveries = vec![];
        for finding in &pool_findings {
            if finding.state == HealthState::Unhealthy && finding.recoverable {
                recoveries
                    .push(self.recover_pool(&finding.pool_id).await);
            }
        }
        for finding in &bot_findings {
            if finding.state == HealthState::Unhealthy && finding.recoverable {
                if let Some(action) =
                    self.recover_bot(&finding.instance_id).await
                {
                    recoveries.push(action);
                }
            }
        }

        {
            let mut cache = self.pool_states.write().await;
            for finding in &pool_findings {
                cache.insert(finding.pool_id.clone(), finding.state);
            }
        }
        {
            let mut cache = self.bot_states.write().await;
            for finding in &bot_findings {
                cache.insert(finding.instance_id.clone(), finding.state);
            }
        }

        let status =
            HealthReport::summarize(&pool_findings, &bot_findings);
        let unhealthy = pool_findings
            .iter()
            .filter(|p| p.state == HealthState::Unhealthy)
            .count()
            + bot_findings
                .iter()
                .filter(|b| b.state == HealthState::Unhealthy)
                .count();
        let _ = self.events.send(HealthEvent::CheckComplete {
            status,
            pools: pool_findings.len(),
            bots: bot_findings.len(),
            unhealthy,
            recoveries: recoveries.len(),
        });
        if status != HealthState::Healthy {
            tracing::warn!(
                "Health sweep: {:?}, {} subjects unhealthy, {} recovery actions",
                status,
                unhealthy,
                recoveries.len()
            );
        }

        HealthReport {
            status,
            pools: pool_findings,
            bots: bot_findings,
            recoveries,
            checked_at: Utc::now(),
        }
    }

    async fn recover_pool(&self, pool: &PoolId) -> RecoveryAction {
        let decision = self
            .ledger
            .lock()
            .await
            .begin(RestartScope::Pool, pool.as_str());
        match decision {
            RestartDecision::Skip { cooldown_remaining } => {
                let _ = self.events.send(HealthEvent::PoolRecoverySkipped {
                    pool: pool.clone(),
                    cooldown_remaining,
                });
                tracing::info!(
                    "Recovery of pool '{}' skipped, {}ms of cooldown left",
                    pool,
                    cooldown_remaining.as_millis()
                );
                RecoveryAction::PoolSkipped {
                    pool: pool.clone(),
                    cooldown_remaining_ms: cooldown_remaining.as_millis()
                        as u64,
                }
            }
            RestartDecision::Attempt { attempt } => {
                match self.manager.restart_pool_container(pool).await {
                    Ok(()) => {
                        let _ = self.events.send(
                            HealthEvent::PoolRecoveryAttempted {
                                pool: pool.clone(),
                                attempt,
                            },
                        );
                        tracing::info!(
                            "Restarted pool container '{}' (attempt {})",
                            pool,
                            attempt
                        );
                        RecoveryAction::PoolRestarted {
                            pool: pool.clone(),
                            attempt,
                        }
                    }
                    Err(e) => {
                        let _ = self.events.send(
                            HealthEvent::PoolRecoveryFailed {
                                pool: pool.clone(),
                                error: e.to_string(),
                            },
                        );
                        tracing::warn!(
                            "Recovery of pool '{}' failed: {}",
                            pool,
                            e
                        );
                        RecoveryAction::PoolFailed {
                            pool: pool.clone(),
                            error: e.to_string(),
                        }
                    }
                }
            }
        }
    }

    async fn recover_bot(
        &self,
        instance: &InstanceId,
    ) -> Option<RecoveryAction> {
        let decision = self
            .ledger
            .lock()
            .await
            .begin(RestartScope::Bot, instance.as_str());
        match decision {
            RestartDecision::Skip { cooldown_remaining } => {
                let _ = self.events.send(HealthEvent::BotRecoverySkipped {
                    instance: instance.clone(),
                    cooldown_remaining,
                });
                tracing::info!(
                    "Recovery of bot '{}' skipped, {}ms of cooldown left",
                    instance,
                    cooldown_remaining.as_millis()
                );
                Some(RecoveryAction::BotSkipped {
                    instance: instance.clone(),
                    cooldown_remaining_ms: cooldown_remaining.as_millis()
                        as u64,
                })
            }
            RestartDecision::Attempt { attempt } => {
                match self.manager.restart(instance).await {
                    Ok(_) => {
                        let _ = self.events.send(
                            HealthEvent::BotRecoveryAttempted {
                                instance: instance.clone(),
                                attempt,
                            },
                        );
                        tracing::info!(
                            "Restarted bot '{}' (attempt {})",
                            instance,
                            attempt
                        );
                        Some(RecoveryAction::BotRestarted {
                            instance: instance.clone(),
                            attempt,
                        })
                    }
                    // the subject vanished between observation and recovery
                    Err(SvcError::UnknownInstance { .. }) => {
                        tracing::debug!(
                            "Bot '{}' disappeared before recovery",
                            instance
                        );
                        None
                    }
                    Err(e) => {
                        let _ = self.events.send(
                            HealthEvent::BotRecoveryFailed {
                                instance: instance.clone(),
                                error: e.to_string(),
                            },
                        );
                        tracing::warn!(
                            "Recovery of bot '{}' failed: {}",
                            instance,
                            e
                        );
                        Some(RecoveryAction::BotFailed {
                            instance: instance.clone(),
                            error: e.to_string(),
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::HostMode,
        core::{BotConfig, UserId},
    };
    use runtime::{fake::FakeRuntime, ContainerStats};

    fn settings_at(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::with_root(dir);
        settings.host_mode = HostMode::Host;
        settings
    }

    async fn pool_with_bot(
        dir: &std::path::Path,
    ) -> (Arc<HealthMonitor>, Arc<PoolManager>, Arc<FakeRuntime>) {
        let settings = settings_at(dir);
        let fake = Arc::new(FakeRuntime::new());
        let manager = PoolManager::init(settings.clone(), fake.clone());
        manager
            .allocate(
                &InstanceId::from("b2"),
                &UserId::from("U"),
                &BotConfig::default(),
            )
            .await
            .unwrap();
        let monitor =
            HealthMonitor::new(manager.clone(), fake.clone(), settings);
        (monitor, manager, fake)
    }

    fn drain(
        rx: &mut broadcast::Receiver<HealthEvent>,
    ) -> Vec<HealthEvent> {
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn running_bots_are_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, manager, fake) = pool_with_bot(dir.path()).await;
        fake.respond(None, "status", "bot-b2  RUNNING  pid 9, uptime 0:01:00\n");
        fake.set_stats(
            "U-pool-1",
            ContainerStats {
                memory_mb: 512.0,
                cpu_pct: 12.5,
            },
        );

        let report = monitor.check_once().await;
        assert_eq!(report.status, HealthState::Healthy);
        assert_eq!(report.pools.len(), 1);
        assert_eq!(report.bots.len(), 1);
        assert!(report.recoveries.is_empty());
        assert_eq!(
            monitor.bot_health(&InstanceId::from("b2")).await,
            Some(HealthState::Healthy)
        );

        let pool = manager.pool(&PoolId::from("U-pool-1")).await.unwrap();
        assert_eq!(pool.metrics.memory_mb, 512.0);
        assert!(pool.metrics.updated_at.is_some());
    }

    #[tokio::test]
    async fn fatal_bot_recovers_until_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _, fake) = pool_with_bot(dir.path()).await;
        fake.respond(None, "status", "bot-b2  FATAL  Exited too quickly\n");
        let mut rx = monitor.subscribe();

        for _ in 0..4 {
            monitor.check_once().await;
        }

        let events = drain(&mut rx);
        let attempts = events
            .iter()
            .filter(|e| {
                matches!(e, HealthEvent::BotRecoveryAttempted { .. })
            })
            .count();
        assert_eq!(attempts, 3);
        let skipped: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                HealthEvent::BotRecoverySkipped {
                    cooldown_remaining, ..
                } => Some(*cooldown_remaining),
                _ => None,
            })
            .collect();
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0] > std::time::Duration::from_secs(0));
        assert_eq!(fake.execs_matching("restart bot-b2").len(), 3);
    }

    #[tokio::test]
    async fn stopped_container_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, manager, fake) = pool_with_bot(dir.path()).await;
        fake.set_status("U-pool-1", ContainerStatus::Stopped);
        let mut rx = monitor.subscribe();

        let report = monitor.check_once().await;
        assert_eq!(report.status, HealthState::Unhealthy);
        assert!(report
            .recoveries
            .iter()
            .any(|a| matches!(a, RecoveryAction::PoolRestarted { .. })));
        assert_eq!(fake.restart_count(), 1);
        assert_eq!(
            manager
                .pool(&PoolId::from("U-pool-1"))
                .await
                .unwrap()
                .status,
            PoolStatus::Running
        );
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            HealthEvent::PoolRecoveryAttempted { .. }
        )));
    }

    #[tokio::test]
    async fn unreachable_supervisor_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _, fake) = pool_with_bot(dir.path()).await;
        fake.fail_execs_for("U-pool-1");

        let report = monitor.check_once().await;
        assert_eq!(report.status, HealthState::Degraded);
        assert_eq!(report.pools[0].state, HealthState::Degraded);
        // degraded subjects are observed, not restarted
        assert!(report.recoveries.is_empty());
        assert_eq!(fake.restart_count(), 0);
    }

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _, fake) = pool_with_bot(dir.path()).await;
        fake.respond(None, "status", "bot-b2  RUNNING  pid 9, uptime 0:01:00\n");
        let mut first = monitor.subscribe();
        let mut second = monitor.subscribe();

        monitor.check_once().await;
        assert!(matches!(
            first.try_recv().unwrap(),
            HealthEvent::CheckComplete { .. }
        ));
        assert!(matches!(
            second.try_recv().unwrap(),
            HealthEvent::CheckComplete { .. }
        ));
    }
}
