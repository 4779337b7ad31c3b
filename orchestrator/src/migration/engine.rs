//! The migration engine: moves dedicated bots into pools with verification
//! and rollback, recording every outcome in the migration log.

use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use snafu::ensure;

use runtime::ContainerRuntime;

use crate::{
    config::Settings,
    core::{BotConfig, InstanceId, PoolId, Slot, UserId},
    errors::{MigrationVerify, NotMigrated, SvcError},
    mapper::{dedicated_container_name, dedicated_manifest},
    migration::{
        FailedRecord,
        MigrationLedger,
        MigrationLog,
        MigrationRecord,
        RollbackRecord,
        SlotSummary,
    },
    pool::{layout, manager::PoolManager, supervisor::{ProgramState, Supervisor}},
};

/// A dedicated bot found on disk.
#[derive(Debug, Clone)]
pub struct LegacyBot {
    pub instance_id: InstanceId,
    pub user_id: UserId,
    pub dir: PathBuf,
    pub config: BotConfig,
    pub running: bool,
}

/// Simulated placement of a dry run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedPlacement {
    pub instance_id: InstanceId,
    pub user_id: UserId,
    pub pool_id: PoolId,
    pub port: u16,
}

/// Outcome of a dry run: where every legacy bot would land.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub bots: Vec<PlannedPlacement>,
    pub new_pools: usize,
}

/// Outcome of an executed migration run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub migrated: Vec<InstanceId>,
    pub failed: Vec<FailedRecord>,
}

/// Operator tool migrating dedicated bots into pools.
pub struct MigrationEngine {
    manager: Arc<PoolManager>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: Settings,
    ledger: MigrationLedger,
    http: reqwest::Client,
}

impl MigrationEngine {
    /// New engine over the manager and driver.
    pub fn new(
        manager: Arc<PoolManager>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: Settings,
    ) -> Self {
        Self {
            ledger: MigrationLedger::new(&settings.root),
            manager,
            runtime,
            settings,
            http: reqwest::Client::new(),
        }
    }

    /// The migration log, for `--status`.
    pub fn status(&self) -> Result<MigrationLog, SvcError> {
        self.ledger.load()
    }

    /// Scan the filesystem for dedicated bots: per-user instance dirs with
    /// a config file, skipping pools, backups, already-pooled and
    /// already-migrated instances. Cross-references the runtime for whether
    /// each dedicated container currently runs.
    pub async fn discover(&self) -> Result<Vec<LegacyBot>, SvcError> {
        let log = self.ledger.load()?;
        let mut bots = vec![];
        let users = match std::fs::read_dir(&self.settings.root) {
            Ok(users) => users,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(bots)
            }
            Err(e) => {
                return Err(SvcError::LayoutIo {
                    path: self.settings.root.clone(),
                    source: e,
                })
            }
        };
        for user_entry in users.flatten() {
            if !user_entry.path().is_dir() {
                continue;
            }
            let user =
                UserId::from(user_entry.file_name().to_string_lossy().as_ref());
            if user.as_str() == "strategies" {
                continue;
            }
            let instances = match std::fs::read_dir(user_entry.path()) {
                Ok(instances) => instances,
                Err(e) => {
                    tracing::warn!(
                        "Skipping unreadable user dir '{}': {}",
                        user_entry.path().display(),
                        e
                    );
                    continue;
                }
            };
            for entry in instances.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.contains("-pool-") || name.ends_with(".backup") {
                    continue;
                }
                let config_path = entry.path().join("config.json");
                if !config_path.is_file() {
                    continue;
                }
                let instance = InstanceId::from(name);
                if self.manager.contains(&instance).await
                    || log.is_migrated(&instance)
                {
                    continue;
                }
                let config = match layout::read_config(&config_path) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(
                            "Skipping '{}', unreadable config: {}",
                            instance,
                            e
                        );
                        continue;
                    }
                };
                let running = self
                    .runtime
                    .container_inspect(&dedicated_container_name(&config))
                    .await
                    .map(|s| s.is_running())
                    .unwrap_or(false);
                bots.push(LegacyBot {
                    instance_id: instance,
                    user_id: user.clone(),
                    dir: entry.path(),
                    config,
                    running,
                });
            }
        }
        bots.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(bots)
    }

    /// Simulate placement of every discovered legacy bot without touching
    /// the runtime: which pools would be used or created, which port each
    /// bot would get.
    pub async fn dry_run(&self) -> Result<MigrationPlan, SvcError> {
        let bots = self.discover().await?;
        let mut plan = MigrationPlan::default();

        // capacity snapshot: (pool id, free ports) per user, plus the
        // global port high-water mark for simulated new pools
        let pools = self.manager.pools().await;
        let mut port_ceiling = pools
            .iter()
            .map(|p| p.port_end())
            .max()
            .unwrap_or(self.settings.base_port)
            .max(self.settings.base_port);
        let mut capacity: std::collections::HashMap<
            UserId,
            Vec<(PoolId, Vec<u16>)>,
        > = std::collections::HashMap::new();
        for pool in &pools {
            let mut used = vec![];
            for instance in &pool.bots {
                if let Some(slot) = self.manager.slot_of(instance).await {
                    used.push(slot.port);
                }
            }
            let free: Vec<u16> = (pool.base_port..pool.port_end())
                .filter(|p| !used.contains(p))
                .take(pool.max_bots - pool.bots.len())
                .collect();
            capacity
                .entry(pool.user_id.clone())
                .or_default()
                .push((pool.id.clone(), free));
        }
        let mut next_number: std::collections::HashMap<UserId, u32> =
            std::collections::HashMap::new();

        for bot in &bots {
            let pools = capacity.entry(bot.user_id.clone()).or_default();
            let placed = pools
                .iter_mut()
                .find(|(_, free)| !free.is_empty())
                .map(|(id, free)| (id.clone(), free.remove(0)));
            let (pool_id, port) = match placed {
                Some(found) => found,
                None => {
                    let number = next_number
                        .entry(bot.user_id.clone())
                        .or_insert_with(|| {
                            pools
                                .iter()
                                .map(|(id, _)| id.number())
                                .max()
                                .map(|n| n + 1)
                                .unwrap_or(1)
                        });
                    let pool_id = PoolId::for_user(&bot.user_id, *number);
                    *number += 1;
                    plan.new_pools += 1;
                    let base = port_ceiling;
                    port_ceiling +=
                        self.settings.max_bots_per_container as u16;
                    let free: Vec<u16> = (base + 1
                        ..base + self.settings.max_bots_per_container as u16)
                        .collect();
                    pools.push((pool_id.clone(), free));
                    (pool_id, base)
                }
            };
            plan.bots.push(PlannedPlacement {
                instance_id: bot.instance_id.clone(),
                user_id: bot.user_id.clone(),
                pool_id,
                port,
            });
        }
        Ok(plan)
    }

    /// Migrate every discovered legacy bot. Per-bot failures are recorded
    /// and iteration continues.
    pub async fn execute(&self) -> Result<MigrationReport, SvcError> {
        let bots = self.discover().await?;
        self.ledger.append(|log| {
            if log.started_at.is_none() {
                log.started_at = Some(Utc::now());
            }
        })?;

        let mut report = MigrationReport::default();
        for bot in bots {
            tracing::info!(
                "Migrating '{}' of user '{}' into a pool",
                bot.instance_id,
                bot.user_id
            );
            match self.migrate_bot(&bot).await {
                Ok(slot) => {
                    self.ledger.append(|log| {
                        log.migrated_bots.push(MigrationRecord {
                            instance_id: bot.instance_id.clone(),
                            user_id: bot.user_id.clone(),
                            timestamp: Utc::now(),
                            from_mode: "dedicated".into(),
                            to_mode: "pooled".into(),
                            slot: SlotSummary {
                                pool_id: slot.pool_id.clone(),
                                slot_index: slot.slot_index,
                                port: slot.port,
                            },
                        });
                    })?;
                    report.migrated.push(bot.instance_id.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        "Migration of '{}' failed: {}; restoring dedicated",
                        bot.instance_id,
                        e
                    );
                    self.restore_dedicated(&bot).await;
                    let record = FailedRecord {
                        instance_id: bot.instance_id.clone(),
                        user_id: bot.user_id.clone(),
                        timestamp: Utc::now(),
                        error: e.to_string(),
                    };
                    self.ledger.append(|log| {
                        log.failed_bots.push(record.clone());
                    })?;
                    report.failed.push(record);
                }
            }
        }

        self.ledger.append(|log| {
            log.completed_at = Some(Utc::now());
        })?;
        Ok(report)
    }

    async fn migrate_bot(&self, bot: &LegacyBot) -> Result<Slot, SvcError> {
        // preserve the original config next to the instance dir
        let backup_dir = bot
            .dir
            .with_file_name(format!("{}.backup", bot.instance_id));
        std::fs::create_dir_all(&backup_dir).map_err(|source| {
            SvcError::LayoutIo {
                path: backup_dir.clone(),
                source,
            }
        })?;
        std::fs::copy(
            bot.dir.join("config.json"),
            backup_dir.join("config.json"),
        )
        .map_err(|source| SvcError::ConfigIo {
            instance: bot.instance_id.clone(),
            source,
        })?;

        if bot.running {
            let name = dedicated_container_name(&bot.config);
            if let Err(e) = self.runtime.container_stop(&name).await {
                tracing::warn!(
                    "Stopping dedicated '{}' reported: {}",
                    name,
                    e
                );
            }
        }

        self.manager
            .allocate(&bot.instance_id, &bot.user_id, &bot.config)
            .await?;
        let slot = self
            .manager
            .start(&bot.instance_id, &bot.config)
            .await?;

        tokio::time::sleep(self.settings.migration_stabilize).await;
        self.verify(&slot, &bot.config).await?;

        let name = dedicated_container_name(&bot.config);
        if let Err(e) = self.runtime.container_down(&bot.dir, &name).await {
            tracing::warn!(
                "Removing dedicated container '{}' reported: {}",
                name,
                e
            );
        }
        Ok(slot)
    }

    /// Post-start liveness: supervisor must report the program RUNNING;
    /// when the bot carries API credentials, an authenticated ping must
    /// succeed as well.
    async fn verify(
        &self,
        slot: &Slot,
        config: &BotConfig,
    ) -> Result<(), SvcError> {
        let pool = self.manager.pool(&slot.pool_id).await.ok_or_else(|| {
            SvcError::PoolMissing {
                pool: slot.pool_id.clone(),
            }
        })?;
        let sup = Supervisor::new(
            self.runtime.clone(),
            &pool.container_name,
            &pool.id,
        );
        let state = sup.program_state(&slot.instance_id).await?;
        ensure!(
            matches!(
                state,
                Some(ProgramState::Running) | Some(ProgramState::Starting)
            ),
            MigrationVerify {
                instance: slot.instance_id.clone(),
                reason: format!(
                    "supervisor reports {:?} after start",
                    state
                ),
            }
        );

        if let Some(auth) = &config.auth {
            let connection = self
                .manager
                .connection_of(&slot.instance_id)
                .await
                .ok_or_else(|| SvcError::UnknownInstance {
                    instance: slot.instance_id.clone(),
                })?;
            let url = format!("{}/health", connection.url);
            let response = self
                .http
                .get(&url)
                .basic_auth(&auth.username, Some(&auth.password))
                .timeout(self.settings.ping_timeout)
                .send()
                .await;
            let ok = response.map(|r| r.status().is_success()).unwrap_or(false);
            ensure!(
                ok,
                MigrationVerify {
                    instance: slot.instance_id.clone(),
                    reason: format!("bot API ping to {} failed", url),
                }
            );
        }
        Ok(())
    }

    /// Undo a half-applied migration: drop the pool placement and bring the
    /// original dedicated container back. Best-effort.
    async fn restore_dedicated(&self, bot: &LegacyBot) {
        if let Err(e) = self.manager.remove(&bot.instance_id).await {
            tracing::warn!(
                "Undoing pool placement of '{}' reported: {}",
                bot.instance_id,
                e
            );
        }
        let name = dedicated_container_name(&bot.config);
        match self.runtime.container_start(&name).await {
            Ok(()) => {}
            Err(runtime::RuntimeError::ContainerNotFound { .. }) => {
                let manifest =
                    dedicated_manifest(&self.settings, &bot.dir, &bot.config);
                if let Err(e) =
                    self.runtime.container_up(&bot.dir, &manifest).await
                {
                    tracing::error!(
                        "Failed to recreate dedicated '{}': {}",
                        name,
                        e
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to restart dedicated '{}': {}",
                    name,
                    e
                );
            }
        }
    }

    /// Roll a previously migrated bot back to its dedicated container.
    pub async fn rollback(
        &self,
        instance: &InstanceId,
    ) -> Result<(), SvcError> {
        let log = self.ledger.load()?;
        ensure!(log.is_migrated(instance), NotMigrated { instance });
        let record = log
            .migrated_bots
            .iter()
            .rev()
            .find(|r| &r.instance_id == instance)
            .cloned()
            .ok_or_else(|| SvcError::NotMigrated {
                instance: instance.clone(),
            })?;

        if let Err(e) = self.manager.stop(instance).await {
            tracing::warn!("Stopping pooled '{}' reported: {}", instance, e);
        }
        self.manager.remove(instance).await?;

        let dir = self
            .manager
            .layout()
            .instance_dir(&record.user_id, instance);
        let backup = dir.with_file_name(format!("{}.backup", instance));
        if backup.join("config.json").is_file() {
            std::fs::create_dir_all(&dir).map_err(|source| {
                SvcError::LayoutIo {
                    path: dir.clone(),
                    source,
                }
            })?;
            std::fs::copy(
                backup.join("config.json"),
                dir.join("config.json"),
            )
            .map_err(|source| SvcError::ConfigIo {
                instance: instance.clone(),
                source,
            })?;
        }
        let config = layout::read_config(&dir.join("config.json"))?;

        let bot = LegacyBot {
            instance_id: instance.clone(),
            user_id: record.user_id.clone(),
            dir,
            config,
            running: false,
        };
        self.restore_dedicated(&bot).await;

        self.ledger.append(|log| {
            log.rollback_history.push(RollbackRecord {
                instance_id: instance.clone(),
                timestamp: Utc::now(),
                outcome: "restored dedicated container".into(),
            });
        })?;
        tracing::info!("Rolled back '{}' to its dedicated container", instance);
        Ok(())
    }
}
