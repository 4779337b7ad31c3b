//! The pool manager: single source of truth for pools, slots, ports and the
//! on-disk pool layout.
//!
//! Every mutating operation commits in memory under the state lock and then
//! persists; driver and supervisor I/O is never performed while the lock is
//! held. Allocations additionally serialize on a dedicated mutex so two
//! concurrent requests cannot create two pools where one suffices.

use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use snafu::{ensure, OptionExt, ResultExt};
use tokio::sync::{Mutex, RwLock};

use runtime::{
    ContainerManifest,
    ContainerRuntime,
    ContainerStats,
    ContainerStatus,
};

use crate::{
    config::Settings,
    core::{
        BotConfig,
        InstanceId,
        Pool,
        PoolId,
        PoolState,
        PoolStatus,
        Slot,
        SlotStatus,
        UserId,
    },
    errors::{
        MissingUserId,
        NoFreePort,
        PoolCreate,
        PoolMissing,
        PoolNotReady,
        SvcError,
        UnknownInstance,
    },
    pool::{
        layout::{
            PoolLayout,
            BOTS_MOUNT,
            LOGS_MOUNT,
            STRATEGIES_MOUNT,
            SUPERVISOR_MOUNT,
        },
        supervisor::{self, Supervisor},
    },
    store::StateStore,
};

/// Connection info of a pooled bot, as served to the request proxy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConnection {
    pub instance_id: InstanceId,
    pub host: String,
    pub port: u16,
    pub url: String,
    pub pool_id: PoolId,
    pub slot_index: usize,
    pub container_name: String,
}

/// Read-only roll-up over all pools.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolManagerStats {
    pub pools: usize,
    pub bots: usize,
    pub capacity: usize,
    pub pool_summaries: Vec<PoolSummary>,
}

/// Per-pool line of [`PoolManagerStats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub pool_id: PoolId,
    pub user_id: UserId,
    pub status: PoolStatus,
    pub bots: usize,
    pub max_bots: usize,
    pub memory_mb: f64,
    pub cpu_pct: f64,
}

/// One finding of a reconciliation pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ReconcileIssue {
    /// A mapped bot the supervisor no longer lists; its slot was dropped.
    NotRunning { instance: InstanceId, pool: PoolId },
    /// A supervised program with no corresponding slot. Left alone.
    OrphanedBot { program: String, pool: PoolId },
    /// The pool container is gone; the pool was marked stopped.
    PoolDown { pool: PoolId },
    /// The pool could not be checked.
    CheckFailed { pool: PoolId, detail: String },
}

/// Outcome of [`PoolManager::reconcile`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub pools_checked: usize,
    pub removed_stale_slots: usize,
    pub orphans_found: usize,
    pub errors: Vec<ReconcileIssue>,
}

/// Owner of the placement state and the supervisor-level lifecycle commands.
pub struct PoolManager {
    settings: Settings,
    runtime: Arc<dyn ContainerRuntime>,
    layout: PoolLayout,
    store: StateStore,
    state: RwLock<PoolState>,
    allocations: Mutex<()>,
    /// Per-instance lock serializing lifecycle commands for one bot.
    instance_locks: Mutex<std::collections::HashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl PoolManager {
    /// Construct the manager, re-hydrating persisted state when present.
    pub fn init(
        settings: Settings,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Arc<Self> {
        let store = StateStore::new(&settings.root);
        let state = store.load();
        Arc::new(Self {
            layout: PoolLayout::new(&settings),
            store,
            state: RwLock::new(state),
            allocations: Mutex::new(()),
            instance_locks: Mutex::new(Default::default()),
            settings,
            runtime,
        })
    }

    async fn instance_lock(&self, instance: &InstanceId) -> Arc<Mutex<()>> {
        self.instance_locks
            .lock()
            .await
            .entry(instance.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Persist the current state; called on orderly teardown.
    pub async fn shutdown(&self) {
        self.persist().await;
    }

    /// The settings the manager was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The layout helper rooted at the manager's data root.
    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    async fn persist(&self) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.updated_at = Utc::now();
            state.clone()
        };
        debug_assert!(
            snapshot.consistency_errors().is_empty(),
            "placement state inconsistent: {:?}",
            snapshot.consistency_errors()
        );
        if let Err(e) = self.store.save(&snapshot) {
            // keep serving from memory, the next mutation retries
            tracing::error!("Failed to persist pool state: {}", e);
        }
    }

    fn supervisor(&self, pool: &Pool) -> Supervisor {
        Supervisor::new(self.runtime.clone(), &pool.container_name, &pool.id)
    }

    async fn slot_and_pool(
        &self,
        instance: &InstanceId,
    ) -> Result<(Slot, Pool), SvcError> {
        let state = self.state.read().await;
        let slot = state
            .bot_mapping
            .get(instance)
            .cloned()
            .context(UnknownInstance { instance })?;
        let pool = state
            .pools
            .get(&slot.pool_id)
            .cloned()
            .context(PoolMissing {
                pool: slot.pool_id.clone(),
            })?;
        Ok((slot, pool))
    }

    /// Place a bot with a user, creating a pool when none has capacity.
    /// Idempotent: an already-mapped instance returns its existing slot.
    pub async fn allocate(
        &self,
        instance: &InstanceId,
        user: &UserId,
        _config: &BotConfig,
    ) -> Result<Slot, SvcError> {
        ensure!(!user.is_empty(), MissingUserId { instance });

        let _serialized = self.allocations.lock().await;

        if let Some(slot) = self.state.read().await.bot_mapping.get(instance) {
            tracing::debug!(
                "Instance '{}' already placed in '{}', returning its slot",
                instance,
                slot.pool_id
            );
            return Ok(slot.clone());
        }

        let candidate = self
            .state
            .read()
            .await
            .user_pools(user)
            .into_iter()
            .find(|p| p.status == PoolStatus::Running && p.has_capacity())
            .map(|p| p.id.clone());

        let pool_id = match candidate {
            Some(id) => id,
            None => self.create_pool(user).await?.id,
        };

        let slot = {
            let mut state = self.state.write().await;
            let (port, slot_index, host) = {
                let pool =
                    state.pools.get(&pool_id).context(PoolMissing {
                        pool: pool_id.clone(),
                    })?;
                let port = state.free_port(pool).context(NoFreePort {
                    pool: pool_id.clone(),
                })?;
                (
                    port,
                    pool.bots.len(),
                    self.settings.resolve_host(&pool.container_name),
                )
            };
            let slot = Slot {
                instance_id: instance.clone(),
                pool_id: pool_id.clone(),
                user_id: user.clone(),
                slot_index,
                port,
                status: SlotStatus::Pending,
                host,
            };
            if let Some(pool) = state.pools.get_mut(&pool_id) {
                pool.bots.push(instance.clone());
            }
            state.bot_mapping.insert(instance.clone(), slot.clone());
            slot
        };
        self.persist().await;

        tracing::info!(
            "Placed instance '{}' in '{}' slot {} port {}",
            instance,
            slot.pool_id,
            slot.slot_index,
            slot.port
        );
        Ok(slot)
    }

    /// Create, lay out and bring up a new pool for `user`. The pool is only
    /// registered once its container is up.
    async fn create_pool(&self, user: &UserId) -> Result<Pool, SvcError> {
        let pool = {
            let state = self.state.read().await;
            let number = state.next_pool_number(user);
            let id = PoolId::for_user(user, number);
            let base_port = state
                .pools
                .values()
                .map(|p| p.port_end())
                .max()
                .unwrap_or(self.settings.base_port)
                .max(self.settings.base_port);
            Pool {
                container_name: id.as_str().to_string(),
                workdir: self.layout.pool_dir(user, &id),
                id,
                user_id: user.clone(),
                max_bots: self.settings.max_bots_per_container,
                base_port,
                bots: vec![],
                status: PoolStatus::Running,
                metrics: Default::default(),
                created_at: Utc::now(),
            }
        };

        self.layout.create_pool_layout(&pool)?;

        let mut manifest = ContainerManifest::new(
            &pool.container_name,
            &self.settings.runtime_image,
        )
        .with_command(vec![
            "supervisord",
            "-n",
            "-c",
            "/etc/supervisor/supervisord.conf",
        ])
        .with_bind(
            &self.layout.supervisor_dir(&pool).to_string_lossy(),
            SUPERVISOR_MOUNT,
        )
        .with_bind(&self.layout.bots_dir(&pool).to_string_lossy(), BOTS_MOUNT)
        .with_bind(&self.layout.logs_dir(&pool).to_string_lossy(), LOGS_MOUNT)
        .with_bind_ro(
            &self.settings.strategies_dir.to_string_lossy(),
            STRATEGIES_MOUNT,
        )
        .with_label(&format!("{}.user", runtime::LABEL_PREFIX), user.as_str())
        .with_label(
            &format!("{}.pool", runtime::LABEL_PREFIX),
            pool.id.as_str(),
        );
        for offset in 0..pool.max_bots as u16 {
            let port = pool.base_port + offset;
            manifest = manifest.with_port(port, port);
        }

        self.runtime
            .container_up(&pool.workdir, &manifest)
            .await
            .context(PoolCreate { user })?;

        {
            let mut state = self.state.write().await;
            state.pools.insert(pool.id.clone(), pool.clone());
            state.next_pool_id += 1;
        }
        self.persist().await;

        tracing::info!(
            "Created pool '{}' for user '{}' with ports {}..{}",
            pool.id,
            user,
            pool.base_port,
            pool.port_end()
        );
        Ok(pool)
    }

    /// Write the bot's config and program file and start it under the
    /// supervisor.
    pub async fn start(
        &self,
        instance: &InstanceId,
        config: &BotConfig,
    ) -> Result<Slot, SvcError> {
        let lock = self.instance_lock(instance).await;
        let _serialized = lock.lock().await;
        let (slot, pool) = self.slot_and_pool(instance).await?;
        ensure!(
            pool.status == PoolStatus::Running,
            PoolNotReady { pool: pool.id.clone() }
        );

        let effective = self.pool_local_config(&slot, config);
        self.layout.write_bot_config(&pool, &effective)?;
        self.layout.write_program(&pool, &effective)?;

        let sup = self.supervisor(&pool);
        sup.reread().await?;
        sup.update().await?;
        sup.start(instance).await?;

        self.set_slot_status(instance, SlotStatus::Running).await;
        self.persist().await;
        tracing::info!(
            "Started instance '{}' in '{}' on port {}",
            instance,
            pool.id,
            slot.port
        );
        Ok(Slot {
            status: SlotStatus::Running,
            ..slot
        })
    }

    /// Stop the bot's program. Best-effort: an unmapped instance or a
    /// supervisor failure is logged, cleanup must make progress.
    pub async fn stop(&self, instance: &InstanceId) -> Result<(), SvcError> {
        let lock = self.instance_lock(instance).await;
        let _serialized = lock.lock().await;
        let found = self.slot_and_pool(instance).await;
        let (_, pool) = match found {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("Nothing to stop for '{}': {}", instance, e);
                return Ok(());
            }
        };
        if let Err(e) = self.supervisor(&pool).stop(instance).await {
            tracing::warn!("Stopping '{}' reported: {}", instance, e);
        }
        self.set_slot_status(instance, SlotStatus::Stopped).await;
        self.persist().await;
        Ok(())
    }

    /// Restart the bot's program.
    pub async fn restart(
        &self,
        instance: &InstanceId,
    ) -> Result<Slot, SvcError> {
        let lock = self.instance_lock(instance).await;
        let _serialized = lock.lock().await;
        let (slot, pool) = self.slot_and_pool(instance).await?;
        self.supervisor(&pool).restart(instance).await?;
        self.set_slot_status(instance, SlotStatus::Running).await;
        self.persist().await;
        Ok(Slot {
            status: SlotStatus::Running,
            ..slot
        })
    }

    /// Swap the bot's strategy on disk and restart it to pick the change up.
    pub async fn update_strategy(
        &self,
        instance: &InstanceId,
        strategy: &str,
    ) -> Result<Slot, SvcError> {
        let lock = self.instance_lock(instance).await;
        let _serialized = lock.lock().await;
        let (slot, pool) = self.slot_and_pool(instance).await?;

        let config_path = self
            .layout
            .pool_bot_dir(&pool, instance)
            .join("config.json");
        let mut config = if config_path.is_file() {
            crate::pool::layout::read_config(&config_path)?
        } else {
            BotConfig {
                instance_id: instance.clone(),
                user_id: slot.user_id.clone(),
                ..Default::default()
            }
        };
        config.strategy = strategy.to_string();
        let effective = self.pool_local_config(&slot, &config);
        self.layout.write_bot_config(&pool, &effective)?;
        self.layout.write_program(&pool, &effective)?;

        let sup = self.supervisor(&pool);
        sup.reread().await?;
        sup.update().await?;
        sup.restart(instance).await?;

        self.set_slot_status(instance, SlotStatus::Running).await;
        self.persist().await;
        tracing::info!(
            "Updated strategy of '{}' to '{}'",
            instance,
            effective.strategy
        );
        Ok(Slot {
            status: SlotStatus::Running,
            ..slot
        })
    }

    /// Remove a bot: program, files and mapping. Best-effort end to end.
    pub async fn remove(&self, instance: &InstanceId) -> Result<(), SvcError> {
        let lock = self.instance_lock(instance).await;
        let _serialized = lock.lock().await;
        let found = self.slot_and_pool(instance).await;
        match found {
            Ok((_, pool)) => {
                let sup = self.supervisor(&pool);
                if let Err(e) = sup.stop(instance).await {
                    tracing::warn!("Stopping '{}' reported: {}", instance, e);
                }
                if let Err(e) = sup.remove(instance).await {
                    tracing::warn!("Removing '{}' reported: {}", instance, e);
                }
                self.layout.remove_program(&pool, instance);
                if let Err(e) = sup.reread().await.and(sup.update().await) {
                    tracing::warn!(
                        "Supervisor refresh after removing '{}': {}",
                        instance,
                        e
                    );
                }
                self.layout.remove_bot_dir(&pool, instance);
            }
            Err(SvcError::UnknownInstance { .. }) => {
                tracing::debug!("Instance '{}' is not pooled", instance);
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    "Removing '{}' without a live pool: {}",
                    instance,
                    e
                );
            }
        }

        {
            let mut state = self.state.write().await;
            if let Some(slot) = state.bot_mapping.remove(instance) {
                if let Some(pool) = state.pools.get_mut(&slot.pool_id) {
                    pool.bots.retain(|id| id != instance);
                }
            }
        }
        self.instance_locks.lock().await.remove(instance);
        self.persist().await;
        tracing::info!("Removed instance '{}'", instance);
        Ok(())
    }

    /// Tear down pools with no bots left. Returns how many were removed;
    /// per-pool failures are logged and the pool retried on the next call.
    pub async fn cleanup_empty_pools(&self) -> usize {
        let empties: Vec<Pool> = {
            let state = self.state.read().await;
            state
                .pools
                .values()
                .filter(|p| p.bots.is_empty())
                .cloned()
                .collect()
        };
        let mut removed = 0;
        for pool in empties {
            match self
                .runtime
                .container_down(&pool.workdir, &pool.container_name)
                .await
            {
                Ok(()) => {
                    self.layout.remove_pool_dir(&pool);
                    self.state.write().await.pools.remove(&pool.id);
                    removed += 1;
                    tracing::info!("Removed empty pool '{}'", pool.id);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to tear down empty pool '{}': {}",
                        pool.id,
                        e
                    );
                }
            }
        }
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    /// Align state with what is actually running: drop slots whose program
    /// the supervisor no longer lists, record orphaned programs, mark pools
    /// whose container is gone.
    pub async fn reconcile(&self) -> ReconcileReport {
        let pools: Vec<Pool> =
            self.state.read().await.pools.values().cloned().collect();
        let mut report = ReconcileReport::default();
        let mut mutated = false;

        for pool in pools {
            report.pools_checked += 1;
            let status = match self
                .runtime
                .container_inspect(&pool.container_name)
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    report.errors.push(ReconcileIssue::CheckFailed {
                        pool: pool.id.clone(),
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            if status == ContainerStatus::Missing {
                {
                    let mut state = self.state.write().await;
                    if let Some(p) = state.pools.get_mut(&pool.id) {
                        if p.status != PoolStatus::Stopped {
                            p.status = PoolStatus::Stopped;
                            mutated = true;
                        }
                    }
                }
                report
                    .errors
                    .push(ReconcileIssue::PoolDown { pool: pool.id.clone() });
                continue;
            }
            if status != ContainerStatus::Running {
                // present but not running: left for health recovery
                report.errors.push(ReconcileIssue::CheckFailed {
                    pool: pool.id.clone(),
                    detail: "container not running".to_string(),
                });
                continue;
            }

            let programs = match self.supervisor(&pool).status().await {
                Ok(programs) => programs,
                Err(e) => {
                    report.errors.push(ReconcileIssue::CheckFailed {
                        pool: pool.id.clone(),
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            let listed: HashSet<String> =
                programs.iter().map(|p| p.name.clone()).collect();

            for instance in &pool.bots {
                if listed.contains(&supervisor::program_name(instance)) {
                    continue;
                }
                let mut state = self.state.write().await;
                state.bot_mapping.remove(instance);
                if let Some(p) = state.pools.get_mut(&pool.id) {
                    p.bots.retain(|id| id != instance);
                }
                mutated = true;
                report.removed_stale_slots += 1;
                report.errors.push(ReconcileIssue::NotRunning {
                    instance: instance.clone(),
                    pool: pool.id.clone(),
                });
                tracing::warn!(
                    "Dropped stale slot of '{}' from '{}'",
                    instance,
                    pool.id
                );
            }

            for program in &programs {
                let instance = match supervisor::instance_of(&program.name) {
                    Some(instance) => instance,
                    None => continue,
                };
                let known = self
                    .state
                    .read()
                    .await
                    .bot_mapping
                    .contains_key(&instance);
                if !known {
                    report.orphans_found += 1;
                    report.errors.push(ReconcileIssue::OrphanedBot {
                        program: program.name.clone(),
                        pool: pool.id.clone(),
                    });
                    tracing::warn!(
                        "Supervisor of '{}' runs '{}' which has no slot",
                        pool.id,
                        program.name
                    );
                }
            }
        }

        if mutated {
            self.persist().await;
        }
        report
    }

    /// Connection info for proxying to a pooled bot, `None` when unmapped.
    pub async fn connection_of(
        &self,
        instance: &InstanceId,
    ) -> Option<PoolConnection> {
        let state = self.state.read().await;
        let slot = state.bot_mapping.get(instance)?;
        let pool = state.pools.get(&slot.pool_id)?;
        let host = self.settings.resolve_host(&pool.container_name);
        Some(PoolConnection {
            instance_id: instance.clone(),
            url: format!("http://{}:{}", host, slot.port),
            host,
            port: slot.port,
            pool_id: pool.id.clone(),
            slot_index: slot.slot_index,
            container_name: pool.container_name.clone(),
        })
    }

    /// Whether the instance is placed in any pool.
    pub async fn contains(&self, instance: &InstanceId) -> bool {
        self.state.read().await.bot_mapping.contains_key(instance)
    }

    /// The slot of an instance, if mapped.
    pub async fn slot_of(&self, instance: &InstanceId) -> Option<Slot> {
        self.state.read().await.bot_mapping.get(instance).cloned()
    }

    /// Snapshot of every pool.
    pub async fn pools(&self) -> Vec<Pool> {
        self.state.read().await.pools.values().cloned().collect()
    }

    /// Snapshot of one pool.
    pub async fn pool(&self, pool: &PoolId) -> Option<Pool> {
        self.state.read().await.pools.get(pool).cloned()
    }

    /// Snapshot of a user's pools, in placement order.
    pub async fn user_pools(&self, user: &UserId) -> Vec<Pool> {
        self.state
            .read()
            .await
            .user_pools(user)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Read-only roll-up for operators and the gateway.
    pub async fn stats(&self) -> PoolManagerStats {
        let state = self.state.read().await;
        PoolManagerStats {
            pools: state.pools.len(),
            bots: state.bot_mapping.len(),
            capacity: state.pools.values().map(|p| p.max_bots).sum(),
            pool_summaries: state
                .pools
                .values()
                .map(|p| PoolSummary {
                    pool_id: p.id.clone(),
                    user_id: p.user_id.clone(),
                    status: p.status,
                    bots: p.bots.len(),
                    max_bots: p.max_bots,
                    memory_mb: p.metrics.memory_mb,
                    cpu_pct: p.metrics.cpu_pct,
                })
                .collect(),
        }
    }

    /// Restart a pool's shared container; used by health recovery.
    pub async fn restart_pool_container(
        &self,
        pool_id: &PoolId,
    ) -> Result<(), SvcError> {
        let pool = self
            .pool(pool_id)
            .await
            .context(PoolMissing { pool: pool_id })?;
        self.runtime
            .container_restart(&pool.container_name)
            .await
            .map_err(SvcError::from)?;
        {
            let mut state = self.state.write().await;
            if let Some(p) = state.pools.get_mut(pool_id) {
                p.status = PoolStatus::Running;
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Record last-observed container metrics; memory only, the values ride
    /// along with the next persisted mutation.
    pub async fn record_pool_metrics(
        &self,
        pool_id: &PoolId,
        stats: ContainerStats,
    ) {
        let mut state = self.state.write().await;
        if let Some(pool) = state.pools.get_mut(pool_id) {
            pool.metrics.memory_mb = stats.memory_mb;
            pool.metrics.cpu_pct = stats.cpu_pct;
            pool.metrics.updated_at = Some(Utc::now());
        }
    }

    fn pool_local_config(&self, slot: &Slot, config: &BotConfig) -> BotConfig {
        let instance = &slot.instance_id;
        BotConfig {
            instance_id: instance.clone(),
            user_id: slot.user_id.clone(),
            strategy: self.layout.resolve_strategy(&config.strategy),
            port: slot.port,
            db_path: Some(PoolLayout::bot_db_mount(instance)),
            log_path: Some(PoolLayout::bot_log_mount(instance)),
            initial_balance: config.initial_balance,
            auth: config.auth.clone(),
            container_name: None,
        }
    }

    async fn set_slot_status(&self, instance: &InstanceId, status: SlotStatus) {
        let mut state = self.state.write().await;
        if let Some(slot) = state.bot_mapping.get_mut(instance) {
            slot.status = status;
        }
    }
}
