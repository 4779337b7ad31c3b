//! The bot-to-container mapper: the only surface callers use.
//!
//! Resolves `instanceId → Connection` uniformly across pooled and dedicated
//! placement and forwards lifecycle operations to whichever path owns the
//! bot. The placement distinction is a tagged variant erased at this
//! boundary.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use snafu::{ensure, OptionExt};
use tokio::sync::RwLock;

use runtime::{ContainerManifest, ContainerRuntime};

use crate::{
    config::Settings,
    core::{BotAuth, BotConfig, InstanceId, UserId},
    errors::{InvalidBalance, MissingUserId, SvcError, UnknownInstance},
    pool::{layout, manager::PoolManager},
};

/// How long resolved connection info is served from cache.
const CONNECTION_TTL: Duration = Duration::from_secs(60);

/// Where a bot lives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum Placement {
    /// Shared pool container.
    Pooled {
        pool_id: crate::core::PoolId,
        slot_index: usize,
    },
    /// Legacy one-container-per-bot placement.
    Dedicated { container_name: String },
}

/// Resolved endpoint of a bot, ready for request proxying.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub instance_id: InstanceId,
    pub host: String,
    pub port: u16,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<BotAuth>,
    pub placement: Placement,
}

#[derive(Debug, Clone)]
struct CachedConnection {
    connection: Connection,
    fetched: Instant,
}

/// Uniform façade over pooled and dedicated bots.
pub struct Mapper {
    manager: Arc<PoolManager>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: Settings,
    cache: RwLock<HashMap<InstanceId, CachedConnection>>,
}

impl Mapper {
    /// New mapper over a pool manager and the runtime driver.
    pub fn new(
        manager: Arc<PoolManager>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: Settings,
    ) -> Self {
        Self {
            manager,
            runtime,
            settings,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve connection info for an instance, whatever its placement.
    /// `None` when the bot is unknown to both paths.
    pub async fn resolve(
        &self,
        instance: &InstanceId,
    ) -> Result<Option<Connection>, SvcError> {
        if let Some(cached) = self.cache.read().await.get(instance) {
            if cached.fetched.elapsed() < CONNECTION_TTL {
                return Ok(Some(cached.connection.clone()));
            }
        }

        let connection = if let Some(pooled) =
            self.manager.connection_of(instance).await
        {
            let auth = self
                .find_instance_dir(instance)
                .and_then(|dir| layout::read_config(&dir.join("config.json")).ok())
                .and_then(|config| config.auth);
            Some(Connection {
                instance_id: instance.clone(),
                host: pooled.host,
                port: pooled.port,
                url: pooled.url,
                auth,
                placement: Placement::Pooled {
                    pool_id: pooled.pool_id,
                    slot_index: pooled.slot_index,
                },
            })
        } else {
            self.resolve_dedicated(instance)?
        };

        if let Some(connection) = &connection {
            self.cache.write().await.insert(
                instance.clone(),
                CachedConnection {
                    connection: connection.clone(),
                    fetched: Instant::now(),
                },
            );
        }
        Ok(connection)
    }

    fn resolve_dedicated(
        &self,
        instance: &InstanceId,
    ) -> Result<Option<Connection>, SvcError> {
        let dir = match self.find_instance_dir(instance) {
            Some(dir) => dir,
            None => return Ok(None),
        };
        let config = layout::read_config(&dir.join("config.json"))?;
        let container_name = dedicated_container_name(&config);
        let host = self.settings.resolve_host(&container_name);
        Ok(Some(Connection {
            instance_id: instance.clone(),
            url: format!("http://{}:{}", host, config.port),
            host,
            port: config.port,
            auth: config.auth,
            placement: Placement::Dedicated { container_name },
        }))
    }

    /// The instance directory of a bot: either the legacy path
    /// `{root}/{userId}/{instanceId}` or the pool path
    /// `{root}/{userId}/{poolId}/bots/{instanceId}`. First match wins.
    pub fn find_instance_dir(&self, instance: &InstanceId) -> Option<PathBuf> {
        let root = &self.settings.root;
        let users = std::fs::read_dir(root).ok()?;
        for user_entry in users.flatten() {
            if !user_entry.path().is_dir() {
                continue;
            }
            let legacy = user_entry.path().join(instance.as_str());
            if legacy.join("config.json").is_file() {
                return Some(legacy);
            }
            let pools = std::fs::read_dir(user_entry.path()).ok()?;
            for pool_entry in pools.flatten() {
                let pooled = pool_entry
                    .path()
                    .join("bots")
                    .join(instance.as_str());
                if pooled.join("config.json").is_file() {
                    return Some(pooled);
                }
            }
        }
        None
    }

    /// Provision a bot: pooled placement when pool mode is on, else a
    /// dedicated container of its own.
    pub async fn assign(
        &self,
        instance: &InstanceId,
        user: &UserId,
        config: &BotConfig,
    ) -> Result<Placement, SvcError> {
        ensure!(!user.is_empty(), MissingUserId { instance });
        if let Some(balance) = config.initial_balance {
            ensure!(
                balance >= 0.0,
                InvalidBalance {
                    instance,
                    balance,
                }
            );
        }

        if self.settings.pool_mode_enabled {
            let slot = self.manager.allocate(instance, user, config).await?;
            return Ok(Placement::Pooled {
                pool_id: slot.pool_id,
                slot_index: slot.slot_index,
            });
        }
        self.assign_dedicated(instance, user, config).await
    }

    async fn assign_dedicated(
        &self,
        instance: &InstanceId,
        user: &UserId,
        config: &BotConfig,
    ) -> Result<Placement, SvcError> {
        let dir = self.manager.layout().instance_dir(user, instance);
        std::fs::create_dir_all(&dir).map_err(|source| {
            SvcError::ConfigIo {
                instance: instance.clone(),
                source,
            }
        })?;
        let container_name = dedicated_container_name(config);
        let mut on_disk = config.clone();
        on_disk.instance_id = instance.clone();
        on_disk.user_id = user.clone();
        on_disk.container_name = Some(container_name.clone());
        if on_disk.port == 0 {
            on_disk.port = self.settings.base_port;
        }
        layout::write_config(&dir.join("config.json"), &on_disk)?;

        let manifest = dedicated_manifest(&self.settings, &dir, &on_disk);
        self.runtime
            .container_up(&dir, &manifest)
            .await
            .map_err(SvcError::from)?;
        tracing::info!(
            "Provisioned dedicated container '{}' for '{}'",
            container_name,
            instance
        );
        Ok(Placement::Dedicated { container_name })
    }

    /// Start a bot wherever it lives.
    pub async fn start(
        &self,
        instance: &InstanceId,
        config: &BotConfig,
    ) -> Result<(), SvcError> {
        if self.manager.contains(instance).await {
            self.manager.start(instance, config).await?;
            return Ok(());
        }
        let connection = self
            .resolve_dedicated(instance)?
            .context(UnknownInstance { instance })?;
        match connection.placement {
            Placement::Dedicated { container_name } => self
                .runtime
                .container_start(&container_name)
                .await
                .map_err(SvcError::from),
            Placement::Pooled { .. } => Ok(()),
        }
    }

    /// Stop a bot wherever it lives. Best-effort.
    pub async fn stop(&self, instance: &InstanceId) -> Result<(), SvcError> {
        if self.manager.contains(instance).await {
            return self.manager.stop(instance).await;
        }
        if let Some(connection) = self.resolve_dedicated(instance)? {
            if let Placement::Dedicated { container_name } =
                connection.placement
            {
                if let Err(e) =
                    self.runtime.container_stop(&container_name).await
                {
                    tracing::warn!(
                        "Stopping dedicated '{}' reported: {}",
                        container_name,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// Remove a bot and its files wherever it lives. Best-effort.
    pub async fn remove(&self, instance: &InstanceId) -> Result<(), SvcError> {
        self.cache.write().await.remove(instance);
        if self.manager.contains(instance).await {
            return self.manager.remove(instance).await;
        }
        if let Some(dir) = self.find_instance_dir(instance) {
            if let Ok(config) = layout::read_config(&dir.join("config.json")) {
                let container_name = dedicated_container_name(&config);
                if let Err(e) =
                    self.runtime.container_down(&dir, &container_name).await
                {
                    tracing::warn!(
                        "Tearing down dedicated '{}' reported: {}",
                        container_name,
                        e
                    );
                }
            }
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(
                    "Failed to remove instance dir '{}': {}",
                    dir.display(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Drop a cached connection, forcing the next resolve to re-read.
    pub async fn invalidate(&self, instance: &InstanceId) {
        self.cache.write().await.remove(instance);
    }
}

/// Container name of a dedicated bot: the declared one, else `bot-{id}`.
pub fn dedicated_container_name(config: &BotConfig) -> String {
    config
        .container_name
        .clone()
        .unwrap_or_else(|| format!("bot-{}", config.instance_id))
}

/// Manifest of a dedicated bot container rooted at its instance dir.
pub(crate) fn dedicated_manifest(
    settings: &Settings,
    dir: &std::path::Path,
    config: &BotConfig,
) -> ContainerManifest {
    let container_name = dedicated_container_name(config);
    ContainerManifest::new(&container_name, &settings.runtime_image)
        .with_command(
            settings
                .bot_command
                .split_whitespace()
                .chain(["--config", "/app/bot/config.json"])
                .collect::<Vec<_>>(),
        )
        .with_bind(&dir.to_string_lossy(), "/app/bot")
        .with_bind_ro(
            &settings.strategies_dir.to_string_lossy(),
            "/app/strategies",
        )
        .with_port(config.port, config.port)
        .with_label(
            &format!("{}.user", runtime::LABEL_PREFIX),
            config.user_id.as_str(),
        )
        .with_label(
            &format!("{}.instance", runtime::LABEL_PREFIX),
            config.instance_id.as_str(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostMode;
    use runtime::fake::FakeRuntime;

    fn settings_at(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::with_root(dir);
        settings.host_mode = HostMode::Host;
        settings
    }

    fn mapper_with(
        settings: Settings,
    ) -> (Mapper, Arc<FakeRuntime>, Arc<PoolManager>) {
        let fake = Arc::new(FakeRuntime::new());
        let manager = PoolManager::init(settings.clone(), fake.clone());
        let mapper = Mapper::new(manager.clone(), fake.clone(), settings);
        (mapper, fake, manager)
    }

    fn dedicated_config(instance: &str, user: &str, port: u16) -> BotConfig {
        BotConfig {
            instance_id: InstanceId::from(instance),
            user_id: UserId::from(user),
            strategy: "momentum".into(),
            port,
            auth: Some(BotAuth {
                username: "bot".into(),
                password: "hunter2".into(),
            }),
            container_name: Some(format!("bot-{}", instance)),
            ..Default::default()
        }
    }

    #[test]
    fn host_policy_matrix() {
        let mut settings = Settings::default();
        settings.host_mode = HostMode::Host;
        assert_eq!(settings.resolve_host("u-pool-1"), "localhost");
        settings.host_mode = HostMode::Container;
        assert_eq!(settings.resolve_host("u-pool-1"), "u-pool-1");
        settings.host_override = Some("10.0.0.9".into());
        assert_eq!(settings.resolve_host("u-pool-1"), "10.0.0.9");
    }

    #[tokio::test]
    async fn assign_pooled_when_pool_mode_on() {
        let dir = tempfile::tempdir().unwrap();
        let (mapper, _, manager) =
            mapper_with(settings_at(dir.path()));
        let instance = InstanceId::from("b1");
        let placement = mapper
            .assign(&instance, &UserId::from("U"), &dedicated_config("b1", "U", 0))
            .await
            .unwrap();
        assert!(matches!(placement, Placement::Pooled { .. }));
        assert!(manager.contains(&instance).await);
    }

    #[tokio::test]
    async fn assign_dedicated_when_pool_mode_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_at(dir.path());
        settings.pool_mode_enabled = false;
        let (mapper, fake, manager) = mapper_with(settings);

        let instance = InstanceId::from("b1");
        let placement = mapper
            .assign(
                &instance,
                &UserId::from("U"),
                &dedicated_config("b1", "U", 9100),
            )
            .await
            .unwrap();
        assert_eq!(
            placement,
            Placement::Dedicated {
                container_name: "bot-b1".into()
            }
        );
        assert!(!manager.contains(&instance).await);
        assert!(fake.manifest("bot-b1").is_some());

        let dir_path = dir.path().join("U").join("b1");
        assert!(dir_path.join("config.json").is_file());
    }

    #[tokio::test]
    async fn assign_validates_input() {
        let dir = tempfile::tempdir().unwrap();
        let (mapper, _, _) = mapper_with(settings_at(dir.path()));
        let err = mapper
            .assign(
                &InstanceId::from("b1"),
                &UserId::from(""),
                &dedicated_config("b1", "", 0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SvcError::MissingUserId { .. }));

        let mut config = dedicated_config("b1", "U", 0);
        config.initial_balance = Some(-5.0);
        let err = mapper
            .assign(&InstanceId::from("b1"), &UserId::from("U"), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, SvcError::InvalidBalance { .. }));
    }

    #[tokio::test]
    async fn resolve_prefers_pool_placement() {
        let dir = tempfile::tempdir().unwrap();
        let (mapper, _, manager) =
            mapper_with(settings_at(dir.path()));
        let instance = InstanceId::from("b1");
        mapper
            .assign(&instance, &UserId::from("U"), &dedicated_config("b1", "U", 0))
            .await
            .unwrap();
        manager
            .start(&instance, &dedicated_config("b1", "U", 0))
            .await
            .unwrap();

        let connection = mapper.resolve(&instance).await.unwrap().unwrap();
        assert_eq!(connection.port, 9000);
        assert_eq!(connection.host, "localhost");
        assert_eq!(connection.url, "http://localhost:9000");
        assert!(matches!(connection.placement, Placement::Pooled { .. }));
        // credentials come off the bot's on-disk config
        assert_eq!(
            connection.auth,
            Some(BotAuth {
                username: "bot".into(),
                password: "hunter2".into(),
            })
        );
    }

    #[tokio::test]
    async fn resolve_falls_back_to_dedicated_config() {
        let dir = tempfile::tempdir().unwrap();
        let (mapper, _, _) = mapper_with(settings_at(dir.path()));

        let instance = InstanceId::from("b7");
        let legacy = dir.path().join("U").join("b7");
        std::fs::create_dir_all(&legacy).unwrap();
        layout::write_config(
            &legacy.join("config.json"),
            &dedicated_config("b7", "U", 9150),
        )
        .unwrap();

        let connection = mapper.resolve(&instance).await.unwrap().unwrap();
        assert_eq!(connection.port, 9150);
        assert_eq!(
            connection.placement,
            Placement::Dedicated {
                container_name: "bot-b7".into()
            }
        );
    }

    #[tokio::test]
    async fn resolve_unknown_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (mapper, _, _) = mapper_with(settings_at(dir.path()));
        assert!(mapper
            .resolve(&InstanceId::from("ghost"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dedicated_lifecycle_via_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_at(dir.path());
        settings.pool_mode_enabled = false;
        let (mapper, fake, _) = mapper_with(settings);

        let instance = InstanceId::from("b1");
        let config = dedicated_config("b1", "U", 9100);
        mapper
            .assign(&instance, &UserId::from("U"), &config)
            .await
            .unwrap();

        mapper.stop(&instance).await.unwrap();
        assert_eq!(
            fake.status("bot-b1"),
            runtime::ContainerStatus::Stopped
        );
        mapper.start(&instance, &config).await.unwrap();
        assert_eq!(
            fake.status("bot-b1"),
            runtime::ContainerStatus::Running
        );
        mapper.remove(&instance).await.unwrap();
        assert_eq!(
            fake.status("bot-b1"),
            runtime::ContainerStatus::Missing
        );
        assert!(!dir.path().join("U").join("b1").exists());
    }
}
