//! On-disk layout of pools and bots.
//!
//! Per user: `{root}/{userId}/{userId}-pool-{N}/{supervisor,bots,logs}` plus
//! the container manifest; each bot owns `bots/{instanceId}/` with its
//! config, database and logs. Legacy dedicated bots live directly under
//! `{root}/{userId}/{instanceId}`.

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::{
    config::Settings,
    core::{BotConfig, InstanceId, Pool, PoolId, UserId},
    errors::{ConfigIo, ConfigParse, LayoutIo, SvcError},
    pool::supervisor,
};

/// Mount point of the supervisor config dir inside a pool container.
pub const SUPERVISOR_MOUNT: &str = "/etc/supervisor";
/// Mount point of the bots dir inside a pool container.
pub const BOTS_MOUNT: &str = "/app/bots";
/// Mount point of the logs dir inside a pool container.
pub const LOGS_MOUNT: &str = "/var/log/botpool";
/// Mount point of the strategy files inside a pool container.
pub const STRATEGIES_MOUNT: &str = "/app/strategies";

/// Path helpers and file writers for the pool directory tree.
#[derive(Debug, Clone)]
pub struct PoolLayout {
    root: PathBuf,
    strategies_dir: PathBuf,
    default_strategy: String,
    bot_command: String,
}

impl PoolLayout {
    /// Layout rooted at the configured data root.
    pub fn new(settings: &Settings) -> Self {
        Self {
            root: settings.root.clone(),
            strategies_dir: settings.strategies_dir.clone(),
            default_strategy: settings.default_strategy.clone(),
            bot_command: settings.bot_command.clone(),
        }
    }

    /// `{root}/{userId}`
    pub fn user_dir(&self, user: &UserId) -> PathBuf {
        self.root.join(user.as_str())
    }

    /// `{root}/{userId}/{poolId}`
    pub fn pool_dir(&self, user: &UserId, pool: &PoolId) -> PathBuf {
        self.user_dir(user).join(pool.as_str())
    }

    /// Legacy dedicated instance dir `{root}/{userId}/{instanceId}`.
    pub fn instance_dir(&self, user: &UserId, instance: &InstanceId) -> PathBuf {
        self.user_dir(user).join(instance.as_str())
    }

    /// Supervisor config dir of a pool.
    pub fn supervisor_dir(&self, pool: &Pool) -> PathBuf {
        pool.workdir.join("supervisor")
    }

    /// Bots dir of a pool.
    pub fn bots_dir(&self, pool: &Pool) -> PathBuf {
        pool.workdir.join("bots")
    }

    /// Logs dir of a pool.
    pub fn logs_dir(&self, pool: &Pool) -> PathBuf {
        pool.workdir.join("logs")
    }

    /// Instance dir of a pooled bot.
    pub fn pool_bot_dir(&self, pool: &Pool, instance: &InstanceId) -> PathBuf {
        self.bots_dir(pool).join(instance.as_str())
    }

    /// Container-internal path of a pooled bot's config file.
    pub fn bot_config_mount(instance: &InstanceId) -> String {
        format!("{}/{}/config.json", BOTS_MOUNT, instance)
    }

    /// Container-internal path of a pooled bot's database.
    pub fn bot_db_mount(instance: &InstanceId) -> String {
        format!("{}/{}/bot.db", BOTS_MOUNT, instance)
    }

    /// Container-internal path of a pooled bot's log file.
    pub fn bot_log_mount(instance: &InstanceId) -> String {
        format!("{}/bot-{}.log", LOGS_MOUNT, instance)
    }

    /// Create the directory tree of a new pool and write the supervisor
    /// bootstrap config.
    pub fn create_pool_layout(&self, pool: &Pool) -> Result<(), SvcError> {
        for dir in [
            self.supervisor_dir(pool),
            self.bots_dir(pool),
            self.logs_dir(pool),
        ] {
            std::fs::create_dir_all(&dir)
                .context(LayoutIo { path: dir.clone() })?;
        }
        let path = self.supervisor_dir(pool).join("supervisord.conf");
        std::fs::write(&path, self.supervisord_conf())
            .context(LayoutIo { path })?;
        Ok(())
    }

    /// The supervisord bootstrap: programs are included from the
    /// `bot-*.conf` glob, so adding a bot is drop-a-file + reread + update.
    fn supervisord_conf(&self) -> String {
        format!(
            "[unix_http_server]\n\
             file=/var/run/supervisor.sock\n\
             \n\
             [supervisord]\n\
             nodaemon=true\n\
             logfile={logs}/supervisord.log\n\
             pidfile=/var/run/supervisord.pid\n\
             \n\
             [rpcinterface:supervisor]\n\
             supervisor.rpcinterface_factory = supervisor.rpcinterface:make_main_rpcinterface\n\
             \n\
             [supervisorctl]\n\
             serverurl=unix:///var/run/supervisor.sock\n\
             \n\
             [include]\n\
             files = {conf}/bot-*.conf\n",
            logs = LOGS_MOUNT,
            conf = SUPERVISOR_MOUNT,
        )
    }

    /// Render the supervisor program file of one bot.
    pub fn program_conf(&self, config: &BotConfig) -> String {
        let instance = &config.instance_id;
        format!(
            "[program:{prog}]\n\
             command={command} --config {config_path}\n\
             directory={dir}\n\
             autostart=false\n\
             autorestart=true\n\
             startretries=3\n\
             stopwaitsecs=10\n\
             environment=BOT_PORT=\"{port}\",BOT_STRATEGY=\"{strategy}\"\n\
             stdout_logfile={log}\n\
             redirect_stderr=true\n",
            prog = supervisor::program_name(instance),
            command = self.bot_command,
            config_path = Self::bot_config_mount(instance),
            dir = format!("{}/{}", BOTS_MOUNT, instance),
            port = config.port,
            strategy = config.strategy,
            log = Self::bot_log_mount(instance),
        )
    }

    /// Write (or replace) the program file of a bot in a pool.
    pub fn write_program(
        &self,
        pool: &Pool,
        config: &BotConfig,
    ) -> Result<PathBuf, SvcError> {
        let path = self
            .supervisor_dir(pool)
            .join(format!("bot-{}.conf", config.instance_id));
        std::fs::write(&path, self.program_conf(config)).context(ConfigIo {
            instance: config.instance_id.clone(),
        })?;
        Ok(path)
    }

    /// Remove the program file of a bot; absent files are fine.
    pub fn remove_program(&self, pool: &Pool, instance: &InstanceId) {
        let path = self
            .supervisor_dir(pool)
            .join(format!("bot-{}.conf", instance));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to remove program file '{}': {}",
                    path.display(),
                    e
                );
            }
        }
    }

    /// Write a bot's `config.json` into its pool instance dir.
    pub fn write_bot_config(
        &self,
        pool: &Pool,
        config: &BotConfig,
    ) -> Result<PathBuf, SvcError> {
        let dir = self.pool_bot_dir(pool, &config.instance_id);
        std::fs::create_dir_all(&dir).context(ConfigIo {
            instance: config.instance_id.clone(),
        })?;
        let path = dir.join("config.json");
        write_config(&path, config)?;
        Ok(path)
    }

    /// Delete a bot's pool instance dir. Best-effort.
    pub fn remove_bot_dir(&self, pool: &Pool, instance: &InstanceId) {
        let dir = self.pool_bot_dir(pool, instance);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to remove bot dir '{}': {}",
                    dir.display(),
                    e
                );
            }
        }
    }

    /// Delete a pool's whole directory tree. Best-effort.
    pub fn remove_pool_dir(&self, pool: &Pool) {
        if let Err(e) = std::fs::remove_dir_all(&pool.workdir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to remove pool dir '{}': {}",
                    pool.workdir.display(),
                    e
                );
            }
        }
    }

    /// Resolve a requested strategy against the distributed strategy files,
    /// substituting the safe default when the file is absent.
    pub fn resolve_strategy(&self, requested: &str) -> String {
        let requested = if requested.is_empty() {
            self.default_strategy.as_str()
        } else {
            requested
        };
        let file = self.strategies_dir.join(format!("{}.js", requested));
        if file.is_file() || requested == self.default_strategy {
            requested.to_string()
        } else {
            tracing::warn!(
                "Strategy file '{}' not found, substituting '{}'",
                file.display(),
                self.default_strategy
            );
            self.default_strategy.clone()
        }
    }
}

/// Read a bot config file.
pub fn read_config(path: &Path) -> Result<BotConfig, SvcError> {
    let instance = InstanceId::from(
        path.parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    );
    let raw = std::fs::read_to_string(path).context(ConfigIo {
        instance: instance.clone(),
    })?;
    serde_json::from_str(&raw).context(ConfigParse { instance })
}

/// Write a bot config file.
pub fn write_config(path: &Path, config: &BotConfig) -> Result<(), SvcError> {
    let body = serde_json::to_string_pretty(config).map_err(|source| {
        SvcError::ConfigParse {
            instance: config.instance_id.clone(),
            source,
        }
    })?;
    std::fs::write(path, body).context(ConfigIo {
        instance: config.instance_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PoolStatus, UserId};
    use chrono::Utc;

    fn pool_at(dir: &Path) -> Pool {
        let user = UserId::from("alice");
        let id = PoolId::for_user(&user, 1);
        Pool {
            container_name: id.as_str().to_string(),
            workdir: dir.join("alice").join(id.as_str()),
            id,
            user_id: user,
            max_bots: 3,
            base_port: 9000,
            bots: vec![],
            status: PoolStatus::Running,
            metrics: Default::default(),
            created_at: Utc::now(),
        }
    }

    fn config() -> BotConfig {
        BotConfig {
            instance_id: InstanceId::from("b1"),
            user_id: UserId::from("alice"),
            strategy: "momentum".into(),
            port: 9001,
            db_path: Some(PoolLayout::bot_db_mount(&InstanceId::from("b1"))),
            log_path: Some(PoolLayout::bot_log_mount(&InstanceId::from("b1"))),
            ..Default::default()
        }
    }

    #[test]
    fn pool_layout_created() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_root(dir.path());
        let layout = PoolLayout::new(&settings);
        let pool = pool_at(dir.path());
        layout.create_pool_layout(&pool).unwrap();

        assert!(layout.bots_dir(&pool).is_dir());
        assert!(layout.logs_dir(&pool).is_dir());
        let bootstrap = std::fs::read_to_string(
            layout.supervisor_dir(&pool).join("supervisord.conf"),
        )
        .unwrap();
        assert!(bootstrap.contains("files = /etc/supervisor/bot-*.conf"));
    }

    #[test]
    fn program_conf_renders_paths() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_root(dir.path());
        let layout = PoolLayout::new(&settings);
        let conf = layout.program_conf(&config());
        assert!(conf.starts_with("[program:bot-b1]"));
        assert!(conf.contains("--config /app/bots/b1/config.json"));
        assert!(conf.contains("BOT_PORT=\"9001\""));
        assert!(conf.contains("BOT_STRATEGY=\"momentum\""));
        assert!(conf.contains("stdout_logfile=/var/log/botpool/bot-b1.log"));
    }

    #[test]
    fn bot_config_round_trips_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_root(dir.path());
        let layout = PoolLayout::new(&settings);
        let pool = pool_at(dir.path());
        layout.create_pool_layout(&pool).unwrap();

        let path = layout.write_bot_config(&pool, &config()).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"instanceId\": \"b1\""));
        assert!(raw.contains("\"dbPath\""));

        let back = read_config(&path).unwrap();
        assert_eq!(back.instance_id, InstanceId::from("b1"));
        assert_eq!(back.port, 9001);
    }

    #[test]
    fn missing_strategy_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_root(dir.path());
        std::fs::create_dir_all(&settings.strategies_dir).unwrap();
        std::fs::write(
            settings.strategies_dir.join("momentum.js"),
            "module.exports = {};",
        )
        .unwrap();
        let layout = PoolLayout::new(&settings);

        assert_eq!(layout.resolve_strategy("momentum"), "momentum");
        assert_eq!(layout.resolve_strategy("no-such"), "default");
        assert_eq!(layout.resolve_strategy(""), "default");
    }
}
