//! Environment-driven settings of the orchestrator.

use std::{path::PathBuf, str::FromStr, time::Duration};

/// How the host part of a bot endpoint is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    /// This process runs on the container host: connect via localhost.
    Host,
    /// This process runs in a sibling container: connect via docker DNS.
    Container,
    /// Decide at runtime by checking whether we run inside a container.
    Auto,
}

impl FromStr for HostMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(HostMode::Host),
            "container" => Ok(HostMode::Container),
            "auto" => Ok(HostMode::Auto),
            other => Err(format!("unknown host mode '{}'", other)),
        }
    }
}

/// Tunables of the control plane, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of all per-user bot and pool directories.
    pub root: PathBuf,
    /// Pool capacity (`MAX_BOTS_PER_CONTAINER`).
    pub max_bots_per_container: usize,
    /// Floor of the global contiguous port space (`POOL_BASE_PORT`).
    pub base_port: u16,
    /// Host-resolution policy (`POOL_HOST_MODE`).
    pub host_mode: HostMode,
    /// Fixed host override (`POOL_HOST_OVERRIDE`).
    pub host_override: Option<String>,
    /// Pooled placement on assignment vs the dedicated path
    /// (`POOL_MODE_ENABLED`).
    pub pool_mode_enabled: bool,
    /// Health sweep period (`HEALTH_CHECK_INTERVAL`).
    pub health_interval: Duration,
    /// Timeout of bot-API pings (`BOT_PING_TIMEOUT`).
    pub ping_timeout: Duration,
    /// Timeout of in-container execs (`CONTAINER_EXEC_TIMEOUT`).
    pub exec_timeout: Duration,
    /// Recovery attempts before backing off (`MAX_RESTART_ATTEMPTS`).
    pub max_restart_attempts: u32,
    /// Recovery back-off window (`RESTART_COOLDOWN`).
    pub restart_cooldown: Duration,
    /// Image pool containers run (`POOL_IMAGE`).
    pub runtime_image: String,
    /// Command line launching one bot process inside a container.
    pub bot_command: String,
    /// Strategy substituted when a requested strategy file is absent.
    pub default_strategy: String,
    /// Directory of distributed strategy files.
    pub strategies_dir: PathBuf,
    /// Wait between pool-start and the migration liveness probe.
    pub migration_stabilize: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let root = PathBuf::from("/var/lib/botpool");
        Self {
            strategies_dir: root.join("strategies"),
            root,
            max_bots_per_container: 3,
            base_port: 9000,
            host_mode: HostMode::Auto,
            host_override: None,
            pool_mode_enabled: true,
            health_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            exec_timeout: Duration::from_secs(15),
            max_restart_attempts: 3,
            restart_cooldown: Duration::from_secs(60),
            runtime_image: "botpool/worker:latest".to_string(),
            bot_command: "node /app/worker/index.js".to_string(),
            default_strategy: "default".to_string(),
            migration_stabilize: Duration::from_secs(3),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, current: T) -> T {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    "env::{} => ignoring unparsable value '{}'",
                    key,
                    raw
                );
                current
            }
        },
        None => current,
    }
}

fn env_secs(key: &str, current: Duration) -> Duration {
    match env_string(key) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                tracing::warn!(
                    "env::{} => ignoring unparsable seconds '{}'",
                    key,
                    raw
                );
                current
            }
        },
        None => current,
    }
}

impl Settings {
    /// Settings from the environment over the built-in defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(root) = env_string("POOL_ROOT") {
            settings.root = PathBuf::from(root);
            settings.strategies_dir = settings.root.join("strategies");
        }
        settings.max_bots_per_container = env_parse(
            "MAX_BOTS_PER_CONTAINER",
            settings.max_bots_per_container,
        );
        settings.base_port = env_parse("POOL_BASE_PORT", settings.base_port);
        settings.host_mode = env_parse("POOL_HOST_MODE", settings.host_mode);
        settings.host_override = env_string("POOL_HOST_OVERRIDE");
        settings.pool_mode_enabled =
            env_parse("POOL_MODE_ENABLED", settings.pool_mode_enabled);
        settings.health_interval =
            env_secs("HEALTH_CHECK_INTERVAL", settings.health_interval);
        settings.ping_timeout =
            env_secs("BOT_PING_TIMEOUT", settings.ping_timeout);
        settings.exec_timeout =
            env_secs("CONTAINER_EXEC_TIMEOUT", settings.exec_timeout);
        settings.max_restart_attempts = env_parse(
            "MAX_RESTART_ATTEMPTS",
            settings.max_restart_attempts,
        );
        settings.restart_cooldown =
            env_secs("RESTART_COOLDOWN", settings.restart_cooldown);
        if let Some(image) = env_string("POOL_IMAGE") {
            settings.runtime_image = image;
        }
        if let Some(command) = env_string("BOT_COMMAND") {
            settings.bot_command = command;
        }
        if let Some(strategy) = env_string("DEFAULT_STRATEGY") {
            settings.default_strategy = strategy;
        }
        settings
    }

    /// Settings rooted at `root`, for tests and embedded use.
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        Self {
            strategies_dir: root.join("strategies"),
            root,
            ..Self::default()
        }
    }

    /// Resolve the host part of a bot endpoint: the configured override if
    /// set, else localhost when this process runs on the container host,
    /// else the container's name (docker-internal DNS). `auto` checks
    /// whether the process itself runs inside a container.
    pub fn resolve_host(&self, container_name: &str) -> String {
        if let Some(host) = &self.host_override {
            return host.clone();
        }
        match self.host_mode {
            HostMode::Host => "localhost".to_string(),
            HostMode::Container => container_name.to_string(),
            HostMode::Auto => {
                if std::path::Path::new("/.dockerenv").exists() {
                    container_name.to_string()
                } else {
                    "localhost".to_string()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_mode_parses() {
        assert_eq!("host".parse::<HostMode>().unwrap(), HostMode::Host);
        assert_eq!(
            "Container".parse::<HostMode>().unwrap(),
            HostMode::Container
        );
        assert!("borked".parse::<HostMode>().is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.max_bots_per_container, 3);
        assert_eq!(settings.base_port, 9000);
        assert_eq!(settings.health_interval, Duration::from_secs(30));
        assert_eq!(settings.max_restart_attempts, 3);
    }

    #[test]
    fn with_root_rebases_strategies() {
        let settings = Settings::with_root("/tmp/x");
        assert_eq!(settings.strategies_dir, PathBuf::from("/tmp/x/strategies"));
    }
}
