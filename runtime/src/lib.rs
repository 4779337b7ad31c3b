//! Container runtime driver for the bot-pool orchestrator.
//!
//! The core depends on the narrow [`ContainerRuntime`] trait rather than on
//! any particular container technology. [`DockerRuntime`] implements it
//! against the local docker daemon through `bollard`; [`fake::FakeRuntime`]
//! implements it in memory so the control plane can be exercised without a
//! daemon.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use bollard::{
    container::{
        Config,
        CreateContainerOptions,
        LogOutput,
        RemoveContainerOptions,
        RestartContainerOptions,
        StartContainerOptions,
        StatsOptions,
        StopContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    models::{ContainerStateStatusEnum, HostConfig, PortBinding, PortMap},
    Docker,
    API_DEFAULT_VERSION,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub mod fake;

/// Label namespace stamped on every container the orchestrator owns.
pub const LABEL_PREFIX: &str = "io.botpool";

/// File name of the declarative manifest kept in a container's workdir.
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Errors raised by the runtime driver.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum RuntimeError {
    #[snafu(display("Failed to connect to the docker daemon"))]
    Connect { source: bollard::errors::Error },
    #[snafu(display("Container '{}' not found", name))]
    ContainerNotFound { name: String },
    #[snafu(display(
        "Docker request '{}' for container '{}' failed: {}",
        request,
        name,
        source
    ))]
    DockerRequest {
        name: String,
        request: String,
        source: bollard::errors::Error,
    },
    #[snafu(display(
        "Exec in container '{}' timed out after {:?}",
        name,
        timeout
    ))]
    ExecTimeout { name: String, timeout: Duration },
    #[snafu(display("Failed to write manifest under '{}'", path.display()))]
    ManifestWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("No stats reported for container '{}'", name))]
    StatsUnavailable { name: String },
}

/// Result alias for driver operations.
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// Coarse container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Container exists and is running.
    Running,
    /// Container exists but is not running (created/exited/paused/dead).
    Stopped,
    /// No container with that name is known to the runtime.
    Missing,
}

impl ContainerStatus {
    /// Whether the container is up.
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

/// Captured output of a command executed inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Collected stdout, lossily decoded.
    pub stdout: String,
    /// Collected stderr, lossily decoded.
    pub stderr: String,
}

/// Live resource usage of a container.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    /// Resident memory in MiB.
    pub memory_mb: f64,
    /// CPU usage in percent of one core.
    pub cpu_pct: f64,
}

/// Host-to-container volume bind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bind {
    /// Absolute path on the host.
    pub host: String,
    /// Mount point inside the container.
    pub container: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Host-to-container port publication (tcp).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPublish {
    /// Port bound on the host.
    pub host_port: u16,
    /// Port the process listens on inside the container.
    pub container_port: u16,
}

/// Declarative description of one container, kept as a compose file in the
/// container's working directory so an operator can reproduce the exact
/// `docker-compose up` by hand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerManifest {
    /// Container (and service) name.
    pub container_name: String,
    /// Image to run.
    pub image: String,
    /// Entrypoint command and arguments.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub binds: Vec<Bind>,
    #[serde(default)]
    pub ports: Vec<PortPublish>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerManifest {
    /// New manifest for `name` running `image`.
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            container_name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// Set the command and arguments.
    pub fn with_command<S: Into<String>>(mut self, command: Vec<S>) -> Self {
        self.command = command.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: &str, val: &str) -> Self {
        self.env.insert(key.into(), val.into());
        self
    }

    /// Add a read-write volume bind.
    pub fn with_bind(mut self, host: &str, container: &str) -> Self {
        self.binds.push(Bind {
            host: host.into(),
            container: container.into(),
            read_only: false,
        });
        self
    }

    /// Add a read-only volume bind.
    pub fn with_bind_ro(mut self, host: &str, container: &str) -> Self {
        self.binds.push(Bind {
            host: host.into(),
            container: container.into(),
            read_only: true,
        });
        self
    }

    /// Publish a tcp port.
    pub fn with_port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortPublish {
            host_port,
            container_port,
        });
        self
    }

    /// Add a label.
    pub fn with_label(mut self, key: &str, val: &str) -> Self {
        self.labels.insert(key.into(), val.into());
        self
    }

    /// Render the manifest as a docker-compose document.
    pub fn compose_yaml(&self) -> String {
        let mut out = String::new();
        out.push_str("services:\n");
        out.push_str(&format!("  {}:\n", self.container_name));
        out.push_str(&format!("    container_name: {}\n", self.container_name));
        out.push_str(&format!("    image: {}\n", self.image));
        if !self.command.is_empty() {
            let argv = self
                .command
                .iter()
                .map(|a| format!("\"{}\"", a))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("    command: [{}]\n", argv));
        }
        if !self.env.is_empty() {
            out.push_str("    environment:\n");
            for (k, v) in &self.env {
                out.push_str(&format!("      {}: \"{}\"\n", k, v));
            }
        }
        if !self.ports.is_empty() {
            out.push_str("    ports:\n");
            for p in &self.ports {
                out.push_str(&format!(
                    "      - \"{}:{}\"\n",
                    p.host_port, p.container_port
                ));
            }
        }
        if !self.binds.is_empty() {
            out.push_str("    volumes:\n");
            for b in &self.binds {
                let suffix = if b.read_only { ":ro" } else { "" };
                out.push_str(&format!(
                    "      - \"{}:{}{}\"\n",
                    b.host, b.container, suffix
                ));
            }
        }
        if !self.labels.is_empty() {
            out.push_str("    labels:\n");
            for (k, v) in &self.labels {
                out.push_str(&format!("      {}: \"{}\"\n", k, v));
            }
        }
        out.push_str("    restart: unless-stopped\n");
        out
    }

    /// Write the compose rendering into `workdir`.
    pub fn write_to(&self, workdir: &Path) -> Result<PathBuf> {
        let path = workdir.join(COMPOSE_FILE);
        std::fs::write(&path, self.compose_yaml()).context(ManifestWrite {
            path: path.clone(),
        })?;
        Ok(path)
    }
}

/// The narrow driver interface the orchestrator core depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Bring a container up from a declarative manifest rooted in `workdir`.
    /// Replaces any same-named leftover container.
    async fn container_up(
        &self,
        workdir: &Path,
        manifest: &ContainerManifest,
    ) -> Result<()>;

    /// Tear a container down and remove its anonymous volumes.
    async fn container_down(&self, workdir: &Path, name: &str) -> Result<()>;

    /// Start an existing, stopped container.
    async fn container_start(&self, name: &str) -> Result<()>;

    /// Stop a running container. Already-stopped is not an error.
    async fn container_stop(&self, name: &str) -> Result<()>;

    /// Restart a container by name.
    async fn container_restart(&self, name: &str) -> Result<()>;

    /// Presence and state of a container.
    async fn container_inspect(&self, name: &str) -> Result<ContainerStatus>;

    /// Run a command inside a container and capture its output.
    async fn exec(&self, name: &str, argv: &[&str]) -> Result<ExecOutput>;

    /// Live memory/cpu usage of a container.
    async fn container_stats(&self, name: &str) -> Result<ContainerStats>;
}

/// Driver over the local docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    exec_timeout: Duration,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("exec_timeout", &self.exec_timeout)
            .finish()
    }
}

fn not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn not_modified(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

impl DockerRuntime {
    /// Connect to the daemon, honouring `DOCKER_HOST` when set.
    pub fn connect(exec_timeout: Duration) -> Result<Self> {
        let docker = match std::env::var("DOCKER_HOST") {
            Ok(host) => {
                Docker::connect_with_unix(&host, 120, API_DEFAULT_VERSION)
            }
            Err(_) => Docker::connect_with_unix_defaults(),
        }
        .context(Connect)?;
        Ok(Self {
            docker,
            exec_timeout,
        })
    }

    async fn remove_existing(&self, name: &str) {
        let _ = self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 0 }))
            .await;
        let _ = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    v: false,
                    force: true,
                    link: false,
                }),
            )
            .await;
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn container_up(
        &self,
        workdir: &Path,
        manifest: &ContainerManifest,
    ) -> Result<()> {
        let name = manifest.container_name.as_str();
        manifest.write_to(workdir)?;
        self.remove_existing(name).await;

        let mut port_map = PortMap::new();
        let mut exposed = std::collections::HashMap::new();
        for p in &manifest.ports {
            let key = format!("{}/tcp", p.container_port);
            port_map.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(p.host_port.to_string()),
                }]),
            );
            exposed.insert(key, std::collections::HashMap::<(), ()>::new());
        }
        let binds = manifest
            .binds
            .iter()
            .map(|b| {
                if b.read_only {
                    format!("{}:{}:ro", b.host, b.container)
                } else {
                    format!("{}:{}", b.host, b.container)
                }
            })
            .collect::<Vec<_>>();

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_map),
            init: Some(true),
            ..Default::default()
        };

        let env = manifest
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        let labels = manifest
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<std::collections::HashMap<_, _>>();

        let config = Config {
            image: Some(manifest.image.clone()),
            cmd: if manifest.command.is_empty() {
                None
            } else {
                Some(manifest.command.clone())
            },
            env: Some(env),
            hostname: Some(name.to_string()),
            labels: Some(labels),
            exposed_ports: Some(exposed),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await
            .context(DockerRequest {
                name,
                request: "create",
            })?;
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .context(DockerRequest {
                name,
                request: "start",
            })?;
        tracing::info!("Container '{}' is up from {}", name, workdir.display());
        Ok(())
    }

    async fn container_down(&self, _workdir: &Path, name: &str) -> Result<()> {
        if let Err(e) = self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 5 }))
            .await
        {
            if !not_found(&e) && !not_modified(&e) {
                return Err(e).context(DockerRequest {
                    name,
                    request: "stop",
                });
            }
        }
        if let Err(e) = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    link: false,
                }),
            )
            .await
        {
            if !not_found(&e) {
                return Err(e).context(DockerRequest {
                    name,
                    request: "remove",
                });
            }
        }
        Ok(())
    }

    async fn container_start(&self, name: &str) -> Result<()> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(ref e) if not_modified(e) => Ok(()),
            Err(ref e) if not_found(e) => ContainerNotFound { name }.fail(),
            Err(e) => Err(e).context(DockerRequest {
                name,
                request: "start",
            }),
        }
    }

    async fn container_stop(&self, name: &str) -> Result<()> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 5 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(ref e) if not_modified(e) => Ok(()),
            Err(ref e) if not_found(e) => ContainerNotFound { name }.fail(),
            Err(e) => Err(e).context(DockerRequest {
                name,
                request: "stop",
            }),
        }
    }

    async fn container_restart(&self, name: &str) -> Result<()> {
        match self
            .docker
            .restart_container(name, Some(RestartContainerOptions { t: 3 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(ref e) if not_modified(e) => Ok(()),
            Err(ref e) if not_found(e) => ContainerNotFound { name }.fail(),
            Err(e) => Err(e).context(DockerRequest {
                name,
                request: "restart",
            }),
        }
    }

    async fn container_inspect(&self, name: &str) -> Result<ContainerStatus> {
        match self.docker.inspect_container(name, None).await {
            Ok(resp) => {
                let status = resp.state.and_then(|s| s.status);
                Ok(match status {
                    Some(ContainerStateStatusEnum::RUNNING) => {
                        ContainerStatus::Running
                    }
                    _ => ContainerStatus::Stopped,
                })
            }
            Err(ref e) if not_found(e) => Ok(ContainerStatus::Missing),
            Err(e) => Err(e).context(DockerRequest {
                name,
                request: "inspect",
            }),
        }
    }

    async fn exec(&self, name: &str, argv: &[&str]) -> Result<ExecOutput> {
        let exec = match self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(exec) => exec,
            Err(ref e) if not_found(e) => {
                return ContainerNotFound { name }.fail()
            }
            Err(e) => {
                return Err(e).context(DockerRequest {
                    name,
                    request: "exec-create",
                })
            }
        };

        let mut output = ExecOutput::default();
        let collect = async {
            match self
                .docker
                .start_exec(&exec.id, None)
                .await
                .context(DockerRequest {
                    name,
                    request: "exec-start",
                })? {
                StartExecResults::Attached { output: mut o, .. } => {
                    while let Some(chunk) = o.next().await {
                        match chunk.context(DockerRequest {
                            name,
                            request: "exec-read",
                        })? {
                            LogOutput::StdOut { message } => output
                                .stdout
                                .push_str(&String::from_utf8_lossy(&message)),
                            LogOutput::StdErr { message } => output
                                .stderr
                                .push_str(&String::from_utf8_lossy(&message)),
                            _ => {}
                        }
                    }
                }
                StartExecResults::Detached => {}
            }
            Ok::<_, RuntimeError>(())
        };
        match tokio::time::timeout(self.exec_timeout, collect).await {
            Ok(result) => result?,
            Err(_) => {
                return ExecTimeout {
                    name,
                    timeout: self.exec_timeout,
                }
                .fail()
            }
        }
        Ok(output)
    }

    async fn container_stats(&self, name: &str) -> Result<ContainerStats> {
        let mut stream = self.docker.stats(
            name,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(ref e)) if not_found(e) => {
                return ContainerNotFound { name }.fail()
            }
            Some(Err(e)) => {
                return Err(e).context(DockerRequest {
                    name,
                    request: "stats",
                })
            }
            None => return StatsUnavailable { name }.fail(),
        };

        let memory_mb = stats.memory_stats.usage.unwrap_or(0) as f64
            / (1024.0 * 1024.0);
        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage)
            as f64;
        let sys_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0))
            as f64;
        let cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
        let cpu_pct = if sys_delta > 0.0 {
            (cpu_delta / sys_delta) * cpus * 100.0
        } else {
            0.0
        };
        Ok(ContainerStats {
            memory_mb,
            cpu_pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_rendering() {
        let manifest = ContainerManifest::new("alice-pool-1", "botpool/worker")
            .with_command(vec!["supervisord", "-n"])
            .with_env("POOL_ID", "alice-pool-1")
            .with_bind("/data/alice/alice-pool-1/bots", "/app/bots")
            .with_bind_ro("/data/strategies", "/app/strategies")
            .with_port(9000, 9000)
            .with_label("io.botpool.user", "alice");

        let yaml = manifest.compose_yaml();
        assert!(yaml.contains("container_name: alice-pool-1"));
        assert!(yaml.contains("image: botpool/worker"));
        assert!(yaml.contains("command: [\"supervisord\", \"-n\"]"));
        assert!(yaml.contains("- \"9000:9000\""));
        assert!(yaml.contains("/app/strategies:ro\""));
        assert!(yaml.contains("io.botpool.user: \"alice\""));
    }

    #[test]
    fn manifest_round_trip() {
        let manifest = ContainerManifest::new("bob-pool-2", "botpool/worker")
            .with_port(9010, 9010)
            .with_env("A", "b");
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"containerName\":\"bob-pool-2\""));
        let back: ContainerManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.container_name, manifest.container_name);
        assert_eq!(back.ports.len(), 1);
    }

    #[test]
    fn compose_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ContainerManifest::new("carol-pool-1", "botpool/worker");
        let path = manifest.write_to(dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), COMPOSE_FILE);
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.starts_with("services:"));
    }
}
