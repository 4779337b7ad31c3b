//! In-memory [`ContainerRuntime`] used by the orchestrator tests.
//!
//! Plays the role a compose harness plays for integration tests: containers
//! are entries in a map, execs are recorded and answered from canned
//! responses, so control-plane logic can be driven without a docker daemon.

use std::{
    collections::HashMap,
    path::Path,
    sync::Mutex,
};

use async_trait::async_trait;
use snafu::ResultExt;

use crate::{
    ContainerManifest,
    ContainerNotFound,
    ContainerRuntime,
    ContainerStats,
    ContainerStatus,
    ExecOutput,
    Result,
};

/// One recorded exec call.
#[derive(Debug, Clone)]
pub struct RecordedExec {
    /// Container the command ran in.
    pub container: String,
    /// Full argv.
    pub argv: Vec<String>,
}

#[derive(Debug, Clone)]
struct CannedResponse {
    container: Option<String>,
    needle: String,
    output: ExecOutput,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: HashMap<String, ContainerStatus>,
    manifests: HashMap<String, ContainerManifest>,
    execs: Vec<RecordedExec>,
    responses: Vec<CannedResponse>,
    stats: HashMap<String, ContainerStats>,
    broken_exec: std::collections::HashSet<String>,
    fail_next_up: bool,
    up_count: usize,
    restart_count: usize,
}

/// In-memory runtime driver.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    inner: Mutex<FakeState>,
}

impl FakeRuntime {
    /// New empty runtime with no containers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a state on a container, creating it if needed.
    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        let mut state = self.inner.lock().unwrap();
        state.containers.insert(name.to_string(), status);
    }

    /// Forget a container entirely.
    pub fn forget(&self, name: &str) {
        let mut state = self.inner.lock().unwrap();
        state.containers.remove(name);
    }

    /// Queue a canned exec response: the next exec in `container` (any
    /// container when `None`) whose joined argv contains `needle` returns
    /// `stdout`. Later registrations win over earlier ones.
    pub fn respond(&self, container: Option<&str>, needle: &str, stdout: &str) {
        let mut state = self.inner.lock().unwrap();
        state.responses.push(CannedResponse {
            container: container.map(|c| c.to_string()),
            needle: needle.to_string(),
            output: ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        });
    }

    /// Drop every canned response registered so far.
    pub fn clear_responses(&self) {
        self.inner.lock().unwrap().responses.clear();
    }

    /// Report fixed stats for a container.
    pub fn set_stats(&self, name: &str, stats: ContainerStats) {
        let mut state = self.inner.lock().unwrap();
        state.stats.insert(name.to_string(), stats);
    }

    /// Make the next `container_up` fail.
    pub fn fail_next_up(&self) {
        self.inner.lock().unwrap().fail_next_up = true;
    }

    /// Make every exec in `name` fail until [`Self::heal_execs_for`].
    pub fn fail_execs_for(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .broken_exec
            .insert(name.to_string());
    }

    /// Let execs in `name` succeed again.
    pub fn heal_execs_for(&self, name: &str) {
        self.inner.lock().unwrap().broken_exec.remove(name);
    }

    /// All recorded exec calls so far.
    pub fn execs(&self) -> Vec<RecordedExec> {
        self.inner.lock().unwrap().execs.clone()
    }

    /// Recorded execs whose joined argv contains `needle`.
    pub fn execs_matching(&self, needle: &str) -> Vec<RecordedExec> {
        self.inner
            .lock()
            .unwrap()
            .execs
            .iter()
            .filter(|e| e.argv.join(" ").contains(needle))
            .cloned()
            .collect()
    }

    /// The manifest a container was brought up from, if any.
    pub fn manifest(&self, name: &str) -> Option<ContainerManifest> {
        self.inner.lock().unwrap().manifests.get(name).cloned()
    }

    /// Current status of a container.
    pub fn status(&self, name: &str) -> ContainerStatus {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(name)
            .copied()
            .unwrap_or(ContainerStatus::Missing)
    }

    /// How many containers have been brought up.
    pub fn up_count(&self) -> usize {
        self.inner.lock().unwrap().up_count
    }

    /// How many restarts have been issued.
    pub fn restart_count(&self) -> usize {
        self.inner.lock().unwrap().restart_count
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn container_up(
        &self,
        _workdir: &Path,
        manifest: &ContainerManifest,
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_next_up {
            state.fail_next_up = false;
            return Err(bollard::errors::Error::IOError {
                err: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected container-up failure",
                ),
            })
            .context(crate::DockerRequest {
                name: manifest.container_name.clone(),
                request: "create",
            });
        }
        state.up_count += 1;
        state
            .containers
            .insert(manifest.container_name.clone(), ContainerStatus::Running);
        state
            .manifests
            .insert(manifest.container_name.clone(), manifest.clone());
        Ok(())
    }

    async fn container_down(&self, _workdir: &Path, name: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.containers.remove(name);
        Ok(())
    }

    async fn container_start(&self, name: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        match state.containers.get_mut(name) {
            Some(status) => {
                *status = ContainerStatus::Running;
                Ok(())
            }
            None => ContainerNotFound { name }.fail(),
        }
    }

    async fn container_stop(&self, name: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        match state.containers.get_mut(name) {
            Some(status) => {
                *status = ContainerStatus::Stopped;
                Ok(())
            }
            None => ContainerNotFound { name }.fail(),
        }
    }

    async fn container_restart(&self, name: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.restart_count += 1;
        match state.containers.get_mut(name) {
            Some(status) => {
                *status = ContainerStatus::Running;
                Ok(())
            }
            None => ContainerNotFound { name }.fail(),
        }
    }

    async fn container_inspect(&self, name: &str) -> Result<ContainerStatus> {
        Ok(self.status(name))
    }

    async fn exec(&self, name: &str, argv: &[&str]) -> Result<ExecOutput> {
        let mut state = self.inner.lock().unwrap();
        if !state.containers.contains_key(name) {
            return ContainerNotFound { name }.fail();
        }
        if state.broken_exec.contains(name) {
            return Err(bollard::errors::Error::IOError {
                err: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "injected exec failure",
                ),
            })
            .context(crate::DockerRequest {
                name,
                request: "exec-start",
            });
        }
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let joined = argv.join(" ");
        state.execs.push(RecordedExec {
            container: name.to_string(),
            argv,
        });
        let response = state
            .responses
            .iter()
            .rev()
            .find(|r| {
                joined.contains(&r.needle)
                    && r.container.as_deref().map_or(true, |c| c == name)
            })
            .map(|r| r.output.clone())
            .unwrap_or_default();
        Ok(response)
    }

    async fn container_stats(&self, name: &str) -> Result<ContainerStats> {
        let state = self.inner.lock().unwrap();
        if !state.containers.contains_key(name) {
            return ContainerNotFound { name }.fail();
        }
        Ok(state.stats.get(name).copied().unwrap_or_default())
    }
}
