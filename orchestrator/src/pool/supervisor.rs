//! Client for the supervisor process inside a pool container.
//!
//! All operations go through the runtime's exec channel as `supervisorctl`
//! invocations. Program files follow the `bot-{instanceId}` naming
//! convention, so adding a bot is: drop a `bot-*.conf` file, then
//! `reread` + `update` + `start`.

use std::sync::Arc;

use runtime::{ContainerRuntime, ExecOutput};

use crate::{
    core::{InstanceId, PoolId},
    errors::SvcError,
};

const SUPERVISORCTL: [&str; 3] =
    ["supervisorctl", "-c", "/etc/supervisor/supervisord.conf"];

/// Supervisor program name of a bot.
pub fn program_name(instance: &InstanceId) -> String {
    format!("bot-{}", instance)
}

/// The instance a supervisor program name refers to, if it is one of ours.
pub fn instance_of(program: &str) -> Option<InstanceId> {
    program.strip_prefix("bot-").map(InstanceId::from)
}

/// State of one supervised program, as reported by `supervisorctl status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Running,
    Starting,
    Stopped,
    Exited,
    Fatal,
    Backoff,
    Unknown,
}

impl ProgramState {
    fn parse(token: &str) -> Self {
        match token {
            "RUNNING" => ProgramState::Running,
            "STARTING" => ProgramState::Starting,
            "STOPPED" => ProgramState::Stopped,
            "EXITED" => ProgramState::Exited,
            "FATAL" => ProgramState::Fatal,
            "BACKOFF" => ProgramState::Backoff,
            _ => ProgramState::Unknown,
        }
    }
}

/// One line of `supervisorctl status` output.
#[derive(Debug, Clone)]
pub struct ProgramStatus {
    /// Program name (`bot-{instanceId}`).
    pub name: String,
    /// Parsed state token.
    pub state: ProgramState,
    /// The remainder of the status line (pid, uptime, exit info).
    pub detail: String,
}

/// Parse the output of `supervisorctl status`.
pub fn parse_status(stdout: &str) -> Vec<ProgramStatus> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?.to_string();
            let state = ProgramState::parse(parts.next().unwrap_or(""));
            let detail = parts.collect::<Vec<_>>().join(" ");
            Some(ProgramStatus {
                name,
                state,
                detail,
            })
        })
        .collect()
}

/// Handle on the supervisor of one pool container.
#[derive(Clone)]
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    pool: PoolId,
}

impl Supervisor {
    /// Supervisor client for `container` of pool `pool`.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container: &str,
        pool: &PoolId,
    ) -> Self {
        Self {
            runtime,
            container: container.to_string(),
            pool: pool.clone(),
        }
    }

    async fn ctl(&self, action: &[&str]) -> Result<ExecOutput, SvcError> {
        let mut argv: Vec<&str> = SUPERVISORCTL.to_vec();
        argv.extend_from_slice(action);
        let output = self
            .runtime
            .exec(&self.container, &argv)
            .await
            .map_err(|source| SvcError::Supervisor {
                pool: self.pool.clone(),
                action: action.join(" "),
                detail: source.to_string(),
            })?;
        // supervisorctl reports failures on stdout as "name: ERROR (...)"
        let benign = output.stdout.contains("already started")
            || output.stdout.contains("not running")
            || output.stdout.contains("not in RUNNING state");
        if output.stdout.contains("ERROR") && !benign {
            return Err(SvcError::Supervisor {
                pool: self.pool.clone(),
                action: action.join(" "),
                detail: output.stdout.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Re-scan program files.
    pub async fn reread(&self) -> Result<(), SvcError> {
        self.ctl(&["reread"]).await.map(|_| ())
    }

    /// Apply added/removed program files.
    pub async fn update(&self) -> Result<(), SvcError> {
        self.ctl(&["update"]).await.map(|_| ())
    }

    /// Start a bot program. Already-started is not an error.
    pub async fn start(&self, instance: &InstanceId) -> Result<(), SvcError> {
        let prog = program_name(instance);
        self.ctl(&["start", &prog]).await.map(|_| ())
    }

    /// Stop a bot program. Not-running is not an error.
    pub async fn stop(&self, instance: &InstanceId) -> Result<(), SvcError> {
        let prog = program_name(instance);
        self.ctl(&["stop", &prog]).await.map(|_| ())
    }

    /// Restart a bot program.
    pub async fn restart(&self, instance: &InstanceId) -> Result<(), SvcError> {
        let prog = program_name(instance);
        self.ctl(&["restart", &prog]).await.map(|_| ())
    }

    /// Drop a bot program from the supervisor.
    pub async fn remove(&self, instance: &InstanceId) -> Result<(), SvcError> {
        let prog = program_name(instance);
        self.ctl(&["remove", &prog]).await.map(|_| ())
    }

    /// Status of every supervised program.
    pub async fn status(&self) -> Result<Vec<ProgramStatus>, SvcError> {
        // status exits non-zero when any program is down; its stdout is
        // still the full table, so bypass the ERROR scan
        let mut argv: Vec<&str> = SUPERVISORCTL.to_vec();
        argv.push("status");
        let output = self
            .runtime
            .exec(&self.container, &argv)
            .await
            .map_err(|source| SvcError::Supervisor {
                pool: self.pool.clone(),
                action: "status".to_string(),
                detail: source.to_string(),
            })?;
        Ok(parse_status(&output.stdout))
    }

    /// State of one bot program; `None` when the supervisor does not list it.
    pub async fn program_state(
        &self,
        instance: &InstanceId,
    ) -> Result<Option<ProgramState>, SvcError> {
        let prog = program_name(instance);
        Ok(self
            .status()
            .await?
            .into_iter()
            .find(|p| p.name == prog)
            .map(|p| p.state))
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines_parse() {
        let out = "bot-b1    RUNNING   pid 42, uptime 1:02:03\n\
                   bot-b2    FATAL     Exited too quickly\n\
                   bot-b3    BACKOFF   restarting\n\
                   bot-b4    STOPPED   Not started\n";
        let programs = parse_status(out);
        assert_eq!(programs.len(), 4);
        assert_eq!(programs[0].name, "bot-b1");
        assert_eq!(programs[0].state, ProgramState::Running);
        assert!(programs[0].detail.contains("uptime"));
        assert_eq!(programs[1].state, ProgramState::Fatal);
        assert_eq!(programs[2].state, ProgramState::Backoff);
        assert_eq!(programs[3].state, ProgramState::Stopped);
    }

    #[test]
    fn empty_status_is_empty() {
        assert!(parse_status("").is_empty());
    }

    #[test]
    fn program_names_map_to_instances() {
        let instance = InstanceId::from("bot-7f");
        let prog = program_name(&instance);
        assert_eq!(prog, "bot-bot-7f");
        assert_eq!(instance_of(&prog), Some(instance));
        assert_eq!(instance_of("nginx"), None);
    }
}
