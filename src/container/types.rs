// file: src/container/types.rs
// version: 1.0.0
// guid: 7c2e91d4-5b8a-4f03-a6e7-1d9c3b2f8e45

//! Container records and creation parameters

use bollard::container::Config;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resource limits passed through to the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_shares: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub memory_bytes: Option<i64>,
    pub memory_swap_bytes: Option<i64>,
    pub blkio_weight: Option<u16>,
}

/// Parameters for creating a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    /// host path -> container path
    pub mounts: HashMap<String, String>,
    pub workdir: Option<String>,
    pub network_mode: Option<String>,
    pub privileged: bool,
    pub capabilities: Vec<String>,
    pub resources: ResourceLimits,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn mount(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.mounts.insert(host.into(), container.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.push(cap.into());
        self
    }

    pub fn resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    /// Engine create payload
    pub(crate) fn to_engine_config(&self) -> Config<String> {
        let mut binds: Vec<String> = self
            .mounts
            .iter()
            .map(|(host, container)| format!("{}:{}", host, container))
            .collect();
        binds.sort();

        let mut env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let host_config = HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            privileged: Some(self.privileged),
            cap_add: (!self.capabilities.is_empty()).then(|| self.capabilities.clone()),
            network_mode: self.network_mode.clone(),
            cpu_shares: self.resources.cpu_shares,
            cpu_quota: self.resources.cpu_quota,
            cpu_period: self.resources.cpu_period,
            cpuset_cpus: self.resources.cpuset_cpus.clone(),
            cpuset_mems: self.resources.cpuset_mems.clone(),
            memory: self.resources.memory_bytes,
            memory_swap: self.resources.memory_swap_bytes,
            blkio_weight: self.resources.blkio_weight,
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            cmd: (!self.command.is_empty()).then(|| self.command.clone()),
            env: (!env.is_empty()).then_some(env),
            working_dir: self.workdir.clone(),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

/// Lifecycle state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl From<ContainerStateStatusEnum> for ContainerStatus {
    fn from(status: ContainerStateStatusEnum) -> Self {
        match status {
            ContainerStateStatusEnum::CREATED => Self::Created,
            ContainerStateStatusEnum::RUNNING => Self::Running,
            ContainerStateStatusEnum::PAUSED => Self::Paused,
            ContainerStateStatusEnum::RESTARTING => Self::Restarting,
            ContainerStateStatusEnum::REMOVING => Self::Removing,
            ContainerStateStatusEnum::EXITED => Self::Exited,
            ContainerStateStatusEnum::DEAD => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

/// A container owned by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub status: ContainerStatus,
    pub running: bool,
    pub paused: bool,
    pub oom_killed: bool,
    pub dead: bool,
    pub pid: Option<i64>,
    pub error: Option<String>,
    pub restart_count: i64,
}

impl Container {
    /// Record for a container that was just created from `config`
    pub(crate) fn created(id: String, config: &ContainerConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            image: config.image.clone(),
            command: config.command.clone(),
            created: Some(Utc::now()),
            started: None,
            finished: None,
            exit_code: None,
            status: ContainerStatus::Created,
            running: false,
            paused: false,
            oom_killed: false,
            dead: false,
            pid: None,
            error: None,
            restart_count: 0,
        }
    }

    /// Build a record from an engine inspect response
    pub(crate) fn from_inspect(inspect: ContainerInspectResponse) -> Self {
        let state = inspect.state.unwrap_or_default();
        let mut command = Vec::new();
        if let Some(path) = inspect.path {
            command.push(path);
        }
        command.extend(inspect.args.unwrap_or_default());

        Self {
            id: inspect.id.unwrap_or_default(),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: inspect
                .config
                .and_then(|c| c.image)
                .or(inspect.image)
                .unwrap_or_default(),
            command,
            created: parse_engine_time(inspect.created.as_deref()),
            started: parse_engine_time(state.started_at.as_deref()),
            finished: parse_engine_time(state.finished_at.as_deref()),
            exit_code: state.exit_code,
            status: state
                .status
                .map(ContainerStatus::from)
                .unwrap_or(ContainerStatus::Unknown),
            running: state.running.unwrap_or(false),
            paused: state.paused.unwrap_or(false),
            oom_killed: state.oom_killed.unwrap_or(false),
            dead: state.dead.unwrap_or(false),
            pid: state.pid.filter(|pid| *pid > 0),
            error: state.error.filter(|e| !e.is_empty()),
            restart_count: inspect.restart_count.unwrap_or(0),
        }
    }
}

/// The engine reports unset times as the zero timestamp
fn parse_engine_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if raw.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Point-in-time resource usage of a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_total_usage: u64,
    pub system_cpu_usage: Option<u64>,
    pub online_cpus: Option<u64>,
    pub memory_usage: Option<u64>,
    pub memory_limit: Option<u64>,
    pub pids: Option<u64>,
}

/// Output of an exec inside a container
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// stdout and stderr in the order the engine delivered them
    pub output: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::ContainerState;

    #[test]
    fn test_engine_config_mapping() {
        let config = ContainerConfig::new("ubuntu:24.04", "turingpi-tools-1")
            .command(["sleep", "infinity"])
            .mount("/dev", "/dev")
            .mount("/var/cache/tpi", "/cache")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .privileged(true)
            .capability("SYS_ADMIN")
            .resources(ResourceLimits {
                memory_bytes: Some(1 << 30),
                ..Default::default()
            });

        let engine = config.to_engine_config();
        let host = engine.host_config.unwrap();
        assert_eq!(engine.image.as_deref(), Some("ubuntu:24.04"));
        assert_eq!(engine.cmd.unwrap(), vec!["sleep", "infinity"]);
        assert_eq!(
            host.binds.unwrap(),
            vec!["/dev:/dev".to_string(), "/var/cache/tpi:/cache".to_string()]
        );
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.cap_add.unwrap(), vec!["SYS_ADMIN"]);
        assert_eq!(host.memory, Some(1 << 30));
        assert_eq!(engine.env.unwrap(), vec!["DEBIAN_FRONTEND=noninteractive"]);
    }

    #[test]
    fn test_from_inspect() {
        let inspect = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            name: Some("/turingpi-exec-1".to_string()),
            path: Some("sleep".to_string()),
            args: Some(vec!["infinity".to_string()]),
            created: Some("2024-05-01T10:00:00.000000000Z".to_string()),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::EXITED),
                running: Some(false),
                exit_code: Some(137),
                finished_at: Some("2024-05-01T10:05:00Z".to_string()),
                started_at: Some("0001-01-01T00:00:00Z".to_string()),
                pid: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = Container::from_inspect(inspect);
        assert_eq!(container.name, "turingpi-exec-1");
        assert_eq!(container.command, vec!["sleep", "infinity"]);
        assert_eq!(container.status, ContainerStatus::Exited);
        assert_eq!(container.exit_code, Some(137));
        assert!(container.started.is_none());
        assert!(container.finished.is_some());
        assert!(container.pid.is_none());
    }
}
