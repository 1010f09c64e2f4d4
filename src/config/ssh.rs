// file: src/config/ssh.rs
// version: 1.0.0
// guid: 0f3b9c1e-6a2d-4c57-9e18-2d7b5a4c9e01

//! SSH endpoint configuration shared by the BMC, remote cache and nodes

use crate::error::ProvisionError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How unknown or changed host keys are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Host must already be present in known_hosts with a matching key
    #[default]
    Strict,
    /// Unknown hosts are recorded on first use; mismatches are still rejected
    AcceptNew,
}

/// Connection parameters for one SSH host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshEndpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    300
}

impl SshEndpoint {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: None,
            key_file: None,
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// `host:port` socket string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.host.is_empty() {
            return Err(ProvisionError::config("SSH host cannot be empty"));
        }
        if self.user.is_empty() {
            return Err(ProvisionError::config("SSH user cannot be empty"));
        }
        if self.password.is_none() && self.key_file.is_none() {
            return Err(ProvisionError::config(format!(
                "No password or key_file configured for {}",
                self.host
            )));
        }
        Ok(())
    }
}

/// Remote cache location the BMC reads images from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCacheConfig {
    #[serde(flatten)]
    pub endpoint: SshEndpoint,
    /// Base directory of the cache on the remote host
    pub remote_path: String,
}

impl RemoteCacheConfig {
    pub fn validate(&self) -> crate::Result<()> {
        self.endpoint
            .validate()
            .map_err(|e| e.wrap("validate", "remote_cache"))?;
        if !self.remote_path.starts_with('/') {
            return Err(ProvisionError::config(format!(
                "remote_path must be absolute: {}",
                self.remote_path
            )));
        }
        Ok(())
    }
}

/// SSH access to one compute node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSshConfig {
    #[serde(flatten)]
    pub endpoint: SshEndpoint,
    /// Upper bound for a single remote command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}
