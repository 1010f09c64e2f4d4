// file: src/config/mod.rs
// version: 2.0.0
// guid: a1b2c3d4-e5f6-7a8b-9c0d-1e2f3a4b5c6d

//! Configuration module for the provisioner
//!
//! Handles loading and validation of the tool-provider configuration: cache
//! locations, SSH endpoints for the BMC, the remote cache and every node.

pub mod loader;
pub mod ssh;

pub use loader::ConfigLoader;
pub use ssh::{HostKeyPolicy, NodeSshConfig, RemoteCacheConfig, SshEndpoint};

use crate::error::ProvisionError;
use crate::executor::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Number of compute module slots on the board
pub const MAX_NODES: u8 = 4;

/// Default interval between background cache index refreshes
pub const DEFAULT_INDEX_REFRESH_SECS: u64 = 300;

/// Top-level provisioner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Local cache directory (absolute after loading)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Cache the BMC can read from, reached over SSH
    #[serde(default)]
    pub remote_cache: Option<RemoteCacheConfig>,
    /// SSH endpoint of the BMC itself
    #[serde(default)]
    pub bmc: Option<SshEndpoint>,
    /// Per-slot node SSH configuration
    #[serde(default)]
    pub nodes: HashMap<u8, NodeSshConfig>,
    /// How privileged image commands are executed
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Background index refresh interval in seconds
    #[serde(default = "default_index_refresh")]
    pub index_refresh_secs: u64,
}

/// Execution backend configuration for image tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// native, container or auto
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Image used for tool containers; must ship kpartx, xz, parted, e2fsprogs
    #[serde(default = "default_tool_image")]
    pub image: String,
    /// Keep one container alive for the executor's lifetime
    #[serde(default = "default_true")]
    pub persistent: bool,
    /// Extra host -> container bind mounts
    #[serde(default)]
    pub extra_mounts: HashMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            image: default_tool_image(),
            persistent: true,
            extra_mounts: HashMap::new(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("turingpi-provisioner")
}

fn default_index_refresh() -> u64 {
    DEFAULT_INDEX_REFRESH_SECS
}

fn default_tool_image() -> String {
    "ubuntu:24.04".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            remote_cache: None,
            bmc: None,
            nodes: HashMap::new(),
            executor: ExecutorConfig::default(),
            index_refresh_secs: DEFAULT_INDEX_REFRESH_SECS,
        }
    }
}

impl ProvisionerConfig {
    /// Validate the provisioner configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ProvisionError::config("cache_dir cannot be empty"));
        }

        if !self.cache_dir.is_absolute() {
            return Err(ProvisionError::config(format!(
                "cache_dir must be absolute: {}",
                self.cache_dir.display()
            )));
        }

        if let Some(remote) = &self.remote_cache {
            remote.validate()?;
        }

        if let Some(bmc) = &self.bmc {
            bmc.validate().map_err(|e| e.wrap("validate", "bmc"))?;
        }

        for (id, node) in &self.nodes {
            if *id == 0 || *id > MAX_NODES {
                return Err(ProvisionError::config(format!(
                    "Node id {} outside 1..={}",
                    id, MAX_NODES
                )));
            }
            node.endpoint
                .validate()
                .map_err(|e| e.wrap("validate", format!("node {}", id)))?;
        }

        if self.index_refresh_secs == 0 {
            return Err(ProvisionError::config("index_refresh_secs must be positive"));
        }

        Ok(())
    }
}
