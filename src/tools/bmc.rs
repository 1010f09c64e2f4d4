// file: src/tools/bmc.rs
// version: 1.0.0
// guid: 5b7e2c9d-4a1f-4e86-93c2-8f0a6d1b3e72

//! BMC operations through the `tpi` command line tool
//!
//! The BMC executor decides where `tpi` runs: over SSH on the BMC itself, or
//! on a host that reaches the BMC API over the network.

use crate::config::MAX_NODES;
use crate::error::{ProvisionError, Result};
use crate::executor::CommandExecutor;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const TPI: &str = "tpi";

/// Node power action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Reset,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Reset => "reset",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PowerState {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(PowerState::On),
            "off" => Ok(PowerState::Off),
            "reset" => Ok(PowerState::Reset),
            other => Err(ProvisionError::config(format!("unknown power state: {}", other))),
        }
    }
}

/// USB routing for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMode {
    Host,
    Device,
    Flash,
}

impl UsbMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsbMode::Host => "host",
            UsbMode::Device => "device",
            UsbMode::Flash => "flash",
        }
    }
}

/// Issues `tpi` commands through an executor
#[derive(Clone)]
pub struct BmcTool {
    executor: Arc<dyn CommandExecutor>,
}

impl BmcTool {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    pub fn describe(&self) -> String {
        self.executor.describe()
    }

    pub async fn power(&self, cancel: &CancellationToken, node: u8, state: PowerState) -> Result<()> {
        let slot = slot_arg(node)?;
        self.tpi(cancel, &["power", state.as_str(), "-n", &slot]).await?;
        info!(node, "Power {}", state);
        Ok(())
    }

    /// Per-node power state from `tpi power status`
    pub async fn power_status(&self, cancel: &CancellationToken) -> Result<BTreeMap<u8, bool>> {
        let output = self.tpi(cancel, &["power", "status"]).await?;
        Ok(parse_power_status(&output))
    }

    pub async fn usb_mode(&self, cancel: &CancellationToken, node: u8, mode: UsbMode) -> Result<()> {
        let slot = slot_arg(node)?;
        self.tpi(cancel, &["usb", mode.as_str(), "-n", &slot]).await?;
        Ok(())
    }

    /// Flash `image_path`, a path on the BMC's own filesystem
    pub async fn flash(&self, cancel: &CancellationToken, node: u8, image_path: &str) -> Result<()> {
        let slot = slot_arg(node)?;
        info!(node, image = %image_path, "Flashing node");
        self.tpi(cancel, &["flash", "--local", "-n", &slot, "-i", image_path])
            .await
            .map_err(|e| e.wrap("flash", format!("node {}", node)))?;
        Ok(())
    }

    /// Buffered serial console output of a node
    pub async fn uart_get(&self, cancel: &CancellationToken, node: u8) -> Result<String> {
        let slot = slot_arg(node)?;
        self.tpi(cancel, &["uart", "-n", &slot, "get"]).await
    }

    /// Key/value pairs reported by `tpi info`
    pub async fn info(&self, cancel: &CancellationToken) -> Result<BTreeMap<String, String>> {
        let output = self.tpi(cancel, &["info"]).await?;
        Ok(parse_info(&output))
    }

    async fn tpi(&self, cancel: &CancellationToken, args: &[&str]) -> Result<String> {
        let output = self.executor.execute(cancel, TPI, args).await?;
        Ok(String::from_utf8_lossy(&output).to_string())
    }
}

fn slot_arg(node: u8) -> Result<String> {
    if node == 0 || node > MAX_NODES {
        return Err(ProvisionError::config(format!(
            "node {} outside 1..={}",
            node, MAX_NODES
        )));
    }
    Ok(node.to_string())
}

/// Parse `key: value` lines and `| key | value |` table rows
pub fn parse_info(output: &str) -> BTreeMap<String, String> {
    let mut info = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("|-") || line.starts_with("+-") {
            continue;
        }
        let pair = if line.starts_with('|') {
            let cells: Vec<&str> = line
                .trim_matches('|')
                .split('|')
                .map(str::trim)
                .collect();
            match cells.as_slice() {
                [key, value] => Some((*key, *value)),
                _ => None,
            }
        } else {
            line.split_once(':').map(|(k, v)| (k.trim(), v.trim()))
        };
        if let Some((key, value)) = pair {
            if !key.is_empty() {
                info.insert(key.to_string(), value.to_string());
            }
        }
    }
    info
}

/// Parse `node1: On` style lines
pub fn parse_power_status(output: &str) -> BTreeMap<u8, bool> {
    output
        .lines()
        .filter_map(|line| {
            let (name, state) = line.split_once(':')?;
            let slot = name.trim().trim_start_matches("node").parse::<u8>().ok()?;
            Some((slot, state.trim().eq_ignore_ascii_case("on")))
        })
        .collect()
}
