// file: src/tools/network.rs
// version: 2.0.0
// guid: 8d2f6b1a-3e4c-4a97-b5d0-7c9e1f2a6b34

//! Hostname and static network configuration for a mounted root

use super::filesystem::FilesystemTool;
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tokio_util::sync::CancellationToken;
use tracing::info;

const INTERFACE: &str = "eth0";
const FALLBACK_PREFIX: u32 = 24;

/// Static addressing for one node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub hostname: String,
    /// Address in CIDR notation, e.g. `192.168.1.3/24`
    pub address: String,
    pub gateway: String,
    #[serde(default)]
    pub dns: Vec<String>,
}

impl NetworkConfig {
    pub fn new(
        hostname: impl Into<String>,
        address: impl Into<String>,
        gateway: impl Into<String>,
        dns: Vec<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
            gateway: gateway.into(),
            dns,
        }
    }

    /// Reject empty hostnames and addresses that are not IPv4
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() || self.hostname.contains(char::is_whitespace) {
            return Err(ProvisionError::config(format!("invalid hostname: {:?}", self.hostname)));
        }
        let (ip, _) = split_cidr(&self.address);
        ip.parse::<Ipv4Addr>()
            .map_err(|_| ProvisionError::config(format!("invalid address: {}", self.address)))?;
        self.gateway
            .parse::<Ipv4Addr>()
            .map_err(|_| ProvisionError::config(format!("invalid gateway: {}", self.gateway)))?;
        for server in &self.dns {
            server
                .parse::<Ipv4Addr>()
                .map_err(|_| ProvisionError::config(format!("invalid nameserver: {}", server)))?;
        }
        Ok(())
    }
}

/// Which network configuration file was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFormat {
    Netplan,
    Interfaces,
}

/// Writes hostname, hosts and interface configuration into a mounted root
#[derive(Clone)]
pub struct NetworkTool {
    fs: FilesystemTool,
}

impl NetworkTool {
    pub fn new(fs: FilesystemTool) -> Self {
        Self { fs }
    }

    pub async fn set_hostname(&self, cancel: &CancellationToken, root: &str, hostname: &str) -> Result<()> {
        self.fs
            .write_file(cancel, root, "etc/hostname", format!("{}\n", hostname).as_bytes(), 0o644)
            .await?;
        self.fs
            .write_file(cancel, root, "etc/hosts", render_hosts(hostname).as_bytes(), 0o644)
            .await?;
        Ok(())
    }

    /// Write hostname, hosts and either netplan or legacy interfaces
    pub async fn configure(
        &self,
        cancel: &CancellationToken,
        root: &str,
        config: &NetworkConfig,
    ) -> Result<NetworkFormat> {
        config.validate()?;
        self.set_hostname(cancel, root, &config.hostname).await?;

        let format = if self.fs.is_dir(cancel, root, "etc/netplan").await? {
            self.fs
                .write_file(
                    cancel,
                    root,
                    "etc/netplan/01-netcfg.yaml",
                    render_netplan(config).as_bytes(),
                    0o600,
                )
                .await?;
            NetworkFormat::Netplan
        } else {
            self.fs.mkdir(cancel, root, "etc/network", 0o755).await?;
            self.fs
                .write_file(
                    cancel,
                    root,
                    "etc/network/interfaces",
                    render_interfaces(config).as_bytes(),
                    0o644,
                )
                .await?;
            NetworkFormat::Interfaces
        };

        info!(hostname = %config.hostname, address = %config.address, "Network configured ({:?})", format);
        Ok(format)
    }
}

/// Dotted-quad netmask for a prefix length; anything above 32 becomes /24
pub fn cidr_to_netmask(prefix: u32) -> String {
    let prefix = if prefix > 32 { FALLBACK_PREFIX } else { prefix };
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ipv4Addr::from(mask).to_string()
}

/// Split `a.b.c.d/n` into address and prefix, falling back to /24
fn split_cidr(cidr: &str) -> (&str, u32) {
    match cidr.split_once('/') {
        Some((ip, prefix)) => (ip, prefix.parse().unwrap_or(FALLBACK_PREFIX)),
        None => (cidr, FALLBACK_PREFIX),
    }
}

pub fn render_hosts(hostname: &str) -> String {
    format!("127.0.0.1\tlocalhost\n127.0.1.1\t{}\n\n", hostname)
}

pub fn render_netplan(config: &NetworkConfig) -> String {
    format!(
        r#"network:
  version: 2
  renderer: networkd
  ethernets:
    {interface}:
      dhcp4: no
      addresses: [{address}]
      gateway4: {gateway}
      nameservers:
        addresses: [{dns}]
"#,
        interface = INTERFACE,
        address = config.address,
        gateway = config.gateway,
        dns = config.dns.join(", ")
    )
}

pub fn render_interfaces(config: &NetworkConfig) -> String {
    let (ip, prefix) = split_cidr(&config.address);
    let mut out = format!(
        "auto lo\niface lo inet loopback\n\nauto {iface}\niface {iface} inet static\naddress {ip}\nnetmask {mask}\ngateway {gw}\n",
        iface = INTERFACE,
        ip = ip,
        mask = cidr_to_netmask(prefix),
        gw = config.gateway
    );
    if !config.dns.is_empty() {
        out.push_str(&format!("dns-nameservers {}\n", config.dns.join(" ")));
    }
    out
}
