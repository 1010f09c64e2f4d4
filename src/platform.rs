// file: src/platform.rs
// version: 1.0.0
// guid: 4b1d7e0a-93c2-4f6e-8a51-c2e7d9f0b314

//! Host platform detection

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Container engine CLI used for probing and forced removal
pub const ENGINE_CLI: &str = "docker";

/// Upper bound for the engine `version` probe
pub const ENGINE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers the two questions platform-aware dispatch needs
#[async_trait::async_trait]
pub trait PlatformProbe: Send + Sync {
    /// Whether the host OS is Linux
    fn is_linux(&self) -> bool;

    /// Whether a container engine answers a `version` call right now
    async fn container_engine_available(&self) -> bool;
}

/// Probe backed by the real host
#[derive(Debug, Clone, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl PlatformProbe for SystemProbe {
    fn is_linux(&self) -> bool {
        is_linux()
    }

    async fn container_engine_available(&self) -> bool {
        container_engine_available().await
    }
}

/// Whether this process runs on Linux
pub fn is_linux() -> bool {
    cfg!(target_os = "linux")
}

/// Invoke `docker version` with a short timeout; the result is not cached
pub async fn container_engine_available() -> bool {
    if which::which(ENGINE_CLI).is_err() {
        debug!("{} not found in PATH", ENGINE_CLI);
        return false;
    }

    let status = Command::new(ENGINE_CLI)
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(ENGINE_PROBE_TIMEOUT, status).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            debug!("Container engine probe failed: {}", e);
            false
        }
        Err(_) => {
            debug!("Container engine probe timed out");
            false
        }
    }
}

/// Probe with fixed answers, for tests and dry runs
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    pub linux: bool,
    pub engine: bool,
}

#[async_trait::async_trait]
impl PlatformProbe for StaticProbe {
    fn is_linux(&self) -> bool {
        self.linux
    }

    async fn container_engine_available(&self) -> bool {
        self.engine
    }
}
