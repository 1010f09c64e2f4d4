// file: src/tools/node.rs
// version: 1.0.0
// guid: 2c6a9e4f-8b3d-4f15-a7e0-1d5c8b2f9a63

//! SSH client for one compute node slot

use crate::config::NodeSshConfig;
use crate::error::{ProvisionError, Result};
use crate::ssh::SshSession;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Delay between connection attempts in [`NodeClient::wait_for_ssh`]
pub const SSH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Lazily connected SSH client for a node
pub struct NodeClient {
    node: u8,
    config: NodeSshConfig,
    session: Mutex<Option<Arc<SshSession>>>,
}

impl NodeClient {
    pub fn new(node: u8, config: NodeSshConfig) -> Self {
        Self {
            node,
            config,
            session: Mutex::new(None),
        }
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    pub fn host(&self) -> &str {
        &self.config.endpoint.host
    }

    async fn session(&self) -> Result<Arc<SshSession>> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(SshSession::connect(&self.config.endpoint).await?);
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Poll until an SSH session can be established or `timeout` elapses
    pub async fn wait_for_ssh(&self, cancel: &CancellationToken, timeout: Duration) -> Result<()> {
        info!(node = self.node, host = %self.host(), "Waiting for SSH ({:?})", timeout);
        let start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::cancelled(format!("waiting for node {}", self.node)));
            }
            match self.session().await {
                Ok(_) => {
                    info!(node = self.node, "SSH available after {:?}", start.elapsed());
                    return Ok(());
                }
                Err(e) => debug!(node = self.node, "SSH not ready: {}", e),
            }
            if start.elapsed() + SSH_POLL_INTERVAL > timeout {
                return Err(ProvisionError::transport(format!(
                    "node {} ({}) not reachable over SSH within {:?}",
                    self.node,
                    self.host(),
                    timeout
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(SSH_POLL_INTERVAL) => {}
            }
        }
    }

    /// Run a command, failing on non-zero exit
    pub async fn execute(&self, cancel: &CancellationToken, command: &str) -> Result<()> {
        self.execute_with_output(cancel, command).await.map(|_| ())
    }

    /// Run a command and return its combined output
    pub async fn execute_with_output(&self, cancel: &CancellationToken, command: &str) -> Result<String> {
        let session = self.session().await?;
        let timeout = Duration::from_secs(self.config.command_timeout_secs.max(1));
        let output = tokio::time::timeout(timeout, session.exec(cancel, command, None))
            .await
            .map_err(|_| {
                ProvisionError::transport(format!("command timed out after {:?}", timeout))
                    .wrap("execute", format!("node {}", self.node))
            })??;

        if output.exit_status != 0 {
            return Err(ProvisionError::command_failed(
                command,
                &[],
                Some(output.exit_status as i64),
                &output.combined,
                Some(format!("on node {}", self.node)),
            ));
        }
        Ok(String::from_utf8_lossy(&output.combined).to_string())
    }

    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let session = self.session().await?;
        session.upload_file(local_path, remote_path).await
    }

    /// Drop the cached session
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.disconnect().await;
        }
    }
}
