// file: src/executor/ssh.rs
// version: 1.0.0
// guid: 8b5d0e27-f3a1-4c69-9d7e-2a6c4f1b8e90

//! Command execution on a remote host over SSH

use super::{owned_args, CommandExecutor};
use crate::config::SshEndpoint;
use crate::error::{ProvisionError, Result};
use crate::ssh::{command_line, shell_quote, SshSession};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs commands through an SSH session; used for the BMC
#[derive(Clone)]
pub struct SshExecutor {
    session: Arc<SshSession>,
}

impl SshExecutor {
    pub fn new(session: Arc<SshSession>) -> Self {
        Self { session }
    }

    /// Open a session and wrap it
    pub async fn connect(endpoint: &SshEndpoint) -> Result<Self> {
        Ok(Self::new(Arc::new(SshSession::connect(endpoint).await?)))
    }

    pub fn session(&self) -> &Arc<SshSession> {
        &self.session
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        line: String,
        input: Option<Vec<u8>>,
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let output = self.session.exec(cancel, &line, input).await?;
        if output.exit_status != 0 {
            return Err(ProvisionError::command_failed(
                name,
                &owned_args(args),
                Some(i64::from(output.exit_status)),
                &output.combined,
                Some(format!("on {}", self.session.endpoint().host)),
            ));
        }
        Ok(output.combined)
    }
}

#[async_trait::async_trait]
impl CommandExecutor for SshExecutor {
    async fn execute(&self, cancel: &CancellationToken, name: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.run(cancel, command_line(name, args), None, name, args).await
    }

    async fn execute_with_input(
        &self,
        cancel: &CancellationToken,
        input: &[u8],
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        self.run(cancel, command_line(name, args), Some(input.to_vec()), name, args)
            .await
    }

    async fn execute_in_path(
        &self,
        cancel: &CancellationToken,
        dir: &str,
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let quoted = shell_quote(dir);
        let line = format!("mkdir -p {} && cd {} && {}", quoted, quoted, command_line(name, args));
        self.run(cancel, line, None, name, args).await
    }

    fn describe(&self) -> String {
        format!("ssh {}", self.session.endpoint().address())
    }
}
