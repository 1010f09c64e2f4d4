// file: src/executor/container.rs
// version: 1.0.0
// guid: c3a7e1f9-4d26-4b80-95e2-7f1b8d6c0a43

//! Command execution inside a running container

use super::CommandExecutor;
use crate::container::ContainerRegistry;
use crate::error::{ProvisionError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pipes a staged input file into the command, then removes it
const STDIN_WRAPPER: &str = r#""$@" < "$0"; rc=$?; rm -f "$0"; exit $rc"#;

/// Changes into `$1` before running the rest of the arguments
const CHDIR_WRAPPER: &str = r#"cd "$1" && shift && exec "$@""#;

/// Runs commands through the engine exec API in one container
#[derive(Clone)]
pub struct ContainerExecutor {
    registry: Arc<ContainerRegistry>,
    container_id: String,
}

impl ContainerExecutor {
    /// Executor bound to an already running container
    pub fn new(registry: Arc<ContainerRegistry>, container_id: impl Into<String>) -> Self {
        Self {
            registry,
            container_id: container_id.into(),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn exec(&self, cancel: &CancellationToken, cmd: &[&str]) -> Result<Vec<u8>> {
        self.registry.exec(cancel, &self.container_id, cmd).await
    }
}

/// `sh -c <wrapper> <$0> <$1..>` argument vector
fn wrapped<'a>(wrapper: &'a str, zeroth: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
    let mut cmd = vec!["sh", "-c", wrapper, zeroth];
    cmd.extend_from_slice(rest);
    cmd
}

#[async_trait::async_trait]
impl CommandExecutor for ContainerExecutor {
    async fn execute(&self, cancel: &CancellationToken, name: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Vec::with_capacity(args.len() + 1);
        cmd.push(name);
        cmd.extend_from_slice(args);
        self.exec(cancel, &cmd).await
    }

    async fn execute_with_input(
        &self,
        cancel: &CancellationToken,
        input: &[u8],
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let staged = format!("/tmp/turingpi-stdin-{}", uuid::Uuid::new_v4().simple());
        self.registry
            .copy_bytes_to(cancel, &self.container_id, &staged, input, 0o600)
            .await
            .map_err(|e| e.wrap("stage stdin", name))?;
        debug!(path = %staged, bytes = input.len(), "Staged stdin in container");

        let mut rest = vec![name];
        rest.extend_from_slice(args);
        let result = self
            .exec(cancel, &wrapped(STDIN_WRAPPER, &staged, &rest))
            .await;

        // the wrapper removes the file itself unless the exec never ran
        if matches!(&result, Err(e) if !matches!(e, ProvisionError::CommandFailed { .. })) {
            let cleanup = CancellationToken::new();
            if let Err(e) = self.exec(&cleanup, &["rm", "-f", &staged]).await {
                warn!(path = %staged, "Failed to remove staged stdin: {}", e);
            }
        }
        result
    }

    async fn execute_in_path(
        &self,
        cancel: &CancellationToken,
        dir: &str,
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        self.exec(cancel, &["mkdir", "-p", dir]).await?;
        let mut rest = vec![dir, name];
        rest.extend_from_slice(args);
        self.exec(cancel, &wrapped(CHDIR_WRAPPER, "sh", &rest)).await
    }

    fn describe(&self) -> String {
        let id = &self.container_id;
        format!("container {}", &id[..id.len().min(12)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_wrapper_arguments() {
        let cmd = wrapped(STDIN_WRAPPER, "/tmp/in", &["base64", "-d"]);
        assert_eq!(cmd, vec!["sh", "-c", STDIN_WRAPPER, "/tmp/in", "base64", "-d"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wrappers_behave_in_local_shell() {
        use crate::executor::NativeExecutor;

        let temp = tempfile::TempDir::new().unwrap();
        let staged = temp.path().join("stdin");
        std::fs::write(&staged, "hello").unwrap();
        let staged = staged.to_str().unwrap().to_string();

        let native = NativeExecutor::new();
        let cancel = CancellationToken::new();
        let cmd = wrapped(STDIN_WRAPPER, &staged, &["cat"]);
        let out = native.execute(&cancel, cmd[0], &cmd[1..]).await.unwrap();
        assert_eq!(out, b"hello");
        assert!(!std::path::Path::new(&staged).exists());

        let dir = temp.path().to_str().unwrap();
        let cmd = wrapped(CHDIR_WRAPPER, "sh", &[dir, "pwd"]);
        let out = native.execute(&cancel, cmd[0], &cmd[1..]).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), dir);
    }
}
