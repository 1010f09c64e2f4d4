// file: src/executor/native.rs
// version: 2.0.0
// guid: local001-2345-6789-abcd-ef0123456789

//! Native command execution on the host

use super::{owned_args, CommandExecutor};
use crate::error::{ProvisionError, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace period between the terminate signal and a hard kill
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Spawns commands directly through the OS `PATH`
#[derive(Debug, Clone, Default)]
pub struct NativeExecutor;

impl NativeExecutor {
    /// Create a new native executor
    pub fn new() -> Self {
        Self
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        input: Option<&[u8]>,
        dir: Option<&str>,
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::cancelled(format!("{} not started", name)));
        }

        debug!("Executing local command: {} {}", name, args.join(" "));

        let mut cmd = Command::new(name);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = dir {
            tokio::fs::create_dir_all(dir).await?;
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ProvisionError::command_failed(
                name,
                &owned_args(args),
                None,
                b"",
                Some(format!("Failed to spawn: {}", e)),
            )
        })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            let data = input.to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    debug!("stdin closed early: {}", e);
                }
            });
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let collect = async move {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let read_out = async {
                if let Some(s) = stdout.as_mut() {
                    let _ = s.read_to_end(&mut out).await;
                }
            };
            let read_err = async {
                if let Some(s) = stderr.as_mut() {
                    let _ = s.read_to_end(&mut err).await;
                }
            };
            tokio::join!(read_out, read_err);
            out.extend_from_slice(&err);
            out
        };

        let finished = tokio::select! {
            _ = cancel.cancelled() => None,
            result = async { tokio::join!(child.wait(), collect) } => Some(result),
        };

        let Some((status, combined)) = finished else {
            terminate(&mut child).await;
            return Err(ProvisionError::cancelled(format!("{} {}", name, args.join(" "))));
        };

        let status = status?;
        if !status.success() {
            return Err(ProvisionError::command_failed(
                name,
                &owned_args(args),
                status.code().map(i64::from),
                &combined,
                None,
            ));
        }

        Ok(combined)
    }
}

/// Send SIGTERM, then SIGKILL if the child outlives the grace period
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and have not reaped yet
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }

    if let Err(e) = child.start_kill() {
        warn!("Failed to kill cancelled command: {}", e);
    }
    let _ = child.wait().await;
}

#[async_trait::async_trait]
impl CommandExecutor for NativeExecutor {
    async fn execute(&self, cancel: &CancellationToken, name: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.run(cancel, None, None, name, args).await
    }

    async fn execute_with_input(
        &self,
        cancel: &CancellationToken,
        input: &[u8],
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        self.run(cancel, Some(input), None, name, args).await
    }

    async fn execute_in_path(
        &self,
        cancel: &CancellationToken,
        dir: &str,
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        self.run(cancel, None, Some(dir), name, args).await
    }

    fn describe(&self) -> String {
        "native".to_string()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_execute_combines_output() {
        let executor = NativeExecutor::new();
        let cancel = CancellationToken::new();
        let output = executor
            .execute(&cancel, "sh", &["-c", "echo out; echo err 1>&2"])
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_error() {
        let executor = NativeExecutor::new();
        let cancel = CancellationToken::new();
        let err = executor
            .execute(&cancel, "sh", &["-c", "echo NOCHANGE; exit 1"])
            .await
            .unwrap_err();
        match &err {
            ProvisionError::CommandFailed {
                command, exit_code, ..
            } => {
                assert_eq!(command, "sh");
                assert_eq!(*exit_code, Some(1));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.command_output(), Some("NOCHANGE"));
    }

    #[tokio::test]
    async fn test_execute_with_input() {
        let executor = NativeExecutor::new();
        let cancel = CancellationToken::new();
        let output = executor
            .execute_with_input(&cancel, b"\x00binary\xff", "wc", &["-c"])
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output).trim(), "8");
    }

    #[tokio::test]
    async fn test_execute_in_path_creates_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("nested/work");
        let executor = NativeExecutor::new();
        let cancel = CancellationToken::new();
        let output = executor
            .execute_in_path(&cancel, dir.to_str().unwrap(), "pwd", &[])
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&output).trim().ends_with("nested/work"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_child() {
        let executor = NativeExecutor::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let err = executor.execute(&cancel, "sleep", &["30"]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let executor = NativeExecutor::new();
        let cancel = CancellationToken::new();
        let err = executor
            .execute(&cancel, "definitely-not-a-binary-12345", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailed);
    }
}
