// file: src/executor/mod.rs
// version: 2.0.0
// guid: exec0001-2345-6789-abcd-ef0123456789

//! Command execution abstraction
//!
//! A [`CommandExecutor`] runs a named program with arguments and returns its
//! combined stdout and stderr. Implementations decide where the program runs:
//! - [`NativeExecutor`]: directly on the host
//! - [`ContainerExecutor`]: inside an already running container
//! - [`UnifiedExecutor`]: picks one of the above per [`ExecutionMode`]
//! - [`SshExecutor`]: on a remote host, used for the BMC
//!
//! No shell is implied by `execute`; shell pipelines are spelled out as
//! `sh -c ...` by the caller.

pub mod container;
pub mod native;
pub mod ssh;
pub mod unified;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use container::ContainerExecutor;
pub use native::NativeExecutor;
pub use ssh::SshExecutor;
pub use unified::UnifiedExecutor;

use crate::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Where privileged commands run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Directly on the host
    Native,
    /// Inside a tool container
    Container,
    /// Native on Linux, container elsewhere
    #[default]
    Auto,
}

impl ExecutionMode {
    /// Resolve `Auto` against the host OS
    pub fn resolve(self, is_linux: bool) -> ExecutionMode {
        match self {
            ExecutionMode::Auto if is_linux => ExecutionMode::Native,
            ExecutionMode::Auto => ExecutionMode::Container,
            other => other,
        }
    }
}

/// Trait for executing commands on the host, in a container or remotely
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `name args`, returning combined output; non-zero exit is an error
    async fn execute(&self, cancel: &CancellationToken, name: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Run `name args` with `input` on stdin
    async fn execute_with_input(
        &self,
        cancel: &CancellationToken,
        input: &[u8],
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>>;

    /// Run `name args` with `dir` as the working directory, creating it first
    async fn execute_in_path(
        &self,
        cancel: &CancellationToken,
        dir: &str,
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>>;

    /// Short human-readable description of where commands run
    fn describe(&self) -> String;
}

/// Shorthand for running `sh -c <script>` through an executor
pub async fn run_shell(
    executor: &dyn CommandExecutor,
    cancel: &CancellationToken,
    script: &str,
) -> Result<Vec<u8>> {
    executor.execute(cancel, "sh", &["-c", script]).await
}

/// Convert an argument slice to owned strings for error reporting
pub(crate) fn owned_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}
