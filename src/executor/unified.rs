// file: src/executor/unified.rs
// version: 1.0.0
// guid: e6f0b4a2-1c8d-47e3-a95b-3d2e7f9c1a58

//! Mode-selecting executor used by the image tools
//!
//! In native mode every call goes straight to the host. In container mode the
//! executor either keeps one privileged tool container for its whole lifetime
//! or creates a fresh container per call and removes it before returning.
//! Mounts and partition mappings only survive between calls in the persistent
//! variant, so the tool provider uses that one.

use super::{CommandExecutor, ContainerExecutor, ExecutionMode, NativeExecutor};
use crate::config::ExecutorConfig;
use crate::container::{managed_name, ContainerConfig, ContainerRegistry, EXEC_PREFIX, TOOLS_PREFIX};
use crate::error::{ProvisionError, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The three executor entry points, carried through dispatch
#[derive(Clone, Copy)]
enum Call<'a> {
    Plain,
    Input(&'a [u8]),
    InPath(&'a str),
}

async fn dispatch(
    executor: &dyn CommandExecutor,
    cancel: &CancellationToken,
    call: Call<'_>,
    name: &str,
    args: &[&str],
) -> Result<Vec<u8>> {
    match call {
        Call::Plain => executor.execute(cancel, name, args).await,
        Call::Input(input) => executor.execute_with_input(cancel, input, name, args).await,
        Call::InPath(dir) => executor.execute_in_path(cancel, dir, name, args).await,
    }
}

struct ContainerBackend {
    registry: Arc<ContainerRegistry>,
    image: String,
    persistent: bool,
    mounts: Vec<(String, String)>,
    tools: Mutex<Option<ContainerExecutor>>,
}

impl ContainerBackend {
    fn container_config(&self, prefix: &str) -> ContainerConfig {
        let mut config = ContainerConfig::new(&self.image, managed_name(prefix))
            .command(["sleep", "infinity"])
            .privileged(true)
            .capability("SYS_ADMIN")
            .mount("/dev", "/dev");
        for (host, container) in &self.mounts {
            config = config.mount(host, container);
        }
        config
    }

    /// Start the tool container on first use
    async fn persistent_executor(&self, cancel: &CancellationToken) -> Result<ContainerExecutor> {
        let mut tools = self.tools.lock().await;
        if let Some(executor) = tools.as_ref() {
            return Ok(executor.clone());
        }

        let config = self.container_config(TOOLS_PREFIX);
        let container = self.registry.create(cancel, &config).await?;
        if let Err(e) = self.registry.start(cancel, &container.id).await {
            self.discard(&container.id).await;
            return Err(e.wrap("start tool container", &config.name));
        }
        info!(name = %config.name, image = %self.image, "Tool container running");

        let executor = ContainerExecutor::new(Arc::clone(&self.registry), container.id);
        *tools = Some(executor.clone());
        Ok(executor)
    }

    async fn run_ephemeral(
        &self,
        cancel: &CancellationToken,
        call: Call<'_>,
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let config = self.container_config(EXEC_PREFIX);
        let container = self.registry.create(cancel, &config).await?;
        debug!(name = %config.name, "Ephemeral container created for {}", name);

        let result = async {
            self.registry.start(cancel, &container.id).await?;
            let executor = ContainerExecutor::new(Arc::clone(&self.registry), container.id.clone());
            dispatch(&executor, cancel, call, name, args).await
        }
        .await;

        self.discard(&container.id).await;
        result
    }

    /// Stop and remove, logging failures
    async fn discard(&self, id: &str) {
        let cleanup = CancellationToken::new();
        if let Err(e) = self.registry.stop(&cleanup, id, Some(0)).await {
            debug!("Stop before removal failed: {}", e);
        }
        if let Err(e) = self.registry.force_remove(&cleanup, id).await {
            warn!("Failed to remove container {}: {}", id, e);
        }
    }

    async fn close(&self) {
        if let Some(executor) = self.tools.lock().await.take() {
            self.discard(executor.container_id()).await;
        }
    }
}

/// Executor that runs natively or in a container depending on the mode
pub struct UnifiedExecutor {
    mode: ExecutionMode,
    native: NativeExecutor,
    container: Option<ContainerBackend>,
}

impl UnifiedExecutor {
    /// Plain native executor
    pub fn native() -> Self {
        Self {
            mode: ExecutionMode::Native,
            native: NativeExecutor::new(),
            container: None,
        }
    }

    /// Build from configuration; `Auto` is resolved against `is_linux`
    ///
    /// The cache directory is bind-mounted at the same path so host paths
    /// handed to the tools are valid inside the container.
    pub fn new(
        config: &ExecutorConfig,
        cache_dir: &Path,
        registry: Option<Arc<ContainerRegistry>>,
        is_linux: bool,
    ) -> Result<Self> {
        let mode = config.mode.resolve(is_linux);
        if mode == ExecutionMode::Native {
            return Ok(Self::native());
        }

        let registry = registry.ok_or_else(|| {
            ProvisionError::precondition("container execution requires a reachable container engine")
        })?;

        let cache = cache_dir.to_string_lossy().to_string();
        let mut mounts = vec![(cache.clone(), cache)];
        let mut extra: Vec<(String, String)> = config
            .extra_mounts
            .iter()
            .map(|(h, c)| (h.clone(), c.clone()))
            .collect();
        extra.sort();
        mounts.extend(extra);

        Ok(Self {
            mode,
            native: NativeExecutor::new(),
            container: Some(ContainerBackend {
                registry,
                image: config.image.clone(),
                persistent: config.persistent,
                mounts,
                tools: Mutex::new(None),
            }),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Remove the persistent tool container, if one was started
    pub async fn close(&self) {
        if let Some(backend) = &self.container {
            backend.close().await;
        }
    }

    async fn run(&self, cancel: &CancellationToken, call: Call<'_>, name: &str, args: &[&str]) -> Result<Vec<u8>> {
        match &self.container {
            None => dispatch(&self.native, cancel, call, name, args).await,
            Some(backend) if backend.persistent => {
                let executor = backend.persistent_executor(cancel).await?;
                dispatch(&executor, cancel, call, name, args).await
            }
            Some(backend) => backend.run_ephemeral(cancel, call, name, args).await,
        }
    }
}

#[async_trait::async_trait]
impl CommandExecutor for UnifiedExecutor {
    async fn execute(&self, cancel: &CancellationToken, name: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.run(cancel, Call::Plain, name, args).await
    }

    async fn execute_with_input(
        &self,
        cancel: &CancellationToken,
        input: &[u8],
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        self.run(cancel, Call::Input(input), name, args).await
    }

    async fn execute_in_path(
        &self,
        cancel: &CancellationToken,
        dir: &str,
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        self.run(cancel, Call::InPath(dir), name, args).await
    }

    fn describe(&self) -> String {
        match &self.container {
            None => "native".to_string(),
            Some(backend) if backend.persistent => format!("persistent container ({})", backend.image),
            Some(backend) => format!("ephemeral container ({})", backend.image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_auto_on_linux_is_native() {
        let config = ExecutorConfig::default();
        let executor = UnifiedExecutor::new(&config, Path::new("/var/cache/tpi"), None, true).unwrap();
        assert_eq!(executor.mode(), ExecutionMode::Native);
        assert_eq!(executor.describe(), "native");
    }

    #[test]
    fn test_container_mode_without_engine_fails() {
        let config = ExecutorConfig {
            mode: ExecutionMode::Container,
            ..Default::default()
        };
        let err = UnifiedExecutor::new(&config, Path::new("/var/cache/tpi"), None, true)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_dispatch_paths() {
        let executor = UnifiedExecutor::native();
        let cancel = CancellationToken::new();
        let out = executor
            .execute_with_input(&cancel, b"abc", "cat", &[])
            .await
            .unwrap();
        assert_eq!(out, b"abc");
        executor.close().await;
    }
}
