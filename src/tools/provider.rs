// file: src/tools/provider.rs
// version: 1.0.0
// guid: f3c8a1d6-0e5b-4927-b4a3-7d9e2c6f1b80

//! Root composition object handing out one instance of every tool

use super::bmc::BmcTool;
use super::compression::CompressionTool;
use super::download::ImageDownloader;
use super::filesystem::FilesystemTool;
use super::image::ImageTool;
use super::network::NetworkTool;
use super::node::NodeClient;
use crate::cache::{Cache, IndexManager, LocalCache, RemoteCache};
use crate::config::ProvisionerConfig;
use crate::container::{ContainerRegistry, MANAGED_PREFIXES};
use crate::error::{ProvisionError, Result};
use crate::executor::{CommandExecutor, ExecutionMode, UnifiedExecutor};
use crate::platform::{PlatformProbe, SystemProbe};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime inputs of the provider
#[derive(Clone)]
pub struct ToolsConfig {
    pub config: ProvisionerConfig,
    /// Executor that reaches the BMC's `tpi` tool
    pub bmc_executor: Option<Arc<dyn CommandExecutor>>,
    /// Replaces the unified executor underneath the image tools
    pub tools_executor: Option<Arc<dyn CommandExecutor>>,
    pub probe: Arc<dyn PlatformProbe>,
}

impl ToolsConfig {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self {
            config,
            bmc_executor: None,
            tools_executor: None,
            probe: Arc::new(SystemProbe::new()),
        }
    }

    pub fn with_bmc_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.bmc_executor = Some(executor);
        self
    }

    pub fn with_tools_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.tools_executor = Some(executor);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn PlatformProbe>) -> Self {
        self.probe = probe;
        self
    }
}

struct ProviderState {
    local_cache: Option<Arc<LocalCache>>,
    remote_cache: Option<Arc<RemoteCache>>,
    registry: Option<Arc<ContainerRegistry>>,
    executor: Arc<UnifiedExecutor>,
    filesystem: FilesystemTool,
    image: ImageTool,
    compression: CompressionTool,
    network: NetworkTool,
    bmc: Option<BmcTool>,
    nodes: HashMap<u8, Arc<NodeClient>>,
    index_managers: Vec<Arc<IndexManager>>,
}

/// Owns the caches, the container registry and every tool built on them
pub struct ToolProvider {
    state: RwLock<Option<ProviderState>>,
    probe: Arc<dyn PlatformProbe>,
    cache_dir: PathBuf,
    downloader: ImageDownloader,
}

impl ToolProvider {
    /// Build every subsystem
    ///
    /// The local cache is required. A remote cache that cannot be reached and
    /// a missing container engine only disable those parts.
    pub async fn new(tools: ToolsConfig) -> Result<Self> {
        let ToolsConfig {
            config,
            bmc_executor,
            tools_executor,
            probe,
        } = tools;

        let local = Arc::new(
            LocalCache::new(&config.cache_dir)
                .await
                .map_err(|e| e.wrap("create local cache", config.cache_dir.display().to_string()))?,
        );

        let remote = match &config.remote_cache {
            Some(remote_config) => match RemoteCache::connect(remote_config).await {
                Ok(remote) => Some(Arc::new(remote)),
                Err(e) => {
                    warn!(host = %remote_config.endpoint.host, "Remote cache unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        let registry = if probe.container_engine_available().await {
            match ContainerRegistry::connect().await {
                Ok(registry) => {
                    let swept = registry
                        .sweep_prefixes(&CancellationToken::new(), MANAGED_PREFIXES)
                        .await;
                    if swept > 0 {
                        info!("Removed {} containers left by an earlier run", swept);
                    }
                    Some(registry)
                }
                Err(e) => {
                    warn!("Container engine not usable: {}", e);
                    None
                }
            }
        } else {
            debug!("No container engine available");
            None
        };

        let executor = match UnifiedExecutor::new(
            &config.executor,
            &config.cache_dir,
            registry.clone(),
            probe.is_linux(),
        ) {
            Ok(executor) => executor,
            Err(e) => {
                warn!("Falling back to native execution: {}", e);
                UnifiedExecutor::native()
            }
        };
        let executor = Arc::new(executor);
        let shared: Arc<dyn CommandExecutor> = match tools_executor {
            Some(custom) => custom,
            None => executor.clone(),
        };
        info!(executor = %shared.describe(), "Tool executor ready");

        let filesystem = FilesystemTool::new(Arc::clone(&shared));
        let nodes = config
            .nodes
            .iter()
            .map(|(id, node)| (*id, Arc::new(NodeClient::new(*id, node.clone()))))
            .collect();

        let interval = Duration::from_secs(config.index_refresh_secs);
        let mut index_managers = vec![Arc::new(IndexManager::new(local.clone(), interval))];
        if let Some(remote) = &remote {
            index_managers.push(Arc::new(IndexManager::new(remote.clone(), interval)));
        }

        let state = ProviderState {
            local_cache: Some(local),
            remote_cache: remote,
            registry,
            image: ImageTool::new(Arc::clone(&shared)),
            compression: CompressionTool::new(Arc::clone(&shared)),
            network: NetworkTool::new(filesystem.clone()),
            filesystem,
            executor,
            bmc: bmc_executor.map(BmcTool::new),
            nodes,
            index_managers,
        };

        Ok(Self {
            state: RwLock::new(Some(state)),
            probe,
            cache_dir: config.cache_dir,
            downloader: ImageDownloader::new(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<ProviderState>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<ProviderState>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_state<T>(&self, f: impl FnOnce(&ProviderState) -> Result<T>) -> Result<T> {
        match self.read().as_ref() {
            Some(state) => f(state),
            None => Err(ProvisionError::precondition("tool provider is closed")),
        }
    }

    pub fn probe(&self) -> Arc<dyn PlatformProbe> {
        Arc::clone(&self.probe)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Scratch space for intermediate images; inside the cache dir so tool
    /// containers see the same paths
    pub fn work_dir(&self) -> PathBuf {
        self.cache_dir.join("work")
    }

    pub fn local_cache(&self) -> Result<Arc<LocalCache>> {
        self.with_state(|s| {
            s.local_cache
                .clone()
                .ok_or_else(|| ProvisionError::precondition("local cache is closed"))
        })
    }

    pub fn remote_cache(&self) -> Option<Arc<RemoteCache>> {
        self.read().as_ref().and_then(|s| s.remote_cache.clone())
    }

    pub fn container_registry(&self) -> Option<Arc<ContainerRegistry>> {
        self.read().as_ref().and_then(|s| s.registry.clone())
    }

    pub fn executor(&self) -> Result<Arc<UnifiedExecutor>> {
        self.with_state(|s| Ok(Arc::clone(&s.executor)))
    }

    pub fn execution_mode(&self) -> Result<ExecutionMode> {
        self.with_state(|s| Ok(s.executor.mode()))
    }

    pub fn filesystem(&self) -> Result<FilesystemTool> {
        self.with_state(|s| Ok(s.filesystem.clone()))
    }

    pub fn image(&self) -> Result<ImageTool> {
        self.with_state(|s| Ok(s.image.clone()))
    }

    pub fn compression(&self) -> Result<CompressionTool> {
        self.with_state(|s| Ok(s.compression.clone()))
    }

    pub fn network(&self) -> Result<NetworkTool> {
        self.with_state(|s| Ok(s.network.clone()))
    }

    pub fn bmc(&self) -> Result<BmcTool> {
        self.with_state(|s| {
            s.bmc
                .clone()
                .ok_or_else(|| ProvisionError::precondition("no BMC executor configured"))
        })
    }

    pub fn node(&self, id: u8) -> Result<Arc<NodeClient>> {
        self.with_state(|s| {
            s.nodes
                .get(&id)
                .cloned()
                .ok_or_else(|| ProvisionError::not_found(format!("no SSH configuration for node {}", id)))
        })
    }

    pub fn downloader(&self) -> ImageDownloader {
        self.downloader.clone()
    }

    /// Start background index refresh for every cache
    pub async fn start_index_refresh(&self, cancel: &CancellationToken) {
        let managers = self
            .read()
            .as_ref()
            .map(|s| s.index_managers.clone())
            .unwrap_or_default();
        for manager in managers {
            manager.start(cancel).await;
        }
    }

    /// Tear everything down; later accessor calls fail
    pub async fn close(&self) {
        let Some(state) = self.write().take() else { return };

        for manager in &state.index_managers {
            manager.stop().await;
        }
        state.executor.close().await;
        if let Some(registry) = &state.registry {
            if let Err(e) = registry.close().await {
                warn!("Container cleanup incomplete: {}", e);
            }
        }
        for node in state.nodes.values() {
            node.close().await;
        }
        if let Some(remote) = &state.remote_cache {
            remote.close().await;
        }
        if let Some(local) = &state.local_cache {
            local.close().await;
        }
        info!("Tool provider closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeSshConfig, SshEndpoint};
    use crate::error::ErrorKind;
    use crate::executor::mock::MockExecutor;
    use crate::platform::StaticProbe;

    fn tools_config(cache_dir: &Path) -> ToolsConfig {
        let mut config = ProvisionerConfig {
            cache_dir: cache_dir.to_path_buf(),
            ..Default::default()
        };
        config.nodes.insert(
            1,
            NodeSshConfig {
                endpoint: SshEndpoint::new("10.0.0.11", "ubuntu").with_password("ubuntu-pass"),
                command_timeout_secs: 30,
            },
        );
        ToolsConfig::new(config).with_probe(Arc::new(StaticProbe {
            linux: true,
            engine: false,
        }))
    }

    #[tokio::test]
    async fn test_provider_without_engine_or_remote() {
        let temp = tempfile::TempDir::new().unwrap();
        let provider = ToolProvider::new(tools_config(temp.path())).await.unwrap();

        assert!(provider.local_cache().is_ok());
        assert!(provider.remote_cache().is_none());
        assert!(provider.container_registry().is_none());
        assert_eq!(provider.execution_mode().unwrap(), ExecutionMode::Native);
        assert_eq!(provider.bmc().err().unwrap().kind(), ErrorKind::PreconditionFailed);
        assert_eq!(provider.node(1).unwrap().host(), "10.0.0.11");
        assert!(provider.node(2).err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_remote_cache_is_not_fatal() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut tools = tools_config(temp.path());
        let mut endpoint = SshEndpoint::new("127.0.0.1", "root").with_password("turing");
        endpoint.port = 1;
        endpoint.connect_timeout_secs = 1;
        tools.config.remote_cache = Some(crate::config::RemoteCacheConfig {
            endpoint,
            remote_path: "/mnt/sdcard/cache".to_string(),
        });
        let provider = ToolProvider::new(tools).await.unwrap();
        assert!(provider.remote_cache().is_none());
    }

    #[tokio::test]
    async fn test_container_mode_without_engine_falls_back() {
        let temp = tempfile::TempDir::new().unwrap();
        let tools = tools_config(temp.path()).with_probe(Arc::new(StaticProbe {
            linux: false,
            engine: false,
        }));
        let provider = ToolProvider::new(tools).await.unwrap();
        assert_eq!(provider.execution_mode().unwrap(), ExecutionMode::Native);
    }

    #[tokio::test]
    async fn test_close_cascades() {
        let temp = tempfile::TempDir::new().unwrap();
        let tools = tools_config(temp.path()).with_bmc_executor(Arc::new(MockExecutor::new()));
        let provider = ToolProvider::new(tools).await.unwrap();
        assert!(provider.bmc().is_ok());

        provider.start_index_refresh(&CancellationToken::new()).await;
        provider.close().await;
        assert!(provider.local_cache().is_err());
        assert!(provider.filesystem().is_err());
        provider.close().await;
    }
}
