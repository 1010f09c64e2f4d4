// file: src/cli/commands.rs
// version: 2.0.0
// guid: g7h8i9j0-k1l2-3456-7890-123456ghijkl

//! Command implementations for the CLI

use super::args::{CacheCommand, DeployArgs};
use crate::{
    actions::UbuntuDeployBuilder,
    cache::{Cache, CacheMetadata, LocalCache, RemoteCache, TagFilter},
    config::{loader::ConfigLoader, ProvisionerConfig},
    error::ProvisionError,
    executor::SshExecutor,
    platform::PlatformProbe,
    tools::{NetworkConfig, ToolProvider, ToolsConfig},
    Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `<config dir>/turingpi-provisioner/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("turingpi-provisioner").join("config.yaml"))
}

/// Load the given file, the default file if it exists, or built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<ProvisionerConfig> {
    let loader = ConfigLoader::new();
    if let Some(path) = path {
        return loader.load(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => loader.load(path),
        _ => {
            let config = ProvisionerConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Print the probe results
pub async fn platform_command(probe: &dyn PlatformProbe) -> Result<()> {
    let engine = probe.container_engine_available().await;
    println!("Linux host:        {}", if probe.is_linux() { "yes" } else { "no" });
    println!("Container engine:  {}", if engine { "available" } else { "unavailable" });
    let dispatch = if probe.is_linux() {
        "native"
    } else if engine {
        "container"
    } else {
        "unsupported"
    };
    println!("Image actions run: {}", dispatch);
    Ok(())
}

async fn open_cache(config: &ProvisionerConfig, remote: bool) -> Result<Arc<dyn Cache>> {
    if remote {
        let remote_config = config
            .remote_cache
            .as_ref()
            .ok_or_else(|| ProvisionError::config("no remote_cache configured"))?;
        Ok(Arc::new(RemoteCache::connect(remote_config).await?))
    } else {
        Ok(Arc::new(LocalCache::new(&config.cache_dir).await?))
    }
}

/// Run one cache maintenance subcommand
pub async fn cache_command(
    config: &ProvisionerConfig,
    remote: bool,
    action: CacheCommand,
    cancel: &CancellationToken,
) -> Result<()> {
    let cache = open_cache(config, remote).await?;
    let result = run_cache_command(cache.as_ref(), action, cancel).await;
    cache.close().await;
    result
}

async fn run_cache_command(cache: &dyn Cache, action: CacheCommand, cancel: &CancellationToken) -> Result<()> {
    match action {
        CacheCommand::List { tags, json } => {
            let filter: TagFilter = tags.into_iter().collect();
            let entries = cache.list(cancel, &filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_entries(&cache.location(), &entries);
            }
        }
        CacheCommand::Verify => {
            let issues = cache.verify_integrity(cancel).await?;
            if issues.is_empty() {
                println!("{}: no integrity issues", cache.location());
            } else {
                for issue in &issues {
                    println!("{}", issue);
                }
                return Err(ProvisionError::integrity(format!(
                    "{} integrity issues in {}",
                    issues.len(),
                    cache.location()
                )));
            }
        }
        CacheCommand::Cleanup { recursive } => {
            let removed = cache.cleanup(cancel, recursive).await?;
            println!("Removed {} orphaned files from {}", removed, cache.location());
        }
        CacheCommand::Rebuild => {
            cache.rebuild_index(cancel).await?;
            let index = cache.get_index(cancel).await?;
            println!("Indexed {} entries in {}", index.len(), cache.location());
        }
    }
    Ok(())
}

fn print_entries(location: &str, entries: &[CacheMetadata]) {
    println!("Cache: {}", location);
    println!("{:<48} {:>10} {:<14} Tags", "Key", "Size", "Hash");
    println!("{:-<96}", "");
    for entry in entries {
        let mut tags: Vec<String> = entry.tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        tags.sort();
        let hash: String = entry.hash.chars().take(12).collect();
        println!(
            "{:<48} {:>10} {:<14} {}",
            entry.key,
            format_size(entry.size),
            hash,
            tags.join(",")
        );
    }
}

/// Human readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Build and run the Ubuntu deploy workflow
pub async fn deploy_command(config: ProvisionerConfig, args: DeployArgs, cancel: &CancellationToken) -> Result<()> {
    let password = match &args.password_env {
        Some(var) => Some(std::env::var(var).map_err(|_| {
            ProvisionError::config(format!("environment variable {} is not set", var))
        })?),
        None => None,
    };

    let mut tools = ToolsConfig::new(config.clone());
    if !args.skip_flash {
        let bmc = config
            .bmc
            .as_ref()
            .ok_or_else(|| ProvisionError::config("flashing needs a bmc endpoint in the configuration"))?;
        let executor = SshExecutor::connect(bmc)
            .await
            .map_err(|e| e.wrap("connect", format!("BMC {}", bmc.host)))?;
        tools = tools.with_bmc_executor(Arc::new(executor));
    }

    let provider = Arc::new(ToolProvider::new(tools).await?);
    provider.start_index_refresh(cancel).await;

    let network = NetworkConfig::new(&args.hostname, &args.address, &args.gateway, args.dns.clone());
    let mut builder = UbuntuDeployBuilder::new(args.node, &args.image, network)
        .os_version(&args.os_version)
        .skip_flash(args.skip_flash);
    if let Some(password) = password {
        builder = builder.password(&args.user, password);
    }
    for overlay in &args.overlay {
        builder = builder.overlay(overlay);
    }
    for command in &args.post_install {
        builder = builder.post_install_command(command);
    }
    let artifact = builder.artifact_key();

    let result = match builder.build(Arc::clone(&provider)) {
        Ok(workflow) => workflow.run(cancel).await,
        Err(e) => Err(e),
    };
    provider.close().await;

    match &result {
        Ok(()) if args.skip_flash => info!(key = %artifact, "Image customized and cached"),
        Ok(()) => info!(node = args.node, "Node deployed"),
        Err(e) => warn!("Deploy failed: {}", e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(5), "5 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[tokio::test]
    async fn test_remote_cache_requires_configuration() {
        let config = ProvisionerConfig::default();
        let err = cache_command(&config, true, CacheCommand::Verify, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConfigurationInvalid);
    }
}
