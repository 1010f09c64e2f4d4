// file: src/container/registry.rs
// version: 1.1.0
// guid: 2f6a0c83-d1e9-4b57-9c24-8e5b7a1d3f60

//! Registry of containers created by this process
//!
//! Every container created through [`ContainerRegistry::create`] stays in the
//! registry map until it is removed. The map is what the signal handler in
//! [`super::cleanup`] walks when the process is interrupted.

use super::cleanup::{self, MANAGED_PREFIXES};
use super::types::{Container, ContainerConfig, ContainerStats, ContainerStatus, ExecOutput};
use crate::error::{ProvisionError, Result, ResultExt};
use crate::platform::ENGINE_CLI;
use bollard::container::{
    CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default grace period for `stop`
pub const DEFAULT_STOP_TIMEOUT_SECS: i64 = 10;

/// Budget for the engine-API removal pass during signal cleanup
pub const REMOVE_ALL_BUDGET: Duration = Duration::from_secs(5);

/// Generate a unique container name with one of the managed prefixes
pub fn managed_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &id[..12])
}

/// Tracks and drives containers through the engine API
pub struct ContainerRegistry {
    docker: Docker,
    containers: RwLock<HashMap<String, Container>>,
}

impl ContainerRegistry {
    /// Connect to the local engine and register for signal cleanup
    pub async fn connect() -> Result<Arc<Self>> {
        let docker = Docker::connect_with_local_defaults().with_op("connect", "container engine")?;
        docker.ping().await.with_op("ping", "container engine")?;
        info!("Connected to container engine");
        Ok(Self::with_client(docker))
    }

    /// Wrap an existing engine client
    pub fn with_client(docker: Docker) -> Arc<Self> {
        let registry = Arc::new(Self {
            docker,
            containers: RwLock::new(HashMap::new()),
        });
        cleanup::register(&registry);
        registry
    }

    /// Create a container and start tracking it
    pub async fn create(&self, cancel: &CancellationToken, config: &ContainerConfig) -> Result<Container> {
        if config.image.is_empty() {
            return Err(ProvisionError::config("container image cannot be empty"));
        }
        debug!(name = %config.name, image = %config.image, "Creating container");

        let options = (!config.name.is_empty()).then(|| CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        });
        let response = guard(
            cancel,
            "create container",
            &config.name,
            self.docker.create_container(options, config.to_engine_config()),
        )
        .await?;

        for warning in &response.warnings {
            warn!(name = %config.name, "Engine warning: {}", warning);
        }

        let container = Container::created(response.id.clone(), config);
        self.containers
            .write()
            .await
            .insert(response.id.clone(), container.clone());
        info!(id = %short_id(&response.id), name = %config.name, "Container created");
        Ok(container)
    }

    /// Refresh and return a tracked container
    pub async fn get(&self, cancel: &CancellationToken, id: &str) -> Result<Container> {
        if !self.containers.read().await.contains_key(id) {
            return Err(ProvisionError::not_found(format!("container {} is not registered", id)));
        }
        self.refresh(cancel, id).await
    }

    /// Snapshot of every tracked container
    pub async fn list(&self) -> Vec<Container> {
        let mut containers: Vec<Container> = self.containers.read().await.values().cloned().collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        containers
    }

    /// Ids of every tracked container
    pub async fn ids(&self) -> Vec<String> {
        self.containers.read().await.keys().cloned().collect()
    }

    pub async fn start(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        guard(
            cancel,
            "start container",
            id,
            self.docker.start_container(id, None::<StartContainerOptions<String>>),
        )
        .await?;
        self.refresh(cancel, id).await?;
        debug!(id = %short_id(id), "Container started");
        Ok(())
    }

    pub async fn stop(&self, cancel: &CancellationToken, id: &str, timeout_secs: Option<i64>) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout_secs.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS),
        };
        guard(
            cancel,
            "stop container",
            id,
            self.docker.stop_container(id, Some(options)),
        )
        .await?;
        self.refresh(cancel, id).await?;
        debug!(id = %short_id(id), "Container stopped");
        Ok(())
    }

    pub async fn kill(&self, cancel: &CancellationToken, id: &str, signal: &str) -> Result<()> {
        guard(
            cancel,
            "kill container",
            id,
            self.docker
                .kill_container(id, Some(KillContainerOptions { signal })),
        )
        .await?;
        self.refresh(cancel, id).await?;
        Ok(())
    }

    pub async fn pause(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        guard(cancel, "pause container", id, self.docker.pause_container(id)).await?;
        self.refresh(cancel, id).await?;
        Ok(())
    }

    pub async fn unpause(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        guard(cancel, "unpause container", id, self.docker.unpause_container(id)).await?;
        self.refresh(cancel, id).await?;
        Ok(())
    }

    /// Run a command and return its combined output; non-zero exit is an error
    pub async fn exec(&self, cancel: &CancellationToken, id: &str, cmd: &[&str]) -> Result<Vec<u8>> {
        let result = self.exec_with_status(cancel, id, cmd, None).await?;
        if result.exit_code != 0 {
            let (program, args) = split_command(cmd);
            return Err(ProvisionError::command_failed(
                program,
                &args,
                Some(result.exit_code),
                &result.output,
                Some(format!("exec in container {}", short_id(id))),
            ));
        }
        Ok(result.output)
    }

    /// Run a command and return its exit code alongside the output
    pub async fn exec_with_status(
        &self,
        cancel: &CancellationToken,
        id: &str,
        cmd: &[&str],
        workdir: Option<&str>,
    ) -> Result<ExecOutput> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::cancelled(format!("exec in {}", short_id(id))));
        }
        debug!(id = %short_id(id), "exec: {}", cmd.join(" "));

        let options = CreateExecOptions {
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect::<Vec<String>>()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: workdir.map(str::to_string),
            ..Default::default()
        };
        let exec = guard(cancel, "create exec", id, self.docker.create_exec(id, options)).await?;

        let mut output = Vec::new();
        let started = guard(cancel, "start exec", id, self.docker.start_exec(&exec.id, None)).await?;
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ProvisionError::cancelled(format!("exec in {}", short_id(id))));
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => output.extend_from_slice(&chunk.into_bytes()),
                    Some(Err(e)) => return Err(ProvisionError::from(e).wrap("read exec output", id)),
                    None => break,
                }
            }
        }

        let inspect = guard(cancel, "inspect exec", id, self.docker.inspect_exec(&exec.id)).await?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    /// Start a command and return once the engine has accepted it
    pub async fn exec_detached(&self, cancel: &CancellationToken, id: &str, cmd: &[&str]) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect::<Vec<String>>()),
            ..Default::default()
        };
        let exec = guard(cancel, "create exec", id, self.docker.create_exec(id, options)).await?;
        let start = StartExecOptions {
            detach: true,
            ..Default::default()
        };
        guard(
            cancel,
            "start exec",
            id,
            self.docker.start_exec(&exec.id, Some(start)),
        )
        .await?;
        Ok(exec.id)
    }

    /// Copy a host file or directory into `dest_dir` inside the container
    pub async fn copy_to(
        &self,
        cancel: &CancellationToken,
        id: &str,
        host_path: &Path,
        dest_dir: &str,
    ) -> Result<()> {
        let source = host_path.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || archive_path(&source))
            .await
            .map_err(|e| ProvisionError::transport(format!("archive task failed: {}", e)))?
            .with_op("archive", host_path.display())?;

        self.exec(cancel, id, &["mkdir", "-p", dest_dir]).await?;
        self.upload_archive(cancel, id, dest_dir, archive).await
    }

    /// Write `data` to `path` inside the container
    pub async fn copy_bytes_to(
        &self,
        cancel: &CancellationToken,
        id: &str,
        path: &str,
        data: &[u8],
        mode: u32,
    ) -> Result<()> {
        let target = Path::new(path);
        let (parent, name) = match (target.parent(), target.file_name()) {
            (Some(parent), Some(name)) => (parent.to_string_lossy().to_string(), name.to_os_string()),
            _ => return Err(ProvisionError::config(format!("invalid container path: {}", path))),
        };
        let parent = if parent.is_empty() { "/".to_string() } else { parent };

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_data(&mut header, &name, data)
            .with_op("archive", path)?;
        let archive = builder.into_inner().with_op("archive", path)?;

        self.upload_archive(cancel, id, &parent, archive).await
    }

    async fn upload_archive(
        &self,
        cancel: &CancellationToken,
        id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };
        guard(
            cancel,
            "copy into container",
            id,
            self.docker
                .upload_to_container(id, Some(options), archive.into()),
        )
        .await
    }

    /// Copy a file or directory out of the container into `host_dir`
    pub async fn copy_from(
        &self,
        cancel: &CancellationToken,
        id: &str,
        container_path: &str,
        host_dir: &Path,
    ) -> Result<()> {
        let options = DownloadFromContainerOptions {
            path: container_path.to_string(),
        };
        let collect = self
            .docker
            .download_from_container(id, Some(options))
            .map_ok(|chunk| chunk.to_vec())
            .try_concat();
        let archive = guard(cancel, "copy from container", id, collect).await?;

        let dest = host_dir.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dest)?;
            tar::Archive::new(std::io::Cursor::new(archive)).unpack(&dest)
        })
        .await
        .map_err(|e| ProvisionError::transport(format!("unpack task failed: {}", e)))?
        .with_op("unpack", host_dir.display())
    }

    /// Combined stdout and stderr logs
    pub async fn logs(&self, cancel: &CancellationToken, id: &str) -> Result<Vec<u8>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let collect = self
            .docker
            .logs(id, Some(options))
            .map_ok(|chunk| chunk.into_bytes().to_vec())
            .try_concat();
        guard(cancel, "logs", id, collect).await
    }

    /// Block until the container stops, returning its exit code
    pub async fn wait(&self, cancel: &CancellationToken, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = Box::pin(self.docker.wait_container(id, Some(options)));
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProvisionError::cancelled(format!("wait for {}", short_id(id))));
            }
            next = stream.next() => next,
        };

        let code = match next {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(ProvisionError::from(e).wrap("wait", id)),
            None => return Err(ProvisionError::transport(format!("wait stream for {} ended", id))),
        };

        if let Some(container) = self.containers.write().await.get_mut(id) {
            container.running = false;
            container.status = ContainerStatus::Exited;
            container.exit_code = Some(code);
        }
        Ok(code)
    }

    /// Remove a container that is not running
    pub async fn remove(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        let paused = match self.refresh(cancel, id).await {
            Ok(container) if container.running && !container.paused => {
                return Err(ProvisionError::precondition(format!(
                    "container {} is running; stop it before removing",
                    container.name
                )));
            }
            Ok(container) => container.paused,
            Err(e) if e.is_not_found() => {
                self.containers.write().await.remove(id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        // the engine refuses to remove a paused container without force
        self.remove_engine(cancel, id, paused).await
    }

    /// Remove a container regardless of its state
    pub async fn force_remove(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        self.remove_engine(cancel, id, true).await
    }

    async fn remove_engine(&self, cancel: &CancellationToken, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        let result = guard(
            cancel,
            "remove container",
            id,
            self.docker.remove_container(id, Some(options)),
        )
        .await;

        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(id = %short_id(id), "Container already gone"),
            Err(e) => return Err(e),
        }
        self.containers.write().await.remove(id);
        debug!(id = %short_id(id), "Container removed");
        Ok(())
    }

    /// Force-remove every tracked container
    pub async fn remove_all(&self, cancel: &CancellationToken) -> Result<()> {
        let ids = self.ids().await;
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.force_remove(cancel, &id).await {
                warn!(id = %short_id(&id), "Failed to remove container: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One-shot resource usage sample
    pub async fn stats(&self, cancel: &CancellationToken, id: &str) -> Result<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = Box::pin(self.docker.stats(id, Some(options)));
        let sample = guard(cancel, "stats", id, async move {
            stream.next().await.transpose()
        })
        .await?
        .ok_or_else(|| ProvisionError::not_found(format!("no stats for {}", id)))?;

        Ok(ContainerStats {
            cpu_total_usage: sample.cpu_stats.cpu_usage.total_usage,
            system_cpu_usage: sample.cpu_stats.system_cpu_usage,
            online_cpus: sample.cpu_stats.online_cpus,
            memory_usage: sample.memory_stats.usage,
            memory_limit: sample.memory_stats.limit,
            pids: sample.pids_stats.current,
        })
    }

    /// Start tracking a container this process did not create
    pub async fn register_existing(&self, cancel: &CancellationToken, id: &str) -> Result<Container> {
        let inspect = guard(
            cancel,
            "inspect container",
            id,
            self.docker
                .inspect_container(id, None::<InspectContainerOptions>),
        )
        .await?;
        let container = Container::from_inspect(inspect);
        self.containers
            .write()
            .await
            .insert(container.id.clone(), container.clone());
        info!(id = %short_id(&container.id), name = %container.name, "Registered existing container");
        Ok(container)
    }

    /// Remove every tracked container and sweep managed prefixes
    pub async fn close(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        let result = self.remove_all(&cancel).await;
        self.sweep_prefixes(&cancel, MANAGED_PREFIXES).await;
        result
    }

    /// Force-remove engine containers whose names start with any prefix
    pub async fn sweep_prefixes(&self, cancel: &CancellationToken, prefixes: &[&str]) -> usize {
        let mut removed = 0;
        for prefix in prefixes {
            let filters = HashMap::from([("name".to_string(), vec![prefix.to_string()])]);
            let options = ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            };
            let found = match guard(cancel, "list containers", prefix, self.docker.list_containers(Some(options))).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("Failed to list containers with prefix {}: {}", prefix, e);
                    continue;
                }
            };

            for summary in found {
                // the engine name filter is a substring match
                let matches = summary
                    .names
                    .iter()
                    .flatten()
                    .any(|n| n.trim_start_matches('/').starts_with(prefix));
                let Some(id) = summary.id.filter(|_| matches) else {
                    continue;
                };
                match self.remove_engine(cancel, &id, true).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(id = %short_id(&id), "Sweep failed to remove container: {}", e),
                }
            }
        }
        if removed > 0 {
            info!("Swept {} leftover containers", removed);
        }
        removed
    }

    /// Signal-path cleanup: CLI removal, bounded API removal, prefix sweep
    pub(crate) async fn emergency_cleanup(&self) {
        let ids = self.ids().await;
        for id in &ids {
            cleanup::force_remove_cli(id).await;
        }

        let cancel = CancellationToken::new();
        match tokio::time::timeout(REMOVE_ALL_BUDGET, self.remove_all(&cancel)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("RemoveAll during cleanup: {}", e),
            Err(_) => {
                cancel.cancel();
                warn!("RemoveAll exceeded {:?}", REMOVE_ALL_BUDGET);
            }
        }

        let sweep = CancellationToken::new();
        if tokio::time::timeout(REMOVE_ALL_BUDGET, self.sweep_prefixes(&sweep, MANAGED_PREFIXES))
            .await
            .is_err()
        {
            sweep.cancel();
            warn!("Prefix sweep exceeded {:?}", REMOVE_ALL_BUDGET);
        }

        self.containers.write().await.clear();
    }

    async fn refresh(&self, cancel: &CancellationToken, id: &str) -> Result<Container> {
        let inspect = guard(
            cancel,
            "inspect container",
            id,
            self.docker
                .inspect_container(id, None::<InspectContainerOptions>),
        )
        .await?;
        let container = Container::from_inspect(inspect);
        if let Some(entry) = self.containers.write().await.get_mut(id) {
            *entry = container.clone();
        }
        Ok(container)
    }
}

impl Drop for ContainerRegistry {
    /// Last resort for registries dropped without `close`; the removal runs
    /// detached so the dropping thread never waits on the engine
    fn drop(&mut self) {
        let mut args = vec!["rm".to_string(), "-f".to_string()];
        args.extend(self.containers.get_mut().keys().cloned());
        if args.len() == 2 {
            return;
        }
        warn!("Registry dropped with {} containers; removing", args.len() - 2);
        if let Err(e) = spawn_detached(ENGINE_CLI, &args) {
            warn!("Failed to remove containers on drop: {}", e);
        }
    }
}

/// Start `program` without waiting; a helper thread reaps it
fn spawn_detached(program: &str, args: &[String]) -> std::io::Result<()> {
    let mut child = std::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(())
}

/// Run an engine call with cancellation and "<op> failed for <id>" context
async fn guard<T, E, F>(cancel: &CancellationToken, op: &str, id: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<ProvisionError>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ProvisionError::cancelled(format!("{} {}", op, short_id(id)))),
        result = fut => result.with_op(op, short_id(id)),
    }
}

fn short_id(id: &str) -> &str {
    if id.len() > 12 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        &id[..12]
    } else {
        id
    }
}

fn split_command<'a>(cmd: &[&'a str]) -> (&'a str, Vec<String>) {
    match cmd.split_first() {
        Some((program, args)) => (program, args.iter().map(|a| a.to_string()).collect()),
        None => ("", Vec::new()),
    }
}

/// Tar a file or directory with its basename as the archive root
fn archive_path(path: &Path) -> std::io::Result<Vec<u8>> {
    let name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })?;
    let mut builder = tar::Builder::new(Vec::new());
    if path.is_dir() {
        builder.append_dir_all(name, path)?;
    } else {
        builder.append_path_with_name(path, name)?;
    }
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_managed_name_prefix() {
        let name = managed_name("turingpi-exec-");
        assert!(name.starts_with("turingpi-exec-"));
        assert_eq!(name.len(), "turingpi-exec-".len() + 12);
        assert_ne!(name, managed_name("turingpi-exec-"));
    }

    #[test]
    fn test_short_id() {
        let id = "4f2a9c1b7e3d5a6f8b0c2d4e6f8a0b1c";
        assert_eq!(short_id(id), "4f2a9c1b7e3d");
        assert_eq!(short_id("turingpi-tools-abc"), "turingpi-tools-abc");
    }

    #[test]
    fn test_split_command() {
        let (program, args) = split_command(&["xz", "-d", "a.img.xz"]);
        assert_eq!(program, "xz");
        assert_eq!(args, vec!["-d", "a.img.xz"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_detached_does_not_wait() {
        let started = std::time::Instant::now();
        spawn_detached("sleep", &["5".to_string()]).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(spawn_detached("/nonexistent/engine", &[]).is_err());
    }

    #[test]
    fn test_archive_directory_roundtrip() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("overlay");
        std::fs::create_dir_all(src.join("etc")).unwrap();
        std::fs::write(src.join("etc/hostname"), "node1\n").unwrap();

        let archive = archive_path(&src).unwrap();
        let out = temp.path().join("out");
        tar::Archive::new(std::io::Cursor::new(archive))
            .unpack(&out)
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("overlay/etc/hostname")).unwrap(),
            "node1\n"
        );
    }
}
