// file: src/actions/image.rs
// version: 1.0.0
// guid: e2b7c4a9-5f1d-4c86-9b3e-7a0d8f6c1e52

//! Base image retrieval, mounting, compression and staging

use super::{require_container_paths, RELEASE_MOUNT, RELEASE_PARTITIONS};
use crate::cache::{Cache, CacheMetadata};
use crate::error::{ProvisionError, Result, ResultExt};
use crate::tools::ToolProvider;
use crate::workflow::{keys, ActionContext, ActionHandler, PlatformActionHandler};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const XZ_CONTENT_TYPE: &str = "application/x-xz";
const GZ_CONTENT_TYPE: &str = "application/gzip";
const RAW_CONTENT_TYPE: &str = "application/octet-stream";

/// Cache key of a base image source: `base/<file name>`
pub fn base_image_key(source: &str) -> String {
    let path = source.split(['?', '#']).next().unwrap_or(source);
    let name = path.rsplit('/').find(|part| !part.is_empty()).unwrap_or_default();
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    if sanitized.is_empty() {
        "base/image".to_string()
    } else {
        format!("base/{}", sanitized)
    }
}

fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".xz") {
        XZ_CONTENT_TYPE
    } else if filename.ends_with(".gz") {
        GZ_CONTENT_TYPE
    } else {
        RAW_CONTENT_TYPE
    }
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Stream a host file into a cache entry
async fn put_file(
    cancel: &CancellationToken,
    cache: &dyn Cache,
    key: &str,
    metadata: CacheMetadata,
    path: &Path,
) -> Result<CacheMetadata> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProvisionError::precondition(format!("source {} does not exist", path.display()))
        } else {
            ProvisionError::from(e).wrap("open", path.display().to_string())
        }
    })?;
    cache.put(cancel, key, metadata, &mut file).await
}

/// Remove a file through the tool executor, logging failures
async fn remove_quietly(tools: &ToolProvider, path: &str) {
    let Ok(fs) = tools.filesystem() else { return };
    if let Err(e) = fs.executor().execute(&CancellationToken::new(), "rm", &["-f", path]).await {
        warn!("Failed to remove {}: {}", path, e);
    }
}

/// Look the base image up in the local cache, pulling it from the remote one when only that has it
#[derive(Debug, Clone, Default)]
pub struct CheckBaseImageAction {
    key: Option<String>,
}

impl CheckBaseImageAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: Some(key.into()) }
    }
}

#[async_trait::async_trait]
impl ActionHandler for CheckBaseImageAction {
    fn name(&self) -> &str {
        "check-base-image"
    }

    fn description(&self) -> &str {
        "Check the caches for the base image"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        let tools = ctx.tools()?;
        let cancel = ctx.cancel_token();
        let source: String = ctx.store().get(keys::IMAGE_SOURCE)?;
        let key = self.key.clone().unwrap_or_else(|| base_image_key(&source));
        let local = tools.local_cache()?;

        let mut cached = local.exists(cancel, &key).await?;
        if !cached {
            if let Some(remote) = tools.remote_cache() {
                match remote.exists(cancel, &key).await {
                    Ok(true) => {
                        info!(key = %key, "Base image found in remote cache, pulling");
                        let (metadata, reader) = remote.get(cancel, &key, true).await?;
                        let mut reader = reader.ok_or_else(|| {
                            ProvisionError::integrity(format!("{}: remote cache returned no content", key))
                        })?;
                        local
                            .put(cancel, &key, metadata, &mut reader)
                            .await
                            .with_op("pull base image", &key)?;
                        cached = true;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(key = %key, "Remote cache lookup failed: {}", e),
                }
            }
        }

        info!(key = %key, cached, "Base image lookup finished");
        ctx.store().set(keys::IMAGE_BASE_KEY, key);
        ctx.store().set(keys::IMAGE_BASE_CACHED, cached);
        Ok(())
    }
}

/// Download or copy the base image into the local cache unless already cached
#[derive(Debug, Clone)]
pub struct FetchBaseImageAction {
    os_type: String,
    os_version: String,
    expected_sha256: Option<String>,
}

impl FetchBaseImageAction {
    pub fn new(os_type: impl Into<String>, os_version: impl Into<String>) -> Self {
        Self {
            os_type: os_type.into(),
            os_version: os_version.into(),
            expected_sha256: None,
        }
    }

    pub fn expected_sha256(mut self, hash: impl Into<String>) -> Self {
        self.expected_sha256 = Some(hash.into());
        self
    }
}

#[async_trait::async_trait]
impl ActionHandler for FetchBaseImageAction {
    fn name(&self) -> &str {
        "fetch-base-image"
    }

    fn description(&self) -> &str {
        "Fetch the base image into the local cache"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        if ctx.store().get_or(keys::IMAGE_BASE_CACHED, false) {
            debug!("Base image already cached");
            return Ok(());
        }

        let tools = ctx.tools()?;
        let cancel = ctx.cancel_token();
        let source: String = ctx.store().get(keys::IMAGE_SOURCE)?;
        let key = ctx
            .store()
            .get::<String>(keys::IMAGE_BASE_KEY)
            .unwrap_or_else(|_| base_image_key(&source));
        let local = tools.local_cache()?;
        let filename = crate::cache::default_filename(&key);

        let mut metadata = CacheMetadata::new(&filename)
            .content_type(content_type_for(&filename))
            .os(&self.os_type, &self.os_version)
            .tag("source", &source)
            .tag("os", &self.os_type)
            .tag("version", &self.os_version);

        let stored = if is_url(&source) {
            let work = tools.work_dir();
            tokio::fs::create_dir_all(&work)
                .await
                .with_op("create work directory", work.display())?;
            let dest = work.join(&filename);
            let downloaded = tools
                .downloader()
                .download(cancel, &source, &dest, self.expected_sha256.as_deref())
                .await?;
            metadata = metadata.hash(&downloaded.sha256);

            let result = put_file(cancel, &*local, &key, metadata, &dest).await;
            if let Err(e) = tokio::fs::remove_file(&dest).await {
                warn!("Failed to remove download {}: {}", dest.display(), e);
            }
            result?
        } else {
            if let Some(expected) = &self.expected_sha256 {
                metadata = metadata.hash(expected);
            }
            put_file(cancel, &*local, &key, metadata, Path::new(&source)).await?
        };

        info!(key = %key, size = stored.size, hash = %stored.hash, "Base image cached");
        ctx.store().set(keys::IMAGE_BASE_KEY, key);
        ctx.store().set(keys::IMAGE_BASE_CACHED, true);
        Ok(())
    }
}

/// Decompress the cached base image into a working raw image
#[derive(Debug, Clone, Default)]
pub struct DecompressImageAction {
    output_name: Option<String>,
}

struct DecompressPlan {
    source: String,
    filename: String,
    target: String,
}

impl DecompressImageAction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the working image inside the work directory
    pub fn output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    async fn plan(&self, ctx: &ActionContext, tools: &ToolProvider) -> Result<DecompressPlan> {
        let key: String = ctx.store().get(keys::IMAGE_BASE_KEY)?;
        let local = tools.local_cache()?;
        let metadata = local.stat(ctx.cancel_token(), &key).await?;
        let filename = if metadata.filename.is_empty() {
            crate::cache::default_filename(&key)
        } else {
            metadata.filename
        };
        let name = self.output_name.clone().unwrap_or_else(|| {
            filename
                .strip_suffix(".xz")
                .or_else(|| filename.strip_suffix(".gz"))
                .unwrap_or(&filename)
                .to_string()
        });
        Ok(DecompressPlan {
            source: local.data_path(&key)?,
            target: tools.work_dir().join(name).to_string_lossy().to_string(),
            filename,
        })
    }

    async fn run(&self, ctx: &ActionContext, tools: &ToolProvider, plan: DecompressPlan) -> Result<()> {
        let cancel = ctx.cancel_token();
        if plan.filename.ends_with(".xz") {
            tools.compression()?.decompress_xz_to(cancel, &plan.source, &plan.target).await?;
        } else if plan.filename.ends_with(".gz") {
            tools.compression()?.decompress_gz_to(cancel, &plan.source, &plan.target).await?;
        } else {
            tools.filesystem()?.copy_file(cancel, "/", &plan.source, &plan.target).await?;
        }
        info!(image = %plan.target, "Working image ready");
        ctx.store().set(keys::IMAGE_WORKING, plan.target);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlatformActionHandler for DecompressImageAction {
    fn name(&self) -> &str {
        "decompress-image"
    }

    fn description(&self) -> &str {
        "Decompress the base image into the work directory"
    }

    async fn execute_native(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let plan = self.plan(ctx, tools).await?;
        self.run(ctx, tools, plan).await
    }

    async fn execute_docker(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let plan = self.plan(ctx, tools).await?;
        require_container_paths(tools, &[&plan.source, &plan.target])?;
        self.run(ctx, tools, plan).await
    }
}

/// Map the working image's partitions and mount its root partition
///
/// Both steps register releases on the workflow; [`UnmountImageAction`] runs
/// them early, otherwise they run when the workflow ends.
#[derive(Debug, Clone, Default)]
pub struct MountImageAction {
    mount_point: Option<String>,
}

impl MountImageAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount_point(mut self, path: impl Into<String>) -> Self {
        self.mount_point = Some(path.into());
        self
    }

    fn target(&self, ctx: &ActionContext, tools: &ToolProvider) -> String {
        self.mount_point.clone().unwrap_or_else(|| {
            tools
                .work_dir()
                .join("mnt")
                .join(ctx.workflow().id.to_string())
                .to_string_lossy()
                .to_string()
        })
    }

    async fn mount(&self, ctx: &ActionContext, tools: &ToolProvider, image: String, mountpoint: String) -> Result<()> {
        let fs = tools.filesystem()?;
        let cancel = ctx.cancel_token();

        let device = fs.map_partitions(cancel, &image).await?;
        let unmap_fs = fs.clone();
        let mapped = image.clone();
        ctx.defer(RELEASE_PARTITIONS, move || async move {
            unmap_fs.unmap_partitions(&CancellationToken::new(), &mapped).await
        });

        fs.mount(cancel, &device, &mountpoint, None, None).await?;
        let unmount_fs = fs.clone();
        let mounted = mountpoint.clone();
        ctx.defer(RELEASE_MOUNT, move || async move {
            unmount_fs.unmount(&CancellationToken::new(), &mounted).await
        });

        info!(device = %device, mountpoint = %mountpoint, "Image root mounted");
        ctx.store().set(keys::IMAGE_ROOT_DEVICE, device);
        ctx.store().set(keys::IMAGE_MOUNTS, mountpoint);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlatformActionHandler for MountImageAction {
    fn name(&self) -> &str {
        "mount-image"
    }

    fn description(&self) -> &str {
        "Map partitions and mount the root filesystem"
    }

    async fn execute_native(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let image: String = ctx.store().get(keys::IMAGE_WORKING)?;
        let mountpoint = self.target(ctx, tools);
        self.mount(ctx, tools, image, mountpoint).await
    }

    async fn execute_docker(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let image: String = ctx.store().get(keys::IMAGE_WORKING)?;
        let mountpoint = self.target(ctx, tools);
        require_container_paths(tools, &[&image, &mountpoint])?;
        self.mount(ctx, tools, image, mountpoint).await
    }
}

/// Unmount the root and remove the partition mappings made by [`MountImageAction`]
#[derive(Debug, Clone, Default)]
pub struct UnmountImageAction;

impl UnmountImageAction {
    pub fn new() -> Self {
        Self
    }

    async fn unmount(&self, ctx: &ActionContext) -> Result<()> {
        let mounted = ctx.release(RELEASE_MOUNT).await?;
        let mapped = ctx.release(RELEASE_PARTITIONS).await?;
        if !mounted && !mapped {
            warn!("No mounted image to release");
        }
        ctx.store().remove(keys::IMAGE_MOUNTS);
        ctx.store().remove(keys::IMAGE_ROOT_DEVICE);
        info!("Image unmounted");
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlatformActionHandler for UnmountImageAction {
    fn name(&self) -> &str {
        "unmount-image"
    }

    fn description(&self) -> &str {
        "Unmount the root filesystem and unmap partitions"
    }

    async fn execute_native(&self, ctx: &ActionContext, _tools: &Arc<ToolProvider>) -> Result<()> {
        self.unmount(ctx).await
    }

    async fn execute_docker(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        require_container_paths(tools, &[])?;
        self.unmount(ctx).await
    }
}

/// xz the working image and store it in the local cache
#[derive(Debug, Clone)]
pub struct CompressImageAction {
    key: String,
    os_type: String,
    os_version: String,
    tags: BTreeMap<String, String>,
    keep_working: bool,
}

impl CompressImageAction {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            os_type: String::new(),
            os_version: String::new(),
            tags: BTreeMap::new(),
            keep_working: false,
        }
    }

    pub fn os(mut self, os_type: impl Into<String>, os_version: impl Into<String>) -> Self {
        self.os_type = os_type.into();
        self.os_version = os_version.into();
        self
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Leave the raw working image in place after compressing
    pub fn keep_working(mut self, keep: bool) -> Self {
        self.keep_working = keep;
        self
    }

    fn paths(&self, ctx: &ActionContext, tools: &ToolProvider) -> Result<(String, String, String)> {
        if ctx.store().contains(keys::IMAGE_MOUNTS) {
            return Err(ProvisionError::precondition(
                "image is still mounted; unmount it before compressing",
            ));
        }
        let working: String = ctx.store().get(keys::IMAGE_WORKING)?;
        let name = Path::new(&working)
            .file_name()
            .map(|n| format!("{}.xz", n.to_string_lossy()))
            .ok_or_else(|| ProvisionError::config(format!("invalid working image path {}", working)))?;
        let out = tools.work_dir().join(&name).to_string_lossy().to_string();
        Ok((working, out, name))
    }

    async fn compress(
        &self,
        ctx: &ActionContext,
        tools: &ToolProvider,
        working: String,
        out: String,
        name: String,
    ) -> Result<()> {
        let cancel = ctx.cancel_token();
        tools.compression()?.compress_xz(cancel, &working, &out).await?;

        let local = tools.local_cache()?;
        let mut metadata = CacheMetadata::new(name)
            .content_type(XZ_CONTENT_TYPE)
            .os(&self.os_type, &self.os_version);
        for (tag, value) in &self.tags {
            metadata = metadata.tag(tag, value);
        }
        let result = put_file(cancel, &*local, &self.key, metadata, Path::new(&out)).await;
        remove_quietly(tools, &out).await;
        let stored = result?;

        if !self.keep_working {
            remove_quietly(tools, &working).await;
            ctx.store().remove(keys::IMAGE_WORKING);
        }

        info!(key = %self.key, size = stored.size, hash = %stored.hash, "Customized image cached");
        ctx.store().set(keys::IMAGE_TARGET, local.data_path(&self.key)?);
        ctx.store().set(keys::IMAGE_ARTIFACT_KEY, self.key.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlatformActionHandler for CompressImageAction {
    fn name(&self) -> &str {
        "compress-image"
    }

    fn description(&self) -> &str {
        "Compress the customized image into the local cache"
    }

    async fn execute_native(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let (working, out, name) = self.paths(ctx, tools)?;
        self.compress(ctx, tools, working, out, name).await
    }

    async fn execute_docker(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let (working, out, name) = self.paths(ctx, tools)?;
        require_container_paths(tools, &[&working, &out])?;
        self.compress(ctx, tools, working, out, name).await
    }
}

/// Copy the artifact from the local cache to the remote cache the BMC reads
#[derive(Debug, Clone, Default)]
pub struct UploadToRemoteCacheAction {
    key: Option<String>,
}

impl UploadToRemoteCacheAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: Some(key.into()) }
    }
}

#[async_trait::async_trait]
impl ActionHandler for UploadToRemoteCacheAction {
    fn name(&self) -> &str {
        "upload-to-remote-cache"
    }

    fn description(&self) -> &str {
        "Stage the image in the remote cache"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        let tools = ctx.tools()?;
        let cancel = ctx.cancel_token();
        let remote = tools
            .remote_cache()
            .ok_or_else(|| ProvisionError::precondition("no remote cache available"))?;
        let key = match &self.key {
            Some(key) => key.clone(),
            None => ctx.store().get(keys::IMAGE_ARTIFACT_KEY)?,
        };
        let local = tools.local_cache()?;
        let local_meta = local.stat(cancel, &key).await?;

        let up_to_date = match remote.stat(cancel, &key).await {
            Ok(existing) => !existing.hash.is_empty() && existing.hash == local_meta.hash,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.wrap("stat remote", key)),
        };

        if up_to_date {
            info!(key = %key, "Remote cache already holds this image");
        } else {
            let (metadata, reader) = local.get(cancel, &key, true).await?;
            let mut reader = reader
                .ok_or_else(|| ProvisionError::integrity(format!("{}: local cache returned no content", key)))?;
            let stored = remote
                .put(cancel, &key, metadata, &mut reader)
                .await
                .with_op("upload", &key)?;
            info!(key = %key, size = stored.size, location = %remote.location(), "Image staged");
        }

        ctx.store().set(keys::IMAGE_REMOTE_PATH, remote.data_path(&key)?);
        Ok(())
    }
}
