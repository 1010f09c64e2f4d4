// file: src/cache/local.rs
// version: 1.1.0
// guid: c7a3e9f1-5d2b-4b86-9f14-6e8d2a0c5b97

//! Cache stored in a local directory

use super::{
    check_cancelled, default_filename, split_entry_name, validate_key, Cache, CacheIndex, CacheMetadata,
    CacheReader, TagFilter, DATA_SUFFIX, META_SUFFIX,
};
use crate::error::{ProvisionError, Result, ResultExt};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const COPY_BUFFER: usize = 64 * 1024;

/// Filesystem-backed cache rooted at a base directory
pub struct LocalCache {
    base: PathBuf,
    index: RwLock<CacheIndex>,
}

impl LocalCache {
    /// Create the base directory if needed and index what is already there
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        tokio::fs::create_dir_all(&base)
            .await
            .with_op("create cache directory", base.display())?;
        let index = scan_index(base.clone()).await?;
        info!(base = %base.display(), entries = index.len(), "Local cache ready");
        Ok(Self {
            base,
            index: RwLock::new(index),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.base.join(format!("{}{}", key, META_SUFFIX))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.base.join(format!("{}{}", key, DATA_SUFFIX))
    }

    async fn read_meta(&self, key: &str) -> Result<CacheMetadata> {
        let path = self.meta_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProvisionError::not_found(format!("cache key {}", key)))
            }
            Err(e) => return Err(ProvisionError::from(e).wrap("read metadata", key)),
        };
        let mut metadata: CacheMetadata = serde_json::from_slice(&raw).with_op("parse metadata", key)?;
        metadata.key = key.to_string();
        Ok(metadata)
    }

    async fn write_meta(&self, key: &str, metadata: &CacheMetadata) -> Result<()> {
        let path = self.meta_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("meta.tmp");
        let json = serde_json::to_vec_pretty(metadata)?;
        let result = async {
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if result.is_err() {
            remove_quietly(&tmp).await;
        }
        result.with_op("write metadata", key)
    }
}

#[async_trait::async_trait]
impl Cache for LocalCache {
    async fn put(
        &self,
        cancel: &CancellationToken,
        key: &str,
        mut metadata: CacheMetadata,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<CacheMetadata> {
        validate_key(key)?;
        check_cancelled(cancel, "put")?;
        let mut index = self.index.write().await;

        let data_path = self.blob_path(key);
        if let Some(parent) = data_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_op("create directory", parent.display())?;
        }

        // The live blob is only replaced once the new content is verified
        let staging = staging_path(&data_path);
        let (size, digest) = match write_blob(cancel, reader, &staging).await {
            Ok(written) => written,
            Err(e) => {
                remove_quietly(&staging).await;
                return Err(e.wrap("put", key));
            }
        };

        if metadata.hash.is_empty() {
            metadata.hash = digest;
        } else if !metadata.hash.eq_ignore_ascii_case(&digest) {
            remove_quietly(&staging).await;
            return Err(ProvisionError::integrity(format!(
                "{}: hash mismatch (expected {}, got {})",
                key, metadata.hash, digest
            )));
        }

        metadata.key = key.to_string();
        metadata.size = size;
        metadata.mod_time = Utc::now();
        if metadata.filename.is_empty() {
            metadata.filename = default_filename(key);
        }

        if let Err(e) = self.write_meta(key, &metadata).await {
            remove_quietly(&staging).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&staging, &data_path).await {
            remove_quietly(&staging).await;
            return Err(ProvisionError::from(e).wrap("put", key));
        }

        index.insert(metadata.clone());
        debug!(key, size, "Cache entry stored");
        Ok(metadata)
    }

    async fn get(
        &self,
        cancel: &CancellationToken,
        key: &str,
        want_content: bool,
    ) -> Result<(CacheMetadata, Option<CacheReader>)> {
        validate_key(key)?;
        check_cancelled(cancel, "get")?;
        let _index = self.index.read().await;

        let metadata = self.read_meta(key).await?;
        if !want_content {
            return Ok((metadata, None));
        }
        let file = match tokio::fs::File::open(self.blob_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProvisionError::not_found(format!("data for cache key {}", key)))
            }
            Err(e) => return Err(ProvisionError::from(e).wrap("open data", key)),
        };
        Ok((metadata, Some(Box::new(file))))
    }

    async fn stat(&self, cancel: &CancellationToken, key: &str) -> Result<CacheMetadata> {
        validate_key(key)?;
        check_cancelled(cancel, "stat")?;
        let _index = self.index.read().await;
        self.read_meta(key).await
    }

    async fn exists(&self, cancel: &CancellationToken, key: &str) -> Result<bool> {
        validate_key(key)?;
        check_cancelled(cancel, "exists")?;
        let _index = self.index.read().await;
        Ok(tokio::fs::try_exists(self.meta_path(key)).await?)
    }

    async fn list(&self, cancel: &CancellationToken, filter: &TagFilter) -> Result<Vec<CacheMetadata>> {
        check_cancelled(cancel, "list")?;
        Ok(self.index.read().await.list(filter))
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        validate_key(key)?;
        check_cancelled(cancel, "delete")?;
        let mut index = self.index.write().await;
        for path in [self.meta_path(key), self.blob_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ProvisionError::from(e).wrap("delete", key)),
            }
        }
        index.remove(key);
        debug!(key, "Cache entry deleted");
        Ok(())
    }

    async fn rebuild_index(&self, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel, "rebuild index")?;
        let mut index = self.index.write().await;
        *index = scan_index(self.base.clone()).await?;
        debug!(entries = index.len(), "Local cache index rebuilt");
        Ok(())
    }

    async fn cleanup(&self, cancel: &CancellationToken, recursive: bool) -> Result<usize> {
        check_cancelled(cancel, "cleanup")?;
        let mut index = self.index.write().await;

        let base = self.base.clone();
        let removed = tokio::task::spawn_blocking(move || -> Result<Vec<(String, PathBuf)>> {
            let mut removed = Vec::new();
            for (key, files) in scan_entries(&base, recursive) {
                let orphan = match (&files.meta, &files.data) {
                    (Some(meta), None) => meta,
                    (None, Some(data)) => data,
                    _ => continue,
                };
                std::fs::remove_file(orphan).with_op("remove orphan", orphan.display())?;
                removed.push((key, orphan.clone()));
            }
            Ok(removed)
        })
        .await
        .map_err(|e| ProvisionError::transport(format!("cleanup task failed: {}", e)))??;

        for (key, path) in &removed {
            index.remove(key);
            info!(key = %key, "Removed orphan {}", path.display());
        }
        Ok(removed.len())
    }

    async fn verify_integrity(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        check_cancelled(cancel, "verify")?;
        let _index = self.index.read().await;

        let base = self.base.clone();
        tokio::task::spawn_blocking(move || {
            let mut issues = Vec::new();
            for (key, files) in scan_entries(&base, true) {
                let (meta, data) = match (files.meta, files.data) {
                    (Some(meta), Some(data)) => (meta, data),
                    (Some(_), None) => {
                        issues.push(format!("{}: orphan metadata (no data file)", key));
                        continue;
                    }
                    (None, Some(_)) => {
                        issues.push(format!("{}: orphan data (no metadata file)", key));
                        continue;
                    }
                    (None, None) => continue,
                };

                let metadata: CacheMetadata = match std::fs::read(&meta)
                    .map_err(ProvisionError::from)
                    .and_then(|raw| Ok(serde_json::from_slice(&raw)?))
                {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        issues.push(format!("{}: unreadable metadata: {}", key, e));
                        continue;
                    }
                };
                if metadata.hash.is_empty() {
                    continue;
                }
                match hash_file(&data) {
                    Ok(actual) if actual.eq_ignore_ascii_case(&metadata.hash) => {}
                    Ok(actual) => issues.push(format!(
                        "{}: hash mismatch (expected {}, got {})",
                        key, metadata.hash, actual
                    )),
                    Err(e) => issues.push(format!("{}: unreadable data: {}", key, e)),
                }
            }
            issues
        })
        .await
        .map_err(|e| ProvisionError::transport(format!("verify task failed: {}", e)))
    }

    async fn get_index(&self, cancel: &CancellationToken) -> Result<CacheIndex> {
        check_cancelled(cancel, "get index")?;
        Ok(self.index.read().await.clone())
    }

    fn location(&self) -> String {
        self.base.display().to_string()
    }

    fn data_path(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(self.blob_path(key).display().to_string())
    }
}

/// Stream into `path`, returning the byte count and hex sha256
async fn write_blob(
    cancel: &CancellationToken,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    path: &Path,
) -> Result<(u64, String)> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(ProvisionError::cancelled("cache write interrupted")),
            n = reader.read(&mut buffer) => n?,
        };
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        file.write_all(&buffer[..n]).await?;
        size += n as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok((size, hex::encode(hasher.finalize())))
}

/// Sibling of `data_path` that scans never mistake for an entry
fn staging_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(format!(".tmp.{}", uuid::Uuid::new_v4().simple()));
    PathBuf::from(name)
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[derive(Default)]
struct EntryFiles {
    meta: Option<PathBuf>,
    data: Option<PathBuf>,
}

/// Group `.meta` and `.data` files below `base` by key
fn scan_entries(base: &Path, recursive: bool) -> BTreeMap<String, EntryFiles> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut entries: BTreeMap<String, EntryFiles> = BTreeMap::new();
    for entry in WalkDir::new(base)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Ok(relative) = entry.path().strip_prefix(base) else { continue };
        let relative = relative.to_string_lossy().replace('\\', "/");
        let Some((key, is_meta)) = split_entry_name(&relative) else { continue };
        let files = entries.entry(key).or_default();
        if is_meta {
            files.meta = Some(entry.into_path());
        } else {
            files.data = Some(entry.into_path());
        }
    }
    entries
}

/// Load every parseable metadata file below `base`
async fn scan_index(base: PathBuf) -> Result<CacheIndex> {
    tokio::task::spawn_blocking(move || {
        let mut index = CacheIndex::new();
        for (key, files) in scan_entries(&base, true) {
            let Some(meta) = files.meta else { continue };
            let parsed = std::fs::read(&meta)
                .map_err(ProvisionError::from)
                .and_then(|raw| Ok(serde_json::from_slice::<CacheMetadata>(&raw)?));
            match parsed {
                Ok(mut metadata) => {
                    metadata.key = key;
                    index.insert(metadata);
                }
                Err(e) => debug!("Skipping unreadable metadata {}: {}", meta.display(), e),
            }
        }
        index
    })
    .await
    .map_err(|e| ProvisionError::transport(format!("index scan failed: {}", e)))
}
