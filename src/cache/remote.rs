// file: src/cache/remote.rs
// version: 1.1.0
// guid: 1b5d8f3a-7e2c-4c69-a4d1-9f6b3e0a2c58

//! Cache stored on a remote host, usually the BMC's SD card
//!
//! File transfers use SFTP; directory scans, orphan removal and hashing use
//! plain SSH `exec` of `find`, `rm` and `sha256sum`.

use super::{
    check_cancelled, default_filename, split_entry_name, validate_key, Cache, CacheIndex, CacheMetadata,
    CacheReader, TagFilter, DATA_SUFFIX, META_SUFFIX,
};
use crate::config::{RemoteCacheConfig, SshEndpoint};
use crate::error::{ProvisionError, Result};
use crate::ssh::{shell_quote, SshSession};
use chrono::Utc;
use sha2::{Digest, Sha256};
use ssh2::{ErrorCode, Sftp};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COPY_BUFFER: usize = 64 * 1024;

/// libssh2 status for a missing SFTP path
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Orphan removals per `rm` invocation
const RM_BATCH: usize = 64;

/// SFTP/SSH backed cache
pub struct RemoteCache {
    session: Arc<SshSession>,
    base: String,
    index: RwLock<CacheIndex>,
}

impl RemoteCache {
    /// Connect to the remote host and index the existing entries
    pub async fn connect(config: &RemoteCacheConfig) -> Result<Self> {
        let session = Arc::new(SshSession::connect(&config.endpoint).await?);
        Self::with_session(session, &config.remote_path).await
    }

    pub async fn with_session(session: Arc<SshSession>, base: &str) -> Result<Self> {
        let cache = Self {
            session,
            base: base.trim_end_matches('/').to_string(),
            index: RwLock::new(CacheIndex::new()),
        };
        let cancel = CancellationToken::new();
        cache.run(&cancel, &format!("mkdir -p {}", shell_quote(&cache.base))).await?;
        let index = cache.scan_index(&cancel).await?;
        info!(location = %cache.location(), entries = index.len(), "Remote cache ready");
        *cache.index.write().await = index;
        Ok(cache)
    }

    fn meta_path(&self, key: &str) -> String {
        format!("{}/{}{}", self.base, key, META_SUFFIX)
    }

    fn blob_path(&self, key: &str) -> String {
        format!("{}/{}{}", self.base, key, DATA_SUFFIX)
    }

    /// Run a remote shell command, failing on non-zero exit
    async fn run(&self, cancel: &CancellationToken, command: &str) -> Result<String> {
        let output = self.session.exec(cancel, command, None).await?;
        if output.exit_status != 0 {
            return Err(ProvisionError::command_failed(
                command,
                &[],
                Some(output.exit_status as i64),
                &output.combined,
                Some(format!("on {}", self.session.endpoint().host)),
            ));
        }
        Ok(String::from_utf8_lossy(&output.combined).to_string())
    }

    /// `.meta`/`.data` files grouped by key
    async fn scan_entries(
        &self,
        cancel: &CancellationToken,
        recursive: bool,
    ) -> Result<BTreeMap<String, RemoteEntry>> {
        let depth = if recursive { "" } else { " -maxdepth 1" };
        let command = format!(
            "find {}{} -type f \\( -name '*{}' -o -name '*{}' \\)",
            shell_quote(&self.base),
            depth,
            META_SUFFIX,
            DATA_SUFFIX
        );
        let output = self.run(cancel, &command).await?;
        Ok(parse_find_output(&self.base, &output))
    }

    async fn read_metas(&self, paths: Vec<(String, String)>) -> Result<Vec<(String, Result<CacheMetadata>)>> {
        self.session
            .blocking(move |session| {
                let sftp = session.sftp()?;
                Ok(paths
                    .into_iter()
                    .map(|(key, path)| {
                        let parsed = read_file(&sftp, &path)
                            .and_then(|raw| Ok(serde_json::from_slice::<CacheMetadata>(&raw)?))
                            .map(|mut metadata| {
                                metadata.key = key.clone();
                                metadata
                            });
                        (key, parsed)
                    })
                    .collect())
            })
            .await
    }

    async fn scan_index(&self, cancel: &CancellationToken) -> Result<CacheIndex> {
        let entries = self.scan_entries(cancel, true).await?;
        let metas = entries
            .into_iter()
            .filter_map(|(key, entry)| entry.meta.map(|path| (key, path)))
            .collect();
        let mut index = CacheIndex::new();
        for (key, parsed) in self.read_metas(metas).await? {
            match parsed {
                Ok(metadata) => index.insert(metadata),
                Err(e) => debug!(key = %key, "Skipping unreadable remote metadata: {}", e),
            }
        }
        Ok(index)
    }

    async fn read_meta(&self, key: &str) -> Result<CacheMetadata> {
        let path = self.meta_path(key);
        let owned_key = key.to_string();
        self.session
            .blocking(move |session| {
                let sftp = session.sftp()?;
                let raw = read_file(&sftp, &path).map_err(|e| {
                    if e.is_not_found() {
                        ProvisionError::not_found(format!("cache key {}", owned_key))
                    } else {
                        e
                    }
                })?;
                let mut metadata: CacheMetadata = serde_json::from_slice(&raw)?;
                metadata.key = owned_key;
                Ok(metadata)
            })
            .await
    }

    async fn remove_paths(&self, paths: Vec<String>) -> Result<()> {
        self.session
            .blocking(move |session| {
                let sftp = session.sftp()?;
                for path in &paths {
                    match sftp.unlink(Path::new(path)) {
                        Ok(()) => {}
                        Err(e) if is_missing(&e) => {}
                        Err(e) => return Err(ProvisionError::from(e).wrap("remove", path.clone())),
                    }
                }
                Ok(())
            })
            .await
    }

    /// Stream `reader` to `remote`, hashing on the way
    async fn upload_blob(
        &self,
        cancel: &CancellationToken,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        remote: &str,
    ) -> Result<(u64, String)> {
        let (read_half, mut write_half) = tokio::io::duplex(COPY_BUFFER);
        let mut source = SyncIoBridge::new(read_half);
        let target_path = remote.to_string();

        let upload = self.session.blocking(move |session| {
            let sftp = session.sftp()?;
            if let Some(parent) = Path::new(&target_path).parent() {
                mkdir_all(&sftp, parent)?;
            }
            let mut target = sftp.create(Path::new(&target_path))?;
            let mut hasher = Sha256::new();
            let mut buffer = vec![0u8; COPY_BUFFER];
            let mut size = 0u64;
            loop {
                let n = source.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
                target.write_all(&buffer[..n])?;
                size += n as u64;
            }
            target.flush()?;
            Ok((size, hex::encode(hasher.finalize())))
        });

        let feed = async move {
            let copied = tokio::select! {
                _ = cancel.cancelled() => Err(ProvisionError::cancelled("remote cache upload interrupted")),
                copied = tokio::io::copy(reader, &mut write_half) => copied.map_err(ProvisionError::from),
            };
            let _ = write_half.shutdown().await;
            copied
        };

        let (fed, uploaded) = tokio::join!(feed, upload);
        let uploaded = uploaded?;
        fed?;
        Ok(uploaded)
    }

    async fn write_meta(&self, key: &str, metadata: &CacheMetadata) -> Result<()> {
        let path = self.meta_path(key);
        let json = serde_json::to_vec_pretty(metadata)?;
        self.session
            .blocking(move |session| {
                let sftp = session.sftp()?;
                if let Some(parent) = Path::new(&path).parent() {
                    mkdir_all(&sftp, parent)?;
                }
                let mut file = sftp.create(Path::new(&path))?;
                file.write_all(&json)?;
                Ok(())
            })
            .await
            .map_err(|e| e.wrap("write metadata", key))
    }
}

#[async_trait::async_trait]
impl Cache for RemoteCache {
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
        let staging = format!("{}.tmp.{}", data_path, uuid::Uuid::new_v4().simple());
        let (size, digest) = match self.upload_blob(cancel, reader, &staging).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                self.discard(&staging).await;
                return Err(e.wrap("put", key));
            }
        };

        if metadata.hash.is_empty() {
            metadata.hash = digest;
        } else if !metadata.hash.eq_ignore_ascii_case(&digest) {
            self.discard(&staging).await;
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
            self.discard(&staging).await;
            return Err(e);
        }
        // SFTP v3 rename refuses an existing target
        let replace = format!("mv -f {} {}", shell_quote(&staging), shell_quote(&data_path));
        if let Err(e) = self.run(&CancellationToken::new(), &replace).await {
            self.discard(&staging).await;
            return Err(e.wrap("put", key));
        }

        index.insert(metadata.clone());
        info!(key, size, location = %self.location(), "Uploaded cache entry");
        Ok(metadata)
    }

    /// The session stays busy until the returned reader is drained or dropped
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

        let path = self.blob_path(key);
        let stat_path = path.clone();
        self.session
            .blocking(move |session| {
                session.sftp()?.stat(Path::new(&stat_path)).map_err(|e| {
                    if is_missing(&e) {
                        ProvisionError::not_found(stat_path.clone())
                    } else {
                        ProvisionError::from(e)
                    }
                })?;
                Ok(())
            })
            .await?;

        let (read_half, write_half) = tokio::io::duplex(COPY_BUFFER);
        let mut sink = SyncIoBridge::new(write_half);
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let result = session
                .blocking(move |session| {
                    let sftp = session.sftp()?;
                    let mut file = sftp.open(Path::new(&path))?;
                    std::io::copy(&mut file, &mut sink)?;
                    sink.shutdown()?;
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                debug!("Remote read stream ended early: {}", e);
            }
        });

        Ok((metadata, Some(Box::new(read_half))))
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
        let path = self.meta_path(key);
        self.session
            .blocking(move |session| match session.sftp()?.stat(Path::new(&path)) {
                Ok(_) => Ok(true),
                Err(e) if is_missing(&e) => Ok(false),
                Err(e) => Err(e.into()),
            })
            .await
    }

    async fn list(&self, cancel: &CancellationToken, filter: &TagFilter) -> Result<Vec<CacheMetadata>> {
        check_cancelled(cancel, "list")?;
        Ok(self.index.read().await.list(filter))
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        validate_key(key)?;
        check_cancelled(cancel, "delete")?;
        let mut index = self.index.write().await;
        self.remove_paths(vec![self.meta_path(key), self.blob_path(key)])
            .await
            .map_err(|e| e.wrap("delete", key))?;
        index.remove(key);
        Ok(())
    }

    async fn rebuild_index(&self, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel, "rebuild index")?;
        let mut index = self.index.write().await;
        *index = self.scan_index(cancel).await?;
        debug!(entries = index.len(), "Remote cache index rebuilt");
        Ok(())
    }

    async fn cleanup(&self, cancel: &CancellationToken, recursive: bool) -> Result<usize> {
        check_cancelled(cancel, "cleanup")?;
        let mut index = self.index.write().await;

        let mut orphans = Vec::new();
        for (key, entry) in self.scan_entries(cancel, recursive).await? {
            match (entry.meta, entry.data) {
                (Some(meta), None) => orphans.push((key, meta)),
                (None, Some(data)) => orphans.push((key, data)),
                _ => {}
            }
        }

        for batch in orphans.chunks(RM_BATCH) {
            let quoted: Vec<String> = batch.iter().map(|(_, path)| shell_quote(path)).collect();
            self.run(cancel, &format!("rm -f -- {}", quoted.join(" "))).await?;
        }
        for (key, path) in &orphans {
            index.remove(key);
            info!(key = %key, "Removed remote orphan {}", path);
        }

        if recursive {
            let prune = format!(
                "find {} -mindepth 1 -type d -empty -delete",
                shell_quote(&self.base)
            );
            if let Err(e) = self.run(cancel, &prune).await {
                warn!("Failed to prune empty remote directories: {}", e);
            }
        }
        Ok(orphans.len())
    }

    async fn verify_integrity(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        check_cancelled(cancel, "verify")?;
        let _index = self.index.read().await;

        let mut issues = Vec::new();
        let mut complete = Vec::new();
        for (key, entry) in self.scan_entries(cancel, true).await? {
            match (entry.meta, entry.data) {
                (Some(meta), Some(data)) => complete.push((key, meta, data)),
                (Some(_), None) => issues.push(format!("{}: orphan metadata (no data file)", key)),
                (None, Some(_)) => issues.push(format!("{}: orphan data (no metadata file)", key)),
                (None, None) => {}
            }
        }

        let metas = complete.iter().map(|(k, m, _)| (k.clone(), m.clone())).collect();
        let data_paths: HashMap<String, String> = complete.into_iter().map(|(k, _, d)| (k, d)).collect();
        let mut expected = Vec::new();
        for (key, parsed) in self.read_metas(metas).await? {
            match parsed {
                Ok(metadata) if metadata.hash.is_empty() => {}
                Ok(metadata) => expected.push((key, metadata.hash)),
                Err(e) => issues.push(format!("{}: unreadable metadata: {}", key, e)),
            }
        }

        for batch in expected.chunks(RM_BATCH) {
            let quoted: Vec<String> = batch
                .iter()
                .filter_map(|(key, _)| data_paths.get(key).map(|p| shell_quote(p)))
                .collect();
            let output = self
                .session
                .exec(cancel, &format!("sha256sum -- {}", quoted.join(" ")), None)
                .await?;
            let sums = parse_sha256sum(&String::from_utf8_lossy(&output.combined));
            for (key, hash) in batch {
                match data_paths.get(key).and_then(|path| sums.get(path)) {
                    Some(actual) if actual.eq_ignore_ascii_case(hash) => {}
                    Some(actual) => issues.push(format!(
                        "{}: hash mismatch (expected {}, got {})",
                        key, hash, actual
                    )),
                    None => issues.push(format!("{}: unreadable data", key)),
                }
            }
        }

        issues.sort();
        Ok(issues)
    }

    async fn get_index(&self, cancel: &CancellationToken) -> Result<CacheIndex> {
        check_cancelled(cancel, "get index")?;
        Ok(self.index.read().await.clone())
    }

    fn location(&self) -> String {
        format_location(self.session.endpoint(), &self.base)
    }

    fn data_path(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(self.blob_path(key))
    }

    async fn close(&self) {
        self.session.disconnect().await;
    }
}

impl RemoteCache {
    async fn discard(&self, path: &str) {
        if let Err(e) = self.remove_paths(vec![path.to_string()]).await {
            warn!("Failed to remove staged upload {}: {}", path, e);
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct RemoteEntry {
    meta: Option<String>,
    data: Option<String>,
}

/// `ssh://user@host:path`
pub fn format_location(endpoint: &SshEndpoint, base: &str) -> String {
    format!("ssh://{}@{}:{}", endpoint.user, endpoint.host, base)
}

fn parse_find_output(base: &str, output: &str) -> BTreeMap<String, RemoteEntry> {
    let prefix = format!("{}/", base);
    let mut entries: BTreeMap<String, RemoteEntry> = BTreeMap::new();
    for line in output.lines() {
        let Some(relative) = line.trim_end().strip_prefix(&prefix) else { continue };
        let Some((key, is_meta)) = split_entry_name(relative) else { continue };
        let entry = entries.entry(key).or_default();
        if is_meta {
            entry.meta = Some(line.trim_end().to_string());
        } else {
            entry.data = Some(line.trim_end().to_string());
        }
    }
    entries
}

/// `<hash>  <path>` lines from sha256sum, keyed by path
fn parse_sha256sum(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (hash, path) = line.split_once("  ")?;
            (hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()))
                .then(|| (path.to_string(), hash.to_string()))
        })
        .collect()
}

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

fn read_file(sftp: &Sftp, path: &str) -> Result<Vec<u8>> {
    let mut file = sftp.open(Path::new(path)).map_err(|e| {
        if is_missing(&e) {
            ProvisionError::not_found(path.to_string())
        } else {
            ProvisionError::from(e)
        }
    })?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    Ok(raw)
}

fn mkdir_all(sftp: &Sftp, dir: &Path) -> Result<()> {
    let mut current = std::path::PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if sftp.stat(&current).is_ok() {
            continue;
        }
        if let Err(e) = sftp.mkdir(&current, 0o755) {
            if sftp.stat(&current).is_err() {
                return Err(ProvisionError::from(e).wrap("mkdir", current.display().to_string()));
            }
        }
    }
    Ok(())
}
