// file: src/cache/mod.rs
// version: 1.0.0
// guid: 9e1d4b7a-2c5f-4a38-b6e9-0f3a7c2d8e15

//! Content-addressed image cache
//!
//! Every entry is a pair of files below the cache base: `<key>.meta` holds the
//! JSON [`CacheMetadata`] and `<key>.data` holds the blob. Keys may contain
//! `/`, which creates intermediate directories. Both implementations keep an
//! in-memory [`CacheIndex`] that can be rebuilt from the metadata files alone.

pub mod index;
pub mod index_manager;
pub mod local;
pub mod remote;

pub use index::{CacheIndex, TagFilter};
pub use index_manager::IndexManager;
pub use local::LocalCache;
pub use remote::RemoteCache;

use crate::error::{ProvisionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Suffix of metadata files
pub const META_SUFFIX: &str = ".meta";

/// Suffix of blob files
pub const DATA_SUFFIX: &str = ".data";

/// Readable blob handed out by [`Cache::get`]
pub type CacheReader = Box<dyn AsyncRead + Send + Unpin>;

/// Metadata stored next to every blob
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mod_time: DateTime<Utc>,
    /// Hex sha256 of the blob; empty when unknown
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub os_type: String,
    #[serde(default)]
    pub os_version: String,
}

impl CacheMetadata {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    pub fn os(mut self, os_type: impl Into<String>, os_version: impl Into<String>) -> Self {
        self.os_type = os_type.into();
        self.os_version = os_version.into();
        self
    }

    /// Expected content hash, checked by `put`
    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }
}

/// Operations shared by the local and remote caches
///
/// Every method checks the token on entry. `put`, `delete`, `rebuild_index`
/// and `cleanup` hold the cache's write lock; the rest take the read lock.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    /// Stream `reader` into the entry for `key`, returning the stored metadata
    ///
    /// An empty `metadata.hash` is filled with the computed sha256; a
    /// non-empty one must match or the put fails with an integrity error.
    async fn put(
        &self,
        cancel: &CancellationToken,
        key: &str,
        metadata: CacheMetadata,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<CacheMetadata>;

    /// Metadata, plus a reader over the blob when `want_content` is set
    async fn get(
        &self,
        cancel: &CancellationToken,
        key: &str,
        want_content: bool,
    ) -> Result<(CacheMetadata, Option<CacheReader>)>;

    async fn stat(&self, cancel: &CancellationToken, key: &str) -> Result<CacheMetadata>;

    async fn exists(&self, cancel: &CancellationToken, key: &str) -> Result<bool>;

    /// Entries carrying every `(tag, value)` pair in `filter`; all entries when empty
    async fn list(&self, cancel: &CancellationToken, filter: &TagFilter) -> Result<Vec<CacheMetadata>>;

    /// Remove both files; missing files are not an error
    async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<()>;

    /// Replace the in-memory index with one built from the metadata files
    async fn rebuild_index(&self, cancel: &CancellationToken) -> Result<()>;

    /// Delete orphaned `.meta` and `.data` files, returning how many went
    async fn cleanup(&self, cancel: &CancellationToken, recursive: bool) -> Result<usize>;

    /// Describe orphans, unreadable metadata and hash mismatches without changing anything
    async fn verify_integrity(&self, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// Snapshot of the in-memory index
    async fn get_index(&self, cancel: &CancellationToken) -> Result<CacheIndex>;

    /// Base directory or `ssh://user@host:path`
    fn location(&self) -> String;

    /// Path of the blob for `key` as seen on the cache's own host
    fn data_path(&self, key: &str) -> Result<String>;

    async fn close(&self) {}
}

/// Reject keys that would escape the cache base
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(ProvisionError::config("cache key cannot be empty"));
    }
    if key.starts_with('/') || key.ends_with('/') || key.contains('\\') {
        return Err(ProvisionError::config(format!("invalid cache key: {}", key)));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(ProvisionError::config(format!("invalid cache key: {}", key)));
    }
    Ok(())
}

pub(crate) fn check_cancelled(cancel: &CancellationToken, op: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::cancelled(format!("cache {}", op)));
    }
    Ok(())
}

/// Key of a cache file path relative to the base, if it is a `.meta` or `.data` file
pub(crate) fn split_entry_name(relative: &str) -> Option<(String, bool)> {
    if let Some(key) = relative.strip_suffix(META_SUFFIX) {
        Some((key.to_string(), true))
    } else {
        relative
            .strip_suffix(DATA_SUFFIX)
            .map(|key| (key.to_string(), false))
    }
}

/// Default filename for a key: its last path component
pub(crate) fn default_filename(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}
