// file: src/tools/download.rs
// version: 2.0.0
// guid: u1v2w3x4-y5z6-7890-1234-567890uvwxyz

//! Base image downloads over HTTP(S)

use crate::error::{ProvisionError, Result, ResultExt};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a completed download
#[derive(Debug, Clone)]
pub struct DownloadedImage {
    pub path: PathBuf,
    pub size: u64,
    /// hex sha256 of the downloaded bytes
    pub sha256: String,
}

/// HTTP downloader with progress tracking and on-the-fly hashing
#[derive(Clone)]
pub struct ImageDownloader {
    client: reqwest::Client,
    show_progress: bool,
}

impl ImageDownloader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            show_progress: true,
        }
    }

    /// Disable the terminal progress bar
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    /// Download `url` to `dest`, hashing as bytes arrive
    ///
    /// Data lands in `<dest>.part` first and is renamed once complete. When
    /// `expected_sha256` is given a mismatch removes the partial file.
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        url: &str,
        dest: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<DownloadedImage> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ProvisionError::config(format!("invalid image URL {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProvisionError::config(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }

        info!("Downloading: {}", url);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProvisionError::cancelled(format!("download {}", url))),
            response = self.client.get(parsed).send() => response.with_op("download", url)?,
        };
        if !response.status().is_success() {
            let status = response.status();
            let err = ProvisionError::transport(format!("download failed with status: {}", status));
            return Err(if status == reqwest::StatusCode::NOT_FOUND {
                ProvisionError::not_found(url.to_string())
            } else {
                err
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.with_op("create directory", parent.display())?;
        }
        let partial = partial_path(dest);
        let result = self.stream_to_file(cancel, response, &partial).await;
        let (size, sha256) = match result {
            Ok(done) => done,
            Err(e) => {
                remove_partial(&partial).await;
                return Err(e.wrap("download", url));
            }
        };

        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                remove_partial(&partial).await;
                return Err(ProvisionError::integrity(format!(
                    "{}: hash mismatch (expected {}, got {})",
                    url, expected, sha256
                )));
            }
        }

        tokio::fs::rename(&partial, dest).await.with_op("rename", dest.display())?;
        info!("Downloaded to: {} ({} bytes)", dest.display(), size);
        Ok(DownloadedImage {
            path: dest.to_path_buf(),
            size,
            sha256,
        })
    }

    async fn stream_to_file(
        &self,
        cancel: &CancellationToken,
        response: reqwest::Response,
        partial: &Path,
    ) -> Result<(u64, String)> {
        let total_size = response.content_length().unwrap_or(0);
        let pb = self.progress_bar(total_size);

        let mut file = File::create(partial).await?;
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    pb.abandon();
                    return Err(ProvisionError::cancelled("download interrupted"));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }

        file.flush().await?;
        file.sync_all().await?;
        pb.finish_with_message("Download completed");
        debug!("Received {} bytes", downloaded);
        Ok((downloaded, hex::encode(hasher.finalize())))
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }

    /// Content length from a HEAD request, if the server reports one
    pub async fn get_file_size(&self, url: &str) -> Result<Option<u64>> {
        let response = self.client.head(url).send().await.with_op("head", url)?;
        Ok(response.content_length())
    }

    /// Whether a HEAD request succeeds
    pub async fn verify_url(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

impl Default for ImageDownloader {
    fn default() -> Self {
        Self::new()
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial download {}: {}", path.display(), e);
        }
    }
}
