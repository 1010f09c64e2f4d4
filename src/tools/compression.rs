// file: src/tools/compression.rs
// version: 1.1.0
// guid: 3e8c1a5f-7b2d-4096-a4e1-6f0d9b3c2e87

//! xz, gzip and tar.gz through the executor
//!
//! Every operation writes to `<target>.tmp.<nanos>` in the destination
//! directory and renames over the final path once the tool succeeded. The
//! temporary output is removed when anything fails.

use crate::error::{ProvisionError, Result};
use crate::executor::CommandExecutor;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default xz preset; `-6` decompresses identically and compresses far faster than `-9`
pub const DEFAULT_XZ_LEVEL: u32 = 6;

/// Maximum xz preset
pub const MAX_XZ_LEVEL: u32 = 9;

const DEFAULT_GZ_LEVEL: u32 = 6;

/// Compression and archive operations
#[derive(Clone)]
pub struct CompressionTool {
    executor: Arc<dyn CommandExecutor>,
    xz_level: u32,
}

impl CompressionTool {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            xz_level: DEFAULT_XZ_LEVEL,
        }
    }

    /// Use a different xz preset, clamped to 0..=9
    pub fn with_xz_level(mut self, level: u32) -> Self {
        self.xz_level = level.min(MAX_XZ_LEVEL);
        self
    }

    pub fn xz_level(&self) -> u32 {
        self.xz_level
    }

    /// Decompress `source` into `out_dir`, returning the decompressed path
    pub async fn decompress_xz(&self, cancel: &CancellationToken, source: &str, out_dir: &str) -> Result<String> {
        let target = output_path(source, out_dir, ".xz");
        self.decompress_xz_to(cancel, source, &target).await?;
        Ok(target)
    }

    /// Decompress `source` into the exact path `target`
    pub async fn decompress_xz_to(&self, cancel: &CancellationToken, source: &str, target: &str) -> Result<()> {
        self.stream(cancel, "decompress xz", source, target, r#"xz -d -c "$1" > "$2""#, &[])
            .await
    }

    /// Compress `source` into `out_xz`; `source` is kept
    pub async fn compress_xz(&self, cancel: &CancellationToken, source: &str, out_xz: &str) -> Result<()> {
        let level = format!("-{}", self.xz_level);
        self.stream(
            cancel,
            "compress xz",
            source,
            out_xz,
            r#"xz -z -k -T0 "$4" -c "$1" > "$2""#,
            &[&level],
        )
        .await
    }

    pub async fn decompress_gz(&self, cancel: &CancellationToken, source: &str, out_dir: &str) -> Result<String> {
        let target = output_path(source, out_dir, ".gz");
        self.decompress_gz_to(cancel, source, &target).await?;
        Ok(target)
    }

    pub async fn decompress_gz_to(&self, cancel: &CancellationToken, source: &str, target: &str) -> Result<()> {
        self.stream(cancel, "decompress gz", source, target, r#"gzip -d -c "$1" > "$2""#, &[])
            .await
    }

    pub async fn compress_gz(&self, cancel: &CancellationToken, source: &str, out_gz: &str) -> Result<()> {
        let level = format!("-{}", DEFAULT_GZ_LEVEL);
        self.stream(
            cancel,
            "compress gz",
            source,
            out_gz,
            r#"gzip "$4" -c "$1" > "$2""#,
            &[&level],
        )
        .await
    }

    /// Extract a tar.gz archive into `out_dir`
    ///
    /// Entries land beside whatever `out_dir` already holds; files with the
    /// same name are overwritten.
    pub async fn decompress_tar_gz(&self, cancel: &CancellationToken, source: &str, out_dir: &str) -> Result<()> {
        self.require_source(cancel, source).await?;
        let staging = temp_path(out_dir);
        let script = r#"set -e; mkdir -p "$2" "$3"; tar -xzf "$1" -C "$2"; cp -a "$2"/. "$3"/; rm -rf "$2""#;
        let result = self
            .executor
            .execute(cancel, "sh", &["-c", script, "sh", source, &staging, out_dir])
            .await;
        self.finish(result, "extract tar.gz", source, &staging).await?;
        info!("Extracted {} into {}", source, out_dir);
        Ok(())
    }

    /// Archive the contents of `source_dir` into `out_tar_gz`
    pub async fn compress_tar_gz(&self, cancel: &CancellationToken, source_dir: &str, out_tar_gz: &str) -> Result<()> {
        self.require_source(cancel, source_dir).await?;
        let tmp = temp_path(out_tar_gz);
        let script = r#"set -e; mkdir -p "$(dirname "$3")"; tar -czf "$2" -C "$1" .; mv -f "$2" "$3""#;
        let result = self
            .executor
            .execute(cancel, "sh", &["-c", script, "sh", source_dir, &tmp, out_tar_gz])
            .await;
        self.finish(result, "create tar.gz", source_dir, &tmp).await?;
        info!("Archived {} into {}", source_dir, out_tar_gz);
        Ok(())
    }

    /// Run `<script>` with `$1` source, `$2` temp, `$3` target, `$4..` extra, then rename
    async fn stream(
        &self,
        cancel: &CancellationToken,
        op: &str,
        source: &str,
        target: &str,
        script: &str,
        extra: &[&str],
    ) -> Result<()> {
        self.require_source(cancel, source).await?;
        let tmp = temp_path(target);
        let full = format!(r#"set -e; mkdir -p "$(dirname "$2")"; {}; mv -f "$2" "$3""#, script);
        let mut args = vec!["-c", full.as_str(), "sh", source, tmp.as_str(), target];
        args.extend_from_slice(extra);

        debug!("{}: {} -> {}", op, source, target);
        let result = self.executor.execute(cancel, "sh", &args).await;
        self.finish(result, op, source, &tmp).await?;
        info!("{} complete: {}", op, target);
        Ok(())
    }

    async fn require_source(&self, cancel: &CancellationToken, source: &str) -> Result<()> {
        match self.executor.execute(cancel, "test", &["-e", source]).await {
            Ok(_) => Ok(()),
            Err(ProvisionError::CommandFailed {
                exit_code: Some(1), ..
            }) => Err(ProvisionError::precondition(format!("source {} does not exist", source))),
            Err(e) => Err(e.wrap("check source", source)),
        }
    }

    /// Remove the temporary output when the tool failed
    async fn finish(&self, result: Result<Vec<u8>>, op: &str, source: &str, tmp: &str) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let cleanup = CancellationToken::new();
                if let Err(rm) = self.executor.execute(&cleanup, "rm", &["-rf", tmp]).await {
                    warn!("Failed to remove temporary output {}: {}", tmp, rm);
                }
                Err(e.wrap(op, source))
            }
        }
    }
}

/// `<out_dir>/<basename of source without suffix>`
fn output_path(source: &str, out_dir: &str, suffix: &str) -> String {
    let name = Path::new(source)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| source.to_string());
    let stem = name.strip_suffix(suffix).unwrap_or(&name);
    let stem = if stem == name { format!("{}.out", name) } else { stem.to_string() };
    format!("{}/{}", out_dir.trim_end_matches('/'), stem)
}

/// Unique sibling path `<target>.tmp.<nanos>`
fn temp_path(target: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}.tmp.{}", target.trim_end_matches('/'), nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::executor::mock::{MockExecutor, MockResponse};

    #[test]
    fn test_output_path() {
        assert_eq!(output_path("/cache/ubuntu.img.xz", "/work", ".xz"), "/work/ubuntu.img");
        assert_eq!(output_path("/cache/ubuntu.img", "/work/", ".xz"), "/work/ubuntu.img.out");
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path("/work/out.img.xz");
        assert!(tmp.starts_with("/work/out.img.xz.tmp."));
    }

    #[test]
    fn test_xz_level_clamped() {
        let tool = CompressionTool::new(Arc::new(MockExecutor::new()));
        assert_eq!(tool.xz_level(), DEFAULT_XZ_LEVEL);
        assert_eq!(tool.with_xz_level(42).xz_level(), MAX_XZ_LEVEL);
    }

    #[tokio::test]
    async fn test_missing_source_is_precondition() {
        let mock = Arc::new(MockExecutor::new());
        mock.fail("test", 1, "");
        let tool = CompressionTool::new(mock.clone());
        let cancel = CancellationToken::new();
        let err = tool.decompress_xz(&cancel, "/nope.img.xz", "/work").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert!(mock.calls_for("sh").is_empty());
    }

    #[tokio::test]
    async fn test_failure_removes_temp() {
        let mock = Arc::new(MockExecutor::new());
        mock.push("sh", MockResponse::fail(1, "xz: out of space"));
        let tool = CompressionTool::new(mock.clone());
        let cancel = CancellationToken::new();
        assert!(tool.compress_xz(&cancel, "/work/a.img", "/cache/a.img.xz").await.is_err());
        let rm = mock.calls_for("rm");
        assert_eq!(rm.len(), 1);
        assert!(rm[0].args[1].starts_with("/cache/a.img.xz.tmp."));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gzip_roundtrip_native() {
        use crate::executor::NativeExecutor;

        let temp = tempfile::TempDir::new().unwrap();
        let src = temp.path().join("disk.img");
        std::fs::write(&src, vec![7u8; 4096]).unwrap();
        let src = src.to_str().unwrap();
        let gz = format!("{}.gz", src);
        let out_dir = temp.path().join("out");
        let out_dir = out_dir.to_str().unwrap();

        let tool = CompressionTool::new(Arc::new(NativeExecutor::new()));
        let cancel = CancellationToken::new();
        tool.compress_gz(&cancel, src, &gz).await.unwrap();
        let restored = tool.decompress_gz(&cancel, &gz, out_dir).await.unwrap();

        assert_eq!(std::fs::read(restored).unwrap(), vec![7u8; 4096]);
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tar_gz_extract_keeps_existing_files() {
        use crate::executor::NativeExecutor;

        let temp = tempfile::TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        std::fs::create_dir_all(tree.join("boot")).unwrap();
        std::fs::write(tree.join("a.txt"), "new").unwrap();
        std::fs::write(tree.join("boot/config.txt"), "arm_64bit=1").unwrap();
        let archive = temp.path().join("tree.tar.gz");
        let archive = archive.to_str().unwrap();

        let out = temp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("keep.txt"), "mine").unwrap();
        std::fs::write(out.join("a.txt"), "old").unwrap();

        let tool = CompressionTool::new(Arc::new(NativeExecutor::new()));
        let cancel = CancellationToken::new();
        tool.compress_tar_gz(&cancel, tree.to_str().unwrap(), archive)
            .await
            .unwrap();
        tool.decompress_tar_gz(&cancel, archive, out.to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(out.join("keep.txt")).unwrap(), "mine");
        assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "new");
        assert_eq!(
            std::fs::read_to_string(out.join("boot/config.txt")).unwrap(),
            "arm_64bit=1"
        );
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
