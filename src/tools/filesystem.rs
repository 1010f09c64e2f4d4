// file: src/tools/filesystem.rs
// version: 2.0.0
// guid: x5y6z7a8-b9c0-1234-5678-901234567890

//! Partition mapping, mounts and file edits inside image filesystems
//!
//! Every command goes through the configured executor, so the same calls work
//! on a Linux host and inside the tool container.

use crate::error::{ProvisionError, Result};
use crate::executor::CommandExecutor;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Writes stdin to `$1` through a temp file in the same directory
const ATOMIC_WRITE: &str = r#"set -e
target="$1"
mkdir -p "$(dirname "$target")"
tmp="$target.tmp.$$"
trap 'rm -f "$tmp"' EXIT
cat > "$tmp"
chmod "$2" "$tmp"
mv -f "$tmp" "$target""#;

/// Copies `$1` over `$2` through a temp file next to the target
const ATOMIC_COPY: &str = r#"set -e
mkdir -p "$(dirname "$2")"
tmp="$2.tmp.$$"
trap 'rm -f "$tmp"' EXIT
cp -f "$1" "$tmp"
mv -f "$tmp" "$2""#;

/// Filesystem types accepted by [`FilesystemTool::format`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext4,
    Vfat,
}

impl std::str::FromStr for FsType {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ext4" => Ok(Self::Ext4),
            "vfat" | "fat32" => Ok(Self::Vfat),
            other => Err(ProvisionError::config(format!("unsupported filesystem type: {}", other))),
        }
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// permission string as printed by `ls`, e.g. `drwxr-xr-x`
    pub mode: String,
    pub modtime: Option<DateTime<Utc>>,
    pub is_dir: bool,
    pub symlink_target: Option<String>,
}

/// Filesystem operations over a command executor
#[derive(Clone)]
pub struct FilesystemTool {
    executor: Arc<dyn CommandExecutor>,
}

impl FilesystemTool {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// Map the partitions of a disk image and return the root partition device
    pub async fn map_partitions(&self, cancel: &CancellationToken, image: &str) -> Result<String> {
        info!("Mapping partitions of {}", image);
        let output = self
            .executor
            .execute(cancel, "kpartx", &["-av", image])
            .await
            .map_err(|e| e.wrap("map partitions", image))?;

        let maps = parse_partition_maps(&String::from_utf8_lossy(&output));
        let root = maps.get(1).ok_or_else(|| {
            ProvisionError::precondition(format!(
                "expected at least 2 partitions in {}, found {}",
                image,
                maps.len()
            ))
        })?;
        let device = format!("/dev/mapper/{}", root);
        debug!("Root partition of {} is {}", image, device);
        Ok(device)
    }

    /// Remove every partition mapping of a disk image
    pub async fn unmap_partitions(&self, cancel: &CancellationToken, image: &str) -> Result<()> {
        self.executor
            .execute(cancel, "kpartx", &["-dv", image])
            .await
            .map_err(|e| e.wrap("unmap partitions", image))?;
        Ok(())
    }

    pub async fn mount(
        &self,
        cancel: &CancellationToken,
        device: &str,
        mountpoint: &str,
        fstype: Option<&str>,
        options: Option<&str>,
    ) -> Result<()> {
        self.executor
            .execute(cancel, "mkdir", &["-p", mountpoint])
            .await
            .map_err(|e| e.wrap("create mountpoint", mountpoint))?;

        let mut args = Vec::new();
        if let Some(fstype) = fstype {
            args.extend(["-t", fstype]);
        }
        if let Some(options) = options {
            args.extend(["-o", options]);
        }
        args.extend([device, mountpoint]);

        self.executor
            .execute(cancel, "mount", &args)
            .await
            .map_err(|e| e.wrap("mount", format!("{} on {}", device, mountpoint)))?;
        info!("Mounted {} on {}", device, mountpoint);
        Ok(())
    }

    pub async fn unmount(&self, cancel: &CancellationToken, mountpoint: &str) -> Result<()> {
        self.executor
            .execute(cancel, "umount", &[mountpoint])
            .await
            .map_err(|e| e.wrap("unmount", mountpoint))?;
        info!("Unmounted {}", mountpoint);
        Ok(())
    }

    /// Create a filesystem; only ext4 and vfat/fat32 are accepted
    pub async fn format(
        &self,
        cancel: &CancellationToken,
        device: &str,
        fstype: &str,
        label: Option<&str>,
    ) -> Result<()> {
        let fstype: FsType = fstype.parse()?;
        let (program, mut args) = match fstype {
            FsType::Ext4 => ("mkfs.ext4", vec!["-F"]),
            FsType::Vfat => ("mkfs.vfat", vec!["-F", "32"]),
        };
        if let Some(label) = label {
            args.push(if fstype == FsType::Ext4 { "-L" } else { "-n" });
            args.push(label);
        }
        args.push(device);

        self.executor
            .execute(cancel, program, &args)
            .await
            .map_err(|e| e.wrap("format", device))?;
        Ok(())
    }

    /// Grow the filesystem on `device` to fill its partition
    pub async fn resize_filesystem(&self, cancel: &CancellationToken, device: &str) -> Result<()> {
        let fstype = self.get_fs_type(cancel, device).await?;
        match fstype.as_str() {
            "ext4" => {
                self.executor
                    .execute(cancel, "resize2fs", &[device])
                    .await
                    .map_err(|e| e.wrap("resize filesystem", device))?;
                info!("Resized ext4 filesystem on {}", device);
                Ok(())
            }
            "vfat" | "fat32" | "fat16" | "fat" => {
                debug!("Skipping resize of {} filesystem on {}", fstype, device);
                Ok(())
            }
            other => Err(ProvisionError::config(format!(
                "cannot resize {} filesystem on {}",
                other, device
            ))),
        }
    }

    /// Whether a partition is mounted, and where
    pub async fn is_partition_mounted(
        &self,
        cancel: &CancellationToken,
        partition: &str,
    ) -> Result<(bool, Option<String>)> {
        let result = self
            .executor
            .execute(cancel, "findmnt", &["-n", "-o", "TARGET", "--source", partition])
            .await;

        match result {
            Ok(output) => {
                let text = String::from_utf8_lossy(&output);
                let target = text.lines().next().map(str::trim).filter(|l| !l.is_empty());
                Ok((target.is_some(), target.map(str::to_string)))
            }
            Err(e) if not_mounted(&e) => Ok((false, None)),
            Err(e) => Err(e.wrap("check mount", partition)),
        }
    }

    pub async fn get_fs_type(&self, cancel: &CancellationToken, partition: &str) -> Result<String> {
        let output = self
            .executor
            .execute(cancel, "blkid", &["-o", "value", "-s", "TYPE", partition])
            .await
            .map_err(|e| e.wrap("read filesystem type", partition))?;
        let fstype = String::from_utf8_lossy(&output).trim().to_string();
        if fstype.is_empty() {
            return Err(ProvisionError::not_found(format!("no filesystem on {}", partition)));
        }
        Ok(fstype)
    }

    /// Atomically write `data` to `root/rel` with `mode`
    pub async fn write_file(
        &self,
        cancel: &CancellationToken,
        root: &str,
        rel: &str,
        data: &[u8],
        mode: u32,
    ) -> Result<()> {
        let target = join_root(root, rel)?;
        let mode = format!("{:o}", mode);
        self.executor
            .execute_with_input(cancel, data, "sh", &["-c", ATOMIC_WRITE, "sh", &target, &mode])
            .await
            .map_err(|e| e.wrap("write file", &target))?;
        debug!("Wrote {} bytes to {}", data.len(), target);
        Ok(())
    }

    /// Read `root/rel`; bytes are carried as base64 across the executor
    pub async fn read_file(&self, cancel: &CancellationToken, root: &str, rel: &str) -> Result<Vec<u8>> {
        let target = join_root(root, rel)?;
        let output = self
            .executor
            .execute(cancel, "base64", &[&target])
            .await
            .map_err(|e| {
                if e.command_output().is_some_and(|o| o.contains("No such file")) {
                    ProvisionError::not_found(target.clone())
                } else {
                    e.wrap("read file", &target)
                }
            })?;

        let encoded: Vec<u8> = output.into_iter().filter(|b| !b.is_ascii_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ProvisionError::integrity(format!("bad base64 from {}: {}", target, e)))
    }

    /// Copy a file from the host side into `root/dest_rel`
    pub async fn copy_file(
        &self,
        cancel: &CancellationToken,
        root: &str,
        src: &str,
        dest_rel: &str,
    ) -> Result<()> {
        let target = join_root(root, dest_rel)?;
        self.executor
            .execute(cancel, "sh", &["-c", ATOMIC_COPY, "sh", src, &target])
            .await
            .map_err(|e| e.wrap("copy file", &target))?;
        Ok(())
    }

    /// Mirror the contents of `src` into `dst`, preserving attributes
    pub async fn copy_directory(&self, cancel: &CancellationToken, src: &str, dst: &str) -> Result<()> {
        self.executor
            .execute(cancel, "mkdir", &["-p", dst])
            .await
            .map_err(|e| e.wrap("create directory", dst))?;
        let from = format!("{}/.", src.trim_end_matches('/'));
        let to = format!("{}/", dst.trim_end_matches('/'));
        self.executor
            .execute(cancel, "cp", &["-a", &from, &to])
            .await
            .map_err(|e| e.wrap("copy directory", src))?;
        Ok(())
    }

    pub async fn mkdir(&self, cancel: &CancellationToken, root: &str, rel: &str, mode: u32) -> Result<()> {
        let target = join_root(root, rel)?;
        let mode = format!("{:o}", mode);
        self.executor
            .execute(cancel, "mkdir", &["-p", "-m", &mode, &target])
            .await
            .map_err(|e| e.wrap("mkdir", &target))?;
        Ok(())
    }

    pub async fn chmod(&self, cancel: &CancellationToken, root: &str, rel: &str, mode: u32) -> Result<()> {
        let target = join_root(root, rel)?;
        let mode = format!("{:o}", mode);
        self.executor
            .execute(cancel, "chmod", &[&mode, &target])
            .await
            .map_err(|e| e.wrap("chmod", &target))?;
        Ok(())
    }

    pub async fn exists(&self, cancel: &CancellationToken, root: &str, rel: &str) -> Result<bool> {
        self.test(cancel, "-e", &join_root(root, rel)?).await
    }

    pub async fn is_dir(&self, cancel: &CancellationToken, root: &str, rel: &str) -> Result<bool> {
        self.test(cancel, "-d", &join_root(root, rel)?).await
    }

    async fn test(&self, cancel: &CancellationToken, flag: &str, path: &str) -> Result<bool> {
        match self.executor.execute(cancel, "test", &[flag, path]).await {
            Ok(_) => Ok(true),
            Err(ProvisionError::CommandFailed {
                exit_code: Some(1), ..
            }) => Ok(false),
            Err(e) => Err(e.wrap("test", path)),
        }
    }

    /// Long listing of `dir`, without `.` and `..`
    pub async fn list_files(&self, cancel: &CancellationToken, dir: &str) -> Result<Vec<FileEntry>> {
        let output = self
            .executor
            .execute(cancel, "ls", &["-la", "--time-style=+%s", dir])
            .await
            .map_err(|e| e.wrap("list files", dir))?;
        Ok(parse_long_listing(&String::from_utf8_lossy(&output)))
    }
}

/// Names from `add map <name> ...` lines, in order
pub fn parse_partition_maps(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("add map "))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn not_mounted(err: &ProvisionError) -> bool {
    if let ProvisionError::CommandFailed {
        exit_code: Some(1), ..
    } = err
    {
        return true;
    }
    err.command_output().is_some_and(|output| {
        let output = output.to_ascii_lowercase();
        output.contains("not found") || output.contains("not a block device")
    })
}

/// Join a mount root and a relative path, refusing `..`
pub fn join_root(root: &str, rel: &str) -> Result<String> {
    if rel.split('/').any(|part| part == "..") {
        return Err(ProvisionError::config(format!("path escapes mount root: {}", rel)));
    }
    let rel = rel.trim_start_matches('/');
    let root = root.trim_end_matches('/');
    if rel.is_empty() {
        return Ok(if root.is_empty() { "/".to_string() } else { root.to_string() });
    }
    Ok(format!("{}/{}", root, rel))
}

fn listing_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^([-bcdlps][-rwxsStTl]{9}\S*)\s+\d+\s+\S+\s+\S+\s+(\d+)\s+(\d+)\s(.+)$").ok()
        })
        .as_ref()
}

/// Parse `ls -la --time-style=+%s` output
pub fn parse_long_listing(output: &str) -> Vec<FileEntry> {
    let Some(pattern) = listing_pattern() else {
        return Vec::new();
    };
    output
        .lines()
        .filter_map(|line| pattern.captures(line.trim_end()))
        .filter_map(|caps| {
            let mode = caps[1].to_string();
            let size = caps[2].parse().ok()?;
            let modtime = caps[3]
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0));
            let raw_name = &caps[4];

            let (name, symlink_target) = if mode.starts_with('l') {
                match raw_name.split_once(" -> ") {
                    Some((name, target)) => (name.to_string(), Some(target.to_string())),
                    None => (raw_name.to_string(), None),
                }
            } else {
                (raw_name.to_string(), None)
            };
            if name == "." || name == ".." {
                return None;
            }

            Some(FileEntry {
                is_dir: mode.starts_with('d'),
                name,
                size,
                mode,
                modtime,
                symlink_target,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{MockExecutor, MockResponse};
    use crate::error::ErrorKind;

    fn tool(mock: &Arc<MockExecutor>) -> FilesystemTool {
        FilesystemTool::new(mock.clone())
    }

    #[tokio::test]
    async fn test_map_partitions_takes_second_line() {
        let mock = Arc::new(MockExecutor::new());
        mock.respond(
            "kpartx",
            "add map loop0p1 (253:0): 0 524288 linear 7:0 8192\nadd map loop0p2 (253:1): 0 7000000 linear 7:0 532480\n",
        );
        let cancel = CancellationToken::new();
        let root = tool(&mock).map_partitions(&cancel, "/cache/a.img").await.unwrap();
        assert_eq!(root, "/dev/mapper/loop0p2");
        assert_eq!(mock.command_lines(), vec!["kpartx -av /cache/a.img"]);
    }

    #[tokio::test]
    async fn test_map_partitions_needs_two() {
        let mock = Arc::new(MockExecutor::new());
        mock.respond("kpartx", "add map loop0p1 (253:0): 0 524288 linear 7:0 8192\n");
        let cancel = CancellationToken::new();
        let err = tool(&mock).map_partitions(&cancel, "a.img").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn test_format_rejects_unknown_fstype() {
        let mock = Arc::new(MockExecutor::new());
        let cancel = CancellationToken::new();
        let fs = tool(&mock);
        let err = fs.format(&cancel, "/dev/sdb1", "btrfs", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);

        fs.format(&cancel, "/dev/sdb1", "fat32", Some("BOOT")).await.unwrap();
        assert_eq!(mock.last_call().unwrap().command_line(), "mkfs.vfat -F 32 -n BOOT /dev/sdb1");
    }

    #[tokio::test]
    async fn test_resize_skips_fat() {
        let mock = Arc::new(MockExecutor::new());
        mock.respond("blkid", "vfat\n");
        let cancel = CancellationToken::new();
        tool(&mock).resize_filesystem(&cancel, "/dev/mapper/loop0p1").await.unwrap();
        assert!(mock.calls_for("resize2fs").is_empty());
    }

    #[tokio::test]
    async fn test_is_partition_mounted_exit_one() {
        let mock = Arc::new(MockExecutor::new());
        mock.fail("findmnt", 1, "");
        mock.respond("findmnt", "/mnt/root\n");
        let cancel = CancellationToken::new();
        let fs = tool(&mock);
        assert_eq!(fs.is_partition_mounted(&cancel, "/dev/sdb2").await.unwrap(), (false, None));
        assert_eq!(
            fs.is_partition_mounted(&cancel, "/dev/sdb2").await.unwrap(),
            (true, Some("/mnt/root".to_string()))
        );
    }

    #[tokio::test]
    async fn test_is_partition_mounted_not_block_device() {
        let mock = Arc::new(MockExecutor::new());
        mock.push("findmnt", MockResponse::fail(32, "findmnt: /dev/x: not a block device"));
        let cancel = CancellationToken::new();
        assert_eq!(
            tool(&mock).is_partition_mounted(&cancel, "/dev/x").await.unwrap(),
            (false, None)
        );
    }

    #[tokio::test]
    async fn test_write_file_uses_stdin() {
        let mock = Arc::new(MockExecutor::new());
        let cancel = CancellationToken::new();
        tool(&mock)
            .write_file(&cancel, "/mnt/root/", "/etc/hostname", b"node1\n", 0o644)
            .await
            .unwrap();
        let call = mock.last_call().unwrap();
        assert_eq!(call.input.as_deref(), Some(&b"node1\n"[..]));
        assert_eq!(call.args[3..], ["sh", "/mnt/root/etc/hostname", "644"]);
    }

    #[tokio::test]
    async fn test_read_file_decodes() {
        let mock = Arc::new(MockExecutor::new());
        mock.respond("base64", "AAEC\n/w==\n");
        let cancel = CancellationToken::new();
        let data = tool(&mock).read_file(&cancel, "/mnt", "etc/blob").await.unwrap();
        assert_eq!(data, vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_join_root() {
        assert_eq!(join_root("/mnt/root", "etc/hosts").unwrap(), "/mnt/root/etc/hosts");
        assert_eq!(join_root("/mnt/root/", "/etc/hosts").unwrap(), "/mnt/root/etc/hosts");
        assert!(join_root("/mnt/root", "../etc").is_err());
    }

    #[test]
    fn test_parse_long_listing() {
        let output = "total 12\n\
drwxr-xr-x  3 root root 4096 1714557600 .\n\
drwxr-xr-x 20 root root 4096 1714557600 ..\n\
-rw-r--r--  1 root root  220 1714557600 config.txt\n\
lrwxrwxrwx  1 root root   11 1714557600 vmlinuz -> vmlinuz-6.1\n\
drwxr-xr-x  2 root root 4096 1714557600 my overlays\n";
        let entries = parse_long_listing(output);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "config.txt");
        assert_eq!(entries[0].size, 220);
        assert_eq!(entries[1].name, "vmlinuz");
        assert_eq!(entries[1].symlink_target.as_deref(), Some("vmlinuz-6.1"));
        assert!(entries[2].is_dir);
        assert_eq!(entries[2].name, "my overlays");
        assert!(entries[0].modtime.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_write_read_roundtrip() {
        use crate::executor::NativeExecutor;

        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().to_str().unwrap();
        let fs = FilesystemTool::new(Arc::new(NativeExecutor::new()));
        let cancel = CancellationToken::new();
        let payload = vec![0u8, 255, b'\'', b'"', b'\n', b'$'];

        fs.write_file(&cancel, root, "etc/ssh/blob", &payload, 0o600).await.unwrap();
        assert_eq!(fs.read_file(&cancel, root, "etc/ssh/blob").await.unwrap(), payload);
        assert!(fs.exists(&cancel, root, "etc/ssh/blob").await.unwrap());
        assert!(fs.is_dir(&cancel, root, "etc/ssh").await.unwrap());
        assert!(!fs.exists(&cancel, root, "etc/missing").await.unwrap());

        let names: Vec<String> = std::fs::read_dir(temp.path().join("etc/ssh"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["blob"]);
    }
}
