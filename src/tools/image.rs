// file: src/tools/image.rs
// version: 1.1.0
// guid: 6a1f9d3c-2e84-4b70-8c5a-d7e0b2f4a196

//! Whole-image operations: validation, cloning, growing, boot files, overlays

use super::filesystem::{join_root, FilesystemTool};
use crate::error::{ProvisionError, Result};
use crate::executor::CommandExecutor;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BOOT_CONFIG: &str = "config.txt";
const OVERLAY_DIRS: [&str; 2] = ["overlays", "dtbs/overlays"];

/// growpart status when the partition cannot grow
const GROWPART_NOCHANGE: i64 = 1;

/// Image operations on top of the filesystem tool
#[derive(Clone)]
pub struct ImageTool {
    executor: Arc<dyn CommandExecutor>,
    fs: FilesystemTool,
}

impl ImageTool {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            fs: FilesystemTool::new(Arc::clone(&executor)),
            executor,
        }
    }

    /// The image exists and carries a readable partition table
    pub async fn validate_image(&self, cancel: &CancellationToken, path: &str) -> Result<()> {
        match self.executor.execute(cancel, "test", &["-f", path]).await {
            Ok(_) => {}
            Err(ProvisionError::CommandFailed {
                exit_code: Some(1), ..
            }) => {
                return Err(ProvisionError::precondition(format!("image {} does not exist", path)));
            }
            Err(e) => return Err(e.wrap("check image", path)),
        }
        self.executor
            .execute(cancel, "parted", &["-s", path, "print"])
            .await
            .map_err(|e| e.wrap("read partition table", path))?;
        debug!("Image {} has a readable partition table", path);
        Ok(())
    }

    /// Block-copy an image onto a device and flush
    pub async fn copy_to_device(&self, cancel: &CancellationToken, image: &str, device: &str) -> Result<()> {
        info!("Writing {} to {}", image, device);
        let input = format!("if={}", image);
        let output = format!("of={}", device);
        self.executor
            .execute(
                cancel,
                "dd",
                &[&input, &output, "bs=4M", "conv=fsync", "status=progress"],
            )
            .await
            .map_err(|e| e.wrap("copy image", device))?;
        self.executor
            .execute(cancel, "sync", &[])
            .await
            .map_err(|e| e.wrap("sync", device))?;
        Ok(())
    }

    /// Grow the last partition to fill the device, then its filesystem
    ///
    /// growpart exits 1 (`NOCHANGE`) when the partition already fills the
    /// device; in that case a failing filesystem resize is only logged.
    pub async fn resize_last_partition(&self, cancel: &CancellationToken, device: &str) -> Result<()> {
        let table = self
            .executor
            .execute(cancel, "parted", &["-s", "-m", device, "unit", "s", "print"])
            .await
            .map_err(|e| e.wrap("read partition table", device))?;
        let number = last_partition_number(&String::from_utf8_lossy(&table))
            .ok_or_else(|| ProvisionError::precondition(format!("no partitions on {}", device)))?;
        let number_arg = number.to_string();

        let unchanged = match self
            .executor
            .execute(cancel, "growpart", &[device, &number_arg])
            .await
        {
            Ok(_) => false,
            Err(e) if e.exit_code() == Some(GROWPART_NOCHANGE) => {
                info!("Partition {} on {} already fills the device", number, device);
                true
            }
            Err(e) => return Err(e.wrap("grow partition", device)),
        };

        let partition = partition_device(device, number);
        match self.fs.resize_filesystem(cancel, &partition).await {
            Ok(()) => Ok(()),
            Err(e) if unchanged => {
                warn!("Filesystem resize on {} skipped: {}", partition, e);
                Ok(())
            }
            Err(e) => Err(e.wrap("resize last partition", device)),
        }
    }

    /// Copy the newest kernel and initrd from a boot mount into `out_dir`
    pub async fn extract_boot_files(
        &self,
        cancel: &CancellationToken,
        boot_mount: &str,
        out_dir: &str,
    ) -> Result<(String, String)> {
        let entries = self.fs.list_files(cancel, boot_mount).await?;
        let names: Vec<&str> = entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.name.as_str())
            .collect();

        let kernel = newest_match(&names, &["vmlinuz", "kernel"]).ok_or_else(|| {
            ProvisionError::precondition(format!("no kernel image in {}", boot_mount))
        })?;
        let initrd = newest_match(&names, &["initrd", "initramfs"]).ok_or_else(|| {
            ProvisionError::precondition(format!("no initrd in {}", boot_mount))
        })?;

        self.executor
            .execute(cancel, "mkdir", &["-p", out_dir])
            .await
            .map_err(|e| e.wrap("create directory", out_dir))?;

        let mut copied = Vec::with_capacity(2);
        for name in [kernel, initrd] {
            let src = join_root(boot_mount, name)?;
            let dst = join_root(out_dir, name)?;
            self.executor
                .execute(cancel, "cp", &["-fL", &src, &dst])
                .await
                .map_err(|e| e.wrap("copy boot file", &src))?;
            copied.push(dst);
        }
        let initrd_path = copied.pop().unwrap_or_default();
        let kernel_path = copied.pop().unwrap_or_default();
        info!("Extracted {} and {} from {}", kernel, initrd, boot_mount);
        Ok((kernel_path, initrd_path))
    }

    /// Install a `.dtbo` overlay and enable it in `config.txt` when present
    pub async fn apply_dtb_overlay(
        &self,
        cancel: &CancellationToken,
        boot_mount: &str,
        overlay_file: &str,
    ) -> Result<()> {
        let mut overlay_dir = None;
        for dir in OVERLAY_DIRS {
            if self.fs.is_dir(cancel, boot_mount, dir).await? {
                overlay_dir = Some(dir);
                break;
            }
        }
        let overlay_dir = overlay_dir.ok_or_else(|| {
            ProvisionError::precondition(format!("no overlays directory under {}", boot_mount))
        })?;

        let file_name = Path::new(overlay_file)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ProvisionError::config(format!("invalid overlay path: {}", overlay_file)))?;
        self.fs
            .copy_file(cancel, boot_mount, overlay_file, &format!("{}/{}", overlay_dir, file_name))
            .await?;

        if !self.fs.exists(cancel, boot_mount, BOOT_CONFIG).await? {
            debug!("No {} under {}; overlay copied only", BOOT_CONFIG, boot_mount);
            return Ok(());
        }

        let name = file_name.strip_suffix(".dtbo").unwrap_or(&file_name);
        let current = String::from_utf8_lossy(&self.fs.read_file(cancel, boot_mount, BOOT_CONFIG).await?)
            .to_string();
        if let Some(updated) = enable_overlay(&current, name) {
            self.fs
                .write_file(cancel, boot_mount, BOOT_CONFIG, updated.as_bytes(), 0o644)
                .await?;
            info!("Enabled overlay {} in {}", name, BOOT_CONFIG);
        }
        Ok(())
    }

    /// Set `key=value` in `config.txt`, replacing an existing assignment
    pub async fn set_boot_config(
        &self,
        cancel: &CancellationToken,
        boot_mount: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let current = match self.fs.read_file(cancel, boot_mount, BOOT_CONFIG).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Err(e) if e.is_not_found() => String::new(),
            Err(e) => return Err(e),
        };
        let updated = set_config_value(&current, key, value);
        self.fs
            .write_file(cancel, boot_mount, BOOT_CONFIG, updated.as_bytes(), 0o644)
            .await
    }
}

/// Highest partition number from `parted -m` output
pub fn last_partition_number(output: &str) -> Option<u32> {
    output
        .lines()
        .filter_map(|line| line.split(':').next()?.trim().parse::<u32>().ok())
        .max()
}

/// Partition device path: `p<N>` for loop, nvme and mmcblk devices
pub fn partition_device(device: &str, number: u32) -> String {
    let base = device.rsplit('/').next().unwrap_or(device);
    if ["loop", "nvme", "mmcblk"].iter().any(|p| base.starts_with(p)) {
        format!("{}p{}", device, number)
    } else {
        format!("{}{}", device, number)
    }
}

/// Lexicographically greatest name starting with any prefix
fn newest_match<'a>(names: &[&'a str], prefixes: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .copied()
        .filter(|name| prefixes.iter().any(|p| name.starts_with(p)))
        .max()
}

/// Append `dtoverlay=<name>` unless already present
fn enable_overlay(config: &str, name: &str) -> Option<String> {
    let line = format!("dtoverlay={}", name);
    if config.lines().any(|l| l.trim() == line) {
        return None;
    }
    let mut updated = config.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&line);
    updated.push('\n');
    Some(updated)
}

fn set_config_value(config: &str, key: &str, value: &str) -> String {
    let prefix = format!("{}=", key);
    let mut replaced = false;
    let mut lines: Vec<String> = config
        .lines()
        .map(|line| {
            if line.trim_start().starts_with(&prefix) && !replaced {
                replaced = true;
                format!("{}{}", prefix, value)
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(format!("{}{}", prefix, value));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::executor::mock::{MockExecutor, MockResponse};

    const PARTED: &str = "BYT;\n\
/dev/loop0:62521344s:loopback:512:512:msdos:Loopback device:;\n\
1:8192s:532479s:524288s:fat32::boot, lba;\n\
2:532480s:7167999s:6635520s:ext4::;\n";

    #[test]
    fn test_partition_device_naming() {
        assert_eq!(partition_device("/dev/loop0", 2), "/dev/loop0p2");
        assert_eq!(partition_device("/dev/nvme0n1", 3), "/dev/nvme0n1p3");
        assert_eq!(partition_device("/dev/mmcblk0", 1), "/dev/mmcblk0p1");
        assert_eq!(partition_device("/dev/sda", 2), "/dev/sda2");
    }

    #[test]
    fn test_last_partition_number() {
        assert_eq!(last_partition_number(PARTED), Some(2));
        assert_eq!(last_partition_number("BYT;\n/dev/sda:100s:scsi:512:512:gpt::;\n"), None);
    }

    #[tokio::test]
    async fn test_resize_with_nochange_succeeds() {
        let mock = Arc::new(MockExecutor::new());
        mock.respond("parted", PARTED)
            .fail("growpart", 1, "NOCHANGE: partition 2 is size 6635520. it cannot be grown")
            .fail("blkid", 2, "");
        let tool = ImageTool::new(mock.clone());
        let cancel = CancellationToken::new();

        tool.resize_last_partition(&cancel, "/dev/loop0").await.unwrap();
        assert_eq!(
            mock.calls_for("blkid")[0].args.last().map(String::as_str),
            Some("/dev/loop0p2")
        );
    }

    #[tokio::test]
    async fn test_resize_nochange_after_noisy_output() {
        let noise = "sfdisk: warning: partition table re-read failed\n".repeat(64);
        let mock = Arc::new(MockExecutor::new());
        mock.respond("parted", PARTED)
            .fail("growpart", 1, format!("{}NOCHANGE: partition 2 could only be grown by 0", noise))
            .respond("blkid", "ext4\n")
            .fail("resize2fs", 1, "resize2fs: Device or resource busy");
        let tool = ImageTool::new(mock.clone());
        let cancel = CancellationToken::new();

        tool.resize_last_partition(&cancel, "/dev/mmcblk0").await.unwrap();
        assert!(mock
            .command_lines()
            .contains(&"resize2fs /dev/mmcblk0p2".to_string()));
    }

    #[tokio::test]
    async fn test_resize_grows_ext4() {
        let mock = Arc::new(MockExecutor::new());
        mock.respond("parted", PARTED).respond("blkid", "ext4\n");
        let tool = ImageTool::new(mock.clone());
        let cancel = CancellationToken::new();

        tool.resize_last_partition(&cancel, "/dev/sdb").await.unwrap();
        let lines = mock.command_lines();
        assert!(lines.contains(&"growpart /dev/sdb 2".to_string()));
        assert!(lines.contains(&"resize2fs /dev/sdb2".to_string()));
    }

    #[tokio::test]
    async fn test_resize_real_failure_propagates() {
        let mock = Arc::new(MockExecutor::new());
        mock.respond("parted", PARTED).fail("growpart", 2, "FAILED: sfdisk");
        let tool = ImageTool::new(mock.clone());
        let cancel = CancellationToken::new();
        let err = tool.resize_last_partition(&cancel, "/dev/sdb").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailed);
    }

    #[tokio::test]
    async fn test_extract_boot_files_picks_newest() {
        let mock = Arc::new(MockExecutor::new());
        mock.respond(
            "ls",
            "total 4\n\
-rw-r--r-- 1 root root 100 1714557600 vmlinuz-5.10.0\n\
-rw-r--r-- 1 root root 100 1714557600 vmlinuz-6.1.0\n\
-rw-r--r-- 1 root root 100 1714557600 initrd.img-6.1.0\n\
-rw-r--r-- 1 root root 100 1714557600 config.txt\n",
        );
        let tool = ImageTool::new(mock.clone());
        let cancel = CancellationToken::new();
        let (kernel, initrd) = tool.extract_boot_files(&cancel, "/mnt/boot", "/out").await.unwrap();
        assert_eq!(kernel, "/out/vmlinuz-6.1.0");
        assert_eq!(initrd, "/out/initrd.img-6.1.0");
    }

    #[tokio::test]
    async fn test_extract_boot_files_missing_initrd() {
        let mock = Arc::new(MockExecutor::new());
        mock.respond("ls", "-rw-r--r-- 1 root root 100 1714557600 vmlinuz\n");
        let tool = ImageTool::new(mock.clone());
        let cancel = CancellationToken::new();
        let err = tool.extract_boot_files(&cancel, "/mnt/boot", "/out").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn test_overlay_requires_directory() {
        let mock = Arc::new(MockExecutor::new());
        mock.default_response("test", MockResponse::fail(1, ""));
        let tool = ImageTool::new(mock.clone());
        let cancel = CancellationToken::new();
        let err = tool
            .apply_dtb_overlay(&cancel, "/mnt/boot", "/tmp/uart3.dtbo")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[test]
    fn test_enable_overlay_idempotent() {
        let updated = enable_overlay("arm_64bit=1", "uart3").unwrap();
        assert_eq!(updated, "arm_64bit=1\ndtoverlay=uart3\n");
        assert!(enable_overlay(&updated, "uart3").is_none());
    }

    #[test]
    fn test_set_config_value() {
        assert_eq!(set_config_value("a=1\nb=2\n", "b", "3"), "a=1\nb=3\n");
        assert_eq!(set_config_value("a=1\n", "c", "x"), "a=1\nc=x\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_overlay_native() {
        use crate::executor::NativeExecutor;

        let temp = tempfile::TempDir::new().unwrap();
        let boot = temp.path().join("boot");
        std::fs::create_dir_all(boot.join("dtbs/overlays")).unwrap();
        std::fs::write(boot.join("config.txt"), "arm_64bit=1\n").unwrap();
        let overlay = temp.path().join("uart3.dtbo");
        std::fs::write(&overlay, b"\xd0\x0d\xfe\xed").unwrap();

        let tool = ImageTool::new(Arc::new(NativeExecutor::new()));
        let cancel = CancellationToken::new();
        let boot_str = boot.to_str().unwrap();
        tool.apply_dtb_overlay(&cancel, boot_str, overlay.to_str().unwrap())
            .await
            .unwrap();
        tool.apply_dtb_overlay(&cancel, boot_str, overlay.to_str().unwrap())
            .await
            .unwrap();

        assert!(boot.join("dtbs/overlays/uart3.dtbo").exists());
        assert_eq!(
            std::fs::read_to_string(boot.join("config.txt")).unwrap(),
            "arm_64bit=1\ndtoverlay=uart3\n"
        );
    }
}
