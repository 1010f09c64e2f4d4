// file: tests/network_test.rs
// version: 1.0.0
// guid: 7e1c4a9b-3f6d-4b28-9a5e-0d8c2f7b1e63

//! Network file rendering into a mounted root, run with the native executor

use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use turingpi_provisioner::{
    executor::{mock::MockExecutor, NativeExecutor},
    tools::{cidr_to_netmask, FilesystemTool, ImageTool, NetworkConfig, NetworkFormat, NetworkTool},
    Result,
};

fn node3() -> NetworkConfig {
    NetworkConfig::new(
        "host-3",
        "192.168.1.3/24",
        "192.168.1.1",
        vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
    )
}

fn native_network() -> NetworkTool {
    NetworkTool::new(FilesystemTool::new(Arc::new(NativeExecutor::new())))
}

#[test]
fn test_cidr_to_netmask() {
    assert_eq!(cidr_to_netmask(24), "255.255.255.0");
    assert_eq!(cidr_to_netmask(8), "255.0.0.0");
    assert_eq!(cidr_to_netmask(32), "255.255.255.255");
    assert_eq!(cidr_to_netmask(0), "0.0.0.0");
    assert_eq!(cidr_to_netmask(33), "255.255.255.0");
}

#[tokio::test]
async fn test_legacy_interfaces_render() -> Result<()> {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_string_lossy().to_string();

    let format = native_network()
        .configure(&CancellationToken::new(), &root_str, &node3())
        .await?;
    assert_eq!(format, NetworkFormat::Interfaces);

    let interfaces = std::fs::read_to_string(root.path().join("etc/network/interfaces"))?;
    let lines: Vec<&str> = interfaces.lines().map(str::trim).collect();
    for expected in [
        "address 192.168.1.3",
        "netmask 255.255.255.0",
        "gateway 192.168.1.1",
        "dns-nameservers 8.8.8.8 1.1.1.1",
    ] {
        assert!(lines.contains(&expected), "missing {:?} in\n{}", expected, interfaces);
    }

    assert_eq!(std::fs::read_to_string(root.path().join("etc/hostname"))?, "host-3\n");
    assert_eq!(
        std::fs::read_to_string(root.path().join("etc/hosts"))?,
        "127.0.0.1\tlocalhost\n127.0.1.1\thost-3\n\n"
    );
    assert!(!root.path().join("etc/netplan").exists());
    Ok(())
}

#[tokio::test]
async fn test_netplan_render() -> Result<()> {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("etc/netplan"))?;
    let root_str = root.path().to_string_lossy().to_string();

    let format = native_network()
        .configure(&CancellationToken::new(), &root_str, &node3())
        .await?;
    assert_eq!(format, NetworkFormat::Netplan);

    let netplan = std::fs::read_to_string(root.path().join("etc/netplan/01-netcfg.yaml"))?;
    assert!(netplan.contains("addresses: [192.168.1.3/24]"), "{}", netplan);
    assert!(netplan.contains("gateway4: 192.168.1.1"), "{}", netplan);
    assert!(netplan.contains("addresses: [8.8.8.8, 1.1.1.1]"), "{}", netplan);
    assert!(!root.path().join("etc/network/interfaces").exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(root.path().join("etc/netplan/01-netcfg.yaml"))?
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
    Ok(())
}

#[tokio::test]
async fn test_invalid_address_rejected_before_writing() {
    let root = TempDir::new().unwrap();
    let root_str = root.path().to_string_lossy().to_string();
    let config = NetworkConfig::new("host-3", "not-an-ip/24", "192.168.1.1", vec![]);

    let err = native_network()
        .configure(&CancellationToken::new(), &root_str, &config)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), turingpi_provisioner::ErrorKind::ConfigurationInvalid);
    assert!(!root.path().join("etc/hostname").exists());
}

#[tokio::test]
async fn test_resize_with_nochange_succeeds() -> Result<()> {
    let mock = Arc::new(MockExecutor::new());
    mock.respond(
        "parted",
        "BYT;\n/dev/loop0:3000000s:loopback:512:512:msdos:Loopback device:;\n1:2048s:206847s:204800s:fat32::lba;\n2:206848s:2999999s:2793152s:ext4::;\n",
    );
    mock.fail("growpart", 1, "NOCHANGE: partition 2 is size 2793152. it cannot be grown");
    mock.respond("blkid", "ext4\n");
    mock.fail("resize2fs", 1, "resize2fs: Device or resource busy");

    let image = ImageTool::new(mock.clone());
    image
        .resize_last_partition(&CancellationToken::new(), "/dev/loop0")
        .await?;

    let lines = mock.command_lines();
    assert!(lines.iter().any(|l| l == "growpart /dev/loop0 2"), "{:?}", lines);
    assert!(lines.iter().any(|l| l == "resize2fs /dev/loop0p2"), "{:?}", lines);
    Ok(())
}

#[tokio::test]
async fn test_resize_failure_without_nochange_propagates() {
    let mock = Arc::new(MockExecutor::new());
    mock.respond("parted", "BYT;\n/dev/sda:100s:scsi:512:512:gpt:Disk:;\n1:34s:99s:66s:ext4::;\n");
    mock.fail("growpart", 2, "FAILED: disk is busy");

    let err = ImageTool::new(mock.clone())
        .resize_last_partition(&CancellationToken::new(), "/dev/sda")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("/dev/sda"), "{}", err);
    assert!(mock.command_lines().iter().all(|l| !l.starts_with("resize2fs")));
}
