// file: tests/cli_test.rs
// version: 1.0.0
// guid: 5f2b8d4e-7a3c-4e19-b6d1-0c9a4e7f2b53

//! End-to-end checks of the command line binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn provisioner() -> Command {
    let mut cmd = Command::cargo_bin("turingpi-provisioner").unwrap();
    cmd.env_remove("TURINGPI_CONFIG").env("RUST_LOG", "error");
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let cache = dir.join("cache");
    let path = dir.join("config.yaml");
    std::fs::write(&path, format!("cache_dir: {}\n", cache.display())).unwrap();
    path
}

#[test]
fn test_help_lists_subcommands() {
    provisioner()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("platform"))
        .stdout(predicate::str::contains("cache"))
        .stdout(predicate::str::contains("deploy"));
}

#[test]
fn test_platform_reports_probe() {
    provisioner()
        .arg("platform")
        .assert()
        .success()
        .stdout(predicate::str::contains("Linux host:"))
        .stdout(predicate::str::contains("Container engine:"));
}

#[test]
fn test_cache_list_json_on_empty_cache() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    provisioner()
        .args(["--config", config.to_str().unwrap(), "cache", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));
    assert!(dir.path().join("cache").is_dir());
}

#[test]
fn test_cache_list_filters_by_tag() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let cache = dir.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    for (key, os) in [("ubuntu-rk1", "ubuntu"), ("debian-rk1", "debian")] {
        std::fs::write(
            cache.join(format!("{}.meta", key)),
            format!(r#"{{"filename":"{}.img","size":1,"tags":{{"os":"{}"}}}}"#, key, os),
        )
        .unwrap();
        std::fs::write(cache.join(format!("{}.data", key)), b"x").unwrap();
    }

    provisioner()
        .args([
            "--config",
            config.to_str().unwrap(),
            "cache",
            "list",
            "--tag",
            "os=ubuntu",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("ubuntu-rk1"))
        .stdout(predicate::str::contains("debian-rk1").not());
}

#[test]
fn test_cache_verify_fails_on_orphan() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let cache = dir.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(cache.join("stray.data"), b"x").unwrap();

    provisioner()
        .args(["--config", config.to_str().unwrap(), "cache", "verify"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("stray: orphan data"));

    provisioner()
        .args(["--config", config.to_str().unwrap(), "cache", "cleanup"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 orphaned files"));
    assert!(!cache.join("stray.data").exists());
}

#[test]
fn test_remote_cache_requires_configuration() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    provisioner()
        .args(["--config", config.to_str().unwrap(), "cache", "--remote", "verify"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("remote_cache"));
}

#[test]
fn test_deploy_rejects_bad_tag_and_missing_args() {
    provisioner()
        .args(["cache", "list", "--tag", "novalue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));

    provisioner()
        .args(["deploy", "--node", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--image"));
}
