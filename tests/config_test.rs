// file: tests/config_test.rs
// version: 1.0.0
// guid: 9c3a7e5d-2b1f-4d86-a0e4-5f8b3c1d7a92

//! Loading provisioner configuration files

use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use turingpi_provisioner::{
    config::{loader::ConfigLoader, HostKeyPolicy, MAX_NODES},
    executor::ExecutionMode,
    ErrorKind, Result,
};

const FULL_CONFIG: &str = r#"
cache_dir: /srv/turingpi/cache
index_refresh_secs: 60
bmc:
  host: 192.168.1.90
  user: root
  password: ${TPI_TEST_BMC_PASSWORD}
  host_key_policy: accept_new
remote_cache:
  host: 192.168.1.90
  user: root
  password: ${TPI_TEST_BMC_PASSWORD}
  remote_path: /mnt/sdcard/images
nodes:
  1:
    host: 192.168.1.101
    user: ubuntu
    key_file: /home/ops/.ssh/id_ed25519
  3:
    host: 192.168.1.103
    port: 2222
    user: ubuntu
    password: ubuntu
    command_timeout_secs: 30
executor:
  mode: container
  image: ghcr.io/example/image-tools:latest
  persistent: false
  extra_mounts:
    /srv/overlays: /overlays
"#;

fn loader() -> ConfigLoader {
    let mut loader = ConfigLoader::new();
    loader.set_env_var("TPI_TEST_BMC_PASSWORD".to_string(), "turing".to_string());
    loader
}

#[test]
fn test_full_config() -> Result<()> {
    let config = loader().load_from_str(FULL_CONFIG)?;

    assert_eq!(config.cache_dir, PathBuf::from("/srv/turingpi/cache"));
    assert_eq!(config.index_refresh_secs, 60);

    let bmc = config.bmc.as_ref().expect("bmc configured");
    assert_eq!(bmc.password.as_deref(), Some("turing"));
    assert_eq!(bmc.host_key_policy, HostKeyPolicy::AcceptNew);
    assert_eq!(bmc.address(), "192.168.1.90:22");

    let remote = config.remote_cache.as_ref().expect("remote cache configured");
    assert_eq!(remote.remote_path, "/mnt/sdcard/images");
    assert_eq!(remote.endpoint.host_key_policy, HostKeyPolicy::Strict);

    assert_eq!(config.nodes.len(), 2);
    assert_eq!(config.nodes[&1].command_timeout_secs, 300);
    assert_eq!(config.nodes[&3].endpoint.port, 2222);
    assert_eq!(config.nodes[&3].command_timeout_secs, 30);

    assert_eq!(config.executor.mode, ExecutionMode::Container);
    assert!(!config.executor.persistent);
    assert_eq!(config.executor.extra_mounts["/srv/overlays"], "/overlays");
    Ok(())
}

#[test]
fn test_minimal_config_uses_defaults() -> Result<()> {
    let config = ConfigLoader::new().load_from_str("cache_dir: /var/cache/tpi\n")?;
    assert!(config.bmc.is_none());
    assert!(config.remote_cache.is_none());
    assert!(config.nodes.is_empty());
    assert_eq!(config.executor.mode, ExecutionMode::Auto);
    assert_eq!(config.index_refresh_secs, 300);
    Ok(())
}

#[test]
fn test_load_from_file_expands_home() -> Result<()> {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        "cache_dir: /var/cache/tpi\nbmc:\n  host: bmc.local\n  user: root\n  key_file: ~/.ssh/bmc\n"
    )
    .unwrap();

    let config = ConfigLoader::new().load(file.path())?;
    let key = config.bmc.unwrap().key_file.unwrap();
    assert!(!key.to_string_lossy().starts_with('~'), "{}", key.display());
    assert!(key.ends_with(".ssh/bmc"));
    Ok(())
}

#[test]
fn test_invalid_configs_rejected() {
    let cases = [
        ("relative cache dir", "cache_dir: cache\n"),
        (
            "node slot out of range",
            "cache_dir: /c\nnodes:\n  5:\n    host: h\n    user: u\n    password: p\n",
        ),
        (
            "endpoint without credentials",
            "cache_dir: /c\nbmc:\n  host: bmc.local\n  user: root\n",
        ),
        (
            "relative remote path",
            "cache_dir: /c\nremote_cache:\n  host: h\n  user: u\n  password: p\n  remote_path: images\n",
        ),
        ("zero refresh interval", "cache_dir: /c\nindex_refresh_secs: 0\n"),
        ("unknown executor mode", "cache_dir: /c\nexecutor:\n  mode: vm\n"),
    ];

    for (name, yaml) in cases {
        let err = ConfigLoader::new()
            .load_from_str(yaml)
            .expect_err(name);
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid, "{}: {}", name, err);
    }
    assert_eq!(MAX_NODES, 4);
}

#[test]
fn test_missing_environment_variable() {
    let err = ConfigLoader::new()
        .load_from_str("cache_dir: /c\nbmc:\n  host: h\n  user: root\n  password: ${TPI_TEST_SURELY_UNSET}\n")
        .unwrap_err();
    assert!(err.to_string().contains("TPI_TEST_SURELY_UNSET"));
}

#[test]
fn test_missing_file() {
    let err = ConfigLoader::new()
        .load("/nonexistent/turingpi/config.yaml")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
}
