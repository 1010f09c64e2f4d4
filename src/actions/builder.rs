// file: src/actions/builder.rs
// version: 1.0.0
// guid: 1c6e8a4f-9b3d-4f27-85e1-d0a7c2b9f463

//! Workflow factory for deploying Ubuntu to one node

use super::customize::{ApplyOverlayAction, ConfigureNetworkAction, SetPasswordAction};
use super::image::{
    CheckBaseImageAction, CompressImageAction, DecompressImageAction, FetchBaseImageAction, MountImageAction,
    UnmountImageAction, UploadToRemoteCacheAction,
};
use super::node::{FlashNodeAction, MonitorUartAction, RunNodeCommandsAction, WaitForSshAction};
use crate::config::MAX_NODES;
use crate::error::{ProvisionError, Result};
use crate::tools::{NetworkConfig, ToolProvider};
use crate::workflow::{keys, Action, Stage, Workflow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_OS_VERSION: &str = "22.04";
pub const DEFAULT_BOOT_PATTERN: &str = "login:";
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(900);
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(600);

/// Named insertion points of the deploy workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeployHook {
    /// After the base image is in the local cache
    AfterFetch,
    /// After the image root is mounted
    AfterMount,
    /// After customization, while the root is still mounted
    BeforeUnmount,
    /// After the node was flashed and powered on
    AfterFlash,
    /// After the post-install commands
    AfterPostInstall,
}

/// Builds `prepare`, `customize`, `stage`, `flash` and `post-install` stages
pub struct UbuntuDeployBuilder {
    node: u8,
    source: String,
    network: NetworkConfig,
    os_version: String,
    expected_sha256: Option<String>,
    password: Option<(String, String)>,
    overlays: Vec<String>,
    skip_flash: bool,
    boot_pattern: Option<String>,
    boot_timeout: Duration,
    ssh_timeout: Duration,
    post_install: Vec<String>,
    hooks: HashMap<DeployHook, Vec<Action>>,
}

impl UbuntuDeployBuilder {
    /// `source` is a URL or a host path of the vendor image
    pub fn new(node: u8, source: impl Into<String>, network: NetworkConfig) -> Self {
        Self {
            node,
            source: source.into(),
            network,
            os_version: DEFAULT_OS_VERSION.to_string(),
            expected_sha256: None,
            password: None,
            overlays: Vec::new(),
            skip_flash: false,
            boot_pattern: Some(DEFAULT_BOOT_PATTERN.to_string()),
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            ssh_timeout: DEFAULT_SSH_TIMEOUT,
            post_install: Vec::new(),
            hooks: HashMap::new(),
        }
    }

    pub fn os_version(mut self, version: impl Into<String>) -> Self {
        self.os_version = version.into();
        self
    }

    pub fn expected_sha256(mut self, hash: impl Into<String>) -> Self {
        self.expected_sha256 = Some(hash.into());
        self
    }

    pub fn password(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.password = Some((user.into(), password.into()));
        self
    }

    pub fn overlay(mut self, dtbo: impl Into<String>) -> Self {
        self.overlays.push(dtbo.into());
        self
    }

    /// Stop after the customized image is in the local cache
    pub fn skip_flash(mut self, skip: bool) -> Self {
        self.skip_flash = skip;
        self
    }

    /// Console pattern awaited after flashing; `None` skips console monitoring
    pub fn boot_pattern(mut self, pattern: Option<String>, timeout: Duration) -> Self {
        self.boot_pattern = pattern;
        self.boot_timeout = timeout;
        self
    }

    pub fn ssh_timeout(mut self, timeout: Duration) -> Self {
        self.ssh_timeout = timeout;
        self
    }

    pub fn post_install_command(mut self, command: impl Into<String>) -> Self {
        self.post_install.push(command.into());
        self
    }

    /// Insert `action` at `point`; actions at one point run in insertion order
    pub fn hook(mut self, point: DeployHook, action: Action) -> Self {
        self.hooks.entry(point).or_default().push(action);
        self
    }

    /// Local cache key of the customized image
    pub fn artifact_key(&self) -> String {
        format!(
            "artifacts/ubuntu-{}/node{}-{}.img.xz",
            self.os_version, self.node, self.network.hostname
        )
    }

    fn take_hooks(&mut self, point: DeployHook) -> Vec<Action> {
        self.hooks.remove(&point).unwrap_or_default()
    }

    pub fn build(mut self, tools: Arc<ToolProvider>) -> Result<Workflow> {
        if self.node == 0 || self.node > MAX_NODES {
            return Err(ProvisionError::config(format!(
                "node {} is outside 1..={}",
                self.node, MAX_NODES
            )));
        }
        if self.source.trim().is_empty() {
            return Err(ProvisionError::config("image source cannot be empty"));
        }
        self.network.validate()?;

        let node = self.node;
        let hostname = self.network.hostname.clone();
        let artifact_key = self.artifact_key();

        let mut fetch = FetchBaseImageAction::new("ubuntu", &self.os_version);
        if let Some(hash) = &self.expected_sha256 {
            fetch = fetch.expected_sha256(hash);
        }
        let prepare = Stage::new("prepare")
            .description("Get the base image into the local cache and decompress it")
            .with_value(keys::IMAGE_SOURCE, self.source.clone())
            .with_value(keys::WORKFLOW_CURRENT_NODE, node)
            .with_value(keys::WORKFLOW_TARGET_NODES, vec![node])
            .action(Action::regular(CheckBaseImageAction::new()))
            .action(Action::regular(fetch))
            .actions(self.take_hooks(DeployHook::AfterFetch))
            .action(Action::platform_aware(
                DecompressImageAction::new().output_name(format!("node{}-{}.img", node, hostname)),
            ));

        let mut customize = Stage::new("customize")
            .description("Write node identity into the image")
            .action(Action::platform_aware(MountImageAction::new()))
            .actions(self.take_hooks(DeployHook::AfterMount))
            .action(Action::platform_aware(ConfigureNetworkAction::new(self.network.clone())));
        if let Some((user, password)) = &self.password {
            customize.add_action(Action::platform_aware(SetPasswordAction::new(user, password)));
        }
        for overlay in &self.overlays {
            customize.add_action(Action::platform_aware(ApplyOverlayAction::new(overlay)));
        }
        let customize = customize
            .actions(self.take_hooks(DeployHook::BeforeUnmount))
            .action(Action::platform_aware(UnmountImageAction::new()))
            .action(Action::platform_aware(
                CompressImageAction::new(&artifact_key)
                    .os("ubuntu", &self.os_version)
                    .tag("os", "ubuntu")
                    .tag("version", &self.os_version)
                    .tag("node", node.to_string())
                    .tag("hostname", &hostname),
            ));

        let mut workflow = Workflow::new(format!("ubuntu-deploy-node{}", node))
            .description(format!("Deploy Ubuntu {} to node {} as {}", self.os_version, node, hostname))
            .with_tools(tools)
            .stage(prepare)
            .stage(customize);

        if self.skip_flash {
            for point in [DeployHook::AfterFlash, DeployHook::AfterPostInstall] {
                if !self.take_hooks(point).is_empty() {
                    warn!("Flashing skipped; {:?} hook actions will not run", point);
                }
            }
            return Ok(workflow);
        }

        workflow.add_stage(
            Stage::new("stage")
                .description("Copy the image to the cache the BMC reads")
                .action(Action::regular(UploadToRemoteCacheAction::new())),
        );

        let mut flash = Stage::new("flash")
            .description("Flash through the BMC and wait for boot")
            .action(Action::regular(FlashNodeAction::new(node)));
        if let Some(pattern) = &self.boot_pattern {
            flash.add_action(Action::regular(MonitorUartAction::new(node, pattern, self.boot_timeout)));
        }
        workflow.add_stage(flash.actions(self.take_hooks(DeployHook::AfterFlash)));

        let mut post_install = Stage::new("post-install")
            .description("Finish setup over SSH")
            .action(Action::regular(WaitForSshAction::new(node, self.ssh_timeout)));
        if !self.post_install.is_empty() {
            post_install.add_action(Action::regular(RunNodeCommandsAction::new(
                node,
                std::mem::take(&mut self.post_install),
            )));
        }
        workflow.add_stage(post_install.actions(self.take_hooks(DeployHook::AfterPostInstall)));

        Ok(workflow)
    }
}
