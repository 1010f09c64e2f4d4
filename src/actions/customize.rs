// file: src/actions/customize.rs
// version: 1.0.0
// guid: 47c1e9b3-8a2f-4d65-a0e7-3b9f6d2c8e14

//! Edits applied to the mounted root filesystem

use super::{current_node, mounted_root, require_container_paths};
use crate::error::{ProvisionError, Result};
use crate::tools::filesystem::join_root;
use crate::tools::{NetworkConfig, ToolProvider};
use crate::workflow::keys::{self, NodeAttr};
use crate::workflow::{ActionContext, PlatformActionHandler};
use std::sync::Arc;
use tracing::info;

/// Shortest password [`SetPasswordAction`] accepts
pub const MIN_PASSWORD_LEN: usize = 8;

const SHADOW: &str = "etc/shadow";
const SHADOW_MODE: u32 = 0o640;

/// Write hostname, hosts and static addressing into the mounted root
#[derive(Debug, Clone)]
pub struct ConfigureNetworkAction {
    config: NetworkConfig,
}

impl ConfigureNetworkAction {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    async fn apply(&self, ctx: &ActionContext, tools: &ToolProvider, root: &str) -> Result<()> {
        self.config.validate()?;
        let cancel = ctx.cancel_token();
        let format = tools.network()?.configure(cancel, root, &self.config).await?;

        if let Some(node) = current_node(ctx) {
            let ip = self
                .config
                .address
                .split('/')
                .next()
                .unwrap_or(&self.config.address)
                .to_string();
            ctx.store().set(keys::node(node, NodeAttr::Ip), ip);
        }
        info!(hostname = %self.config.hostname, format = ?format, "Network configured");
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlatformActionHandler for ConfigureNetworkAction {
    fn name(&self) -> &str {
        "configure-network"
    }

    fn description(&self) -> &str {
        "Set hostname and static network configuration"
    }

    async fn execute_native(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let root = mounted_root(ctx)?;
        self.apply(ctx, tools, &root).await
    }

    async fn execute_docker(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let root = mounted_root(ctx)?;
        require_container_paths(tools, &[&root])?;
        self.apply(ctx, tools, &root).await
    }
}

/// Replace a user's password hash in the image's `/etc/shadow`
///
/// The SHA-512 crypt hash comes from `openssl passwd -6` run through the tool
/// executor, with the password passed on stdin.
#[derive(Clone)]
pub struct SetPasswordAction {
    user: String,
    password: String,
}

impl SetPasswordAction {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    async fn apply(&self, ctx: &ActionContext, tools: &ToolProvider, root: &str) -> Result<()> {
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ProvisionError::config(format!(
                "password for {} must be at least {} characters",
                self.user, MIN_PASSWORD_LEN
            )));
        }
        let cancel = ctx.cancel_token();
        let fs = tools.filesystem()?;

        let output = fs
            .executor()
            .execute_with_input(cancel, self.password.as_bytes(), "openssl", &["passwd", "-6", "-stdin"])
            .await
            .map_err(|e| e.wrap("hash password", &self.user))?;
        let hash = String::from_utf8_lossy(&output).trim().to_string();
        if !hash.starts_with("$6$") {
            return Err(ProvisionError::integrity(format!(
                "openssl returned no SHA-512 crypt hash for {}",
                self.user
            )));
        }

        let shadow = fs.read_file(cancel, root, SHADOW).await?;
        let day = chrono::Utc::now().timestamp() / 86_400;
        let updated = set_shadow_password(&String::from_utf8_lossy(&shadow), &self.user, &hash, day)
            .ok_or_else(|| ProvisionError::not_found(format!("user {} in {}", self.user, SHADOW)))?;
        fs.write_file(cancel, root, SHADOW, updated.as_bytes(), SHADOW_MODE)
            .await?;
        info!(user = %self.user, "Password set");
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlatformActionHandler for SetPasswordAction {
    fn name(&self) -> &str {
        "set-password"
    }

    fn description(&self) -> &str {
        "Set a user's password in the image"
    }

    async fn execute_native(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let root = mounted_root(ctx)?;
        self.apply(ctx, tools, &root).await
    }

    async fn execute_docker(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let root = mounted_root(ctx)?;
        require_container_paths(tools, &[&root])?;
        self.apply(ctx, tools, &root).await
    }
}

/// Set field 2 (hash) and field 3 (last change day) of `user`'s shadow line
///
/// Returns `None` when the user has no entry.
pub fn set_shadow_password(content: &str, user: &str, hash: &str, day: i64) -> Option<String> {
    let mut found = false;
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let mut fields: Vec<String> = line.split(':').map(str::to_string).collect();
            if fields.len() >= 2 && fields[0] == user {
                found = true;
                fields[1] = hash.to_string();
                if fields.len() > 2 {
                    fields[2] = day.to_string();
                }
            }
            fields.join(":")
        })
        .collect();
    if !found {
        return None;
    }
    let mut updated = lines.join("\n");
    if content.ends_with('\n') {
        updated.push('\n');
    }
    Some(updated)
}

/// Install a device-tree overlay into the image's boot partition
#[derive(Debug, Clone)]
pub struct ApplyOverlayAction {
    overlay_file: String,
    boot_dir: String,
    boot_config: Vec<(String, String)>,
}

impl ApplyOverlayAction {
    /// `overlay_file` is a host path to a `.dtbo`
    pub fn new(overlay_file: impl Into<String>) -> Self {
        Self {
            overlay_file: overlay_file.into(),
            boot_dir: "boot".to_string(),
            boot_config: Vec::new(),
        }
    }

    /// Boot directory relative to the mounted root
    pub fn boot_dir(mut self, dir: impl Into<String>) -> Self {
        self.boot_dir = dir.into();
        self
    }

    /// Also set `key=value` in the boot `config.txt`
    pub fn boot_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.boot_config.push((key.into(), value.into()));
        self
    }

    async fn apply(&self, ctx: &ActionContext, tools: &ToolProvider, root: &str) -> Result<()> {
        let cancel = ctx.cancel_token();
        let boot = join_root(root, &self.boot_dir)?;
        let image = tools.image()?;
        image.apply_dtb_overlay(cancel, &boot, &self.overlay_file).await?;
        for (key, value) in &self.boot_config {
            image.set_boot_config(cancel, &boot, key, value).await?;
        }
        info!(overlay = %self.overlay_file, "Overlay applied");
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlatformActionHandler for ApplyOverlayAction {
    fn name(&self) -> &str {
        "apply-overlay"
    }

    fn description(&self) -> &str {
        "Install a device-tree overlay"
    }

    async fn execute_native(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let root = mounted_root(ctx)?;
        self.apply(ctx, tools, &root).await
    }

    async fn execute_docker(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()> {
        let root = mounted_root(ctx)?;
        require_container_paths(tools, &[&root, &self.overlay_file])?;
        self.apply(ctx, tools, &root).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADOW_FIXTURE: &str = "root:*:19000:0:99999:7:::\nubuntu:!:19000:0:99999:7:::\n";

    #[test]
    fn test_set_shadow_password_replaces_only_the_user() {
        let updated = set_shadow_password(SHADOW_FIXTURE, "ubuntu", "$6$salt$hash", 20000).unwrap();
        assert_eq!(
            updated,
            "root:*:19000:0:99999:7:::\nubuntu:$6$salt$hash:20000:0:99999:7:::\n"
        );
    }

    #[test]
    fn test_set_shadow_password_missing_user() {
        assert!(set_shadow_password(SHADOW_FIXTURE, "pi", "$6$x$y", 1).is_none());
    }
}
