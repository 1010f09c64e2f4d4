// file: src/actions/mod.rs
// version: 1.0.0
// guid: 6a3f9c1e-2d8b-4e47-b0c5-91d7e4a2f836

//! Action library for image customization, staging and flashing
//!
//! Image actions are platform aware: on Linux they drive the host tools, on
//! other hosts the same tools run in the tool container, which only sees the
//! cache directory. BMC and node actions are regular actions.

pub mod builder;
pub mod customize;
pub mod image;
pub mod node;

pub use builder::{DeployHook, UbuntuDeployBuilder};
pub use customize::{ApplyOverlayAction, ConfigureNetworkAction, SetPasswordAction, MIN_PASSWORD_LEN};
pub use image::{
    base_image_key, CheckBaseImageAction, CompressImageAction, DecompressImageAction, FetchBaseImageAction,
    MountImageAction, UnmountImageAction, UploadToRemoteCacheAction,
};
pub use node::{FlashNodeAction, MonitorUartAction, RunNodeCommandsAction, SetNodePowerAction, WaitForSshAction};

use crate::error::{ProvisionError, Result};
use crate::executor::ExecutionMode;
use crate::tools::ToolProvider;
use crate::workflow::{keys, ActionContext};
use std::path::Path;

/// Release key of the partition mapping made by [`MountImageAction`]
pub const RELEASE_PARTITIONS: &str = "image.partitions";
/// Release key of the root mount made by [`MountImageAction`]
pub const RELEASE_MOUNT: &str = "image.mount";

/// Container handlers need the tool container and paths it can see
pub(crate) fn require_container_paths(tools: &ToolProvider, paths: &[&str]) -> Result<()> {
    if tools.execution_mode()? != ExecutionMode::Container {
        return Err(ProvisionError::precondition(
            "container handler requires the tool executor in container mode",
        ));
    }
    for path in paths {
        if !Path::new(path).starts_with(tools.cache_dir()) {
            return Err(ProvisionError::precondition(format!(
                "{} is outside {}, which is all the tool container can see",
                path,
                tools.cache_dir().display()
            )));
        }
    }
    Ok(())
}

/// Mount point of the image being customized
pub(crate) fn mounted_root(ctx: &ActionContext) -> Result<String> {
    ctx.store()
        .get::<String>(keys::IMAGE_MOUNTS)
        .map_err(|_| ProvisionError::precondition("no image is mounted"))
}

/// Node slot of the current workflow, if one was recorded
pub(crate) fn current_node(ctx: &ActionContext) -> Option<u8> {
    ctx.store().get::<u8>(keys::WORKFLOW_CURRENT_NODE).ok()
}
