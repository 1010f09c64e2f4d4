// file: src/workflow/keys.rs
// version: 1.0.0
// guid: 3a9f6c2e-8b1d-4e74-9c05-d2b7e4a1f836

//! Store key namespace

/// The tool provider handle
pub const TOOLS: &str = "turingpi.tools";
pub const TOOLS_CACHE: &str = "turingpi.tools.cache";
pub const TOOLS_FS: &str = "turingpi.tools.fs";

pub const BMC_INFO: &str = "turingpi.bmc.info";
pub const BMC_FIRMWARE: &str = "turingpi.bmc.firmware";
pub const BMC_HEALTH: &str = "turingpi.bmc.health";

pub const CLUSTER_NODES: &str = "turingpi.cluster.nodes";
pub const CLUSTER_HEALTH: &str = "turingpi.cluster.health";

pub const CONTAINERS_LIST: &str = "turingpi.containers.list";

/// Base image URL or path
pub const IMAGE_SOURCE: &str = "turingpi.image.source";
/// Finished artifact path
pub const IMAGE_TARGET: &str = "turingpi.image.target";
/// Root filesystem mount point of the image being customized
pub const IMAGE_MOUNTS: &str = "turingpi.image.mounts";
/// Local cache key of the compressed base image
pub const IMAGE_BASE_KEY: &str = "turingpi.image.base_key";
/// Whether the base image was already cached
pub const IMAGE_BASE_CACHED: &str = "turingpi.image.base_cached";
/// Decompressed raw image being customized
pub const IMAGE_WORKING: &str = "turingpi.image.working";
/// Mapped root partition device
pub const IMAGE_ROOT_DEVICE: &str = "turingpi.image.root_device";
/// Cache key of the customized artifact
pub const IMAGE_ARTIFACT_KEY: &str = "turingpi.image.artifact_key";
/// Artifact path on the BMC side
pub const IMAGE_REMOTE_PATH: &str = "turingpi.image.remote_path";

pub const WORKFLOW_CURRENT_NODE: &str = "turingpi.workflow.current_node";
pub const WORKFLOW_TARGET_NODES: &str = "turingpi.workflow.target_nodes";
pub const WORKFLOW_STATE: &str = "turingpi.workflow.state";

/// Per-node attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAttr {
    Power,
    BootMode,
    UsbMode,
    Console,
    Status,
    Diagnostics,
    Ip,
}

impl NodeAttr {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAttr::Power => "power",
            NodeAttr::BootMode => "boot.mode",
            NodeAttr::UsbMode => "usb.mode",
            NodeAttr::Console => "console",
            NodeAttr::Status => "status",
            NodeAttr::Diagnostics => "diagnostics",
            NodeAttr::Ip => "ip",
        }
    }
}

/// `turingpi.node.<id>.<attr>`
pub fn node(id: u8, attr: NodeAttr) -> String {
    format!("turingpi.node.{}.{}", id, attr.as_str())
}

/// `turingpi.container.<id>.state`
pub fn container_state(id: &str) -> String {
    format!("turingpi.container.{}.state", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_keys() {
        assert_eq!(node(3, NodeAttr::BootMode), "turingpi.node.3.boot.mode");
        assert_eq!(node(1, NodeAttr::Ip), "turingpi.node.1.ip");
        assert_eq!(container_state("abc"), "turingpi.container.abc.state");
    }
}
