// file: src/tools/mod.rs
// version: 2.0.0
// guid: d4e5f6a7-b8c9-0123-4567-890123defabc

//! Image, network, BMC and node tools
//!
//! Everything that touches disk images dispatches through a
//! [`CommandExecutor`](crate::executor::CommandExecutor), so the same code runs
//! natively on Linux or inside the tool container elsewhere.

pub mod bmc;
pub mod compression;
pub mod download;
pub mod filesystem;
pub mod image;
pub mod network;
pub mod node;
pub mod provider;

pub use bmc::{BmcTool, PowerState, UsbMode};
pub use compression::CompressionTool;
pub use download::{DownloadedImage, ImageDownloader};
pub use filesystem::{FileEntry, FilesystemTool, FsType};
pub use image::ImageTool;
pub use network::{cidr_to_netmask, NetworkConfig, NetworkFormat, NetworkTool};
pub use node::NodeClient;
pub use provider::{ToolProvider, ToolsConfig};
