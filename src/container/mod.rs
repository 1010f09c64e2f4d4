// file: src/container/mod.rs
// version: 1.1.0
// guid: 5d8f3a6e-2b1c-4e97-8a40-c6f9d2e1b735

//! Container engine integration
//!
//! The registry owns every container the process creates and removes them on
//! close, on drop and from the process signal handler.

pub mod cleanup;
pub mod registry;
pub mod types;

pub use cleanup::{
    cancel_on_signal, cleanup_all, install_signal_handler, signal_received, SignalScope, MANAGED_PREFIXES,
    SIGNAL_EXIT_CODE,
};
pub use registry::{managed_name, ContainerRegistry};
pub use types::{Container, ContainerConfig, ContainerStats, ContainerStatus, ExecOutput, ResourceLimits};

/// Prefix for the persistent tool container
pub const TOOLS_PREFIX: &str = "turingpi-tools-";

/// Prefix for per-call ephemeral containers
pub const EXEC_PREFIX: &str = "turingpi-exec-";
