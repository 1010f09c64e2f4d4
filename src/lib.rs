// file: src/lib.rs
// version: 3.0.0
// guid: d82472d1-7f0f-4eb4-b0a3-6e1547103eb4

//! # Turing Pi Provisioner
//!
//! Customizes vendor OS images for individual compute modules, stages them in a
//! content-addressed cache the BMC can read from, flashes them through the BMC
//! and drives post-install steps over SSH.
//!
//! The crate is organized around three subsystems:
//! - [`workflow`]: ordered stages of platform-aware actions sharing a typed store
//! - [`executor`]: one command interface over native and containerized execution
//! - [`cache`]: local and SSH-backed caches with a tag index

pub mod actions;
pub mod cache;
pub mod cli;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod logging;
pub mod platform;
pub mod ssh;
pub mod tools;
pub mod workflow;

pub use error::{ErrorKind, ProvisionError, Result};

/// Version information for the provisioner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information
pub const BUILD_INFO: &str = concat!(
    "Version: ",
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Package: ",
    env!("CARGO_PKG_NAME"),
    "\n"
);
