// file: src/workflow/mod.rs
// version: 1.0.0
// guid: 0b5e8d27-4c1a-4f93-a6d8-e2f7c9b14a50

//! Workflow engine
//!
//! A [`Workflow`] owns ordered [`Stage`]s, each an ordered list of
//! [`Action`]s. Actions share one typed [`Store`] and run strictly one after
//! another; the first error stops the run.

pub mod action;
pub mod context;
pub mod engine;
pub mod keys;
pub mod resources;
pub mod stage;
pub mod store;

pub use action::{select_platform, Action, ActionHandler, Platform, PlatformActionHandler};
pub use context::{ActionContext, StageInfo, WorkflowInfo};
pub use engine::{Workflow, WorkflowState};
pub use resources::ReleaseStack;
pub use stage::Stage;
pub use store::Store;
