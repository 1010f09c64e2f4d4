// file: src/workflow/context.rs
// version: 1.0.0
// guid: 5d7a2c91-e4f8-4b16-9a3d-c0e6b8f2d417

//! Per-invocation handle passed to every action

use super::keys;
use super::resources::ReleaseStack;
use super::store::Store;
use crate::error::{ProvisionError, Result};
use crate::tools::ToolProvider;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

/// Read-only identity of the running workflow
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub id: Uuid,
    pub name: String,
    pub description: String,
}

/// Read-only identity of the running stage
#[derive(Debug, Clone)]
pub struct StageInfo {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

/// Everything an action may touch while it runs
pub struct ActionContext {
    cancel: CancellationToken,
    span: Span,
    workflow: WorkflowInfo,
    stage: StageInfo,
    action: String,
    store: Arc<Store>,
    releases: Arc<ReleaseStack>,
}

impl ActionContext {
    pub fn new(
        cancel: CancellationToken,
        workflow: WorkflowInfo,
        stage: StageInfo,
        action: impl Into<String>,
        store: Arc<Store>,
        releases: Arc<ReleaseStack>,
    ) -> Self {
        let action = action.into();
        let span = tracing::info_span!(
            "action",
            workflow = %workflow.name,
            stage = %stage.name,
            action = %action
        );
        Self {
            cancel,
            span,
            workflow,
            stage,
            action,
            store,
            releases,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Span carrying the workflow, stage and action names
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn workflow(&self) -> &WorkflowInfo {
        &self.workflow
    }

    pub fn stage(&self) -> &StageInfo {
        &self.stage
    }

    pub fn action_name(&self) -> &str {
        &self.action
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The tool provider registered under [`keys::TOOLS`]
    pub fn tools(&self) -> Result<Arc<ToolProvider>> {
        self.store.get::<Arc<ToolProvider>>(keys::TOOLS)
    }

    /// `Cancelled` once the workflow token fires
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::cancelled(format!("action {} cancelled", self.action)));
        }
        Ok(())
    }

    /// Register a release on the workflow's cleanup stack
    ///
    /// Releases run in reverse registration order before the workflow returns,
    /// unless [`release`](Self::release) runs them earlier. They receive no
    /// cancellation token of the workflow: a cancelled run still unmounts.
    pub fn defer<F, Fut>(&self, key: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.releases.defer(key, release);
    }

    /// Run the release registered under `key` now; `false` if none was
    pub async fn release(&self, key: &str) -> Result<bool> {
        self.releases.release(key).await
    }

    pub fn pending_releases(&self) -> Vec<String> {
        self.releases.names()
    }
}
