// file: src/workflow/engine.rs
// version: 1.0.0
// guid: c61d8f3a-7b2e-4e59-91a4-0f5e2b8d7c63

//! Sequential workflow driver

use super::context::{ActionContext, WorkflowInfo};
use super::keys;
use super::resources::ReleaseStack;
use super::stage::Stage;
use super::store::Store;
use crate::error::{ErrorKind, ProvisionError, Result};
use crate::tools::ToolProvider;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Value stored under [`keys::WORKFLOW_STATE`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Ordered stages sharing one store
pub struct Workflow {
    id: Uuid,
    name: String,
    description: String,
    stages: Vec<Stage>,
    store: Arc<Store>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            stages: Vec::new(),
            store: Arc::new(Store::new()),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Register the tool provider the platform-aware actions pull from
    pub fn with_tools(self, tools: Arc<ToolProvider>) -> Self {
        self.store.set(keys::TOOLS, tools);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn info(&self) -> WorkflowInfo {
        WorkflowInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    /// Run every stage in order and stop at the first failing action
    ///
    /// Releases deferred by the actions run in reverse order before this
    /// returns, on success, on error and on panic.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let releases = Arc::new(ReleaseStack::new());
        self.store.set(keys::WORKFLOW_STATE, WorkflowState::Running);
        info!(workflow = %self.name, stages = self.stages.len(), "Workflow started");
        let started = Instant::now();

        let outcome = AssertUnwindSafe(self.run_stages(cancel, &releases))
            .catch_unwind()
            .await;

        let pending = releases.len();
        if pending > 0 {
            debug!(workflow = %self.name, "Running {} deferred releases", pending);
        }
        let failed = releases.run_all().await;
        if failed > 0 {
            warn!(workflow = %self.name, "{} deferred releases failed", failed);
        }

        match outcome {
            Ok(Ok(())) => {
                self.store.set(keys::WORKFLOW_STATE, WorkflowState::Completed);
                info!(
                    workflow = %self.name,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Workflow completed"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let state = if e.kind() == ErrorKind::Cancelled {
                    WorkflowState::Cancelled
                } else {
                    WorkflowState::Failed
                };
                self.store.set(keys::WORKFLOW_STATE, state);
                error!(workflow = %self.name, "Workflow failed: {}", e);
                Err(e)
            }
            Err(panic) => {
                self.store.set(keys::WORKFLOW_STATE, WorkflowState::Failed);
                error!(workflow = %self.name, "Workflow panicked");
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn run_stages(&self, cancel: &CancellationToken, releases: &Arc<ReleaseStack>) -> Result<()> {
        let workflow = self.info();
        for stage in &self.stages {
            self.store.merge_from(stage.initial_store());
            let stage_info = stage.info();
            info!(stage = %stage.name(), actions = stage.action_list().len(), "Stage started");

            for action in stage.action_list() {
                let target = format!("{}/{}", stage.name(), action.name());
                if cancel.is_cancelled() {
                    return Err(ProvisionError::cancelled(format!(
                        "workflow {} cancelled before {}",
                        self.name, target
                    )));
                }

                let ctx = ActionContext::new(
                    cancel.clone(),
                    workflow.clone(),
                    stage_info.clone(),
                    action.name(),
                    Arc::clone(&self.store),
                    Arc::clone(releases),
                );
                let span = ctx.span().clone();
                let started = Instant::now();
                action
                    .execute(&ctx)
                    .instrument(span)
                    .await
                    .map_err(|e| e.wrap("run action", target.as_str()))?;
                debug!(
                    action = %target,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Action finished"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stages", &self.stages)
            .finish()
    }
}
