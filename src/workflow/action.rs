// file: src/workflow/action.rs
// version: 1.0.0
// guid: 9e4b7d12-3a6c-4f85-b2e9-8d1c5a7f0b34

//! Action contract and platform-aware dispatch

use super::context::ActionContext;
use crate::error::{ProvisionError, Result};
use crate::tools::ToolProvider;
use std::sync::Arc;
use tracing::debug;

/// A unit of work inside a stage
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()>;
}

/// An action with one handler for Linux hosts and one for the tool container
#[async_trait::async_trait]
pub trait PlatformActionHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn execute_native(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()>;

    async fn execute_docker(&self, ctx: &ActionContext, tools: &Arc<ToolProvider>) -> Result<()>;
}

/// Which handler the dispatch rule picked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Native,
    Docker,
}

#[derive(Clone)]
pub enum Action {
    Regular(Arc<dyn ActionHandler>),
    PlatformAware(Arc<dyn PlatformActionHandler>),
}

impl Action {
    pub fn regular(handler: impl ActionHandler + 'static) -> Self {
        Action::Regular(Arc::new(handler))
    }

    pub fn platform_aware(handler: impl PlatformActionHandler + 'static) -> Self {
        Action::PlatformAware(Arc::new(handler))
    }

    pub fn name(&self) -> &str {
        match self {
            Action::Regular(h) => h.name(),
            Action::PlatformAware(h) => h.name(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Action::Regular(h) => h.description(),
            Action::PlatformAware(h) => h.description(),
        }
    }

    pub async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        match self {
            Action::Regular(handler) => handler.execute(ctx).await,
            Action::PlatformAware(handler) => {
                let tools = ctx.tools()?;
                match select_platform(&tools).await? {
                    Platform::Native => {
                        debug!(action = handler.name(), "Running native handler");
                        handler.execute_native(ctx, &tools).await
                    }
                    Platform::Docker => {
                        debug!(action = handler.name(), "Running container handler");
                        handler.execute_docker(ctx, &tools).await
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Action::Regular(_) => "Regular",
            Action::PlatformAware(_) => "PlatformAware",
        };
        f.debug_struct("Action")
            .field("kind", &kind)
            .field("name", &self.name())
            .finish()
    }
}

/// Linux runs natively; elsewhere a usable container engine is required
pub async fn select_platform(tools: &ToolProvider) -> Result<Platform> {
    let probe = tools.probe();
    if probe.is_linux() {
        Ok(Platform::Native)
    } else if probe.container_engine_available().await {
        Ok(Platform::Docker)
    } else {
        Err(ProvisionError::precondition(
            "unsupported platform: not Linux and no container engine available",
        ))
    }
}
