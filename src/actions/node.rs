// file: src/actions/node.rs
// version: 1.0.0
// guid: a8d3f5c2-1e7b-4b94-8c6a-5f2e0d9b7a31

//! Node actions through the BMC and over SSH

use crate::config::MAX_NODES;
use crate::error::{ProvisionError, Result, ResultExt};
use crate::tools::PowerState;
use crate::workflow::keys::{self, NodeAttr};
use crate::workflow::{ActionContext, ActionHandler};
use regex::Regex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Console bytes kept in the store per node
pub const MAX_CONSOLE_BYTES: usize = 64 * 1024;

const DEFAULT_UART_POLL: Duration = Duration::from_secs(2);

fn check_slot(node: u8) -> Result<()> {
    if node == 0 || node > MAX_NODES {
        return Err(ProvisionError::config(format!(
            "node {} is outside 1..={}",
            node, MAX_NODES
        )));
    }
    Ok(())
}

/// Power off, flash the staged image through the BMC, power on
#[derive(Debug, Clone)]
pub struct FlashNodeAction {
    node: u8,
}

impl FlashNodeAction {
    pub fn new(node: u8) -> Self {
        Self { node }
    }
}

#[async_trait::async_trait]
impl ActionHandler for FlashNodeAction {
    fn name(&self) -> &str {
        "flash-node"
    }

    fn description(&self) -> &str {
        "Flash the staged image onto the node"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        check_slot(self.node)?;
        let tools = ctx.tools()?;
        let bmc = tools.bmc()?;
        let cancel = ctx.cancel_token();
        let image: String = ctx
            .store()
            .get(keys::IMAGE_REMOTE_PATH)
            .map_err(|_| ProvisionError::precondition("no image staged on the BMC"))?;
        ctx.store().set(keys::WORKFLOW_CURRENT_NODE, self.node);

        bmc.power(cancel, self.node, PowerState::Off).await?;
        ctx.store()
            .set(keys::node(self.node, NodeAttr::Power), PowerState::Off.as_str().to_string());

        info!(node = self.node, image = %image, "Flashing");
        let started = Instant::now();
        bmc.flash(cancel, self.node, &image).await?;
        ctx.store().set(keys::node(self.node, NodeAttr::Status), "flashed".to_string());
        info!(node = self.node, elapsed_secs = started.elapsed().as_secs(), "Flash complete");

        bmc.power(cancel, self.node, PowerState::On).await?;
        ctx.store()
            .set(keys::node(self.node, NodeAttr::Power), PowerState::On.as_str().to_string());
        Ok(())
    }
}

/// Poll a node's serial console until a pattern shows up
#[derive(Debug, Clone)]
pub struct MonitorUartAction {
    node: u8,
    pattern: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl MonitorUartAction {
    pub fn new(node: u8, pattern: impl Into<String>, timeout: Duration) -> Self {
        Self {
            node,
            pattern: pattern.into(),
            timeout,
            poll_interval: DEFAULT_UART_POLL,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait::async_trait]
impl ActionHandler for MonitorUartAction {
    fn name(&self) -> &str {
        "monitor-uart"
    }

    fn description(&self) -> &str {
        "Wait for a pattern on the node console"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        check_slot(self.node)?;
        let pattern = Regex::new(&self.pattern)
            .map_err(|e| ProvisionError::config(format!("invalid console pattern {:?}: {}", self.pattern, e)))?;
        let tools = ctx.tools()?;
        let bmc = tools.bmc()?;
        let cancel = ctx.cancel_token();
        let console_key = keys::node(self.node, NodeAttr::Console);
        let deadline = Instant::now() + self.timeout;
        let mut console = String::new();

        loop {
            ctx.check_cancelled()?;
            let chunk = bmc.uart_get(cancel, self.node).await?;
            if !chunk.is_empty() {
                console.push_str(&chunk);
                trim_front(&mut console, MAX_CONSOLE_BYTES);
                ctx.store().set(console_key.clone(), console.clone());
            }
            if pattern.is_match(&console) {
                info!(node = self.node, pattern = %self.pattern, "Console pattern seen");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProvisionError::precondition(format!(
                    "pattern {:?} not seen on node {} console within {:?}",
                    self.pattern, self.node, self.timeout
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ProvisionError::cancelled(format!("monitoring node {} console", self.node)));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Drop leading bytes so at most `max` remain, on a char boundary
fn trim_front(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let start = text.len() - max;
    let cut = (start..=text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text.drain(..cut);
}

/// Block until the node accepts SSH logins
#[derive(Debug, Clone)]
pub struct WaitForSshAction {
    node: u8,
    timeout: Duration,
}

impl WaitForSshAction {
    pub fn new(node: u8, timeout: Duration) -> Self {
        Self { node, timeout }
    }
}

#[async_trait::async_trait]
impl ActionHandler for WaitForSshAction {
    fn name(&self) -> &str {
        "wait-for-ssh"
    }

    fn description(&self) -> &str {
        "Wait for SSH on the node"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        let tools = ctx.tools()?;
        let client = tools.node(self.node)?;
        client.wait_for_ssh(ctx.cancel_token(), self.timeout).await?;
        ctx.store()
            .set(keys::node(self.node, NodeAttr::Status), "ssh-ready".to_string());
        Ok(())
    }
}

/// Run shell commands on the node, in order, stopping at the first failure
#[derive(Debug, Clone)]
pub struct RunNodeCommandsAction {
    node: u8,
    commands: Vec<String>,
}

impl RunNodeCommandsAction {
    pub fn new(node: u8, commands: Vec<String>) -> Self {
        Self { node, commands }
    }
}

#[async_trait::async_trait]
impl ActionHandler for RunNodeCommandsAction {
    fn name(&self) -> &str {
        "run-node-commands"
    }

    fn description(&self) -> &str {
        "Run post-install commands on the node"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        let tools = ctx.tools()?;
        let client = tools.node(self.node)?;
        for command in &self.commands {
            ctx.check_cancelled()?;
            info!(node = self.node, "Running: {}", command);
            let output = client
                .execute_with_output(ctx.cancel_token(), command)
                .await
                .with_op("run command", format!("node {}", self.node))?;
            debug!(node = self.node, "{}", output.trim_end());
        }
        Ok(())
    }
}

/// Switch a node's power through the BMC
#[derive(Debug, Clone)]
pub struct SetNodePowerAction {
    node: u8,
    state: PowerState,
}

impl SetNodePowerAction {
    pub fn new(node: u8, state: PowerState) -> Self {
        Self { node, state }
    }
}

#[async_trait::async_trait]
impl ActionHandler for SetNodePowerAction {
    fn name(&self) -> &str {
        "set-node-power"
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        check_slot(self.node)?;
        let tools = ctx.tools()?;
        tools.bmc()?.power(ctx.cancel_token(), self.node, self.state).await?;
        ctx.store()
            .set(keys::node(self.node, NodeAttr::Power), self.state.as_str().to_string());
        Ok(())
    }
}
