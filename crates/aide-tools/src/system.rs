use std::process::Stdio;
use std::sync::Arc;

use aide_protocol::{ToolCall, ToolDefinition};
use aide_sandbox::{SandboxLimits, SandboxRunner, ShellRequest};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::fs::resolve_path;
use crate::{ToolContext, ToolHandler, required_str};

const STATS_COMMAND: &str = "uptime; df -h / | tail -n 1; \
     (free -h 2>/dev/null | sed -n 2p) || (vm_stat 2>/dev/null | head -n 5)";

/// Load, disk and memory figures gathered with the platform's own tools.
#[derive(Clone)]
pub struct SystemStatsTool {
    sandbox: Arc<dyn SandboxRunner>,
    command: String,
}

impl SystemStatsTool {
    pub fn new(sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self::with_command(sandbox, STATS_COMMAND)
    }

    pub fn with_command(sandbox: Arc<dyn SandboxRunner>, command: impl Into<String>) -> Self {
        Self {
            sandbox,
            command: command.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for SystemStatsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "get_system_stats",
            "Get current system performance: CPU load, memory and disk usage.",
            json!({"type": "object", "properties": {}, "required": []}),
        )
    }

    async fn call(&self, ctx: &ToolContext, _call: &ToolCall) -> Result<String> {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let execution = self
            .sandbox
            .run(ShellRequest::new(&self.command, &ctx.working_dir).with_limits(SandboxLimits {
                max_runtime_secs: 10,
                max_output_chars: 2000,
            }))
            .await?;
        if execution.timed_out {
            anyhow::bail!("system stats timed out");
        }
        Ok(format!("CPUs: {cpus}\n{}", execution.render()))
    }
}

/// Opens a file with its default handler, or launches an application by name.
#[derive(Debug, Clone, Default)]
pub struct OpenApplicationTool;

#[cfg(target_os = "macos")]
async fn launch(name: &str) -> std::io::Result<bool> {
    let status = Command::new("open")
        .args(["-a", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

#[cfg(not(target_os = "macos"))]
async fn launch(name: &str) -> std::io::Result<bool> {
    Command::new(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(true)
}

#[async_trait]
impl ToolHandler for OpenApplicationTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "open_application",
            "Open an application by name, or a file with its default application.",
            json!({
                "type": "object",
                "properties": {"name": {"type": "string", "description": "App name or file path"}},
                "required": ["name"]
            }),
        )
    }

    async fn call(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let name = required_str(call, "name")?.trim();
        let target = resolve_path(ctx, name);

        let opened = if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            tokio::task::spawn_blocking(move || open::that_detached(target)).await?
        } else {
            match launch(name).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(std::io::Error::other("launcher exited unsuccessfully")),
                Err(error) => Err(error),
            }
        };

        match opened {
            Ok(()) => Ok(format!("Opened {name}.")),
            Err(error) => {
                debug!(%error, name, "open failed");
                Ok(format!("Could not open '{name}'."))
            }
        }
    }
}
