use std::sync::Arc;

use aide_protocol::{ToolCall, ToolDefinition};
use aide_sandbox::{SandboxLimits, SandboxRunner, ShellRequest};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::{ToolContext, ToolHandler, required_str};

/// Shell tool name in the assistant catalog.
pub const SHELL_TOOL: &str = "run_shell_command";
/// Shell tool name in the coding catalog.
pub const BASH_TOOL: &str = "bash";

/// Runs a shell command through the sandbox.
///
/// This handler executes whatever it is given. Safety classification and
/// confirmation happen in the caller before the call reaches the registry.
#[derive(Clone)]
pub struct ShellTool {
    name: &'static str,
    description: &'static str,
    sandbox: Arc<dyn SandboxRunner>,
    limits: SandboxLimits,
}

impl ShellTool {
    pub fn assistant(sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self {
            name: SHELL_TOOL,
            description: "Execute a shell command on the local machine. Use for any terminal operation.",
            sandbox,
            limits: SandboxLimits::default(),
        }
    }

    pub fn bash(sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self {
            name: BASH_TOOL,
            description: "Run a shell command. Returns stdout + stderr. Timeout 30s.",
            sandbox,
            limits: SandboxLimits {
                max_runtime_secs: 30,
                max_output_chars: 5000,
            },
        }
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[async_trait]
impl ToolHandler for ShellTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name,
            self.description,
            json!({
                "type": "object",
                "properties": {"command": {"type": "string", "description": "Shell command to execute"}},
                "required": ["command"]
            }),
        )
    }

    async fn call(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let command = required_str(call, "command")?;
        let execution = self
            .sandbox
            .run(ShellRequest::new(command, &ctx.working_dir).with_limits(self.limits.clone()))
            .await?;
        if execution.timed_out {
            anyhow::bail!("command timed out ({}s).", self.limits.max_runtime_secs);
        }
        Ok(execution.render())
    }
}

#[cfg(test)]
mod tests {
    use aide_sandbox::LocalSandboxRunner;
    use serde_json::{Map, Value};

    use super::*;

    fn call(command: &str) -> ToolCall {
        let mut args = Map::new();
        args.insert("command".into(), Value::String(command.into()));
        ToolCall::new(SHELL_TOOL, args, 1)
    }

    #[tokio::test]
    async fn runs_in_context_working_dir() -> Result<()> {
        let tool = ShellTool::assistant(Arc::new(LocalSandboxRunner::default()));
        let ctx = ToolContext::new(std::env::temp_dir());
        let output = tool.call(&ctx, &call("pwd")).await?;
        let expected = std::env::temp_dir().canonicalize()?;
        assert_eq!(std::path::Path::new(output.trim()).canonicalize()?, expected);
        Ok(())
    }

    #[tokio::test]
    async fn timeouts_surface_as_errors() {
        let tool = ShellTool::assistant(Arc::new(LocalSandboxRunner::default())).with_limits(
            SandboxLimits {
                max_runtime_secs: 1,
                max_output_chars: 100,
            },
        );
        let ctx = ToolContext::new(std::env::temp_dir());
        let error = tool.call(&ctx, &call("sleep 3")).await.err();
        assert_eq!(
            error.map(|e| e.to_string()),
            Some("command timed out (1s).".to_owned())
        );
    }
}
