//! Tool registry and executor.
//!
//! Tools are looked up by name in a registry built once at startup. Execution
//! never fails from the caller's point of view: unknown names, handler errors
//! and timeouts all come back as text the model can read.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aide_protocol::{ToolCall, ToolDefinition};
use aide_sandbox::truncate_chars;
use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, instrument, warn};

mod catalog;
mod fs;
mod memory;
mod search;
mod shell;
mod system;
mod web;

pub use catalog::{AssistantToolset, assistant_catalog, coding_catalog};
pub use fs::{ListDirectoryTool, ReadFileTool, StrReplaceTool, WriteFileTool, resolve_path};
pub use memory::{CleanupMemoryTool, RecallTool, RememberTool, SetUserNameTool};
pub use search::{GlobTool, SearchFilesTool};
pub use shell::{BASH_TOOL, SHELL_TOOL, ShellTool};
pub use system::{OpenApplicationTool, SystemStatsTool};
pub use web::{
    FetchWebpageTool, NewsTool, StockPriceTool, WeatherTool, WebEndpoints, WebSearchTool,
    html_to_text,
};

/// Default character budget for any single tool result.
pub const DEFAULT_OUTPUT_BUDGET: usize = 3000;

/// Per-call execution context supplied by the caller.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn call(&self, ctx: &ToolContext, call: &ToolCall) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReport {
    pub tool: String,
    pub output: String,
    pub success: bool,
    pub duration_ms: u128,
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn ToolHandler>>,
    output_budget: usize,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_BUDGET)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("output_budget", &self.output_budget)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(output_budget: usize) -> Self {
        Self {
            tools: IndexMap::new(),
            output_budget,
        }
    }

    /// Registering a name twice replaces the earlier handler.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        if self.tools.insert(name.clone(), handler).is_some() {
            warn!(tool = %name, "tool handler replaced");
        }
    }

    pub fn with(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Catalog offered to the backend, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    #[instrument(skip(self, ctx, call), fields(tool = %call.name, round = call.round))]
    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolReport {
        let started = Instant::now();
        let Some(handler) = self.tools.get(&call.name) else {
            warn!("unknown tool requested");
            return ToolReport {
                tool: call.name.clone(),
                output: format!("Unknown tool: {}", call.name),
                success: false,
                duration_ms: 0,
            };
        };

        let (output, success) =
            match tokio::time::timeout(ctx.timeout, handler.call(ctx, call)).await {
                Ok(Ok(output)) => (output, true),
                Ok(Err(error)) => {
                    debug!(error = %error, "tool failed");
                    (format!("Error: {error:#}"), false)
                }
                Err(_) => {
                    warn!(timeout_secs = ctx.timeout.as_secs(), "tool timed out");
                    (
                        format!("Error: {} timed out after {}s", call.name, ctx.timeout.as_secs()),
                        false,
                    )
                }
            };

        ToolReport {
            tool: call.name.clone(),
            output: truncate_chars(&output, self.output_budget),
            success,
            duration_ms: started.elapsed().as_millis(),
        }
    }
}

/// Fetches a required string argument.
pub(crate) fn required_str<'a>(call: &'a ToolCall, key: &str) -> anyhow::Result<&'a str> {
    match call.str_arg(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => anyhow::bail!("missing required argument '{key}'"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("echo", "Echo text", json!({"type": "object"}))
        }

        async fn call(&self, _ctx: &ToolContext, call: &ToolCall) -> anyhow::Result<String> {
            Ok(required_str(call, "text")?.to_owned())
        }
    }

    struct Sleepy;

    #[async_trait]
    impl ToolHandler for Sleepy {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("sleepy", "Never finishes in time", json!({"type": "object"}))
        }

        async fn call(&self, _ctx: &ToolContext, _call: &ToolCall) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        let arguments = match arguments {
            serde_json::Value::Object(map) => map,
            _ => Map::new(),
        };
        ToolCall::new(name, arguments, 1)
    }

    #[tokio::test]
    async fn unknown_tools_are_a_normal_outcome() {
        let registry = ToolRegistry::default().with(Echo);
        let report = registry
            .execute(&ToolContext::new("."), &call("teleport", json!({})))
            .await;
        assert_eq!(report.output, "Unknown tool: teleport");
        assert!(!report.success);
    }

    #[tokio::test]
    async fn handler_errors_become_error_text() {
        let registry = ToolRegistry::default().with(Echo);
        let report = registry
            .execute(&ToolContext::new("."), &call("echo", json!({})))
            .await;
        assert_eq!(report.output, "Error: missing required argument 'text'");
        assert!(!report.success);
    }

    #[tokio::test]
    async fn output_is_truncated_to_budget() {
        let registry = ToolRegistry::new(10).with(Echo);
        let report = registry
            .execute(
                &ToolContext::new("."),
                &call("echo", json!({"text": "0123456789abcdef"})),
            )
            .await;
        assert_eq!(report.output, "0123456789");
        assert!(report.success);
    }

    #[tokio::test]
    async fn slow_handlers_hit_the_context_timeout() {
        let registry = ToolRegistry::default().with(Sleepy);
        let ctx = ToolContext::new(".").with_timeout(Duration::from_millis(50));
        let report = registry.execute(&ctx, &call("sleepy", json!({}))).await;
        assert!(report.output.starts_with("Error: sleepy timed out"));
        assert!(!report.success);
    }

    #[test]
    fn definitions_keep_registration_order() {
        let registry = ToolRegistry::default().with(Sleepy).with(Echo);
        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["sleepy", "echo"]);
    }
}
