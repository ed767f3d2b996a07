use std::sync::Arc;

use aide_memory::{DEFAULT_TTL_DAYS, FactStore};
use aide_protocol::{ToolCall, ToolDefinition};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::{ToolContext, ToolHandler, required_str};

/// Facts listed by a single recall.
const RECALL_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct RememberTool {
    store: Arc<FactStore>,
}

impl RememberTool {
    pub fn new(store: Arc<FactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for RememberTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "remember",
            "Store a fact in persistent memory. Use when the user shares personal info or asks you to remember something.",
            json!({
                "type": "object",
                "properties": {"fact": {"type": "string", "description": "The fact to remember"}},
                "required": ["fact"]
            }),
        )
    }

    async fn call(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let fact = required_str(call, "fact")?;
        self.store.remember(fact, "user", Some(DEFAULT_TTL_DAYS)).await?;
        Ok(format!("Remembered: {fact}"))
    }
}

#[derive(Debug, Clone)]
pub struct RecallTool {
    store: Arc<FactStore>,
}

impl RecallTool {
    pub fn new(store: Arc<FactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for RecallTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "recall",
            "Search persistent memory for stored facts.",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string", "description": "Optional search term"}},
                "required": []
            }),
        )
    }

    async fn call(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let query = call.str_arg("query").unwrap_or_default();
        let matched = self.store.recall(query).await?;
        if matched.is_empty() {
            if self.store.stats().await.total == 0 {
                return Ok("I don't have any stored memories yet.".to_owned());
            }
            return Ok(format!("No memories matching '{query}'."));
        }
        let skip = matched.len().saturating_sub(RECALL_LIMIT);
        let lines: Vec<String> = matched[skip..]
            .iter()
            .map(|fact| format!("- {} ({})", fact.fact, fact.timestamp.format("%Y-%m-%d")))
            .collect();
        Ok(format!("Memories ({} total):\n{}", matched.len(), lines.join("\n")))
    }
}

#[derive(Debug, Clone)]
pub struct SetUserNameTool {
    store: Arc<FactStore>,
}

impl SetUserNameTool {
    pub fn new(store: Arc<FactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for SetUserNameTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "set_user_name",
            "Remember the user's name to address them personally.",
            json!({
                "type": "object",
                "properties": {"name": {"type": "string", "description": "User's name"}},
                "required": ["name"]
            }),
        )
    }

    async fn call(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let name = required_str(call, "name")?;
        self.store.set_user_name(name).await?;
        Ok(format!("I'll remember your name is {name}."))
    }
}

#[derive(Debug, Clone)]
pub struct CleanupMemoryTool {
    store: Arc<FactStore>,
}

impl CleanupMemoryTool {
    pub fn new(store: Arc<FactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for CleanupMemoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "cleanup_memory",
            "Clean up old, expired memories and return stats about memory usage.",
            json!({"type": "object", "properties": {}, "required": []}),
        )
    }

    async fn call(&self, _ctx: &ToolContext, _call: &ToolCall) -> Result<String> {
        let report = self.store.cleanup().await?;
        let stats = self.store.stats().await;
        Ok(format!(
            "Memory cleanup complete. Removed {} expired facts ({} -> {}). {stats}",
            report.removed, report.before, report.after
        ))
    }
}
