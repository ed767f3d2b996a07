use std::path::Path;
use std::time::Duration;

use aide_protocol::{ToolCall, ToolDefinition};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::warn;

use crate::fs::resolve_path;
use crate::{ToolContext, ToolHandler, required_str};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchMode {
    /// File names containing the query, case-insensitive.
    Names { limit: usize },
    /// Regex over file contents with line numbers.
    Contents { limit: usize },
}

#[derive(Debug, Clone)]
pub struct SearchFilesTool {
    mode: SearchMode,
}

impl SearchFilesTool {
    pub fn by_name() -> Self {
        Self {
            mode: SearchMode::Names { limit: 10 },
        }
    }

    pub fn by_content() -> Self {
        Self {
            mode: SearchMode::Contents { limit: 50 },
        }
    }
}

async fn run_search(mut command: Command) -> Result<Vec<String>> {
    command.kill_on_drop(true);
    let output = tokio::time::timeout(SEARCH_TIMEOUT, command.output())
        .await
        .context("search timed out")?
        .context("failed to run search")?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(ToOwned::to_owned)
        .collect())
}

#[async_trait]
impl ToolHandler for SearchFilesTool {
    fn definition(&self) -> ToolDefinition {
        match self.mode {
            SearchMode::Names { .. } => ToolDefinition::new(
                "search_files",
                "Search for files by name under the working directory.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Part of the file name to look for"},
                        "path": {"type": "string", "description": "Directory to search (default: working directory)"}
                    },
                    "required": ["query"]
                }),
            ),
            SearchMode::Contents { .. } => ToolDefinition::new(
                "search_files",
                "Search file contents with a regex. Returns matches with line numbers.",
                json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Regex pattern to search for"},
                        "path": {"type": "string", "description": "Directory or file to search in (default: cwd)"},
                        "file_glob": {"type": "string", "description": "Optional glob filter e.g. '*.rs'"}
                    },
                    "required": ["pattern"]
                }),
            ),
        }
    }

    async fn call(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let root = resolve_path(ctx, call.str_arg("path").unwrap_or("."));
        match self.mode {
            SearchMode::Names { limit } => {
                let query = required_str(call, "query")?;
                let mut command = Command::new("find");
                command
                    .arg(&root)
                    .args(["-not", "-path", "*/.*", "-iname"])
                    .arg(format!("*{query}*"));
                let found = run_search(command).await?;
                if found.is_empty() {
                    return Ok(format!("No files matching '{query}'."));
                }
                let shown: Vec<String> = found.iter().take(limit).map(|p| format!("  {p}")).collect();
                Ok(format!("Found {}:\n{}", found.len(), shown.join("\n")))
            }
            SearchMode::Contents { limit } => {
                let pattern = required_str(call, "pattern")?;
                let glob = call.str_arg("file_glob").unwrap_or("*");
                let mut command = Command::new("grep");
                command
                    .args(["-rn", "--include", glob, "-E"])
                    .arg(pattern)
                    .arg(&root)
                    .current_dir(&ctx.working_dir);
                let matches = run_search(command).await?;
                if matches.is_empty() {
                    return Ok(format!("No matches for '{pattern}'."));
                }
                let mut text = matches.iter().take(limit).cloned().collect::<Vec<_>>().join("\n");
                if matches.len() > limit {
                    text.push_str(&format!("\n... ({} more matches)", matches.len() - limit));
                }
                Ok(text)
            }
        }
    }
}

const GLOB_LIMIT: usize = 100;

/// Matches a glob pattern (with `**`) relative to the working directory.
#[derive(Debug, Clone, Default)]
pub struct GlobTool;

fn glob_matches(root: &Path, pattern: &str) -> Result<Vec<String>> {
    let full = root.join(pattern);
    let entries = glob::glob(&full.to_string_lossy())
        .with_context(|| format!("invalid glob pattern '{pattern}'"))?;
    let mut matches: Vec<String> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(error) => {
                warn!(%error, "unreadable glob entry");
                None
            }
        })
        .map(|path| {
            path.strip_prefix(root)
                .unwrap_or(&path)
                .display()
                .to_string()
        })
        .collect();
    matches.sort();
    Ok(matches)
}

#[async_trait]
impl ToolHandler for GlobTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "glob",
            "Find files matching a glob pattern relative to cwd.",
            json!({
                "type": "object",
                "properties": {"pattern": {"type": "string", "description": "Glob pattern e.g. '**/*.rs' or 'src/**/*.toml'"}},
                "required": ["pattern"]
            }),
        )
    }

    async fn call(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let pattern = required_str(call, "pattern")?.to_owned();
        let root = ctx.working_dir.clone();
        let matches = {
            let pattern = pattern.clone();
            tokio::task::spawn_blocking(move || glob_matches(&root, &pattern)).await??
        };
        if matches.is_empty() {
            return Ok(format!("No files matching '{pattern}'."));
        }
        let mut text = matches.iter().take(GLOB_LIMIT).cloned().collect::<Vec<_>>().join("\n");
        if matches.len() > GLOB_LIMIT {
            text.push_str(&format!("\n... ({} more)", matches.len() - GLOB_LIMIT));
        }
        Ok(text)
    }
}
