use std::path::{Path, PathBuf};

use aide_protocol::{ToolCall, ToolDefinition};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::fs;

use crate::{ToolContext, ToolHandler, required_str};

/// Expands a leading `~` and anchors relative paths at the context's
/// working directory.
pub fn resolve_path(ctx: &ToolContext, raw: &str) -> PathBuf {
    let expanded = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(raw),
        },
        _ => PathBuf::from(raw),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        ctx.working_dir.join(expanded)
    }
}

fn line_arg(call: &ToolCall, key: &str) -> Option<usize> {
    match call.arguments.get(key)? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStyle {
    /// Raw content, `(empty file)` when empty.
    Plain,
    /// Numbered lines with an optional 1-indexed range.
    Numbered { max_lines: usize },
}

#[derive(Debug, Clone)]
pub struct ReadFileTool {
    style: ReadStyle,
}

impl ReadFileTool {
    pub fn plain() -> Self {
        Self {
            style: ReadStyle::Plain,
        }
    }

    pub fn numbered() -> Self {
        Self {
            style: ReadStyle::Numbered { max_lines: 2000 },
        }
    }
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        match self.style {
            ReadStyle::Plain => ToolDefinition::new(
                "read_file",
                "Read and return the contents of a file.",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string", "description": "File path to read"}},
                    "required": ["path"]
                }),
            ),
            ReadStyle::Numbered { .. } => ToolDefinition::new(
                "read_file",
                "Read file content. Returns full file or a line range.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "File path (absolute or relative to cwd)"},
                        "start_line": {"type": "integer", "description": "Optional start line (1-indexed)"},
                        "end_line": {"type": "integer", "description": "Optional end line (1-indexed)"}
                    },
                    "required": ["path"]
                }),
            ),
        }
    }

    async fn call(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let path = resolve_path(ctx, required_str(call, "path")?);
        let meta = fs::metadata(&path)
            .await
            .with_context(|| format!("not found: {}", path.display()))?;
        if !meta.is_file() {
            bail!("not a file: {}", path.display());
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("failed reading {}", path.display()))?;
        let content = String::from_utf8_lossy(&bytes);

        match self.style {
            ReadStyle::Plain if content.is_empty() => Ok("(empty file)".to_owned()),
            ReadStyle::Plain => Ok(content.into_owned()),
            ReadStyle::Numbered { max_lines } => {
                let lines: Vec<&str> = content.lines().collect();
                let start = line_arg(call, "start_line");
                let end = line_arg(call, "end_line");
                let (from, to) = if start.is_some() || end.is_some() {
                    let from = start.unwrap_or(1).max(1) - 1;
                    let to = end.unwrap_or(lines.len()).min(lines.len());
                    (from.min(to), to)
                } else {
                    (0, lines.len())
                };
                // Ranged and whole-file reads share the same line cap.
                let shown = to.min(from + max_lines);
                let mut numbered: Vec<String> = lines[from..shown]
                    .iter()
                    .enumerate()
                    .map(|(offset, line)| format!("{:>5} | {line}", from + offset + 1))
                    .collect();
                if shown < to {
                    numbered.push(format!("... ({} more lines)", to - shown));
                }
                Ok(numbered.join("\n"))
            }
        }
    }
}

/// Creates or overwrites a file, creating parent directories.
#[derive(Debug, Clone)]
pub struct WriteFileTool {
    name: &'static str,
    description: &'static str,
}

impl WriteFileTool {
    pub fn create_file() -> Self {
        Self {
            name: "create_file",
            description: "Create or overwrite a file at the specified path with content.",
        }
    }

    pub fn write_file() -> Self {
        Self {
            name: "write_file",
            description: "Create or overwrite a file with the given content.",
        }
    }
}

#[async_trait]
impl ToolHandler for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name,
            self.description,
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path (use ~ for home)"},
                    "content": {"type": "string", "description": "Full file content"}
                },
                "required": ["path", "content"]
            }),
        )
    }

    async fn call(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let path = resolve_path(ctx, required_str(call, "path")?);
        let content = call.str_arg("content").unwrap_or_default();
        let existed = fs::try_exists(&path).await.unwrap_or(false);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, content)
            .await
            .with_context(|| format!("failed writing {}", path.display()))?;
        let verb = if existed { "File written" } else { "File created" };
        Ok(format!("{verb} at {} ({} bytes)", path.display(), content.len()))
    }
}

/// Replaces exactly one occurrence of a string in a file.
#[derive(Debug, Clone, Default)]
pub struct StrReplaceTool;

#[async_trait]
impl ToolHandler for StrReplaceTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "str_replace",
            "Replace an exact unique string in a file. Fails if the string appears 0 or 2+ times.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path"},
                    "old_str": {"type": "string", "description": "Exact string to find (must be unique)"},
                    "new_str": {"type": "string", "description": "Replacement string"}
                },
                "required": ["path", "old_str", "new_str"]
            }),
        )
    }

    async fn call(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let path = resolve_path(ctx, required_str(call, "path")?);
        let old = required_str(call, "old_str")?;
        let new = call.str_arg("new_str").unwrap_or_default();
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("not found: {}", path.display()))?;

        match content.matches(old).count() {
            0 => bail!(
                "string not found in {}. Make sure old_str matches exactly.",
                path.display()
            ),
            1 => {}
            count => bail!(
                "string found {count} times in {}. Provide more context to make it unique.",
                path.display()
            ),
        }

        fs::write(&path, content.replacen(old, new, 1))
            .await
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(format!("Replaced in {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct ListDirectoryTool {
    limit: usize,
    show_hidden: bool,
}

impl ListDirectoryTool {
    pub fn new(limit: usize, show_hidden: bool) -> Self {
        Self { limit, show_hidden }
    }
}

impl Default for ListDirectoryTool {
    fn default() -> Self {
        Self::new(30, true)
    }
}

fn human_size(bytes: u64) -> String {
    match bytes {
        b if b < 1024 => format!("{b}B"),
        b if b < 1024 * 1024 => format!("{}KB", b / 1024),
        b => format!("{}MB", b / (1024 * 1024)),
    }
}

async fn list_entries(dir: &Path) -> Result<Vec<(String, bool, u64)>> {
    let mut reader = fs::read_dir(dir)
        .await
        .with_context(|| format!("not a directory: {}", dir.display()))?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let meta = entry.metadata().await?;
        entries.push((
            entry.file_name().to_string_lossy().into_owned(),
            meta.is_dir(),
            meta.len(),
        ));
    }
    entries.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then_with(|| a.0.to_lowercase().cmp(&b.0.to_lowercase()))
    });
    Ok(entries)
}

#[async_trait]
impl ToolHandler for ListDirectoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "list_directory",
            "List files and folders in a directory.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string", "description": "Directory path (default: working directory)"}},
                "required": []
            }),
        )
    }

    async fn call(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let raw = call
            .str_arg("path")
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(".");
        let dir = resolve_path(ctx, raw);
        let entries = list_entries(&dir).await?;

        let mut lines = vec![format!("{} ({} items):", dir.display(), entries.len())];
        lines.extend(
            entries
                .iter()
                .filter(|(name, _, _)| self.show_hidden || !name.starts_with('.'))
                .take(self.limit)
                .map(|(name, is_dir, size)| {
                    if *is_dir {
                        format!("  [dir] {name}")
                    } else {
                        format!("  [file] {name} ({})", human_size(*size))
                    }
                }),
        );
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde_json::Map;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn call(name: &str, args: Value) -> ToolCall {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ToolCall::new(name, args, 1)
    }

    #[test]
    fn relative_paths_resolve_against_working_dir() {
        let ctx = ToolContext::new("/work");
        assert_eq!(resolve_path(&ctx, "src/main.rs"), PathBuf::from("/work/src/main.rs"));
        assert_eq!(resolve_path(&ctx, "/etc/hosts"), PathBuf::from("/etc/hosts"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolve_path(&ctx, "~/notes.txt"), home.join("notes.txt"));
        }
    }

    #[tokio::test]
    async fn write_then_read_with_line_range() -> Result<()> {
        let root = unique_test_root("aide-tools-fs");
        let ctx = ToolContext::new(&root);

        let written = WriteFileTool::write_file()
            .call(&ctx, &call("write_file", json!({"path": "nested/a.txt", "content": "one\ntwo\nthree\n"})))
            .await?;
        assert!(written.starts_with("File created at"));

        let ranged = ReadFileTool::numbered()
            .call(&ctx, &call("read_file", json!({"path": "nested/a.txt", "start_line": 2, "end_line": 3})))
            .await?;
        assert_eq!(ranged, "    2 | two\n    3 | three");

        let plain = ReadFileTool::plain()
            .call(&ctx, &call("read_file", json!({"path": "nested/a.txt"})))
            .await?;
        assert_eq!(plain, "one\ntwo\nthree\n");

        fs::remove_dir_all(&root).await?;
        Ok(())
    }

    #[tokio::test]
    async fn line_ranges_share_the_whole_file_cap() -> Result<()> {
        let root = unique_test_root("aide-tools-range-cap");
        fs::create_dir_all(&root).await?;
        let body: String = (1..=3000).map(|n| format!("line {n}\n")).collect();
        fs::write(root.join("big.txt"), body).await?;
        let ctx = ToolContext::new(&root);

        let ranged = ReadFileTool::numbered()
            .call(&ctx, &call("read_file", json!({"path": "big.txt", "start_line": 1, "end_line": 3000})))
            .await?;
        let whole = ReadFileTool::numbered()
            .call(&ctx, &call("read_file", json!({"path": "big.txt"})))
            .await?;
        assert_eq!(ranged, whole);
        assert_eq!(ranged.lines().count(), 2001);
        assert!(ranged.ends_with("... (1000 more lines)"));
        assert!(!ranged.contains("line 2001"));

        fs::remove_dir_all(&root).await?;
        Ok(())
    }

    #[tokio::test]
    async fn str_replace_requires_a_unique_match() -> Result<()> {
        let root = unique_test_root("aide-tools-replace");
        fs::create_dir_all(&root).await?;
        fs::write(root.join("lib.rs"), "let a = 1;\nlet b = 1;\n").await?;
        let ctx = ToolContext::new(&root);

        let ambiguous = StrReplaceTool
            .call(&ctx, &call("str_replace", json!({"path": "lib.rs", "old_str": "= 1", "new_str": "= 2"})))
            .await;
        assert!(ambiguous.is_err());

        StrReplaceTool
            .call(&ctx, &call("str_replace", json!({"path": "lib.rs", "old_str": "let b = 1", "new_str": "let b = 2"})))
            .await?;
        assert_eq!(fs::read_to_string(root.join("lib.rs")).await?, "let a = 1;\nlet b = 2;\n");

        fs::remove_dir_all(&root).await?;
        Ok(())
    }

    #[tokio::test]
    async fn listing_puts_directories_first() -> Result<()> {
        let root = unique_test_root("aide-tools-list");
        fs::create_dir_all(root.join("zeta")).await?;
        fs::write(root.join("alpha.txt"), "hello").await?;
        fs::write(root.join(".hidden"), "").await?;
        let ctx = ToolContext::new(&root);

        let listing = ListDirectoryTool::new(100, false)
            .call(&ctx, &call("list_directory", json!({})))
            .await?;
        let lines: Vec<_> = listing.lines().collect();
        assert!(lines[0].ends_with("(3 items):"));
        assert_eq!(lines[1], "  [dir] zeta");
        assert_eq!(lines[2], "  [file] alpha.txt (5B)");
        assert_eq!(lines.len(), 3);

        fs::remove_dir_all(&root).await?;
        Ok(())
    }
}
