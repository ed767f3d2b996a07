//! JSONL audit sink for security-relevant bus traffic.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aide_protocol::{Event, event_types};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::{EventBus, EventHandler};

/// Event types recorded by [`AuditLog::install`].
pub const AUDITED_EVENTS: &[&str] = &[
    event_types::SYSTEM_COMMAND,
    event_types::COMMAND_RESPONSE,
    event_types::TOOL_EXECUTING,
    event_types::TOOL_COMPLETED,
    event_types::SYSTEM_READY,
    event_types::SYSTEM_MODULE_ERROR,
    event_types::SYSTEM_LOCKED,
    event_types::SYSTEM_UNLOCKED,
];

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub backups: usize,
    pub max_value_chars: usize,
}

impl AuditConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: 5 * 1024 * 1024,
            backups: 3,
            max_value_chars: 300,
        }
    }
}

#[derive(Debug)]
pub struct AuditLog {
    config: AuditConfig,
    write_lock: tokio::sync::Mutex<()>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Subscribes this sink to every audited event type.
    pub fn install(self: &Arc<Self>, bus: &EventBus) {
        for event_type in AUDITED_EVENTS {
            bus.subscribe(*event_type, self.clone());
        }
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn record(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(&json!({
            "at": event.timestamp,
            "type": event.event_type,
            "payload": sanitize(&event.payload, self.config.max_value_chars),
        }))?;

        if let Some(parent) = self.config.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create audit dir {parent:?}"))?;
        }

        let _guard = self.write_lock.lock().await;
        self.rotate_if_needed().await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .await
            .with_context(|| format!("failed to open audit log {:?}", self.config.path))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn rotate_if_needed(&self) -> Result<()> {
        let size = match fs::metadata(&self.config.path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.config.max_bytes {
            return Ok(());
        }

        if self.config.backups == 0 {
            fs::remove_file(&self.config.path).await?;
            return Ok(());
        }

        let oldest = self.backup_path(self.config.backups);
        if fs::try_exists(&oldest).await.unwrap_or(false) {
            fs::remove_file(&oldest).await?;
        }
        for index in (1..self.config.backups).rev() {
            let from = self.backup_path(index);
            if fs::try_exists(&from).await.unwrap_or(false) {
                fs::rename(&from, self.backup_path(index + 1)).await?;
            }
        }
        fs::rename(&self.config.path, self.backup_path(1))
            .await
            .context("failed to rotate audit log")?;
        debug!(size, "audit log rotated");
        Ok(())
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.config.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }
}

#[async_trait]
impl EventHandler for AuditLog {
    async fn handle(&self, event: &Event) -> Result<()> {
        self.record(event).await
    }
}

fn sanitize(payload: &Map<String, Value>, max_chars: usize) -> Map<String, Value> {
    payload
        .iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), truncate_value(value, max_chars)))
        .collect()
}

fn truncate_value(value: &Value, max_chars: usize) -> Value {
    match value {
        Value::String(text) if text.chars().count() > max_chars => {
            Value::String(text.chars().take(max_chars).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use aide_protocol::payload;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    async fn read_lines(path: &Path) -> Result<Vec<Value>> {
        let raw = fs::read_to_string(path).await?;
        raw.lines()
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    #[tokio::test]
    async fn audited_events_are_sanitized_and_appended() -> Result<()> {
        let root = unique_test_root("aide-audit");
        let log = Arc::new(AuditLog::new(AuditConfig::new(root.join("audit.log"))));
        let bus = EventBus::default();
        log.install(&bus);

        let long = "x".repeat(500);
        bus.publish(
            event_types::SYSTEM_COMMAND,
            payload(json!({"command": long, "source": "cli", "_internal": true})),
        )
        .await;
        bus.publish("not.audited", payload(json!({"a": 1}))).await;

        let lines = read_lines(log.path()).await?;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "system.command");
        let recorded = &lines[0]["payload"];
        assert_eq!(recorded["source"], "cli");
        assert_eq!(recorded["command"].as_str().map(str::len), Some(300));
        assert!(recorded.get("_internal").is_none());
        assert!(recorded.get("_event_type").is_none());

        fs::remove_dir_all(&root).await?;
        Ok(())
    }

    #[tokio::test]
    async fn oversized_log_rotates_into_numbered_backups() -> Result<()> {
        let root = unique_test_root("aide-audit-rotate");
        let mut config = AuditConfig::new(root.join("audit.log"));
        config.max_bytes = 64;
        config.backups = 2;
        let log = AuditLog::new(config);

        for index in 0..6 {
            let event = Event::new(
                event_types::TOOL_COMPLETED,
                payload(json!({"tool": "read_file", "index": index, "pad": "y".repeat(80)})),
            );
            log.record(&event).await?;
        }

        assert!(fs::try_exists(root.join("audit.log")).await?);
        assert!(fs::try_exists(root.join("audit.log.1")).await?);
        assert!(fs::try_exists(root.join("audit.log.2")).await?);
        assert!(!fs::try_exists(root.join("audit.log.3")).await?);

        let current = read_lines(&root.join("audit.log")).await?;
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["payload"]["index"], 5);

        fs::remove_dir_all(&root).await?;
        Ok(())
    }
}
