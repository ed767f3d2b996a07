use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub const MAX_FACTS: usize = 200;
pub const DEFAULT_TTL_DAYS: u32 = 30;

/// Facts injected into the system prompt.
const PROMPT_FACTS: usize = 10;

fn default_ttl() -> Option<u32> {
    Some(DEFAULT_TTL_DAYS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub fact: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    /// `None` marks a permanent fact.
    #[serde(default = "default_ttl")]
    pub ttl_days: Option<u32>,
}

fn default_source() -> String {
    "user".to_owned()
}

impl Fact {
    /// Frequently recalled facts live longer: `ttl * (1 + accesses / 3)`.
    pub fn effective_ttl_days(&self) -> Option<f64> {
        self.ttl_days
            .map(|ttl| f64::from(ttl) * (1.0 + f64::from(self.access_count) / 3.0))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.effective_ttl_days() {
            Some(ttl) => (now - self.timestamp).num_days() as f64 > ttl,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    #[serde(default)]
    pub preferences: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryDocument {
    #[serde(default)]
    pub user: UserProfile,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub before: usize,
    pub after: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStats {
    pub total: usize,
    pub permanent: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.total == 0 {
            return write!(f, "Memory is empty.");
        }
        let day = |ts: Option<DateTime<Utc>>| {
            ts.map_or_else(|| "?".to_owned(), |ts| ts.format("%Y-%m-%d").to_string())
        };
        write!(
            f,
            "Total facts: {} (permanent: {}), oldest: {}, newest: {}",
            self.total,
            self.permanent,
            day(self.oldest),
            day(self.newest)
        )
    }
}

/// JSON-file backed fact memory. Every mutation is persisted with an
/// atomic write before returning.
#[derive(Debug)]
pub struct FactStore {
    path: PathBuf,
    document: Mutex<MemoryDocument>,
}

impl FactStore {
    /// Loads `path`, dropping expired facts. A missing or unreadable file
    /// starts an empty memory.
    #[instrument]
    pub async fn open(path: PathBuf) -> Result<Self> {
        let mut document = match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<MemoryDocument>(&raw) {
                Ok(document) => document,
                Err(error) => {
                    warn!(error = %error, "memory file unreadable, starting empty");
                    MemoryDocument::default()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => MemoryDocument::default(),
            Err(error) => {
                return Err(error).with_context(|| format!("failed reading memory file {path:?}"));
            }
        };

        let removed = prune(&mut document.facts, Utc::now());
        info!(facts = document.facts.len(), removed, "memory loaded");
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> MemoryDocument {
        self.document.lock().await.clone()
    }

    pub async fn remember(
        &self,
        fact: impl Into<String>,
        source: impl Into<String>,
        ttl_days: Option<u32>,
    ) -> Result<Fact> {
        let entry = Fact {
            fact: fact.into(),
            timestamp: Utc::now(),
            source: source.into(),
            access_count: 0,
            last_accessed: None,
            ttl_days,
        };
        let mut document = self.document.lock().await;
        document.facts.push(entry.clone());
        self.persist(&mut document).await?;
        Ok(entry)
    }

    /// Case-insensitive substring match; an empty query matches everything.
    /// Matched facts get their access counters bumped.
    pub async fn recall(&self, query: &str) -> Result<Vec<Fact>> {
        let needle = query.trim().to_lowercase();
        let now = Utc::now();
        let mut document = self.document.lock().await;
        let mut matched = Vec::new();
        for fact in document
            .facts
            .iter_mut()
            .filter(|fact| needle.is_empty() || fact.fact.to_lowercase().contains(&needle))
        {
            fact.access_count = fact.access_count.saturating_add(1);
            fact.last_accessed = Some(now);
            matched.push(fact.clone());
        }
        if !matched.is_empty() {
            self.persist(&mut document).await?;
        }
        Ok(matched)
    }

    pub async fn cleanup(&self) -> Result<CleanupReport> {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut document = self.document.lock().await;
        let before = document.facts.len();
        let removed = prune(&mut document.facts, now);
        if removed > 0 {
            self.persist(&mut document).await?;
        }
        Ok(CleanupReport {
            removed,
            before,
            after: document.facts.len(),
        })
    }

    pub async fn stats(&self) -> MemoryStats {
        let document = self.document.lock().await;
        MemoryStats {
            total: document.facts.len(),
            permanent: document.facts.iter().filter(|f| f.ttl_days.is_none()).count(),
            oldest: document.facts.iter().map(|f| f.timestamp).min(),
            newest: document.facts.iter().map(|f| f.timestamp).max(),
        }
    }

    pub async fn set_user_name(&self, name: impl Into<String>) -> Result<()> {
        let mut document = self.document.lock().await;
        document.user.name = Some(name.into());
        self.persist(&mut document).await
    }

    pub async fn set_preference(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let mut document = self.document.lock().await;
        document.user.preferences.insert(key.into(), value.into());
        self.persist(&mut document).await
    }

    pub async fn clear(&self) -> Result<()> {
        let mut document = self.document.lock().await;
        *document = MemoryDocument::default();
        self.persist(&mut document).await
    }

    /// Short block describing the user for the system prompt; empty when
    /// nothing is known.
    pub async fn context_for_prompt(&self) -> String {
        let document = self.document.lock().await;
        let mut parts = Vec::new();
        if let Some(name) = &document.user.name {
            parts.push(format!("The user's name is {name}."));
        }
        if !document.user.preferences.is_empty() {
            let prefs: Vec<String> = document
                .user
                .preferences
                .iter()
                .map(|(key, value)| format!("{key}: {value}"))
                .collect();
            parts.push(format!("User preferences: {}", prefs.join(", ")));
        }
        if !document.facts.is_empty() {
            let skip = document.facts.len().saturating_sub(PROMPT_FACTS);
            let recent: Vec<String> = document.facts[skip..]
                .iter()
                .map(|fact| format!("- {}", fact.fact))
                .collect();
            parts.push(format!("Things you remember:\n{}", recent.join("\n")));
        }
        parts.join("\n")
    }

    async fn persist(&self, document: &mut MemoryDocument) -> Result<()> {
        prune(&mut document.facts, Utc::now());
        if document.facts.len() > MAX_FACTS {
            let excess = document.facts.len() - MAX_FACTS;
            document.facts.drain(..excess);
        }
        document.last_updated = Some(Utc::now());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create memory dir {parent:?}"))?;
        }
        let payload = serde_json::to_string_pretty(document)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, payload)
            .await
            .with_context(|| format!("failed writing memory file {tmp:?}"))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed replacing memory file {:?}", self.path))?;
        debug!(facts = document.facts.len(), "memory persisted");
        Ok(())
    }
}

fn prune(facts: &mut Vec<Fact>, now: DateTime<Utc>) -> usize {
    let before = facts.len();
    facts.retain(|fact| !fact.is_expired_at(now));
    before - facts.len()
}
