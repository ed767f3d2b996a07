//! Session context manager for the coding agent.
//!
//! A session is the persisted transcript plus bookkeeping (token counters,
//! compaction count). Context usage is estimated at four characters per
//! token against a per-model window; once usage crosses
//! [`COMPACT_THRESHOLD`] the transcript is replaced by a backend-written
//! summary.

use std::path::{Path, PathBuf};

use aide_protocol::{BackendError, ChatBackend, ChatMessage, ChatRequest, Role, SessionId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CONTEXT_WINDOW: usize = 128_000;
pub const COMPACT_THRESHOLD: f64 = 0.90;
const CHARS_PER_TOKEN: usize = 4;
const RECENT_SESSIONS: usize = 10;

const CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("llama3.2", 128_000),
    ("qwen2.5:1.5b", 32_000),
    ("qwen2.5:7b", 128_000),
    ("llama3.1:8b", 128_000),
    ("deepseek-coder-v2", 128_000),
];

const SUMMARY_PREFIX: &str = "Previous conversation summary:\n";
const SUMMARY_ACK: &str = "Understood. I have the full context from our previous conversation and I'm ready to continue.";

pub fn context_window_for(model: &str) -> usize {
    CONTEXT_WINDOWS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("nothing to compact")]
    EmptyTranscript,
    #[error("compaction request failed: {0}")]
    Backend(#[from] BackendError),
    #[error("backend returned an empty summary")]
    EmptySummary,
    #[error("compacted session could not be saved: {0:#}")]
    Persist(anyhow::Error),
}

/// A transcript entry kept in memory across compactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub model: String,
    pub working_dir: PathBuf,
    pub transcript: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    #[serde(default)]
    pub compaction_count: u32,
    #[serde(skip)]
    system_prompt: String,
    #[serde(skip)]
    full_history: Vec<HistoryEntry>,
}

impl Session {
    pub fn new(model: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            model: model.into(),
            working_dir: working_dir.into(),
            transcript: Vec::new(),
            created_at: now,
            last_active_at: now,
            total_input_tokens: 0,
            total_output_tokens: 0,
            compaction_count: 0,
            system_prompt: String::new(),
            full_history: Vec::new(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        let content = content.into();
        let now = Utc::now();
        self.full_history.push(HistoryEntry {
            role,
            content: content.clone(),
            at: now,
        });
        self.transcript.push(ChatMessage::new(role, content));
        self.last_active_at = now;
    }

    /// Everything added since this process started, including entries a
    /// compaction has since replaced.
    pub fn full_history(&self) -> &[HistoryEntry] {
        &self.full_history
    }

    /// System prompt followed by the transcript, ready for a backend call.
    pub fn build_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.transcript.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(self.transcript.iter().cloned());
        messages
    }

    /// `prompt_eval_count` already covers the whole prompt, so input is
    /// replaced while output accumulates.
    pub fn update_tokens(&mut self, prompt_eval_count: u64, eval_count: u64) {
        if prompt_eval_count > 0 {
            self.total_input_tokens = prompt_eval_count;
        }
        self.total_output_tokens += eval_count;
    }

    pub fn max_context(&self) -> usize {
        context_window_for(&self.model)
    }

    pub fn estimated_tokens(&self) -> usize {
        let chars: usize = self
            .transcript
            .iter()
            .map(|message| message.content.chars().count())
            .sum::<usize>()
            + self.system_prompt.chars().count();
        chars / CHARS_PER_TOKEN
    }

    /// Fraction of the model window in use, clamped to 1.0.
    pub fn context_usage(&self) -> f64 {
        let window = self.max_context().max(1);
        (self.estimated_tokens() as f64 / window as f64).min(1.0)
    }

    pub fn needs_compaction(&self) -> bool {
        self.context_usage() >= COMPACT_THRESHOLD
    }

    pub fn clear(&mut self) {
        self.transcript.clear();
        self.last_active_at = Utc::now();
    }

    /// Replaces the transcript with a summary exchange and persists it.
    ///
    /// On a backend failure or empty summary the session is left untouched.
    #[instrument(skip(self, backend, store, instructions), fields(session = %self.id, entries = self.transcript.len()))]
    pub async fn compact(
        &mut self,
        backend: &dyn ChatBackend,
        store: &SessionStore,
        instructions: Option<&str>,
    ) -> Result<(), CompactionError> {
        if self.transcript.is_empty() {
            return Err(CompactionError::EmptyTranscript);
        }

        let mut messages = self.build_messages();
        messages.push(ChatMessage::user(compaction_prompt(instructions)));
        let response = backend
            .chat(ChatRequest::new(self.model.clone(), messages))
            .await?;

        let summary = response.message.content.trim();
        if summary.is_empty() {
            warn!("compaction produced an empty summary");
            return Err(CompactionError::EmptySummary);
        }

        self.transcript = vec![
            ChatMessage::user(format!("{SUMMARY_PREFIX}{summary}")),
            ChatMessage::assistant(SUMMARY_ACK),
        ];
        self.compaction_count += 1;
        self.last_active_at = Utc::now();
        info!(
            compactions = self.compaction_count,
            summary_chars = summary.len(),
            "session compacted"
        );

        store.save(self).await.map_err(CompactionError::Persist)
    }
}

fn compaction_prompt(instructions: Option<&str>) -> String {
    let mut prompt = String::from(
        "Summarize our conversation so far so the work can continue from the summary alone. Preserve:\n\
         1. Files that were created or modified, with their paths\n\
         2. Decisions that were made and why\n\
         3. Status of the current task and what remains open\n\
         4. Errors encountered and how they were fixed\n\
         5. Code patterns and conventions in use\n\
         Be concise but keep every detail needed to continue.",
    );
    if let Some(instructions) = instructions.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("\n\nAdditional focus: ");
        prompt.push_str(instructions);
    }
    prompt
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub working_dir: PathBuf,
    pub last_active_at: DateTime<Utc>,
    pub messages: usize,
}

/// One pretty-printed JSON file per session under a directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids name a file directly inside the store directory.
    fn path_for(&self, id: &SessionId) -> Result<PathBuf> {
        let raw = id.as_str();
        if raw.is_empty() || raw.contains(['/', '\\', '\0']) || raw.contains("..") {
            anyhow::bail!("invalid session id {raw:?}");
        }
        Ok(self.dir.join(format!("{raw}.json")))
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(&session.id)?;
        let body = serde_json::to_string_pretty(session).context("failed to encode session")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        debug!(session = %session.id, path = %path.display(), "session saved");
        Ok(())
    }

    /// `Ok(None)` when no session with this id was saved.
    pub async fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let path = self.path_for(id)?;
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let session = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(session))
    }

    /// The most recently active sessions, newest first. Unreadable files are
    /// skipped.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to list {}", self.dir.display()));
            }
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<Session>(&raw).map_err(Into::into));
            match parsed {
                Ok(session) => summaries.push(SessionSummary {
                    id: session.id,
                    working_dir: session.working_dir,
                    last_active_at: session.last_active_at,
                    messages: session.transcript.len(),
                }),
                Err(error) => warn!(path = %path.display(), %error, "skipping unreadable session"),
            }
        }

        summaries.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        summaries.truncate(RECENT_SESSIONS);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::testing::{ScriptedBackend, unique_test_root};

    fn filled_session(model: &str, chars: usize) -> Session {
        let mut session = Session::new(model, "/work/project");
        session.set_system_prompt("You are a coding agent.");
        session.add_message(Role::User, "x".repeat(chars));
        session.add_message(Role::Assistant, "ok");
        session
    }

    #[test]
    fn usage_uses_the_model_window_and_clamps() {
        let session = filled_session("qwen2.5:1.5b", 4 * 16_000);
        assert!((session.context_usage() - 0.5).abs() < 0.01);
        assert!(!session.needs_compaction());

        let full = filled_session("unknown-model", 4 * 200_000);
        assert_eq!(full.max_context(), DEFAULT_CONTEXT_WINDOW);
        assert_eq!(full.context_usage(), 1.0);
        assert!(full.needs_compaction());
    }

    #[test]
    fn token_counters_replace_input_and_accumulate_output() {
        let mut session = Session::new("llama3.2", "/tmp");
        session.update_tokens(1200, 40);
        session.update_tokens(1500, 60);
        assert_eq!(session.total_input_tokens, 1500);
        assert_eq!(session.total_output_tokens, 100);
    }

    #[tokio::test]
    async fn compaction_leaves_two_entries_and_persists() -> Result<()> {
        let root = unique_test_root("aide-session-compact");
        let store = SessionStore::new(&root);
        let backend = ScriptedBackend::new().reply("Edited src/main.rs; tests still failing.");

        let mut session = filled_session("qwen2.5:1.5b", 4 * 30_000);
        session.add_message(Role::User, "keep going");
        assert!(session.needs_compaction());

        session
            .compact(&backend, &store, Some("the failing test"))
            .await?;
        assert_eq!(session.transcript.len(), 2);
        assert_eq!(session.compaction_count, 1);
        assert!(session.transcript[0].content.starts_with(SUMMARY_PREFIX));
        assert_eq!(session.transcript[1].role, Role::Assistant);
        assert_eq!(session.full_history().len(), 3);
        assert!(!session.needs_compaction());

        let request = &backend.requests()[0];
        let ask = &request.messages.last().expect("compaction prompt").content;
        assert!(ask.contains("Additional focus: the failing test"));

        let stored = store.load(&session.id).await?.expect("saved after compaction");
        assert_eq!(stored.compaction_count, 1);

        fs::remove_dir_all(&root).await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_compaction_leaves_session_untouched() {
        let store = SessionStore::new(unique_test_root("aide-session-nocompact"));
        let backend = ScriptedBackend::new()
            .reply("   ")
            .fail(|| BackendError::Unavailable("refused".into()));

        let mut session = filled_session("llama3.2", 100);
        let before = session.transcript.clone();

        let empty = session.compact(&backend, &store, None).await;
        assert!(matches!(empty, Err(CompactionError::EmptySummary)));
        let failed = session.compact(&backend, &store, None).await;
        assert!(matches!(failed, Err(CompactionError::Backend(_))));

        assert_eq!(session.transcript, before);
        assert_eq!(session.compaction_count, 0);
        assert!(!store.dir().exists());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_and_missing_is_none() -> Result<()> {
        let root = unique_test_root("aide-session-store");
        let store = SessionStore::new(&root);

        let mut session = filled_session("llama3.2", 10);
        session.compaction_count = 2;
        session.update_tokens(900, 30);
        store.save(&session).await?;

        let loaded = store.load(&session.id).await?.expect("session exists");
        assert_eq!(loaded.model, session.model);
        assert_eq!(loaded.transcript, session.transcript);
        assert_eq!(loaded.compaction_count, 2);
        assert_eq!(loaded.total_input_tokens, 900);
        assert_eq!(loaded.working_dir, session.working_dir);

        assert!(store.load(&SessionId::from("missing0")).await?.is_none());

        fs::remove_dir_all(&root).await?;
        Ok(())
    }

    #[tokio::test]
    async fn ids_that_escape_the_store_are_rejected() -> Result<()> {
        let root = unique_test_root("aide-session-ids");
        let store = SessionStore::new(root.join("sessions"));
        fs::create_dir_all(&root).await?;
        fs::write(root.join("outside.json"), "{}").await?;

        for id in ["../outside", "a/b", "a\\b", ".."] {
            assert!(store.load(&SessionId::from(id)).await.is_err(), "{id} was accepted");
        }
        let mut session = Session::new("llama3.2", "/work");
        session.id = SessionId::from("../escape");
        assert!(store.save(&session).await.is_err());
        assert!(!fs::try_exists(root.join("escape.json")).await?);

        fs::remove_dir_all(&root).await?;
        Ok(())
    }

    #[tokio::test]
    async fn list_returns_newest_first_and_caps_at_ten() -> Result<()> {
        let root = unique_test_root("aide-session-list");
        let store = SessionStore::new(&root);

        let base = Utc::now();
        for offset in 0..12 {
            let mut session = Session::new("llama3.2", "/work");
            session.add_message(Role::User, "hi");
            session.last_active_at = base + ChronoDuration::seconds(offset);
            store.save(&session).await?;
        }
        fs::write(root.join("broken.json"), "{not a session").await?;

        let listed = store.list().await?;
        assert_eq!(listed.len(), 10);
        assert_eq!(listed[0].last_active_at, base + ChronoDuration::seconds(11));
        assert!(listed.windows(2).all(|w| w[0].last_active_at >= w[1].last_active_at));
        assert_eq!(listed[0].messages, 1);

        fs::remove_dir_all(&root).await?;
        Ok(())
    }
}
