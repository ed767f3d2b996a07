//! Terminal coding agent: a session-backed tool loop with user approval for
//! anything that writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use aide_policy::classify;
use aide_protocol::{
    BackendError, ChatBackend, ChatMessage, ChatRequest, CommandError, Role, SafetyTier, ToolCall,
};
use aide_tools::{BASH_TOOL, ToolContext, ToolRegistry};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

use crate::session::{CompactionError, Session, SessionStore};
use crate::routing::strip_leaked_tool_json;

pub const ROUNDS_EXHAUSTED_REPLY: &str = "Completed.";

const WRITE_TOOL: &str = "write_file";
const EDIT_TOOL: &str = "str_replace";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_rounds: u32,
    pub tool_timeout: Duration,
    /// Compact automatically after a turn once the context is nearly full.
    pub auto_compact: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            tool_timeout: Duration::from_secs(60),
            auto_compact: true,
        }
    }
}

/// What the agent wants to do, shown to the approver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub tool: String,
    /// The shell command, or the path being written.
    pub subject: String,
    pub tier: Option<SafetyTier>,
}

#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> bool;
}

/// Approves everything that is not on the blocked list.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl Approver for DenyAll {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        false
    }
}

/// Progress notifications for a front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    ToolStarted { name: String, subject: String },
    ToolFinished { name: String, success: bool },
}

#[derive(Debug)]
pub enum AgentOutcome {
    Reply(String),
    /// The round budget ran out; carries the closing reply.
    RoundsExhausted(String),
    Interrupted,
    BackendFailed(BackendError),
}

#[derive(Debug)]
pub struct AgentTurn {
    pub outcome: AgentOutcome,
    pub tool_calls: usize,
    pub elapsed: Duration,
    pub compacted: bool,
}

pub struct Agent {
    backend: Arc<dyn ChatBackend>,
    registry: ToolRegistry,
    approver: Arc<dyn Approver>,
    store: SessionStore,
    session: Session,
    config: AgentConfig,
    interrupted: Arc<AtomicBool>,
    observer: Option<UnboundedSender<AgentEvent>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("session", &self.session.id)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        registry: ToolRegistry,
        approver: Arc<dyn Approver>,
        store: SessionStore,
        session: Session,
    ) -> Self {
        Self {
            backend,
            registry,
            approver,
            store,
            session,
            config: AgentConfig::default(),
            interrupted: Arc::new(AtomicBool::new(false)),
            observer: None,
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: UnboundedSender<AgentEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Swaps in another session, keeping the current system prompt.
    pub fn replace_session(&mut self, mut session: Session) {
        session.set_system_prompt(self.session.system_prompt().to_owned());
        self.session = session;
    }

    /// Setting the returned flag stops the loop before its next round.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub async fn save(&self) -> Result<()> {
        self.store.save(&self.session).await
    }

    pub async fn compact(&mut self, instructions: Option<&str>) -> Result<(), CompactionError> {
        self.session
            .compact(self.backend.as_ref(), &self.store, instructions)
            .await
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.session.clear();
        self.save().await
    }

    /// Runs one user turn to completion. Only tool-free replies and the user
    /// message are kept in the transcript; the session is saved afterwards.
    #[instrument(skip(self, input), fields(session = %self.session.id))]
    pub async fn run(&mut self, input: &str) -> Result<AgentTurn> {
        let started = Instant::now();
        self.interrupted.store(false, Ordering::SeqCst);
        self.session.add_message(Role::User, input);

        let mut messages = self.session.build_messages();
        let mut tool_calls = 0;
        let mut outcome = None;

        for round in 1..=self.config.max_rounds {
            if self.interrupted.swap(false, Ordering::SeqCst) {
                info!(round, "turn interrupted");
                outcome = Some(AgentOutcome::Interrupted);
                break;
            }

            let request = ChatRequest::new(self.session.model.clone(), messages.clone())
                .with_tools(self.registry.definitions());
            let response = match self.backend.chat(request).await {
                Ok(response) => response,
                Err(error) => {
                    warn!(%error, round, "backend call failed");
                    outcome = Some(AgentOutcome::BackendFailed(error));
                    break;
                }
            };
            self.session
                .update_tokens(response.prompt_eval_count, response.eval_count);

            if response.message.tool_calls.is_empty() {
                let mut reply = strip_leaked_tool_json(&response.message.content);
                if reply.trim().is_empty() {
                    reply = "Done.".to_owned();
                }
                self.session.add_message(Role::Assistant, reply.clone());
                outcome = Some(AgentOutcome::Reply(reply));
                break;
            }

            let wire_calls = response.message.tool_calls.clone();
            messages.push(response.message);
            for wire in &wire_calls {
                tool_calls += 1;
                let output = match ToolCall::from_wire(wire, round) {
                    Ok(call) => self.run_tool_call(&call).await,
                    Err(malformed) => malformed.to_string(),
                };
                messages.push(ChatMessage::tool(output));
            }
        }

        let outcome = outcome.unwrap_or_else(|| {
            info!(rounds = self.config.max_rounds, "round budget exhausted");
            AgentOutcome::RoundsExhausted(ROUNDS_EXHAUSTED_REPLY.to_owned())
        });

        self.save().await?;

        let mut compacted = false;
        if self.config.auto_compact && self.session.needs_compaction() {
            info!(usage = self.session.context_usage(), "auto-compacting session");
            match self.compact(None).await {
                Ok(()) => compacted = true,
                Err(error) => warn!(%error, "auto-compaction failed"),
            }
        }

        Ok(AgentTurn {
            outcome,
            tool_calls,
            elapsed: started.elapsed(),
            compacted,
        })
    }

    async fn run_tool_call(&self, call: &ToolCall) -> String {
        let subject = match call.name.as_str() {
            BASH_TOOL => call.str_arg("command"),
            _ => call.str_arg("path").or_else(|| call.str_arg("pattern")),
        }
        .unwrap_or_default()
        .to_owned();

        if let Some(refusal) = self.gate(call, &subject).await {
            self.notify(AgentEvent::ToolFinished {
                name: call.name.clone(),
                success: false,
            });
            return refusal;
        }

        self.notify(AgentEvent::ToolStarted {
            name: call.name.clone(),
            subject,
        });
        let ctx = ToolContext::new(&self.session.working_dir).with_timeout(self.config.tool_timeout);
        let report = self.registry.execute(&ctx, call).await;
        debug!(tool = %report.tool, success = report.success, "tool finished");
        self.notify(AgentEvent::ToolFinished {
            name: call.name.clone(),
            success: report.success,
        });
        report.output
    }

    /// Returns the refusal text when the call must not run.
    async fn gate(&self, call: &ToolCall, subject: &str) -> Option<String> {
        let (tier, cancelled) = match call.name.as_str() {
            BASH_TOOL => match classify(subject) {
                SafetyTier::Blocked => {
                    warn!(command = subject, "blocked command refused");
                    return Some(
                        CommandError::SafetyViolation {
                            command: subject.to_owned(),
                        }
                        .to_string(),
                    );
                }
                SafetyTier::Destructive => {
                    (Some(SafetyTier::Destructive), "Command cancelled by user.")
                }
                SafetyTier::Safe => return None,
            },
            WRITE_TOOL => (None, "Write cancelled by user."),
            EDIT_TOOL => (None, "Edit cancelled by user."),
            _ => return None,
        };

        let request = ApprovalRequest {
            tool: call.name.clone(),
            subject: subject.to_owned(),
            tier,
        };
        if self.approver.approve(&request).await {
            None
        } else {
            info!(tool = %call.name, subject, "approval denied");
            Some(cancelled.to_owned())
        }
    }

    fn notify(&self, event: AgentEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }
}
