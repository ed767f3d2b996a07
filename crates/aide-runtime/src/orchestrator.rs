//! Command orchestrator: turns a `(command, source)` pair into a reply.
//!
//! Each turn runs the same pipeline: rate limit, inactivity lock, history,
//! model routing, then bounded tool-calling rounds against the backend.
//! Turns are serialized; tool calls inside a round run strictly in order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aide_events::EventBus;
use aide_memory::FactStore;
use aide_policy::{AutoLock, ConfirmationQueue, PendingConfirmation, RateLimiter, classify};
use aide_protocol::{
    BackendError, ChatBackend, ChatMessage, ChatRequest, CommandError, ConfirmationId,
    SafetyTier, ToolCall, event_types, payload,
};
use aide_tools::{SHELL_TOOL, ToolContext, ToolRegistry};
use chrono::Local;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::prompt::assistant_prompt;
use crate::routing::{ModelRoute, fallback_reply, route_model, strip_leaked_tool_json};

pub const TIMEOUT_REPLY: &str = "Sorry, that took too long. Try again?";
pub const ROUNDS_EXHAUSTED_REPLY: &str = "I completed the actions.";
pub const EMPTY_REPLY: &str = "Done.";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Reasoning model, offered the tool catalog.
    pub model: String,
    /// Lightweight model for canned short utterances.
    pub fast_model: String,
    pub max_history: usize,
    pub max_tool_rounds: u32,
    pub rate_window: Duration,
    pub rate_max_calls: usize,
    pub auto_lock_timeout: Duration,
    /// Sources that must re-identify once the lock engages.
    pub restricted_sources: Vec<String>,
    pub working_dir: PathBuf,
    pub tool_timeout: Duration,
    pub confirmation_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_owned(),
            fast_model: "qwen2.5:1.5b".to_owned(),
            max_history: 20,
            max_tool_rounds: 5,
            rate_window: Duration::from_secs(60),
            rate_max_calls: 20,
            auto_lock_timeout: Duration::from_secs(300),
            restricted_sources: vec!["voice".to_owned()],
            working_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            tool_timeout: Duration::from_secs(60),
            confirmation_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The backend produced a final reply.
    Completed,
    RoundsExhausted,
    RateLimited,
    Locked,
    /// The backend was unreachable or failed; a canned reply was used.
    Fallback,
    BackendTimeout,
    /// A pending confirmation was approved and run.
    Confirmed,
    Denied,
    /// The confirmation id was unknown or expired.
    ConfirmationMissing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub text: String,
    pub status: TurnStatus,
}

impl TurnOutcome {
    fn new(text: impl Into<String>, status: TurnStatus) -> Self {
        Self {
            text: text.into(),
            status,
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: EventBus,
    backend: Arc<dyn ChatBackend>,
    registry: ToolRegistry,
    memory: Option<Arc<FactStore>>,
    rate_limiter: RateLimiter,
    auto_lock: AutoLock,
    confirmations: ConfirmationQueue,
    history: Mutex<VecDeque<ChatMessage>>,
    turn: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        bus: EventBus,
        backend: Arc<dyn ChatBackend>,
        registry: ToolRegistry,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_window, config.rate_max_calls);
        let auto_lock = AutoLock::new(config.auto_lock_timeout, config.restricted_sources.clone());
        let confirmations = ConfirmationQueue::new(config.confirmation_ttl);
        Self {
            config,
            bus,
            backend,
            registry,
            memory: None,
            rate_limiter,
            auto_lock,
            confirmations,
            history: Mutex::new(VecDeque::new()),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Facts from this store are folded into the system prompt each turn.
    pub fn with_memory(mut self, memory: Arc<FactStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn pending_confirmations(&self) -> Vec<PendingConfirmation> {
        self.confirmations.pending()
    }

    pub fn is_locked(&self) -> bool {
        self.auto_lock.is_locked()
    }

    /// Engages the inactivity lock once the timeout has passed. Returns true
    /// on the transition and publishes `system.locked`.
    pub async fn check_auto_lock(&self) -> bool {
        if !self.auto_lock.refresh() {
            return false;
        }
        self.bus
            .publish(
                event_types::SYSTEM_LOCKED,
                payload(json!({"timeout_secs": self.auto_lock.timeout().as_secs()})),
            )
            .await;
        true
    }

    /// Processes one command. Always ends by publishing `command.response`.
    #[instrument(skip(self, command), fields(chars = command.len()))]
    pub async fn handle(&self, command: &str, source: &str) -> TurnOutcome {
        let _turn = self.turn.lock().await;
        let outcome = self.run_turn(command, source).await;
        info!(status = ?outcome.status, chars = outcome.text.len(), "turn finished");
        self.publish_response(&outcome.text, command, source).await;
        outcome
    }

    /// Resolves a pending destructive command. Approval re-checks the blocked
    /// list before running; denial drops the command.
    #[instrument(skip(self, id), fields(confirmation = %id))]
    pub async fn confirm(&self, id: &ConfirmationId, approved: bool) -> TurnOutcome {
        let _turn = self.turn.lock().await;
        let Some(pending) = self.confirmations.take(id) else {
            warn!("confirmation unknown or expired");
            let outcome = TurnOutcome::new(
                "That confirmation has expired or was already handled.",
                TurnStatus::ConfirmationMissing,
            );
            self.publish_confirmation_response(&outcome.text, id, None).await;
            return outcome;
        };

        let outcome = if !approved {
            info!(command = %pending.command, "destructive command denied");
            TurnOutcome::new(
                format!("Okay, I won't run `{}`.", pending.command),
                TurnStatus::Denied,
            )
        } else if classify(&pending.command) == SafetyTier::Blocked {
            warn!(command = %pending.command, "approved command is on the blocked list");
            TurnOutcome::new(
                CommandError::SafetyViolation {
                    command: pending.command.clone(),
                }
                .to_string(),
                TurnStatus::Denied,
            )
        } else {
            info!(command = %pending.command, "running confirmed command");
            let mut arguments = Map::new();
            arguments.insert("command".to_owned(), Value::String(pending.command.clone()));
            let call = ToolCall::new(SHELL_TOOL, arguments, 0);
            let (output, _) = self.execute_tool(&call).await;
            TurnOutcome::new(
                format!("Ran `{}`:\n{}", pending.command, output),
                TurnStatus::Confirmed,
            )
        };

        self.push_history(ChatMessage::assistant(outcome.text.clone()));
        self.publish_confirmation_response(&outcome.text, id, Some(&pending))
            .await;
        outcome
    }

    async fn run_turn(&self, command: &str, source: &str) -> TurnOutcome {
        if let Err(rejection) = self.rate_limiter.check(source) {
            return TurnOutcome::new(rejection.to_string(), TurnStatus::RateLimited);
        }

        self.check_auto_lock().await;
        match self.auto_lock.admit(source) {
            Err(rejection) => {
                return TurnOutcome::new(rejection.to_string(), TurnStatus::Locked);
            }
            Ok(admission) if admission.unlocked => {
                self.bus
                    .publish(event_types::SYSTEM_UNLOCKED, payload(json!({"source": source})))
                    .await;
            }
            Ok(_) => {}
        }

        self.push_history(ChatMessage::user(command));

        let route = route_model(command);
        let model = match route {
            ModelRoute::Fast => &self.config.fast_model,
            ModelRoute::Full => &self.config.model,
        };
        debug!(?route, model = %model, "model routed");

        let memory_context = match &self.memory {
            Some(memory) => memory.context_for_prompt().await,
            None => String::new(),
        };
        let mut messages = vec![ChatMessage::system(assistant_prompt(
            &memory_context,
            Local::now(),
        ))];
        messages.extend(self.history());

        for round in 1..=self.config.max_tool_rounds {
            let mut request = ChatRequest::new(model.clone(), messages.clone());
            if route == ModelRoute::Full {
                request = request.with_tools(self.registry.definitions());
            }

            let response = match self.backend.chat(request).await {
                Ok(response) => response,
                Err(BackendError::Timeout(limit)) => {
                    warn!(timeout_secs = limit.as_secs(), round, "backend timed out");
                    return TurnOutcome::new(TIMEOUT_REPLY, TurnStatus::BackendTimeout);
                }
                Err(error) => {
                    warn!(%error, round, "backend failed, using fallback reply");
                    return TurnOutcome::new(
                        fallback_reply(command, Local::now()),
                        TurnStatus::Fallback,
                    );
                }
            };

            if response.message.tool_calls.is_empty() {
                let mut reply = strip_leaked_tool_json(&response.message.content);
                if reply.trim().is_empty() {
                    reply = EMPTY_REPLY.to_owned();
                }
                self.push_history(ChatMessage::assistant(reply.clone()));
                return TurnOutcome::new(reply, TurnStatus::Completed);
            }

            let wire_calls = response.message.tool_calls.clone();
            messages.push(response.message);
            for wire in &wire_calls {
                let output = match ToolCall::from_wire(wire, round) {
                    Ok(call) => self.run_tool_call(&call, source).await,
                    Err(malformed) => {
                        warn!(tool = %wire.function.name, round, "malformed tool arguments");
                        self.publish_tool_executing(&wire.function.name, round).await;
                        self.publish_tool_completed(&wire.function.name, round, false)
                            .await;
                        malformed.to_string()
                    }
                };
                messages.push(ChatMessage::tool(output));
            }
        }

        info!(
            rounds = self.config.max_tool_rounds,
            "tool round budget exhausted"
        );
        TurnOutcome::new(ROUNDS_EXHAUSTED_REPLY, TurnStatus::RoundsExhausted)
    }

    /// Runs one tool call, gating shell commands by safety tier.
    async fn run_tool_call(&self, call: &ToolCall, source: &str) -> String {
        self.publish_tool_executing(&call.name, call.round).await;

        let (output, success) = if call.name == SHELL_TOOL {
            let command = call.str_arg("command").unwrap_or_default();
            match classify(command) {
                SafetyTier::Blocked => {
                    warn!(command, "blocked shell command refused");
                    let refusal = CommandError::SafetyViolation {
                        command: command.to_owned(),
                    };
                    (refusal.to_string(), false)
                }
                SafetyTier::Destructive => {
                    let pending = self.confirmations.enqueue(command, source);
                    info!(command, confirmation = %pending.id, "destructive command awaiting confirmation");
                    self.publish_confirmation_request(&pending).await;
                    let gated = CommandError::ConfirmationRequired {
                        command: command.to_owned(),
                    };
                    (gated.to_string(), false)
                }
                SafetyTier::Safe => self.execute_tool(call).await,
            }
        } else {
            self.execute_tool(call).await
        };

        self.publish_tool_completed(&call.name, call.round, success)
            .await;
        output
    }

    async fn execute_tool(&self, call: &ToolCall) -> (String, bool) {
        let ctx = ToolContext::new(&self.config.working_dir).with_timeout(self.config.tool_timeout);
        let report = self.registry.execute(&ctx, call).await;
        debug!(
            tool = %report.tool,
            success = report.success,
            duration_ms = report.duration_ms as u64,
            "tool executed"
        );
        (report.output, report.success)
    }

    fn push_history(&self, message: ChatMessage) {
        let mut history = self.history.lock();
        history.push_back(message);
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    async fn publish_tool_executing(&self, name: &str, round: u32) {
        self.bus
            .publish(
                event_types::TOOL_EXECUTING,
                payload(json!({"name": name, "round": round})),
            )
            .await;
    }

    async fn publish_tool_completed(&self, name: &str, round: u32, success: bool) {
        self.bus
            .publish(
                event_types::TOOL_COMPLETED,
                payload(json!({"name": name, "round": round, "success": success})),
            )
            .await;
    }

    async fn publish_confirmation_request(&self, pending: &PendingConfirmation) {
        let text = format!(
            "I need to run a potentially destructive command: `{}`. Please confirm to proceed.",
            pending.command
        );
        self.bus
            .publish(
                event_types::COMMAND_RESPONSE,
                payload(json!({
                    "text": text,
                    "command": event_types::CONFIRMATION_REQUEST,
                    "source": pending.source,
                    "awaiting_confirmation": true,
                    "pending_command": pending.command,
                    "confirmation_id": pending.id,
                })),
            )
            .await;
    }

    async fn publish_response(&self, text: &str, command: &str, source: &str) {
        self.bus
            .publish(
                event_types::COMMAND_RESPONSE,
                payload(json!({"text": text, "command": command, "source": source})),
            )
            .await;
    }

    /// Confirmation replies carry the id so clients can match them even when
    /// the pending command is gone.
    async fn publish_confirmation_response(
        &self,
        text: &str,
        id: &ConfirmationId,
        pending: Option<&PendingConfirmation>,
    ) {
        let (command, source) = pending.map_or(("", "unknown"), |pending| {
            (pending.command.as_str(), pending.source.as_str())
        });
        self.bus
            .publish(
                event_types::COMMAND_RESPONSE,
                payload(json!({
                    "text": text,
                    "command": command,
                    "source": source,
                    "confirmation_id": id,
                })),
            )
            .await;
    }
}
