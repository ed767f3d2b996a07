//! # aide-runtime: command turns and coding sessions
//!
//! Two consumers of the same backend and tool registry:
//!
//! - [`orchestrator`]: the assistant pipeline behind `system.command`. Rate
//!   limiting, inactivity lock, model routing, bounded tool rounds with shell
//!   safety gating and explicit confirmations.
//! - [`agent`] + [`session`]: the terminal coding agent, with persisted
//!   sessions, context accounting and summary compaction.
//!
//! [`routing`] and [`prompt`] hold the text helpers both share.

pub mod agent;
pub mod orchestrator;
pub mod prompt;
pub mod routing;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{
    Agent, AgentConfig, AgentEvent, AgentOutcome, AgentTurn, ApprovalRequest, Approver,
    AutoApprove, DenyAll,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, TurnOutcome, TurnStatus};
pub use prompt::{assistant_prompt, coding_prompt};
pub use routing::{ModelRoute, fallback_reply, route_model, strip_leaked_tool_json};
pub use session::{
    COMPACT_THRESHOLD, CompactionError, HistoryEntry, Session, SessionStore, SessionSummary,
    context_window_for,
};
