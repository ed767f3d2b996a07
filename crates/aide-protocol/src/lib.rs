//! # aide-protocol: shared contract for the aide workspace
//!
//! Types every other crate agrees on. Dependency-light on purpose: no tokio,
//! no HTTP client, so it can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: typed id wrappers (SessionId, ConfirmationId, SubscriptionId)
//! - [`event`]: bus `Event` and the well-known event type names
//! - [`message`]: chat transcript entries and wire tool calls
//! - [`tool`]: ToolDefinition, ToolCall, SafetyTier
//! - [`ports`]: the `ChatBackend` boundary to the text-generation service
//! - [`error`]: CommandError and BackendError taxonomies

pub mod error;
pub mod event;
pub mod ids;
pub mod message;
pub mod ports;
pub mod tool;

pub use error::{BackendError, CommandError};
pub use event::{EVENT_TYPE_KEY, Event, EventPayload, event_types, payload};
pub use ids::{ConfirmationId, SessionId, SubscriptionId};
pub use message::{ChatMessage, FunctionCall, Role, WireToolCall};
pub use ports::{ChatBackend, ChatRequest, ChatResponse, ToolSpec};
pub use tool::{SafetyTier, ToolCall, ToolDefinition};
