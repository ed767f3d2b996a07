//! Bus events and the well-known event type names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form event payload: a JSON object.
pub type EventPayload = Map<String, Value>;

/// Key the bus adds to every payload so handlers know which event fired.
pub const EVENT_TYPE_KEY: &str = "_event_type";

/// A published event. Never mutated after publish except for the
/// `_event_type` tag the bus adds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event, tagging the payload with its type.
    pub fn new(event_type: impl Into<String>, mut payload: EventPayload) -> Self {
        let event_type = event_type.into();
        payload.insert(
            EVENT_TYPE_KEY.to_owned(),
            Value::String(event_type.clone()),
        );
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }
}

/// Builds an [`EventPayload`] from a `serde_json::json!` object literal.
/// Non-object values produce an empty payload.
pub fn payload(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Event type names shared with external transports.
pub mod event_types {
    pub const SYSTEM_COMMAND: &str = "system.command";
    pub const SYSTEM_CONTROL: &str = "system.control";
    pub const SYSTEM_READY: &str = "system.ready";
    pub const SYSTEM_STATUS: &str = "system.status";
    pub const SYSTEM_STATS: &str = "system.stats";
    pub const SYSTEM_MODULE_ERROR: &str = "system.module_error";
    pub const SYSTEM_LOCKED: &str = "system.locked";
    pub const SYSTEM_UNLOCKED: &str = "system.unlocked";
    pub const COMMAND_RESPONSE: &str = "command.response";
    pub const COMMAND_CONFIRM: &str = "command.confirm";
    pub const TOOL_EXECUTING: &str = "tool.executing";
    pub const TOOL_COMPLETED: &str = "tool.completed";

    /// `command` value carried by confirmation requests on `command.response`.
    pub const CONFIRMATION_REQUEST: &str = "_confirmation_request";
}
