//! Tool types: catalog definitions, resolved calls, and the shell safety tier.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CommandError;
use crate::message::WireToolCall;

/// A named, schema-described capability offered to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema-like `{"type": "object", "properties": ..., "required": [...]}`.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool invocation requested by the backend in a given round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub round: u32,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>, round: u32) -> Self {
        Self {
            name: name.into(),
            arguments,
            round,
        }
    }

    /// Resolve a wire call. String arguments are parsed as JSON; anything
    /// that does not end up as an object is malformed. Missing arguments
    /// resolve to an empty map.
    pub fn from_wire(wire: &WireToolCall, round: u32) -> Result<Self, CommandError> {
        let name = wire.function.name.clone();
        let malformed = |message: String| CommandError::MalformedToolArguments {
            tool: name.clone(),
            message,
        };

        let arguments = match &wire.function.arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            Value::String(raw) if raw.trim().is_empty() => Map::new(),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(other) => return Err(malformed(format!("expected an object, got {other}"))),
                Err(error) => return Err(malformed(error.to_string())),
            },
            other => return Err(malformed(format!("expected an object, got {other}"))),
        };

        Ok(Self::new(name.clone(), arguments, round))
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// Classification of a shell command governing whether it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyTier {
    Safe,
    Destructive,
    Blocked,
}

impl std::fmt::Display for SafetyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Safe => "safe",
            Self::Destructive => "destructive",
            Self::Blocked => "blocked",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FunctionCall;
    use serde_json::json;

    fn wire(arguments: Value) -> WireToolCall {
        WireToolCall {
            function: FunctionCall {
                name: "run_shell_command".into(),
                arguments,
            },
        }
    }

    #[test]
    fn object_and_string_arguments_resolve_to_the_same_call() {
        let from_object = ToolCall::from_wire(&wire(json!({"command": "ls"})), 1).unwrap();
        let from_string = ToolCall::from_wire(&wire(json!("{\"command\": \"ls\"}")), 1).unwrap();
        assert_eq!(from_object, from_string);
        assert_eq!(from_object.str_arg("command"), Some("ls"));
    }

    #[test]
    fn unparseable_arguments_are_malformed() {
        let error = ToolCall::from_wire(&wire(json!("{not json")), 2).unwrap_err();
        assert!(matches!(error, CommandError::MalformedToolArguments { .. }));
        assert!(error.to_string().starts_with("Error:"));
    }

    #[test]
    fn missing_arguments_resolve_to_empty_map() {
        let call = ToolCall::from_wire(&wire(Value::Null), 3).unwrap();
        assert!(call.arguments.is_empty());
        assert_eq!(call.round, 3);
    }
}
