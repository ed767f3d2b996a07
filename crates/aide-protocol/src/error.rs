//! Error taxonomy shared by the orchestrator, tools and backend client.

use std::time::Duration;

use thiserror::Error;

/// Failures that can end or shape a command turn.
///
/// The `Display` text of each variant is user-facing: rejections are returned
/// verbatim as the turn's response, and tool-level variants become the tool
/// result fed back to the model.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Slow down: too many commands from '{origin}'. Try again in {retry_after_secs}s.")]
    RateLimitExceeded {
        origin: String,
        retry_after_secs: u64,
    },
    #[error("I've been locked after a period of inactivity. Please re-identify before sending commands from '{origin}'.")]
    LockedRejection { origin: String },
    #[error(
        "BLOCKED: The command '{command}' is too dangerous to execute autonomously. This type of system-level operation requires manual execution."
    )]
    SafetyViolation { command: String },
    #[error(
        "CONFIRMATION REQUIRED: The command '{command}' could modify or delete data. I've asked the user to confirm. Tell them what you intend to do and why."
    )]
    ConfirmationRequired { command: String },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend timed out after {0}s")]
    BackendTimeout(u64),
    #[error("Error: {message}")]
    ToolExecutionFailure { tool: String, message: String },
    #[error("Error: malformed arguments for {tool}: {message}")]
    MalformedToolArguments { tool: String, message: String },
}

/// Failures of a single chat call to the text-generation backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection refused, DNS failure, or similar: the backend is not there.
    #[error("backend unreachable: {0}")]
    Unavailable(String),
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode backend response: {0}")]
    Decode(String),
}

impl From<BackendError> for CommandError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Timeout(limit) => CommandError::BackendTimeout(limit.as_secs()),
            other => CommandError::BackendUnavailable(other.to_string()),
        }
    }
}
