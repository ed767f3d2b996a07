//! System prompts for the assistant orchestrator and the coding agent.

use std::path::Path;

use aide_sandbox::truncate_chars;
use chrono::{DateTime, Local};
use tracing::debug;

/// Per-project notes picked up by the coding agent from its working directory.
pub const PROJECT_NOTES_FILE: &str = "AIDE.md";
pub const PROJECT_NOTES_MAX_CHARS: usize = 4000;

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_owned())
}

fn home_dir() -> String {
    dirs::home_dir()
        .map(|home| home.display().to_string())
        .unwrap_or_else(|| "~".to_owned())
}

pub fn assistant_prompt(memory_context: &str, now: DateTime<Local>) -> String {
    let mut prompt = format!(
        "You are a local desktop assistant with direct access to this computer through tools.\n\
         Platform: {platform}. User: {user}. Home directory: {home}.\n\
         Current time: {time}. Today is {date}.\n\n\
         Guidelines:\n\
         - Answer briefly; replies may be read aloud.\n\
         - Use tools for anything about files, the shell, the web or the weather instead of guessing.\n\
         - If a tool result says CONFIRMATION REQUIRED, tell the user what you intend to do and wait.\n\
         - If a tool result says BLOCKED, explain that the command must be run manually.\n\
         - Use remember when the user shares something worth keeping, recall before answering personal questions.",
        platform = std::env::consts::OS,
        user = current_user(),
        home = home_dir(),
        time = now.format("%I:%M %p"),
        date = now.format("%A, %B %d, %Y"),
    );
    if !memory_context.trim().is_empty() {
        prompt.push_str("\n\nWhat you know about the user:\n");
        prompt.push_str(memory_context.trim());
    }
    prompt
}

/// Builds the coding-agent prompt, appending `AIDE.md` from the working
/// directory when present.
pub async fn coding_prompt(working_dir: &Path) -> String {
    let mut prompt = format!(
        "You are a coding agent working in {cwd} on {platform}.\n\n\
         Guidelines:\n\
         - Read files before editing them; prefer str_replace for small edits.\n\
         - Keep edits minimal and explain what you changed.\n\
         - Use bash for builds, tests and git; destructive commands need user approval.\n\
         - When the task is done, reply with a short summary and no tool calls.",
        cwd = working_dir.display(),
        platform = std::env::consts::OS,
    );

    let notes_path = working_dir.join(PROJECT_NOTES_FILE);
    match tokio::fs::read_to_string(&notes_path).await {
        Ok(notes) if !notes.trim().is_empty() => {
            prompt.push_str("\n\nProject notes (");
            prompt.push_str(PROJECT_NOTES_FILE);
            prompt.push_str("):\n");
            prompt.push_str(&truncate_chars(notes.trim(), PROJECT_NOTES_MAX_CHARS));
        }
        Ok(_) => {}
        Err(error) => debug!(path = %notes_path.display(), %error, "no project notes"),
    }
    prompt
}
