//! `aided chat`: the terminal coding agent.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use aide_backend::{BackendConfig, OllamaBackend};
use aide_protocol::{SafetyTier, SessionId};
use aide_runtime::{
    Agent, AgentEvent, AgentOutcome, ApprovalRequest, Approver, AutoApprove, Session,
    SessionStore, coding_prompt,
};
use aide_sandbox::LocalSandboxRunner;
use aide_tools::coding_catalog;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Args)]
pub struct ChatArgs {
    /// Continue a saved session by id.
    #[arg(long)]
    resume: Option<String>,
    /// Run writes and destructive commands without asking.
    #[arg(long)]
    auto_approve: bool,
    /// Working directory for the session (defaults to the current one).
    #[arg(long)]
    cwd: Option<PathBuf>,
}

type SharedInput = Arc<Mutex<Lines<BufReader<Stdin>>>>;

async fn read_line(input: &SharedInput, prompt: &str) -> Result<Option<String>> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    Ok(input.lock().await.next_line().await?)
}

/// Asks on the terminal; anything but `y`/`yes` is a no.
struct PromptApprover {
    input: SharedInput,
}

#[async_trait]
impl Approver for PromptApprover {
    async fn approve(&self, request: &ApprovalRequest) -> bool {
        let warning = match request.tier {
            Some(SafetyTier::Destructive) => " (destructive)",
            _ => "",
        };
        let prompt = format!("  allow {} `{}`{warning}? [y/N] ", request.tool, request.subject);
        match read_line(&self.input, &prompt).await {
            Ok(Some(answer)) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Ok(None) => false,
            Err(error) => {
                warn!(%error, "failed to read approval");
                false
            }
        }
    }
}

pub async fn run(args: ChatArgs, root: PathBuf, backend_url: String, model: String) -> Result<()> {
    let backend = Arc::new(
        OllamaBackend::new(BackendConfig {
            base_url: backend_url,
            ..BackendConfig::default()
        })
        .context("failed to configure backend client")?,
    );
    let store = SessionStore::new(root.join("sessions"));
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("failed to read current directory")?,
    };

    let mut session = match &args.resume {
        Some(id) => store
            .load(&SessionId::from(id.as_str()))
            .await?
            .ok_or_else(|| anyhow!("session {id} not found"))?,
        None => Session::new(model, &cwd),
    };
    session.set_system_prompt(coding_prompt(&session.working_dir).await);

    let input: SharedInput = Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let approver: Arc<dyn Approver> = if args.auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(PromptApprover {
            input: input.clone(),
        })
    };

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                AgentEvent::ToolStarted { name, subject } => println!("  -> {name} {subject}"),
                AgentEvent::ToolFinished { name, success: false } => println!("  !! {name} failed"),
                AgentEvent::ToolFinished { .. } => {}
            }
        }
    });

    let sandbox = Arc::new(LocalSandboxRunner::default());
    let mut agent = Agent::new(backend, coding_catalog(sandbox), approver, store, session)
        .with_observer(events_tx);

    let interrupt = agent.interrupt_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    println!(
        "aide chat | session {} | {} | {}",
        agent.session().id,
        agent.session().model,
        agent.session().working_dir.display()
    );
    println!("Type /help for commands.");

    loop {
        let Some(line) = read_line(&input, "\n> ").await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            if !slash_command(&mut agent, line).await? {
                break;
            }
            continue;
        }

        let turn = agent.run(line).await?;
        match turn.outcome {
            AgentOutcome::Reply(text) | AgentOutcome::RoundsExhausted(text) => println!("\n{text}"),
            AgentOutcome::Interrupted => println!("\n(interrupted)"),
            AgentOutcome::BackendFailed(error) => println!("\nBackend error: {error}"),
        }
        println!(
            "  [{} tool calls, {:.1}s, context {:.0}%]",
            turn.tool_calls,
            turn.elapsed.as_secs_f64(),
            agent.session().context_usage() * 100.0
        );
        if turn.compacted {
            println!("  [context compacted]");
        }
    }

    agent.save().await?;
    println!("Session saved: {}", agent.session().id);
    Ok(())
}

/// Returns false when the user asked to quit.
async fn slash_command(agent: &mut Agent, line: &str) -> Result<bool> {
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match head {
        "/quit" | "/exit" => return Ok(false),
        "/help" => {
            println!("  /compact [focus]  summarize the conversation to free context");
            println!("  /clear            forget the conversation");
            println!("  /context          context window usage");
            println!("  /model [name]     show or switch the model");
            println!("  /status           session details");
            println!("  /sessions         recent sessions");
            println!("  /resume <id>      switch to a saved session");
            println!("  /quit             save and exit");
        }
        "/compact" => {
            let focus = (!rest.is_empty()).then_some(rest);
            match agent.compact(focus).await {
                Ok(()) => println!("  Compacted (total compactions: {}).", agent.session().compaction_count),
                Err(error) => println!("  Compaction failed: {error}"),
            }
        }
        "/clear" => {
            agent.clear().await?;
            println!("  Conversation cleared.");
        }
        "/context" => {
            let session = agent.session();
            println!(
                "  ~{} / {} tokens ({:.1}%)",
                session.estimated_tokens(),
                session.max_context(),
                session.context_usage() * 100.0
            );
        }
        "/model" => {
            if rest.is_empty() {
                println!("  Model: {}", agent.session().model);
            } else {
                agent.session_mut().model = rest.to_owned();
                println!("  Switched to {rest}.");
            }
        }
        "/status" => {
            let session = agent.session();
            println!("  Session:     {}", session.id);
            println!("  Model:       {}", session.model);
            println!("  Directory:   {}", session.working_dir.display());
            println!("  Messages:    {}", session.transcript.len());
            println!(
                "  Tokens:      {} in / {} out",
                session.total_input_tokens, session.total_output_tokens
            );
            println!("  Compactions: {}", session.compaction_count);
        }
        "/sessions" => {
            let sessions = agent.store().list().await?;
            if sessions.is_empty() {
                println!("  No saved sessions.");
            }
            for summary in sessions {
                println!(
                    "  {}  {}  {} messages  {}",
                    summary.id,
                    summary.last_active_at.format("%Y-%m-%d %H:%M"),
                    summary.messages,
                    summary.working_dir.display()
                );
            }
        }
        "/resume" => {
            if rest.is_empty() {
                println!("  Usage: /resume <id>");
                return Ok(true);
            }
            match agent.store().load(&SessionId::from(rest)).await? {
                Some(session) => {
                    agent.save().await?;
                    agent.replace_session(session);
                    println!("  Resumed {rest}.");
                }
                None => println!("  Session {rest} not found."),
            }
        }
        other => println!("  Unknown command {other}; try /help."),
    }
    Ok(true)
}
