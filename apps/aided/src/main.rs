use std::path::PathBuf;
use std::time::Duration;

use aide_backend::DEFAULT_BASE_URL;
use aide_kernel::{AideKernel, KernelBuilder, default_root};
use aide_protocol::{Event, event_types, payload};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod chat;

#[derive(Debug, Parser)]
#[command(name = "aided")]
#[command(about = "Local assistant daemon and terminal coding agent")]
struct Cli {
    /// State directory for sessions, memory and the audit log.
    #[arg(long, env = "AIDE_ROOT")]
    root: Option<PathBuf>,
    #[arg(long, env = "AIDE_BACKEND_URL", default_value = DEFAULT_BASE_URL)]
    backend_url: String,
    #[arg(long, env = "AIDE_MODEL", default_value = "llama3.2")]
    model: String,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the assistant, reading commands from stdin.
    Serve(ServeArgs),
    /// Interactive coding agent in the current directory.
    Chat(chat::ChatArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "AIDE_FAST_MODEL", default_value = "qwen2.5:1.5b")]
    fast_model: String,
    /// Directory shell and file tools run in (defaults to home).
    #[arg(long)]
    working_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 300)]
    auto_lock_secs: u64,
    /// Source label attached to commands typed here.
    #[arg(long, default_value = "cli")]
    source: String,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            fast_model: "qwen2.5:1.5b".to_owned(),
            working_dir: None,
            auto_lock_secs: 300,
            source: "cli".to_owned(),
        }
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.root.clone().unwrap_or_else(default_root);

    match cli.command {
        Some(Command::Chat(args)) => {
            init_tracing("warn");
            chat::run(args, root, cli.backend_url, cli.model).await
        }
        Some(Command::Serve(args)) => {
            init_tracing("info");
            serve(args, root, cli.backend_url, cli.model).await
        }
        None => {
            init_tracing("info");
            serve(ServeArgs::default(), root, cli.backend_url, cli.model).await
        }
    }
}

async fn serve(args: ServeArgs, root: PathBuf, backend_url: String, model: String) -> Result<()> {
    let mut builder = KernelBuilder::new(&root)
        .backend_url(backend_url)
        .model(model)
        .fast_model(args.fast_model)
        .auto_lock_timeout(Duration::from_secs(args.auto_lock_secs));
    if let Some(dir) = args.working_dir {
        builder = builder.working_dir(dir);
    }
    let kernel = builder.build().await?;

    let mut events = kernel.bus().subscribe_all();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = kernel.start().await;
    info!(root = %root.display(), loaded = ?report.loaded, "aided ready; type a command, /help for more");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&kernel, line.trim(), &args.source).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = kernel.wait_for_shutdown() => break,
        }
    }

    for failure in kernel.shutdown().await {
        warn!(error = %failure, "shutdown failure");
    }
    printer.abort();
    Ok(())
}

/// Returns false when the loop should stop.
async fn handle_line(kernel: &AideKernel, line: &str, source: &str) -> bool {
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    match head {
        "" => {}
        "/quit" | "/exit" => return false,
        "/help" => {
            println!("Type a command, or one of:");
            println!("  /confirm <id>   run a command awaiting confirmation");
            println!("  /deny <id>      drop a command awaiting confirmation");
            println!("  /pending        list commands awaiting confirmation");
            println!("  /status         module and task status");
            println!("  /quit           shut down");
        }
        "/confirm" | "/deny" => {
            kernel
                .bus()
                .publish(
                    event_types::COMMAND_CONFIRM,
                    payload(json!({
                        "confirmation_id": rest.trim(),
                        "approved": head == "/confirm",
                    })),
                )
                .await;
        }
        "/pending" => {
            let pending = kernel.orchestrator().pending_confirmations();
            if pending.is_empty() {
                println!("Nothing is waiting for confirmation.");
            }
            for item in pending {
                println!("  {}  {}  (from {})", item.id, item.command, item.source);
            }
        }
        "/status" => {
            kernel
                .bus()
                .publish(event_types::SYSTEM_CONTROL, payload(json!({"command": "status"})))
                .await;
        }
        _ => {
            kernel.submit(line, source).await;
        }
    }
    true
}

fn print_event(event: &Event) {
    match event.event_type.as_str() {
        event_types::COMMAND_RESPONSE => {
            let text = event.str_field("text").unwrap_or_default();
            if event.bool_field("awaiting_confirmation") == Some(true) {
                let id = event.str_field("confirmation_id").unwrap_or_default();
                println!("aide> {text}");
                println!("      /confirm {id}  or  /deny {id}");
            } else if !text.is_empty() {
                println!("aide> {text}");
            }
        }
        event_types::TOOL_EXECUTING => {
            println!("  ... {}", event.str_field("name").unwrap_or_default());
        }
        event_types::SYSTEM_STATUS | event_types::SYSTEM_LOCKED | event_types::SYSTEM_UNLOCKED => {
            let rendered =
                serde_json::to_string(&event.payload).unwrap_or_else(|_| "{}".to_owned());
            println!("[{}] {rendered}", event.event_type);
        }
        _ => {}
    }
}
