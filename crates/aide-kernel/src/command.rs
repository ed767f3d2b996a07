//! Bridges bus commands to the orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use aide_events::EventBus;
use aide_protocol::{ConfirmationId, Event, SubscriptionId, event_types};
use aide_runtime::Orchestrator;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::module::Module;

pub const COMMAND_MODULE: &str = "commands";

/// Subscribes the orchestrator to `system.command {command, source}` and
/// `command.confirm {confirmation_id, approved}` while running.
pub struct CommandModule {
    bus: EventBus,
    orchestrator: Arc<Orchestrator>,
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
    running: AtomicBool,
}

impl CommandModule {
    pub fn new(bus: EventBus, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            bus,
            orchestrator,
            subscriptions: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }
}

async fn on_command(orchestrator: Arc<Orchestrator>, event: Event) -> Result<()> {
    let command = event.str_field("command").unwrap_or_default().trim();
    if command.is_empty() {
        debug!("ignoring empty command");
        return Ok(());
    }
    let source = event.str_field("source").unwrap_or("unknown");
    orchestrator.handle(command, source).await;
    Ok(())
}

async fn on_confirm(orchestrator: Arc<Orchestrator>, event: Event) -> Result<()> {
    let Some(id) = event.str_field("confirmation_id") else {
        anyhow::bail!("command.confirm without confirmation_id");
    };
    let approved = event.bool_field("approved").unwrap_or(false);
    orchestrator.confirm(&ConfirmationId::from(id), approved).await;
    Ok(())
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &str {
        COMMAND_MODULE
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let orchestrator = self.orchestrator.clone();
        let commands = self.bus.subscribe_fn(event_types::SYSTEM_COMMAND, move |event| {
            on_command(orchestrator.clone(), event)
        });
        let orchestrator = self.orchestrator.clone();
        let confirms = self.bus.subscribe_fn(event_types::COMMAND_CONFIRM, move |event| {
            on_confirm(orchestrator.clone(), event)
        });

        let mut subscriptions = self.subscriptions.lock();
        subscriptions.push((event_types::SYSTEM_COMMAND, commands));
        subscriptions.push((event_types::COMMAND_CONFIRM, confirms));
        info!("command handling enabled");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let subscriptions: Vec<_> = self.subscriptions.lock().drain(..).collect();
        for (event_type, id) in subscriptions {
            self.bus.unsubscribe(event_type, &id);
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
