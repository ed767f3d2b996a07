//! Module contract and the lifecycle manager that owns registered modules.

use std::sync::{Arc, Weak};
use std::time::Duration;

use aide_events::EventBus;
use aide_protocol::{Event, event_types, payload};
use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::supervisor::TaskSupervisor;

/// A long-running component whose lifecycle the manager controls.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    /// Releases whatever `start` acquired. Called on every registered module
    /// at shutdown, including ones that never started or failed partway.
    async fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Stopped,
    Running,
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("module '{0}' is already registered")]
    DuplicateModule(String),
    #[error("module '{name}' failed to start: {message}")]
    StartFailed { name: String, message: String },
    #[error("module '{name}' failed to stop: {message}")]
    StopFailed { name: String, message: String },
}

/// What `start` achieved: modules that came up and the failures of the rest.
#[derive(Debug, Default)]
pub struct StartReport {
    pub loaded: Vec<String>,
    pub failed: Vec<KernelError>,
}

/// Starts modules in registration order and stops them in reverse.
///
/// One module failing never prevents the others from starting or stopping.
/// The manager also answers `{"command": "status" | "shutdown"}` on
/// `system.control`.
pub struct ModuleManager {
    bus: EventBus,
    modules: RwLock<Vec<Arc<dyn Module>>>,
    supervisor: TaskSupervisor,
    stopped: watch::Sender<bool>,
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.status())
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

impl ModuleManager {
    pub fn new(bus: EventBus) -> Arc<Self> {
        let (stopped, _) = watch::channel(false);
        let manager = Arc::new(Self {
            bus: bus.clone(),
            modules: RwLock::new(Vec::new()),
            supervisor: TaskSupervisor::default(),
            stopped,
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        bus.subscribe_fn(event_types::SYSTEM_CONTROL, move |event: Event| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(manager) => manager.handle_control(&event).await,
                    None => Ok(()),
                }
            }
        });
        manager
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn register(&self, module: Arc<dyn Module>) -> Result<(), KernelError> {
        let mut modules = self.modules.write();
        let name = module.name().to_owned();
        if modules.iter().any(|existing| existing.name() == name) {
            return Err(KernelError::DuplicateModule(name));
        }
        info!(module = %name, "module registered");
        modules.push(module);
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<dyn Module>> {
        self.modules.read().clone()
    }

    /// Starts every module, then publishes `system.ready`.
    #[instrument(skip(self))]
    pub async fn start(&self) -> StartReport {
        let mut report = StartReport::default();
        for module in self.snapshot() {
            let name = module.name().to_owned();
            match module.start().await {
                Ok(()) => {
                    info!(module = %name, "module started");
                    report.loaded.push(name);
                }
                Err(failure) => {
                    error!(module = %name, error = %failure, "module failed to start");
                    self.bus
                        .publish(
                            event_types::SYSTEM_MODULE_ERROR,
                            payload(json!({
                                "module": name,
                                "phase": "start",
                                "error": format!("{failure:#}"),
                            })),
                        )
                        .await;
                    report.failed.push(KernelError::StartFailed {
                        name,
                        message: format!("{failure:#}"),
                    });
                }
            }
        }

        self.bus
            .publish(
                event_types::SYSTEM_READY,
                payload(json!({"modules_loaded": report.loaded})),
            )
            .await;
        report
    }

    /// Cancels supervised tasks, then stops every module in reverse
    /// registration order. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Vec<KernelError> {
        self.supervisor.shutdown().await;

        let mut failures = Vec::new();
        for module in self.snapshot().into_iter().rev() {
            let name = module.name().to_owned();
            match module.stop().await {
                Ok(()) => info!(module = %name, "module stopped"),
                Err(failure) => {
                    warn!(module = %name, error = %failure, "module failed to stop");
                    self.bus
                        .publish(
                            event_types::SYSTEM_MODULE_ERROR,
                            payload(json!({
                                "module": name,
                                "phase": "stop",
                                "error": format!("{failure:#}"),
                            })),
                        )
                        .await;
                    failures.push(KernelError::StopFailed {
                        name,
                        message: format!("{failure:#}"),
                    });
                }
            }
        }

        self.stopped.send_replace(true);
        failures
    }

    /// Resolves once `shutdown` has completed.
    pub async fn wait_for_shutdown(&self) {
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// Module states in registration order.
    pub fn status(&self) -> IndexMap<String, ModuleState> {
        self.modules
            .read()
            .iter()
            .map(|module| {
                let state = if module.is_running() {
                    ModuleState::Running
                } else {
                    ModuleState::Stopped
                };
                (module.name().to_owned(), state)
            })
            .collect()
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn spawn_periodic<F, Fut>(&self, name: impl Into<String>, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.supervisor.spawn_periodic(name, period, task);
    }

    async fn handle_control(&self, event: &Event) -> Result<()> {
        match event.str_field("command") {
            Some("status") => {
                self.bus
                    .publish(
                        event_types::SYSTEM_STATUS,
                        payload(json!({
                            "modules": self.status(),
                            "tasks": self.supervisor.names(),
                        })),
                    )
                    .await;
            }
            Some("shutdown") => {
                info!("shutdown requested over the control channel");
                self.shutdown().await;
            }
            other => anyhow::bail!("unknown control command: {other:?}"),
        }
        Ok(())
    }
}
