//! # aide-kernel: lifecycle and composition root
//!
//! [`KernelBuilder`] wires the bus, audit log, fact memory, backend client,
//! tool catalog and orchestrator under one state root. [`AideKernel`] owns
//! the [`ModuleManager`] and the periodic tasks (inactivity-lock checker,
//! stats poller) that run while it is started.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aide_backend::{BackendConfig, DEFAULT_BASE_URL, OllamaBackend};
use aide_events::{AuditConfig, AuditLog, Delivery, EventBus};
use aide_memory::FactStore;
use aide_protocol::{ChatBackend, EventPayload, event_types, payload};
use aide_runtime::{Orchestrator, OrchestratorConfig, SessionStore};
use aide_sandbox::{LocalSandboxRunner, SandboxRunner};
use aide_tools::{AssistantToolset, assistant_catalog};
use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, instrument};

mod command;
mod module;
mod supervisor;

pub use command::{COMMAND_MODULE, CommandModule};
pub use module::{KernelError, Module, ModuleManager, ModuleState, StartReport};
pub use aide_tools::WebEndpoints;
pub use supervisor::TaskSupervisor;

pub const LOCK_CHECK_TASK: &str = "inactivity-lock";
pub const STATS_TASK: &str = "stats-poller";

/// `~/.aide`, or `.aide` when no home directory is known.
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".aide"))
        .unwrap_or_else(|| PathBuf::from(".aide"))
}

#[derive(Clone)]
pub struct KernelBuilder {
    root: PathBuf,
    backend_url: String,
    backend: Option<Arc<dyn ChatBackend>>,
    sandbox: Option<Arc<dyn SandboxRunner>>,
    orchestrator: OrchestratorConfig,
    web_endpoints: WebEndpoints,
    lock_check_interval: Duration,
    stats_interval: Duration,
}

impl std::fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBuilder")
            .field("root", &self.root)
            .field("backend_url", &self.backend_url)
            .field("orchestrator", &self.orchestrator)
            .field("lock_check_interval", &self.lock_check_interval)
            .field("stats_interval", &self.stats_interval)
            .finish_non_exhaustive()
    }
}

impl KernelBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backend_url: DEFAULT_BASE_URL.to_owned(),
            backend: None,
            sandbox: None,
            orchestrator: OrchestratorConfig::default(),
            web_endpoints: WebEndpoints::default(),
            lock_check_interval: Duration::from_secs(10),
            stats_interval: Duration::from_secs(30),
        }
    }

    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    /// Uses this backend instead of an HTTP client for `backend_url`.
    pub fn backend(mut self, backend: Arc<dyn ChatBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator = config;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.orchestrator.model = model.into();
        self
    }

    pub fn fast_model(mut self, model: impl Into<String>) -> Self {
        self.orchestrator.fast_model = model.into();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.orchestrator.working_dir = dir.into();
        self
    }

    pub fn auto_lock_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator.auto_lock_timeout = timeout;
        self
    }

    pub fn restricted_sources(mut self, sources: Vec<String>) -> Self {
        self.orchestrator.restricted_sources = sources;
        self
    }

    pub fn web_endpoints(mut self, endpoints: WebEndpoints) -> Self {
        self.web_endpoints = endpoints;
        self
    }

    pub fn lock_check_interval(mut self, interval: Duration) -> Self {
        self.lock_check_interval = interval;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn build(self) -> Result<AideKernel> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create state root {}", self.root.display()))?;

        let bus = EventBus::default();
        let audit = Arc::new(AuditLog::new(AuditConfig::new(self.root.join("audit.log"))));
        audit.install(&bus);

        let memory = Arc::new(FactStore::open(self.root.join("memory.json")).await?);

        let backend: Arc<dyn ChatBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(
                OllamaBackend::new(BackendConfig {
                    base_url: self.backend_url.clone(),
                    ..BackendConfig::default()
                })
                .context("failed to configure backend client")?,
            ),
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("aide/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client for web tools")?;
        let sandbox = self
            .sandbox
            .unwrap_or_else(|| Arc::new(LocalSandboxRunner::default()));
        let registry = assistant_catalog(AssistantToolset {
            sandbox,
            memory: memory.clone(),
            http,
            endpoints: self.web_endpoints,
        });

        let orchestrator = Arc::new(
            Orchestrator::new(self.orchestrator, bus.clone(), backend.clone(), registry)
                .with_memory(memory.clone()),
        );

        let manager = ModuleManager::new(bus.clone());
        manager.register(Arc::new(CommandModule::new(bus.clone(), orchestrator.clone())))?;

        info!(backend_url = %self.backend_url, "kernel assembled");
        Ok(AideKernel {
            root: self.root.clone(),
            bus,
            manager,
            orchestrator,
            memory,
            backend,
            audit,
            sessions: SessionStore::new(self.root.join("sessions")),
            lock_check_interval: self.lock_check_interval,
            stats_interval: self.stats_interval,
            started_at: Instant::now(),
        })
    }
}

#[derive(Clone)]
pub struct AideKernel {
    root: PathBuf,
    bus: EventBus,
    manager: Arc<ModuleManager>,
    orchestrator: Arc<Orchestrator>,
    memory: Arc<FactStore>,
    backend: Arc<dyn ChatBackend>,
    audit: Arc<AuditLog>,
    sessions: SessionStore,
    lock_check_interval: Duration,
    stats_interval: Duration,
    started_at: Instant,
}

impl std::fmt::Debug for AideKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AideKernel")
            .field("root", &self.root)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl AideKernel {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<ModuleManager> {
        &self.manager
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn memory(&self) -> &Arc<FactStore> {
        &self.memory
    }

    pub fn backend(&self) -> Arc<dyn ChatBackend> {
        self.backend.clone()
    }

    pub fn audit_log(&self) -> &Path {
        self.audit.path()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Registers an extra module; must happen before [`AideKernel::start`].
    pub fn register_module(&self, module: Arc<dyn Module>) -> Result<(), KernelError> {
        self.manager.register(module)
    }

    /// Starts every module, then the inactivity-lock checker and stats poller.
    #[instrument(skip(self))]
    pub async fn start(&self) -> StartReport {
        let report = self.manager.start().await;

        let orchestrator = self.orchestrator.clone();
        self.manager
            .spawn_periodic(LOCK_CHECK_TASK, self.lock_check_interval, move || {
                let orchestrator = orchestrator.clone();
                async move {
                    orchestrator.check_auto_lock().await;
                }
            });

        let kernel = self.clone();
        self.manager
            .spawn_periodic(STATS_TASK, self.stats_interval, move || {
                let kernel = kernel.clone();
                async move {
                    kernel
                        .bus
                        .publish(event_types::SYSTEM_STATS, kernel.stats())
                        .await;
                }
            });

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "kernel started"
        );
        report
    }

    /// Publishes a command on `system.command`; returns once it was handled.
    pub async fn submit(&self, command: &str, source: &str) -> Delivery {
        self.bus
            .publish(
                event_types::SYSTEM_COMMAND,
                payload(json!({"command": command, "source": source})),
            )
            .await
    }

    pub fn stats(&self) -> EventPayload {
        payload(json!({
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "modules": self.manager.status(),
            "tasks": self.manager.supervisor().names(),
            "subscribers": self.bus.subscriber_count(),
            "locked": self.orchestrator.is_locked(),
            "pending_confirmations": self.orchestrator.pending_confirmations().len(),
            "history_len": self.orchestrator.history().len(),
            "cpu_count": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }))
    }

    pub async fn shutdown(&self) -> Vec<KernelError> {
        self.manager.shutdown().await
    }

    pub async fn wait_for_shutdown(&self) {
        self.manager.wait_for_shutdown().await;
    }
}
