//! Named background tasks owned by the lifecycle manager.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Spawns periodic tasks that share one cancellation signal.
///
/// A task body that is mid-run when cancellation arrives finishes its current
/// iteration; no new iteration starts afterwards.
pub struct TaskSupervisor {
    cancel: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("tasks", &self.names())
            .field("cancelled", &*self.cancel.borrow())
            .finish()
    }
}

impl TaskSupervisor {
    /// Runs `task` every `period`, starting one period from now.
    pub fn spawn_periodic<F, Fut>(&self, name: impl Into<String>, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut cancel = self.cancel.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *cancel.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => task().await,
                }
            }
            debug!(task = %task_name, "periodic task stopped");
        });
        info!(task = %name, period_ms = period.as_millis() as u64, "periodic task spawned");
        self.tasks.lock().push((name, handle));
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Cancels every task and waits for each to finish. Tasks spawned after
    /// this call start cancelled.
    pub async fn shutdown(&self) {
        self.cancel.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for (name, handle) in tasks {
            if let Err(error) = handle.await {
                warn!(task = %name, %error, "periodic task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn periodic_task_runs_until_shutdown() {
        let supervisor = TaskSupervisor::default();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        supervisor.spawn_periodic("counter", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(supervisor.names(), vec!["counter".to_owned()]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        supervisor.shutdown().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");
        assert!(supervisor.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn tasks_spawned_after_shutdown_never_run() {
        let supervisor = TaskSupervisor::default();
        supervisor.shutdown().await;

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        supervisor.spawn_periodic("late", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        supervisor.shutdown().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
