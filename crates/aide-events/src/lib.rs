use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use aide_protocol::{Event, EventPayload, SubscriptionId};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

mod audit;

pub use audit::{AUDITED_EVENTS, AuditConfig, AuditLog};

/// Number of events retained for diagnostics.
pub const HISTORY_CAPACITY: usize = 100;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Adapts an async closure taking an owned [`Event`] into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub handlers: usize,
    pub failures: usize,
}

type Subscribers = HashMap<String, Vec<(SubscriptionId, Arc<dyn EventHandler>)>>;

struct BusInner {
    subscribers: RwLock<Subscribers>,
    history: Mutex<VecDeque<Event>>,
    tap: broadcast::Sender<Event>,
}

/// In-process publish/subscribe kernel.
///
/// `publish` runs every handler for the event type concurrently and returns
/// only once all of them have finished, so a slow handler holds the publisher
/// back. Handler errors and panics are logged and counted, never propagated.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// `tap_buffer` bounds the broadcast tap used by [`EventBus::stream`].
    pub fn new(tap_buffer: usize) -> Self {
        let (tap, _) = broadcast::channel(tap_buffer.max(1));
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
                tap,
            }),
        }
    }

    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId::new_uuid();
        let event_type = event_type.into();
        debug!(event_type = %event_type, subscription = %id, "handler subscribed");
        self.inner
            .subscribers
            .write()
            .entry(event_type)
            .or_default()
            .push((id.clone(), handler));
        id
    }

    pub fn subscribe_fn<F, Fut>(&self, event_type: impl Into<String>, f: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(event_type, Arc::new(FnHandler::new(f)))
    }

    /// Returns false when the subscription was not registered for the type.
    pub fn unsubscribe(&self, event_type: &str, id: &SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let Some(handlers) = subscribers.get_mut(event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(candidate, _)| candidate != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subscribers.remove(event_type);
        }
        removed
    }

    pub async fn publish(&self, event_type: &str, payload: EventPayload) -> Delivery {
        let event = Event::new(event_type, payload);

        {
            let mut history = self.inner.history.lock();
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.inner.tap.send(event.clone());

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .inner
            .subscribers
            .read()
            .get(event_type)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            return Delivery::default();
        }

        let results = join_all(
            handlers
                .iter()
                .map(|handler| AssertUnwindSafe(handler.handle(&event)).catch_unwind()),
        )
        .await;

        let mut failures = 0;
        for result in results {
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(panic) => anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
            };
            failures += 1;
            warn!(event_type, error = %error, "event handler failed");
        }

        Delivery {
            handlers: handlers.len(),
            failures,
        }
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> HashMap<String, usize> {
        self.inner
            .subscribers
            .read()
            .iter()
            .map(|(event_type, handlers)| (event_type.clone(), handlers.len()))
            .collect()
    }

    /// Receiver observing every published event regardless of type.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.inner.tap.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.inner.tap.subscribe())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use aide_protocol::{EVENT_TYPE_KEY, payload};
    use anyhow::bail;
    use serde_json::json;
    use tokio::sync::Barrier;

    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_still_records_history() {
        let bus = EventBus::default();
        let delivery = bus.publish("nobody.listens", EventPayload::new()).await;
        assert_eq!(delivery, Delivery::default());

        let history = bus.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "nobody.listens");
    }

    #[tokio::test]
    async fn failing_handlers_do_not_block_siblings() {
        let bus = EventBus::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe_fn("greeting", |_event| async { bail!("boom") });
        bus.subscribe_fn("greeting", |_event| async {
            if true {
                panic!("handler exploded");
            }
            Ok(())
        });
        let counter = delivered.clone();
        bus.subscribe_fn("greeting", move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let delivery = bus.publish("greeting", payload(json!({"name": "Ada"}))).await;
        assert_eq!(delivery.handlers, 3);
        assert_eq!(delivery.failures, 2);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handlers_run_concurrently() {
        let bus = EventBus::default();
        let barrier = Arc::new(Barrier::new(2));
        for _ in 0..2 {
            let barrier = barrier.clone();
            bus.subscribe_fn("sync", move |_event| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            });
        }

        let delivery = tokio::time::timeout(
            Duration::from_secs(2),
            bus.publish("sync", EventPayload::new()),
        )
        .await
        .expect("sequential delivery would deadlock on the barrier");
        assert_eq!(delivery.failures, 0);
    }

    #[tokio::test]
    async fn handlers_see_the_event_type_tag() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        bus.subscribe_fn("tool.completed", move |event| {
            let slot = slot.clone();
            async move {
                *slot.lock() = event.str_field(EVENT_TYPE_KEY).map(ToOwned::to_owned);
                Ok(())
            }
        });

        bus.publish("tool.completed", EventPayload::new()).await;
        assert_eq!(seen.lock().as_deref(), Some("tool.completed"));
    }

    #[tokio::test]
    async fn history_keeps_only_the_newest_events() {
        let bus = EventBus::default();
        for index in 0..(HISTORY_CAPACITY + 5) {
            bus.publish("tick", payload(json!({ "index": index }))).await;
        }

        let history = bus.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].payload["index"], json!(5));
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler_and_updates_counts() {
        let bus = EventBus::default();
        let first = bus.subscribe_fn("a", |_event| async { Ok(()) });
        bus.subscribe_fn("a", |_event| async { Ok(()) });
        bus.subscribe_fn("b", |_event| async { Ok(()) });
        assert_eq!(bus.subscriber_count().get("a"), Some(&2));

        assert!(bus.unsubscribe("a", &first));
        assert!(!bus.unsubscribe("a", &first));
        assert_eq!(bus.subscriber_count().get("a"), Some(&1));
        assert_eq!(bus.subscriber_count().get("b"), Some(&1));
    }

    #[tokio::test]
    async fn tap_observes_every_event_type() -> Result<()> {
        let bus = EventBus::default();
        let mut tap = bus.subscribe_all();

        bus.publish("system.ready", EventPayload::new()).await;
        bus.publish("command.response", EventPayload::new()).await;

        assert_eq!(tap.recv().await?.event_type, "system.ready");
        assert_eq!(tap.recv().await?.event_type, "command.response");
        Ok(())
    }
}
