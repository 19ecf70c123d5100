//! OutputRelay - fan-out of cockpit events to a changing set of observers.
//!
//! Every subscriber owns a bounded queue. `publish` pushes into each queue
//! with `try_send` while holding the subscriber lock, so all subscribers see
//! one global order and a publisher never waits on an observer. A subscriber
//! that falls a full queue behind is evicted instead of silently losing
//! events: whoever stays subscribed sees every event, gap free.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use shared_types::{Mode, OutputLine, StepKind, TaskRunInfo};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::DEFAULT_RELAY_QUEUE_CAPACITY;

/// Everything observers can be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum CockpitEvent {
    /// A user message was accepted by the dispatcher
    UserMessage { message: String },
    ModeSwitched { mode: Mode },
    /// Streamed chat text. `request_id` is `None` for dispatcher notices.
    ChatChunk {
        request_id: Option<String>,
        chunk: String,
    },
    /// A complete assistant reply, also recorded in history
    ChatComplete {
        request_id: Option<String>,
        message: String,
    },
    /// One captured line of automation output
    TaskOutput(OutputLine),
    /// Automation progress not tied to a process line
    TaskStep { kind: StepKind, content: String },
    /// Lifecycle transition of an automation run
    TaskLifecycle(TaskRunInfo),
    Error { message: String },
}

pub type SubscriptionId = u64;

/// Synchronous observer driven by its own delivery task.
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, event: &CockpitEvent);
}

struct SinkEntry {
    id: SubscriptionId,
    label: String,
    tx: mpsc::Sender<CockpitEvent>,
}

struct RelayInner {
    next_id: AtomicU64,
    queue_capacity: usize,
    sinks: Mutex<Vec<SinkEntry>>,
}

impl RelayInner {
    fn sinks(&self) -> std::sync::MutexGuard<'_, Vec<SinkEntry>> {
        self.sinks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut sinks = self.sinks();
        let before = sinks.len();
        sinks.retain(|entry| entry.id != id);
        sinks.len() != before
    }
}

#[derive(Clone)]
pub struct OutputRelay {
    inner: Arc<RelayInner>,
}

impl Default for OutputRelay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_QUEUE_CAPACITY)
    }
}

impl std::fmt::Debug for OutputRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRelay")
            .field("subscribers", &self.subscriber_count())
            .field("queue_capacity", &self.inner.queue_capacity)
            .finish()
    }
}

/// Receiving end of a relay registration. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<CockpitEvent>,
    relay: Weak<RelayInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once the subscription was removed (explicitly or
    /// by slow-consumer eviction) and the queue is drained.
    pub async fn recv(&mut self) -> Option<CockpitEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CockpitEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.remove(self.id);
        }
    }
}

impl OutputRelay {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
                sinks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn register(&self, label: String) -> (SubscriptionId, mpsc::Receiver<CockpitEvent>) {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.sinks().push(SinkEntry {
            id,
            label: label.clone(),
            tx,
        });
        tracing::debug!(subscription = id, label = %label, "Relay subscriber registered");
        (id, rx)
    }

    /// Register a queue-backed subscriber. Only events published after this
    /// call are delivered.
    pub fn subscribe(&self, label: impl Into<String>) -> Subscription {
        let (id, rx) = self.register(label.into());
        Subscription {
            id,
            rx,
            relay: Arc::downgrade(&self.inner),
        }
    }

    /// Register a callback sink. Deliveries happen on a dedicated task, so a
    /// slow or panicking sink never stalls the publisher. Must be called from
    /// within a tokio runtime.
    pub fn subscribe_with(
        &self,
        label: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> SubscriptionId {
        let label = label.into();
        let (id, mut rx) = self.register(label.clone());
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(|| sink.deliver(&event))).is_err() {
                    tracing::warn!(
                        subscription = id,
                        label = %label,
                        "Relay sink panicked during delivery"
                    );
                }
            }
            tracing::debug!(subscription = id, label = %label, "Relay sink task finished");
        });
        id
    }

    /// Remove a subscriber. Safe to call while another thread is publishing.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            tracing::debug!(subscription = id, "Relay subscriber removed");
        }
        removed
    }

    /// Deliver `event` to every current subscriber in registration order.
    pub fn publish(&self, event: CockpitEvent) {
        let mut sinks = self.inner.sinks();
        sinks.retain(|entry| match entry.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    subscription = entry.id,
                    label = %entry.label,
                    capacity = self.inner.queue_capacity,
                    "Relay subscriber fell behind; evicting"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(
                    subscription = entry.id,
                    label = %entry.label,
                    "Relay subscriber gone; removing"
                );
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sinks().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn error(message: &str) -> CockpitEvent {
        CockpitEvent::Error {
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_delivers_in_publish_order_to_every_subscriber() {
        let relay = OutputRelay::new(16);
        let mut a = relay.subscribe("a");
        let mut b = relay.subscribe("b");

        for i in 0..5 {
            relay.publish(error(&format!("e{i}")));
        }

        for sub in [&mut a, &mut b] {
            for i in 0..5 {
                assert_eq!(sub.recv().await, Some(error(&format!("e{i}"))));
            }
        }
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let relay = OutputRelay::default();
        relay.publish(error("before"));
        let mut late = relay.subscribe("late");
        relay.publish(error("after"));
        assert_eq!(late.recv().await, Some(error("after")));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop_remove_subscribers() {
        let relay = OutputRelay::default();
        let first = relay.subscribe("first");
        let second = relay.subscribe("second");
        assert_eq!(relay.subscriber_count(), 2);

        assert!(relay.unsubscribe(first.id()));
        assert!(!relay.unsubscribe(first.id()));
        assert_eq!(relay.subscriber_count(), 1);

        drop(second);
        assert_eq!(relay.subscriber_count(), 0);
        relay.publish(error("nobody listening"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted_without_affecting_others() {
        let relay = OutputRelay::new(2);
        let mut slow = relay.subscribe("slow");
        let mut fast = relay.subscribe("fast");

        relay.publish(error("1"));
        relay.publish(error("2"));
        assert_eq!(fast.recv().await, Some(error("1")));
        assert_eq!(fast.recv().await, Some(error("2")));

        // slow still holds 2 undelivered events, the third overflows it
        relay.publish(error("3"));
        assert_eq!(relay.subscriber_count(), 1);
        assert_eq!(fast.recv().await, Some(error("3")));

        // evicted subscriber drains what it had, then sees end of stream
        assert_eq!(slow.recv().await, Some(error("1")));
        assert_eq!(slow.recv().await, Some(error("2")));
        assert_eq!(slow.recv().await, None);
    }

    struct Recorder(Mutex<Vec<CockpitEvent>>);

    impl EventSink for Recorder {
        fn deliver(&self, event: &CockpitEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    struct Exploding;

    impl EventSink for Exploding {
        fn deliver(&self, _event: &CockpitEvent) {
            panic!("sink failure");
        }
    }

    #[tokio::test]
    async fn test_callback_sink_failure_is_isolated() {
        let relay = OutputRelay::default();
        relay.subscribe_with("exploding", Arc::new(Exploding));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        relay.subscribe_with("recorder", recorder.clone());

        relay.publish(error("one"));
        relay.publish(error("two"));

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if recorder.0.lock().unwrap().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("recorder should receive both events");

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![error("one"), error("two")]
        );
        assert_eq!(relay.subscriber_count(), 2);
    }
}
