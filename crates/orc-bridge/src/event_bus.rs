use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::protocol::{EventKind, OrcEvent};

/// Per-subscriber buffer capacity. On overflow the oldest event is dropped
/// and the subscriber is marked lagged.
const SUBSCRIBER_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// EventFilter
// ---------------------------------------------------------------------------

/// Subscription filter. Empty fields match everything, so the default filter
/// is a firehose.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub projects: Vec<String>,
    pub tasks: Vec<String>,
    pub kinds: Vec<EventKind>,
}

impl EventFilter {
    pub fn matches(&self, event: &OrcEvent) -> bool {
        (self.projects.is_empty() || self.projects.iter().any(|p| p == &event.project))
            && (self.tasks.is_empty() || self.tasks.iter().any(|t| t == &event.task_id))
            && (self.kinds.is_empty() || self.kinds.contains(&event.event))
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving end of a subscription. Dropping it unsubscribes; the bus prunes
/// disconnected subscribers on the next publish.
pub struct Subscription {
    rx: flume::Receiver<Arc<OrcEvent>>,
    lagged: Arc<AtomicBool>,
}

impl Subscription {
    /// Await the next matching event. `None` when the bus is gone.
    pub async fn recv(&self) -> Option<Arc<OrcEvent>> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<Arc<OrcEvent>> {
        self.rx.try_recv().ok()
    }

    /// True once the subscriber's buffer overflowed and events were dropped.
    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Relaxed)
    }
}

struct Subscriber {
    tx: flume::Sender<Arc<OrcEvent>>,
    /// Bus-side clone of the receiver; lets publish evict the oldest queued
    /// event in O(1) when the buffer is full.
    evict_rx: flume::Receiver<Arc<OrcEvent>>,
    filter: EventFilter,
    lagged: Arc<AtomicBool>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on bounded flume channels.
///
/// `publish` never blocks: a subscriber that stops draining loses its oldest
/// events rather than stalling producers. Events from one producer reach
/// each subscriber in FIFO order. Cloning the bus is cheap (shared `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a subscriber receiving every event that matches `filter`
    /// from this point forward.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = flume::bounded(SUBSCRIBER_CAPACITY);
        let lagged = Arc::new(AtomicBool::new(false));
        let mut subscribers = self.inner.lock().expect("EventBus lock poisoned");
        subscribers.push(Subscriber {
            tx,
            evict_rx: rx.clone(),
            filter,
            lagged: lagged.clone(),
        });
        Subscription { rx, lagged }
    }

    /// Firehose subscription: every event.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(EventFilter::default())
    }

    /// Publish an event to all matching subscribers without blocking.
    /// Disconnected subscribers are pruned.
    pub fn publish(&self, event: OrcEvent) {
        let event = Arc::new(event);
        let mut subscribers = self.inner.lock().expect("EventBus lock poisoned");
        subscribers.retain(|sub| {
            if !sub.filter.matches(&event) {
                return !sub.tx.is_disconnected();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(ev)) => {
                    // Drop the oldest queued event to make room.
                    let _ = sub.evict_rx.try_recv();
                    sub.lagged.store(true, Ordering::Relaxed);
                    sub.tx.try_send(ev).is_ok()
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(project: &str, task: &str, kind: EventKind) -> OrcEvent {
        OrcEvent::new(project, task, kind, serde_json::json!({}))
    }

    #[test]
    fn firehose_receives_everything() {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();

        bus.publish(ev("p1", "TASK-1", EventKind::State));
        bus.publish(ev("p2", "TASK-2", EventKind::Tokens));

        assert_eq!(sub.try_recv().unwrap().project, "p1");
        assert_eq!(sub.try_recv().unwrap().project, "p2");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn filter_narrows_delivery() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter {
            projects: vec!["p1".into()],
            tasks: vec![],
            kinds: vec![EventKind::State, EventKind::Phase],
        });

        bus.publish(ev("p1", "TASK-1", EventKind::State));
        bus.publish(ev("p1", "TASK-1", EventKind::Tokens)); // kind filtered
        bus.publish(ev("p2", "TASK-9", EventKind::State)); // project filtered
        bus.publish(ev("p1", "TASK-2", EventKind::Phase));

        assert_eq!(sub.try_recv().unwrap().event, EventKind::State);
        assert_eq!(sub.try_recv().unwrap().event, EventKind::Phase);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn overflow_drops_oldest_and_marks_lagged() {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();

        for i in 0..(SUBSCRIBER_CAPACITY + 10) {
            bus.publish(ev("p1", &format!("TASK-{i}"), EventKind::State));
        }

        assert!(sub.is_lagged());
        // The oldest 10 events were evicted; the first one left is TASK-10.
        let first = sub.try_recv().unwrap();
        assert_eq!(first.task_id, "TASK-10");

        let mut count = 1;
        while sub.try_recv().is_some() {
            count += 1;
        }
        assert_eq!(count, SUBSCRIBER_CAPACITY);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.publish(ev("p1", "TASK-1", EventKind::State));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn async_recv_delivers_in_fifo_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();

        for i in 0..5 {
            bus.publish(ev("p1", &format!("TASK-{i}"), EventKind::State));
        }
        for i in 0..5 {
            let got = sub.recv().await.unwrap();
            assert_eq!(got.task_id, format!("TASK-{i}"));
        }
    }
}
