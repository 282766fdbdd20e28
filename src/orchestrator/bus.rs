//! Event fan-out from one run to many listeners
//!
//! Callback listeners live in an arena keyed by a monotonically increasing id,
//! so removing one never shifts another. Async consumers can take a broadcast
//! receiver from `stream()` instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_broadcast::{InactiveReceiver, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::debug;

use crate::agent::events::{EventSink, ExecutionEvent};

pub type Listener = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

struct BusInner {
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

/// Handle returned by `EventBus::subscribe`. Dropping it keeps the listener;
/// call `unsubscribe` to remove it.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns false if the listener was already gone
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.id),
            None => false,
        }
    }
}

pub struct EventBus {
    inner: Arc<BusInner>,
    tx: Sender<ExecutionEvent>,
    // Keeps the channel open while no stream is attached
    _idle: InactiveReceiver<ExecutionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        // Slow stream consumers lose the oldest events rather than stall a run
        tx.set_overflow(true);
        tx.set_await_active(false);
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            tx,
            _idle: rx.deactivate(),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.write().push((id, Arc::new(listener)));
        debug!(listener_id = id, "Listener subscribed");
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// A receiver that sees every event published from now on
    pub fn stream(&self) -> Receiver<ExecutionEvent> {
        self.tx.new_receiver()
    }

    pub fn publish(&self, event: &ExecutionEvent) {
        // Listeners run without the lock held so they may unsubscribe themselves
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }

        match self.tx.try_broadcast(event.clone()) {
            Ok(Some(_dropped)) => debug!("Event stream full, dropped oldest event"),
            Ok(None) | Err(TrySendError::Inactive(_)) => {}
            Err(e) => debug!(error = %e, "Event stream unavailable"),
        }
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &ExecutionEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::ExecutionEventKind;
    use parking_lot::Mutex;
    use serde_json::Value;

    fn event(kind: ExecutionEventKind) -> ExecutionEvent {
        ExecutionEvent::new(kind, None, Value::Null)
    }

    #[test]
    fn test_fan_out_and_unsubscribe_by_id() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<Subscription> = (0..3)
            .map(|i| {
                let seen = seen.clone();
                bus.subscribe(move |e| seen.lock().push((i, e.kind)))
            })
            .collect();

        bus.publish(&event(ExecutionEventKind::GraphStarted));
        assert_eq!(seen.lock().len(), 3);

        let mut subs = subs.into_iter();
        let first = subs.next().unwrap();
        let second = subs.next().unwrap();
        assert!(second.unsubscribe());
        assert_eq!(bus.listener_count(), 2);

        seen.lock().clear();
        bus.publish(&event(ExecutionEventKind::GraphCompleted));
        let ids: Vec<i32> = seen.lock().iter().map(|(i, _)| *i).collect();
        assert_eq!(ids, vec![0, 2]);

        assert!(bus.unsubscribe(first.id()));
        assert!(!first.unsubscribe());
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::default());
        let slot: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&bus);
        let listener_slot = slot.clone();
        let sub = bus.subscribe(move |_| {
            if let (Some(bus), Some(id)) = (weak.upgrade(), *listener_slot.lock()) {
                bus.unsubscribe(id);
            }
        });
        *slot.lock() = Some(sub.id());

        bus.publish(&event(ExecutionEventKind::GraphStarted));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_receives_events() {
        let bus = EventBus::new(2);
        bus.publish(&event(ExecutionEventKind::GraphStarted));

        let mut rx = bus.stream();
        bus.publish(&event(ExecutionEventKind::TaskStarted));
        bus.publish(&event(ExecutionEventKind::TaskCompleted));
        bus.publish(&event(ExecutionEventKind::GraphCompleted));

        // Capacity 2 with overflow: the oldest event was dropped
        assert_eq!(rx.recv().await.unwrap().kind, ExecutionEventKind::TaskCompleted);
        assert_eq!(rx.recv().await.unwrap().kind, ExecutionEventKind::GraphCompleted);
    }
}
