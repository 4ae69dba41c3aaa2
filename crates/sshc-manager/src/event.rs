//! Connection event stream: emitted per state change, observed
//! synchronously by registered observers and retained in a bounded
//! per-instance ring buffer for late subscribers.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use sshc_core::instance::InstanceId;

/// Ring capacity for per-instance connection events.
pub const EVENT_RING_CAPACITY: usize = 256;
/// Ring capacity for per-instance state transitions; kept generous relative
/// to the event ring since transitions are a strict subset of events.
pub const TRANSITION_RING_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    ReconnectFailed,
    KeyUploaded,
    HealthCheckFailed,
    RateLimited,
    IpRestricted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connecting => "connecting",
            EventType::Connected => "connected",
            EventType::Disconnected => "disconnected",
            EventType::Reconnecting => "reconnecting",
            EventType::Reconnected => "reconnected",
            EventType::ReconnectFailed => "reconnect_failed",
            EventType::KeyUploaded => "key_uploaded",
            EventType::HealthCheckFailed => "health_check_failed",
            EventType::RateLimited => "rate_limited",
            EventType::IpRestricted => "ip_restricted",
        }
    }
}

/// An immutable record of something that happened to an instance's session.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub instance_id: InstanceId,
    pub event_type: EventType,
    pub timestamp: Duration,
    pub details: Option<String>,
}

impl ConnectionEvent {
    pub fn new(instance_id: InstanceId, event_type: EventType, details: Option<String>) -> Self {
        Self {
            instance_id,
            event_type,
            timestamp: now_since_epoch(),
            details,
        }
    }
}

fn now_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// A fixed-capacity circular buffer, guarded by its own lock. Reads snapshot
/// into a fresh `Vec` rather than exposing internal indices.
pub struct Ring<T> {
    capacity: usize,
    items: RwLock<VecDeque<T>>,
}

impl<T: Clone> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, item: T) {
        let mut guard = self.items.write();
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(item);
    }

    /// Snapshot, newest first.
    pub fn snapshot(&self) -> Vec<T> {
        let guard = self.items.read();
        guard.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

/// Receives every `ConnectionEvent` emitted across all instances. Called
/// synchronously from the emitter: implementations must not
/// block or perform I/O.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &ConnectionEvent);
}

/// Process-wide fan-out of events to registered observers, plus the
/// retained history used by `EventBus::history`. A panicking observer is
/// caught so it can never take down the emitting task.
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<std::sync::Arc<dyn SessionObserver>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: std::sync::Arc<dyn SessionObserver>) {
        self.observers.write().push(observer);
    }

    pub fn emit(&self, event: &ConnectionEvent) {
        let observers = self.observers.read();
        for observer in observers.iter() {
            let observer = observer.clone();
            let event = event.clone();
            let result = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if result.is_err() {
                tracing::error!(
                    instance_id = %event.instance_id,
                    "session observer panicked while handling {}",
                    event.event_type.as_str()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ring_evicts_oldest_first() {
        let ring: Ring<u32> = Ring::new(3);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        ring.push(4);

        assert_eq!(ring.snapshot(), vec![4, 3, 2]);
    }

    struct CountingObserver(Arc<AtomicUsize>);
    impl SessionObserver for CountingObserver {
        fn on_event(&self, _event: &ConnectionEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn bus_fans_out_to_all_observers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(Arc::new(CountingObserver(count.clone())));
        bus.register(Arc::new(CountingObserver(count.clone())));

        let event = ConnectionEvent::new(InstanceId(1), EventType::Connected, None);
        bus.emit(&event);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    struct PanickingObserver;
    impl SessionObserver for PanickingObserver {
        fn on_event(&self, _event: &ConnectionEvent) {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_observer_does_not_stop_emission() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(Arc::new(PanickingObserver));
        bus.register(Arc::new(CountingObserver(count.clone())));

        let event = ConnectionEvent::new(InstanceId(1), EventType::Connected, None);
        bus.emit(&event);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
