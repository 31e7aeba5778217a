use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::auth::token::{AuthEvent, EventReason};

/// Default capacity of the broadcast side channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Anything that can receive auth events from the manager
pub trait EventSink: Send + Sync {
    fn publish(&self, event: AuthEvent);
}

type Handler = Arc<dyn Fn(&AuthEvent) -> anyhow::Result<()> + Send + Sync>;

/// Statistics about event bus activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Number of events published
    pub events_published: u64,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: u64,
    /// Count of events by reason
    pub reason_counts: HashMap<EventReason, u64>,
}

struct BusInner {
    handlers: RwLock<Vec<(Uuid, Handler)>>,
    sender: broadcast::Sender<AuthEvent>,
    stats: Mutex<EventBusStats>,
}

/// Publish point for authentication state transitions.
///
/// Handlers run synchronously, in subscription order, on the publishing
/// task. Clones share subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Handle returned by [`EventBus::subscribe`]; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    id: Uuid,
    bus: Weak<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(Vec::new()),
                sender,
                stats: Mutex::new(EventBusStats::default()),
            }),
        }
    }

    /// Register a handler; it stays registered while the subscription lives
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AuthEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        debug!(subscription_id = %id, "Registered auth event handler");

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Receiver for async observers. Slow receivers may lag and miss events.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.sender.subscribe()
    }

    /// Deliver `event` to every current subscriber
    pub fn publish(&self, event: AuthEvent) {
        trace!(reason = %event.reason, authenticated = event.is_authenticated, "Publishing auth event");

        // Snapshot so handlers may (un)subscribe while being called
        let handlers: Vec<(Uuid, Handler)> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut failures = 0u64;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(subscription_id = %id, error = %e, "Auth event handler failed");
                }
                Err(_) => {
                    failures += 1;
                    error!(subscription_id = %id, "Auth event handler panicked");
                }
            }
        }

        // No receivers is fine: the channel is optional
        let _ = self.inner.sender.send(event.clone());

        let mut stats = self.inner.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.events_published += 1;
        stats.handler_failures += failures;
        *stats.reason_counts.entry(event.reason).or_insert(0) += 1;
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn stats(&self) -> EventBusStats {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: AuthEvent) {
        EventBus::publish(self, event)
    }
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Same as dropping the handle
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut handlers = bus.handlers.write().unwrap_or_else(|e| e.into_inner());
            handlers.retain(|(id, _)| *id != self.id);
            debug!(subscription_id = %self.id, "Unregistered auth event handler");
        }
    }
}
