//! EventBus (§4.8): typed in-process pub/sub for scheduler lifecycle
//! events. Subscribers run synchronously on the emitting thread; a
//! panicking subscriber is trapped and logged rather than propagated.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SchedulerEvent {
    TaskPending { key: Arc<str> },
    TaskProcessing { key: Arc<str>, version: String },
    TaskComplete { key: Arc<str>, output: Value },
    TaskError { key: Arc<str>, error: String },
    TaskGraphProcessing { started_at_ms: u64 },
    TaskGraphComplete { completed_at_ms: u64 },
}

/// One emitted event plus its monotonic sequence id, for replay/inspection.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: u64,
    pub event: SchedulerEvent,
}

type Subscriber = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;

/// Synchronous pub/sub bus. Cheap to clone (shares its log and
/// subscriber list via `Arc`), mirroring the teacher's event-log design.
#[derive(Clone)]
pub struct EventBus {
    log: Arc<RwLock<Vec<Envelope>>>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            log: Arc::new(RwLock::new(Vec::new())),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a callback invoked synchronously for every subsequent
    /// `emit`. A panic inside `callback` is caught and logged; it never
    /// unwinds into the scheduler's pump.
    pub fn subscribe(&self, callback: impl Fn(&SchedulerEvent) + Send + Sync + 'static) {
        self.subscribers.write().push(Arc::new(callback));
    }

    pub fn emit(&self, event: SchedulerEvent) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.log.write().push(Envelope { id, event: event.clone() });

        for subscriber in self.subscribers.read().iter() {
            let subscriber = Arc::clone(subscriber);
            let event_ref = &event;
            if catch_unwind(AssertUnwindSafe(|| subscriber(event_ref))).is_err() {
                error!("event subscriber panicked; trapped and continuing");
            }
        }
        id
    }

    pub fn events(&self) -> Vec<Envelope> {
        self.log.read().clone()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("len", &self.len()).finish()
    }
}
