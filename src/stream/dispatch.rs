//! Event handler registry and the delivery task that runs handlers.
//!
//! Handlers never run on the controller task: decoded events are queued to a
//! dedicated dispatcher task so slow handler code cannot stall protocol
//! processing.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Registry key whose handlers receive every event.
pub const WILDCARD_EVENT: &str = "*";

static NULL: Value = Value::Null;

/// Application event decoded from an inner `event` frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
}

impl Event {
    /// First argument, or `null` when the event carried none.
    pub fn payload(&self) -> &Value {
        self.args.first().unwrap_or(&NULL)
    }

    /// Deserializes the first argument.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.payload())
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Event name to handler list, shared between the client handle and the
/// dispatcher task. Survives reconnects.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Vec<EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn subscribe(&self, event: impl Into<String>, handler: EventHandler) {
        if let Ok(mut guard) = self.handlers.write() {
            guard.entry(event.into()).or_default().push(handler);
        }
    }

    /// Drops every handler registered under `event`; returns how many.
    pub fn unsubscribe(&self, event: &str) -> usize {
        self.handlers
            .write()
            .ok()
            .and_then(|mut guard| guard.remove(event))
            .map(|removed| removed.len())
            .unwrap_or(0)
    }

    /// Handlers for `event` in registration order, followed by wildcard
    /// handlers.
    pub fn handlers_for(&self, event: &str) -> Vec<EventHandler> {
        let Ok(guard) = self.handlers.read() else {
            return Vec::new();
        };
        let mut matched = Vec::new();
        if event != WILDCARD_EVENT {
            if let Some(handlers) = guard.get(event) {
                matched.extend(handlers.iter().cloned());
            }
        }
        if let Some(handlers) = guard.get(WILDCARD_EVENT) {
            matched.extend(handlers.iter().cloned());
        }
        matched
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self
            .handlers
            .read()
            .map(|guard| guard.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("HandlerRegistry")
            .field("events", &keys)
            .finish()
    }
}

/// Sending half of the delivery queue.
#[derive(Clone, Debug)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Event>,
}

impl Dispatcher {
    /// Spawns the delivery task on `runtime`.
    pub(crate) fn spawn(registry: HandlerRegistry, runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                deliver(&registry, &event);
            }
        });
        Self { tx }
    }

    pub(crate) fn dispatch(&self, event: Event) {
        if self.tx.send(event).is_err() {
            warn!(event = "dispatch_dropped", reason = "dispatcher stopped");
        }
    }
}

fn deliver(registry: &HandlerRegistry, event: &Event) {
    let handlers = registry.handlers_for(&event.name);
    if handlers.is_empty() {
        trace!(event = "event_unhandled", name = %event.name);
        return;
    }
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            warn!(event = "handler_panicked", name = %event.name);
        }
    }
}
