//! # Event Manager
//!
//! Outbound events produced by systems during a tick and dispatched to the
//! service layer after the tick.
//!
//! ## Design
//!
//! ```text
//! emit ──► bounded channel ──┐
//!            │ (full)        ├──► dispatch() ──► handler per kind
//!            ▼               │
//!        overflow buffer ────┘
//! ```
//!
//! `enqueue` never blocks. When the channel is full it is flushed into the
//! overflow buffer first, which keeps events in emission order.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventError;

/// Default channel capacity before events spill into the overflow buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Maximum number of distinct event names.
pub const MAX_EVENT_TYPES: usize = u32::MAX as usize - 1;

/// Marker trait for outbound event types.
pub trait Event: Serialize + Send + Sync + 'static {
    /// Registration key and wire tag.
    const NAME: &'static str;
}

/// Routing class of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Published to clients.
    Default,
    /// Forwarded to another shard as a command.
    InterShardCommand,
}

/// An encoded event waiting for dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Routing class.
    pub kind: EventKind,
    /// Registered event name.
    pub name: String,
    /// JSON payload.
    pub payload: Value,
}

/// Handler invoked for every dispatched event of one kind.
pub type EventHandler = Box<dyn Fn(&RawEvent) -> Result<(), String> + Send + Sync>;

/// Non-blocking event queue with per-kind dispatch.
pub struct EventManager {
    sender: Sender<RawEvent>,
    receiver: Receiver<RawEvent>,
    overflow: Mutex<Vec<RawEvent>>,
    handlers: RwLock<HashMap<EventKind, EventHandler>>,
    names: RwLock<HashSet<&'static str>>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventManager {
    /// Creates a manager whose channel holds `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            overflow: Mutex::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            names: RwLock::new(HashSet::new()),
        }
    }

    /// Records `E` as a known event type. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics when the registration ceiling is exceeded.
    pub fn register<E: Event>(&self) {
        let mut names = self.names.write();
        if names.insert(E::NAME) {
            assert!(names.len() <= MAX_EVENT_TYPES, "event registration ceiling exceeded");
            tracing::debug!(event = E::NAME, "registered event");
        }
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.names.read().iter().copied().collect();
        names.sort_unstable();
        names
    }

    /// Installs the handler for a kind, replacing any previous one.
    pub fn set_handler(&self, kind: EventKind, handler: EventHandler) {
        self.handlers.write().insert(kind, handler);
    }

    /// Queues an event without blocking.
    pub fn enqueue(&self, event: RawEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event) | TrySendError::Disconnected(event)) => {
                let mut overflow = self.overflow.lock();
                overflow.extend(self.receiver.try_iter());
                if let Err(TrySendError::Full(event) | TrySendError::Disconnected(event)) =
                    self.sender.try_send(event)
                {
                    overflow.push(event);
                }
            }
        }
    }

    /// Number of events waiting for dispatch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.overflow.lock().len() + self.receiver.len()
    }

    fn take_all(&self) -> Vec<RawEvent> {
        let mut overflow = self.overflow.lock();
        overflow.extend(self.receiver.try_iter());
        std::mem::take(&mut *overflow)
    }

    /// Drains every queued event through its kind's handler.
    ///
    /// Handler failures do not stop dispatch. Events without a handler are
    /// dropped. Returns the number of events drained.
    ///
    /// # Errors
    ///
    /// [`EventError::Dispatch`] carrying every handler failure.
    pub fn dispatch(&self) -> Result<usize, EventError> {
        let events = self.take_all();
        let handlers = self.handlers.read();
        let mut failures = Vec::new();
        for event in &events {
            let Some(handler) = handlers.get(&event.kind) else {
                tracing::trace!(event = %event.name, "no handler for event kind");
                continue;
            };
            if let Err(reason) = handler(event) {
                failures.push(EventError::Handler {
                    name: event.name.clone(),
                    reason,
                });
            }
        }
        if failures.is_empty() {
            Ok(events.len())
        } else {
            Err(EventError::Dispatch(failures))
        }
    }

    /// Keeps the `len` oldest queued events and drops the rest. Returns the
    /// number dropped.
    pub fn truncate(&self, len: usize) -> usize {
        let mut overflow = self.overflow.lock();
        overflow.extend(self.receiver.try_iter());
        let dropped = overflow.len().saturating_sub(len);
        overflow.truncate(len);
        dropped
    }

    /// Drops every queued event.
    pub fn clear(&self) {
        drop(self.take_all());
    }
}

/// Typed emitter handed to systems.
pub struct EventEmitter<E: Event> {
    manager: Arc<EventManager>,
    _marker: PhantomData<fn(E)>,
}

impl<E: Event> EventEmitter<E> {
    /// Registers `E` and builds an emitter.
    #[must_use]
    pub fn new(manager: &Arc<EventManager>) -> Self {
        manager.register::<E>();
        Self {
            manager: Arc::clone(manager),
            _marker: PhantomData,
        }
    }

    /// Emits a client-facing event.
    ///
    /// # Errors
    ///
    /// [`EventError::Encode`] if the payload cannot be serialized.
    pub fn emit(&self, event: &E) -> Result<(), EventError> {
        self.emit_as(EventKind::Default, event)
    }

    /// Emits an event of the given kind.
    ///
    /// # Errors
    ///
    /// [`EventError::Encode`] if the payload cannot be serialized.
    pub fn emit_as(&self, kind: EventKind, event: &E) -> Result<(), EventError> {
        let payload = serde_json::to_value(event).map_err(|e| EventError::Encode {
            name: E::NAME.to_string(),
            reason: e.to_string(),
        })?;
        self.manager.enqueue(RawEvent {
            kind,
            name: E::NAME.to_string(),
            payload,
        });
        Ok(())
    }
}
