//! # System Events
//!
//! In-tick messages between systems. Unlike outbound events they never
//! leave the world, and every buffer is cleared at the end of each tick.
//!
//! A system-event type takes part in scheduling exactly like a component:
//! an emitter and a receiver of the same type conflict, so the receiver
//! registered later always runs after the emitter registered earlier.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EcsError, EcsResult};

/// Numeric system-event ID, dense from 0.
pub type SystemEventId = u32;

/// Highest assignable system-event ID.
pub const MAX_SYSTEM_EVENT_ID: SystemEventId = u32::MAX - 2;

/// Marker trait for system-event types.
pub trait SystemEvent: Clone + Send + Sync + 'static {
    /// Registration key.
    const NAME: &'static str;
}

struct SystemEventBuffer {
    type_id: TypeId,
    events: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
}

/// Per-type system-event buffers.
#[derive(Default)]
pub struct SystemEventManager {
    catalog: HashMap<&'static str, SystemEventId>,
    buffers: Vec<Arc<SystemEventBuffer>>,
}

impl SystemEventManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `E`, or returns its existing ID.
    ///
    /// # Errors
    ///
    /// [`EcsError::SystemEventTypeMismatch`] if the name belongs to another type.
    ///
    /// # Panics
    ///
    /// Panics when the ID space is exhausted.
    pub fn register<E: SystemEvent>(&mut self) -> EcsResult<SystemEventId> {
        if let Some(&id) = self.catalog.get(E::NAME) {
            if self.buffers[id as usize].type_id != TypeId::of::<E>() {
                return Err(EcsError::SystemEventTypeMismatch(E::NAME.to_string()));
            }
            return Ok(id);
        }
        let id = SystemEventId::try_from(self.buffers.len()).unwrap_or(SystemEventId::MAX);
        assert!(id <= MAX_SYSTEM_EVENT_ID, "system event registration ceiling exceeded");
        self.catalog.insert(E::NAME, id);
        self.buffers.push(Arc::new(SystemEventBuffer {
            type_id: TypeId::of::<E>(),
            events: Mutex::new(Vec::new()),
        }));
        tracing::debug!(system_event = E::NAME, id, "registered system event");
        Ok(id)
    }

    /// Emitter for `E`, registering it if needed.
    ///
    /// # Errors
    ///
    /// See [`SystemEventManager::register`].
    pub fn emitter<E: SystemEvent>(&mut self) -> EcsResult<SystemEventEmitter<E>> {
        let id = self.register::<E>()?;
        Ok(SystemEventEmitter {
            buffer: Arc::clone(&self.buffers[id as usize]),
            _marker: PhantomData,
        })
    }

    /// Receiver for `E`, registering it if needed.
    ///
    /// # Errors
    ///
    /// See [`SystemEventManager::register`].
    pub fn receiver<E: SystemEvent>(&mut self) -> EcsResult<SystemEventReceiver<E>> {
        let id = self.register::<E>()?;
        Ok(SystemEventReceiver {
            buffer: Arc::clone(&self.buffers[id as usize]),
            _marker: PhantomData,
        })
    }

    /// Empties every buffer.
    pub fn clear(&self) {
        for buffer in &self.buffers {
            buffer.events.lock().clear();
        }
    }

    /// True if no buffer holds an event.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(|b| b.events.lock().is_empty())
    }

    /// Registered names in ID order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.catalog.iter().map(|(&n, &id)| (id, n)).collect();
        names.sort_unstable();
        names.into_iter().map(|(_, n)| n).collect()
    }
}

/// Write side of a system-event buffer.
pub struct SystemEventEmitter<E: SystemEvent> {
    buffer: Arc<SystemEventBuffer>,
    _marker: PhantomData<fn(E)>,
}

impl<E: SystemEvent> SystemEventEmitter<E> {
    /// Appends an event for later systems of this tick.
    pub fn emit(&self, event: E) {
        self.buffer.events.lock().push(Box::new(event));
    }
}

/// Read side of a system-event buffer.
pub struct SystemEventReceiver<E: SystemEvent> {
    buffer: Arc<SystemEventBuffer>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: SystemEvent> SystemEventReceiver<E> {
    /// Events emitted so far this tick, in emission order.
    pub fn iter(&self) -> std::vec::IntoIter<E> {
        self.buffer
            .events
            .lock()
            .iter()
            .filter_map(|event| event.downcast_ref::<E>().cloned())
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.events.lock().len()
    }

    /// True if nothing was emitted this tick.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
