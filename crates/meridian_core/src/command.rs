//! # Command Manager
//!
//! Inbound commands arrive from the network layer as raw records
//! `{name, address, persona, payload}`. Each registered command type owns
//! one FIFO queue with its own lock, so ingestion threads never contend
//! with each other across types and never touch world storage.
//!
//! Once per tick the driver calls [`CommandManager::drain`], which moves
//! every pending queue into its per-tick buffer in one step. Systems read
//! that buffer through a [`CommandReader`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// Numeric command ID, dense from 0.
pub type CommandId = u32;

/// Highest assignable command ID.
pub const MAX_COMMAND_ID: CommandId = u32::MAX - 2;

/// Marker trait for command payload types.
pub trait Command: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Registration key and wire tag.
    const NAME: &'static str;
}

/// A command as received from the network layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommand {
    /// Registered command name.
    pub name: String,
    /// Sender address.
    pub address: String,
    /// Sender persona.
    pub persona: String,
    /// JSON-encoded payload.
    pub payload: Vec<u8>,
}

impl RawCommand {
    /// Encodes a typed command into a raw record.
    ///
    /// # Errors
    ///
    /// [`CommandError::InvalidPayload`] if the payload cannot be serialized.
    pub fn new<T: Command>(
        persona: impl Into<String>,
        address: impl Into<String>,
        payload: &T,
    ) -> Result<Self, CommandError> {
        let payload = serde_json::to_vec(payload).map_err(|e| CommandError::InvalidPayload {
            name: T::NAME.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: T::NAME.to_string(),
            address: address.into(),
            persona: persona.into(),
            payload,
        })
    }
}

/// A decoded command handed to systems.
#[derive(Debug)]
pub struct CommandContext<T> {
    /// Sender persona.
    pub persona: String,
    /// Sender address.
    pub address: String,
    /// Decoded payload.
    pub payload: Arc<T>,
}

impl<T> Clone for CommandContext<T> {
    fn clone(&self) -> Self {
        Self {
            persona: self.persona.clone(),
            address: self.address.clone(),
            payload: Arc::clone(&self.payload),
        }
    }
}

type Payload = Arc<dyn Any + Send + Sync>;

struct Decoded {
    raw: RawCommand,
    payload: Payload,
}

struct CommandQueue {
    type_id: TypeId,
    decode: fn(&[u8]) -> Result<Payload, String>,
    pending: Mutex<Vec<Decoded>>,
    current: RwLock<Vec<Decoded>>,
}

fn decode_payload<T: Command>(bytes: &[u8]) -> Result<Payload, String> {
    serde_json::from_slice::<T>(bytes)
        .map(|value| Arc::new(value) as Payload)
        .map_err(|e| e.to_string())
}

#[derive(Default)]
struct Catalog {
    ids: HashMap<&'static str, CommandId>,
    names: Vec<&'static str>,
    queues: Vec<Arc<CommandQueue>>,
}

/// Thread-safe command ingestion and per-tick buffers.
#[derive(Default)]
pub struct CommandManager {
    catalog: RwLock<Catalog>,
}

impl CommandManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`, or returns its existing ID.
    ///
    /// # Errors
    ///
    /// [`CommandError::TypeMismatch`] if the name belongs to another type.
    ///
    /// # Panics
    ///
    /// Panics when the ID space is exhausted.
    pub fn register<T: Command>(&self) -> Result<CommandId, CommandError> {
        let mut catalog = self.catalog.write();
        if let Some(&id) = catalog.ids.get(T::NAME) {
            if catalog.queues[id as usize].type_id != TypeId::of::<T>() {
                return Err(CommandError::TypeMismatch(T::NAME.to_string()));
            }
            return Ok(id);
        }
        let id = CommandId::try_from(catalog.queues.len()).unwrap_or(CommandId::MAX);
        assert!(id <= MAX_COMMAND_ID, "command registration ceiling exceeded");
        catalog.ids.insert(T::NAME, id);
        catalog.names.push(T::NAME);
        catalog.queues.push(Arc::new(CommandQueue {
            type_id: TypeId::of::<T>(),
            decode: decode_payload::<T>,
            pending: Mutex::new(Vec::new()),
            current: RwLock::new(Vec::new()),
        }));
        tracing::debug!(command = T::NAME, id, "registered command");
        Ok(id)
    }

    /// Decodes a raw command and appends it to its type's queue.
    ///
    /// # Errors
    ///
    /// - [`CommandError::MissingField`] for an empty name or persona
    /// - [`CommandError::NotRegistered`] for an unknown name
    /// - [`CommandError::InvalidPayload`] if the payload does not decode
    pub fn enqueue(&self, raw: RawCommand) -> Result<(), CommandError> {
        if raw.name.is_empty() {
            return Err(CommandError::MissingField("name"));
        }
        if raw.persona.is_empty() {
            return Err(CommandError::MissingField("persona"));
        }
        let queue = {
            let catalog = self.catalog.read();
            let id = *catalog
                .ids
                .get(raw.name.as_str())
                .ok_or_else(|| CommandError::NotRegistered(raw.name.clone()))?;
            Arc::clone(&catalog.queues[id as usize])
        };
        let payload = (queue.decode)(&raw.payload).map_err(|reason| CommandError::InvalidPayload {
            name: raw.name.clone(),
            reason,
        })?;
        queue.pending.lock().push(Decoded { raw, payload });
        Ok(())
    }

    /// Encodes and enqueues a typed command.
    ///
    /// # Errors
    ///
    /// Same as [`CommandManager::enqueue`].
    pub fn enqueue_typed<T: Command>(
        &self,
        persona: &str,
        address: &str,
        payload: &T,
    ) -> Result<(), CommandError> {
        self.enqueue(RawCommand::new(persona, address, payload)?)
    }

    /// Moves every pending queue into its per-tick buffer.
    ///
    /// All queue locks are held together, so a concurrent `enqueue` lands
    /// either wholly before or wholly after the drain. Returns the drained
    /// records, by command ID then arrival order.
    pub fn drain(&self) -> Vec<RawCommand> {
        let catalog = self.catalog.read();
        let mut guards: Vec<_> = catalog.queues.iter().map(|q| q.pending.lock()).collect();
        let mut drained = Vec::new();
        for (queue, pending) in catalog.queues.iter().zip(guards.iter_mut()) {
            let mut current = queue.current.write();
            current.clear();
            // Swap keeps both allocations alive for the next tick
            std::mem::swap(&mut *current, &mut **pending);
            drained.extend(current.iter().map(|d| d.raw.clone()));
        }
        drained
    }

    /// Drops pending and buffered commands.
    pub fn clear(&self) {
        let catalog = self.catalog.read();
        for queue in &catalog.queues {
            queue.pending.lock().clear();
            queue.current.write().clear();
        }
    }

    /// Number of commands waiting for the next drain.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        let catalog = self.catalog.read();
        catalog.queues.iter().map(|q| q.pending.lock().len()).sum()
    }

    /// Registered names in ID order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.catalog.read().names.clone()
    }

    /// Reader over `T`'s per-tick buffer, registering `T` if needed.
    ///
    /// # Errors
    ///
    /// See [`CommandManager::register`].
    pub fn reader<T: Command>(&self) -> Result<CommandReader<T>, CommandError> {
        let id = self.register::<T>()?;
        let queue = Arc::clone(&self.catalog.read().queues[id as usize]);
        Ok(CommandReader {
            queue,
            _marker: PhantomData,
        })
    }
}

/// Read access to one command type's per-tick buffer.
pub struct CommandReader<T: Command> {
    queue: Arc<CommandQueue>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Command> CommandReader<T> {
    /// Commands drained for this tick, in arrival order.
    pub fn iter(&self) -> std::vec::IntoIter<CommandContext<T>> {
        self.queue
            .current
            .read()
            .iter()
            .filter_map(|decoded| {
                let payload = Arc::clone(&decoded.payload).downcast::<T>().ok()?;
                Some(CommandContext {
                    persona: decoded.raw.persona.clone(),
                    address: decoded.raw.address.clone(),
                    payload,
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Number of commands in this tick's buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.current.read().len()
    }

    /// True if this tick has no command of this type.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
