//! # Core Error Types
//!
//! All errors that can occur in the engine core. Structural errors are
//! returned to the caller; only engine bugs panic.

use thiserror::Error;

use crate::ecs::entity::EntityId;
use crate::ecs::system::SystemHook;

/// Errors raised by world state, searches and system registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// The entity is not alive.
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    /// The entity is alive but does not carry the component.
    #[error("component {component} not found on entity {entity}")]
    ComponentNotFound {
        /// Entity that was looked up.
        entity: EntityId,
        /// Registered name of the component.
        component: String,
    },

    /// No component is registered under the name.
    #[error("component {0} is not registered")]
    ComponentNotRegistered(String),

    /// Two different Rust types were registered under the same name.
    #[error("component {name} already registered with a different type")]
    ComponentTypeMismatch {
        /// The conflicting name.
        name: String,
    },

    /// Two different Rust types were registered as the same system event.
    #[error("system event {0} already registered with a different type")]
    SystemEventTypeMismatch(String),

    /// The entity exists but is not in the archetype a search expects.
    #[error("entity {0} does not match the search archetype")]
    ArchetypeMismatch(EntityId),

    /// Every 32-bit entity ID is in use.
    #[error("entity id space exhausted")]
    EntityIdExhausted,

    /// The registration callback rejected a component.
    #[error("component {name} rejected by registration callback: {reason}")]
    RegistrationRejected {
        /// Name of the rejected component.
        name: String,
        /// Reason given by the callback.
        reason: String,
    },

    /// A system declared two fields of the same command, event or system-event type.
    #[error("system {system} declares {kind} {name} more than once")]
    DuplicateSystemField {
        /// System being registered.
        system: String,
        /// Field kind ("command", "event" or "system event").
        kind: &'static str,
        /// Registered name of the duplicated type.
        name: String,
    },

    /// Systems cannot be registered once the world has been initialised.
    #[error("cannot register system {0} after init")]
    RegistrationClosed(String),
}

/// Result alias for world state operations.
pub type EcsResult<T> = Result<T, EcsError>;

/// Failure reported by a user system body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SystemError {
    /// Game logic rejected the tick.
    #[error("{0}")]
    Failed(String),

    /// A world state operation failed inside the system.
    #[error(transparent)]
    Ecs(#[from] EcsError),

    /// Emitting an event failed inside the system.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The system body panicked.
    #[error("system panicked: {0}")]
    Panicked(String),
}

impl SystemError {
    /// Creates a game-logic failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A single system failure inside a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFailure {
    /// Name the system was registered under.
    pub system: String,
    /// What went wrong.
    pub error: SystemError,
}

impl std::fmt::Display for SystemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.system, self.error)
    }
}

fn join_failures(failures: &[SystemFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that abort a tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickError {
    /// `tick()` was called before `init()`.
    #[error("world is not initialised")]
    NotInitialized,

    /// An init system failed on the first tick.
    #[error("init system failed: {0}")]
    InitFailed(SystemFailure),

    /// One or more systems of a phase failed; later phases did not run.
    #[error("{hook:?} phase failed: {}", join_failures(.failures))]
    PhaseFailed {
        /// The phase that failed.
        hook: SystemHook,
        /// Every failed system, in completion order.
        failures: Vec<SystemFailure>,
    },
}

/// Errors raised by the command manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No command is registered under the name.
    #[error("command {0} is not registered")]
    NotRegistered(String),

    /// Two different Rust types were registered under the same name.
    #[error("command {0} already registered with a different type")]
    TypeMismatch(String),

    /// The payload did not deserialize into the registered type.
    #[error("invalid payload for command {name}: {reason}")]
    InvalidPayload {
        /// Command name.
        name: String,
        /// Deserializer message.
        reason: String,
    },

    /// The command record is missing a required field.
    #[error("command record missing {0}")]
    MissingField(&'static str),
}

/// Errors raised by the event manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The payload could not be serialized.
    #[error("failed to encode event {name}: {reason}")]
    Encode {
        /// Event name.
        name: String,
        /// Serializer message.
        reason: String,
    },

    /// A handler rejected an event.
    #[error("handler failed for event {name}: {reason}")]
    Handler {
        /// Event name.
        name: String,
        /// Handler message.
        reason: String,
    },

    /// Dispatch finished but some handlers failed.
    #[error("{} event handler(s) failed", .0.len())]
    Dispatch(Vec<EventError>),
}

/// Errors raised while evaluating a state query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The query parameters are inconsistent.
    #[error("invalid query: {0}")]
    InvalidParams(String),

    /// The where clause failed to parse.
    #[error("invalid where clause at {position}: {message}")]
    Parse {
        /// Byte offset of the problem.
        position: usize,
        /// What was expected.
        message: String,
    },

    /// The where clause failed on a row.
    #[error("where clause evaluation failed: {0}")]
    Eval(String),

    /// A component value could not be converted to a row.
    #[error("failed to encode component {0}")]
    Encode(String),
}

/// Errors raised by the snapshot codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The buffer ended before the structure was complete.
    #[error("snapshot truncated at offset {0}")]
    Truncated(usize),

    /// The envelope magic bytes are wrong.
    #[error("bad snapshot magic")]
    BadMagic,

    /// The envelope was written by an unknown format version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    /// The CRC trailer does not match the content.
    #[error("snapshot checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the trailer.
        expected: u32,
        /// Checksum of the bytes read.
        computed: u32,
    },

    /// The state blob does not hash to the recorded state hash.
    #[error("snapshot state hash mismatch")]
    HashMismatch,

    /// A column names a component that is not registered in this process.
    #[error("snapshot references unregistered component {0}")]
    UnknownComponent(String),

    /// The decoded data breaks a structural invariant.
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    /// A component value failed to encode.
    #[error("failed to encode component {name}: {reason}")]
    Encode {
        /// Component name.
        name: String,
        /// Serializer message.
        reason: String,
    },

    /// A component value failed to decode.
    #[error("failed to decode component {name}: {reason}")]
    Decode {
        /// Component name.
        name: String,
        /// Deserializer message.
        reason: String,
    },
}
