//! # Meridian Core
//!
//! The in-process simulation engine of a game shard:
//! - Archetype-based entity-component storage
//! - A dependency-graph scheduler that runs non-conflicting systems in parallel
//! - Command intake and outbound event dispatch around each tick
//! - Deterministic snapshots whose hashes replicas compare
//!
//! ## Tick Flow
//!
//! ```text
//! commands ──enqueue──► CommandManager ──drain──► tick buffer
//!                                                     │
//!        PreUpdate ─► Update ─► PostUpdate ◄──────────┘
//!            │  systems read/write WorldState through typed handles
//!            ▼
//!   EventManager ──dispatch──► handlers        serialize ─► StateHash
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use meridian_core::{World, SystemHook};
//!
//! let mut world = World::new();
//! world.register_system("regen", SystemHook::Update, |init| {
//!     let living = init.contains::<(Health,)>()?;
//!     Ok(move || {
//!         for (_, (health,)) in living.iter() {
//!             health.update(|h| h.hp += 1)?;
//!         }
//!         Ok(())
//!     })
//! })?;
//! world.init();
//! world.tick()?; // init tick
//! world.tick()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod command;
pub mod config;
pub mod ecs;
pub mod error;
pub mod event;
pub mod snapshot;

pub use command::{Command, CommandContext, CommandId, CommandManager, CommandReader, RawCommand};
pub use config::WorldConfig;
pub use ecs::{
    Component, ComponentId, Contains, EntityId, Exact, MatchKind, QueryParams, QueryRow, Ref, Search, Single,
    SystemEvent, SystemHook, SystemInit, World, WorldState,
};
pub use error::{
    CommandError, EcsError, EcsResult, EventError, QueryError, SnapshotError, SystemError, SystemFailure, TickError,
};
pub use event::{Event, EventEmitter, EventHandler, EventKind, EventManager, RawEvent};
pub use snapshot::{Snapshot, StateHash};
