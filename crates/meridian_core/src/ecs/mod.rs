//! # Entity Component System
//!
//! Archetype storage, typed search handles and the per-phase scheduler.
//!
//! ## Storage Model
//!
//! - Every distinct component set is one archetype, keyed by a bitmap
//! - An archetype stores one dense column per component; row `i` of every
//!   column belongs to `entities[i]`
//! - Entity IDs are recycled in FIFO order
//! - Structural changes move an entity's row between archetypes

pub mod archetype;
pub mod bitmap;
pub mod column;
pub mod component;
pub mod entity;
mod filter;
pub mod query;
pub mod scheduler;
pub mod search;
pub mod sparse_set;
pub mod system;
pub mod system_event;
mod world;
pub mod world_state;

pub use archetype::{Archetype, ArchetypeId, VOID_ARCHETYPE};
pub use bitmap::Bitmap;
pub use column::{AnyColumn, Column};
pub use component::{Component, ComponentDescriptor, ComponentId, ComponentRegistry, RegisterCallback};
pub use entity::{EntityAllocator, EntityId};
pub use filter::{Filter, MAX_NESTING};
pub use query::{MatchKind, QueryParams, QueryRow};
pub use scheduler::{build_dependency_graph, DependencyGraph, SystemScheduler};
pub use search::{
    ComponentSet, Contains, ContainsMatch, Exact, ExactMatch, MatchMode, Ref, Search, SharedState, Single,
};
pub use sparse_set::SparseSet;
pub use system::{Dependencies, SystemFn, SystemHook, SystemInit};
pub use system_event::{SystemEvent, SystemEventEmitter, SystemEventManager, SystemEventReceiver};
pub use world::{World, WorldDescription};
pub use world_state::WorldState;
