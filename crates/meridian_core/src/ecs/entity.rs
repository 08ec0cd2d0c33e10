//! # Entity Management
//!
//! Entities are dense 32-bit identifiers. IDs are handed out in increasing
//! order and recycled first-in first-out once destroyed, so a replica that
//! replays the same operations reproduces the same IDs.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EcsError, EcsResult};

/// Unique identifier for an entity.
///
/// The ID doubles as the key into the entity to archetype sparse index.
/// It carries no generation counter: a recycled ID refers to a new entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct EntityId(u32);

impl EntityId {
    /// Null/invalid entity ID. Never allocated.
    pub const NULL: Self = Self(u32::MAX);

    /// Wraps a raw ID.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw ID.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Checks if this entity ID is null/invalid.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity ID allocator with a FIFO free list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityAllocator {
    next_id: u32,
    free: VecDeque<EntityId>,
}

impl EntityAllocator {
    /// Creates an allocator starting at ID 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: 0,
            free: VecDeque::new(),
        }
    }

    /// Allocates an ID, reusing the oldest freed ID first.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::EntityIdExhausted`] once every ID below
    /// [`EntityId::NULL`] is live.
    pub fn allocate(&mut self) -> EcsResult<EntityId> {
        if let Some(id) = self.free.pop_front() {
            return Ok(id);
        }
        if self.next_id == EntityId::NULL.0 {
            return Err(EcsError::EntityIdExhausted);
        }
        let id = EntityId(self.next_id);
        self.next_id += 1;
        Ok(id)
    }

    /// Returns an ID to the free list.
    #[inline]
    pub fn release(&mut self, id: EntityId) {
        debug_assert!(id.0 < self.next_id, "released id {id} was never allocated");
        self.free.push_back(id);
    }

    /// Next never-used ID.
    #[inline]
    #[must_use]
    pub const fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Freed IDs in reuse order.
    pub fn free_ids(&self) -> impl ExactSizeIterator<Item = EntityId> + '_ {
        self.free.iter().copied()
    }

    /// Number of live IDs.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.next_id as usize - self.free.len()
    }

    /// Rebuilds an allocator from persisted counters.
    ///
    /// # Errors
    ///
    /// Rejects free lists with duplicates or IDs at or above `next_id`.
    pub fn from_parts(next_id: u32, free: Vec<EntityId>) -> Result<Self, String> {
        let mut seen = HashSet::with_capacity(free.len());
        for id in &free {
            if id.0 >= next_id {
                return Err(format!("free id {id} is not below next id {next_id}"));
            }
            if !seen.insert(*id) {
                return Err(format!("free id {id} listed twice"));
            }
        }
        Ok(Self {
            next_id,
            free: free.into(),
        })
    }

    /// Forgets every allocation.
    pub fn clear(&mut self) {
        self.next_id = 0;
        self.free.clear();
    }
}
