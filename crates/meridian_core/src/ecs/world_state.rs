//! # World State
//!
//! Owns entity allocation, the entity to archetype index and the archetype
//! table. Every structural mutation goes through here so the invariants
//! below hold at every public boundary:
//!
//! 1. Every live entity sits in exactly one archetype, at exactly one row,
//!    and that row maps back to it.
//! 2. Free and live IDs are disjoint, and every ID is below `next_id`.
//! 3. There is exactly one archetype per distinct component bitmap.
//! 4. Every column is as long as its archetype's entity list.
//!
//! [`WorldState::verify`] checks all of them.

use std::collections::{HashMap, HashSet};

use super::archetype::{pair_mut, Archetype, ArchetypeId, VOID_ARCHETYPE};
use super::bitmap::Bitmap;
use super::component::{Component, ComponentId, ComponentRegistry, RegisterCallback};
use super::entity::{EntityAllocator, EntityId};
use super::search::ComponentSet;
use super::sparse_set::SparseSet;
use crate::error::{EcsError, EcsResult};

/// Entity and component storage for one world.
pub struct WorldState {
    registry: ComponentRegistry,
    entities: EntityAllocator,
    /// Entity ID -> archetype ID.
    locations: SparseSet,
    archetypes: Vec<Archetype>,
    exact_index: HashMap<Bitmap, ArchetypeId>,
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldState {
    /// Creates an empty state holding only the void archetype.
    #[must_use]
    pub fn new() -> Self {
        let mut state = Self {
            registry: ComponentRegistry::new(),
            entities: EntityAllocator::new(),
            locations: SparseSet::new(),
            archetypes: Vec::new(),
            exact_index: HashMap::new(),
        };
        state.push_void_archetype();
        state
    }

    fn push_void_archetype(&mut self) {
        debug_assert!(self.archetypes.is_empty());
        self.archetypes
            .push(Archetype::new(VOID_ARCHETYPE, Bitmap::new(), Vec::new()));
        self.exact_index.insert(Bitmap::new(), VOID_ARCHETYPE);
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    /// Registers a component type. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`ComponentRegistry::register`].
    pub fn register_component<T: Component>(&mut self) -> EcsResult<ComponentId> {
        self.registry.register::<T>()
    }

    /// Installs the callback run for every newly registered component.
    pub fn on_component_register(&mut self, callback: RegisterCallback) {
        self.registry.set_on_register(callback);
    }

    /// The component registry.
    #[must_use]
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Creates an entity with no components.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::EntityIdExhausted`] when no ID is left.
    pub fn new_entity(&mut self) -> EcsResult<EntityId> {
        self.new_entity_in(VOID_ARCHETYPE)
    }

    /// Creates an entity directly in the archetype for `components`,
    /// with default values.
    ///
    /// # Errors
    ///
    /// Fails if a bit names an unregistered component or no ID is left.
    pub fn new_entity_with_archetype(&mut self, components: &Bitmap) -> EcsResult<EntityId> {
        let archetype = self.find_or_create_archetype(components)?;
        self.new_entity_in(archetype)
    }

    /// Creates an entity carrying exactly the given component values.
    ///
    /// # Errors
    ///
    /// Fails if a component cannot be registered or no ID is left.
    pub fn spawn<Q: ComponentSet>(&mut self, values: Q) -> EcsResult<EntityId> {
        let components = Q::register(self)?;
        let entity = self.new_entity_with_archetype(&components)?;
        values.insert(self, entity)?;
        Ok(entity)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn new_entity_in(&mut self, archetype: ArchetypeId) -> EcsResult<EntityId> {
        let entity = self.entities.allocate()?;
        self.archetypes[archetype].push_entity(entity);
        self.locations.set(entity.get(), archetype as u32);
        Ok(entity)
    }

    /// Destroys an entity. Returns whether it existed.
    pub fn remove_entity(&mut self, entity: EntityId) -> bool {
        let Some(archetype) = self.archetype_of(entity) else {
            return false;
        };
        let removed = self.archetypes[archetype].remove_entity(entity);
        debug_assert!(removed, "entity index pointed at the wrong archetype");
        self.locations.remove(entity.get());
        self.entities.release(entity);
        true
    }

    /// Checks whether an entity is alive.
    #[inline]
    #[must_use]
    pub fn contains_entity(&self, entity: EntityId) -> bool {
        self.locations.contains(entity.get())
    }

    /// Archetype currently holding an entity.
    #[inline]
    #[must_use]
    pub fn archetype_of(&self, entity: EntityId) -> Option<ArchetypeId> {
        self.locations.get(entity.get()).map(|a| a as ArchetypeId)
    }

    /// Number of live entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.locations.len()
    }

    /// The entity allocator.
    #[must_use]
    pub fn allocator(&self) -> &EntityAllocator {
        &self.entities
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    fn locate<T: Component>(&self, entity: EntityId) -> EcsResult<(ArchetypeId, ComponentId)> {
        let archetype = self
            .archetype_of(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        let component = self.registry.id::<T>().map_err(|e| match e {
            EcsError::ComponentNotRegistered(component) => {
                EcsError::ComponentNotFound { entity, component }
            }
            other => other,
        })?;
        if !self.archetypes[archetype].components().contains(component) {
            return Err(EcsError::ComponentNotFound {
                entity,
                component: T::NAME.to_string(),
            });
        }
        Ok((archetype, component))
    }

    /// Reads a component by reference.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] or [`EcsError::ComponentNotFound`].
    pub fn component<T: Component>(&self, entity: EntityId) -> EcsResult<&T> {
        let (archetype, component) = self.locate::<T>(entity)?;
        self.archetypes[archetype]
            .get::<T>(component, entity)
            .ok_or_else(|| EcsError::ComponentNotFound {
                entity,
                component: T::NAME.to_string(),
            })
    }

    /// Reads a component by value.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] or [`EcsError::ComponentNotFound`].
    pub fn get_component<T: Component>(&self, entity: EntityId) -> EcsResult<T> {
        self.component::<T>(entity).cloned()
    }

    /// Checks whether an entity carries `T`.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] if the entity is not alive.
    pub fn has_component<T: Component>(&self, entity: EntityId) -> EcsResult<bool> {
        match self.locate::<T>(entity) {
            Ok(_) => Ok(true),
            Err(EcsError::ComponentNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Mutates a component in place.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] or [`EcsError::ComponentNotFound`].
    pub fn update_component<T: Component, R>(
        &mut self,
        entity: EntityId,
        f: impl FnOnce(&mut T) -> R,
    ) -> EcsResult<R> {
        let (archetype, component) = self.locate::<T>(entity)?;
        let value = self.archetypes[archetype]
            .get_mut::<T>(component, entity)
            .ok_or_else(|| EcsError::ComponentNotFound {
                entity,
                component: T::NAME.to_string(),
            })?;
        Ok(f(value))
    }

    /// Writes a component.
    ///
    /// Updates in place when the entity already carries `T`; otherwise the
    /// entity moves to the archetype with `T` added. The component is
    /// registered on first use.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] if the entity is not alive.
    pub fn set_component<T: Component>(&mut self, entity: EntityId, value: T) -> EcsResult<()> {
        let component = self.registry.register::<T>()?;
        let source = self
            .archetype_of(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;

        if let Some(slot) = self.archetypes[source].get_mut::<T>(component, entity) {
            *slot = value;
            return Ok(());
        }

        let target = self.archetypes[source].components().with(component);
        let destination = self.find_or_create_archetype(&target)?;
        self.move_entity(entity, source, destination);
        let slot = self.archetypes[destination]
            .get_mut::<T>(component, entity)
            .ok_or_else(|| EcsError::ComponentNotFound {
                entity,
                component: T::NAME.to_string(),
            })?;
        *slot = value;
        Ok(())
    }

    /// Removes a component, moving the entity to the smaller archetype.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] or [`EcsError::ComponentNotFound`].
    pub fn remove_component<T: Component>(&mut self, entity: EntityId) -> EcsResult<()> {
        let (source, component) = self.locate::<T>(entity)?;
        let target = self.archetypes[source].components().without(component);
        let destination = self.find_or_create_archetype(&target)?;
        self.move_entity(entity, source, destination);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn move_entity(&mut self, entity: EntityId, source: ArchetypeId, destination: ArchetypeId) {
        let (src, dst) = pair_mut(&mut self.archetypes, source, destination);
        let moved = src.move_entity(dst, entity);
        debug_assert!(moved.is_some(), "entity {entity} missing from its archetype");
        self.locations.set(entity.get(), destination as u32);
    }

    // ------------------------------------------------------------------
    // Archetypes
    // ------------------------------------------------------------------

    /// Archetype with exactly this bitmap, creating it on first use.
    ///
    /// # Errors
    ///
    /// [`EcsError::ComponentNotRegistered`] if a bit is not a registered ID.
    pub fn find_or_create_archetype(&mut self, components: &Bitmap) -> EcsResult<ArchetypeId> {
        if let Some(&id) = self.exact_index.get(components) {
            return Ok(id);
        }
        let columns = components
            .iter()
            .map(|component| {
                self.registry
                    .new_column(component)
                    .ok_or_else(|| EcsError::ComponentNotRegistered(format!("#{component}")))
            })
            .collect::<EcsResult<Vec<_>>>()?;
        let id = self.archetypes.len();
        self.archetypes
            .push(Archetype::new(id, components.clone(), columns));
        self.exact_index.insert(components.clone(), id);
        tracing::trace!(archetype = id, components = components.count(), "created archetype");
        Ok(id)
    }

    /// Archetype whose bitmap equals `components`.
    #[inline]
    #[must_use]
    pub fn archetype_exact(&self, components: &Bitmap) -> Option<ArchetypeId> {
        self.exact_index.get(components).copied()
    }

    /// Archetypes whose bitmap is a superset of `components`, in ID order.
    #[must_use]
    pub fn archetypes_containing(&self, components: &Bitmap) -> Vec<ArchetypeId> {
        self.archetypes
            .iter()
            .filter(|archetype| archetype.contains(components))
            .map(Archetype::id)
            .collect()
    }

    /// The archetype table, indexed by archetype ID.
    #[must_use]
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drops every entity and archetype. Registered components are kept.
    pub fn reset(&mut self) {
        self.entities.clear();
        self.locations.clear();
        self.archetypes.clear();
        self.exact_index.clear();
        self.push_void_archetype();
    }

    /// Replaces entities and archetypes with restored ones.
    ///
    /// Nothing changes unless the restored data passes [`WorldState::verify`].
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn replace_storage(
        &mut self,
        entities: EntityAllocator,
        archetypes: Vec<Archetype>,
    ) -> Result<(), String> {
        let mut locations = SparseSet::new();
        let mut exact_index = HashMap::with_capacity(archetypes.len());
        for archetype in &archetypes {
            if exact_index
                .insert(archetype.components().clone(), archetype.id())
                .is_some()
            {
                return Err(format!("duplicate archetype bitmap at {}", archetype.id()));
            }
            for &entity in archetype.entities() {
                if locations.contains(entity.get()) {
                    return Err(format!("entity {entity} stored in two archetypes"));
                }
                locations.set(entity.get(), archetype.id() as u32);
            }
        }

        let mut candidate = Self {
            registry: ComponentRegistry::new(),
            entities,
            locations,
            archetypes,
            exact_index,
        };
        candidate.verify()?;

        std::mem::swap(&mut self.entities, &mut candidate.entities);
        std::mem::swap(&mut self.locations, &mut candidate.locations);
        std::mem::swap(&mut self.archetypes, &mut candidate.archetypes);
        std::mem::swap(&mut self.exact_index, &mut candidate.exact_index);
        Ok(())
    }

    /// Checks every structural invariant, returning the first violation.
    ///
    /// # Errors
    ///
    /// A description of the broken invariant.
    pub fn verify(&self) -> Result<(), String> {
        match self.archetypes.first() {
            Some(void) if void.components().is_empty() => {}
            _ => return Err("archetype 0 must be the void archetype".to_string()),
        }

        let mut live = 0usize;
        for (index, archetype) in self.archetypes.iter().enumerate() {
            if archetype.id() != index {
                return Err(format!("archetype at {index} has id {}", archetype.id()));
            }
            if self.exact_index.get(archetype.components()) != Some(&index) {
                return Err(format!("archetype {index} missing from exact index"));
            }
            archetype.verify()?;
            for &entity in archetype.entities() {
                if self.archetype_of(entity) != Some(index) {
                    return Err(format!("entity {entity} index disagrees with archetype {index}"));
                }
                if entity.get() >= self.entities.next_id() {
                    return Err(format!("live entity {entity} is not below next id"));
                }
            }
            live += archetype.len();
        }
        if self.exact_index.len() != self.archetypes.len() {
            return Err("exact index holds stale bitmaps".to_string());
        }
        if live != self.locations.len() {
            return Err(format!(
                "{} entities indexed, {live} stored",
                self.locations.len()
            ));
        }

        let mut free = HashSet::new();
        for id in self.entities.free_ids() {
            if !free.insert(id) {
                return Err(format!("entity {id} freed twice"));
            }
            if self.contains_entity(id) {
                return Err(format!("entity {id} is both live and free"));
            }
            if id.get() >= self.entities.next_id() {
                return Err(format!("free entity {id} is not below next id"));
            }
        }
        if live + free.len() != self.entities.next_id() as usize {
            return Err(format!(
                "{live} live + {} free != next id {}",
                free.len(),
                self.entities.next_id()
            ));
        }
        Ok(())
    }

    /// Structural equality: counters, free list order, archetypes, rows
    /// and column values.
    #[must_use]
    pub fn same_contents(&self, other: &Self) -> bool {
        self.entities == other.entities
            && self.archetypes.len() == other.archetypes.len()
            && self
                .archetypes
                .iter()
                .zip(&other.archetypes)
                .all(|(a, b)| a.same_contents(b))
            && self.locations.iter().eq(other.locations.iter())
    }
}

impl std::fmt::Debug for WorldState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldState")
            .field("registry", &self.registry)
            .field("entities", &self.entity_count())
            .field("archetypes", &self.archetypes.len())
            .finish()
    }
}
