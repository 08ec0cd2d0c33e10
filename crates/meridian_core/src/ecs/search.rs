//! # Searches and Component Handles
//!
//! Systems never hold references into archetype storage. They hold
//! handles keyed by entity ID and resolve them on every access, so an
//! archetype move or swap-remove between two accesses is harmless.
//!
//! Three handle kinds exist:
//!
//! - [`Ref<T>`]: one component on one entity
//! - [`Exact<Q>`]: entities whose component set is exactly `Q`
//! - [`Contains<Q>`]: entities whose component set includes `Q`
//!
//! `Q` is a tuple of component types, e.g. `Exact<(Position, Velocity)>`.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use super::archetype::{Archetype, ArchetypeId};
use super::bitmap::Bitmap;
use super::component::Component;
use super::entity::EntityId;
use super::world_state::WorldState;
use crate::error::{EcsError, EcsResult};

/// World state shared between the world and every handle.
pub type SharedState = Arc<RwLock<WorldState>>;

// ============================================================================
// SINGLE COMPONENT REFERENCE
// ============================================================================

/// Handle to one component of one entity.
pub struct Ref<T: Component> {
    state: SharedState,
    entity: EntityId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> Ref<T> {
    /// Attaches a handle to an entity. Does not check that it exists.
    #[must_use]
    pub fn attach(state: &SharedState, entity: EntityId) -> Self {
        Self {
            state: Arc::clone(state),
            entity,
            _marker: PhantomData,
        }
    }

    /// The entity this handle points at.
    #[inline]
    #[must_use]
    pub const fn entity(&self) -> EntityId {
        self.entity
    }

    /// Reads the component.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] or [`EcsError::ComponentNotFound`].
    pub fn get(&self) -> EcsResult<T> {
        self.state.read().get_component::<T>(self.entity)
    }

    /// Writes the component, adding it if the entity does not carry it yet.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] if the entity is gone.
    pub fn set(&self, value: T) -> EcsResult<()> {
        self.state.write().set_component(self.entity, value)
    }

    /// Mutates the component through a copy, then writes it back.
    ///
    /// No lock is held while `f` runs, so `f` may use other handles. If `f`
    /// removes the component or destroys the entity, the write-back fails
    /// and the change is lost.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] or [`EcsError::ComponentNotFound`].
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> EcsResult<R> {
        let mut value = self.get()?;
        let output = f(&mut value);
        self.state
            .write()
            .update_component(self.entity, |slot: &mut T| *slot = value)?;
        Ok(output)
    }

    /// Removes the component from the entity.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] or [`EcsError::ComponentNotFound`].
    pub fn remove(&self) -> EcsResult<()> {
        self.state.write().remove_component::<T>(self.entity)
    }
}

impl<T: Component> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self::attach(&self.state, self.entity)
    }
}

impl<T: Component> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ref<{}>({})", T::NAME, self.entity)
    }
}

/// Access to a single component type on arbitrary entities.
///
/// Declared by systems that attach, add or remove one component on
/// entities they found elsewhere.
pub struct Single<T: Component> {
    state: SharedState,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> Single<T> {
    pub(crate) fn new(state: &SharedState) -> EcsResult<Self> {
        state.write().register_component::<T>()?;
        Ok(Self {
            state: Arc::clone(state),
            _marker: PhantomData,
        })
    }

    /// Attaches a handle to an entity.
    #[must_use]
    pub fn attach(&self, entity: EntityId) -> Ref<T> {
        Ref::attach(&self.state, entity)
    }
}

// ============================================================================
// COMPONENT SETS
// ============================================================================

/// A tuple of component types searched together.
///
/// Implemented for tuples of one to eight components. A tuple of values
/// can also be inserted onto an entity.
pub trait ComponentSet: Send + Sync + 'static {
    /// Tuple of [`Ref`] handles, one per component.
    type Refs;

    /// Registers every component, returning their bitmap.
    ///
    /// # Errors
    ///
    /// Fails if a component cannot be registered.
    fn register(state: &mut WorldState) -> EcsResult<Bitmap>;

    /// Builds handles for an entity.
    fn refs(state: &SharedState, entity: EntityId) -> Self::Refs;

    /// Writes every value onto an entity.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`] if the entity is not alive.
    fn insert(self, state: &mut WorldState, entity: EntityId) -> EcsResult<()>;
}

macro_rules! impl_component_set {
    ($($name:ident),+) => {
        impl<$($name: Component),+> ComponentSet for ($($name,)+) {
            type Refs = ($(Ref<$name>,)+);

            fn register(state: &mut WorldState) -> EcsResult<Bitmap> {
                let mut components = Bitmap::new();
                $(components.set(state.register_component::<$name>()?);)+
                Ok(components)
            }

            fn refs(state: &SharedState, entity: EntityId) -> Self::Refs {
                ($(Ref::<$name>::attach(state, entity),)+)
            }

            #[allow(non_snake_case)]
            fn insert(self, state: &mut WorldState, entity: EntityId) -> EcsResult<()> {
                let ($($name,)+) = self;
                $(state.set_component(entity, $name)?;)+
                Ok(())
            }
        }
    };
}

impl_component_set!(A);
impl_component_set!(A, B);
impl_component_set!(A, B, C);
impl_component_set!(A, B, C, D);
impl_component_set!(A, B, C, D, E);
impl_component_set!(A, B, C, D, E, F);
impl_component_set!(A, B, C, D, E, F, G);
impl_component_set!(A, B, C, D, E, F, G, H);

// ============================================================================
// SEARCHES
// ============================================================================

/// How a search matches archetype bitmaps.
pub trait MatchMode: Send + Sync + 'static {
    /// Archetypes matched by `components`, in archetype ID order.
    fn archetypes(state: &WorldState, components: &Bitmap) -> Vec<ArchetypeId>;

    /// Whether one archetype matches.
    fn matches(archetype: &Archetype, components: &Bitmap) -> bool;
}

/// Bitmap equality.
pub struct ExactMatch;

impl MatchMode for ExactMatch {
    fn archetypes(state: &WorldState, components: &Bitmap) -> Vec<ArchetypeId> {
        state.archetype_exact(components).into_iter().collect()
    }

    fn matches(archetype: &Archetype, components: &Bitmap) -> bool {
        archetype.exact(components)
    }
}

/// Bitmap superset.
pub struct ContainsMatch;

impl MatchMode for ContainsMatch {
    fn archetypes(state: &WorldState, components: &Bitmap) -> Vec<ArchetypeId> {
        state.archetypes_containing(components)
    }

    fn matches(archetype: &Archetype, components: &Bitmap) -> bool {
        archetype.contains(components)
    }
}

/// Entities whose component set is exactly `Q`.
pub type Exact<Q> = Search<Q, ExactMatch>;

/// Entities whose component set includes `Q`.
pub type Contains<Q> = Search<Q, ContainsMatch>;

/// Typed search over the world state.
pub struct Search<Q: ComponentSet, M: MatchMode> {
    state: SharedState,
    components: Bitmap,
    _marker: PhantomData<fn() -> (Q, M)>,
}

impl<Q: ComponentSet, M: MatchMode> Search<Q, M> {
    /// Registers `Q`'s components and builds the search.
    ///
    /// # Errors
    ///
    /// Fails if a component cannot be registered.
    pub fn new(state: &SharedState) -> EcsResult<Self> {
        let components = Q::register(&mut state.write())?;
        Ok(Self {
            state: Arc::clone(state),
            components,
            _marker: PhantomData,
        })
    }

    /// Bitmap of the searched components.
    #[must_use]
    pub fn components(&self) -> &Bitmap {
        &self.components
    }

    fn matched_entities(&self) -> Vec<EntityId> {
        let state = self.state.read();
        M::archetypes(&state, &self.components)
            .into_iter()
            .flat_map(|id| state.archetypes()[id].entities().iter().copied())
            .collect()
    }

    /// Iterates matching entities with their handles.
    ///
    /// The entity list is captured when the iterator is created; entities
    /// created during iteration are not visited and handles of entities
    /// destroyed during iteration return [`EcsError::EntityNotFound`].
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, Q::Refs)> + '_ {
        self.matched_entities()
            .into_iter()
            .map(move |entity| (entity, Q::refs(&self.state, entity)))
    }

    /// Matching entity IDs, in archetype then row order.
    #[must_use]
    pub fn entities(&self) -> Vec<EntityId> {
        self.matched_entities()
    }

    /// Number of matching entities.
    #[must_use]
    pub fn count(&self) -> usize {
        let state = self.state.read();
        M::archetypes(&state, &self.components)
            .into_iter()
            .map(|id| state.archetypes()[id].len())
            .sum()
    }

    fn check(&self, state: &WorldState, entity: EntityId) -> EcsResult<()> {
        let archetype = state
            .archetype_of(entity)
            .ok_or(EcsError::EntityNotFound(entity))?;
        if M::matches(&state.archetypes()[archetype], &self.components) {
            Ok(())
        } else {
            Err(EcsError::ArchetypeMismatch(entity))
        }
    }

    /// Handles for one entity.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`], or [`EcsError::ArchetypeMismatch`] if the
    /// entity does not match this search.
    pub fn get_by_id(&self, entity: EntityId) -> EcsResult<Q::Refs> {
        self.check(&self.state.read(), entity)?;
        Ok(Q::refs(&self.state, entity))
    }

    /// Creates an entity with exactly `Q`'s components, default-valued.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityIdExhausted`] when no ID is left.
    pub fn create(&self) -> EcsResult<(EntityId, Q::Refs)> {
        let entity = self
            .state
            .write()
            .new_entity_with_archetype(&self.components)?;
        Ok((entity, Q::refs(&self.state, entity)))
    }

    /// Creates an entity carrying the given values.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityIdExhausted`] when no ID is left.
    pub fn create_with(&self, values: Q) -> EcsResult<EntityId> {
        let mut state = self.state.write();
        let entity = state.new_entity_with_archetype(&self.components)?;
        values.insert(&mut state, entity)?;
        Ok(entity)
    }

    /// Destroys a matching entity.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityNotFound`], or [`EcsError::ArchetypeMismatch`] if the
    /// entity does not match this search.
    pub fn destroy(&self, entity: EntityId) -> EcsResult<()> {
        let mut state = self.state.write();
        self.check(&state, entity)?;
        state.remove_entity(entity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Pos(i64);
    impl Component for Pos {
        const NAME: &'static str = "pos";
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Vel(i64);
    impl Component for Vel {
        const NAME: &'static str = "vel";
    }

    fn shared() -> SharedState {
        Arc::new(RwLock::new(WorldState::new()))
    }

    #[test]
    fn test_exact_vs_contains() {
        let state = shared();
        let exact: Exact<(Pos,)> = Search::new(&state).unwrap();
        let contains: Contains<(Pos,)> = Search::new(&state).unwrap();
        let both: Exact<(Pos, Vel)> = Search::new(&state).unwrap();

        exact.create_with((Pos(1),)).unwrap();
        both.create_with((Pos(2), Vel(3))).unwrap();

        assert_eq!(exact.count(), 1);
        assert_eq!(contains.count(), 2);
        let sum: i64 = contains.iter().map(|(_, (pos,))| pos.get().unwrap().0).sum();
        assert_eq!(sum, 3);
    }

    #[test]
    fn test_get_by_id_checks_archetype() {
        let state = shared();
        let pos_only: Exact<(Pos,)> = Search::new(&state).unwrap();
        let both: Exact<(Pos, Vel)> = Search::new(&state).unwrap();
        let (e, (pos,)) = pos_only.create().unwrap();
        pos.set(Pos(9)).unwrap();

        assert!(pos_only.get_by_id(e).is_ok());
        assert_eq!(both.get_by_id(e).err(), Some(EcsError::ArchetypeMismatch(e)));

        pos_only.destroy(e).unwrap();
        assert_eq!(pos_only.get_by_id(e).err(), Some(EcsError::EntityNotFound(e)));
        assert_eq!(pos.get(), Err(EcsError::EntityNotFound(e)));
    }

    #[test]
    fn test_handles_survive_swap_remove() {
        let state = shared();
        let search: Exact<(Pos,)> = Search::new(&state).unwrap();
        let first = search.create_with((Pos(1),)).unwrap();
        let second = search.create_with((Pos(2),)).unwrap();
        let (second_pos,) = search.get_by_id(second).unwrap();

        // `second` moves into row 0
        search.destroy(first).unwrap();
        assert_eq!(second_pos.get(), Ok(Pos(2)));
        second_pos.update(|p| p.0 += 5).unwrap();
        assert_eq!(state.read().get_component::<Pos>(second), Ok(Pos(7)));
    }

    #[test]
    fn test_update_closure_may_use_other_handles() {
        let state = shared();
        let search: Exact<(Pos, Vel)> = Search::new(&state).unwrap();
        let e = search.create_with((Pos(1), Vel(3))).unwrap();
        let (pos, vel) = search.get_by_id(e).unwrap();

        pos.update(|p| p.0 += vel.get().unwrap().0).unwrap();
        assert_eq!(pos.get(), Ok(Pos(4)));

        let destroyed = pos.update(|_| search.destroy(e));
        assert_eq!(destroyed, Err(EcsError::EntityNotFound(e)));
    }

    #[test]
    fn test_single_adds_component() {
        let state = shared();
        let search: Exact<(Pos,)> = Search::new(&state).unwrap();
        let vel: Single<Vel> = Single::new(&state).unwrap();
        let e = search.create_with((Pos(0),)).unwrap();

        vel.attach(e).set(Vel(4)).unwrap();
        assert_eq!(search.get_by_id(e).err(), Some(EcsError::ArchetypeMismatch(e)));
        vel.attach(e).remove().unwrap();
        assert!(search.get_by_id(e).is_ok());
    }
}
