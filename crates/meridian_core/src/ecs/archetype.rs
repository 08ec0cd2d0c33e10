//! # Archetype Storage
//!
//! An archetype owns every entity that carries exactly the same set of
//! components. Storage is column-wise:
//!
//! ```text
//! Archetype {pos, vel}
//! entities: [ e7 ][ e2 ][ e9 ]
//! pos:      [ P7 ][ P2 ][ P9 ]
//! vel:      [ V7 ][ V2 ][ V9 ]
//! rows:     e2 -> 1, e7 -> 0, e9 -> 2      (sparse set)
//! ```
//!
//! Rows are positional. Removing a row swaps the last row into the hole,
//! so row numbers are never stable across mutations. Hold entity IDs,
//! never rows.

use super::bitmap::Bitmap;
use super::column::{AnyColumn, Column};
use super::component::{Component, ComponentId};
use super::entity::EntityId;
use super::sparse_set::SparseSet;

/// Archetype index into the world state's archetype table.
pub type ArchetypeId = usize;

/// The void archetype (no components) always sits at index 0.
pub const VOID_ARCHETYPE: ArchetypeId = 0;

/// Entities sharing one component signature, stored column-wise.
pub struct Archetype {
    id: ArchetypeId,
    components: Bitmap,
    /// Component IDs in ascending order, parallel to `columns`.
    column_ids: Vec<ComponentId>,
    columns: Vec<Box<dyn AnyColumn>>,
    entities: Vec<EntityId>,
    rows: SparseSet,
}

impl Archetype {
    /// Creates an empty archetype.
    ///
    /// `columns` must be ordered by ascending component ID and match the
    /// bits of `components`.
    #[must_use]
    pub fn new(id: ArchetypeId, components: Bitmap, columns: Vec<Box<dyn AnyColumn>>) -> Self {
        let column_ids: Vec<ComponentId> = components.iter().collect();
        assert_eq!(column_ids.len(), columns.len(), "column count must match signature");
        Self {
            id,
            components,
            column_ids,
            columns,
            entities: Vec::new(),
            rows: SparseSet::new(),
        }
    }

    /// Index in the archetype table.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Component signature.
    #[inline]
    #[must_use]
    pub const fn components(&self) -> &Bitmap {
        &self.components
    }

    /// Entities in row order.
    #[inline]
    #[must_use]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Number of entities.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True if the archetype holds no entity.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Checks whether the entity lives here.
    #[inline]
    #[must_use]
    pub fn contains_entity(&self, entity: EntityId) -> bool {
        self.rows.contains(entity.get())
    }

    /// Current row of an entity.
    #[inline]
    #[must_use]
    pub fn row_of(&self, entity: EntityId) -> Option<usize> {
        self.rows.get(entity.get()).map(|row| row as usize)
    }

    /// Bitmap equality.
    #[inline]
    #[must_use]
    pub fn exact(&self, components: &Bitmap) -> bool {
        self.components == *components
    }

    /// Bitmap superset test.
    #[inline]
    #[must_use]
    pub fn contains(&self, components: &Bitmap) -> bool {
        self.components.is_superset_of(components)
    }

    /// Type-erased columns in component ID order.
    #[must_use]
    pub fn columns(&self) -> &[Box<dyn AnyColumn>] {
        &self.columns
    }

    fn column_index(&self, component: ComponentId) -> Option<usize> {
        self.column_ids.binary_search(&component).ok()
    }

    /// Typed column for a component ID.
    #[must_use]
    pub fn column<T: Component>(&self, component: ComponentId) -> Option<&Column<T>> {
        let index = self.column_index(component)?;
        self.columns[index].as_any().downcast_ref::<Column<T>>()
    }

    /// Mutable typed column for a component ID.
    pub fn column_mut<T: Component>(&mut self, component: ComponentId) -> Option<&mut Column<T>> {
        let index = self.column_index(component)?;
        self.columns[index].as_any_mut().downcast_mut::<Column<T>>()
    }

    /// Appends an entity with default values in every column.
    pub fn push_entity(&mut self, entity: EntityId) -> usize {
        debug_assert!(!self.contains_entity(entity), "entity {entity} already in archetype");
        let row = self.entities.len();
        self.entities.push(entity);
        for column in &mut self.columns {
            column.extend_default();
        }
        self.set_row(entity, row);
        row
    }

    /// Swap-removes an entity. Returns false if it was not here.
    pub fn remove_entity(&mut self, entity: EntityId) -> bool {
        let Some(row) = self.row_of(entity) else {
            return false;
        };
        for column in &mut self.columns {
            column.swap_remove(row);
        }
        self.entities.swap_remove(row);
        self.rows.remove(entity.get());
        // The former last entity now occupies `row`
        if let Some(&moved) = self.entities.get(row) {
            self.set_row(moved, row);
        }
        self.debug_check_lengths();
        true
    }

    /// Moves an entity from `self` into `dst`.
    ///
    /// Shared components are copied, components new to `dst` get default
    /// values and components missing from `dst` are dropped. Returns the
    /// entity's row in `dst`, or `None` if it was not in `self`.
    pub fn move_entity(&mut self, dst: &mut Self, entity: EntityId) -> Option<usize> {
        let src_row = self.row_of(entity)?;
        let dst_row = dst.entities.len();
        dst.entities.push(entity);

        let mut src_index = 0;
        for (dst_index, &component) in dst.column_ids.iter().enumerate() {
            // Both id lists are sorted, walk them in lockstep
            while src_index < self.column_ids.len() && self.column_ids[src_index] < component {
                src_index += 1;
            }
            let dst_column = dst.columns[dst_index].as_mut();
            if self.column_ids.get(src_index) == Some(&component) {
                self.columns[src_index].copy_row_to(src_row, dst_column);
            } else {
                dst_column.extend_default();
            }
        }
        dst.set_row(entity, dst_row);
        dst.debug_check_lengths();

        self.remove_entity(entity);
        Some(dst_row)
    }

    /// Reads a component value.
    #[must_use]
    pub fn get<T: Component>(&self, component: ComponentId, entity: EntityId) -> Option<&T> {
        let row = self.row_of(entity)?;
        self.column::<T>(component)?.get(row)
    }

    /// Mutable access to a component value.
    pub fn get_mut<T: Component>(&mut self, component: ComponentId, entity: EntityId) -> Option<&mut T> {
        let row = self.row_of(entity)?;
        self.column_mut::<T>(component)?.get_mut(row)
    }

    /// Rebuilds the row index from the entity list.
    pub(crate) fn restore(
        id: ArchetypeId,
        components: Bitmap,
        columns: Vec<Box<dyn AnyColumn>>,
        entities: Vec<EntityId>,
    ) -> Result<Self, String> {
        let mut archetype = Self::new(id, components, columns);
        for column in &archetype.columns {
            if column.len() != entities.len() {
                return Err(format!(
                    "column {} has {} rows, archetype {id} has {} entities",
                    column.name(),
                    column.len(),
                    entities.len()
                ));
            }
        }
        for (row, &entity) in entities.iter().enumerate() {
            if archetype.rows.contains(entity.get()) {
                return Err(format!("entity {entity} listed twice in archetype {id}"));
            }
            archetype.set_row(entity, row);
        }
        archetype.entities = entities;
        Ok(archetype)
    }

    /// Structural comparison: signature, entity order and column values.
    #[must_use]
    pub fn same_contents(&self, other: &Self) -> bool {
        self.id == other.id
            && self.components == other.components
            && self.entities == other.entities
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.eq_dyn(b.as_ref()))
    }

    /// Checks the row bijection and column lengths.
    pub(crate) fn verify(&self) -> Result<(), String> {
        for column in &self.columns {
            if column.len() != self.entities.len() {
                return Err(format!(
                    "archetype {}: column {} has {} rows, expected {}",
                    self.id,
                    column.name(),
                    column.len(),
                    self.entities.len()
                ));
            }
        }
        if self.rows.len() != self.entities.len() {
            return Err(format!(
                "archetype {}: row index has {} keys, expected {}",
                self.id,
                self.rows.len(),
                self.entities.len()
            ));
        }
        for (row, &entity) in self.entities.iter().enumerate() {
            if self.row_of(entity) != Some(row) {
                return Err(format!("archetype {}: entity {entity} row mismatch", self.id));
            }
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_row(&mut self, entity: EntityId, row: usize) {
        self.rows.set(entity.get(), row as u32);
    }

    #[inline]
    fn debug_check_lengths(&self) {
        debug_assert!(
            self.columns.iter().all(|c| c.len() == self.entities.len()),
            "column length diverged from entity count in archetype {}",
            self.id
        );
    }
}

impl std::fmt::Debug for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("components", &self.column_ids)
            .field("entities", &self.entities.len())
            .finish()
    }
}

/// Borrows two distinct archetypes mutably.
pub(crate) fn pair_mut(
    archetypes: &mut [Archetype],
    a: ArchetypeId,
    b: ArchetypeId,
) -> (&mut Archetype, &mut Archetype) {
    assert_ne!(a, b, "cannot borrow the same archetype twice");
    if a < b {
        let (left, right) = archetypes.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = archetypes.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Pos(i32);
    impl Component for Pos {
        const NAME: &'static str = "pos";
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Vel(i32);
    impl Component for Vel {
        const NAME: &'static str = "vel";
    }

    fn archetype(id: ArchetypeId, with_vel: bool) -> Archetype {
        let mut bits = Bitmap::new();
        let mut columns: Vec<Box<dyn AnyColumn>> = vec![Box::new(Column::<Pos>::new())];
        bits.set(0);
        if with_vel {
            bits.set(1);
            columns.push(Box::new(Column::<Vel>::new()));
        }
        Archetype::new(id, bits, columns)
    }

    #[test]
    fn test_remove_fixes_moved_row() {
        let mut arch = archetype(1, false);
        for raw in 0..3 {
            let e = EntityId::new(raw);
            arch.push_entity(e);
            *arch.get_mut::<Pos>(0, e).unwrap() = Pos(raw as i32 * 10);
        }

        assert!(arch.remove_entity(EntityId::new(0)));
        assert_eq!(arch.entities(), &[EntityId::new(2), EntityId::new(1)]);
        assert_eq!(arch.row_of(EntityId::new(2)), Some(0));
        assert_eq!(arch.get::<Pos>(0, EntityId::new(2)), Some(&Pos(20)));
        assert!(!arch.remove_entity(EntityId::new(0)));
        arch.verify().unwrap();
    }

    #[test]
    fn test_move_copies_shared_and_defaults_new() {
        let mut archetypes = vec![archetype(0, false), archetype(1, true)];
        let e = EntityId::new(4);
        archetypes[0].push_entity(e);
        *archetypes[0].get_mut::<Pos>(0, e).unwrap() = Pos(7);

        let (src, dst) = pair_mut(&mut archetypes, 0, 1);
        assert_eq!(src.move_entity(dst, e), Some(0));

        assert!(archetypes[0].is_empty());
        assert_eq!(archetypes[1].get::<Pos>(0, e), Some(&Pos(7)));
        assert_eq!(archetypes[1].get::<Vel>(1, e), Some(&Vel(0)));

        // And back again, dropping vel
        let (src, dst) = pair_mut(&mut archetypes, 1, 0);
        src.move_entity(dst, e);
        assert_eq!(archetypes[0].get::<Pos>(0, e), Some(&Pos(7)));
        archetypes[0].verify().unwrap();
        archetypes[1].verify().unwrap();
    }

    #[test]
    fn test_exact_and_contains() {
        let arch = archetype(1, true);
        let pos_only: Bitmap = [0].into_iter().collect();
        let both: Bitmap = [0, 1].into_iter().collect();
        assert!(arch.contains(&pos_only));
        assert!(!arch.exact(&pos_only));
        assert!(arch.exact(&both));
    }
}
