//! # Component Columns
//!
//! One contiguous `Vec<T>` per component per archetype. Row `i` of every
//! column in an archetype belongs to the same entity.
//!
//! Archetypes hold their columns type-erased behind [`AnyColumn`] so that
//! moves, swap-removes and snapshot encoding work without knowing `T`.

use std::any::Any;

use serde_json::Value;

use super::component::Component;
use crate::error::SnapshotError;
use crate::snapshot::ByteReader;

/// Typed column with swap-remove.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Column<T: Component> {
    values: Vec<T>,
}

impl<T: Component> Column<T> {
    /// Creates an empty column.
    #[must_use]
    pub const fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Number of rows.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the column has no rows.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Appends a default-valued row.
    #[inline]
    pub fn extend(&mut self) {
        self.values.push(T::default());
    }

    /// Appends a row.
    #[inline]
    pub fn push(&mut self, value: T) {
        self.values.push(value);
    }

    /// Reads a row.
    #[inline]
    #[must_use]
    pub fn get(&self, row: usize) -> Option<&T> {
        self.values.get(row)
    }

    /// Mutable access to a row.
    #[inline]
    pub fn get_mut(&mut self, row: usize) -> Option<&mut T> {
        self.values.get_mut(row)
    }

    /// Overwrites a row. Returns false if the row does not exist.
    #[inline]
    pub fn set(&mut self, row: usize, value: T) -> bool {
        match self.values.get_mut(row) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Removes a row by moving the last row into its place.
    ///
    /// O(1). Breaks row ordering, not identity: callers must fix up
    /// whichever entity owned the last row.
    #[inline]
    pub fn remove(&mut self, row: usize) -> Option<T> {
        if row < self.values.len() {
            Some(self.values.swap_remove(row))
        } else {
            None
        }
    }

    /// All rows in order.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
}

/// Type-erased column operations used by archetypes and the snapshot codec.
pub trait AnyColumn: Send + Sync {
    /// Registered component name.
    fn name(&self) -> &'static str;

    /// Number of rows.
    fn len(&self) -> usize;

    /// True if the column has no rows.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a default-valued row.
    fn extend_default(&mut self);

    /// Swap-removes a row.
    fn swap_remove(&mut self, row: usize);

    /// Appends a clone of `row` to `dst`, which must hold the same type.
    fn copy_row_to(&self, row: usize, dst: &mut dyn AnyColumn);

    /// Creates an empty column of the same type.
    fn empty_clone(&self) -> Box<dyn AnyColumn>;

    /// Encodes every row as `[u32 rows]([u32 len][bytes])*`.
    ///
    /// # Errors
    ///
    /// Fails if a value cannot be serialized.
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), SnapshotError>;

    /// Replaces the column contents with rows produced by [`AnyColumn::encode`].
    ///
    /// # Errors
    ///
    /// Fails on truncated input or values that do not match the type.
    fn decode(&mut self, bytes: &[u8]) -> Result<(), SnapshotError>;

    /// Converts a row to a JSON value for queries.
    fn row_to_json(&self, row: usize) -> Option<Value>;

    /// Structural equality with another column.
    fn eq_dyn(&self, other: &dyn AnyColumn) -> bool;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> AnyColumn for Column<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn extend_default(&mut self) {
        self.extend();
    }

    fn swap_remove(&mut self, row: usize) {
        self.remove(row);
    }

    fn copy_row_to(&self, row: usize, dst: &mut dyn AnyColumn) {
        debug_assert!(
            row < self.values.len(),
            "row {row} out of bounds for column {} of {} rows",
            T::NAME,
            self.values.len()
        );
        let dst = dst
            .as_any_mut()
            .downcast_mut::<Self>()
            .unwrap_or_else(|| panic!("column type mismatch for {}", T::NAME));
        dst.push(self.values[row].clone());
    }

    fn empty_clone(&self) -> Box<dyn AnyColumn> {
        Box::new(Self::new())
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), SnapshotError> {
        let rows = u32::try_from(self.values.len()).map_err(|_| SnapshotError::Encode {
            name: T::NAME.to_string(),
            reason: "too many rows".to_string(),
        })?;
        out.extend_from_slice(&rows.to_le_bytes());
        for value in &self.values {
            let bytes = serde_json::to_vec(value).map_err(|e| SnapshotError::Encode {
                name: T::NAME.to_string(),
                reason: e.to_string(),
            })?;
            let len = u32::try_from(bytes.len()).map_err(|_| SnapshotError::Encode {
                name: T::NAME.to_string(),
                reason: "value too large".to_string(),
            })?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        Ok(())
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut reader = ByteReader::new(bytes);
        let rows = reader.u32()? as usize;
        let mut values = Vec::with_capacity(rows.min(bytes.len() / 4));
        for _ in 0..rows {
            let len = reader.u32()? as usize;
            let value = serde_json::from_slice(reader.take(len)?).map_err(|e| SnapshotError::Decode {
                name: T::NAME.to_string(),
                reason: e.to_string(),
            })?;
            values.push(value);
        }
        if reader.remaining() != 0 {
            return Err(SnapshotError::Corrupt(format!(
                "{} trailing bytes in column {}",
                reader.remaining(),
                T::NAME
            )));
        }
        self.values = values;
        Ok(())
    }

    fn row_to_json(&self, row: usize) -> Option<Value> {
        self.values.get(row).and_then(|v| serde_json::to_value(v).ok())
    }

    fn eq_dyn(&self, other: &dyn AnyColumn) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|other| other.values == self.values)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Gold {
        amount: u64,
    }

    impl Component for Gold {
        const NAME: &'static str = "gold";
    }

    #[test]
    fn test_swap_remove_moves_last_row() {
        let mut column = Column::new();
        for amount in 0..4 {
            column.push(Gold { amount });
        }
        let removed = column.remove(1);
        assert_eq!(removed, Some(Gold { amount: 1 }));
        assert_eq!(column.len(), 3);
        assert_eq!(column.get(1), Some(&Gold { amount: 3 }));
        assert_eq!(column.remove(10), None);
    }

    #[test]
    fn test_extend_pushes_default() {
        let mut column: Column<Gold> = Column::new();
        column.extend();
        assert_eq!(column.get(0), Some(&Gold::default()));
        assert!(column.set(0, Gold { amount: 9 }));
        assert!(!column.set(1, Gold { amount: 9 }));
    }

    #[test]
    fn test_encode_preserves_large_integers() {
        let mut column = Column::new();
        column.push(Gold { amount: (1 << 53) + 1 });
        column.push(Gold { amount: u64::MAX });

        let mut bytes = Vec::new();
        column.encode(&mut bytes).unwrap();
        let mut decoded: Column<Gold> = Column::new();
        decoded.decode(&bytes).unwrap();
        assert_eq!(decoded, column);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let mut column = Column::new();
        column.push(Gold { amount: 7 });
        let mut bytes = Vec::new();
        column.encode(&mut bytes).unwrap();
        bytes.pop();

        let mut decoded: Column<Gold> = Column::new();
        assert!(decoded.decode(&bytes).is_err());
        assert!(decoded.is_empty());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_copy_row_past_end_panics() {
        let src = Column::<Gold>::new();
        let mut dst = Column::<Gold>::new();
        src.copy_row_to(0, &mut dst);
    }

    #[test]
    #[should_panic(expected = "column type mismatch")]
    fn test_copy_row_into_other_type_panics() {
        #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
        struct Silver(u8);
        impl Component for Silver {
            const NAME: &'static str = "silver";
        }

        let mut src = Column::new();
        src.push(Gold { amount: 1 });
        let mut dst = Column::<Silver>::new();
        src.copy_row_to(0, &mut dst);
    }

    #[test]
    fn test_copy_row_between_erased_columns() {
        let mut src: Box<dyn AnyColumn> = Box::new(Column::<Gold>::new());
        src.as_any_mut()
            .downcast_mut::<Column<Gold>>()
            .unwrap()
            .push(Gold { amount: 5 });
        let mut dst = src.empty_clone();
        src.copy_row_to(0, dst.as_mut());
        assert!(src.eq_dyn(dst.as_ref()));
    }
}
