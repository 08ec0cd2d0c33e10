//! # Sparse Set
//!
//! Tombstoned, array-backed map from small integer keys to dense values.
//! This is the indexing primitive behind the entity to archetype index
//! and every archetype's entity to row index.
//!
//! ```text
//! key:    0    1    2    3    4
//! slot: [ 2 ][ - ][ 0 ][ - ][ 1 ]     - = tombstone
//! ```

/// Marker stored in empty slots.
pub const TOMBSTONE: u32 = u32::MAX;

/// Integer-keyed associative array with O(1) amortized operations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseSet {
    slots: Vec<u32>,
    len: usize,
}

impl SparseSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }

    /// Looks up a key.
    #[inline]
    #[must_use]
    pub fn get(&self, key: u32) -> Option<u32> {
        match self.slots.get(key as usize) {
            Some(&value) if value != TOMBSTONE => Some(value),
            _ => None,
        }
    }

    /// Stores `value` under `key`, growing the backing array as needed.
    ///
    /// Capacity doubles, or jumps to `key + 1` when doubling is not enough.
    /// New slots start as tombstones.
    #[inline]
    pub fn set(&mut self, key: u32, value: u32) {
        debug_assert_ne!(value, TOMBSTONE, "tombstone is not a storable value");
        let index = key as usize;
        if index >= self.slots.len() {
            let new_len = (self.slots.len() * 2).max(index + 1);
            self.slots.resize(new_len, TOMBSTONE);
        }
        if self.slots[index] == TOMBSTONE {
            self.len += 1;
        }
        self.slots[index] = value;
    }

    /// Clears a key. Returns whether it was present.
    #[inline]
    pub fn remove(&mut self, key: u32) -> bool {
        match self.slots.get_mut(key as usize) {
            Some(slot) if *slot != TOMBSTONE => {
                *slot = TOMBSTONE;
                self.len -= 1;
                true
            }
            _ => false,
        }
    }

    /// Checks whether a key is present.
    #[inline]
    #[must_use]
    pub fn contains(&self, key: u32) -> bool {
        self.get(key).is_some()
    }

    /// Number of live keys.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no key is present.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing array, live and tombstoned.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterates live `(key, value)` pairs in key order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != TOMBSTONE)
            .map(|(k, &v)| (k as u32, v))
    }

    /// Removes every key and releases the backing array.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_key() {
        let set = SparseSet::new();
        assert_eq!(set.get(0), None);
        assert_eq!(set.get(1_000), None);
    }

    #[test]
    fn test_growth_tombstones_new_slots() {
        let mut set = SparseSet::new();
        set.set(5, 42);
        assert_eq!(set.capacity(), 6);
        for key in 0..5 {
            assert_eq!(set.get(key), None);
        }
        assert_eq!(set.get(5), Some(42));

        set.set(6, 1);
        // Doubling beats key + 1
        assert_eq!(set.capacity(), 12);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remove_reports_existence() {
        let mut set = SparseSet::new();
        set.set(3, 0);
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert!(!set.remove(99));
        assert!(set.is_empty());
    }

    #[test]
    fn test_overwrite_keeps_len() {
        let mut set = SparseSet::new();
        set.set(1, 10);
        set.set(1, 11);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(1), Some(11));
        let pairs: Vec<_> = set.iter().collect();
        assert_eq!(pairs, vec![(1, 11)]);
    }
}
