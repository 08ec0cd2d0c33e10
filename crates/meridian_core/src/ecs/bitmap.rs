//! # Component Bitmaps
//!
//! Growable bitset keyed by component or system-event ID.
//!
//! Bitmaps are kept in canonical form (no trailing zero words) so two
//! bitmaps with the same bits compare and hash equal regardless of how
//! they were built. That makes them usable directly as archetype keys.

/// Bitset over 32-bit IDs, 64 IDs per word.
///
/// ## Performance
///
/// - Set / remove / contains: O(1)
/// - Intersects / superset: O(words)
/// - Iterate: O(words + set bits)
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bitmap {
    words: Vec<u64>,
}

impl Bitmap {
    /// Creates an empty bitmap.
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Builds a bitmap from canonical or non-canonical words.
    #[must_use]
    pub fn from_words(words: Vec<u64>) -> Self {
        let mut bitmap = Self { words };
        bitmap.trim();
        bitmap
    }

    /// Sets a bit.
    #[inline]
    pub fn set(&mut self, bit: u32) {
        let word = (bit / 64) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (bit % 64);
    }

    /// Clears a bit.
    #[inline]
    pub fn remove(&mut self, bit: u32) {
        let word = (bit / 64) as usize;
        if word < self.words.len() {
            self.words[word] &= !(1u64 << (bit % 64));
            self.trim();
        }
    }

    /// Checks whether a bit is set.
    #[inline]
    #[must_use]
    pub fn contains(&self, bit: u32) -> bool {
        let word = (bit / 64) as usize;
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << (bit % 64)) != 0)
    }

    /// Returns a copy with one extra bit set.
    #[must_use]
    pub fn with(&self, bit: u32) -> Self {
        let mut copy = self.clone();
        copy.set(bit);
        copy
    }

    /// Returns a copy with one bit cleared.
    #[must_use]
    pub fn without(&self, bit: u32) -> Self {
        let mut copy = self.clone();
        copy.remove(bit);
        copy
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True if no bit is set.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// True if at least one bit is set in both bitmaps.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .any(|(a, b)| a & b != 0)
    }

    /// True if every bit of `other` is also set in `self`.
    #[must_use]
    pub fn is_superset_of(&self, other: &Self) -> bool {
        if other.words.len() > self.words.len() {
            return false;
        }
        self.words
            .iter()
            .zip(&other.words)
            .all(|(a, b)| a & b == *b)
    }

    /// Sets every bit of `other` in `self`.
    pub fn union_with(&mut self, other: &Self) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= b;
        }
    }

    /// Canonical words, lowest IDs first.
    #[inline]
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Iterates set bits in ascending order.
    #[must_use]
    pub fn iter(&self) -> BitmapIter<'_> {
        BitmapIter {
            words: &self.words,
            word_index: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl FromIterator<u32> for Bitmap {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut bitmap = Self::new();
        for bit in iter {
            bitmap.set(bit);
        }
        bitmap
    }
}

impl<'a> IntoIterator for &'a Bitmap {
    type Item = u32;
    type IntoIter = BitmapIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the set bits of a [`Bitmap`].
pub struct BitmapIter<'a> {
    words: &'a [u64],
    word_index: usize,
    current: u64,
}

impl Iterator for BitmapIter<'_> {
    type Item = u32;

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros();
                // Clear lowest set bit
                self.current &= self.current - 1;
                return Some((self.word_index * 64) as u32 + bit);
            }
            self.word_index += 1;
            if self.word_index >= self.words.len() {
                return None;
            }
            self.current = self.words[self.word_index];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_contains_remove() {
        let mut bitmap = Bitmap::new();
        bitmap.set(3);
        bitmap.set(130);
        assert!(bitmap.contains(3));
        assert!(bitmap.contains(130));
        assert!(!bitmap.contains(4));
        assert_eq!(bitmap.count(), 2);

        bitmap.remove(130);
        assert!(!bitmap.contains(130));
        assert_eq!(bitmap.words().len(), 1);
    }

    #[test]
    fn test_canonical_equality() {
        let mut a = Bitmap::new();
        a.set(200);
        a.set(1);
        a.remove(200);
        let b: Bitmap = [1].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(Bitmap::from_words(vec![2, 0, 0]), b);
    }

    #[test]
    fn test_superset_and_intersects() {
        let abc: Bitmap = [0, 1, 70].into_iter().collect();
        let ab: Bitmap = [0, 1].into_iter().collect();
        let c: Bitmap = [70].into_iter().collect();
        let d: Bitmap = [5].into_iter().collect();

        assert!(abc.is_superset_of(&ab));
        assert!(abc.is_superset_of(&c));
        assert!(abc.is_superset_of(&Bitmap::new()));
        assert!(!ab.is_superset_of(&abc));
        assert!(abc.intersects(&c));
        assert!(!ab.intersects(&c));
        assert!(!abc.intersects(&d));
    }

    #[test]
    fn test_iteration_ascending() {
        let bitmap: Bitmap = [64, 3, 127, 0, 200].into_iter().collect();
        let bits: Vec<u32> = bitmap.iter().collect();
        assert_eq!(bits, vec![0, 3, 64, 127, 200]);
        assert_eq!(Bitmap::new().iter().next(), None);
    }
}
