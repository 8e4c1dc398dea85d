//! Indexed binary min-heap.
//!
//! An array-backed heap paired with a key -> slot map, so that besides
//! `pop` any entry can be found in O(1) and removed in O(log n). Every
//! mutation keeps the map an exact mirror of the array layout.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// One live heap element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapEntry<W, K, V> {
    pub weight: W,
    pub key: K,
    pub value: V,
}

/// Min-heap keyed by unique `K`, ordered by `W`. Ties on equal weight are
/// broken arbitrarily.
#[derive(Debug)]
pub struct IndexedHeap<W, K, V> {
    entries: Vec<HeapEntry<W, K, V>>,
    positions: HashMap<K, usize>,
}

impl<W, K, V> Default for IndexedHeap<W, K, V>
where
    W: Ord,
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<W, K, V> IndexedHeap<W, K, V>
where
    W: Ord,
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Insert `key`, replacing any existing entry for it. Returns the
    /// replaced entry.
    pub fn put(&mut self, weight: W, key: K, value: V) -> Option<HeapEntry<W, K, V>> {
        let previous = self.delete(&key);
        let slot = self.entries.len();
        self.positions.insert(key.clone(), slot);
        self.entries.push(HeapEntry { weight, key, value });
        self.sift_up(slot);
        previous
    }

    /// Remove and return the minimum-weight entry.
    pub fn pop(&mut self) -> Option<HeapEntry<W, K, V>> {
        if self.entries.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    /// Remove the entry stored under `key`.
    pub fn delete<Q>(&mut self, key: &Q) -> Option<HeapEntry<W, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.positions.get(key)?;
        self.remove_at(slot)
    }

    /// Look up the entry stored under `key` without removing it.
    pub fn peek<Q>(&self, key: &Q) -> Option<&HeapEntry<W, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.positions.get(key).map(|&slot| &self.entries[slot])
    }

    /// The current minimum, if any.
    pub fn peek_min(&self) -> Option<&HeapEntry<W, K, V>> {
        self.entries.first()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.positions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in array order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = &HeapEntry<W, K, V>> {
        self.entries.iter()
    }

    fn remove_at(&mut self, slot: usize) -> Option<HeapEntry<W, K, V>> {
        if slot >= self.entries.len() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(slot, last);
        let removed = self.entries.pop()?;
        self.positions.remove(&removed.key);

        if slot < self.entries.len() {
            self.reindex(slot);
            // The element moved in from the tail may be lighter than its new
            // parent when the hole was not on the tail's root path.
            if self.sift_up(slot) == slot {
                self.sift_down(slot);
            }
        }
        Some(removed)
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[slot].weight < self.entries[parent].weight {
                self.swap(slot, parent);
                slot = parent;
            } else {
                break;
            }
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) -> usize {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.entries[right].weight < self.entries[left].weight {
                right
            } else {
                left
            };
            if self.entries[child].weight < self.entries[slot].weight {
                self.swap(slot, child);
                slot = child;
            } else {
                break;
            }
        }
        slot
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.reindex(a);
        self.reindex(b);
    }

    fn reindex(&mut self, slot: usize) {
        let key = &self.entries[slot].key;
        if let Some(position) = self.positions.get_mut(key) {
            *position = slot;
        }
    }

    /// Panics if the map and the array disagree or the heap order is broken.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        assert_eq!(self.positions.len(), self.entries.len(), "map/array size mismatch");
        for (slot, entry) in self.entries.iter().enumerate() {
            assert_eq!(self.positions.get(&entry.key), Some(&slot), "stale position");
            if slot > 0 {
                let parent = (slot - 1) / 2;
                assert!(
                    self.entries[parent].weight <= entry.weight,
                    "heap order broken at slot {}",
                    slot
                );
            }
        }
    }
}
