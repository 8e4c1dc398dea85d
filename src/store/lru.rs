//! Fixed-capacity LRU cache on top of [`IndexedHeap`].
//!
//! Recency is a strictly increasing serial used as the heap weight, so the
//! heap minimum is always the least recently touched entry. Every public
//! operation runs under one mutex covering the whole read-modify-write.

use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use crate::config::types::{EvalError, Result};
use crate::store::heap::IndexedHeap;

struct LruInner<K, V> {
    heap: IndexedHeap<u64, K, V>,
    serial: u64,
}

impl<K, V> LruInner<K, V>
where
    K: Hash + Eq + Clone,
{
    fn touch(&mut self, key: K, value: V) {
        self.serial += 1;
        self.heap.put(self.serial, key, value);
    }

    fn evict_to(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.heap.len() > capacity {
            if self.heap.pop().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }
}

pub struct BoundedLruCache<K, V> {
    capacity: usize,
    inner: Mutex<LruInner<K, V>>,
}

impl<K, V> BoundedLruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self> {
        NonZeroUsize::new(capacity)
            .map(Self::with_capacity)
            .ok_or_else(|| EvalError::Config("cache capacity must be positive".to_string()))
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            capacity: capacity.get(),
            inner: Mutex::new(LruInner {
                heap: IndexedHeap::new(),
                serial: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruInner<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up `key`, refreshing its recency on a hit. A miss changes nothing.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let mut inner = self.lock();
        let entry = inner.heap.delete(key)?;
        let value = entry.value.clone();
        inner.touch(entry.key, entry.value);
        Some(value)
    }

    /// Insert or replace `key`, then evict least recently touched entries
    /// until the cache is back within capacity. Returns how many were evicted.
    pub fn set(&self, key: K, value: V) -> usize {
        let mut inner = self.lock();
        inner.touch(key, value);
        inner.evict_to(self.capacity)
    }

    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().heap.delete(key).map(|entry| entry.value)
    }

    /// Membership test that does not count as a touch.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().heap.contains_key(key)
    }

    /// Mutate the value under `key` in place, creating it with `init` first
    /// if absent. Counts as a touch and may evict other entries.
    pub fn update<R>(&self, key: K, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R {
        let mut inner = self.lock();
        let (key, mut value) = match inner.heap.delete(&key) {
            Some(entry) => (entry.key, entry.value),
            None => (key, init()),
        };
        let result = f(&mut value);
        inner.touch(key, value);
        inner.evict_to(self.capacity);
        result
    }

    /// Return the value under `key`, inserting `init()` first if absent.
    pub fn get_or_insert_with(&self, key: K, init: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        self.update(key, init, |value| value.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the cached keys, least recently touched first.
    pub fn keys(&self) -> Vec<K> {
        let inner = self.lock();
        let mut entries: Vec<(u64, K)> = inner
            .heap
            .iter()
            .map(|entry| (entry.weight, entry.key.clone()))
            .collect();
        entries.sort_by_key(|(serial, _)| *serial);
        entries.into_iter().map(|(_, key)| key).collect()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        while inner.heap.pop().is_some() {}
    }
}
