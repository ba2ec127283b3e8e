//! Entry-bounded LRU cache.
//!
//! Presence is decided by the key index alone, never by the stored value: a
//! cached `None`, `0`, `false` or `()` is still a hit. Callers that need to
//! distinguish "cached empty" from "not cached" use `get(..).is_some()` or
//! [`LruCache::contains`].
//!
//! Entries live in a slab (`Vec`) linked into a recency list by index, so
//! `get`, `insert` and `remove` are O(1) and the slab never exceeds capacity.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Least-recently-used cache with a fixed entry budget
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    index: HashMap<K, usize>,
    nodes: Vec<Node<K, V>>,
    /// Most recently used
    head: usize,
    /// Least recently used
    tail: usize,
    capacity: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        Self {
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Look up `key` and mark it most recently used
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        self.move_to_front(slot);
        Some(&self.nodes[slot].value)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        self.move_to_front(slot);
        Some(&mut self.nodes[slot].value)
    }

    /// Look up `key` without touching recency
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).map(|&slot| &self.nodes[slot].value)
    }

    /// Insert or replace `key`.
    ///
    /// Returns the previous value for `key` if it was present, otherwise the
    /// evicted least-recently-used entry when the cache was full.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            let old = std::mem::replace(&mut self.nodes[slot].value, value);
            self.move_to_front(slot);
            return Some((key, old));
        }

        if self.nodes.len() < self.capacity {
            let slot = self.nodes.len();
            self.nodes.push(Node {
                key: key.clone(),
                value,
                prev: NIL,
                next: NIL,
            });
            self.index.insert(key, slot);
            self.attach_front(slot);
            return None;
        }

        // Full: recycle the LRU slot in place.
        let slot = self.tail;
        self.detach(slot);
        let old_key = std::mem::replace(&mut self.nodes[slot].key, key.clone());
        let old_value = std::mem::replace(&mut self.nodes[slot].value, value);
        self.index.remove(&old_key);
        self.index.insert(key, slot);
        self.attach_front(slot);
        Some((old_key, old_value))
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.index.remove(key)?;
        self.detach(slot);

        let last = self.nodes.len() - 1;
        if slot != last {
            // swap_remove moves `last` into `slot`; repoint its neighbours.
            let (prev, next) = (self.nodes[last].prev, self.nodes[last].next);
            if prev != NIL {
                self.nodes[prev].next = slot;
            } else {
                self.head = slot;
            }
            if next != NIL {
                self.nodes[next].prev = slot;
            } else {
                self.tail = slot;
            }
            if let Some(moved) = self.index.get_mut::<K>(&self.nodes[last].key) {
                *moved = slot;
            }
        }
        Some(self.nodes.swap_remove(slot).value)
    }

    /// Least recently used entry, without touching recency
    pub fn peek_lru(&self) -> Option<(&K, &V)> {
        if self.tail == NIL {
            return None;
        }
        let node = &self.nodes[self.tail];
        Some((&node.key, &node.value))
    }

    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let key = self.nodes[self.tail].key.clone();
        let value = self.remove::<K>(&key)?;
        Some((key, value))
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.nodes.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let node = &self.nodes[cursor];
            cursor = node.next;
            Some(&node.key)
        })
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }

    fn attach_front(&mut self, slot: usize) {
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.head != slot {
            self.detach(slot);
            self.attach_front(slot);
        }
    }
}
