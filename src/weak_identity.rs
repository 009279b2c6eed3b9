//! Identity-keyed cache with weakly held keys
//!
//! Keys are compared by allocation identity, never by value: two equal but
//! distinct `Rc`s are two separate slots. The cache only holds a `Weak` to
//! each key, so an entry disappears once every strong reference to its key is
//! gone. Every operation first reaps such dead entries, so no read, write or
//! size query ever observes one.
//!
//! Values are held strongly. A value that holds a strong reference to its own
//! key keeps that entry alive forever.
//!
//! The cache is not synchronized; share it across threads only behind a lock.

use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

struct Entry<K: ?Sized, V> {
    key: Weak<K>,
    value: V,
}

/// Map from object identity to a cached value
pub struct IdentityWeakCache<K: ?Sized, V> {
    entries: HashMap<usize, Entry<K, V>>,
}

fn identity<K: ?Sized>(key: &Rc<K>) -> usize {
    Rc::as_ptr(key) as *const () as usize
}

impl<K: ?Sized, V> IdentityWeakCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Drop entries whose key has been reclaimed.
    fn reap(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.key.strong_count() > 0);
        let reaped = before - self.entries.len();
        if reaped > 0 {
            log::trace!("reaped {} dead identity cache entries", reaped);
        }
    }

    pub fn get(&mut self, key: &Rc<K>) -> Option<&V> {
        self.reap();
        self.entries.get(&identity(key)).map(|entry| &entry.value)
    }

    /// Insert or replace the value for `key`, returning the previous one.
    pub fn put(&mut self, key: &Rc<K>, value: V) -> Option<V> {
        self.reap();
        self.entries
            .insert(
                identity(key),
                Entry {
                    key: Rc::downgrade(key),
                    value,
                },
            )
            .map(|previous| previous.value)
    }

    pub fn remove(&mut self, key: &Rc<K>) -> Option<V> {
        self.reap();
        self.entries.remove(&identity(key)).map(|entry| entry.value)
    }

    pub fn contains_key(&mut self, key: &Rc<K>) -> bool {
        self.reap();
        self.entries.contains_key(&identity(key))
    }

    pub fn len(&mut self) -> usize {
        self.reap();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Live entries, with a strong reference to each key.
    pub fn iter(&mut self) -> impl Iterator<Item = (Rc<K>, &V)> + '_ {
        self.reap();
        self.entries
            .values()
            .filter_map(|entry| entry.key.upgrade().map(|key| (key, &entry.value)))
    }

    /// Find the live key whose value satisfies `predicate`.
    pub fn find_key(&mut self, mut predicate: impl FnMut(&V) -> bool) -> Option<Rc<K>> {
        self.reap();
        self.entries
            .values()
            .filter(|entry| predicate(&entry.value))
            .find_map(|entry| entry.key.upgrade())
    }
}

impl<K: ?Sized, V> Default for IdentityWeakCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ?Sized, V: fmt::Debug> fmt::Debug for IdentityWeakCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .filter(|(_, entry)| entry.key.strong_count() > 0)
                    .map(|(id, entry)| (format!("0x{:x}", id), &entry.value)),
            )
            .finish()
    }
}
