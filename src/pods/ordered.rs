//! Dense integer-indexed collection with hole reuse.
//!
//! Indices are assigned monotonically from 1; deleting an entry either
//! shrinks the high-water mark (with compaction through trailing holes) or
//! punches a hole that the next `fill` reuses. The collection owns the index
//! space for a pod group's runners.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Implemented by entries that learn their index on insertion.
pub trait Indexed {
    fn set_index(&self, index: usize);
}

pub struct OrderedCollection<T> {
    inner: RwLock<Inner<T>>,
}

struct Inner<T> {
    index: usize,
    holes: BTreeSet<usize>,
    items: HashMap<usize, T>,
}

impl<T: Indexed + Clone> OrderedCollection<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                index: 0,
                holes: BTreeSet::new(),
                items: HashMap::new(),
            }),
        }
    }

    /// Installs `t` at the smallest hole, or at `index + 1` when there is
    /// none. The entry learns its index through [`Indexed::set_index`].
    pub fn fill(&self, t: T) {
        let mut inner = self.inner.write().unwrap();
        let smallest_hole = inner.holes.iter().next().copied();
        let key = match smallest_hole {
            Some(hole) => {
                inner.holes.remove(&hole);
                hole
            }
            None => {
                inner.index += 1;
                inner.index
            }
        };
        t.set_index(key);
        inner.items.insert(key, t);
    }

    /// Removes the entry at `key`, compacting the high-water mark through
    /// any trailing holes.
    pub fn delete(&self, key: usize) {
        let mut inner = self.inner.write().unwrap();
        inner.items.remove(&key);
        if key == inner.index {
            if inner.index > 0 {
                inner.index -= 1;
            }
        } else if key < inner.index {
            inner.holes.insert(key);
        }
        loop {
            let idx = inner.index;
            if idx == 0 || !inner.holes.remove(&idx) {
                break;
            }
            inner.index -= 1;
        }
    }

    /// Installs `t` at an externally chosen index, opening holes for any
    /// skipped slots below it.
    pub fn set(&self, key: usize, t: T) {
        let mut inner = self.inner.write().unwrap();
        t.set_index(key);
        inner.items.insert(key, t);
        if key > inner.index {
            for i in inner.index.max(1)..key {
                if !inner.items.contains_key(&i) {
                    inner.holes.insert(i);
                }
            }
            inner.index = key;
        }
    }

    pub fn get(&self, key: usize) -> Option<T> {
        self.inner.read().unwrap().items.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current high-water index.
    pub fn index(&self) -> usize {
        self.inner.read().unwrap().index
    }

    #[cfg(test)]
    pub(crate) fn holes(&self) -> Vec<usize> {
        self.inner.read().unwrap().holes.iter().copied().collect()
    }
}

impl<T: Indexed + Clone> Default for OrderedCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}
