//! Indexed binary min-heap.
//!
//! Both scheduling levels use this structure: each plugin keeps its pending
//! tasks keyed by due time, and the global queue keeps plugins keyed by the
//! due time of their earliest task. Elements are addressed by id so a changed
//! key can be fixed in place, or an element removed, in `O(log n)`.
//!
//! Elements with equal keys come out in insertion order.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Entry<I, K> {
    key: K,
    seq: u64,
    id: I,
}

/// Binary min-heap addressed by element id.
#[derive(Debug, Clone)]
pub struct IndexedHeap<I, K> {
    entries: Vec<Entry<I, K>>,
    positions: HashMap<I, usize>,
    next_seq: u64,
}

impl<I, K> Default for IndexedHeap<I, K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<I, K> IndexedHeap<I, K>
where
    I: Copy + Eq + Hash,
    K: Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: I) -> bool {
        self.positions.contains_key(&id)
    }

    /// Key of an element, if present.
    pub fn key(&self, id: I) -> Option<&K> {
        self.positions.get(&id).map(|&i| &self.entries[i].key)
    }

    /// The minimum element without removing it.
    pub fn peek(&self) -> Option<(I, &K)> {
        self.entries.first().map(|e| (e.id, &e.key))
    }

    /// Insert an element, or move it if it is already present.
    pub fn push(&mut self, id: I, key: K) {
        if self.contains(id) {
            self.update(id, key);
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let index = self.entries.len();
        self.entries.push(Entry { key, seq, id });
        self.positions.insert(id, index);
        self.sift_up(index);
    }

    /// Remove and return the minimum element.
    pub fn pop(&mut self) -> Option<(I, K)> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = self.take(0);
        Some((entry.id, entry.key))
    }

    /// Change the key of an element and restore the heap order.
    /// Returns false if the element is not present.
    pub fn update(&mut self, id: I, key: K) -> bool {
        let Some(&index) = self.positions.get(&id) else {
            return false;
        };
        self.entries[index].key = key;
        self.fix(index);
        true
    }

    /// Remove an element by id.
    pub fn remove(&mut self, id: I) -> Option<K> {
        let index = *self.positions.get(&id)?;
        Some(self.take(index).key)
    }

    /// Iterate over elements in heap (not sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (I, &K)> {
        self.entries.iter().map(|e| (e.id, &e.key))
    }

    /// Check the heap property and the id index.
    pub fn is_valid(&self) -> bool {
        let ordered = (1..self.entries.len()).all(|i| !self.less(i, (i - 1) / 2));
        let indexed = self.positions.len() == self.entries.len()
            && self
                .entries
                .iter()
                .enumerate()
                .all(|(i, e)| self.positions.get(&e.id) == Some(&i));
        ordered && indexed
    }

    fn take(&mut self, index: usize) -> Entry<I, K> {
        let last = self.entries.len() - 1;
        self.swap(index, last);
        let entry = self.entries.swap_remove(last);
        self.positions.remove(&entry.id);
        if index < self.entries.len() {
            self.fix(index);
        }
        entry
    }

    fn fix(&mut self, index: usize) {
        if !self.sift_down(index) {
            self.sift_up(index);
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (a, b) = (&self.entries[a], &self.entries[b]);
        (&a.key, a.seq) < (&b.key, b.seq)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].id, a);
        self.positions.insert(self.entries[b].id, b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, start: usize) -> bool {
        let len = self.entries.len();
        let mut index = start;
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, index) {
                break;
            }
            self.swap(index, child);
            index = child;
        }
        index > start
    }
}
