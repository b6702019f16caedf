use std::collections::HashMap;

use crate::fs::read::Inode;

/// remembers the first path seen for each multiply-linked inode
///
/// keyed by (dev, ino); `V` is whatever the caller needs to relink
/// later occurrences, a tree-relative name during commit or a
/// destination path during state migration.
pub struct LinkTracker<V> {
    seen: HashMap<(u64, u64), V>,
}

impl<V: Clone> LinkTracker<V> {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    /// returns the earlier value for this inode, or records `value`
    ///
    /// inodes with a single link are never recorded.
    pub fn check(&mut self, inode: &Inode, value: impl FnOnce() -> V) -> Option<V> {
        if !inode.is_multiply_linked() {
            return None;
        }
        let key = (inode.dev, inode.ino);
        if let Some(existing) = self.seen.get(&key) {
            return Some(existing.clone());
        }
        self.seen.insert(key, value());
        None
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl<V: Clone> Default for LinkTracker<V> {
    fn default() -> Self {
        Self::new()
    }
}
