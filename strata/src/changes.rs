//! Pending change buffers
//!
//! Every layer keeps its uncommitted work in a [`ChangeSet`]: a map from
//! entity key to the latest change recorded for it. A save hands the whole
//! set to the parent, which folds it into its own set with [`ChangeSet::merge`].
//!
//! # Coalescing
//!
//! A key holds at most one pending change. When a newer change lands on a
//! key that already has one, the two are folded:
//!
//! ```text
//! pending \ incoming   Insert(v)   Update(v)   Delete
//! (none)               Insert(v)   Update(v)   Delete
//! Insert(_)            Insert(v)   Insert(v)   (removed)
//! Update(_)            Update(v)   Update(v)   Delete
//! Delete               Update(v)   Update(v)   Delete
//! ```
//!
//! An insert followed by a delete never reaches the store at all.

use std::collections::{BTreeMap, BTreeSet};

/// Path-like entity key, e.g. `notes/1`
pub type EntityKey = String;

/// A single pending change to an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Create a new entity
    Insert(Vec<u8>),
    /// Replace the value of an existing entity
    Update(Vec<u8>),
    /// Remove an entity
    Delete,
}

/// What a layer knows about a key from its own pending changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// The layer has a pending value for the key
    Found(&'a [u8]),
    /// The layer has a pending delete for the key
    Deleted,
    /// Nothing pending; the answer lives in the parent
    Unknown,
}

/// Normalize a directory name to a prefix ending with `/`
#[must_use]
pub fn dir_prefix(dir_name: &str) -> String {
    if dir_name.ends_with('/') {
        dir_name.to_string()
    } else {
        format!("{dir_name}/")
    }
}

/// Uncommitted delta buffer of a layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: BTreeMap<EntityKey, Change>,
}

impl ChangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Change> {
        self.changes.get(key)
    }

    /// Iterate pending changes in key order
    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, &Change)> {
        self.changes.iter()
    }

    pub fn insert(&mut self, key: impl Into<EntityKey>, value: impl Into<Vec<u8>>) {
        self.record(key.into(), Change::Insert(value.into()));
    }

    pub fn update(&mut self, key: impl Into<EntityKey>, value: impl Into<Vec<u8>>) {
        self.record(key.into(), Change::Update(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<EntityKey>) {
        self.record(key.into(), Change::Delete);
    }

    /// Record a change, folding it into any change already pending for the key
    pub fn record(&mut self, key: EntityKey, change: Change) {
        let folded = match (self.changes.remove(&key), change) {
            (None, incoming) => Some(incoming),
            (Some(Change::Insert(_)), Change::Insert(v) | Change::Update(v)) => {
                Some(Change::Insert(v))
            }
            (Some(Change::Insert(_)), Change::Delete) => None,
            (Some(Change::Update(_) | Change::Delete), Change::Insert(v) | Change::Update(v)) => {
                Some(Change::Update(v))
            }
            (Some(Change::Update(_) | Change::Delete), Change::Delete) => Some(Change::Delete),
        };
        if let Some(change) = folded {
            self.changes.insert(key, change);
        }
    }

    /// Forget the pending change for `key`, returning it
    pub fn remove(&mut self, key: &str) -> Option<Change> {
        self.changes.remove(key)
    }

    /// Fold a child's saved changes into this set
    pub fn merge(&mut self, child: ChangeSet) {
        for (key, change) in child.changes {
            self.record(key, change);
        }
    }

    /// Move all pending changes out, leaving this set empty
    pub fn take(&mut self) -> ChangeSet {
        std::mem::take(self)
    }

    #[must_use]
    pub fn lookup(&self, key: &str) -> Lookup<'_> {
        match self.changes.get(key) {
            Some(Change::Insert(v) | Change::Update(v)) => Lookup::Found(v),
            Some(Change::Delete) => Lookup::Deleted,
            None => Lookup::Unknown,
        }
    }

    /// Overlay pending inserts and deletes under `dir_name` on a parent listing
    ///
    /// The result is sorted and free of duplicates.
    #[must_use]
    pub fn apply_listing(&self, dir_name: &str, parent_keys: Vec<EntityKey>) -> Vec<EntityKey> {
        let prefix = dir_prefix(dir_name);
        let mut keys: BTreeSet<EntityKey> = parent_keys.into_iter().collect();
        for (key, change) in self.changes.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            match change {
                Change::Insert(_) | Change::Update(_) => {
                    keys.insert(key.clone());
                }
                Change::Delete => {
                    keys.remove(key);
                }
            }
        }
        keys.into_iter().collect()
    }
}

impl IntoIterator for ChangeSet {
    type Item = (EntityKey, Change);
    type IntoIter = std::collections::btree_map::IntoIter<EntityKey, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(pending: Option<Change>, incoming: Change) -> Option<Change> {
        let mut set = ChangeSet::new();
        if let Some(change) = pending {
            set.record("k".to_string(), change);
        }
        set.record("k".to_string(), incoming);
        set.get("k").cloned()
    }

    #[test]
    fn test_coalesce_over_insert() {
        let ins = || Some(Change::Insert(b"a".to_vec()));
        assert_eq!(single(ins(), Change::Insert(b"b".to_vec())), Some(Change::Insert(b"b".to_vec())));
        assert_eq!(single(ins(), Change::Update(b"b".to_vec())), Some(Change::Insert(b"b".to_vec())));
        assert_eq!(single(ins(), Change::Delete), None);
    }

    #[test]
    fn test_coalesce_over_update() {
        let upd = || Some(Change::Update(b"a".to_vec()));
        assert_eq!(single(upd(), Change::Insert(b"b".to_vec())), Some(Change::Update(b"b".to_vec())));
        assert_eq!(single(upd(), Change::Update(b"b".to_vec())), Some(Change::Update(b"b".to_vec())));
        assert_eq!(single(upd(), Change::Delete), Some(Change::Delete));
    }

    #[test]
    fn test_coalesce_over_delete() {
        let del = || Some(Change::Delete);
        assert_eq!(single(del(), Change::Insert(b"b".to_vec())), Some(Change::Update(b"b".to_vec())));
        assert_eq!(single(del(), Change::Update(b"b".to_vec())), Some(Change::Update(b"b".to_vec())));
        assert_eq!(single(del(), Change::Delete), Some(Change::Delete));
    }

    #[test]
    fn test_merge_applies_child_on_top() {
        let mut parent = ChangeSet::new();
        parent.insert("notes/1", "one");
        parent.update("notes/2", "two");

        let mut child = ChangeSet::new();
        child.delete("notes/1");
        child.update("notes/2", "two-b");
        child.insert("notes/3", "three");

        parent.merge(child);

        assert_eq!(parent.len(), 2);
        assert_eq!(parent.get("notes/1"), None);
        assert_eq!(parent.get("notes/2"), Some(&Change::Update(b"two-b".to_vec())));
        assert_eq!(parent.get("notes/3"), Some(&Change::Insert(b"three".to_vec())));
    }

    #[test]
    fn test_take_leaves_empty() {
        let mut set = ChangeSet::new();
        set.insert("a", "1");
        let taken = set.take();
        assert!(set.is_empty());
        assert_eq!(taken.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut set = ChangeSet::new();
        set.insert("a", "1");
        set.delete("b");
        assert_eq!(set.remove("b"), Some(Change::Delete));
        assert_eq!(set.remove("b"), None);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_lookup() {
        let mut set = ChangeSet::new();
        set.update("a", "1");
        set.delete("b");
        assert_eq!(set.lookup("a"), Lookup::Found(b"1"));
        assert_eq!(set.lookup("b"), Lookup::Deleted);
        assert_eq!(set.lookup("c"), Lookup::Unknown);
    }

    #[test]
    fn test_apply_listing() {
        let mut set = ChangeSet::new();
        set.insert("dir1/new", "x");
        set.delete("dir1/old");
        set.insert("dir11/other", "y");
        set.insert("dir2/file", "z");

        let listed = set.apply_listing(
            "dir1",
            vec!["dir1/keep".to_string(), "dir1/old".to_string()],
        );
        assert_eq!(listed, vec!["dir1/keep", "dir1/new"]);
    }

    #[test]
    fn test_dir_prefix() {
        assert_eq!(dir_prefix("notes"), "notes/");
        assert_eq!(dir_prefix("notes/"), "notes/");
    }
}
