// Replicated store
// A path-addressed tree of directories, locally held values and pointers to the
// nodes holding a value. Leaf writes are last-writer-wins by timestamp.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use cumulus_api::StorePath;

/// A leaf to be written
#[derive(Clone, Debug, PartialEq)]
pub enum Leaf {
    /// The value itself lives on this node
    Local { value: Value, timestamp: i64 },
    /// The value lives on `holders`, in preference order
    Remote { timestamp: i64, holders: Vec<Uuid> },
}

impl Leaf {
    pub fn timestamp(&self) -> i64 {
        match self {
            Leaf::Local { timestamp, .. } | Leaf::Remote { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this leaf wins over `existing`
    fn supersedes(&self, existing: &Leaf) -> bool {
        match self.timestamp().cmp(&existing.timestamp()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => {
                matches!((self, existing), (Leaf::Local { .. }, Leaf::Remote { .. }))
            }
            std::cmp::Ordering::Less => false,
        }
    }
}

/// What a path currently resolves to
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    Directory(Vec<String>),
    Leaf(Leaf),
}

/// Outcome of a leaf write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// An entry with a newer (or equal) timestamp was kept
    Stale,
    /// The path crosses a leaf or names a non-empty directory
    Rejected,
}

#[derive(Debug)]
enum TreeNode {
    Directory(BTreeMap<String, TreeNode>),
    Leaf(Leaf),
}

impl TreeNode {
    fn empty_dir() -> Self {
        TreeNode::Directory(BTreeMap::new())
    }

    fn leaf_count(&self) -> usize {
        match self {
            TreeNode::Directory(children) => children.values().map(TreeNode::leaf_count).sum(),
            TreeNode::Leaf(_) => 1,
        }
    }
}

pub struct ReplicatedStore {
    root: RwLock<BTreeMap<String, TreeNode>>,
}

impl Default for ReplicatedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedStore {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(BTreeMap::new()),
        }
    }

    /// Walk to the parent directory of `path`, creating missing directories.
    ///
    /// Returns `None` when an intermediate segment is a leaf.
    fn parent_dir_mut<'a>(
        root: &'a mut BTreeMap<String, TreeNode>,
        path: &StorePath,
    ) -> Option<&'a mut BTreeMap<String, TreeNode>> {
        let segments = path.segments();
        let mut dir = root;
        for segment in &segments[..segments.len().saturating_sub(1)] {
            let next = dir
                .entry(segment.clone())
                .or_insert_with(TreeNode::empty_dir);
            match next {
                TreeNode::Directory(children) => dir = children,
                TreeNode::Leaf(_) => return None,
            }
        }
        Some(dir)
    }

    fn find<'a>(root: &'a BTreeMap<String, TreeNode>, path: &StorePath) -> Option<&'a TreeNode> {
        let (last, parents) = path.segments().split_last()?;
        let mut dir = root;
        for segment in parents {
            match dir.get(segment)? {
                TreeNode::Directory(children) => dir = children,
                TreeNode::Leaf(_) => return None,
            }
        }
        dir.get(last)
    }

    /// Write a leaf at `path`, honoring last-writer-wins
    pub fn put_leaf(&self, path: &StorePath, leaf: Leaf) -> WriteOutcome {
        let Some(name) = path.name() else {
            debug!("Rejecting leaf write at the root");
            return WriteOutcome::Rejected;
        };

        let mut root = self.root.write();
        let Some(dir) = Self::parent_dir_mut(&mut root, path) else {
            debug!("Rejecting leaf write through a leaf: {}", path);
            return WriteOutcome::Rejected;
        };

        let outcome = match dir.get(name) {
            None => WriteOutcome::Written,
            Some(TreeNode::Directory(children)) if children.is_empty() => WriteOutcome::Written,
            Some(TreeNode::Directory(_)) => {
                debug!("Rejecting leaf write onto directory {}", path);
                WriteOutcome::Rejected
            }
            Some(TreeNode::Leaf(existing)) if leaf.supersedes(existing) => WriteOutcome::Written,
            Some(TreeNode::Leaf(existing)) => {
                debug!(
                    "Keeping newer entry at {} ({} >= {})",
                    path,
                    existing.timestamp(),
                    leaf.timestamp()
                );
                WriteOutcome::Stale
            }
        };

        if outcome == WriteOutcome::Written {
            dir.insert(name.to_string(), TreeNode::Leaf(leaf));
        }
        outcome
    }

    /// Ensure a directory exists at `path`; fails if a leaf is in the way
    pub fn create_directory(&self, path: &StorePath) -> bool {
        let Some(name) = path.name() else {
            return true;
        };

        let mut root = self.root.write();
        let Some(dir) = Self::parent_dir_mut(&mut root, path) else {
            return false;
        };
        match dir
            .entry(name.to_string())
            .or_insert_with(TreeNode::empty_dir)
        {
            TreeNode::Directory(_) => true,
            TreeNode::Leaf(_) => false,
        }
    }

    /// Remove the entry at `path` and its whole subtree; the root is cleared
    pub fn remove(&self, path: &StorePath) -> bool {
        let mut root = self.root.write();
        let Some((last, parents)) = path.segments().split_last() else {
            let had_entries = !root.is_empty();
            root.clear();
            return had_entries;
        };

        let mut dir = &mut *root;
        for segment in parents {
            match dir.get_mut(segment) {
                Some(TreeNode::Directory(children)) => dir = children,
                _ => return false,
            }
        }
        dir.remove(last).is_some()
    }

    pub fn get(&self, path: &StorePath) -> Option<Entry> {
        let root = self.root.read();
        if path.is_root() {
            return Some(Entry::Directory(root.keys().cloned().collect()));
        }
        Self::find(&root, path).map(|node| match node {
            TreeNode::Directory(children) => Entry::Directory(children.keys().cloned().collect()),
            TreeNode::Leaf(leaf) => Entry::Leaf(leaf.clone()),
        })
    }

    /// The value at `path` if it is held locally
    pub fn local_value(&self, path: &StorePath) -> Option<Value> {
        match self.get(path)? {
            Entry::Leaf(Leaf::Local { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Child names of the directory at `path`
    pub fn list(&self, path: &StorePath) -> Option<Vec<String>> {
        match self.get(path)? {
            Entry::Directory(children) => Some(children),
            Entry::Leaf(_) => None,
        }
    }

    /// Number of leaves in the tree
    pub fn leaf_count(&self) -> usize {
        self.root.read().values().map(TreeNode::leaf_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> StorePath {
        s.parse().unwrap()
    }

    fn local(value: i64, timestamp: i64) -> Leaf {
        Leaf::Local {
            value: Value::from(value),
            timestamp,
        }
    }

    #[test]
    fn test_put_creates_intermediate_directories() {
        let store = ReplicatedStore::new();
        assert_eq!(store.put_leaf(&path("a/b/c"), local(1, 10)), WriteOutcome::Written);

        assert_eq!(store.list(&path("a")), Some(vec!["b".to_string()]));
        assert_eq!(store.list(&path("a/b")), Some(vec!["c".to_string()]));
        assert_eq!(store.local_value(&path("a/b/c")), Some(Value::from(1)));
        assert_eq!(store.list(&StorePath::root()), Some(vec!["a".to_string()]));
        assert_eq!(store.leaf_count(), 1);
    }

    #[test]
    fn test_last_writer_wins_in_any_order() {
        let forward = ReplicatedStore::new();
        forward.put_leaf(&path("k"), local(1, 10));
        forward.put_leaf(&path("k"), local(2, 20));

        let backward = ReplicatedStore::new();
        backward.put_leaf(&path("k"), local(2, 20));
        assert_eq!(backward.put_leaf(&path("k"), local(1, 10)), WriteOutcome::Stale);

        assert_eq!(forward.local_value(&path("k")), Some(Value::from(2)));
        assert_eq!(backward.local_value(&path("k")), Some(Value::from(2)));
    }

    #[test]
    fn test_equal_timestamp_prefers_local_value() {
        let holder = Uuid::new_v4();
        let store = ReplicatedStore::new();
        store.put_leaf(
            &path("k"),
            Leaf::Remote {
                timestamp: 5,
                holders: vec![holder],
            },
        );
        assert_eq!(store.put_leaf(&path("k"), local(9, 5)), WriteOutcome::Written);
        assert_eq!(
            store.put_leaf(
                &path("k"),
                Leaf::Remote {
                    timestamp: 5,
                    holders: vec![holder],
                },
            ),
            WriteOutcome::Stale
        );
        assert_eq!(store.local_value(&path("k")), Some(Value::from(9)));
    }

    #[test]
    fn test_leaf_write_conflicts_are_rejected() {
        let store = ReplicatedStore::new();
        store.put_leaf(&path("a/b"), local(1, 1));

        // Through a leaf
        assert_eq!(store.put_leaf(&path("a/b/c"), local(2, 2)), WriteOutcome::Rejected);
        // Onto a non-empty directory
        assert_eq!(store.put_leaf(&path("a"), local(3, 3)), WriteOutcome::Rejected);
        // At the root
        assert_eq!(store.put_leaf(&StorePath::root(), local(4, 4)), WriteOutcome::Rejected);

        assert!(store.create_directory(&path("d")));
        assert_eq!(store.put_leaf(&path("d"), local(5, 5)), WriteOutcome::Written);
    }

    #[test]
    fn test_remote_leaf_is_not_a_local_value() {
        let store = ReplicatedStore::new();
        let holders = vec![Uuid::new_v4(), Uuid::new_v4()];
        store.put_leaf(
            &path("x"),
            Leaf::Remote {
                timestamp: 1,
                holders: holders.clone(),
            },
        );
        assert_eq!(store.local_value(&path("x")), None);
        assert_eq!(
            store.get(&path("x")),
            Some(Entry::Leaf(Leaf::Remote {
                timestamp: 1,
                holders
            }))
        );
    }

    #[test]
    fn test_directories_and_removal() {
        let store = ReplicatedStore::new();
        assert!(store.create_directory(&path("svc/web")));
        store.put_leaf(&path("svc/web/config"), local(1, 1));
        store.put_leaf(&path("svc/db"), local(2, 1));
        assert!(!store.create_directory(&path("svc/db")));
        assert!(!store.create_directory(&path("svc/db/child")));

        assert!(store.remove(&path("svc/web")));
        assert_eq!(store.get(&path("svc/web/config")), None);
        assert_eq!(store.list(&path("svc")), Some(vec!["db".to_string()]));
        assert!(!store.remove(&path("svc/missing/deep")));

        assert!(store.remove(&StorePath::root()));
        assert_eq!(store.leaf_count(), 0);
    }
}
