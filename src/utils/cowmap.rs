//! Persistent ordered map with copy-on-write structural sharing.
//!
//! [`CowMap`] is an immutable-node binary search tree: cloning a map is
//! O(1) (it shares the root), and inserting into one clone copies only
//! the path to the affected key while every untouched subtree remains
//! shared. Nodes are reference counted and released when no live map
//! reaches them.
//!
//! FastSLAM keeps one `CowMap` of feature posteriors per particle, so
//! resampling duplicates particles in O(1) and a subsequent per-feature
//! update diverges by O(log F) freshly allocated nodes.
//!
//! The tree is kept balanced as a treap whose priorities are derived
//! deterministically from the key hash, bounding the expected depth
//! without carrying an RNG.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

struct Node<K, V> {
    key: K,
    value: V,
    priority: u64,
    left: Link<K, V>,
    right: Link<K, V>,
}

type Link<K, V> = Option<Arc<Node<K, V>>>;

/// Copy-on-write ordered map.
pub struct CowMap<K, V> {
    root: Link<K, V>,
    len: usize,
}

impl<K, V> Clone for CowMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for CowMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CowMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Remove all entries from this handle. Other handles sharing the
    /// tree are unaffected.
    pub fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }
}

impl<K: Ord, V> CowMap<K, V> {
    /// The value for `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        let mut cursor = &self.root;
        while let Some(node) = cursor {
            cursor = match key.cmp(&node.key) {
                std::cmp::Ordering::Less => &node.left,
                std::cmp::Ordering::Greater => &node.right,
                std::cmp::Ordering::Equal => return Some(&node.value),
            };
        }
        None
    }

    /// The value for `key`. The key must be present.
    pub fn get(&self, key: &K) -> &V {
        self.lookup(key).expect("key not present in cowmap")
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    /// Number of entries equal to `key` (0 or 1).
    pub fn count(&self, key: &K) -> usize {
        usize::from(self.contains(key))
    }

    /// In-order traversal.
    pub fn for_each<F: FnMut(&K, &V)>(&self, mut f: F) {
        fn walk<K, V, F: FnMut(&K, &V)>(link: &Link<K, V>, f: &mut F) {
            if let Some(node) = link {
                walk(&node.left, f);
                f(&node.key, &node.value);
                walk(&node.right, f);
            }
        }
        walk(&self.root, &mut f);
    }
}

impl<K: Ord + Hash + Clone, V: Clone> CowMap<K, V> {
    /// Insert or replace, copying the path to `key` and sharing every
    /// sibling subtree with prior clones of this map.
    ///
    /// Returns `true` if the key was newly inserted.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let priority = key_priority(&key);
        let (root, inserted) = insert_node(&self.root, key, value, priority);
        self.root = Some(root);
        self.len += usize::from(inserted);
        inserted
    }
}

fn key_priority<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn insert_node<K: Ord + Clone, V: Clone>(
    link: &Link<K, V>,
    key: K,
    value: V,
    priority: u64,
) -> (Arc<Node<K, V>>, bool) {
    let node = match link {
        None => {
            return (
                Arc::new(Node {
                    key,
                    value,
                    priority,
                    left: None,
                    right: None,
                }),
                true,
            )
        }
        Some(node) => node,
    };

    match key.cmp(&node.key) {
        std::cmp::Ordering::Equal => (
            Arc::new(Node {
                key,
                value,
                priority: node.priority,
                left: node.left.clone(),
                right: node.right.clone(),
            }),
            false,
        ),
        std::cmp::Ordering::Less => {
            let (left, inserted) = insert_node(&node.left, key, value, priority);
            if left.priority > node.priority {
                // rotate right so the heap order on priorities holds
                let lowered = Arc::new(Node {
                    key: node.key.clone(),
                    value: node.value.clone(),
                    priority: node.priority,
                    left: left.right.clone(),
                    right: node.right.clone(),
                });
                (
                    Arc::new(Node {
                        key: left.key.clone(),
                        value: left.value.clone(),
                        priority: left.priority,
                        left: left.left.clone(),
                        right: Some(lowered),
                    }),
                    inserted,
                )
            } else {
                (
                    Arc::new(Node {
                        key: node.key.clone(),
                        value: node.value.clone(),
                        priority: node.priority,
                        left: Some(left),
                        right: node.right.clone(),
                    }),
                    inserted,
                )
            }
        }
        std::cmp::Ordering::Greater => {
            let (right, inserted) = insert_node(&node.right, key, value, priority);
            if right.priority > node.priority {
                // rotate left
                let lowered = Arc::new(Node {
                    key: node.key.clone(),
                    value: node.value.clone(),
                    priority: node.priority,
                    left: node.left.clone(),
                    right: right.left.clone(),
                });
                (
                    Arc::new(Node {
                        key: right.key.clone(),
                        value: right.value.clone(),
                        priority: right.priority,
                        left: Some(lowered),
                        right: right.right.clone(),
                    }),
                    inserted,
                )
            } else {
                (
                    Arc::new(Node {
                        key: node.key.clone(),
                        value: node.value.clone(),
                        priority: node.priority,
                        left: node.left.clone(),
                        right: Some(right),
                    }),
                    inserted,
                )
            }
        }
    }
}

impl<K: Ord + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for CowMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        self.for_each(|k, v| {
            map.entry(k, v);
        });
        map.finish()
    }
}
