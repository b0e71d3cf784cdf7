//! Tree façade
//!
//! The keyspace trie as callers see it: initialize the root, look keys up,
//! publish rewritten nodes, walk every node. The tree owns no state of its
//! own — it coordinates the key store (blocks on disk) and the node cache
//! (published in-memory copies).
//!
//! The root always covers `(1, 2^256 − 1)`: the all-zero key is reserved and
//! the all-ones key is the upper sentinel, so every storable key lies
//! strictly inside.

use std::sync::Arc;

use crate::cache::NodeCache;
use crate::error::{StrideError, StrideResult};
use crate::key::{Key, KeyValue};
use crate::node::{Node, EMPTY_CHILD};
use crate::store::KeyStore;

/// Block id of the root node.
pub const ROOT_ID: u64 = 0;

pub struct Tree {
    store: Arc<KeyStore>,
    cache: Arc<NodeCache>,
}

impl Tree {
    pub fn new(store: Arc<KeyStore>, cache: Arc<NodeCache>) -> Tree {
        Tree { store, cache }
    }

    fn first_root_key() -> Key {
        Key::from_u64(1)
    }

    fn last_root_key() -> Key {
        Key::MAX
    }

    /// Builds the root node if it is not already on disk. `add_synthetics`
    /// primes the fresh root's slots with stride boundaries so its children
    /// have well-defined ranges before any real key arrives; the DB façade
    /// always primes, store-level tests may not.
    pub fn init(&self, add_synthetics: bool) -> StrideResult<()> {
        match self.store.get(ROOT_ID) {
            Ok(_) => return Ok(()),
            Err(StrideError::KeyNotFound) => {}
            Err(e) => return Err(e),
        }
        let mut root = self.store.new_node(0, Self::first_root_key(), Self::last_root_key());
        if add_synthetics {
            root.add_synthetic_key_values();
        }
        let root = Arc::new(root);
        self.cache.reset();
        self.cache.add(root.clone());
        self.store.set(&root)
    }

    pub fn root(&self) -> StrideResult<Arc<Node>> {
        self.get_node(ROOT_ID)
    }

    /// Loads a node, preferring the cached published copy.
    pub fn get_node(&self, id: u64) -> StrideResult<Arc<Node>> {
        if let Some(node) = self.cache.get_by_id(id) {
            return Ok(node);
        }
        Ok(Arc::new(self.store.get(id)?))
    }

    /// Allocates a node covering `(first, last)` at `level`; it reaches disk
    /// only when a flush commits it.
    pub fn create_node(&self, level: u32, first: Key, last: Key) -> Node {
        self.store.new_node(level, first, last)
    }

    /// Locates `key` in the tree, descending from the deepest cached node
    /// whose range covers it. Nodes loaded on the way down are cached.
    pub fn get(&self, key: &Key) -> StrideResult<KeyValue> {
        let mut node = match self.cache.get(key) {
            Some(node) => node,
            None => Arc::new(self.store.get(ROOT_ID)?),
        };
        loop {
            if let Some(kv) = node.find(key) {
                return Ok(kv);
            }
            let span = match node.span_containing(key) {
                Some(span) => span,
                None => return Err(StrideError::KeyNotFound),
            };
            if span.child == EMPTY_CHILD {
                return Err(StrideError::KeyNotFound);
            }
            let child = Arc::new(self.store.get(span.child)?);
            self.cache.add(child.clone());
            node = child;
        }
    }

    /// Publishes a rewritten node: block on disk first, then the cache, so a
    /// concurrent reader either misses (and reads the block just written) or
    /// sees the same copy.
    pub fn update(&self, node: Arc<Node>) -> StrideResult<()> {
        self.store.set(&node)?;
        self.cache.add(node);
        Ok(())
    }

    /// Pre-order traversal over the on-disk tree.
    pub fn walk<F>(&self, f: &mut F) -> StrideResult<()>
    where
        F: FnMut(&Node, u32) -> StrideResult<()>,
    {
        self.walk_from(ROOT_ID, 0, f)
    }

    fn walk_from<F>(&self, id: u64, level: u32, f: &mut F) -> StrideResult<()>
    where
        F: FnMut(&Node, u32) -> StrideResult<()>,
    {
        let node = self.store.get(id)?;
        f(&node, level)?;
        for span in node.child_spans() {
            if span.child != EMPTY_CHILD {
                self.walk_from(span.child, level + 1, f)?;
            }
        }
        Ok(())
    }

    /// Walks the whole tree checking the node invariants.
    pub fn is_sane(&self) -> StrideResult<bool> {
        let mut sane = true;
        self.walk(&mut |node, _| {
            sane &= node.is_sane();
            Ok(())
        })?;
        Ok(sane)
    }

    /// Number of real (non-synthetic) keys in the tree.
    pub fn non_synthetic_key_count(&self) -> StrideResult<u64> {
        let mut count = 0u64;
        self.walk(&mut |node, _| {
            count += node.non_synthetic_key_count() as u64;
            Ok(())
        })?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::journal::Journal;
    use crate::store::ValueStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        keys: Arc<KeyStore>,
        values: ValueStore,
        cache: Arc<NodeCache>,
        buffer: Buffer,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = TempDir::new().unwrap();
            let keys = Arc::new(KeyStore::open(dir.path().join("test.keys"), 4096).unwrap());
            let values = ValueStore::open(dir.path().join("test.values")).unwrap();
            let cache = Arc::new(NodeCache::new(64));
            Fixture {
                _dir: dir,
                keys,
                values,
                cache,
                buffer: Buffer::new(),
            }
        }

        fn tree(&self) -> Tree {
            Tree::new(self.keys.clone(), self.cache.clone())
        }
    }

    fn random_keys(n: usize, seed: u64) -> Vec<Key> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut bytes = [0u8; Key::BYTES];
                rng.fill(&mut bytes[..]);
                Key::from_be_bytes(bytes)
            })
            .collect()
    }

    #[test]
    fn test_init_builds_root_once() {
        let fixture = Fixture::new();
        let tree = fixture.tree();

        tree.init(false).unwrap();
        assert!(tree.is_sane().unwrap());
        assert_eq!(fixture.keys.size(), 4096);

        // A second init is a no-op, not a second allocation.
        tree.init(false).unwrap();
        assert_eq!(fixture.keys.size(), 4096);

        let root = tree.root().unwrap();
        assert_eq!(root.id(), ROOT_ID);
        assert_eq!(*root.first(), Key::from_u64(1));
        assert_eq!(*root.last(), Key::MAX);
        assert!(root.is_empty());
    }

    #[test]
    fn test_init_with_synthetics_primes_root() {
        let fixture = Fixture::new();
        let tree = fixture.tree();
        tree.init(true).unwrap();

        let root = tree.root().unwrap();
        assert_eq!(root.empty_slot_count(), 0);
        assert_eq!(root.non_synthetic_key_count(), 0);
        assert!(tree.is_sane().unwrap());
    }

    #[test]
    fn test_get_on_empty_tree_is_not_found() {
        let fixture = Fixture::new();
        let tree = fixture.tree();
        tree.init(false).unwrap();

        assert!(matches!(
            tree.get(&Key::from_u64(42)),
            Err(StrideError::KeyNotFound)
        ));
    }

    #[test]
    fn test_random_rounds_with_duplicates() {
        let fixture = Fixture::new();
        let tree = fixture.tree();
        tree.init(false).unwrap();

        let per_round = 20usize;
        let rounds = 4u64;
        // Two passes with the same seeds: the second pass stages nothing but
        // duplicates, which must leave the tree unchanged.
        for _pass in 0..2 {
            for round in 0..rounds {
                let keys = random_keys(per_round, round);
                for key in &keys {
                    fixture.buffer.add(*key, key.to_be_bytes().to_vec());
                }
                assert_eq!(fixture.buffer.len(), per_round);

                let mut journal = Journal::new(&fixture.buffer, &fixture.values);
                journal.process(&tree).unwrap();
                assert!(tree.is_sane().unwrap());
                journal.commit(&tree, 5).unwrap();
                assert!(tree.is_sane().unwrap());

                for key in &keys {
                    assert_eq!(tree.get(key).unwrap().key, *key);
                }
            }
        }

        assert_eq!(
            tree.non_synthetic_key_count().unwrap(),
            (rounds as usize * per_round) as u64
        );
    }

    #[test]
    fn test_update_publishes_to_disk_and_cache() {
        let fixture = Fixture::new();
        let tree = fixture.tree();
        tree.init(false).unwrap();

        let mut rewritten = (*tree.root().unwrap()).clone();
        rewritten.add_synthetic_key_values();
        tree.update(Arc::new(rewritten)).unwrap();

        // The cache serves the new copy, and so does a cold read.
        assert_eq!(tree.get_node(ROOT_ID).unwrap().empty_slot_count(), 0);
        assert_eq!(fixture.keys.get(ROOT_ID).unwrap().empty_slot_count(), 0);
    }

    #[test]
    fn test_walk_visits_levels_in_preorder() {
        let fixture = Fixture::new();
        let tree = fixture.tree();
        tree.init(false).unwrap();

        // Force a multi-level tree through the journal.
        for key in random_keys(200, 7) {
            fixture.buffer.add(key, key.to_be_bytes().to_vec());
        }
        let mut journal = Journal::new(&fixture.buffer, &fixture.values);
        journal.process(&tree).unwrap();
        journal.commit(&tree, 4096).unwrap();

        let mut last_seen_at: Vec<u32> = Vec::new();
        tree.walk(&mut |node, level| {
            assert_eq!(node.level(), level);
            last_seen_at.push(level);
            Ok(())
        })
        .unwrap();
        assert_eq!(last_seen_at[0], 0);
        assert!(last_seen_at.len() > 1, "200 keys must not fit the root");
    }
}
