//! Node cache
//!
//! A bounded cache of published (immutable) tree nodes with two lookup paths
//! besides the usual id index: entries are ordered by `(level descending,
//! first key ascending)` so that one ordered scan can find the deepest cached
//! node whose range covers a key, short-circuiting tree descent from the
//! root. Recency is tracked by monotonically stamped entries in a second
//! ordered map; the entry with the oldest stamp is the LRU victim.
//!
//! A single mutex serializes every operation; no method blocks while holding
//! it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::key::Key;
use crate::node::Node;

/// Composite cache key ordered level-descending, then first-key-ascending,
/// so iteration starts at the deepest leftmost node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct CacheKey {
    level: u32,
    first: Key,
}

impl Ord for CacheKey {
    fn cmp(&self, other: &CacheKey) -> std::cmp::Ordering {
        other
            .level
            .cmp(&self.level)
            .then_with(|| self.first.cmp(&other.first))
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &CacheKey) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct CacheSlot {
    node: Arc<Node>,
    stamp: u64,
}

struct Inner {
    max_size: u64,
    nodes: BTreeMap<CacheKey, CacheSlot>,
    by_id: HashMap<u64, CacheKey>,
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
    hits: u64,
    misses: u64,
    inserts: u64,
    updates: u64,
}

impl Inner {
    /// Moves an entry to most-recently-used.
    fn touch(&mut self, cache_key: &CacheKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.nodes.get_mut(cache_key) {
            self.recency.remove(&slot.stamp);
            slot.stamp = tick;
            self.recency.insert(tick, *cache_key);
        }
    }
}

pub struct NodeCache {
    inner: Mutex<Inner>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: u64,
    pub max_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub updates: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size: {}/{} hits: {} misses: {} inserts: {} updates: {}",
            self.size, self.max_size, self.hits, self.misses, self.inserts, self.updates
        )
    }
}

impl NodeCache {
    /// A `max_size` of 0 disables caching entirely.
    pub fn new(max_size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_size,
                nodes: BTreeMap::new(),
                by_id: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
                inserts: 0,
                updates: 0,
            }),
        }
    }

    /// Inserts or replaces the node published under `(level, first)`. A
    /// replacement must carry the same id: a node's position in the keyspace
    /// never moves between blocks. Insertion at capacity evicts the LRU
    /// entry.
    pub fn add(&self, node: Arc<Node>) {
        let mut inner = self.inner.lock();
        if inner.max_size == 0 {
            return;
        }
        let cache_key = CacheKey {
            level: node.level(),
            first: *node.first(),
        };
        if inner.nodes.contains_key(&cache_key) {
            inner.updates += 1;
            inner.touch(&cache_key);
            if let Some(slot) = inner.nodes.get_mut(&cache_key) {
                debug_assert_eq!(slot.node.id(), node.id());
                slot.node = node;
            }
        } else {
            inner.inserts += 1;
            if inner.nodes.len() as u64 == inner.max_size {
                if let Some((_, victim)) = inner.recency.pop_first() {
                    if let Some(slot) = inner.nodes.remove(&victim) {
                        inner.by_id.remove(&slot.node.id());
                    }
                }
            }
            inner.tick += 1;
            let stamp = inner.tick;
            inner.by_id.insert(node.id(), cache_key);
            inner.recency.insert(stamp, cache_key);
            inner.nodes.insert(cache_key, CacheSlot { node, stamp });
        }
    }

    pub fn get_by_id(&self, id: u64) -> Option<Arc<Node>> {
        let inner = self.inner.lock();
        let cache_key = inner.by_id.get(&id)?;
        inner.nodes.get(cache_key).map(|slot| slot.node.clone())
    }

    /// Finds the lowest cached node whose range strictly contains `key`,
    /// scanning level by level from just below the deepest cached level.
    /// At each level the predecessor under the composite order is probed;
    /// landing back on a deeper entry means no shallower cover exists along
    /// this path and the scan stops. The all-zero key never hits.
    pub fn get(&self, key: &Key) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        if inner.max_size == 0 || inner.nodes.is_empty() {
            return None;
        }
        let deepest = inner
            .nodes
            .keys()
            .next()
            .map(|cache_key| cache_key.level)
            .unwrap_or(0);
        for level in (1..=deepest + 1).rev() {
            let probe = CacheKey { level, first: *key };
            let found = inner
                .nodes
                .range(..=probe)
                .next_back()
                .or_else(|| inner.nodes.iter().next())
                .map(|(cache_key, slot)| (*cache_key, slot.node.clone()));
            let (cache_key, node) = match found {
                Some(entry) => entry,
                None => break,
            };
            if node.level() > level {
                break;
            }
            if *node.first() < *key && *key < *node.last() {
                inner.hits += 1;
                inner.touch(&cache_key);
                return Some(node);
            }
        }
        inner.misses += 1;
        None
    }

    /// Clears all entries and counters; the size bound is kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.by_id.clear();
        inner.recency.clear();
        inner.tick = 0;
        inner.hits = 0;
        inner.misses = 0;
        inner.inserts = 0;
        inner.updates = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.nodes.len() as u64,
            max_size: inner.max_size,
            hits: inner.hits,
            misses: inner.misses,
            inserts: inner.inserts,
            updates: inner.updates,
        }
    }
}
