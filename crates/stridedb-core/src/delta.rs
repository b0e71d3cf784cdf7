//! Per-node mutation plans
//!
//! A Delta is one node's pending change during a flush. The shared
//! (published) node is never touched: the first mutation clones it, and the
//! clone is what the journal later persists and republishes. Readers racing
//! the flush keep seeing the previous copy.
//!
//! `add_keys` is the distribution step: it pulls the staged keys that fall in
//! the node's keyspace out of the buffer and either packs them into free
//! slots, or — when the node would overflow — rebuilds the slot array so
//! that each slot keeps the key closest to its stride boundary, evicting the
//! rest for re-routing into children.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::key::{Key, KeyValue};
use crate::node::Node;

pub struct Delta {
    previous: Arc<Node>,
    current: Option<Node>,
    existing: u64,
    insertions: u64,
    evictions: u64,
    synthetics: u64,
    children: u64,
}

impl Delta {
    pub fn new(node: Arc<Node>) -> Delta {
        Delta {
            previous: node,
            current: None,
            existing: 0,
            insertions: 0,
            evictions: 0,
            synthetics: 0,
            children: 0,
        }
    }

    /// True once any mutation has cloned the node.
    pub fn dirty(&self) -> bool {
        self.current.is_some()
    }

    /// The node as this flush sees it: the mutated copy once dirty, the
    /// shared original until then.
    pub fn node(&self) -> &Node {
        self.current.as_ref().unwrap_or(&self.previous)
    }

    /// Net keys this delta added to its node.
    pub fn insertions(&self) -> u64 {
        self.insertions.saturating_sub(self.evictions)
    }

    /// Copy-on-write: clones the published node on the first mutation.
    fn current_mut(&mut self) -> &mut Node {
        let previous = &self.previous;
        self.current.get_or_insert_with(|| (**previous).clone())
    }

    pub fn set_child(&mut self, index: usize, child_id: u64) {
        self.children += 1;
        self.current_mut().set_child(index, child_id);
    }

    /// The node to persist; the untouched original if nothing changed.
    pub fn into_node(self) -> Arc<Node> {
        match self.current {
            Some(node) => Arc::new(node),
            None => self.previous,
        }
    }

    /// Distributes staged keys into this node, starting value-log offset
    /// assignment at `offset`. Returns the offset advanced past every record
    /// this node claimed.
    pub fn add_keys(&mut self, buffer: &Buffer, mut offset: u64) -> u64 {
        let mut candidates: BTreeSet<KeyValue> = BTreeSet::new();
        let mut evictions: BTreeSet<KeyValue> = BTreeSet::new();
        buffer.candidates(
            self.node().first(),
            self.node().last(),
            &mut candidates,
            &mut evictions,
        );
        if candidates.is_empty() && evictions.is_empty() {
            // Nothing staged here; the root is visited unconditionally and
            // often lands in this case.
            return offset;
        }

        let mut existing: BTreeSet<KeyValue> = self.node().occupied_slots().copied().collect();
        self.existing = existing.len() as u64;

        // A staged key that already owns a slot is a duplicate write; the
        // tree keeps the committed value and the pending one is dropped.
        let dupes: Vec<KeyValue> = candidates.intersection(&existing).copied().collect();
        for kv in dupes {
            buffer.remove_duplicate(&kv.key);
            candidates.remove(&kv);
        }

        if (candidates.is_empty() && evictions.is_empty())
            || self.node().empty_slot_count() == 0
        {
            return offset;
        }

        let max_slots = self.node().max_slots();
        if existing.len() + candidates.len() + evictions.len() <= max_slots {
            // Everything fits. Pack new entries into the leading empty slots,
            // give fresh offsets to the candidates (evictees keep the record
            // they already own), and restore slot order.
            let candidate_count = candidates.len();
            let node = self.current_mut();
            for (i, kv) in candidates.iter().chain(evictions.iter()).enumerate() {
                node.set_slot(i, *kv);
            }
            for i in 0..candidate_count {
                let mut kv = node.slot(i);
                buffer.set_offset(&kv.key, offset);
                kv.offset = offset;
                node.set_slot(i, kv);
                offset += kv.length as u64;
            }
            node.sort_slots();
            self.insertions += candidate_count as u64;
            return offset;
        }

        // Overflow: rebuild the slot array from the union of staged and
        // existing keys. Each key lands in the slot of its nearest stride
        // boundary; within a slot the smallest residual wins and the rest
        // are displaced.
        let mut combined = candidates.clone();
        combined.extend(evictions.iter().copied());
        combined.extend(existing.iter().copied());

        let stride = self.node().stride();
        let mut insertions = 0u64;
        let synthetics;
        {
            let node = self.current_mut();
            let first = *node.first();
            node.clear_slots();

            let mut prev_slot = 0usize;
            let mut best = Key::MAX;
            for kv in &combined {
                let (slot, residual) = Key::nearest_stride(&first, &stride, &kv.key);
                if slot != prev_slot || residual < best {
                    node.set_slot(slot, *kv);
                    best = residual;
                }
                prev_slot = slot;
            }

            synthetics = node.add_synthetic_key_values();

            for i in 0..node.max_slots() {
                let mut kv = node.slot(i);
                if kv.is_synthetic() {
                    continue;
                }
                if candidates.contains(&kv) {
                    insertions += 1;
                    buffer.set_offset(&kv.key, offset);
                    kv.offset = offset;
                    node.set_slot(i, kv);
                    offset += kv.length as u64;
                }
                existing.remove(&kv);
            }
        }
        self.synthetics = synthetics;
        self.insertions += insertions;

        // Whatever survived from the old slot set keeps its place; the rest
        // go back to the buffer to be routed into children on descent.
        for kv in &existing {
            if kv.is_synthetic() {
                continue;
            }
            self.evictions += 1;
            buffer.add_evictee(kv.key, kv.offset, kv.length);
        }

        offset
    }
}

impl fmt::Debug for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delta")
            .field("id", &self.node().id())
            .field("dirty", &self.dirty())
            .field("existing", &self.existing)
            .field("insertions", &self.insertions)
            .field("evictions", &self.evictions)
            .field("synthetics", &self.synthetics)
            .field("children", &self.children)
            .finish()
    }
}
