//! Flush-cycle orchestration
//!
//! A Journal is scoped to a single flush. It walks the tree from the root,
//! building one Delta per visited node: each node claims the staged keys in
//! its keyspace, and a node with no free slot delegates to its children —
//! recursing only into child intervals the buffer has keys for, creating
//! children that do not exist yet.
//!
//! Committing happens in a strict order:
//! 1. value bytes: the buffer's batched records are appended to the log at
//!    exactly the offsets the walk assigned;
//! 2. nodes, deepest level first, so no parent is ever persisted pointing at
//!    a child block that is not on disk;
//! 3. the buffer purges its finished entries.
//!
//! On any error the journal returns immediately without purging; the buffer
//! keeps its state and the next cycle retries the same work.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::delta::Delta;
use crate::error::StrideResult;
use crate::node::{Node, EMPTY_CHILD};
use crate::store::ValueStore;
use crate::tree::Tree;

pub struct Journal<'a> {
    buffer: &'a Buffer,
    values: &'a ValueStore,
    deltas: BTreeMap<u32, Vec<Delta>>,
    offset: u64,
}

impl<'a> Journal<'a> {
    pub fn new(buffer: &'a Buffer, values: &'a ValueStore) -> Journal<'a> {
        Journal {
            buffer,
            values,
            deltas: BTreeMap::new(),
            offset: 0,
        }
    }

    /// Builds this cycle's deltas. Offsets for new records start at the
    /// current end of the value log and advance monotonically through the
    /// whole walk.
    pub fn process(&mut self, tree: &Tree) -> StrideResult<()> {
        self.offset = self.values.size();
        let root = tree.root()?;
        self.walk(tree, root)
    }

    fn walk(&mut self, tree: &Tree, node: Arc<Node>) -> StrideResult<()> {
        let level = node.level();
        let mut delta = Delta::new(node);
        self.offset = delta.add_keys(self.buffer, self.offset);
        debug_assert!(delta.node().is_sane());

        if delta.node().empty_slot_count() == 0 {
            let spans = delta.node().child_spans();
            for span in spans {
                if !self.buffer.contains_range(&span.lo, &span.hi) {
                    continue;
                }
                if span.child == EMPTY_CHILD {
                    let child = tree.create_node(level + 1, span.lo, span.hi);
                    delta.set_child(span.index, child.id());
                    self.walk(tree, Arc::new(child))?;
                } else {
                    let child = tree.get_node(span.child)?;
                    self.walk(tree, child)?;
                }
            }
        }

        debug_assert!(delta.node().is_sane());
        if delta.dirty() {
            self.deltas.entry(level).or_default().push(delta);
        }
        Ok(())
    }

    /// Persists everything `process` planned.
    pub fn commit(&mut self, tree: &Tree, batch_size: usize) -> StrideResult<()> {
        let mut wb = Vec::with_capacity(batch_size);
        while self.buffer.write(batch_size, &mut wb) {
            self.values.append(&wb)?;
        }

        let deltas = std::mem::take(&mut self.deltas);
        for (_, level_deltas) in deltas.into_iter().rev() {
            for delta in level_deltas {
                tree.update(delta.into_node())?;
            }
        }

        self.buffer.purge();
        Ok(())
    }

    /// Number of nodes this cycle will rewrite.
    pub fn len(&self) -> usize {
        self.deltas.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Net keys inserted across all deltas, for the flush summary.
    pub fn total_insertions(&self) -> u64 {
        self.deltas
            .values()
            .flatten()
            .map(Delta::insertions)
            .sum()
    }
}
