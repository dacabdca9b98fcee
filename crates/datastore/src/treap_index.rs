//! The versioned treap index: a randomized binary search tree whose nodes
//! are rows of a dedicated index entity, so node versions obey the same
//! MVCC rules as ordinary rows.
//!
//! Structural changes are copy-on-write: every node touched on the way to a
//! modification is first run through `update_tuple`, so an uncommitted tree
//! shape is only reachable through the writing transaction's private root.
//! Child links are row ids with `-1` as the null pointer.
//!
//! Tree invariants, checked by the tests after every committed operation:
//! - min-heap on `priority`: a parent's priority is never greater than a
//!   child's;
//! - BST order under the index's comparator, with unique keys.

use std::cmp::Ordering;

use bytemuck::{Pod, Zeroable};
use shmdb_primitives::{RowId, Tid};

use crate::entity::{tuple_write_status, Entity, TupleStatus};
use crate::error::{DatastoreError, IndexError, Result, TableError};
use crate::region::{LockMode, Region};
use crate::registry::{Indexer, Matcher};
use crate::txn::TransactionTable;

/// One treap node. `target` is the indexed row in the base entity;
/// `priority` is drawn as a pseudorandom `i32` at insertion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct TreapNode {
    pub left: RowId,
    pub right: RowId,
    pub target: RowId,
    pub priority: i64,
}

pub(crate) const NODE_SIZE: usize = std::mem::size_of::<TreapNode>();

/// A treap stored in one index region.
#[derive(Copy, Clone)]
pub(crate) struct TreapIndex<'a> {
    entity: Entity<'a>,
}

impl<'a> TreapIndex<'a> {
    pub fn new(region: &'a Region) -> Self {
        TreapIndex {
            entity: Entity::new(region),
        }
    }

    pub fn region(&self) -> &'a Region {
        self.entity.region()
    }

    /// Reads the node at `row`, asserting it is readable under `tid`.
    /// An unreadable node means the walk strayed off the transaction's
    /// snapshot, which is an invariant violation, not a retryable state.
    fn node(&self, txn: &TransactionTable<'_>, tid: Tid, row: RowId) -> Result<TreapNode> {
        let entry = self.entity.entry(row)?;
        if !crate::entity::tuple_readable(txn, tid, &entry) {
            return Err(IndexError::NodeUnreadable {
                index: self.region().name().into(),
                row,
                tid,
            }
            .into());
        }
        Ok(TreapNode::from_bytes(&self.entity.tuple(row)?))
    }

    fn write_node(&self, row: RowId, node: &TreapNode) -> Result<()> {
        self.entity.set_tuple(row, bytemuck::bytes_of(node))
    }

    /// Copy-on-write preparation of one node row.
    fn update_node(&self, txn: &TransactionTable<'_>, tid: Tid, row: RowId) -> Result<RowId> {
        self.entity.update_tuple(txn, tid, row)
    }

    /// In-order walk from `node_row`, pruned by `idx_matcher`, post-filtered
    /// by `default_matcher`. Matching target rows are pushed to `out`; with
    /// `lock` set, each match is stamped with an update intent first, and a
    /// match locked by someone else aborts the walk with `Timeout`.
    ///
    /// The caller holds the transaction region's Read lock.
    pub fn search(
        &self,
        out: &mut Vec<RowId>,
        lock: bool,
        txn: &TransactionTable<'_>,
        tid: Tid,
        node_row: RowId,
        table: &Entity<'_>,
        idx_matcher: Option<&dyn Matcher>,
        default_matcher: Option<&dyn Matcher>,
    ) -> Result<()> {
        if !node_row.is_valid() {
            return Ok(());
        }
        let node = self.node(txn, tid, node_row)?;
        let data = table.tuple(node.target)?;
        let cmp = idx_matcher.map(|m| m.matches(&data)).unwrap_or(Ordering::Equal);

        if cmp >= Ordering::Equal {
            self.search(out, lock, txn, tid, node.left, table, idx_matcher, default_matcher)?;
        }
        if cmp == Ordering::Equal {
            let hit = default_matcher
                .map(|m| m.matches(&data) == Ordering::Equal)
                .unwrap_or(true);
            if hit {
                if lock {
                    let entry = table.entry(node.target)?;
                    if tuple_write_status(txn, tid, &entry) == TupleStatus::Locked {
                        return Err(DatastoreError::Timeout(table.region().name().into()));
                    }
                    let _guard = table.region().lock(LockMode::Write)?;
                    table.set_lock(node.target, tid)?;
                }
                out.push(node.target);
            }
        }
        if cmp <= Ordering::Equal {
            self.search(out, lock, txn, tid, node.right, table, idx_matcher, default_matcher)?;
        }
        Ok(())
    }

    /// Inserts the base row `key_row` under `tid`, returning the new root
    /// of this (sub)tree. Equal keys are rejected.
    ///
    /// The caller holds the transaction region's Read lock.
    pub fn insert(
        &self,
        txn: &TransactionTable<'_>,
        tid: Tid,
        node_row: RowId,
        table: &Entity<'_>,
        key_row: RowId,
        indexer: &dyn Indexer,
    ) -> Result<RowId> {
        if !key_row.is_valid() {
            return Err(out_of_range(table, key_row));
        }
        if !node_row.is_valid() {
            let _guard = self.region().lock(LockMode::Write)?;
            let new_row = self.entity.create_tuple(tid)?;
            self.write_node(
                new_row,
                &TreapNode {
                    left: RowId::INVALID,
                    right: RowId::INVALID,
                    target: key_row,
                    priority: rand::random::<i32>() as i64,
                },
            )?;
            return Ok(new_row);
        }

        let data = self.target_tuple(txn, tid, node_row, table)?;
        let key = table.tuple(key_row)?;
        let cmp = indexer.compare(&data, &key);
        if cmp == Ordering::Equal {
            return Err(IndexError::DuplicateKey(self.region().name().into()).into());
        }

        let new_row = self.update_node(txn, tid, node_row)?;
        let mut node = self.node(txn, tid, new_row)?;
        if cmp == Ordering::Greater {
            let left = self.insert(txn, tid, node.left, table, key_row, indexer)?;
            let left_node = self.node(txn, tid, left)?;
            node.left = left;
            self.write_node(new_row, &node)?;
            if node.priority > left_node.priority {
                return self.rotate_right(txn, tid, new_row);
            }
        } else {
            let right = self.insert(txn, tid, node.right, table, key_row, indexer)?;
            let right_node = self.node(txn, tid, right)?;
            node.right = right;
            self.write_node(new_row, &node)?;
            if node.priority > right_node.priority {
                return self.rotate_left(txn, tid, new_row);
            }
        }
        Ok(new_row)
    }

    /// Removes the node whose key equals base row `key_row`, returning the
    /// new root of this (sub)tree. The target is rotated down to a leaf
    /// (always toward the lower-priority child) and then freed.
    ///
    /// The caller holds the transaction region's Read lock.
    pub fn delete(
        &self,
        txn: &TransactionTable<'_>,
        tid: Tid,
        node_row: RowId,
        table: &Entity<'_>,
        key_row: RowId,
        indexer: &dyn Indexer,
    ) -> Result<RowId> {
        if !key_row.is_valid() {
            return Err(out_of_range(table, key_row));
        }
        if !node_row.is_valid() {
            return Ok(node_row);
        }

        let node = self.node(txn, tid, node_row)?;
        let data = self.target_tuple(txn, tid, node_row, table)?;
        let key = table.tuple(key_row)?;
        let cmp = indexer.compare(&data, &key);

        if cmp == Ordering::Equal {
            if !node.left.is_valid() && !node.right.is_valid() {
                self.entity.delete_tuple(txn, tid, node_row)?;
                return Ok(RowId::INVALID);
            }
            let new_row = if !node.left.is_valid() {
                self.rotate_left(txn, tid, node_row)?
            } else if !node.right.is_valid() {
                self.rotate_right(txn, tid, node_row)?
            } else {
                let left = self.node(txn, tid, node.left)?;
                let right = self.node(txn, tid, node.right)?;
                if left.priority < right.priority {
                    self.rotate_right(txn, tid, node_row)?
                } else {
                    self.rotate_left(txn, tid, node_row)?
                }
            };
            self.delete(txn, tid, new_row, table, key_row, indexer)
        } else {
            let new_row = self.update_node(txn, tid, node_row)?;
            let mut node = self.node(txn, tid, new_row)?;
            if cmp == Ordering::Greater {
                node.left = self.delete(txn, tid, node.left, table, key_row, indexer)?;
            } else {
                node.right = self.delete(txn, tid, node.right, table, key_row, indexer)?;
            }
            self.write_node(new_row, &node)?;
            Ok(new_row)
        }
    }

    /// Read-only descent: does any node's key equal the payload `key`?
    /// Used to reject duplicates before a statement mutates anything.
    pub fn contains(
        &self,
        txn: &TransactionTable<'_>,
        tid: Tid,
        root: RowId,
        table: &Entity<'_>,
        key: &[u8],
        indexer: &dyn Indexer,
    ) -> Result<bool> {
        let mut current = root;
        while current.is_valid() {
            let node = self.node(txn, tid, current)?;
            let data = table.tuple(node.target)?;
            match indexer.compare(&data, key) {
                Ordering::Equal => return Ok(true),
                Ordering::Greater => current = node.left,
                Ordering::Less => current = node.right,
            }
        }
        Ok(false)
    }

    fn target_tuple(&self, txn: &TransactionTable<'_>, tid: Tid, node_row: RowId, table: &Entity<'_>) -> Result<Vec<u8>> {
        let node = self.node(txn, tid, node_row)?;
        table.tuple(node.target)
    }

    /// Copy-on-write right rotation: lifts the left child above `node_row`.
    fn rotate_right(&self, txn: &TransactionTable<'_>, tid: Tid, node_row: RowId) -> Result<RowId> {
        let new_right = self.update_node(txn, tid, node_row)?;
        let mut right_node = self.node(txn, tid, new_right)?;
        let new_left = self.update_node(txn, tid, right_node.left)?;
        let mut left_node = self.node(txn, tid, new_left)?;

        right_node.left = left_node.right;
        left_node.right = new_right;
        self.write_node(new_right, &right_node)?;
        self.write_node(new_left, &left_node)?;
        Ok(new_left)
    }

    /// Copy-on-write left rotation: lifts the right child above `node_row`.
    fn rotate_left(&self, txn: &TransactionTable<'_>, tid: Tid, node_row: RowId) -> Result<RowId> {
        let new_left = self.update_node(txn, tid, node_row)?;
        let mut left_node = self.node(txn, tid, new_left)?;
        let new_right = self.update_node(txn, tid, left_node.right)?;
        let mut right_node = self.node(txn, tid, new_right)?;

        left_node.right = right_node.left;
        right_node.left = new_left;
        self.write_node(new_left, &left_node)?;
        self.write_node(new_right, &right_node)?;
        Ok(new_right)
    }
}

impl TreapNode {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }
}

fn out_of_range(table: &Entity<'_>, row: RowId) -> DatastoreError {
    TableError::OutOfRange {
        table: table.region().name().into(),
        row,
        used_end: table.used_end(),
        max_line: table.region().max_line(),
    }
    .into()
}
