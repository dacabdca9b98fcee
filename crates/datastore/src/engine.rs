//! Statement bodies: index-aware search, insert and delete over one entity,
//! plus catalog root loading, storing and locking.
//!
//! Every mutation here runs inside the connection's retry loop, after the
//! catalog root for the target entity has been locked. `Timeout` returned
//! from any of these operations means "release what you hold locally and
//! take another lap", not failure.

use std::cmp::Ordering;

use itertools::Itertools as _;
use log::trace;
use shmdb_primitives::{RowId, Tid};

use crate::catalog::{CatalogMatcher, CatalogRow, CATALOG_INDEX_NAME, CATALOG_NAME};
use crate::entity::{tuple_readable, tuple_write_status, Entity, TupleStatus};
use crate::error::{CatalogError, DatastoreError, Result, TableError, TxnError};
use crate::init::Database;
use crate::region::LockMode;
use crate::registry::{IndexMatcher, Matcher, Sorter};
use crate::treap_index::TreapIndex;

pub(crate) struct Engine<'db> {
    db: &'db Database,
}

impl<'db> Engine<'db> {
    pub fn new(db: &'db Database) -> Self {
        Engine { db }
    }

    /// Finds the rows of `table` matching the given matchers, via the index
    /// the matcher names or by a full scan. With `lock` set, every match is
    /// stamped with an update intent; a match already locked elsewhere
    /// yields `Timeout`. Results are optionally ordered by `sorter`.
    pub fn search_tuples(
        &self,
        tid: Tid,
        table: &str,
        lock: bool,
        idx_matcher: Option<&dyn IndexMatcher>,
        default_matcher: Option<&dyn Matcher>,
        sorter: Option<&dyn Sorter>,
    ) -> Result<Vec<RowId>> {
        if !tid.is_valid() {
            return Err(TxnError::NotStarted.into());
        }
        let region = self.db.region(table)?;
        let entity = Entity::new(region);
        let txn = self.db.txn_table();
        let mut rows = Vec::new();

        if let Some(idx_matcher) = idx_matcher {
            let binding = self.load_index_root(tid, table, idx_matcher.index_id())?;
            let index_region = self.db.region(binding.index_name.as_str())?;
            let treap = TreapIndex::new(index_region);
            let _guard = txn.region().lock(LockMode::Read)?;
            treap.search(
                &mut rows,
                lock,
                &txn,
                tid,
                binding.root,
                &entity,
                Some(idx_matcher as &dyn Matcher),
                default_matcher,
            )?;
        } else {
            let _guard = txn.region().lock(LockMode::Read)?;
            for line in 0..entity.used_end().0 {
                let row = RowId(line);
                let entry = entity.entry(row)?;
                if !tuple_readable(&txn, tid, &entry) {
                    continue;
                }
                let data = entity.tuple(row)?;
                if let Some(matcher) = default_matcher {
                    if matcher.matches(&data) != Ordering::Equal {
                        continue;
                    }
                }
                if lock {
                    if tuple_write_status(&txn, tid, &entry) == TupleStatus::Locked {
                        return Err(DatastoreError::Timeout(table.into()));
                    }
                    let _entity_guard = region.lock(LockMode::Write)?;
                    entity.set_lock(row, tid)?;
                }
                rows.push(row);
            }
        }

        if let Some(sorter) = sorter {
            if !rows.is_empty() {
                trace!("sorting {} rows of {table}", rows.len());
                let keyed: Vec<(RowId, Vec<u8>)> = rows
                    .iter()
                    .map(|&row| entity.tuple(row).map(|payload| (row, payload)))
                    .collect::<Result<_>>()?;
                rows = keyed
                    .into_iter()
                    .sorted_by(|a, b| sorter.compare(&a.1, &b.1))
                    .map(|(row, _)| row)
                    .collect();
            }
        }
        Ok(rows)
    }

    /// Inserts one row into `table` and every index bound to it. Duplicate
    /// keys are detected with a read-only probe of each index before the
    /// statement mutates anything, so a rejected insert leaves no
    /// half-indexed row behind.
    pub fn insert_tuple(&self, tid: Tid, table: &str, payload: &[u8]) -> Result<RowId> {
        if !tid.is_valid() {
            return Err(TxnError::NotStarted.into());
        }
        let region = self.db.region(table)?;
        let entity = Entity::new(region);
        if payload.len() != region.unit_size() as usize {
            return Err(TableError::SizeMismatch {
                table: table.into(),
                got: payload.len(),
                expect: region.unit_size() as usize,
            }
            .into());
        }
        let txn = self.db.txn_table();

        if let Some(bindings) = self.db.index_bindings(table) {
            for index_id in bindings.keys() {
                let binding = self.load_index_root(tid, table, index_id)?;
                if !binding.root.is_valid() {
                    continue;
                }
                let treap = TreapIndex::new(self.db.region(binding.index_name.as_str())?);
                let indexer = self.db.registry().indexer(binding.indexer_name.as_str())?.clone();
                let _guard = txn.region().lock(LockMode::Read)?;
                if treap.contains(&txn, tid, binding.root, &entity, payload, indexer.as_ref())? {
                    return Err(crate::error::IndexError::DuplicateKey(binding.index_name.as_str().into()).into());
                }
            }
        }

        let row = {
            let _guard = region.lock(LockMode::Write)?;
            entity.create_tuple(tid)?
        };
        entity.set_tuple(row, payload)?;

        if let Some(bindings) = self.db.index_bindings(table) {
            for index_id in bindings.keys() {
                let binding = self.load_index_root(tid, table, index_id)?;
                let treap = TreapIndex::new(self.db.region(binding.index_name.as_str())?);
                let indexer = self.db.registry().indexer(binding.indexer_name.as_str())?.clone();
                let root = {
                    let _guard = txn.region().lock(LockMode::Read)?;
                    treap.insert(&txn, tid, binding.root, &entity, row, indexer.as_ref())?
                };
                self.store_index_root(tid, table, &binding, root)?;
            }
        }
        trace!("insert tid {tid} {table} row {row}");
        Ok(row)
    }

    /// Deletes every row of `table` matching the given matchers, removing
    /// them from each bound index first. Matches are locked up front, so a
    /// conflicting writer turns the whole statement into `Timeout`.
    pub fn delete_tuples(
        &self,
        tid: Tid,
        table: &str,
        idx_matcher: Option<&dyn IndexMatcher>,
        default_matcher: Option<&dyn Matcher>,
    ) -> Result<usize> {
        let region = self.db.region(table)?;
        let entity = Entity::new(region);
        let txn = self.db.txn_table();

        let rows = self.search_tuples(tid, table, true, idx_matcher, default_matcher, None)?;

        if let Some(bindings) = self.db.index_bindings(table) {
            for index_id in bindings.keys() {
                let binding = self.load_index_root(tid, table, index_id)?;
                let treap = TreapIndex::new(self.db.region(binding.index_name.as_str())?);
                let indexer = self.db.registry().indexer(binding.indexer_name.as_str())?.clone();
                let mut root = binding.root;
                {
                    let _guard = txn.region().lock(LockMode::Read)?;
                    for &row in &rows {
                        root = treap.delete(&txn, tid, root, &entity, row, indexer.as_ref())?;
                    }
                }
                self.store_index_root(tid, table, &binding, root)?;
            }
        }

        for &row in &rows {
            entity.delete_tuple(&txn, tid, row)?;
        }
        trace!("delete tid {tid} {table}: {} rows", rows.len());
        Ok(rows.len())
    }

    /// Resolves the catalog binding of (`table`, `index_id`) under `tid`.
    ///
    /// The catalog itself is special-cased: its binding is fixed and its
    /// root is the transaction's private catalog root. For everything else
    /// the catalog treap must hold exactly one visible row; none means an
    /// empty index (the pre-registered binding with an invalid root).
    pub fn load_index_root(&self, tid: Tid, table: &str, index_id: &str) -> Result<CatalogRow> {
        if table == CATALOG_NAME {
            let txn = self.db.txn_table();
            let _guard = txn.region().lock(LockMode::Read)?;
            let record = txn.record(tid)?;
            return CatalogRow::new(
                CATALOG_NAME,
                CATALOG_INDEX_NAME,
                CATALOG_INDEX_NAME,
                CATALOG_INDEX_NAME,
                record.index_root,
            )
            .ok_or_else(|| {
                CatalogError::UnknownIndex {
                    entity: table.into(),
                    index_id: index_id.into(),
                }
                .into()
            });
        }

        let binding = self
            .db
            .index_bindings(table)
            .and_then(|bindings| bindings.get(index_id))
            .ok_or_else(|| CatalogError::UnknownIndex {
                entity: table.into(),
                index_id: index_id.into(),
            })?;
        let matcher = CatalogMatcher::new(table, index_id).ok_or(CatalogError::UnknownIndex {
            entity: table.into(),
            index_id: index_id.into(),
        })?;
        let rows = self.search_tuples(tid, CATALOG_NAME, false, Some(&matcher), None, None)?;
        match rows.len() {
            1 => {
                let catalog = Entity::new(self.db.region(CATALOG_NAME)?);
                Ok(CatalogRow::from_bytes(&catalog.tuple(rows[0])?))
            }
            0 => CatalogRow::new(
                table,
                index_id,
                &binding.index_name,
                &binding.indexer_name,
                RowId::INVALID,
            )
            .ok_or_else(|| {
                CatalogError::UnknownIndex {
                    entity: table.into(),
                    index_id: index_id.into(),
                }
                .into()
            }),
            matches => Err(CatalogError::Corrupt {
                entity: table.into(),
                index_id: index_id.into(),
                matches,
            }
            .into()),
        }
    }

    /// Publishes `root` as the new root of the binding, within this
    /// transaction's view: the catalog's own root goes to the transaction
    /// record, every other binding is rewritten as a catalog row
    /// (delete + insert).
    pub fn store_index_root(&self, tid: Tid, table: &str, binding: &CatalogRow, root: RowId) -> Result<()> {
        if table == CATALOG_NAME {
            let txn = self.db.txn_table();
            let _guard = txn.region().lock(LockMode::Write)?;
            let mut record = txn.record(tid)?;
            trace!("store catalog root tid {tid}: {} -> {root}", record.index_root);
            record.index_root = root;
            return txn.set_record(tid, &record);
        }

        let matcher = CatalogMatcher::new(table, binding.index_id.as_str()).ok_or(CatalogError::UnknownIndex {
            entity: table.into(),
            index_id: binding.index_id.as_str().into(),
        })?;
        self.delete_tuples(tid, CATALOG_NAME, Some(&matcher), None)?;
        let row = CatalogRow { root, ..*binding };
        self.insert_tuple(tid, CATALOG_NAME, row.as_bytes())?;
        trace!("store index root tid {tid} {table}/{}: {root}", binding.index_id);
        Ok(())
    }

    /// Tries to take the update intent on the published catalog root for a
    /// statement against `table`. Returns `false` when another transaction
    /// holds it; `true` when it was taken or there is nothing to lock (no
    /// indexes on the entity, or no published root yet).
    ///
    /// This is the single writer gate on the catalog tree: the root lock
    /// serializes structural index changes while the versioned nodes stay
    /// readable to everyone.
    pub fn lock_catalog_root(&self, table: &str, tid: Tid) -> Result<bool> {
        if self.db.index_bindings(table).is_none() {
            return Ok(true);
        }
        let txn = self.db.txn_table();
        // Write up front: this section may stamp the lock intent, and a
        // Read lock cannot be escalated.
        let _guard = txn.region().lock(LockMode::Write)?;
        let master = txn.index_root_master();
        if !master.is_valid() {
            return Ok(true);
        }
        let catalog_index = Entity::new(self.db.catalog_index_region().ok_or_else(|| {
            DatastoreError::Table(TableError::NotFound(CATALOG_INDEX_NAME.into()))
        })?);
        let entry = catalog_index.entry(master)?;
        if tuple_write_status(&txn, tid, &entry) != TupleStatus::Locked {
            catalog_index.set_lock(master, tid)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
