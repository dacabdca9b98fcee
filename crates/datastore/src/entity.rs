//! The base table stored in a region: an entry array carrying MVCC version
//! bounds followed by the fixed-size row payloads.
//!
//! Slot lifecycle invariants:
//! - a free slot has `xmin == Tid::MAX`, and a slot with `xmin == Tid::MAX`
//!   is free;
//! - `xmin` is set once at creation; `xmax` only ever moves from `Tid::MAX`
//!   to the deleting transaction; `lock` is a transient update intent;
//! - `used_end` is the high-water mark (slots at or beyond it have never
//!   held data since the last shrink); `free_begin` is a hint only, and
//!   allocation falls back to scanning the full slot array.

use bytemuck::{Pod, Zeroable};
use shmdb_primitives::{RowId, Tid};

use crate::error::{DatastoreError, Result, TableError};
use crate::region::{LockMode, Region};
use crate::txn::{TransactionTable, WriteIntent};

/// Per-slot version bounds. `xmin`/`xmax` delimit the creating and deleting
/// transactions; `lock` holds a non-durable update intent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct Entry {
    pub xmin: Tid,
    pub xmax: Tid,
    pub lock: Tid,
}

impl Entry {
    pub const FREE: Entry = Entry {
        xmin: Tid::MAX,
        xmax: Tid::MAX,
        lock: Tid::MAX,
    };
}

/// Writability of one slot for a given transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TupleStatus {
    /// The slot was created by this transaction; overwrite in place.
    Writable,
    /// Live row owned by nobody else; supersede by copy.
    Insertable,
    /// Another transaction holds a valid `xmax` or `lock` intent.
    Locked,
}

/// Is the slot behind `entry` readable by `tid`? The entry's bounds are
/// filtered through transaction visibility first: an `xmin`/`xmax` written
/// by an invisible transaction counts as unset.
pub(crate) fn tuple_readable(txn: &TransactionTable<'_>, tid: Tid, entry: &Entry) -> bool {
    let xmin = if txn.is_visible_to_read(tid, entry.xmin) {
        entry.xmin
    } else {
        Tid::MAX
    };
    let xmax = if txn.is_visible_to_read(tid, entry.xmax) {
        entry.xmax
    } else {
        Tid::MAX
    };
    xmin <= tid && tid < xmax
}

/// May `tid` write the slot behind `entry`, and how?
pub(crate) fn tuple_write_status(txn: &TransactionTable<'_>, tid: Tid, entry: &Entry) -> TupleStatus {
    if !tid.is_valid() {
        return TupleStatus::Locked;
    }
    let xmax = if txn.is_valid_write_intent(tid, entry.xmax, WriteIntent::Xmax) {
        entry.xmax
    } else {
        Tid::MAX
    };
    let lock = if txn.is_valid_write_intent(tid, entry.lock, WriteIntent::Lock) {
        entry.lock
    } else {
        Tid::MAX
    };
    if xmax == Tid::MAX && lock == Tid::MAX {
        if entry.xmin == tid {
            TupleStatus::Writable
        } else {
            TupleStatus::Insertable
        }
    } else {
        TupleStatus::Locked
    }
}

/// A typed view over a region holding one table.
#[derive(Copy, Clone)]
pub(crate) struct Entity<'a> {
    region: &'a Region,
}

impl<'a> Entity<'a> {
    pub fn new(region: &'a Region) -> Self {
        Entity { region }
    }

    pub fn region(&self) -> &'a Region {
        self.region
    }

    pub fn used_end(&self) -> RowId {
        RowId(self.region.header().used_end)
    }

    pub fn free_begin(&self) -> RowId {
        RowId(self.region.header().free_begin)
    }

    fn check_row_id(&self, row: RowId) -> Result<()> {
        let used_end = self.used_end();
        if !row.is_valid() || row.0 > used_end.0 || row.0 >= self.region.max_line() as i64 {
            return Err(TableError::OutOfRange {
                table: self.region.name().into(),
                row,
                used_end,
                max_line: self.region.max_line(),
            }
            .into());
        }
        Ok(())
    }

    pub fn entry(&self, row: RowId) -> Result<Entry> {
        self.check_row_id(row)?;
        Ok(self.region.read_pod(self.region.entry_offset(row.idx())))
    }

    /// Entry access bounded by `max_line` only; used by reclamation paths
    /// that run after `used_end` has already shrunk.
    pub fn entry_raw(&self, row: RowId) -> Result<Entry> {
        self.check_line(row)?;
        Ok(self.region.read_pod(self.region.entry_offset(row.idx())))
    }

    fn check_line(&self, row: RowId) -> Result<()> {
        if !row.is_valid() || row.0 >= self.region.max_line() as i64 {
            return Err(TableError::OutOfRange {
                table: self.region.name().into(),
                row,
                used_end: self.used_end(),
                max_line: self.region.max_line(),
            }
            .into());
        }
        Ok(())
    }

    fn set_entry(&self, row: RowId, entry: &Entry) {
        self.region.write_pod(self.region.entry_offset(row.idx()), entry);
    }

    pub fn set_xmax(&self, row: RowId, tid: Tid) -> Result<()> {
        let mut entry = self.entry_raw(row)?;
        entry.xmax = tid;
        self.set_entry(row, &entry);
        Ok(())
    }

    pub fn set_lock(&self, row: RowId, tid: Tid) -> Result<()> {
        let mut entry = self.entry_raw(row)?;
        entry.lock = tid;
        self.set_entry(row, &entry);
        Ok(())
    }

    pub fn tuple(&self, row: RowId) -> Result<Vec<u8>> {
        self.check_row_id(row)?;
        Ok(self
            .region
            .read_bytes(self.region.payload_offset(row.idx()), self.region.unit_size() as usize))
    }

    pub fn set_tuple(&self, row: RowId, payload: &[u8]) -> Result<()> {
        self.check_row_id(row)?;
        if payload.len() != self.region.unit_size() as usize {
            return Err(TableError::SizeMismatch {
                table: self.region.name().into(),
                got: payload.len(),
                expect: self.region.unit_size() as usize,
            }
            .into());
        }
        self.region.write_bytes(self.region.payload_offset(row.idx()), payload);
        Ok(())
    }

    /// Claims the first free slot for `tid`. The caller must hold this
    /// region's Write lock.
    pub fn create_tuple(&self, tid: Tid) -> Result<RowId> {
        if !tid.is_valid() {
            return Err(crate::error::TxnError::NotStarted.into());
        }
        let max_line = self.region.max_line() as i64;
        let mut claimed = None;
        for line in self.free_begin().0.max(0)..max_line {
            let row = RowId(line);
            if self.entry_raw(row)?.xmin == Tid::MAX {
                self.region.update_header(|h| h.used_end = h.used_end.max(line + 1));
                self.set_entry(
                    row,
                    &Entry {
                        xmin: tid,
                        xmax: Tid::MAX,
                        lock: Tid::MAX,
                    },
                );
                claimed = Some(row);
                break;
            }
        }
        let Some(row) = claimed else {
            return Err(TableError::MemoryFull(self.region.name().into()).into());
        };
        // Move the free hint past the slot just taken.
        let mut next_free = row.0 + 1;
        while next_free < max_line && self.entry_raw(RowId(next_free))?.xmin != Tid::MAX {
            next_free += 1;
        }
        self.region.update_header(|h| h.free_begin = next_free);
        Ok(row)
    }

    /// Prepares `row` for overwrite by `tid`, copy-on-write style: a row the
    /// transaction created is overwritten in place, a foreign live row is
    /// copied to a fresh slot and superseded, a locked row yields `Timeout`
    /// for the caller's retry loop.
    pub fn update_tuple(&self, txn: &TransactionTable<'_>, tid: Tid, row: RowId) -> Result<RowId> {
        let _txn_guard = txn.region().lock(LockMode::Read)?;
        let _guard = self.region.lock(LockMode::Write)?;
        let entry = self.entry(row)?;
        match tuple_write_status(txn, tid, &entry) {
            TupleStatus::Writable => Ok(row),
            TupleStatus::Insertable => {
                let new_row = self.create_tuple(tid)?;
                let payload = self.tuple(row)?;
                self.set_tuple(new_row, &payload)?;
                self.set_xmax(row, tid)?;
                Ok(new_row)
            }
            TupleStatus::Locked => Err(DatastoreError::Timeout(self.region.name().into())),
        }
    }

    /// Deletes `row` under `tid`: rows the transaction created are freed
    /// physically, foreign rows are deleted logically by stamping `xmax`.
    pub fn delete_tuple(&self, txn: &TransactionTable<'_>, tid: Tid, row: RowId) -> Result<()> {
        let _txn_guard = txn.region().lock(LockMode::Read)?;
        let _guard = self.region.lock(LockMode::Write)?;
        let entry = self.entry(row)?;
        match tuple_write_status(txn, tid, &entry) {
            TupleStatus::Writable => self.free_tuple(row),
            TupleStatus::Insertable => self.set_xmax(row, tid),
            TupleStatus::Locked => Err(DatastoreError::Timeout(self.region.name().into())),
        }
    }

    /// Returns `row` to the free pool and re-shrinks the high-water mark.
    /// The caller must hold this region's Write lock.
    pub fn free_tuple(&self, row: RowId) -> Result<()> {
        self.check_line(row)?;
        let mut entry = self.entry_raw(row)?;
        entry.xmin = Tid::MAX;
        self.set_entry(row, &entry);
        self.region.update_header(|h| h.free_begin = h.free_begin.min(row.0));
        loop {
            let used_end = self.used_end().0;
            if used_end == 0 || self.entry_raw(RowId(used_end - 1))?.xmin != Tid::MAX {
                break;
            }
            self.region.update_header(|h| h.used_end = used_end - 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use crate::txn::tests::txn_fixture;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn entity_fixture(dir: &TempDir, max_line: u64) -> Region {
        Region::create(dir.path(), "ENTITY_TEST", max_line, 8, 100).unwrap()
    }

    fn payload(v: u64) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    #[test]
    fn create_tracks_used_end_and_free_begin() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let txn_region = txn_fixture(&dir, 16);
        let txn = TransactionTable::new(&txn_region);
        let region = entity_fixture(&dir, 4);
        let ent = Entity::new(&region);
        let tid = txn.begin()?;

        let _guard = region.lock(LockMode::Write)?;
        let r0 = ent.create_tuple(tid)?;
        let r1 = ent.create_tuple(tid)?;
        assert_eq!((r0, r1), (RowId(0), RowId(1)));
        assert_eq!(ent.used_end(), RowId(2));
        assert_eq!(ent.free_begin(), RowId(2));

        ent.free_tuple(r0)?;
        assert_eq!(ent.free_begin(), RowId(0));
        assert_eq!(ent.used_end(), RowId(2));

        // The hint points at the freed low slot; allocation reuses it.
        let r2 = ent.create_tuple(tid)?;
        assert_eq!(r2, RowId(0));
        Ok(())
    }

    #[test]
    fn create_fails_when_full() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let txn_region = txn_fixture(&dir, 16);
        let txn = TransactionTable::new(&txn_region);
        let region = entity_fixture(&dir, 2);
        let ent = Entity::new(&region);
        let tid = txn.begin()?;

        let _guard = region.lock(LockMode::Write)?;
        ent.create_tuple(tid)?;
        ent.create_tuple(tid)?;
        assert!(matches!(
            ent.create_tuple(tid),
            Err(DatastoreError::Table(TableError::MemoryFull(_)))
        ));
        Ok(())
    }

    #[test]
    fn own_rows_are_writable_foreign_committed_rows_insertable() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let txn_region = txn_fixture(&dir, 16);
        let txn = TransactionTable::new(&txn_region);
        let region = entity_fixture(&dir, 4);
        let ent = Entity::new(&region);

        let t1 = txn.begin()?;
        let row = {
            let _guard = region.lock(LockMode::Write)?;
            ent.create_tuple(t1)?
        };
        ent.set_tuple(row, &payload(7))?;
        assert_eq!(tuple_write_status(&txn, t1, &ent.entry(row)?), TupleStatus::Writable);
        assert!(tuple_readable(&txn, t1, &ent.entry(row)?));
        txn.commit(t1, None)?;

        let t2 = txn.begin()?;
        assert_eq!(tuple_write_status(&txn, t2, &ent.entry(row)?), TupleStatus::Insertable);
        let new_row = ent.update_tuple(&txn, t2, row)?;
        assert_ne!(new_row, row);
        assert_eq!(ent.tuple(new_row)?, payload(7));
        // The superseded version carries t2 as its delete bound.
        assert_eq!(ent.entry(row)?.xmax, t2);
        Ok(())
    }

    #[test]
    fn locked_rows_time_out() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let txn_region = txn_fixture(&dir, 16);
        let txn = TransactionTable::new(&txn_region);
        let region = entity_fixture(&dir, 4);
        let ent = Entity::new(&region);

        let t1 = txn.begin()?;
        let row = {
            let _guard = region.lock(LockMode::Write)?;
            ent.create_tuple(t1)?
        };
        ent.set_tuple(row, &payload(1))?;
        txn.commit(t1, None)?;

        let t2 = txn.begin()?;
        let t3 = txn.begin()?;
        ent.set_lock(row, t2)?;
        assert!(ent.update_tuple(&txn, t3, row).is_err_and(|e| e.is_timeout()));
        assert!(ent.delete_tuple(&txn, t3, row).is_err_and(|e| e.is_timeout()));
        // The lock holder itself is not blocked by its own intent.
        assert_eq!(tuple_write_status(&txn, t2, &ent.entry(row)?), TupleStatus::Insertable);
        Ok(())
    }

    #[test]
    fn delete_own_row_frees_slot() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let txn_region = txn_fixture(&dir, 16);
        let txn = TransactionTable::new(&txn_region);
        let region = entity_fixture(&dir, 4);
        let ent = Entity::new(&region);

        let t1 = txn.begin()?;
        let row = {
            let _guard = region.lock(LockMode::Write)?;
            ent.create_tuple(t1)?
        };
        ent.delete_tuple(&txn, t1, row)?;
        assert_eq!(ent.entry_raw(row)?.xmin, Tid::MAX);
        assert_eq!(ent.used_end(), RowId(0));
        Ok(())
    }

    #[test]
    fn row_bounds_are_enforced() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let region = entity_fixture(&dir, 4);
        let ent = Entity::new(&region);
        assert!(matches!(
            ent.entry(RowId(1)),
            Err(DatastoreError::Table(TableError::OutOfRange { .. }))
        ));
        assert!(ent.entry(RowId::INVALID).is_err());
        assert!(ent.entry_raw(RowId(99)).is_err());
        Ok(())
    }
}
