//! The transaction table: a ring of transaction records in the well-known
//! `$` region, plus the visibility predicates the whole store is built on.
//!
//! Record ring invariants:
//! - `tid_collecting <= tid_next` and `tid_next - tid_collecting <= max_line`;
//! - the record for TID t lives at slot `t % max_line` and is only
//!   meaningful while t is inside `[tid_collecting, tid_next)`;
//! - a record below `tid_collecting` is treated as committed in the distant
//!   past, a record at or above `tid_next` does not exist yet.

use bytemuck::{Pod, Zeroable};
use log::trace;
use shmdb_primitives::{RowId, Tcc, Tid};

use crate::entity::{tuple_readable, Entity};
use crate::error::{Result, TxnError};
use crate::gc::proc_start_time;
use crate::region::{LockMode, Region};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum TxStatus {
    InProgress = 0,
    Committed = 1,
    Aborted = 2,
}

/// One slot of the transaction ring.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct TxRecord {
    /// Value of `tid_next` at the moment the transaction ended.
    pub tid_end: Tid,
    /// Commit counter snapshot taken at begin (or at statement start under
    /// Read-Committed).
    pub tcc_begin: Tcc,
    /// Commit counter stamped at commit.
    pub tcc_end: Tcc,
    pub status: u64,
    pub pid: i64,
    pub pid_start_time: i64,
    /// This transaction's private view of the catalog root.
    pub index_root: RowId,
}

impl TxRecord {
    pub fn status(&self) -> TxStatus {
        match self.status {
            0 => TxStatus::InProgress,
            1 => TxStatus::Committed,
            // Anything else is torn garbage from a crashed writer; treating
            // it as aborted keeps its rows reclaimable.
            _ => TxStatus::Aborted,
        }
    }
}

/// Which row field a write-intent check is about. A committed `xmax` stays
/// valid (the delete happened); a committed `lock` is void (intents do not
/// survive their transaction).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WriteIntent {
    Xmax,
    Lock,
}

/// Typed view over the `$` region.
#[derive(Copy, Clone)]
pub(crate) struct TransactionTable<'a> {
    region: &'a Region,
}

impl<'a> TransactionTable<'a> {
    pub fn new(region: &'a Region) -> Self {
        TransactionTable { region }
    }

    pub fn region(&self) -> &'a Region {
        self.region
    }

    pub fn tid_next(&self) -> Tid {
        Tid(self.region.header().tid_next)
    }

    pub fn tid_collecting(&self) -> Tid {
        Tid(self.region.header().tid_collecting)
    }

    pub fn tcc_next(&self) -> Tcc {
        Tcc(self.region.header().tcc_next)
    }

    pub fn index_root_master(&self) -> RowId {
        RowId(self.region.header().index_root_master)
    }

    pub(crate) fn set_tid_collecting(&self, tid: Tid) {
        self.region.update_header(|h| h.tid_collecting = tid.0);
    }

    fn record_offset(&self, tid: Tid) -> usize {
        let slot = (tid.0 % self.region.max_line()) as usize;
        self.region.payload_offset(slot)
    }

    pub fn record(&self, tid: Tid) -> Result<TxRecord> {
        self.check_live(tid)?;
        Ok(self.region.read_pod(self.record_offset(tid)))
    }

    pub fn set_record(&self, tid: Tid, record: &TxRecord) -> Result<()> {
        self.check_live(tid)?;
        self.region.write_pod(self.record_offset(tid), record);
        Ok(())
    }

    fn check_live(&self, tid: Tid) -> Result<()> {
        let collecting = self.tid_collecting();
        let next = self.tid_next();
        if tid < collecting || tid >= next {
            return Err(TxnError::OutOfRange {
                tid,
                collecting,
                next,
            }
            .into());
        }
        Ok(())
    }

    /// Starts a transaction: assigns the next TID and initializes its
    /// record with this process identity and the current snapshot.
    pub fn begin(&self) -> Result<Tid> {
        let _guard = self.region.lock(LockMode::Write)?;
        let next = self.tid_next();
        if next.0 - self.tid_collecting().0 >= self.region.max_line() {
            return Err(TxnError::TableFull.into());
        }
        self.region.update_header(|h| h.tid_next = next.0 + 1);
        let tid = next;
        let pid = std::process::id() as i64;
        let record = TxRecord {
            tid_end: Tid::MAX,
            tcc_begin: self.tcc_next(),
            tcc_end: Tcc::MAX,
            status: TxStatus::InProgress as u64,
            pid,
            pid_start_time: proc_start_time(pid),
            index_root: self.index_root_master(),
        };
        trace!(
            "begin tid {tid}: snapshot tcc {}, catalog root {}",
            record.tcc_begin,
            record.index_root
        );
        self.set_record(tid, &record)?;
        Ok(tid)
    }

    /// Commits `tid` and, if this transaction's catalog root is readable
    /// under its own snapshot, publishes it as the new master root.
    pub fn commit(&self, tid: Tid, catalog_index: Option<&Region>) -> Result<()> {
        let _guard = self.region.lock(LockMode::Write)?;
        let mut record = self.record(tid)?;
        record.tid_end = self.tid_next();
        record.status = TxStatus::Committed as u64;
        let tcc = self.tcc_next();
        record.tcc_end = tcc;
        self.region.update_header(|h| h.tcc_next = tcc.0 + 1);
        if self.is_catalog_root_visible(tid, record.index_root, catalog_index) {
            trace!(
                "commit tid {tid}: publishing catalog root {} (was {})",
                record.index_root,
                self.index_root_master()
            );
            self.region
                .update_header(|h| h.index_root_master = record.index_root.0);
        }
        self.set_record(tid, &record)
    }

    /// Aborts `tid`. Its rows stay in place until the collector reclaims
    /// them; visibility filtering hides them immediately.
    pub fn abort(&self, tid: Tid) -> Result<()> {
        let _guard = self.region.lock(LockMode::Write)?;
        let mut record = self.record(tid)?;
        record.tid_end = self.tid_next();
        record.status = TxStatus::Aborted as u64;
        self.set_record(tid, &record)
    }

    /// Re-snapshots `tid` for Read-Committed: the statement about to run
    /// sees everything committed so far, including the latest published
    /// catalog root if it is readable.
    pub fn adjust(&self, tid: Tid, catalog_index: Option<&Region>) -> Result<()> {
        let _guard = self.region.lock(LockMode::Write)?;
        let mut record = self.record(tid)?;
        record.tcc_begin = self.tcc_next();
        let master = self.index_root_master();
        if self.is_catalog_root_visible(tid, master, catalog_index) {
            trace!("adjust tid {tid}: catalog root {} -> {master}", record.index_root);
            record.index_root = master;
        }
        self.set_record(tid, &record)
    }

    /// Is the catalog-of-catalogs row at `root` readable by `tid`?
    pub fn is_catalog_root_visible(&self, tid: Tid, root: RowId, catalog_index: Option<&Region>) -> bool {
        let Some(region) = catalog_index else { return false };
        if !root.is_valid() {
            return false;
        }
        match Entity::new(region).entry_raw(root) {
            Ok(entry) => tuple_readable(self, tid, &entry),
            Err(_) => false,
        }
    }

    /// May `self_tid` read data stamped with `target`?
    ///
    /// Everything below the collection frontier counts as committed in the
    /// distant past; everything at or above `tid_next` (including the
    /// `Tid::MAX` sentinel) does not exist. In between, the target must
    /// have committed before this transaction's snapshot.
    pub fn is_visible_to_read(&self, self_tid: Tid, target: Tid) -> bool {
        if target == self_tid {
            return true;
        }
        if target < self.tid_collecting() {
            return true;
        }
        if target >= self.tid_next() {
            return false;
        }
        let Ok(record) = self.record(target) else {
            return false;
        };
        let tcc_begin = if self_tid < self.tid_next() {
            match self.record(self_tid) {
                Ok(own) => own.tcc_begin,
                Err(_) => Tcc::MAX,
            }
        } else {
            Tcc::MAX
        };
        record.status() == TxStatus::Committed && record.tcc_end < tcc_begin
    }

    /// Is the `xmax` or `lock` intent stamped with `target` still standing
    /// in the way of `self_tid`?
    pub fn is_valid_write_intent(&self, self_tid: Tid, target: Tid, intent: WriteIntent) -> bool {
        if !self_tid.is_valid() || !target.is_valid() {
            return false;
        }
        if target == self_tid {
            return false;
        }
        if target < self.tid_collecting() {
            return intent == WriteIntent::Xmax;
        }
        if target >= self.tid_next() {
            return false;
        }
        let Ok(record) = self.record(target) else {
            return false;
        };
        match record.status() {
            TxStatus::InProgress => true,
            TxStatus::Committed => intent == WriteIntent::Xmax,
            TxStatus::Aborted => false,
        }
    }
}
