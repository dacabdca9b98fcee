//! The garbage collector: one pass that advances the collection frontier
//! and frees row versions no live transaction can reach.
//!
//! The pass is safe to run from any attached process at any time, and
//! running it twice frees nothing the first run did not. Crash recovery
//! rides on step 1: records of transactions whose process has died are
//! flipped to aborted, which makes their uncommitted rows reclaimable.
//! No per-row undo is ever written.

use log::{info, warn};
use shmdb_primitives::{RowId, Tid};

use crate::catalog::TXN_REGION_NAME;
use crate::entity::Entity;
use crate::error::Result;
use crate::init::Database;
use crate::region::LockMode;
use crate::txn::TxStatus;

/// What one collection pass did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GcReport {
    /// Transactions flipped to aborted because their process is gone.
    pub aborted_dead: usize,
    /// Row slots physically freed.
    pub freed_rows: usize,
    /// Stale `xmax`/`lock` intents cleared.
    pub cleared_intents: usize,
    /// The frontier after the pass.
    pub tid_collecting: Tid,
}

pub(crate) fn run(db: &Database) -> Result<GcReport> {
    let txn = db.txn_table();
    let txn_region = db.txn_region();
    let mut report = GcReport {
        aborted_dead: 0,
        freed_rows: 0,
        cleared_intents: 0,
        tid_collecting: txn.tid_collecting(),
    };

    // Step 1: abort transactions owned by dead processes.
    {
        let _guard = txn_region.lock(LockMode::Write)?;
        for raw in txn.tid_collecting().0..txn.tid_next().0 {
            let tid = Tid(raw);
            let mut record = txn.record(tid)?;
            if record.status() == TxStatus::InProgress && !process_alive(record.pid, record.pid_start_time) {
                record.tid_end = txn.tid_next();
                record.status = TxStatus::Aborted as u64;
                txn.set_record(tid, &record)?;
                report.aborted_dead += 1;
                warn!("gc: aborted tid {tid} held by dead pid {}", record.pid);
            }
        }
    }

    // Steps 2 and 3: find the oldest in-progress transaction, then the
    // longest finished prefix that ended before it began.
    let (collecting, new_collecting) = {
        let _guard = txn_region.lock(LockMode::Read)?;
        let collecting = txn.tid_collecting();
        let next = txn.tid_next();
        // No in-progress transaction means no reader can reach anything.
        let mut in_progress_low = Tid::MAX;
        for raw in collecting.0..next.0 {
            if txn.record(Tid(raw))?.status() == TxStatus::InProgress {
                in_progress_low = Tid(raw);
                break;
            }
        }
        let mut new_collecting = collecting;
        for raw in collecting.0..next.0 {
            let record = txn.record(Tid(raw))?;
            if record.status() == TxStatus::InProgress || record.tid_end >= in_progress_low {
                break;
            }
            new_collecting = Tid(raw + 1);
        }
        (collecting, new_collecting)
    };

    // Step 4: sweep every entity. Rows created in the window by transactions
    // that never committed are freed; rows deleted in the window by
    // committed transactions are freed; everything else in the window has
    // its stale intents cleared.
    let in_window = |tid: Tid| collecting <= tid && tid < new_collecting;
    if new_collecting > collecting {
        for region in db.regions() {
            if region.name() == TXN_REGION_NAME {
                continue;
            }
            let _guard = region.lock(LockMode::Write)?;
            let entity = Entity::new(region);
            let used_end = entity.used_end().0;
            for line in 0..used_end {
                let row = RowId(line);
                let mut entry = entity.entry_raw(row)?;
                if entry.xmin == Tid::MAX {
                    continue;
                }
                if in_window(entry.xmin) && txn.record(entry.xmin)?.status() != TxStatus::Committed {
                    entity.free_tuple(row)?;
                    report.freed_rows += 1;
                    continue;
                }
                if in_window(entry.xmax) {
                    if txn.record(entry.xmax)?.status() == TxStatus::Committed {
                        entity.free_tuple(row)?;
                        report.freed_rows += 1;
                        continue;
                    }
                    entry.xmax = Tid::MAX;
                    entity.set_xmax(row, Tid::MAX)?;
                    report.cleared_intents += 1;
                }
                if in_window(entry.lock) {
                    entity.set_lock(row, Tid::MAX)?;
                    report.cleared_intents += 1;
                }
            }
        }
    }

    // Step 5: publish the frontier.
    {
        let _guard = txn_region.lock(LockMode::Write)?;
        txn.set_tid_collecting(new_collecting);
    }
    report.tid_collecting = new_collecting;
    info!(
        "gc: frontier {} -> {} ({} dead, {} rows freed, {} intents cleared)",
        collecting, new_collecting, report.aborted_dead, report.freed_rows, report.cleared_intents
    );
    Ok(report)
}

/// Is the process that started a transaction still the same live process?
/// A pid alone is not enough (pids recycle), so the `/proc/<pid>` inode
/// change time recorded at begin must match too.
pub(crate) fn proc_start_time(pid: i64) -> i64 {
    match nix::sys::stat::stat(format!("/proc/{pid}").as_str()) {
        Ok(st) => st.st_ctime,
        Err(_) => -1,
    }
}

fn process_alive(pid: i64, recorded_start: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    let now = proc_start_time(pid);
    now != -1 && now == recorded_start
}
