//! Connections and cursors: the statement surface of the store.
//!
//! Every write statement runs the same protocol: (re)snapshot if the
//! isolation level asks for it, try to lock the catalog root for the target
//! entity, run the index and base-table mutations, publish the new roots.
//! On any `Timeout` along the way, sleep briefly and take another lap until
//! the per-statement deadline expires. A statement that times out publishes
//! nothing; the transaction itself stays open.

use std::thread;
use std::time::{Duration, Instant};

use log::warn;
use shmdb_primitives::{RowId, Tid};

use crate::engine::Engine;
use crate::entity::Entity;
use crate::error::{Result, TxnError};
use crate::init::Database;
use crate::registry::{IndexMatcher, Matcher, Sorter};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Every statement sees everything committed before it started.
    #[default]
    ReadCommitted,
    /// Every statement sees the snapshot taken at transaction begin.
    Serializable,
}

pub struct Connection<'db> {
    db: &'db Database,
    tid: Option<Tid>,
    isolation: IsolationLevel,
}

impl<'db> Connection<'db> {
    pub(crate) fn new(db: &'db Database) -> Self {
        Connection {
            db,
            tid: None,
            isolation: IsolationLevel::default(),
        }
    }

    pub fn tid(&self) -> Option<Tid> {
        self.tid
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    /// Selects the isolation level for the next transaction. Refused once a
    /// transaction is already running.
    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        if self.tid.is_some() {
            return Err(TxnError::AlreadyStarted.into());
        }
        self.isolation = level;
        Ok(())
    }

    /// Lazily begins the connection's transaction, waiting out a full
    /// transaction ring up to the transaction region's timeout.
    fn ensure_txn(&mut self) -> Result<Tid> {
        if let Some(tid) = self.tid {
            return Ok(tid);
        }
        let txn = self.db.txn_table();
        let timeout_ms = txn.region().timeout_ms();
        let start = Instant::now();
        loop {
            match txn.begin() {
                Ok(tid) => {
                    self.tid = Some(tid);
                    return Ok(tid);
                }
                Err(e) if matches!(e.as_txn(), Some(TxnError::TableFull)) => {
                    if deadline_expired(start, timeout_ms) {
                        return Err(crate::error::DatastoreError::Timeout(
                            txn.region().name().into(),
                        ));
                    }
                    retry_sleep(timeout_ms);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-snapshots before a statement under Read-Committed; a no-op under
    /// Serializable.
    fn adjust_txn(&self, tid: Tid) -> Result<()> {
        if self.isolation == IsolationLevel::ReadCommitted {
            self.db.txn_table().adjust(tid, self.db.catalog_index_region())?;
        }
        Ok(())
    }

    /// Inserts one row into `table` and its indexes.
    pub fn execute_insert(&mut self, table: &str, row: &[u8]) -> Result<()> {
        let tid = self.ensure_txn()?;
        let engine = Engine::new(self.db);
        let timeout_ms = self.db.region(table)?.timeout_ms();
        let start = Instant::now();
        loop {
            self.adjust_txn(tid)?;
            if engine.lock_catalog_root(table, tid)? {
                match engine.insert_tuple(tid, table, row) {
                    Err(e) if e.is_timeout() => {}
                    Err(e) => return Err(e),
                    Ok(_) => return Ok(()),
                }
            }
            if deadline_expired(start, timeout_ms) {
                return Err(crate::error::DatastoreError::Timeout(table.into()));
            }
            retry_sleep(timeout_ms);
        }
    }

    /// Replaces every row matching the matchers with `row`: a locked delete
    /// followed by an insert inside one protocol iteration.
    pub fn execute_update(
        &mut self,
        table: &str,
        row: &[u8],
        idx_matcher: Option<&dyn IndexMatcher>,
        default_matcher: Option<&dyn Matcher>,
    ) -> Result<()> {
        let tid = self.ensure_txn()?;
        let engine = Engine::new(self.db);
        let timeout_ms = self.db.region(table)?.timeout_ms();
        let start = Instant::now();
        loop {
            self.adjust_txn(tid)?;
            if engine.lock_catalog_root(table, tid)? {
                match engine
                    .delete_tuples(tid, table, idx_matcher, default_matcher)
                    .and_then(|_| engine.insert_tuple(tid, table, row))
                {
                    Err(e) if e.is_timeout() => {}
                    Err(e) => return Err(e),
                    Ok(_) => return Ok(()),
                }
            }
            if deadline_expired(start, timeout_ms) {
                return Err(crate::error::DatastoreError::Timeout(table.into()));
            }
            retry_sleep(timeout_ms);
        }
    }

    /// Deletes every row matching the matchers; returns how many went.
    pub fn execute_delete(
        &mut self,
        table: &str,
        idx_matcher: Option<&dyn IndexMatcher>,
        default_matcher: Option<&dyn Matcher>,
    ) -> Result<usize> {
        let tid = self.ensure_txn()?;
        let engine = Engine::new(self.db);
        let timeout_ms = self.db.region(table)?.timeout_ms();
        let start = Instant::now();
        loop {
            self.adjust_txn(tid)?;
            if engine.lock_catalog_root(table, tid)? {
                match engine.delete_tuples(tid, table, idx_matcher, default_matcher) {
                    Err(e) if e.is_timeout() => {}
                    other => return other,
                }
            }
            if deadline_expired(start, timeout_ms) {
                return Err(crate::error::DatastoreError::Timeout(table.into()));
            }
            retry_sleep(timeout_ms);
        }
    }

    /// Opens a cursor over the rows of `table` matching the matchers.
    /// With `for_update`, matches are locked for this transaction and
    /// conflicting statements elsewhere observe `Timeout`.
    pub fn open_cursor(
        &mut self,
        table: &str,
        for_update: bool,
        idx_matcher: Option<&dyn IndexMatcher>,
        default_matcher: Option<&dyn Matcher>,
        sorter: Option<&dyn Sorter>,
    ) -> Result<Cursor<'db>> {
        let tid = self.ensure_txn()?;
        let engine = Engine::new(self.db);
        let rows = if for_update {
            let timeout_ms = self.db.region(table)?.timeout_ms();
            let start = Instant::now();
            loop {
                self.adjust_txn(tid)?;
                if engine.lock_catalog_root(table, tid)? {
                    match engine.search_tuples(tid, table, true, idx_matcher, default_matcher, sorter) {
                        Err(e) if e.is_timeout() => {}
                        Err(e) => return Err(e),
                        Ok(rows) => break rows,
                    }
                }
                if deadline_expired(start, timeout_ms) {
                    return Err(crate::error::DatastoreError::Timeout(table.into()));
                }
                retry_sleep(timeout_ms);
            }
        } else {
            self.adjust_txn(tid)?;
            engine.search_tuples(tid, table, false, idx_matcher, default_matcher, sorter)?
        };
        Ok(Cursor {
            db: self.db,
            table: table.into(),
            rows,
            position: 0,
        })
    }

    /// Commits the open transaction, publishing its writes and possibly the
    /// new catalog root. Without an open transaction this is a no-op.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(tid) = self.tid.take() {
            self.db.txn_table().commit(tid, self.db.catalog_index_region())?;
        }
        Ok(())
    }

    /// Aborts the open transaction. Its rows stay on disk until the
    /// collector reclaims them; visibility hides them immediately.
    pub fn rollback(&mut self) -> Result<()> {
        if let Some(tid) = self.tid.take() {
            self.db.txn_table().abort(tid)?;
        }
        Ok(())
    }

    /// Closes the connection, rolling back any open transaction.
    pub fn close(&mut self) -> Result<()> {
        self.rollback()
    }
}

impl Drop for Connection<'_> {
    fn drop(&mut self) {
        if let Some(tid) = self.tid.take() {
            if let Err(e) = self.db.txn_table().abort(tid) {
                warn!("rollback of tid {tid} on connection drop failed: {e}");
            }
        }
    }
}

/// A materialized result set: the matching row ids, fetched one payload at
/// a time. The cursor does not re-check visibility at fetch; the row set
/// was fixed under the statement's snapshot when it was opened.
pub struct Cursor<'db> {
    db: &'db Database,
    table: String,
    rows: Vec<RowId>,
    position: usize,
}

impl Cursor<'_> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_ids(&self) -> &[RowId] {
        &self.rows
    }

    /// Copies out the next row payload, or `None` past the last row.
    pub fn fetch(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(&row) = self.rows.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        let entity = Entity::new(self.db.region(&self.table)?);
        entity.tuple(row).map(Some)
    }
}

fn deadline_expired(start: Instant, timeout_ms: u64) -> bool {
    timeout_ms != 0 && start.elapsed() >= Duration::from_millis(timeout_ms)
}

/// One lap of the retry loop sleeps a tenth of the statement timeout,
/// clamped to [1, 100] ms.
fn retry_sleep(timeout_ms: u64) {
    let ms = if timeout_ms == 0 { 100 } else { (timeout_ms / 10).clamp(1, 100) };
    thread::sleep(Duration::from_millis(ms));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DatastoreError, IndexError};
    use crate::registry::Matcher;
    use crate::testing::{person_db, PersonIdMatcher, PersonNameSorter, PersonRow, PERSON};
    use pretty_assertions::assert_eq;

    fn fetch_one(cursor: &mut Cursor<'_>) -> Option<PersonRow> {
        cursor.fetch().unwrap().map(|payload| PersonRow::from_bytes(&payload))
    }

    fn search_by_id(conn: &mut Connection<'_>, id: u32) -> Vec<PersonRow> {
        let mut cursor = conn
            .open_cursor(PERSON, false, Some(&PersonIdMatcher(id)), None, None)
            .unwrap();
        let mut rows = Vec::new();
        while let Some(row) = fetch_one(&mut cursor) {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn insert_commit_select() -> Result<()> {
        let (_dir, db) = person_db(1000, 8);

        let mut t1 = db.connect();
        t1.execute_insert(PERSON, PersonRow::new(1, "a").as_bytes())?;
        t1.commit()?;

        let mut t2 = db.connect();
        t2.execute_insert(PERSON, PersonRow::new(2, "b").as_bytes())?;
        let dup = t2.execute_insert(PERSON, PersonRow::new(1, "c").as_bytes());
        assert!(matches!(
            dup,
            Err(DatastoreError::Index(IndexError::DuplicateKey(_)))
        ));
        t2.commit()?;

        let mut t3 = db.connect();
        assert_eq!(search_by_id(&mut t3, 1), vec![PersonRow::new(1, "a")]);
        assert_eq!(search_by_id(&mut t3, 2), vec![PersonRow::new(2, "b")]);
        assert_eq!(search_by_id(&mut t3, 3), vec![]);
        t3.commit()?;
        Ok(())
    }

    #[test]
    fn conflicting_updates_one_wins_one_times_out() -> Result<()> {
        let (_dir, db) = person_db(100, 8);

        let mut setup = db.connect();
        setup.execute_insert(PERSON, PersonRow::new(1, "orig").as_bytes())?;
        setup.commit()?;

        let mut loser = db.connect();
        loser.set_isolation_level(IsolationLevel::Serializable)?;
        // Pin the loser's snapshot before the winner commits.
        assert_eq!(search_by_id(&mut loser, 1), vec![PersonRow::new(1, "orig")]);

        let mut winner = db.connect();
        winner.execute_update(PERSON, PersonRow::new(1, "x").as_bytes(), Some(&PersonIdMatcher(1)), None)?;
        winner.commit()?;

        // The loser's snapshot still holds the superseded version, whose
        // delete bound belongs to a committed transaction: locked forever
        // from the loser's point of view.
        let lost = loser.execute_update(PERSON, PersonRow::new(1, "y").as_bytes(), Some(&PersonIdMatcher(1)), None);
        assert!(lost.is_err_and(|e| e.is_timeout()));
        loser.rollback()?;

        let mut check = db.connect();
        assert_eq!(search_by_id(&mut check, 1), vec![PersonRow::new(1, "x")]);
        check.commit()?;

        // The superseded version is reclaimable once no one can see it.
        let report = db.collect_garbage()?;
        assert!(report.freed_rows > 0, "loser version should be reclaimed: {report:?}");
        Ok(())
    }

    #[test]
    fn serializable_reads_stay_on_their_snapshot() -> Result<()> {
        let (_dir, db) = person_db(1000, 8);

        let mut reader = db.connect();
        reader.set_isolation_level(IsolationLevel::Serializable)?;
        assert_eq!(search_by_id(&mut reader, 50), vec![]);

        let mut writer = db.connect();
        writer.execute_insert(PERSON, PersonRow::new(50, "new").as_bytes())?;
        writer.commit()?;

        // Still the old snapshot.
        assert_eq!(search_by_id(&mut reader, 50), vec![]);
        reader.commit()?;

        // Read-Committed picks up every commit at the next statement; this
        // first search also pins the transaction open before the late write.
        let mut rc_reader = db.connect();
        assert_eq!(rc_reader.isolation_level(), IsolationLevel::ReadCommitted);
        assert_eq!(search_by_id(&mut rc_reader, 50), vec![PersonRow::new(50, "new")]);

        let mut late_writer = db.connect();
        late_writer.execute_insert(PERSON, PersonRow::new(60, "late").as_bytes())?;
        late_writer.commit()?;

        assert_eq!(search_by_id(&mut rc_reader, 60), vec![PersonRow::new(60, "late")]);
        rc_reader.commit()?;
        Ok(())
    }

    #[test]
    fn repeated_reads_are_stable_under_serializable() -> Result<()> {
        let (_dir, db) = person_db(1000, 8);
        let mut setup = db.connect();
        setup.execute_insert(PERSON, PersonRow::new(7, "before").as_bytes())?;
        setup.commit()?;

        let mut reader = db.connect();
        reader.set_isolation_level(IsolationLevel::Serializable)?;
        let first = search_by_id(&mut reader, 7);

        let mut writer = db.connect();
        writer.execute_update(PERSON, PersonRow::new(7, "after").as_bytes(), Some(&PersonIdMatcher(7)), None)?;
        writer.commit()?;

        assert_eq!(search_by_id(&mut reader, 7), first);
        assert_eq!(search_by_id(&mut reader, 7), first);
        reader.commit()?;
        Ok(())
    }

    #[test]
    fn insert_then_delete_round_trips_to_nothing() -> Result<()> {
        let (_dir, db) = person_db(1000, 8);

        let mut t1 = db.connect();
        t1.execute_insert(PERSON, PersonRow::new(4, "gone").as_bytes())?;
        t1.commit()?;

        let mut t2 = db.connect();
        assert_eq!(search_by_id(&mut t2, 4), vec![PersonRow::new(4, "gone")]);
        assert_eq!(t2.execute_delete(PERSON, Some(&PersonIdMatcher(4)), None)?, 1);
        t2.commit()?;

        let mut t3 = db.connect();
        assert_eq!(search_by_id(&mut t3, 4), vec![]);
        t3.commit()?;
        Ok(())
    }

    #[test]
    fn uncommitted_writes_are_private_and_rollback_discards_them() -> Result<()> {
        let (_dir, db) = person_db(1000, 8);

        let mut writer = db.connect();
        writer.execute_insert(PERSON, PersonRow::new(9, "mine").as_bytes())?;
        // Visible to its own transaction.
        assert_eq!(search_by_id(&mut writer, 9), vec![PersonRow::new(9, "mine")]);

        let mut other = db.connect();
        assert_eq!(search_by_id(&mut other, 9), vec![]);
        other.commit()?;

        writer.rollback()?;
        let mut check = db.connect();
        assert_eq!(search_by_id(&mut check, 9), vec![]);
        check.commit()?;
        Ok(())
    }

    #[test]
    fn full_scan_filters_and_sorts() -> Result<()> {
        let (_dir, db) = person_db(1000, 8);
        let mut setup = db.connect();
        setup.execute_insert(PERSON, PersonRow::new(3, "ccc").as_bytes())?;
        setup.execute_insert(PERSON, PersonRow::new(1, "aaa").as_bytes())?;
        setup.execute_insert(PERSON, PersonRow::new(2, "bbb").as_bytes())?;
        setup.commit()?;

        let mut conn = db.connect();
        // Post-filter without an index: the matcher is applied per row.
        let matcher = PersonIdMatcher(2);
        let mut cursor = conn.open_cursor(PERSON, false, None, Some(&matcher as &dyn Matcher), None)?;
        assert_eq!(cursor.len(), 1);
        assert_eq!(fetch_one(&mut cursor).unwrap(), PersonRow::new(2, "bbb"));

        // Unfiltered scan ordered by the name sorter.
        let mut cursor = conn.open_cursor(PERSON, false, None, None, Some(&PersonNameSorter))?;
        let mut names = Vec::new();
        while let Some(row) = fetch_one(&mut cursor) {
            names.push(row.name_str().to_string());
        }
        assert_eq!(names, vec!["aaa", "bbb", "ccc"]);
        conn.commit()?;
        Ok(())
    }

    #[test]
    fn select_for_update_blocks_other_writers() -> Result<()> {
        let (_dir, db) = person_db(100, 8);
        let mut setup = db.connect();
        setup.execute_insert(PERSON, PersonRow::new(5, "held").as_bytes())?;
        setup.commit()?;

        let mut holder = db.connect();
        let cursor = holder.open_cursor(PERSON, true, Some(&PersonIdMatcher(5)), None, None)?;
        assert_eq!(cursor.len(), 1);

        let mut blocked = db.connect();
        let result = blocked.execute_delete(PERSON, Some(&PersonIdMatcher(5)), None);
        assert!(result.is_err_and(|e| e.is_timeout()));
        blocked.rollback()?;
        holder.rollback()?;
        Ok(())
    }

    #[test]
    fn isolation_cannot_change_mid_transaction() -> Result<()> {
        let (_dir, db) = person_db(1000, 8);
        let mut conn = db.connect();
        conn.execute_insert(PERSON, PersonRow::new(1, "a").as_bytes())?;
        assert!(matches!(
            conn.set_isolation_level(IsolationLevel::Serializable),
            Err(DatastoreError::Txn(TxnError::AlreadyStarted))
        ));
        conn.commit()?;
        conn.set_isolation_level(IsolationLevel::Serializable)?;
        Ok(())
    }

    #[test]
    fn memory_full_surfaces_to_the_caller() -> Result<()> {
        let (_dir, db) = person_db(200, 2);
        let mut conn = db.connect();
        conn.execute_insert(PERSON, PersonRow::new(1, "a").as_bytes())?;
        conn.execute_insert(PERSON, PersonRow::new(2, "b").as_bytes())?;
        let full = conn.execute_insert(PERSON, PersonRow::new(3, "c").as_bytes());
        assert!(matches!(
            full,
            Err(DatastoreError::Table(crate::error::TableError::MemoryFull(_)))
        ));
        conn.rollback()?;
        Ok(())
    }
}
