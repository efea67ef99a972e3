//! # Module Status: PRODUCTION
//! The indexed in-memory table backing the osprey SQL query subsystem.
//! This is the **only** write path from the cache into the SQL indexes.
//!
//! ## Golden Path (cache write)
//! ```text
//! cache put/remove → SqlTable.update(key, value, expire_at)
//!   → do_update  [read lock + off-heap op scope]
//!     → primary.put / primary.remove
//!     → secondary puts (if-absent on unique indexes)
//!     → stale-row cleanup, or full rollback on unique violation
//!     → published snapshot invalidated before the read lock is released
//! ```
//!
//! ## Lock discipline
//! The table RW lock is used inversely from the common pattern: data
//! mutations take the **read** lock (they are commutative per cache key,
//! the cache serializes per-key updates), snapshot installation and index
//! rebuild take the **write** lock (they must freeze every index at one
//! logical instant). The lock protects the index list itself, so structural
//! changes are impossible without the write guard.
//!
//! ## Prohibited Patterns
//! - Concurrent `update` calls for the same cache key → violates the
//!   single-key serialization assumption of the rollback protocol
//! - Mutating an index outside the table read lock → violates snapshot
//!   coherence

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashSet;
use parking_lot::{RwLock, RwLockWriteGuard};

use osprey_common::config::IndexingConfig;
use osprey_common::datum::{Datum, OwnedRow};
use osprey_common::error::{IndexingError, OspreyResult};
use osprey_common::schema::IndexColumn;

use crate::descriptor::RowDescriptor;
use crate::engine::{CreateTableData, IndexFactory};
use crate::index::{IndexSnapshot, TreeIndex};
use crate::row::Row;
use crate::scan::ScanIndex;
use crate::session::{Session, SessionId};

/// Table type sentinel reported to the host SQL engine.
pub const EXTERNAL_TABLE_ENGINE: &str = "EXTERNAL";

/// One slot of a table's index list.
#[derive(Debug, Clone)]
pub enum TableIndex {
    /// Position 0: full-scan view of the primary.
    Scan(ScanIndex),
    /// Positions 1..: primary, then unique secondaries, then non-unique.
    Tree(Arc<TreeIndex>),
}

impl TableIndex {
    pub fn name(&self) -> String {
        match self {
            TableIndex::Scan(s) => s.name(),
            TableIndex::Tree(t) => t.name().to_string(),
        }
    }

    pub fn is_scan(&self) -> bool {
        matches!(self, TableIndex::Scan(_))
    }

    /// The tree index in this slot. Positions 1.. only.
    pub fn tree(&self) -> &Arc<TreeIndex> {
        match self {
            TableIndex::Tree(t) => t,
            TableIndex::Scan(_) => panic!("scan slot holds no tree index"),
        }
    }
}

/// Coherent frozen view of every non-scan index, taken under the write lock.
#[derive(Debug)]
pub struct TableSnapshot {
    indexes: Vec<IndexSnapshot>,
}

/// Indexed in-memory table for one key-value partition.
pub struct SqlTable {
    name: String,
    space_name: Option<String>,
    desc: Arc<RowDescriptor>,
    /// The RW lock and the index list it protects. `[0]` is the scan view,
    /// `[1]` the primary key.
    lock: RwLock<Vec<TableIndex>>,
    /// Sessions currently holding a snapshot on this table.
    sessions: DashSet<SessionId>,
    /// Published snapshot reused by queries without locking; invalidated by
    /// every update.
    actual_snapshot: ArcSwapOption<TableSnapshot>,
    write_lock_wait: Duration,
    fair_unlock: bool,
    /// Strictly more than two unique indexes (primary + at least two unique
    /// secondaries): enables the retry path on concurrent-insert conflicts.
    many_unique_idxs: bool,
    closed: AtomicBool,
    /// Back-reference handed to sessions when they register this table.
    self_ref: Weak<SqlTable>,
}

impl std::fmt::Debug for SqlTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTable")
            .field("name", &self.name)
            .field("space_name", &self.space_name)
            .field("many_unique_idxs", &self.many_unique_idxs)
            .finish_non_exhaustive()
    }
}

impl SqlTable {
    /// Builds the table during DDL execution. The factory list must be
    /// ordered: primary key, unique secondaries, non-unique secondaries.
    pub fn new(
        data: CreateTableData,
        desc: Arc<RowDescriptor>,
        factory: &dyn IndexFactory,
        space_name: Option<String>,
        config: &IndexingConfig,
    ) -> OspreyResult<Arc<SqlTable>> {
        assert!(config.write_lock_wait_ms > 0, "write lock wait must be positive");

        let idxs = factory.create_indexes(&desc);
        assert!(
            !idxs.is_empty(),
            "index factory must return at least the primary key"
        );
        assert!(
            idxs[0].is_primary() && idxs[0].unique(),
            "first index must be the primary key"
        );
        let mut seen_non_unique = false;
        for idx in &idxs[1..] {
            assert!(!idx.is_primary(), "only one primary index allowed");
            if idx.unique() {
                assert!(
                    !seen_non_unique,
                    "unique indexes must precede non-unique indexes"
                );
            } else {
                seen_non_unique = true;
            }
        }

        let many_unique_idxs = if idxs.len() > 1 {
            // The primary can't cause conflicts, so "many" means more than
            // primary + one unique secondary.
            idxs.iter().filter(|i| i.unique()).count() > 2
        } else {
            false
        };

        let mut list = Vec::with_capacity(idxs.len() + 1);
        list.push(TableIndex::Scan(ScanIndex::new(Arc::clone(&idxs[0]))));
        list.extend(idxs.into_iter().map(TableIndex::Tree));

        Ok(Arc::new_cyclic(|me| SqlTable {
            name: data.table_name,
            space_name,
            desc,
            lock: RwLock::new(list),
            sessions: DashSet::new(),
            actual_snapshot: ArcSwapOption::from(None),
            write_lock_wait: Duration::from_millis(config.write_lock_wait_ms),
            fair_unlock: config.fair_unlock,
            many_unique_idxs,
            closed: AtomicBool::new(false),
            self_ref: me.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space_name(&self) -> Option<&str> {
        self.space_name.as_deref()
    }

    pub fn row_descriptor(&self) -> &Arc<RowDescriptor> {
        &self.desc
    }

    // ── Snapshot bracket ────────────────────────────────────────────────

    /// Acquire a coherent snapshot of every secondary index for a query.
    /// Idempotent per session. Reuses the published snapshot without
    /// locking when one exists; otherwise installs one under the write
    /// lock, retrying with a doubling timed wait so installers cannot be
    /// starved by the update stream.
    ///
    /// `exclusive` and `force` are accepted for the host engine's table
    /// contract and ignored: this table is never locked exclusively.
    pub fn lock(
        &self,
        ses: Option<&Arc<Session>>,
        _exclusive: bool,
        _force: bool,
    ) -> OspreyResult<()> {
        if let Some(ses) = ses {
            if !self.sessions.insert(ses.id()) {
                return Ok(());
            }
            if let Some(me) = self.self_ref.upgrade() {
                ses.add_lock(me);
            }
        }

        let mut wait = self.write_lock_wait;
        let guard = loop {
            if let Some(snapshot) = self.actual_snapshot.load_full() {
                // Reuse the published snapshot without taking the write lock.
                let idxs = self.lock.read();
                register_table_snapshot(&idxs, &snapshot);
                return Ok(());
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(IndexingError::TableClosed.into());
            }
            match self.lock.try_write_for(wait) {
                Some(guard) => break guard,
                None => {
                    tracing::warn!(
                        table = %self.name,
                        wait_ms = wait.as_millis() as u64,
                        "index write lock wait elapsed, doubling"
                    );
                    wait = wait.saturating_mul(2);
                }
            }
        };

        // close() may have set the flag while this thread was being granted
        // the lock; do not build or publish a snapshot on a closing table.
        if self.closed.load(Ordering::SeqCst) {
            self.unlock_write(guard);
            return Err(IndexingError::TableClosed.into());
        }

        let mut taken = false;
        let snapshot = match self.actual_snapshot.load_full() {
            // Another thread installed one while we waited for the lock.
            Some(snapshot) => snapshot,
            None => {
                let snapshot = Arc::new(take_table_snapshot(&guard));
                // Publication is disabled for off-heap tables: later
                // mutations may release region pages a reusable snapshot
                // would still reference.
                if self.desc.memory().is_none() {
                    self.actual_snapshot.store(Some(Arc::clone(&snapshot)));
                }
                taken = true;
                snapshot
            }
        };
        self.unlock_write(guard);

        if !taken {
            let idxs = self.lock.read();
            register_table_snapshot(&idxs, &snapshot);
        }
        Ok(())
    }

    /// Release the snapshot bracket taken by `lock`.
    pub fn unlock(&self, ses: Option<&Session>) {
        if let Some(ses) = ses {
            let removed = self.sessions.remove(&ses.id());
            assert!(removed.is_some(), "unlock without a matching lock");
        }
        let idxs = self.lock.read();
        for idx in idxs.iter().skip(1) {
            idx.tree().release_snapshot();
        }
    }

    // ── Update protocol ─────────────────────────────────────────────────

    /// Update the table for a cache key. `value = None` removes the row;
    /// otherwise the row is added or replaced. Returns whether anything
    /// changed. Fails with `IndexUpdateFailed` on a unique-constraint
    /// violation, after rolling every index back to the previous state.
    pub fn update(
        &self,
        key: Datum,
        value: Option<OwnedRow>,
        expire_at: i64,
    ) -> OspreyResult<bool> {
        let del = value.is_none();
        let row = self.desc.create_row(key, value, expire_at);
        self.do_update(row, del)
    }

    /// Core of the update protocol. The caller guarantees no other in-flight
    /// update concerns the same cache key.
    fn do_update(&self, row: Arc<Row>, del: bool) -> OspreyResult<bool> {
        let mem = self.desc.memory().cloned();
        let idxs = self.lock.read();
        let _op = mem.as_ref().map(|m| m.begin());

        let res = self.do_update_locked(&idxs, row, del);

        // The snapshot is not actual after an update; reset it before the
        // read lock is released.
        self.actual_snapshot.store(None);
        res
    }

    fn do_update_locked(
        &self,
        idxs: &[TableIndex],
        row: Arc<Row>,
        del: bool,
    ) -> OspreyResult<bool> {
        let len = idxs.len();
        let pk = idxs[1].tree();

        if del {
            // The search row carries only the key; the primary yields the
            // full row for the secondary removals.
            let Some(old) = pk.remove(&row) else {
                return Ok(false);
            };
            for idx in idxs.iter().skip(2) {
                let res = idx.tree().remove(&old);
                assert!(
                    rows_eq(pk, res.as_ref(), Some(&old)),
                    "delete removed a foreign row from index {}",
                    idx.tree().name()
                );
            }
            // The removed row no longer backs any index entry.
            self.desc.release_row(&old);
            return Ok(true);
        }

        // The primary always succeeds: per-key updates are serialized by
        // the cache.
        let old = pk.put(Arc::clone(&row), false);

        // In which indexes the old row was replaced in place.
        let mut replaced = vec![false; len];
        if old.is_some() {
            replaced[1] = true;
        }

        // Any thread blocked on this row's insert gate must be released no
        // matter how we exit.
        let mut fin = FinishGuard {
            row: &row,
            committed: false,
        };

        let mut i = 1;
        // Put if-absent to the unique indexes, plain put to the rest.
        loop {
            i += 1;
            if i >= len {
                break;
            }
            let idx = idxs[i].tree();
            let if_absent = idx.unique();

            let Some(old2) = idx.put(Arc::clone(&row), if_absent) else {
                continue;
            };

            if rows_eq(pk, Some(&old2), old.as_ref()) {
                // Same logical row: safe to replace, single-key updates
                // can't be concurrent.
                if if_absent {
                    let displaced = idx.put(Arc::clone(&row), false);
                    assert!(
                        rows_eq(pk, displaced.as_ref(), old.as_ref()),
                        "replace displaced a foreign row in index {}",
                        idx.name()
                    );
                }
                replaced[i] = true;
                continue;
            }

            assert!(
                if_absent,
                "non-unique index {} returned a row with a different key",
                idx.name()
            );

            // The occupant may itself be a concurrent insert that will fail
            // on a later unique index.
            if self.many_unique_idxs && !old2.wait_insert_complete() {
                // It rolled back; retry the same index.
                i -= 1;
                continue;
            }

            break; // unique index violation
        }

        if i == len {
            // The new row is in every index; drop the old row where it was
            // not replaced in place.
            if let Some(old) = &old {
                for (j, idx) in idxs.iter().enumerate().skip(2) {
                    if !replaced[j] {
                        let res = idx.tree().remove(old);
                        assert!(
                            rows_eq(pk, res.as_ref(), Some(old)),
                            "stale row mismatch in index {}",
                            idx.tree().name()
                        );
                    }
                }
                // The displaced row no longer backs any index entry.
                self.desc.release_row(old);
            }
            fin.committed = true;
            Ok(true)
        } else {
            // Not every index took the row: restore the previous state.
            let failed = idxs[i].tree().name().to_string();
            for (j, idx) in idxs.iter().enumerate().take(i).skip(1) {
                let jdx = idx.tree();
                let res = if replaced[j] {
                    let old = old.as_ref().expect("replaced implies a previous row");
                    jdx.put(Arc::clone(old), false)
                } else {
                    jdx.remove(&row)
                };
                assert!(
                    rows_eq(pk, res.as_ref(), Some(&row)),
                    "rollback mismatch in index {}",
                    jdx.name()
                );
            }
            // The rolled-back row does not survive the update.
            self.desc.release_row(&row);
            Err(IndexingError::IndexUpdateFailed {
                index: failed,
                key: row.key().to_string(),
            }
            .into())
        }
    }

    // ── Swap / unswap ───────────────────────────────────────────────────

    /// The cache swapped this key's value to external storage. Returns
    /// whether the row was found.
    pub fn on_swap(&self, key: Datum) -> bool {
        self.on_swap_unswap(key, None)
    }

    /// The cache promoted this key's value back from external storage.
    /// Returns whether the row was found.
    pub fn on_unswap(&self, key: Datum, value: OwnedRow) -> bool {
        self.on_swap_unswap(key, Some(value))
    }

    fn on_swap_unswap(&self, key: Datum, value: Option<OwnedRow>) -> bool {
        let mem = self.desc.memory().cloned();
        let idxs = self.lock.read();
        let _op = mem.as_ref().map(|m| m.begin());

        let search = self.desc.create_row(key, None, 0);
        match idxs[1].tree().find_one(&search) {
            Some(row) => {
                match value {
                    Some(value) => row.on_unswap(value),
                    None => row.on_swap(),
                }
                true
            }
            None => false,
        }
    }

    // ── Rebuild / close ─────────────────────────────────────────────────

    /// Rebuild every index of this table in place.
    pub fn rebuild_indexes(&self) {
        let mem = self.desc.memory().cloned();
        let mut guard = self.lock.write();

        if mem.is_none() && self.actual_snapshot.load_full().is_none() {
            // Keep readers going against the old contents while we rebuild.
            let snapshot = Arc::new(take_table_snapshot(&guard));
            self.actual_snapshot.store(Some(snapshot));
        }

        let len = guard.len();
        for i in 1..len {
            let rebuilt = Arc::new(guard[i].tree().rebuild(mem.as_ref()));
            if i == 1 {
                // Scan slot and published snapshot reference the old
                // primary; reset the wrapper here, the snapshot below.
                guard[0] = TableIndex::Scan(ScanIndex::new(Arc::clone(&rebuilt)));
            }
            guard[i] = TableIndex::Tree(rebuilt);
        }
        tracing::debug!(table = %self.name, indexes = len - 1, "rebuilt table indexes");
        self.unlock_write(guard);

        // Published refs point at the old indexes.
        self.actual_snapshot.store(None);
    }

    /// Close the table and release index resources. Wakes any thread
    /// waiting for the write lock in `lock` with `TableClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let guard = self.lock.write();
        for idx in guard.iter().skip(1) {
            idx.tree().close();
        }
        self.unlock_write(guard);
    }

    /// Host-engine close notification for one session. The host always
    /// unlocks before closing.
    pub fn close_session(&self, ses: &Session) {
        assert!(
            !self.sessions.contains(&ses.id()),
            "session must unlock before close"
        );
    }

    // ── Host SQL engine surface ─────────────────────────────────────────

    pub fn get_scan_index(&self) -> ScanIndex {
        match &self.lock.read()[0] {
            TableIndex::Scan(scan) => scan.clone(),
            TableIndex::Tree(_) => unreachable!("scan view is always first"),
        }
    }

    /// The primary key index.
    pub fn get_unique_index(&self) -> Arc<TreeIndex> {
        Arc::clone(self.lock.read()[1].tree())
    }

    pub fn get_indexes(&self) -> Vec<TableIndex> {
        self.lock.read().clone()
    }

    /// Row count as seen by the calling query (snapshot-aware).
    pub fn row_count(&self, _ses: Option<&Session>) -> u64 {
        self.get_unique_index().row_count()
    }

    pub fn row_count_approximation(&self) -> u64 {
        self.get_unique_index().row_count_approximation()
    }

    pub fn is_locked_exclusively(&self) -> bool {
        false
    }

    pub fn is_locked_exclusively_by(&self, _ses: &Session) -> bool {
        false
    }

    pub fn max_data_modification_id(&self) -> u64 {
        0
    }

    pub fn is_deterministic(&self) -> bool {
        true
    }

    pub fn can_get_row_count(&self) -> bool {
        true
    }

    pub fn can_drop(&self) -> bool {
        true
    }

    /// Always zero: the table is pure in-memory.
    pub fn disk_space_used(&self) -> u64 {
        0
    }

    pub fn table_type(&self) -> &'static str {
        EXTERNAL_TABLE_ENGINE
    }

    /// Whether a published snapshot is currently installed (diagnostics).
    pub fn has_published_snapshot(&self) -> bool {
        self.actual_snapshot.load().is_some()
    }

    /// Index column descriptor for DDL helpers.
    pub fn index_column(&self, column: usize, descending: bool) -> IndexColumn {
        assert!(
            column < self.desc.schema().num_columns(),
            "column {} out of range for table {}",
            column,
            self.name
        );
        IndexColumn { column, descending }
    }

    // Rows enter through the cache path only.

    pub fn add_index(&self) -> OspreyResult<()> {
        Err(IndexingError::UnsupportedDdl("add index").into())
    }

    pub fn add_row(&self, _row: &Arc<Row>) -> OspreyResult<()> {
        Err(IndexingError::UnsupportedDdl("add row").into())
    }

    pub fn remove_row(&self, _row: &Arc<Row>) -> OspreyResult<()> {
        Err(IndexingError::UnsupportedDdl("remove row").into())
    }

    pub fn truncate(&self) -> OspreyResult<()> {
        Err(IndexingError::UnsupportedDdl("truncate").into())
    }

    pub fn check_support_alter(&self) -> OspreyResult<()> {
        Err(IndexingError::UnsupportedDdl("alter").into())
    }

    pub fn check_rename(&self) -> OspreyResult<()> {
        Err(IndexingError::UnsupportedDdl("rename").into())
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn unlock_write(&self, guard: RwLockWriteGuard<'_, Vec<TableIndex>>) {
        if self.fair_unlock {
            RwLockWriteGuard::unlock_fair(guard);
        } else {
            drop(guard);
        }
    }

    /// Holds the index write lock so tests can park a locker in its timed
    /// wait.
    #[cfg(test)]
    pub(crate) fn write_guard_for_test(&self) -> RwLockWriteGuard<'_, Vec<TableIndex>> {
        self.lock.write()
    }
}

/// Freeze every non-scan index. Must run under the write lock so all of
/// them agree on row set.
fn take_table_snapshot(idxs: &[TableIndex]) -> TableSnapshot {
    TableSnapshot {
        indexes: idxs
            .iter()
            .skip(1)
            .map(|idx| idx.tree().take_snapshot(None))
            .collect(),
    }
}

/// Register an existing snapshot's per-index handles for the calling thread.
fn register_table_snapshot(idxs: &[TableIndex], snapshot: &TableSnapshot) {
    for (i, idx) in idxs.iter().enumerate().skip(1) {
        idx.tree()
            .take_snapshot(Some(Arc::clone(&snapshot.indexes[i - 1])));
    }
}

/// Row equality in the primary key domain; identity is only a fast path.
fn rows_eq(pk: &TreeIndex, a: Option<&Arc<Row>>, b: Option<&Arc<Row>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            Arc::ptr_eq(a, b) || pk.compare_rows(a, b) == std::cmp::Ordering::Equal
        }
        _ => false,
    }
}

/// Resolves the row's insert gate on every exit of the insert path,
/// releasing threads blocked in `wait_insert_complete`.
struct FinishGuard<'a> {
    row: &'a Row,
    committed: bool,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.row.finish_insert(self.committed);
    }
}
