//! Ordered tree indexes.
//!
//! Every index of a table (primary key, unique secondary, non-unique
//! secondary) is a `TreeIndex`: an ordered map from an encoded search key to
//! the shared row. The tree itself is a `BTreeMap` behind its own RwLock and
//! is mutated under the owning table's *read* lock; coherent multi-index
//! freezes happen under the table's write lock via `take_snapshot`.
//!
//! Snapshots are reference counted `Arc` clones of the tree. A query thread
//! registers its snapshot in a per-thread slot; `find` consults that slot
//! first, so cursors opened between `lock` and `unlock` see the frozen view
//! regardless of concurrent updates.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Mutex, RwLock};

use osprey_common::datum::{encode_datum_to_bytes, prefix_successor, Datum};
use osprey_common::schema::IndexColumn;

use crate::memory::OffHeapRegion;
use crate::row::{now_millis, Row};

/// Frozen view of an index: a refcounted clone of the tree at freeze time.
pub type IndexSnapshot = Arc<BTreeMap<Vec<u8>, Arc<Row>>>;

#[derive(Debug)]
enum IndexKeys {
    /// Keyed by the cache key encoding.
    PrimaryKey,
    /// Keyed by value columns; non-unique indexes append the cache key as a
    /// tiebreaker so equal-column rows stay distinct.
    Columns(Box<[IndexColumn]>),
}

/// An ordered index over the rows of one table.
#[derive(Debug)]
pub struct TreeIndex {
    name: String,
    unique: bool,
    keys: IndexKeys,
    tree: RwLock<BTreeMap<Vec<u8>, Arc<Row>>>,
    /// Per-thread registered snapshots; consulted by reads.
    snapshots: Mutex<HashMap<ThreadId, IndexSnapshot>>,
}

impl TreeIndex {
    /// The distinguished unique index keyed by the cache key.
    pub fn primary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique: true,
            keys: IndexKeys::PrimaryKey,
            tree: RwLock::new(BTreeMap::new()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// A secondary index over value columns.
    pub fn secondary(name: impl Into<String>, columns: Vec<IndexColumn>, unique: bool) -> Self {
        assert!(!columns.is_empty(), "secondary index needs key columns");
        Self {
            name: name.into(),
            unique,
            keys: IndexKeys::Columns(columns.into_boxed_slice()),
            tree: RwLock::new(BTreeMap::new()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique(&self) -> bool {
        self.unique
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.keys, IndexKeys::PrimaryKey)
    }

    /// Tree key for a row in this index.
    fn tree_key(&self, row: &Row) -> Vec<u8> {
        match &self.keys {
            IndexKeys::PrimaryKey => row.key_bytes().to_vec(),
            IndexKeys::Columns(cols) => {
                let mut buf = Vec::with_capacity(16 * (cols.len() + 1));
                for col in cols.iter() {
                    encode_index_col(row.index_col(col.column), col.descending, &mut buf);
                }
                if !self.unique {
                    buf.extend_from_slice(row.key_bytes());
                }
                buf
            }
        }
    }

    /// Encoded search bound from leading key-column values.
    fn bound_key(&self, vals: &[Datum]) -> Vec<u8> {
        match &self.keys {
            IndexKeys::PrimaryKey => {
                let mut buf = Vec::with_capacity(16 * vals.len());
                for val in vals {
                    encode_datum_to_bytes(val, &mut buf);
                }
                buf
            }
            IndexKeys::Columns(cols) => {
                assert!(vals.len() <= cols.len(), "bound wider than index key");
                let mut buf = Vec::with_capacity(16 * vals.len());
                for (val, col) in vals.iter().zip(cols.iter()) {
                    encode_index_col(val, col.descending, &mut buf);
                }
                buf
            }
        }
    }

    /// Insert a row. Returns the displaced row, or `None` if the slot was
    /// empty. With `if_absent` an occupied slot is left untouched and the
    /// occupant is returned.
    pub fn put(&self, row: Arc<Row>, if_absent: bool) -> Option<Arc<Row>> {
        let key = self.tree_key(&row);
        let mut tree = self.tree.write();
        if if_absent {
            if let Some(existing) = tree.get(&key) {
                return Some(Arc::clone(existing));
            }
            tree.insert(key, row);
            None
        } else {
            tree.insert(key, row)
        }
    }

    /// Remove the row occupying this row's slot, if any.
    pub fn remove(&self, row: &Row) -> Option<Arc<Row>> {
        self.tree.write().remove(&self.tree_key(row))
    }

    /// Point lookup against the live tree (swap/unswap path).
    pub fn find_one(&self, search: &Row) -> Option<Arc<Row>> {
        self.tree.read().get(&self.tree_key(search)).cloned()
    }

    /// Cursor over the inclusive range `[first, last]` given as leading
    /// key-column values in natural order. Reads the calling thread's
    /// registered snapshot if one is present, the live tree otherwise.
    /// Expired rows are skipped.
    pub fn find(&self, first: Option<&[Datum]>, last: Option<&[Datum]>) -> IndexCursor {
        // A descending leading column reverses the encoded order: the
        // natural lower bound becomes the encoded upper bound.
        let (lo_vals, hi_vals) = if self.leading_descending() {
            (last, first)
        } else {
            (first, last)
        };
        let lower = match lo_vals {
            Some(vals) => Bound::Included(self.bound_key(vals)),
            None => Bound::Unbounded,
        };
        let upper = match hi_vals {
            Some(vals) => match prefix_successor(&self.bound_key(vals)) {
                Some(succ) => Bound::Excluded(succ),
                None => Bound::Unbounded,
            },
            None => Bound::Unbounded,
        };

        if let (Bound::Included(lo), Bound::Excluded(hi)) = (&lower, &upper) {
            if hi <= lo {
                return IndexCursor::new(Vec::new());
            }
        }

        let now = now_millis();
        let collect = |tree: &BTreeMap<Vec<u8>, Arc<Row>>| {
            tree.range((lower.clone(), upper.clone()))
                .map(|(_, row)| Arc::clone(row))
                .filter(|row| !row.is_expired(now))
                .collect::<Vec<_>>()
        };

        let rows = match self.thread_snapshot() {
            Some(snap) => collect(&*snap),
            None => collect(&*self.tree.read()),
        };
        IndexCursor::new(rows)
    }

    /// Freeze this index. Reuses `prev` when given (the caller refcounts an
    /// already-published snapshot), otherwise clones the live tree. The
    /// handle is registered in the calling thread's slot until
    /// `release_snapshot`.
    pub fn take_snapshot(&self, prev: Option<IndexSnapshot>) -> IndexSnapshot {
        let snap = prev.unwrap_or_else(|| Arc::new(self.tree.read().clone()));
        self.snapshots
            .lock()
            .insert(std::thread::current().id(), Arc::clone(&snap));
        snap
    }

    /// Drop the calling thread's registered snapshot.
    pub fn release_snapshot(&self) {
        self.snapshots.lock().remove(&std::thread::current().id());
    }

    fn leading_descending(&self) -> bool {
        match &self.keys {
            IndexKeys::PrimaryKey => false,
            IndexKeys::Columns(cols) => cols.first().map_or(false, |c| c.descending),
        }
    }

    fn thread_snapshot(&self) -> Option<IndexSnapshot> {
        self.snapshots
            .lock()
            .get(&std::thread::current().id())
            .cloned()
    }

    /// Row count as seen by the calling thread (snapshot-aware).
    pub fn row_count(&self) -> u64 {
        match self.thread_snapshot() {
            Some(snap) => snap.len() as u64,
            None => self.tree.read().len() as u64,
        }
    }

    /// Live row count, ignoring snapshots.
    pub fn row_count_approximation(&self) -> u64 {
        self.tree.read().len() as u64
    }

    /// Compare two rows in this index's key domain.
    pub fn compare_rows(&self, a: &Row, b: &Row) -> std::cmp::Ordering {
        self.tree_key(a).cmp(&self.tree_key(b))
    }

    /// Fresh index with identical contents; the old instance is discarded by
    /// the caller.
    pub fn rebuild(&self, mem: Option<&Arc<OffHeapRegion>>) -> TreeIndex {
        tracing::debug!(index = %self.name, off_heap = mem.is_some(), "rebuilding index");
        let contents = self.tree.read().clone();
        TreeIndex {
            name: self.name.clone(),
            unique: self.unique,
            keys: match &self.keys {
                IndexKeys::PrimaryKey => IndexKeys::PrimaryKey,
                IndexKeys::Columns(cols) => IndexKeys::Columns(cols.clone()),
            },
            tree: RwLock::new(contents),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Release snapshot registrations; the index is going away.
    pub fn close(&self) {
        self.snapshots.lock().clear();
    }
}

fn encode_index_col(val: &Datum, descending: bool, buf: &mut Vec<u8>) {
    let start = buf.len();
    encode_datum_to_bytes(val, buf);
    if descending {
        for byte in &mut buf[start..] {
            *byte = !*byte;
        }
    }
}

/// Materialized cursor over an index range.
#[derive(Debug)]
pub struct IndexCursor {
    rows: std::vec::IntoIter<Arc<Row>>,
}

impl IndexCursor {
    fn new(rows: Vec<Arc<Row>>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.len() == 0
    }
}

impl Iterator for IndexCursor {
    type Item = Arc<Row>;

    fn next(&mut self) -> Option<Arc<Row>> {
        self.rows.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osprey_common::datum::OwnedRow;

    fn row(key: i64, cols: Vec<Datum>) -> Arc<Row> {
        Arc::new(Row::full(Datum::Int64(key), OwnedRow::new(cols), 0))
    }

    fn expiring_row(key: i64, cols: Vec<Datum>, expire_at: i64) -> Arc<Row> {
        Arc::new(Row::full(Datum::Int64(key), OwnedRow::new(cols), expire_at))
    }

    #[test]
    fn test_primary_put_and_find_one() {
        let pk = TreeIndex::primary("pk");
        assert!(pk.put(row(1, vec![Datum::Int64(10)]), false).is_none());
        let displaced = pk.put(row(1, vec![Datum::Int64(20)]), false).unwrap();
        assert_eq!(displaced.index_col(0).as_i64(), Some(10));

        let search = Row::search(Datum::Int64(1));
        let found = pk.find_one(&search).unwrap();
        assert_eq!(found.index_col(0).as_i64(), Some(20));
    }

    #[test]
    fn test_put_if_absent_does_not_mutate() {
        let u1 = TreeIndex::secondary("u1", vec![IndexColumn::ascending(0)], true);
        let a = row(1, vec![Datum::Int64(10)]);
        assert!(u1.put(Arc::clone(&a), true).is_none());

        let b = row(2, vec![Datum::Int64(10)]);
        let occupant = u1.put(b, true).unwrap();
        assert!(Arc::ptr_eq(&occupant, &a));
        // Slot still holds the original row.
        assert_eq!(u1.row_count_approximation(), 1);
        let found = u1.find(Some(&[Datum::Int64(10)]), Some(&[Datum::Int64(10)]));
        assert!(Arc::ptr_eq(&found.last().unwrap(), &a));
    }

    #[test]
    fn test_non_unique_keeps_equal_columns_distinct() {
        let n1 = TreeIndex::secondary("n1", vec![IndexColumn::ascending(0)], false);
        n1.put(row(1, vec![Datum::Int64(10)]), false);
        n1.put(row(2, vec![Datum::Int64(10)]), false);
        assert_eq!(n1.row_count_approximation(), 2);

        let hits: Vec<_> = n1
            .find(Some(&[Datum::Int64(10)]), Some(&[Datum::Int64(10)]))
            .collect();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_non_unique_replace_same_key() {
        let n1 = TreeIndex::secondary("n1", vec![IndexColumn::ascending(0)], false);
        n1.put(row(1, vec![Datum::Int64(10)]), false);
        let displaced = n1.put(row(1, vec![Datum::Int64(10)]), false);
        assert!(displaced.is_some());
        assert_eq!(n1.row_count_approximation(), 1);
    }

    #[test]
    fn test_range_find_inclusive() {
        let n1 = TreeIndex::secondary("n1", vec![IndexColumn::ascending(0)], false);
        for (k, c) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
            n1.put(row(k, vec![Datum::Int64(c)]), false);
        }
        let hits: Vec<_> = n1
            .find(Some(&[Datum::Int64(20)]), Some(&[Datum::Int64(30)]))
            .collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index_col(0).as_i64(), Some(20));
        assert_eq!(hits[1].index_col(0).as_i64(), Some(30));

        let all: Vec<_> = n1.find(None, None).collect();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_descending_column_reverses_order() {
        let idx = TreeIndex::secondary(
            "d1",
            vec![IndexColumn {
                column: 0,
                descending: true,
            }],
            false,
        );
        for (k, c) in [(1, 10), (2, 20), (3, 30)] {
            idx.put(row(k, vec![Datum::Int64(c)]), false);
        }
        let all: Vec<_> = idx.find(None, None).collect();
        let cols: Vec<_> = all.iter().map(|r| r.index_col(0).as_i64().unwrap()).collect();
        assert_eq!(cols, vec![30, 20, 10]);
    }

    #[test]
    fn test_descending_column_bounded_range() {
        let idx = TreeIndex::secondary(
            "d1",
            vec![IndexColumn {
                column: 0,
                descending: true,
            }],
            false,
        );
        for (k, c) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
            idx.put(row(k, vec![Datum::Int64(c)]), false);
        }

        // Natural-order bounds select the same rows as on an ascending
        // column, yielded in index (descending) order.
        let hits: Vec<_> = idx
            .find(Some(&[Datum::Int64(20)]), Some(&[Datum::Int64(30)]))
            .map(|r| r.index_col(0).as_i64().unwrap())
            .collect();
        assert_eq!(hits, vec![30, 20]);

        // One-sided natural lower bound.
        let hits: Vec<_> = idx
            .find(Some(&[Datum::Int64(30)]), None)
            .map(|r| r.index_col(0).as_i64().unwrap())
            .collect();
        assert_eq!(hits, vec![40, 30]);

        // One-sided natural upper bound.
        let hits: Vec<_> = idx
            .find(None, Some(&[Datum::Int64(20)]))
            .map(|r| r.index_col(0).as_i64().unwrap())
            .collect();
        assert_eq!(hits, vec![20, 10]);
    }

    #[test]
    fn test_snapshot_isolates_from_updates() {
        let pk = TreeIndex::primary("pk");
        pk.put(row(1, vec![Datum::Int64(10)]), false);

        let snap = pk.take_snapshot(None);
        assert_eq!(snap.len(), 1);

        pk.put(row(2, vec![Datum::Int64(20)]), false);
        // This thread reads through the snapshot.
        assert_eq!(pk.row_count(), 1);
        assert_eq!(pk.find(None, None).count(), 1);

        pk.release_snapshot();
        assert_eq!(pk.row_count(), 2);
        assert_eq!(pk.find(None, None).count(), 2);
    }

    #[test]
    fn test_take_snapshot_reuses_prev() {
        let pk = TreeIndex::primary("pk");
        pk.put(row(1, vec![Datum::Int64(10)]), false);
        let first = pk.take_snapshot(None);
        let second = pk.take_snapshot(Some(Arc::clone(&first)));
        assert!(Arc::ptr_eq(&first, &second));
        pk.release_snapshot();
    }

    #[test]
    fn test_expired_rows_skipped_by_cursor() {
        let pk = TreeIndex::primary("pk");
        pk.put(row(1, vec![Datum::Int64(10)]), false);
        pk.put(expiring_row(2, vec![Datum::Int64(20)], 1), false);
        let live: Vec<_> = pk.find(None, None).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key().as_i64(), Some(1));
        // Still present for keyed operations.
        assert!(pk.find_one(&Row::search(Datum::Int64(2))).is_some());
    }

    #[test]
    fn test_rebuild_preserves_contents() {
        let pk = TreeIndex::primary("pk");
        pk.put(row(1, vec![Datum::Int64(10)]), false);
        pk.put(row(2, vec![Datum::Int64(20)]), false);

        let rebuilt = pk.rebuild(None);
        assert_eq!(rebuilt.row_count_approximation(), 2);
        assert_eq!(rebuilt.name(), "pk");
        assert!(rebuilt.unique());
    }

    #[test]
    fn test_compare_rows_on_primary_key_domain() {
        let pk = TreeIndex::primary("pk");
        let a = row(1, vec![Datum::Int64(10)]);
        let b = row(1, vec![Datum::Int64(99)]);
        let c = row(2, vec![Datum::Int64(10)]);
        assert_eq!(pk.compare_rows(&a, &b), std::cmp::Ordering::Equal);
        assert_eq!(pk.compare_rows(&a, &c), std::cmp::Ordering::Less);
    }
}
