//! Table rows.
//!
//! A row is the unit shared between the primary index and every secondary
//! index of a table: one `Arc<Row>` per logical cache entry. Index key
//! columns are extracted once at row creation and stay addressable even
//! while the value payload is swapped out to external storage, so swap and
//! unswap never touch index structure.

use std::sync::{Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use osprey_common::datum::{encode_datum, Datum, OwnedRow};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Where the row's value payload currently lives.
#[derive(Debug)]
enum Payload {
    /// Full value held on heap.
    InMemory(OwnedRow),
    /// Value relocated to external storage; the index entry remains.
    Swapped,
    /// Key-only search row; never carries a value.
    SearchOnly,
}

/// One-shot completion latch for an in-flight insert.
///
/// A concurrent inserter that finds this row occupying a unique index slot
/// blocks in `wait()` until the owning inserter resolves the latch with
/// `finish(success)`. The first resolution wins; later calls are no-ops.
#[derive(Debug)]
struct InsertGate {
    state: Mutex<Option<bool>>,
    done: Condvar,
}

impl InsertGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.is_none() {
            state = self
                .done
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.expect("insert gate resolved")
    }

    fn finish(&self, success: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_none() {
            *state = Some(success);
            self.done.notify_all();
        }
    }
}

/// A table row: `(key, value | none, expiration)` plus swap state and
/// concurrent-insert coordination.
#[derive(Debug)]
pub struct Row {
    key: Datum,
    key_bytes: Box<[u8]>,
    /// Expiration in epoch milliseconds, 0 = never.
    expire_at: i64,
    /// Index key columns, extracted at creation. Empty for search rows.
    index_cols: Box<[Datum]>,
    payload: RwLock<Payload>,
    gate: InsertGate,
}

impl Row {
    /// Full row carrying a value.
    pub(crate) fn full(key: Datum, value: OwnedRow, expire_at: i64) -> Self {
        let key_bytes = encode_datum(&key).into_boxed_slice();
        let index_cols = value.values.clone().into_boxed_slice();
        Self {
            key,
            key_bytes,
            expire_at,
            index_cols,
            payload: RwLock::new(Payload::InMemory(value)),
            gate: InsertGate::new(),
        }
    }

    /// Key-only search row.
    pub(crate) fn search(key: Datum) -> Self {
        let key_bytes = encode_datum(&key).into_boxed_slice();
        Self {
            key,
            key_bytes,
            expire_at: 0,
            index_cols: Box::new([]),
            payload: RwLock::new(Payload::SearchOnly),
            gate: InsertGate::new(),
        }
    }

    pub fn key(&self) -> &Datum {
        &self.key
    }

    /// Order-preserving encoding of the cache key; the primary index's
    /// comparison domain.
    pub fn key_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    pub fn expire_at(&self) -> i64 {
        self.expire_at
    }

    pub(crate) fn is_expired(&self, now: i64) -> bool {
        self.expire_at != 0 && self.expire_at <= now
    }

    /// Index key column by position, `Null` when out of range (search rows).
    pub fn index_col(&self, idx: usize) -> &Datum {
        self.index_cols.get(idx).unwrap_or(&Datum::Null)
    }

    /// All index key columns; empty for search rows.
    pub(crate) fn index_cols(&self) -> &[Datum] {
        &self.index_cols
    }

    /// Current value, `None` while swapped out (or for search rows).
    pub fn value(&self) -> Option<OwnedRow> {
        match &*self.payload.read() {
            Payload::InMemory(v) => Some(v.clone()),
            Payload::Swapped | Payload::SearchOnly => None,
        }
    }

    pub fn is_swapped(&self) -> bool {
        matches!(&*self.payload.read(), Payload::Swapped)
    }

    /// The value payload was relocated to external storage. Idempotent.
    pub fn on_swap(&self) {
        let mut payload = self.payload.write();
        if matches!(&*payload, Payload::InMemory(_) | Payload::Swapped) {
            *payload = Payload::Swapped;
        }
    }

    /// The value payload was promoted back from external storage.
    pub fn on_unswap(&self, value: OwnedRow) {
        let mut payload = self.payload.write();
        *payload = Payload::InMemory(value);
    }

    /// Block until the insert that created this row resolves. Returns `true`
    /// if it committed, `false` if it rolled back. Immediate for rows whose
    /// insert already finished.
    pub fn wait_insert_complete(&self) -> bool {
        self.gate.wait()
    }

    /// Resolve this row's insert. Releases every thread blocked in
    /// `wait_insert_complete`.
    pub(crate) fn finish_insert(&self, success: bool) {
        self.gate.finish(success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn value(vals: Vec<Datum>) -> OwnedRow {
        OwnedRow::new(vals)
    }

    #[test]
    fn test_full_row_exposes_value_and_cols() {
        let row = Row::full(
            Datum::Int64(1),
            value(vec![Datum::Text("a".into()), Datum::Int64(10)]),
            0,
        );
        assert_eq!(row.value().unwrap().values.len(), 2);
        assert_eq!(row.index_col(1).as_i64(), Some(10));
        assert!(!row.is_swapped());
    }

    #[test]
    fn test_search_row_has_no_value() {
        let row = Row::search(Datum::Int64(1));
        assert!(row.value().is_none());
        assert_eq!(row.index_col(0), &Datum::Null);
    }

    #[test]
    fn test_swap_unswap_roundtrip() {
        let row = Row::full(Datum::Int64(1), value(vec![Datum::Int64(10)]), 0);
        row.on_swap();
        assert!(row.is_swapped());
        assert!(row.value().is_none());
        // Index columns stay addressable while swapped.
        assert_eq!(row.index_col(0).as_i64(), Some(10));

        row.on_unswap(value(vec![Datum::Int64(10)]));
        assert!(!row.is_swapped());
        assert_eq!(row.value().unwrap().values[0].as_i64(), Some(10));
    }

    #[test]
    fn test_swap_is_idempotent() {
        let row = Row::full(Datum::Int64(1), value(vec![Datum::Int64(10)]), 0);
        row.on_swap();
        row.on_swap();
        assert!(row.is_swapped());
        row.on_unswap(value(vec![Datum::Int64(11)]));
        assert_eq!(row.value().unwrap().values[0].as_i64(), Some(11));
    }

    #[test]
    fn test_insert_gate_releases_waiter() {
        let row = Arc::new(Row::full(Datum::Int64(1), value(vec![Datum::Int64(1)]), 0));
        let row2 = Arc::clone(&row);
        let waiter = std::thread::spawn(move || row2.wait_insert_complete());
        std::thread::sleep(Duration::from_millis(20));
        row.finish_insert(true);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_insert_gate_first_resolution_wins() {
        let row = Row::full(Datum::Int64(1), value(vec![Datum::Int64(1)]), 0);
        row.finish_insert(false);
        row.finish_insert(true);
        assert!(!row.wait_insert_complete());
    }

    #[test]
    fn test_expiry() {
        let row = Row::full(Datum::Int64(1), value(vec![Datum::Int64(1)]), 5);
        assert!(row.is_expired(5));
        assert!(row.is_expired(100));
        assert!(!row.is_expired(4));
        let forever = Row::full(Datum::Int64(2), value(vec![Datum::Int64(1)]), 0);
        assert!(!forever.is_expired(i64::MAX));
    }
}
