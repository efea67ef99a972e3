//! Full-scan dispatch wrapper over the primary index.
//!
//! The SQL planner expects a scan index at position 0 of every table. It is
//! not an index of its own: every read delegates to the primary, and the
//! only thing it adds is the cost hook the planner uses to price a full
//! table scan against a keyed index access.

use std::sync::Arc;

use osprey_common::error::{IndexingError, OspreyResult};

use crate::index::{IndexCursor, TreeIndex};
use crate::row::Row;

/// Suffix appended to the delegate name for plan output.
pub const SCAN_INDEX_NAME_SUFFIX: &str = "__SCAN_";

/// Fixed cost offset that keeps keyed access preferable to a full scan even
/// on tiny tables.
pub const SCAN_COST_OFFSET: f64 = 1000.0;

/// Non-ordered scan view of the primary index.
#[derive(Debug, Clone)]
pub struct ScanIndex {
    delegate: Arc<TreeIndex>,
}

impl ScanIndex {
    pub fn new(delegate: Arc<TreeIndex>) -> Self {
        Self { delegate }
    }

    pub fn delegate(&self) -> &Arc<TreeIndex> {
        &self.delegate
    }

    pub fn name(&self) -> String {
        format!("{}{}", self.delegate.name(), SCAN_INDEX_NAME_SUFFIX)
    }

    /// Full scan over the delegate; a scan has no search bounds.
    pub fn find(&self) -> IndexCursor {
        self.delegate.find(None, None)
    }

    /// Planner cost of a full scan.
    pub fn cost(&self) -> f64 {
        self.delegate.row_count_approximation() as f64 + SCAN_COST_OFFSET
    }

    pub fn row_count(&self) -> u64 {
        self.delegate.row_count()
    }

    pub fn row_count_approximation(&self) -> u64 {
        self.delegate.row_count_approximation()
    }

    pub fn compare_rows(&self, a: &Row, b: &Row) -> std::cmp::Ordering {
        self.delegate.compare_rows(a, b)
    }

    pub fn can_get_first_or_last(&self) -> bool {
        false
    }

    pub fn can_find_next(&self) -> bool {
        false
    }

    pub fn disk_space_used(&self) -> u64 {
        0
    }

    pub fn rename(&self, _new_name: &str) -> OspreyResult<()> {
        Err(IndexingError::UnsupportedDdl("rename").into())
    }

    pub fn set_comment(&self, _comment: &str) -> OspreyResult<()> {
        Err(IndexingError::UnsupportedDdl("comment").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osprey_common::datum::{Datum, OwnedRow};

    fn pk_with_rows(n: i64) -> Arc<TreeIndex> {
        let pk = Arc::new(TreeIndex::primary("pk"));
        for k in 0..n {
            pk.put(
                Arc::new(Row::full(
                    Datum::Int64(k),
                    OwnedRow::new(vec![Datum::Int64(k * 10)]),
                    0,
                )),
                false,
            );
        }
        pk
    }

    #[test]
    fn test_scan_delegates_full_range() {
        let scan = ScanIndex::new(pk_with_rows(5));
        assert_eq!(scan.find().count(), 5);
        assert_eq!(scan.row_count(), 5);
    }

    #[test]
    fn test_scan_cost_tracks_row_count() {
        let scan = ScanIndex::new(pk_with_rows(7));
        assert_eq!(scan.cost(), 7.0 + SCAN_COST_OFFSET);
    }

    #[test]
    fn test_scan_name_has_suffix() {
        let scan = ScanIndex::new(pk_with_rows(0));
        assert_eq!(scan.name(), "pk__SCAN_");
    }

    #[test]
    fn test_schema_mutations_rejected() {
        let scan = ScanIndex::new(pk_with_rows(0));
        assert!(scan.rename("other").is_err());
        assert!(scan.set_comment("c").is_err());
        assert!(!scan.can_get_first_or_last());
        assert!(!scan.can_find_next());
        assert_eq!(scan.disk_space_used(), 0);
    }
}
