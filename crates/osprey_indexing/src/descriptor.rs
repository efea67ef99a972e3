//! Row descriptor: the factory for search rows and full rows of one table.

use std::sync::Arc;

use osprey_common::datum::{Datum, OwnedRow};
use osprey_common::schema::TableSchema;

use crate::memory::OffHeapRegion;
use crate::row::Row;

/// Creates rows for one table and owns its optional off-heap region.
///
/// The descriptor is handed to the table engine before DDL execution and
/// shared by the table and all of its indexes afterwards.
#[derive(Debug)]
pub struct RowDescriptor {
    schema: TableSchema,
    memory: Option<Arc<OffHeapRegion>>,
}

impl RowDescriptor {
    pub fn new(schema: TableSchema, memory: Option<Arc<OffHeapRegion>>) -> Self {
        Self { schema, memory }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// The off-heap region, if this table's rows live off heap. Presence
    /// disables snapshot publication on the owning table.
    pub fn memory(&self) -> Option<&Arc<OffHeapRegion>> {
        self.memory.as_ref()
    }

    /// Create a row. `value = None` yields a key-only search row, used for
    /// lookups and removals.
    pub fn create_row(&self, key: Datum, value: Option<OwnedRow>, expire_at: i64) -> Arc<Row> {
        match value {
            Some(value) => {
                debug_assert_eq!(
                    value.len(),
                    self.schema.num_columns(),
                    "value arity does not match schema {}",
                    self.schema.name
                );
                if let Some(mem) = &self.memory {
                    mem.reserve(payload_estimate(&value.values));
                }
                Arc::new(Row::full(key, value, expire_at))
            }
            None => Arc::new(Row::search(key)),
        }
    }

    /// Return a removed, displaced or rolled-back row's payload to the
    /// region accounting. Counterpart of the `create_row` reservation.
    pub fn release_row(&self, row: &Row) {
        if let Some(mem) = &self.memory {
            mem.release(payload_estimate(row.index_cols()));
        }
    }
}

/// Rough payload footprint used for off-heap accounting.
fn payload_estimate(values: &[Datum]) -> u64 {
    let mut bytes = 16u64;
    for datum in values {
        bytes += match datum {
            Datum::Null | Datum::Boolean(_) => 1,
            Datum::Int32(_) => 4,
            Datum::Int64(_) | Datum::Float64(_) => 8,
            Datum::Text(s) => s.len() as u64 + 1,
            Datum::Bytes(b) => b.len() as u64 + 4,
        };
    }
    bytes
}
