use serde::{Deserialize, Serialize};

use crate::datum::DataType;

/// Column definition in a table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// Schema of one key-value partition exposed as a SQL table: the cache key
/// plus the value fields, in column order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub key_column: String,
    pub key_type: DataType,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, key_type: DataType, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            key_column: "_key".to_string(),
            key_type,
            columns,
        }
    }

    /// Find a value-column index by name (case-insensitive).
    pub fn find_column(&self, name: &str) -> Option<usize> {
        let lower = name.to_lowercase();
        self.columns
            .iter()
            .position(|c| c.name.to_lowercase() == lower)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

/// One key column of an index with its sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    /// Index into the value columns of the schema.
    pub column: usize,
    pub descending: bool,
}

impl IndexColumn {
    pub fn ascending(column: usize) -> Self {
        Self {
            column,
            descending: false,
        }
    }
}

/// Declaration of a secondary index over value columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
}
