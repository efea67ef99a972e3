//! Table engine: DDL handoff between the cache and the host SQL engine.
//!
//! The host engine only accepts an engine token inside its `CREATE TABLE
//! ... ENGINE "<token>"` DDL, so the descriptor and index factory cannot be
//! passed as arguments. Instead each DDL execution registers a handoff
//! context on a process-scoped map under a fresh opaque token; the host
//! calls back with that token exactly once while the statement runs, and
//! the entry is cleared when the DDL returns. There is no module-level
//! mutable state and concurrent DDLs under distinct tokens do not
//! interfere.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use osprey_common::config::IndexingConfig;
use osprey_common::error::{IndexingError, OspreyResult};

use crate::descriptor::RowDescriptor;
use crate::index::TreeIndex;
use crate::table::SqlTable;

/// Table metadata the host SQL engine hands to `on_create_table`.
#[derive(Debug, Clone)]
pub struct CreateTableData {
    pub schema_name: String,
    pub table_name: String,
}

/// Creates the index list for a new table, ordered: primary key, unique
/// secondaries, non-unique secondaries.
pub trait IndexFactory: Send + Sync {
    fn create_indexes(&self, desc: &Arc<RowDescriptor>) -> Vec<Arc<TreeIndex>>;
}

struct DdlHandoff {
    desc: Arc<RowDescriptor>,
    factory: Arc<dyn IndexFactory>,
    space_name: Option<String>,
    table: Option<Arc<SqlTable>>,
}

/// Process-scoped table engine registry.
pub struct TableEngine {
    config: IndexingConfig,
    pending: DashMap<String, DdlHandoff>,
    token_seq: AtomicU64,
}

impl TableEngine {
    pub fn new(config: IndexingConfig) -> Self {
        Self {
            config,
            pending: DashMap::new(),
            token_seq: AtomicU64::new(0),
        }
    }

    /// Create a table through the host SQL engine.
    ///
    /// Registers the handoff context, then invokes `exec` with the engine
    /// token; `exec` must run the host's `CREATE TABLE ... ENGINE
    /// "<token>"` statement, during which the host calls
    /// [`TableEngine::on_create_table`] with the same token. The registry
    /// entry is cleared before this returns, on success and on error.
    pub fn create_table<F>(
        &self,
        desc: Arc<RowDescriptor>,
        factory: Arc<dyn IndexFactory>,
        space_name: Option<String>,
        exec: F,
    ) -> OspreyResult<Arc<SqlTable>>
    where
        F: FnOnce(&str) -> OspreyResult<()>,
    {
        let token = format!(
            "osprey-ddl-{}",
            self.token_seq.fetch_add(1, Ordering::Relaxed)
        );
        tracing::debug!(token = %token, table = %desc.schema().name, "registering DDL handoff");
        self.pending.insert(
            token.clone(),
            DdlHandoff {
                desc,
                factory,
                space_name,
                table: None,
            },
        );

        let run = exec(&token);
        let handoff = self.pending.remove(&token).map(|(_, h)| h);

        run?;
        handoff
            .and_then(|h| h.table)
            .ok_or_else(|| IndexingError::DdlIncomplete.into())
    }

    /// Host-engine callback, invoked exactly once per DDL execution.
    pub fn on_create_table(
        &self,
        token: &str,
        data: CreateTableData,
    ) -> OspreyResult<Arc<SqlTable>> {
        let mut handoff = self
            .pending
            .get_mut(token)
            .ok_or_else(|| IndexingError::UnknownEngineToken(token.to_string()))?;

        let table = SqlTable::new(
            data,
            Arc::clone(&handoff.desc),
            handoff.factory.as_ref(),
            handoff.space_name.clone(),
            &self.config,
        )?;
        handoff.table = Some(Arc::clone(&table));
        Ok(table)
    }

    /// Number of in-flight DDL handoffs (diagnostics).
    pub fn pending_ddl_count(&self) -> usize {
        self.pending.len()
    }
}
