//! Query sessions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::table::SqlTable;

/// Identifier of a query session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// A SQL query session. Carries the list of tables it holds snapshot locks
/// on, so the host engine can reach every locked table during unlock. The
/// list is a pure registration sink; it is never contended across the table
/// lock boundary.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    tables: Mutex<Vec<Arc<SqlTable>>>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            tables: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Called by `SqlTable::lock` when this session first locks a table.
    pub(crate) fn add_lock(&self, table: Arc<SqlTable>) {
        self.tables.lock().push(table);
    }

    /// Tables currently registered on this session.
    pub fn locked_tables(&self) -> Vec<Arc<SqlTable>> {
        self.tables.lock().clone()
    }

    /// Release every table lock this session holds, in registration order.
    pub fn unlock_all(&self) {
        let tables: Vec<_> = self.tables.lock().drain(..).collect();
        for table in tables {
            table.unlock(Some(self));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_roundtrip() {
        let ses = Session::new(SessionId(7));
        assert_eq!(ses.id(), SessionId(7));
        assert!(ses.locked_tables().is_empty());
    }
}
