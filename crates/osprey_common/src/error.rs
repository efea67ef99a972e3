use thiserror::Error;

/// Convenience alias for `Result<T, OspreyError>`.
pub type OspreyResult<T> = Result<T, OspreyError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input or constraint violation; the caller can react
/// - `Transient`   — timeout/shutdown; the caller may retry after back-off
/// - `InternalBug` — should never happen; triggers alert + diagnostic dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum OspreyError {
    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// SQL indexing subsystem errors.
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Unique-constraint violation during a multi-index insert. Raised only
    /// after every already-updated index has been rolled back, so the cache
    /// layer can keep the previous entry.
    #[error("Failed to update index [index={index}, key={key}]")]
    IndexUpdateFailed { index: String, key: String },

    /// The table was closed while the caller was waiting for the index
    /// write lock. Terminates the caller's query; no lock is leaked.
    #[error("Table closed while waiting for index write lock")]
    TableClosed,

    /// Schema-mutating DDL is not supported on cache-backed tables.
    #[error("Unsupported DDL operation: {0}")]
    UnsupportedDdl(&'static str),

    /// The host engine invoked the DDL callback with a token that has no
    /// registered handoff context.
    #[error("Unknown table engine token: {0}")]
    UnknownEngineToken(String),

    /// DDL executed but the host engine never called back to create the
    /// table.
    #[error("DDL completed without creating a table")]
    DdlIncomplete,
}

impl OspreyError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OspreyError::Indexing(IndexingError::IndexUpdateFailed { .. }) => ErrorKind::UserError,
            OspreyError::Indexing(IndexingError::UnsupportedDdl(_)) => ErrorKind::UserError,
            OspreyError::Indexing(IndexingError::TableClosed) => ErrorKind::Transient,
            OspreyError::Indexing(IndexingError::UnknownEngineToken(_)) => ErrorKind::InternalBug,
            OspreyError::Indexing(IndexingError::DdlIncomplete) => ErrorKind::InternalBug,
            OspreyError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// Emit a structured log entry for internal bugs. Must be called before
    /// surfacing such an error to the host; log format is stable across
    /// patch versions.
    pub fn log_if_internal_bug(&self) {
        if self.is_internal_bug() {
            tracing::error!(error_category = "InternalBug", "FATAL: {self}");
        }
    }
}
