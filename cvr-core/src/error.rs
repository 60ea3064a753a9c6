//! Error types for the CVR ledger

use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// An active entry already exists for the (tenant, source type, source id) key.
    ///
    /// Callers that expect idempotency (lifecycle hooks) treat this as success.
    #[error("Duplicate source: {source_type} {source_id} already recorded as {existing_id}")]
    DuplicateSource {
        /// Source type code (CONTRACT, INVOICE, ...)
        source_type: String,
        /// Upstream source identifier
        source_id: Uuid,
        /// Ledger row currently holding the key
        existing_id: Uuid,
    },

    /// Illegal status change
    #[error("Invalid transition: cannot move from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Candidate source is in the wrong state for confirmation
    #[error("Not matchable: {0}")]
    NotMatchable(String),

    /// Report comparison across projects
    #[error("Cannot compare reports from different projects ({from} vs {to})")]
    CrossProjectCompare {
        /// Project of the baseline report
        from: Uuid,
        /// Project of the comparison report
        to: Uuid,
    },

    /// No budget line could be inferred for a ledger write
    #[error("Budget line unresolved: {0}")]
    BudgetLineUnresolved(String),

    /// Report is not editable in its current status
    #[error("Report {id} is {status} and can no longer be edited")]
    ReportLocked {
        /// Report ID
        id: Uuid,
        /// Current status
        status: String,
    },

    /// A report already exists for the project and period
    #[error("Report already exists for period {0}")]
    DuplicateReport(String),

    /// Frozen snapshot no longer matches its digest
    #[error("Report {0} snapshot failed digest verification")]
    CorruptSnapshot(Uuid),

    /// Entity not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind
        kind: &'static str,
        /// Requested ID
        id: Uuid,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Optimistic concurrency check lost against another writer
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl Error {
    /// Shorthand for a missing entity
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Error::NotFound { kind, id }
    }

    /// Shorthand for an illegal status change
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether this error is the expected outcome of a repeated idempotent write
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateSource { .. } | Error::DuplicateReport(_))
    }
}
