use restdb::DbError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced by the service layer.
///
/// Not-found is deliberately absent: lookups return `Option`/`bool` so
/// callers can distinguish "absent" from "failed". Validation errors are
/// meant to reach the caller as-is; database errors wrap the backend's
/// message.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Connection-layer failure: no active connection, unsupported
    /// connection type, unusable credentials. Fatal to the operation;
    /// there is no degraded mode.
    #[error("configuration error: {0}")]
    Config(String),

    /// The backend failed or rejected a query.
    #[error("Database unavailable: {0}")]
    Database(String),

    /// A business rule rejected the input. Never logged centrally; the
    /// caller is expected to display it.
    #[error("{0}")]
    Validation(String),

    /// Optimistic-concurrency conflict: the record changed since it was
    /// read. The caller should refresh and retry.
    #[error("{0} was modified concurrently, refresh and retry")]
    Conflict(String),
}

impl From<DbError> for ServiceError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Unavailable(_) => ServiceError::Config(err.to_string()),
            other => ServiceError::Database(other.to_string()),
        }
    }
}
