use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

/// Errors surfaced by the backend query layer.
#[derive(Error, Debug)]
pub enum DbError {
    /// No usable client could be resolved from the active configuration.
    #[error("backend unavailable, check configuration: {0}")]
    Unavailable(String),

    /// The backend rejected or failed a query.
    #[error("query against '{table}' failed: {message}")]
    Query { table: String, message: String },

    /// Transport-level failure before a backend response was read.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// A row could not be decoded into the expected shape.
    #[error("row decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for DbError {
    fn from(err: reqwest::Error) -> Self {
        DbError::Http(err.to_string())
    }
}
