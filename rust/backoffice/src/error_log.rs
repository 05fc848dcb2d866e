//! Centralized error log.
//!
//! Services with a centrally-logged failure policy write a structured entry
//! to the `error_logs` table before rethrowing. The write itself is
//! best-effort: a failure to log is traced and swallowed, never allowed to
//! mask the original error.

use crate::error::ServiceError;
use chrono::Utc;
use connstore::Db;
use restdb::{DbError, Querier};
use serde_json::json;

const TABLE: &str = "error_logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
        }
    }
}

/// Optional request context attached to a log entry.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub user_id: Option<String>,
    pub trading_point_id: Option<String>,
}

pub async fn record(
    db: &Db,
    level: LogLevel,
    service: &str,
    operation: &str,
    message: &str,
    context: &ErrorContext,
) {
    let entry = json!({
        "level": level.as_str(),
        "service": service,
        "operation": operation,
        "message": message,
        "user_id": context.user_id,
        "trading_point_id": context.trading_point_id,
        "created_at": Utc::now(),
    });

    if let Err(err) = db.insert(TABLE, vec![entry]).await {
        tracing::warn!(
            service,
            operation,
            error = %err,
            "failed to write centralized error log entry"
        );
    }
}

/// Log a backend failure for a centrally-logged service, then convert it
/// into the caller-facing error.
pub(crate) async fn log_and_wrap(
    db: &Db,
    service: &str,
    operation: &str,
    err: DbError,
    context: &ErrorContext,
) -> ServiceError {
    record(
        db,
        LogLevel::Critical,
        service,
        operation,
        &err.to_string(),
        context,
    )
    .await;
    ServiceError::from(err)
}
