use crate::error::{DbError, Result};
use crate::query::{Filter, SelectQuery};
use async_trait::async_trait;
use serde_json::Value;

/// Narrow interface over the backend's row API: services only ever need
/// these five operations. `update` returns the rows it touched so callers
/// can detect a zero-row update, which is how optimistic version checks are
/// enforced at the storage layer rather than as a read-then-write in
/// application code.
#[async_trait]
pub trait Querier: Send + Sync {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>>;

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>>;

    async fn update(&self, table: &str, patch: Value, filters: &[Filter]) -> Result<Vec<Value>>;

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64>;

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64>;
}

/// Take the first row of a result set, `None` when the set is empty.
/// Absent-vs-failed stays distinguishable: lookups return `Ok(None)`, never
/// an error.
pub fn maybe_single(mut rows: Vec<Value>) -> Option<Value> {
    if rows.is_empty() {
        None
    } else {
        Some(rows.swap_remove(0))
    }
}

/// Expect exactly one row, e.g. after an insert with representation.
pub fn single(table: &str, rows: Vec<Value>) -> Result<Value> {
    let mut rows = rows;
    match rows.len() {
        1 => Ok(rows.swap_remove(0)),
        n => Err(DbError::Query {
            table: table.to_string(),
            message: format!("expected exactly one row, got {n}"),
        }),
    }
}
