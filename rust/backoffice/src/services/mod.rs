//! Domain services: one module per entity, each pairing a storage-row shape
//! with a camelCase-serialized domain record and exposing CRUD-style async
//! methods over the [`connstore::Db`] facade.

pub mod component_status;
pub mod legal;
pub mod messages;
pub mod networks;
pub mod nomenclature;
pub mod packages;
pub mod prices;
pub mod roles;
pub mod shift_reports;
pub mod telegram;
pub mod trading_points;
pub mod users;
pub mod workflows;

use crate::error::{Result, ServiceError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub(crate) fn decode<T: DeserializeOwned>(table: &str, row: Value) -> Result<T> {
    serde_json::from_value(row)
        .map_err(|e| ServiceError::Database(format!("bad row from '{table}': {e}")))
}

pub(crate) fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter().map(|row| decode(table, row)).collect()
}

/// Decode the first row of a result set, `None` when the set is empty.
pub(crate) fn maybe_decode<T: DeserializeOwned>(table: &str, rows: Vec<Value>) -> Result<Option<T>> {
    match restdb::maybe_single(rows) {
        Some(row) => decode(table, row).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| ServiceError::Database(format!("row serialization failed: {e}")))
}
