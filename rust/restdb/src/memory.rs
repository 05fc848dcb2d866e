//! In-memory [`Querier`] used by tests.
//!
//! This is a test double for the service layer, not a runtime connection
//! type; the connection layer still refuses to resolve anything but the
//! hosted backend. It evaluates the same filter, ordering and pagination
//! semantics the HTTP client sends over the wire.

use crate::error::{DbError, Result};
use crate::query::{Direction, Filter, FilterOp, SelectQuery};
use crate::querier::Querier;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct MemoryQuerier {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    write_failures: RwLock<HashSet<String>>,
}

impl MemoryQuerier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table with rows. Rows without an `id` get one assigned.
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut tables = self.tables.write();
        let stored = tables.entry(table.to_string()).or_default();
        for mut row in rows {
            ensure_id(&mut row);
            stored.push(row);
        }
    }

    /// Snapshot of a table's rows, for assertions.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    /// Make every insert/update/delete on `table` fail until cleared.
    /// Reads and other tables keep working, which lets tests drive the
    /// log-then-rethrow failure paths in the service layer.
    pub fn fail_writes(&self, table: &str) {
        self.write_failures.write().insert(table.to_string());
    }

    pub fn clear_write_failures(&self) {
        self.write_failures.write().clear();
    }

    fn check_write(&self, table: &str) -> Result<()> {
        if self.write_failures.read().contains(table) {
            return Err(DbError::Query {
                table: table.to_string(),
                message: "simulated write failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Querier for MemoryQuerier {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>> {
        let tables = self.tables.read();
        let mut rows: Vec<Value> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_all(row, &query.filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for (column, direction) in query.order.iter().rev() {
            rows.sort_by(|a, b| {
                let ordering = compare(
                    a.get(column).unwrap_or(&Value::Null),
                    b.get(column).unwrap_or(&Value::Null),
                )
                .unwrap_or(Ordering::Equal);
                match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            });
        }

        let offset = query.offset.unwrap_or(0) as usize;
        let rows: Vec<Value> = rows.into_iter().skip(offset).collect();
        match query.limit {
            Some(limit) => Ok(rows.into_iter().take(limit as usize).collect()),
            None => Ok(rows),
        }
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>> {
        self.check_write(table)?;
        let mut tables = self.tables.write();
        let stored = tables.entry(table.to_string()).or_default();
        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            ensure_id(&mut row);
            stored.push(row.clone());
            inserted.push(row);
        }
        Ok(inserted)
    }

    async fn update(&self, table: &str, patch: Value, filters: &[Filter]) -> Result<Vec<Value>> {
        self.check_write(table)?;
        let mut tables = self.tables.write();
        let mut updated = Vec::new();
        if let Some(rows) = tables.get_mut(table) {
            for row in rows.iter_mut() {
                if matches_all(row, filters) {
                    merge(row, &patch);
                    updated.push(row.clone());
                }
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64> {
        self.check_write(table)?;
        let mut tables = self.tables.write();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !matches_all(row, filters));
        Ok((before - rows.len()) as u64)
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64> {
        let tables = self.tables.read();
        let count = tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| matches_all(row, filters)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }
}

fn ensure_id(row: &mut Value) {
    if let Value::Object(map) = row {
        let missing = !matches!(map.get("id"), Some(Value::String(s)) if !s.is_empty());
        if missing {
            map.insert(
                "id".to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
    }
}

fn merge(row: &mut Value, patch: &Value) {
    if let (Value::Object(row), Value::Object(patch)) = (row, patch) {
        for (key, value) in patch {
            row.insert(key.clone(), value.clone());
        }
    }
}

fn matches_all(row: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| matches_one(row, filter))
}

fn matches_one(row: &Value, filter: &Filter) -> bool {
    let field = row.get(&filter.column).unwrap_or(&Value::Null);
    match filter.op {
        FilterOp::Eq => json_eq(field, &filter.value),
        FilterOp::Neq => !json_eq(field, &filter.value),
        FilterOp::Gte => matches!(
            compare(field, &filter.value),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        FilterOp::Lte => matches!(
            compare(field, &filter.value),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        FilterOp::Ilike => match (field.as_str(), filter.value.as_str()) {
            (Some(text), Some(pattern)) => ilike_match(text, pattern),
            _ => false,
        },
        FilterOp::In => match &filter.value {
            Value::Array(values) => values.iter().any(|value| json_eq(field, value)),
            _ => false,
        },
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Case-insensitive match with `*` wildcards, mirroring the backend's
/// `ilike` after the `%`→`*` translation.
fn ilike_match(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    if !pattern.contains('*') {
        return text == pattern;
    }

    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let segments: Vec<&str> = pattern.split('*').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return true;
    }

    let mut pos = 0;
    for (index, segment) in segments.iter().enumerate() {
        match text[pos..].find(segment) {
            Some(found) => {
                if index == 0 && anchored_start && found != 0 {
                    return false;
                }
                pos += found + segment.len();
            }
            None => return false,
        }
    }
    if anchored_end {
        return text.ends_with(segments[segments.len() - 1]);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> MemoryQuerier {
        let db = MemoryQuerier::new();
        db.seed(
            "networks",
            vec![
                json!({"id": "n1", "name": "Nord Oil", "status": "active", "points": 12}),
                json!({"id": "n2", "name": "East Fuel", "status": "inactive", "points": 4}),
                json!({"id": "n3", "name": "Nordic Gas", "status": "active", "points": 7}),
            ],
        );
        db
    }

    #[tokio::test]
    async fn eq_filter_and_order() {
        let db = sample();
        let rows = db
            .select(
                "networks",
                &SelectQuery::new().eq("status", "active").order_desc("points"),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["n1", "n3"]);
    }

    #[tokio::test]
    async fn ilike_is_case_insensitive_contains() {
        let db = sample();
        let rows = db
            .select("networks", &SelectQuery::new().ilike("name", "*nord*"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let anchored = db
            .select("networks", &SelectQuery::new().ilike("name", "nord*"))
            .await
            .unwrap();
        assert_eq!(anchored.len(), 2);

        let exact = db
            .select("networks", &SelectQuery::new().ilike("name", "east fuel"))
            .await
            .unwrap();
        assert_eq!(exact.len(), 1);
    }

    #[tokio::test]
    async fn range_applies_offset_then_limit() {
        let db = sample();
        let rows = db
            .select("networks", &SelectQuery::new().order("id").range(1, 2))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["n2", "n3"]);
    }

    #[tokio::test]
    async fn update_returns_touched_rows_only() {
        let db = sample();
        let updated = db
            .update(
                "networks",
                json!({"status": "suspended"}),
                &[Filter::eq("status", "inactive")],
            )
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["id"], "n2");
        assert_eq!(updated[0]["status"], "suspended");

        let none = db
            .update(
                "networks",
                json!({"status": "x"}),
                &[Filter::eq("id", "missing")],
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn injected_write_failures_hit_one_table_only() {
        let db = sample();
        db.fail_writes("networks");

        let err = db
            .update("networks", json!({"status": "x"}), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("simulated write failure"));

        // Reads and other tables are unaffected.
        assert_eq!(db.count("networks", &[]).await.unwrap(), 3);
        db.insert("error_logs", vec![json!({"level": "critical"})])
            .await
            .unwrap();

        db.clear_write_failures();
        db.update("networks", json!({"status": "x"}), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_delete_counts() {
        let db = MemoryQuerier::new();
        let inserted = db
            .insert("fuel_types", vec![json!({"code": "ai95"})])
            .await
            .unwrap();
        assert!(inserted[0]["id"].as_str().is_some());

        let removed = db
            .delete("fuel_types", &[Filter::eq("code", "ai95")])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.count("fuel_types", &[]).await.unwrap(), 0);
    }
}
