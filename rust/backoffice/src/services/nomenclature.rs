//! Fuel nomenclature: the dictionary of fuel types prices refer to.

use crate::error::{Result, ServiceError};
use crate::services::{decode, decode_rows, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{maybe_single, Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "fuel_types";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuelType {
    pub id: String,
    pub code: String,
    pub name: String,
    pub octane: Option<u32>,
    pub unit: String,
    pub is_active: bool,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FuelTypeRow {
    #[serde(default)]
    id: String,
    code: String,
    name: String,
    octane: Option<u32>,
    unit: String,
    is_active: bool,
    sort_order: i32,
    created_at: DateTime<Utc>,
}

fn to_domain(row: FuelTypeRow) -> FuelType {
    FuelType {
        id: row.id,
        code: row.code,
        name: row.name,
        octane: row.octane,
        unit: row.unit,
        is_active: row.is_active,
        sort_order: row.sort_order,
        created_at: row.created_at,
    }
}

#[derive(Debug, Clone)]
pub struct NewFuelType {
    pub code: String,
    pub name: String,
    pub octane: Option<u32>,
    pub unit: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Default)]
pub struct FuelTypeUpdate {
    pub code: Option<String>,
    pub name: Option<String>,
    pub octane: Option<Option<u32>>,
    pub unit: Option<String>,
    pub sort_order: Option<i32>,
}

#[derive(Clone)]
pub struct NomenclatureService {
    db: Db,
}

impl NomenclatureService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<FuelType>> {
        let mut query = SelectQuery::new().order("sort_order").order("code");
        if active_only {
            query = query.eq("is_active", true);
        }
        let rows = self.db.select(TABLE, &query).await?;
        Ok(decode_rows::<FuelTypeRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<FuelType>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<FuelTypeRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<FuelType>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("code", code).limit(1))
            .await?;
        maybe_decode::<FuelTypeRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn create(&self, input: NewFuelType) -> Result<FuelType> {
        if input.code.trim().is_empty() {
            return Err(ServiceError::Validation("fuel type code is required".into()));
        }
        if self.code_taken(&input.code, None).await? {
            return Err(ServiceError::Validation(format!(
                "fuel type code '{}' already exists",
                input.code
            )));
        }

        let row = json!({
            "code": input.code,
            "name": input.name,
            "octane": input.octane,
            "unit": input.unit,
            "is_active": true,
            "sort_order": input.sort_order,
            "created_at": Utc::now(),
        });
        let inserted = self.db.insert(TABLE, vec![row]).await?;
        let row: FuelTypeRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        Ok(to_domain(row))
    }

    pub async fn update(&self, id: &str, update: FuelTypeUpdate) -> Result<Option<FuelType>> {
        if let Some(ref code) = update.code {
            if code.trim().is_empty() {
                return Err(ServiceError::Validation("fuel type code is required".into()));
            }
            if self.code_taken(code, Some(id)).await? {
                return Err(ServiceError::Validation(format!(
                    "fuel type code '{code}' already exists"
                )));
            }
        }

        let mut patch = serde_json::Map::new();
        if let Some(code) = update.code {
            patch.insert("code".into(), json!(code));
        }
        if let Some(name) = update.name {
            patch.insert("name".into(), json!(name));
        }
        if let Some(octane) = update.octane {
            patch.insert("octane".into(), json!(octane));
        }
        if let Some(unit) = update.unit {
            patch.insert("unit".into(), json!(unit));
        }
        if let Some(sort_order) = update.sort_order {
            patch.insert("sort_order".into(), json!(sort_order));
        }
        if patch.is_empty() {
            return self.get(id).await;
        }

        let updated = self
            .db
            .update(TABLE, patch.into(), &[Filter::eq("id", id)])
            .await?;
        maybe_decode::<FuelTypeRow>(TABLE, updated).map(|row| row.map(to_domain))
    }

    /// Fuel types are archived, not deleted: historical prices keep
    /// referencing them.
    pub async fn archive(&self, id: &str) -> Result<bool> {
        let updated = self
            .db
            .update(TABLE, json!({ "is_active": false }), &[Filter::eq("id", id)])
            .await?;
        Ok(!updated.is_empty())
    }

    async fn code_taken(&self, code: &str, exclude_id: Option<&str>) -> Result<bool> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().columns("id").eq("code", code))
            .await?;
        Ok(match maybe_single(rows) {
            Some(row) => row.get("id").and_then(|v| v.as_str()) != exclude_id,
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restdb::MemoryQuerier;
    use std::sync::Arc;

    fn service() -> NomenclatureService {
        NomenclatureService::new(Db::fixed(Arc::new(MemoryQuerier::new())))
    }

    fn ai95() -> NewFuelType {
        NewFuelType {
            code: "ai95".into(),
            name: "AI-95".into(),
            octane: Some(95),
            unit: "liter".into(),
            sort_order: 2,
        }
    }

    #[tokio::test]
    async fn archive_hides_from_active_list() {
        let svc = service();
        let fuel = svc.create(ai95()).await.unwrap();
        assert_eq!(svc.list(true).await.unwrap().len(), 1);

        assert!(svc.archive(&fuel.id).await.unwrap());
        assert!(svc.list(true).await.unwrap().is_empty());
        assert_eq!(svc.list(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_code_is_rejected() {
        let svc = service();
        svc.create(ai95()).await.unwrap();
        let err = svc.create(ai95()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn update_changes_fields() {
        let svc = service();
        let fuel = svc.create(ai95()).await.unwrap();

        let updated = svc
            .update(
                &fuel.id,
                FuelTypeUpdate {
                    name: Some("AI-95 Premium".into()),
                    sort_order: Some(1),
                    ..FuelTypeUpdate::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "AI-95 Premium");
        assert_eq!(updated.sort_order, 1);
        assert_eq!(updated.code, "ai95");
    }

    #[tokio::test]
    async fn update_rejects_code_taken_by_another_fuel_type() {
        let svc = service();
        svc.create(ai95()).await.unwrap();
        let diesel = svc
            .create(NewFuelType {
                code: "dt".into(),
                name: "Diesel".into(),
                octane: None,
                unit: "liter".into(),
                sort_order: 5,
            })
            .await
            .unwrap();

        let err = svc
            .update(
                &diesel.id,
                FuelTypeUpdate {
                    code: Some("ai95".into()),
                    ..FuelTypeUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        // Re-submitting its own code is not a conflict.
        let same = svc
            .update(
                &diesel.id,
                FuelTypeUpdate {
                    code: Some("dt".into()),
                    ..FuelTypeUpdate::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(same.code, "dt");
    }

    #[tokio::test]
    async fn find_by_code() {
        let svc = service();
        svc.create(ai95()).await.unwrap();
        assert!(svc.find_by_code("ai95").await.unwrap().is_some());
        assert!(svc.find_by_code("ai98").await.unwrap().is_none());
    }
}
