//! Trading points (stations) belonging to a network.

use crate::error::{Result, ServiceError};
use crate::services::{decode, decode_rows, encode, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "trading_points";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    Active,
    Inactive,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    FuelStation,
    GasStation,
    TruckStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingPoint {
    pub id: String,
    pub network_id: String,
    pub name: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub point_type: PointType,
    pub status: PointStatus,
    pub schedule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TradingPointRow {
    #[serde(default)]
    id: String,
    network_id: String,
    name: String,
    address: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    point_type: PointType,
    status: PointStatus,
    schedule: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn to_domain(row: TradingPointRow) -> TradingPoint {
    TradingPoint {
        id: row.id,
        network_id: row.network_id,
        name: row.name,
        address: row.address,
        latitude: row.latitude,
        longitude: row.longitude,
        point_type: row.point_type,
        status: row.status,
        schedule: row.schedule,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

#[derive(Debug, Clone)]
pub struct NewTradingPoint {
    pub network_id: String,
    pub name: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub point_type: PointType,
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TradingPointUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub status: Option<PointStatus>,
    pub schedule: Option<Option<String>>,
}

#[derive(Clone)]
pub struct TradingPointService {
    db: Db,
}

impl TradingPointService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// List trading points, optionally scoped to one network.
    pub async fn list(&self, network_id: Option<&str>) -> Result<Vec<TradingPoint>> {
        let mut query = SelectQuery::new().order("name");
        if let Some(network_id) = network_id {
            query = query.eq("network_id", network_id);
        }
        let rows = self.db.select(TABLE, &query).await?;
        Ok(decode_rows::<TradingPointRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<TradingPoint>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<TradingPointRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn create(&self, input: NewTradingPoint) -> Result<TradingPoint> {
        if input.name.trim().is_empty() {
            return Err(ServiceError::Validation(
                "trading point name is required".into(),
            ));
        }
        if input.network_id.trim().is_empty() {
            return Err(ServiceError::Validation("network id is required".into()));
        }

        let now = Utc::now();
        let row = json!({
            "network_id": input.network_id,
            "name": input.name,
            "address": input.address,
            "latitude": input.latitude,
            "longitude": input.longitude,
            "point_type": encode(&input.point_type)?,
            "status": "active",
            "schedule": input.schedule,
            "created_at": now,
            "updated_at": now,
        });
        let inserted = self.db.insert(TABLE, vec![row]).await?;
        let row: TradingPointRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        tracing::info!(trading_point_id = %row.id, network_id = %row.network_id, "created trading point");
        Ok(to_domain(row))
    }

    pub async fn update(&self, id: &str, update: TradingPointUpdate) -> Result<Option<TradingPoint>> {
        let mut patch = serde_json::Map::new();
        if let Some(name) = update.name {
            patch.insert("name".into(), json!(name));
        }
        if let Some(address) = update.address {
            patch.insert("address".into(), json!(address));
        }
        if let Some(status) = update.status {
            patch.insert("status".into(), encode(&status)?);
        }
        if let Some(schedule) = update.schedule {
            patch.insert("schedule".into(), json!(schedule));
        }
        patch.insert("updated_at".into(), json!(Utc::now()));

        let updated = self
            .db
            .update(TABLE, patch.into(), &[Filter::eq("id", id)])
            .await?;
        maybe_decode::<TradingPointRow>(TABLE, updated).map(|row| row.map(to_domain))
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.db.delete(TABLE, &[Filter::eq("id", id)]).await?;
        Ok(removed > 0)
    }

    /// Free-text search over name and address.
    pub async fn search(&self, term: &str) -> Result<Vec<TradingPoint>> {
        let pattern = format!("*{}*", term.trim());
        let by_name = self
            .db
            .select(TABLE, &SelectQuery::new().ilike("name", pattern.clone()))
            .await?;
        let by_address = self
            .db
            .select(TABLE, &SelectQuery::new().ilike("address", pattern))
            .await?;

        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for row in by_name.into_iter().chain(by_address) {
            let point = to_domain(decode::<TradingPointRow>(TABLE, row)?);
            if seen.insert(point.id.clone()) {
                result.push(point);
            }
        }
        Ok(result)
    }

    pub async fn count_by_network(&self, network_id: &str) -> Result<u64> {
        Ok(self
            .db
            .count(TABLE, &[Filter::eq("network_id", network_id)])
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restdb::MemoryQuerier;
    use std::sync::Arc;

    fn service() -> TradingPointService {
        TradingPointService::new(Db::fixed(Arc::new(MemoryQuerier::new())))
    }

    fn input(network_id: &str, name: &str) -> NewTradingPoint {
        NewTradingPoint {
            network_id: network_id.into(),
            name: name.into(),
            address: format!("{name} street 1"),
            latitude: Some(55.75),
            longitude: Some(37.61),
            point_type: PointType::FuelStation,
            schedule: Some("24/7".into()),
        }
    }

    #[tokio::test]
    async fn list_scopes_to_network() {
        let svc = service();
        svc.create(input("n1", "Alpha")).await.unwrap();
        svc.create(input("n1", "Beta")).await.unwrap();
        svc.create(input("n2", "Gamma")).await.unwrap();

        assert_eq!(svc.list(Some("n1")).await.unwrap().len(), 2);
        assert_eq!(svc.list(None).await.unwrap().len(), 3);
        assert_eq!(svc.count_by_network("n2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_and_status_change() {
        let svc = service();
        let point = svc.create(input("n1", "Alpha")).await.unwrap();
        let updated = svc
            .update(
                &point.id,
                TradingPointUpdate {
                    status: Some(PointStatus::Maintenance),
                    schedule: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, PointStatus::Maintenance);
        assert!(updated.schedule.is_none());
    }

    #[tokio::test]
    async fn missing_name_is_validation_error() {
        let svc = service();
        let err = svc.create(input("n1", "  ")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
