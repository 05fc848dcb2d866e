//! Fuel-station networks.

use crate::error::{Result, ServiceError};
use crate::services::{decode, decode_rows, encode, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{maybe_single, Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "networks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Active,
    Inactive,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    pub currency: String,
    pub timezone: String,
    /// Default VAT percentage applied when a price omits one.
    pub default_vat_rate: f64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            currency: "RUB".to_string(),
            timezone: "Europe/Moscow".to_string(),
            default_vat_rate: 20.0,
        }
    }
}

/// Domain record, camelCase on the wire towards the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub id: String,
    pub name: String,
    pub code: String,
    pub status: NetworkStatus,
    pub settings: NetworkSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage row, snake_case columns.
#[derive(Debug, Serialize, Deserialize)]
struct NetworkRow {
    #[serde(default)]
    id: String,
    name: String,
    code: String,
    status: NetworkStatus,
    currency: String,
    timezone: String,
    default_vat_rate: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn to_domain(row: NetworkRow) -> Network {
    Network {
        id: row.id,
        name: row.name,
        code: row.code,
        status: row.status,
        settings: NetworkSettings {
            currency: row.currency,
            timezone: row.timezone,
            default_vat_rate: row.default_vat_rate,
        },
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

#[derive(Debug, Clone)]
pub struct NewNetwork {
    pub name: String,
    pub code: String,
    pub settings: NetworkSettings,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkUpdate {
    pub name: Option<String>,
    pub status: Option<NetworkStatus>,
    pub settings: Option<NetworkSettings>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
    pub suspended: u64,
}

#[derive(Clone)]
pub struct NetworkService {
    db: Db,
}

impl NetworkService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> Result<Vec<Network>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().order("name"))
            .await?;
        Ok(decode_rows::<NetworkRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Network>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<NetworkRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn create(&self, input: NewNetwork) -> Result<Network> {
        if input.name.trim().is_empty() {
            return Err(ServiceError::Validation("network name is required".into()));
        }
        if input.code.trim().is_empty() {
            return Err(ServiceError::Validation("network code is required".into()));
        }
        if self.code_taken(&input.code, None).await? {
            return Err(ServiceError::Validation(format!(
                "network code '{}' already exists",
                input.code
            )));
        }

        let now = Utc::now();
        let row = json!({
            "name": input.name,
            "code": input.code,
            "status": "active",
            "currency": input.settings.currency,
            "timezone": input.settings.timezone,
            "default_vat_rate": input.settings.default_vat_rate,
            "created_at": now,
            "updated_at": now,
        });
        let inserted = self.db.insert(TABLE, vec![row]).await?;
        let row: NetworkRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        tracing::info!(network_id = %row.id, code = %row.code, "created network");
        Ok(to_domain(row))
    }

    pub async fn update(&self, id: &str, update: NetworkUpdate) -> Result<Option<Network>> {
        let mut patch = serde_json::Map::new();
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(ServiceError::Validation("network name is required".into()));
            }
            patch.insert("name".into(), json!(name));
        }
        if let Some(status) = update.status {
            patch.insert("status".into(), encode(&status)?);
        }
        if let Some(settings) = update.settings {
            patch.insert("currency".into(), json!(settings.currency));
            patch.insert("timezone".into(), json!(settings.timezone));
            patch.insert("default_vat_rate".into(), json!(settings.default_vat_rate));
        }
        patch.insert("updated_at".into(), json!(Utc::now()));

        let updated = self
            .db
            .update(TABLE, patch.into(), &[Filter::eq("id", id)])
            .await?;
        maybe_decode::<NetworkRow>(TABLE, updated).map(|row| row.map(to_domain))
    }

    /// Hard delete. Trading points referencing the network are not cascaded
    /// here; referential integrity is conceptual at this layer.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.db.delete(TABLE, &[Filter::eq("id", id)]).await?;
        Ok(removed > 0)
    }

    /// Free-text search over name and code.
    pub async fn search(&self, term: &str) -> Result<Vec<Network>> {
        let pattern = format!("*{}*", term.trim());
        let by_name = self
            .db
            .select(TABLE, &SelectQuery::new().ilike("name", pattern.clone()))
            .await?;
        let by_code = self
            .db
            .select(TABLE, &SelectQuery::new().ilike("code", pattern))
            .await?;

        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for row in by_name.into_iter().chain(by_code) {
            let network = to_domain(decode::<NetworkRow>(TABLE, row)?);
            if seen.insert(network.id.clone()) {
                result.push(network);
            }
        }
        Ok(result)
    }

    pub async fn statistics(&self) -> Result<NetworkStats> {
        let total = self.db.count(TABLE, &[]).await?;
        let active = self.db.count(TABLE, &[Filter::eq("status", "active")]).await?;
        let inactive = self
            .db
            .count(TABLE, &[Filter::eq("status", "inactive")])
            .await?;
        let suspended = self
            .db
            .count(TABLE, &[Filter::eq("status", "suspended")])
            .await?;
        Ok(NetworkStats {
            total,
            active,
            inactive,
            suspended,
        })
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

    fn service() -> NetworkService {
        NetworkService::new(Db::fixed(Arc::new(MemoryQuerier::new())))
    }

    #[tokio::test]
    async fn create_get_update_delete() {
        let svc = service();
        let network = svc
            .create(NewNetwork {
                name: "Nord Oil".into(),
                code: "nord".into(),
                settings: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(network.status, NetworkStatus::Active);

        let loaded = svc.get(&network.id).await.unwrap().unwrap();
        assert_eq!(loaded.code, "nord");

        let updated = svc
            .update(
                &network.id,
                NetworkUpdate {
                    status: Some(NetworkStatus::Suspended),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, NetworkStatus::Suspended);

        assert!(svc.delete(&network.id).await.unwrap());
        assert!(svc.get(&network.id).await.unwrap().is_none());
        assert!(!svc.delete(&network.id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_code_is_rejected() {
        let svc = service();
        svc.create(NewNetwork {
            name: "One".into(),
            code: "dup".into(),
            settings: Default::default(),
        })
        .await
        .unwrap();

        let err = svc
            .create(NewNetwork {
                name: "Two".into(),
                code: "dup".into(),
                settings: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn search_matches_name_and_code_without_duplicates() {
        let svc = service();
        svc.create(NewNetwork {
            name: "Nord Oil".into(),
            code: "nord".into(),
            settings: Default::default(),
        })
        .await
        .unwrap();
        svc.create(NewNetwork {
            name: "East Fuel".into(),
            code: "east".into(),
            settings: Default::default(),
        })
        .await
        .unwrap();

        let hits = svc.search("nord").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].code, "nord");
    }

    #[tokio::test]
    async fn statistics_count_by_status() {
        let svc = service();
        for code in ["a", "b"] {
            svc.create(NewNetwork {
                name: code.to_uppercase(),
                code: code.into(),
                settings: Default::default(),
            })
            .await
            .unwrap();
        }
        let stats = svc.statistics().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.suspended, 0);
    }
}
