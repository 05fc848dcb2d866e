//! Price packages: a batch of price lines applied together to one trading
//! point at a scheduled moment.

use crate::error::{Result, ServiceError};
use crate::services::prices::{NewPrice, PriceService};
use crate::services::{decode, decode_rows, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "price_packages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Draft,
    Scheduled,
    Active,
    Archived,
    Cancelled,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Draft => "draft",
            PackageStatus::Scheduled => "scheduled",
            PackageStatus::Active => "active",
            PackageStatus::Archived => "archived",
            PackageStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceLine {
    pub fuel_type_id: String,
    pub price_net: i64,
    pub vat_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePackage {
    pub id: String,
    pub trading_point_id: String,
    pub status: PackageStatus,
    pub apply_at: DateTime<Utc>,
    pub lines: Vec<PriceLine>,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PackageRow {
    #[serde(default)]
    id: String,
    trading_point_id: String,
    status: PackageStatus,
    apply_at: DateTime<Utc>,
    lines: Vec<PriceLine>,
    applied_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn to_domain(row: PackageRow) -> PricePackage {
    PricePackage {
        id: row.id,
        trading_point_id: row.trading_point_id,
        status: row.status,
        apply_at: row.apply_at,
        lines: row.lines,
        applied_at: row.applied_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

#[derive(Clone)]
pub struct PackageService {
    db: Db,
    prices: PriceService,
}

impl PackageService {
    pub fn new(db: Db) -> Self {
        let prices = PriceService::new(db.clone());
        Self { db, prices }
    }

    pub async fn get(&self, id: &str) -> Result<Option<PricePackage>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<PackageRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn list(
        &self,
        trading_point_id: Option<&str>,
        status: Option<PackageStatus>,
    ) -> Result<Vec<PricePackage>> {
        let mut query = SelectQuery::new().order_desc("apply_at");
        if let Some(point) = trading_point_id {
            query = query.eq("trading_point_id", point);
        }
        if let Some(status) = status {
            query = query.eq("status", status.as_str());
        }
        let rows = self.db.select(TABLE, &query).await?;
        Ok(decode_rows::<PackageRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn create_draft(
        &self,
        trading_point_id: &str,
        apply_at: DateTime<Utc>,
        lines: Vec<PriceLine>,
    ) -> Result<PricePackage> {
        let now = Utc::now();
        let row = json!({
            "trading_point_id": trading_point_id,
            "status": "draft",
            "apply_at": apply_at,
            "lines": lines,
            "applied_at": null,
            "created_at": now,
            "updated_at": now,
        });
        let inserted = self.db.insert(TABLE, vec![row]).await?;
        let row: PackageRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        Ok(to_domain(row))
    }

    /// Replace a draft's lines and apply time. Only drafts are editable.
    pub async fn update_draft(
        &self,
        id: &str,
        apply_at: DateTime<Utc>,
        lines: Vec<PriceLine>,
    ) -> Result<PricePackage> {
        let package = self.require(id).await?;
        if package.status != PackageStatus::Draft {
            return Err(ServiceError::Validation(
                "only draft packages can be edited".into(),
            ));
        }

        let updated = self
            .db
            .update(
                TABLE,
                json!({ "apply_at": apply_at, "lines": lines, "updated_at": Utc::now() }),
                &[Filter::eq("id", id)],
            )
            .await?;
        let row: PackageRow = decode(TABLE, restdb::single(TABLE, updated)?)?;
        Ok(to_domain(row))
    }

    /// Move a draft into the scheduled state after validating it.
    pub async fn schedule(&self, id: &str) -> Result<PricePackage> {
        let package = self.require(id).await?;
        if package.status != PackageStatus::Draft {
            return Err(ServiceError::Validation(
                "only draft packages can be scheduled".into(),
            ));
        }
        if package.lines.is_empty() {
            return Err(ServiceError::Validation(
                "a package needs at least one price line".into(),
            ));
        }
        if package.apply_at <= Utc::now() {
            return Err(ServiceError::Validation(
                "apply time must be in the future".into(),
            ));
        }

        self.set_status(id, PackageStatus::Scheduled, None).await
    }

    /// Apply a scheduled package: upsert every line as the point's new
    /// price, archive the previously active package, mark this one active.
    pub async fn apply(&self, id: &str) -> Result<PricePackage> {
        let package = self.require(id).await?;
        if package.status != PackageStatus::Scheduled {
            return Err(ServiceError::Validation(
                "only scheduled packages can be applied".into(),
            ));
        }

        for line in &package.lines {
            self.prices
                .upsert_price(NewPrice {
                    trading_point_id: package.trading_point_id.clone(),
                    fuel_type_id: line.fuel_type_id.clone(),
                    price_net: line.price_net,
                    vat_rate: line.vat_rate,
                    valid_from: None,
                })
                .await?;
        }

        // Retire whichever package was active for the point before.
        self.db
            .update(
                TABLE,
                json!({ "status": "archived", "updated_at": Utc::now() }),
                &[
                    Filter::eq("trading_point_id", package.trading_point_id.as_str()),
                    Filter::eq("status", "active"),
                ],
            )
            .await?;

        tracing::info!(package_id = %id, trading_point_id = %package.trading_point_id, "applied price package");
        self.set_status(id, PackageStatus::Active, Some(Utc::now()))
            .await
    }

    /// Cancel a package that has not been applied yet.
    pub async fn cancel(&self, id: &str) -> Result<PricePackage> {
        let package = self.require(id).await?;
        match package.status {
            PackageStatus::Draft | PackageStatus::Scheduled => {
                self.set_status(id, PackageStatus::Cancelled, None).await
            }
            _ => Err(ServiceError::Validation(
                "only draft or scheduled packages can be cancelled".into(),
            )),
        }
    }

    async fn require(&self, id: &str) -> Result<PricePackage> {
        self.get(id)
            .await?
            .ok_or_else(|| ServiceError::Validation(format!("price package '{id}' not found")))
    }

    async fn set_status(
        &self,
        id: &str,
        status: PackageStatus,
        applied_at: Option<DateTime<Utc>>,
    ) -> Result<PricePackage> {
        let mut patch = json!({ "status": status.as_str(), "updated_at": Utc::now() });
        if let Some(applied_at) = applied_at {
            patch["applied_at"] = json!(applied_at);
        }
        let updated = self
            .db
            .update(TABLE, patch, &[Filter::eq("id", id)])
            .await?;
        let row: PackageRow = decode(TABLE, restdb::single(TABLE, updated)?)?;
        Ok(to_domain(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use restdb::MemoryQuerier;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryQuerier>, PackageService) {
        let querier = Arc::new(MemoryQuerier::new());
        let svc = PackageService::new(Db::fixed(querier.clone()));
        (querier, svc)
    }

    fn lines() -> Vec<PriceLine> {
        vec![
            PriceLine {
                fuel_type_id: "ai95".into(),
                price_net: 5320,
                vat_rate: 20.0,
            },
            PriceLine {
                fuel_type_id: "diesel".into(),
                price_net: 6010,
                vat_rate: 20.0,
            },
        ]
    }

    #[tokio::test]
    async fn full_lifecycle_applies_prices() {
        let (querier, svc) = setup();
        let package = svc
            .create_draft("tp1", Utc::now() + Duration::hours(1), lines())
            .await
            .unwrap();
        assert_eq!(package.status, PackageStatus::Draft);

        let scheduled = svc.schedule(&package.id).await.unwrap();
        assert_eq!(scheduled.status, PackageStatus::Scheduled);

        let applied = svc.apply(&package.id).await.unwrap();
        assert_eq!(applied.status, PackageStatus::Active);
        assert!(applied.applied_at.is_some());

        let price_rows = querier.rows("fuel_prices");
        assert_eq!(price_rows.len(), 2);
        assert!(price_rows
            .iter()
            .all(|r| r["is_active"].as_bool() == Some(true)));
    }

    #[tokio::test]
    async fn applying_a_new_package_archives_the_previous_one() {
        let (_querier, svc) = setup();
        let first = svc
            .create_draft("tp1", Utc::now() + Duration::hours(1), lines())
            .await
            .unwrap();
        svc.schedule(&first.id).await.unwrap();
        svc.apply(&first.id).await.unwrap();

        let second = svc
            .create_draft("tp1", Utc::now() + Duration::hours(2), lines())
            .await
            .unwrap();
        svc.schedule(&second.id).await.unwrap();
        svc.apply(&second.id).await.unwrap();

        let archived = svc.get(&first.id).await.unwrap().unwrap();
        assert_eq!(archived.status, PackageStatus::Archived);
    }

    #[tokio::test]
    async fn schedule_rejects_empty_lines_and_past_apply_time() {
        let (_querier, svc) = setup();
        let empty = svc
            .create_draft("tp1", Utc::now() + Duration::hours(1), vec![])
            .await
            .unwrap();
        assert!(svc.schedule(&empty.id).await.is_err());

        let past = svc
            .create_draft("tp1", Utc::now() - Duration::hours(1), lines())
            .await
            .unwrap();
        assert!(svc.schedule(&past.id).await.is_err());
    }

    #[tokio::test]
    async fn cancelled_package_cannot_be_applied() {
        let (_querier, svc) = setup();
        let package = svc
            .create_draft("tp1", Utc::now() + Duration::hours(1), lines())
            .await
            .unwrap();
        svc.cancel(&package.id).await.unwrap();

        let err = svc.apply(&package.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        let err = svc.cancel(&package.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
