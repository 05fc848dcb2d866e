//! Fuel prices per trading point.
//!
//! The active-price invariant, at most one active row per
//! (trading point, fuel type) pair, is maintained procedurally: an upsert
//! deactivates the previously active rows for the pair, then inserts the new
//! one. The backend's row API has no transaction spanning the two steps, so
//! a reader racing between them can briefly observe zero active prices; the
//! invariant holds once the sequence completes.
//!
//! Gross prices are computed at write time and never recomputed on read, so
//! historical rows keep their gross even if VAT defaults change later.

use crate::error::{Result, ServiceError};
use crate::error_log::{log_and_wrap, ErrorContext};
use crate::services::{decode, decode_rows, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "fuel_prices";
const SERVICE: &str = "prices";

/// `gross = round(net * (1 + vat/100))`, prices in kopecks.
pub fn gross_price(price_net: i64, vat_rate: f64) -> i64 {
    (price_net as f64 * (1.0 + vat_rate / 100.0)).round() as i64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuelPrice {
    pub id: String,
    pub trading_point_id: String,
    pub fuel_type_id: String,
    /// Net price in kopecks.
    pub price_net: i64,
    /// VAT percentage.
    pub vat_rate: f64,
    /// Gross price in kopecks, fixed at write time.
    pub price_gross: i64,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FuelPriceRow {
    #[serde(default)]
    id: String,
    trading_point_id: String,
    fuel_type_id: String,
    price_net: i64,
    vat_rate: f64,
    price_gross: i64,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

fn to_domain(row: FuelPriceRow) -> FuelPrice {
    FuelPrice {
        id: row.id,
        trading_point_id: row.trading_point_id,
        fuel_type_id: row.fuel_type_id,
        price_net: row.price_net,
        vat_rate: row.vat_rate,
        price_gross: row.price_gross,
        valid_from: row.valid_from,
        valid_to: row.valid_to,
        is_active: row.is_active,
        created_at: row.created_at,
    }
}

#[derive(Debug, Clone)]
pub struct NewPrice {
    pub trading_point_id: String,
    pub fuel_type_id: String,
    pub price_net: i64,
    pub vat_rate: f64,
    pub valid_from: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PriceService {
    db: Db,
}

impl PriceService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Currently active prices at a trading point.
    pub async fn active_prices(&self, trading_point_id: &str) -> Result<Vec<FuelPrice>> {
        let rows = self
            .db
            .select(
                TABLE,
                &SelectQuery::new()
                    .eq("trading_point_id", trading_point_id)
                    .eq("is_active", true)
                    .order("fuel_type_id"),
            )
            .await?;
        Ok(decode_rows::<FuelPriceRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    /// Price history for one fuel at one point, newest first.
    pub async fn price_history(
        &self,
        trading_point_id: &str,
        fuel_type_id: &str,
        limit: u64,
    ) -> Result<Vec<FuelPrice>> {
        let rows = self
            .db
            .select(
                TABLE,
                &SelectQuery::new()
                    .eq("trading_point_id", trading_point_id)
                    .eq("fuel_type_id", fuel_type_id)
                    .order_desc("valid_from")
                    .limit(limit),
            )
            .await?;
        Ok(decode_rows::<FuelPriceRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<FuelPrice>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<FuelPriceRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    /// Set a new price for a (trading point, fuel type) pair: the previously
    /// active rows are deactivated, then the new active row is inserted.
    pub async fn upsert_price(&self, input: NewPrice) -> Result<FuelPrice> {
        if input.price_net <= 0 {
            return Err(ServiceError::Validation("net price must be positive".into()));
        }
        if input.vat_rate < 0.0 {
            return Err(ServiceError::Validation("VAT rate cannot be negative".into()));
        }

        let now = Utc::now();
        let context = ErrorContext {
            trading_point_id: Some(input.trading_point_id.clone()),
            ..Default::default()
        };

        // Step 1: close out the currently active rows for the pair.
        let deactivated = self
            .db
            .update(
                TABLE,
                json!({ "is_active": false, "valid_to": now }),
                &[
                    Filter::eq("trading_point_id", input.trading_point_id.as_str()),
                    Filter::eq("fuel_type_id", input.fuel_type_id.as_str()),
                    Filter::eq("is_active", true),
                ],
            )
            .await;
        if let Err(e) = deactivated {
            return Err(log_and_wrap(&self.db, SERVICE, "upsert_price", e, &context).await);
        }

        // Step 2: insert the replacement.
        let price_gross = gross_price(input.price_net, input.vat_rate);
        let row = json!({
            "trading_point_id": input.trading_point_id,
            "fuel_type_id": input.fuel_type_id,
            "price_net": input.price_net,
            "vat_rate": input.vat_rate,
            "price_gross": price_gross,
            "valid_from": input.valid_from.unwrap_or(now),
            "valid_to": null,
            "is_active": true,
            "created_at": now,
        });
        let inserted = match self.db.insert(TABLE, vec![row]).await {
            Ok(rows) => rows,
            Err(e) => {
                return Err(log_and_wrap(&self.db, SERVICE, "upsert_price", e, &context).await)
            }
        };

        let row: FuelPriceRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        tracing::info!(
            trading_point_id = %row.trading_point_id,
            fuel_type_id = %row.fuel_type_id,
            price_gross = row.price_gross,
            "price updated"
        );
        Ok(to_domain(row))
    }

    pub async fn deactivate(&self, id: &str) -> Result<bool> {
        let updated = self
            .db
            .update(
                TABLE,
                json!({ "is_active": false, "valid_to": Utc::now() }),
                &[Filter::eq("id", id)],
            )
            .await?;
        Ok(!updated.is_empty())
    }

    /// Hard delete of a historical row.
    pub async fn delete_price(&self, id: &str) -> Result<bool> {
        let removed = self.db.delete(TABLE, &[Filter::eq("id", id)]).await?;
        Ok(removed > 0)
    }
}
