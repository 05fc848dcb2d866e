//! Shift reports: per-point operating shifts with fuel reconciliation.
//!
//! Shift numbers are sequential per trading point, and a report only moves
//! forward through its lifecycle: draft -> closed -> synchronized ->
//! archived. Closing a shift reconciles each fuel position against its tank
//! measurement and pump meters, and records the payment breakdown.

use crate::error::{Result, ServiceError};
use crate::error_log::{log_and_wrap, record, ErrorContext, LogLevel};
use crate::services::{decode, decode_rows, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "shift_reports";
const SERVICE: &str = "shift_reports";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    Draft,
    Closed,
    Synchronized,
    Archived,
}

impl ShiftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftStatus::Draft => "draft",
            ShiftStatus::Closed => "closed",
            ShiftStatus::Synchronized => "synchronized",
            ShiftStatus::Archived => "archived",
        }
    }

    fn successor(&self) -> Option<ShiftStatus> {
        match self {
            ShiftStatus::Draft => Some(ShiftStatus::Closed),
            ShiftStatus::Closed => Some(ShiftStatus::Synchronized),
            ShiftStatus::Synchronized => Some(ShiftStatus::Archived),
            ShiftStatus::Archived => None,
        }
    }
}

/// One tank's fuel movement over the shift. Volumes in liters, meters are
/// cumulative pump counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuelPosition {
    pub tank_id: String,
    pub fuel_type_id: String,
    pub start_volume: f64,
    pub received_volume: f64,
    pub dispensed_volume: f64,
    pub measured_end_volume: Option<f64>,
    pub meter_start: f64,
    pub meter_end: Option<f64>,
    /// Acceptable absolute difference between book and measured stock.
    pub allowed_error: f64,
}

impl FuelPosition {
    /// Book stock at shift end: start + received - dispensed.
    pub fn calculated_end(&self) -> f64 {
        self.start_volume + self.received_volume - self.dispensed_volume
    }

    pub fn variance(&self) -> Option<f64> {
        self.measured_end_volume
            .map(|measured| measured - self.calculated_end())
    }

    pub fn within_tolerance(&self) -> bool {
        match self.variance() {
            Some(variance) => variance.abs() <= self.allowed_error,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    FuelCard,
}

/// One payment-method subtotal for the shift, in kopecks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub method: PaymentMethod,
    pub amount: i64,
}

/// Reference to a scanned document attached to the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDocument {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftReport {
    pub id: String,
    pub trading_point_id: String,
    pub shift_number: i64,
    pub status: ShiftStatus,
    pub operator_id: String,
    pub positions: Vec<FuelPosition>,
    pub payments: Vec<Payment>,
    pub documents: Vec<AttachedDocument>,
    pub total_dispensed: f64,
    /// Sum of the payment breakdown, in kopecks.
    pub total_sales: i64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ShiftRow {
    #[serde(default)]
    id: String,
    trading_point_id: String,
    shift_number: i64,
    status: ShiftStatus,
    operator_id: String,
    positions: Vec<FuelPosition>,
    #[serde(default)]
    payments: Vec<Payment>,
    #[serde(default)]
    documents: Vec<AttachedDocument>,
    total_dispensed: f64,
    #[serde(default)]
    total_sales: i64,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

fn to_domain(row: ShiftRow) -> ShiftReport {
    ShiftReport {
        id: row.id,
        trading_point_id: row.trading_point_id,
        shift_number: row.shift_number,
        status: row.status,
        operator_id: row.operator_id,
        positions: row.positions,
        payments: row.payments,
        documents: row.documents,
        total_dispensed: row.total_dispensed,
        total_sales: row.total_sales,
        opened_at: row.opened_at,
        closed_at: row.closed_at,
        updated_at: row.updated_at,
    }
}

/// Closing figures for one tank, supplied at close time.
#[derive(Debug, Clone)]
pub struct PositionClose {
    pub tank_id: String,
    pub dispensed_volume: f64,
    pub measured_end_volume: f64,
    pub meter_end: f64,
}

/// Filter for listing shift reports at a trading point.
#[derive(Debug, Clone, Default)]
pub struct ShiftQuery {
    pub status: Option<ShiftStatus>,
    pub opened_from: Option<DateTime<Utc>>,
    pub opened_to: Option<DateTime<Utc>>,
}

/// Fields a draft report accepts changes to before it is closed.
#[derive(Debug, Clone, Default)]
pub struct DraftUpdate {
    pub operator_id: Option<String>,
    pub positions: Option<Vec<FuelPosition>>,
    pub documents: Option<Vec<AttachedDocument>>,
}

#[derive(Clone)]
pub struct ShiftReportService {
    db: Db,
}

impl ShiftReportService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> Result<Option<ShiftReport>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<ShiftRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn list(&self, trading_point_id: &str, filter: ShiftQuery) -> Result<Vec<ShiftReport>> {
        let mut query = SelectQuery::new()
            .eq("trading_point_id", trading_point_id)
            .order_desc("shift_number");
        if let Some(status) = filter.status {
            query = query.eq("status", status.as_str());
        }
        if let Some(from) = filter.opened_from {
            query = query.gte("opened_at", json!(from));
        }
        if let Some(to) = filter.opened_to {
            query = query.lte("opened_at", json!(to));
        }
        let rows = self.db.select(TABLE, &query).await?;
        Ok(decode_rows::<ShiftRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    /// Open the next shift at a trading point. The shift number continues
    /// the point's sequence, and a point can have only one open draft.
    pub async fn open_shift(
        &self,
        trading_point_id: &str,
        operator_id: &str,
        positions: Vec<FuelPosition>,
    ) -> Result<ShiftReport> {
        let latest = self
            .db
            .select(
                TABLE,
                &SelectQuery::new()
                    .eq("trading_point_id", trading_point_id)
                    .order_desc("shift_number")
                    .limit(1),
            )
            .await?;
        let latest = maybe_decode::<ShiftRow>(TABLE, latest)?;
        if let Some(ref previous) = latest {
            if previous.status == ShiftStatus::Draft {
                return Err(ServiceError::Validation(format!(
                    "shift {} is still open at this trading point",
                    previous.shift_number
                )));
            }
        }
        let shift_number = latest.map(|row| row.shift_number + 1).unwrap_or(1);

        let now = Utc::now();
        let row = json!({
            "trading_point_id": trading_point_id,
            "shift_number": shift_number,
            "status": "draft",
            "operator_id": operator_id,
            "positions": positions,
            "payments": [],
            "documents": [],
            "total_dispensed": 0.0,
            "total_sales": 0,
            "opened_at": now,
            "closed_at": null,
            "updated_at": now,
        });
        let context = point_context(trading_point_id);
        let inserted = match self.db.insert(TABLE, vec![row]).await {
            Ok(rows) => rows,
            Err(e) => {
                return Err(log_and_wrap(&self.db, SERVICE, "open_shift", e, &context).await)
            }
        };
        let row: ShiftRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        tracing::info!(trading_point_id, shift_number, "shift opened");
        Ok(to_domain(row))
    }

    /// Amend a draft before it is closed. Closed reports are immutable
    /// outside the lifecycle transitions.
    pub async fn update_draft(&self, id: &str, update: DraftUpdate) -> Result<ShiftReport> {
        let report = self.require(id).await?;
        if report.status != ShiftStatus::Draft {
            return Err(ServiceError::Validation(
                "only draft shifts can be edited".into(),
            ));
        }

        let mut patch = serde_json::Map::new();
        if let Some(operator_id) = update.operator_id {
            patch.insert("operator_id".into(), json!(operator_id));
        }
        if let Some(positions) = update.positions {
            patch.insert("positions".into(), json!(positions));
        }
        if let Some(documents) = update.documents {
            patch.insert("documents".into(), json!(documents));
        }
        patch.insert("updated_at".into(), json!(Utc::now()));

        let context = point_context(&report.trading_point_id);
        let updated = match self
            .db
            .update(
                TABLE,
                patch.into(),
                &[Filter::eq("id", id), Filter::eq("status", "draft")],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                return Err(log_and_wrap(&self.db, SERVICE, "update_draft", e, &context).await)
            }
        };
        let row: ShiftRow = decode(TABLE, restdb::single(TABLE, updated)?)?;
        Ok(to_domain(row))
    }

    /// Close a draft shift: fold in the closing figures, validate the pump
    /// meters and reconcile every position. Out-of-tolerance positions do
    /// not block the close but are logged for review.
    pub async fn close_shift(
        &self,
        id: &str,
        closes: Vec<PositionClose>,
        payments: Vec<Payment>,
    ) -> Result<ShiftReport> {
        let report = self.require(id).await?;
        if report.status != ShiftStatus::Draft {
            return Err(ServiceError::Validation(
                "only draft shifts can be closed".into(),
            ));
        }

        let mut positions = report.positions.clone();
        for close in &closes {
            let Some(position) = positions.iter_mut().find(|p| p.tank_id == close.tank_id)
            else {
                return Err(ServiceError::Validation(format!(
                    "shift has no position for tank '{}'",
                    close.tank_id
                )));
            };
            if close.meter_end < position.meter_start {
                return Err(ServiceError::Validation(format!(
                    "tank '{}': meter end {} is below meter start {}",
                    close.tank_id, close.meter_end, position.meter_start
                )));
            }
            position.dispensed_volume = close.dispensed_volume;
            position.measured_end_volume = Some(close.measured_end_volume);
            position.meter_end = Some(close.meter_end);
        }
        if let Some(open) = positions.iter().find(|p| p.meter_end.is_none()) {
            return Err(ServiceError::Validation(format!(
                "tank '{}' has no closing figures",
                open.tank_id
            )));
        }

        let context = point_context(&report.trading_point_id);
        for position in positions.iter().filter(|p| !p.within_tolerance()) {
            let variance = position.variance().unwrap_or(0.0);
            record(
                &self.db,
                LogLevel::Warning,
                SERVICE,
                "close_shift",
                &format!(
                    "tank '{}' variance {variance:.2} l exceeds allowed {:.2} l in shift {}",
                    position.tank_id, position.allowed_error, report.shift_number
                ),
                &context,
            )
            .await;
        }

        let total_dispensed: f64 = positions.iter().map(|p| p.dispensed_volume).sum();
        let total_sales: i64 = payments.iter().map(|p| p.amount).sum();
        let now = Utc::now();
        let updated = match self
            .db
            .update(
                TABLE,
                json!({
                    "status": "closed",
                    "positions": positions,
                    "payments": payments,
                    "total_dispensed": total_dispensed,
                    "total_sales": total_sales,
                    "closed_at": now,
                    "updated_at": now,
                }),
                &[Filter::eq("id", id), Filter::eq("status", "draft")],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                return Err(log_and_wrap(&self.db, SERVICE, "close_shift", e, &context).await)
            }
        };
        let row: ShiftRow = decode(TABLE, restdb::single(TABLE, updated)?)?;
        tracing::info!(
            trading_point_id = %row.trading_point_id,
            shift_number = row.shift_number,
            total_dispensed,
            total_sales,
            "shift closed"
        );
        Ok(to_domain(row))
    }

    /// Mark a closed shift as pushed to the accounting backend.
    pub async fn synchronize(&self, id: &str) -> Result<ShiftReport> {
        self.advance(id, ShiftStatus::Synchronized).await
    }

    pub async fn archive(&self, id: &str) -> Result<ShiftReport> {
        self.advance(id, ShiftStatus::Archived).await
    }

    async fn advance(&self, id: &str, target: ShiftStatus) -> Result<ShiftReport> {
        let report = self.require(id).await?;
        if report.status.successor() != Some(target) {
            return Err(ServiceError::Validation(format!(
                "shift in status '{}' cannot move to '{}'",
                report.status.as_str(),
                target.as_str()
            )));
        }

        let operation = match target {
            ShiftStatus::Synchronized => "synchronize",
            ShiftStatus::Archived => "archive",
            _ => "advance",
        };
        let context = point_context(&report.trading_point_id);
        let updated = match self
            .db
            .update(
                TABLE,
                json!({ "status": target.as_str(), "updated_at": Utc::now() }),
                &[
                    Filter::eq("id", id),
                    Filter::eq("status", report.status.as_str()),
                ],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => return Err(log_and_wrap(&self.db, SERVICE, operation, e, &context).await),
        };
        let row: ShiftRow = decode(TABLE, restdb::single(TABLE, updated)?)?;
        Ok(to_domain(row))
    }

    async fn require(&self, id: &str) -> Result<ShiftReport> {
        self.get(id)
            .await?
            .ok_or_else(|| ServiceError::Validation(format!("shift report '{id}' not found")))
    }
}

fn point_context(trading_point_id: &str) -> ErrorContext {
    ErrorContext {
        trading_point_id: Some(trading_point_id.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use restdb::MemoryQuerier;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryQuerier>, ShiftReportService) {
        let querier = Arc::new(MemoryQuerier::new());
        let svc = ShiftReportService::new(Db::fixed(querier.clone()));
        (querier, svc)
    }

    fn ai95_position() -> FuelPosition {
        FuelPosition {
            tank_id: "tank-1".into(),
            fuel_type_id: "ai95".into(),
            start_volume: 10_000.0,
            received_volume: 5_000.0,
            dispensed_volume: 0.0,
            measured_end_volume: None,
            meter_start: 100.0,
            meter_end: None,
            allowed_error: 50.0,
        }
    }

    fn ai95_close(measured: f64) -> PositionClose {
        PositionClose {
            tank_id: "tank-1".into(),
            dispensed_volume: 3_000.0,
            measured_end_volume: measured,
            meter_end: 3_100.0,
        }
    }

    fn card_payment(amount: i64) -> Payment {
        Payment {
            method: PaymentMethod::Card,
            amount,
        }
    }

    async fn open_and_close(svc: &ShiftReportService) -> ShiftReport {
        let shift = svc
            .open_shift("tp1", "op1", vec![ai95_position()])
            .await
            .unwrap();
        svc.close_shift(
            &shift.id,
            vec![ai95_close(12_010.0)],
            vec![card_payment(150_000), Payment {
                method: PaymentMethod::Cash,
                amount: 50_000,
            }],
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn shift_numbers_are_sequential_per_point() {
        let (_querier, svc) = setup();
        let first = open_and_close(&svc).await;
        assert_eq!(first.shift_number, 1);

        let second = svc.open_shift("tp1", "op1", vec![]).await.unwrap();
        assert_eq!(second.shift_number, 2);

        let other_point = svc.open_shift("tp2", "op2", vec![]).await.unwrap();
        assert_eq!(other_point.shift_number, 1);
    }

    #[tokio::test]
    async fn only_one_open_draft_per_point() {
        let (_querier, svc) = setup();
        svc.open_shift("tp1", "op1", vec![]).await.unwrap();
        let err = svc.open_shift("tp1", "op2", vec![]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn close_computes_totals_and_reconciles() {
        let (querier, svc) = setup();
        let closed = open_and_close(&svc).await;

        assert_eq!(closed.status, ShiftStatus::Closed);
        assert_eq!(closed.total_dispensed, 3_000.0);
        assert_eq!(closed.total_sales, 200_000);
        assert_eq!(closed.payments.len(), 2);

        let position = &closed.positions[0];
        // 10000 + 5000 - 3000 = 12000 book; measured 12010, within 50 l.
        assert_eq!(position.calculated_end(), 12_000.0);
        assert_eq!(position.variance(), Some(10.0));
        assert_eq!(position.meter_end, Some(3_100.0));
        assert!(position.within_tolerance());
        assert!(querier.rows("error_logs").is_empty());
    }

    #[tokio::test]
    async fn out_of_tolerance_position_is_logged_but_closes() {
        let (querier, svc) = setup();
        let shift = svc
            .open_shift("tp1", "op1", vec![ai95_position()])
            .await
            .unwrap();
        let closed = svc
            .close_shift(&shift.id, vec![ai95_close(11_800.0)], vec![])
            .await
            .unwrap();

        assert_eq!(closed.status, ShiftStatus::Closed);
        assert!(!closed.positions[0].within_tolerance());
        let logs = querier.rows("error_logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["level"].as_str(), Some("warning"));
    }

    #[tokio::test]
    async fn meter_end_below_start_is_rejected() {
        let (_querier, svc) = setup();
        let shift = svc
            .open_shift("tp1", "op1", vec![ai95_position()])
            .await
            .unwrap();
        let err = svc
            .close_shift(
                &shift.id,
                vec![PositionClose {
                    meter_end: 50.0,
                    ..ai95_close(12_000.0)
                }],
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn close_requires_figures_for_every_position() {
        let (_querier, svc) = setup();
        let shift = svc
            .open_shift("tp1", "op1", vec![ai95_position()])
            .await
            .unwrap();
        let err = svc.close_shift(&shift.id, vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn draft_can_be_amended_until_closed() {
        let (_querier, svc) = setup();
        let shift = svc
            .open_shift("tp1", "op1", vec![ai95_position()])
            .await
            .unwrap();

        let updated = svc
            .update_draft(
                &shift.id,
                DraftUpdate {
                    operator_id: Some("op2".into()),
                    documents: Some(vec![AttachedDocument {
                        name: "delivery note".into(),
                        url: "https://docs.example/dn-17".into(),
                    }]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.operator_id, "op2");
        assert_eq!(updated.documents.len(), 1);

        svc.close_shift(&shift.id, vec![ai95_close(12_010.0)], vec![])
            .await
            .unwrap();
        let err = svc
            .update_draft(&shift.id, DraftUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn backend_failure_on_close_is_logged_then_rethrown() {
        let (querier, svc) = setup();
        let shift = svc
            .open_shift("tp1", "op1", vec![ai95_position()])
            .await
            .unwrap();

        querier.fail_writes(TABLE);
        let err = svc
            .close_shift(&shift.id, vec![ai95_close(12_010.0)], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Database(_)));

        let logs = querier.rows("error_logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["level"].as_str(), Some("critical"));
        assert_eq!(logs[0]["operation"].as_str(), Some("close_shift"));
        assert_eq!(logs[0]["trading_point_id"].as_str(), Some("tp1"));

        // The shift is untouched and closes once the backend recovers.
        querier.clear_write_failures();
        let closed = svc
            .close_shift(&shift.id, vec![ai95_close(12_010.0)], vec![])
            .await
            .unwrap();
        assert_eq!(closed.status, ShiftStatus::Closed);
    }

    #[tokio::test]
    async fn backend_failure_on_open_is_logged_then_rethrown() {
        let (querier, svc) = setup();
        querier.fail_writes(TABLE);

        let err = svc.open_shift("tp1", "op1", vec![]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Database(_)));
        let logs = querier.rows("error_logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["operation"].as_str(), Some("open_shift"));
    }

    #[tokio::test]
    async fn lifecycle_is_strictly_forward() {
        let (_querier, svc) = setup();
        let closed = open_and_close(&svc).await;

        // Skipping a step is refused.
        assert!(svc.archive(&closed.id).await.is_err());

        let synced = svc.synchronize(&closed.id).await.unwrap();
        assert_eq!(synced.status, ShiftStatus::Synchronized);
        // No going back.
        assert!(svc.synchronize(&closed.id).await.is_err());
        assert!(svc.close_shift(&closed.id, vec![], vec![]).await.is_err());

        let archived = svc.archive(&closed.id).await.unwrap();
        assert_eq!(archived.status, ShiftStatus::Archived);
        assert!(svc.archive(&closed.id).await.is_err());
    }

    #[tokio::test]
    async fn listing_filters_by_status_and_date_range() {
        let (_querier, svc) = setup();
        let closed = open_and_close(&svc).await;
        svc.open_shift("tp1", "op1", vec![]).await.unwrap();

        let drafts = svc
            .list(
                "tp1",
                ShiftQuery {
                    status: Some(ShiftStatus::Draft),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].shift_number, 2);

        let recent = svc
            .list(
                "tp1",
                ShiftQuery {
                    opened_from: Some(closed.opened_at - Duration::hours(1)),
                    opened_to: Some(closed.opened_at + Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);

        let none = svc
            .list(
                "tp1",
                ShiftQuery {
                    opened_to: Some(closed.opened_at - Duration::days(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
