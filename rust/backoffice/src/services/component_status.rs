//! Health tracking for forecourt components (pumps, terminals, controllers).
//!
//! Each component has one status row that is folded forward on every report:
//! the time elapsed since the previous report is attributed to uptime or
//! downtime according to the status the component was in during that
//! interval, and the error counter is edge-triggered, so a component
//! sitting in the error state across many reports counts as one error.

use crate::error::Result;
use crate::services::{decode, decode_rows, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "component_statuses";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Online,
    Offline,
    Error,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentState::Online => "online",
            ComponentState::Offline => "offline",
            ComponentState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub id: String,
    pub component_id: String,
    pub trading_point_id: Option<String>,
    pub state: ComponentState,
    pub uptime_secs: i64,
    pub downtime_secs: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_online: Option<DateTime<Utc>>,
    pub last_offline: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentStatus {
    /// Share of observed time the component was online, in percent. Zero
    /// until there is any observed time.
    pub fn availability_pct(&self) -> f64 {
        let total = self.uptime_secs + self.downtime_secs;
        if total <= 0 {
            return 0.0;
        }
        self.uptime_secs as f64 / total as f64 * 100.0
    }

    /// Reliability score: 100 minus ten points per error per observed hour,
    /// floored at zero.
    pub fn reliability_score(&self) -> f64 {
        let total = self.uptime_secs + self.downtime_secs;
        if total <= 0 {
            return 100.0;
        }
        let errors_per_hour = self.error_count as f64 / (total as f64 / 3600.0);
        (100.0 - 10.0 * errors_per_hour).max(0.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusRow {
    #[serde(default)]
    id: String,
    component_id: String,
    trading_point_id: Option<String>,
    state: ComponentState,
    uptime_secs: i64,
    downtime_secs: i64,
    error_count: i64,
    last_error: Option<String>,
    last_error_time: Option<DateTime<Utc>>,
    last_online: Option<DateTime<Utc>>,
    last_offline: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

fn to_domain(row: StatusRow) -> ComponentStatus {
    ComponentStatus {
        id: row.id,
        component_id: row.component_id,
        trading_point_id: row.trading_point_id,
        state: row.state,
        uptime_secs: row.uptime_secs,
        downtime_secs: row.downtime_secs,
        error_count: row.error_count,
        last_error: row.last_error,
        last_error_time: row.last_error_time,
        last_online: row.last_online,
        last_offline: row.last_offline,
        updated_at: row.updated_at,
    }
}

/// Per-state component counts for a dashboard header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub online: u64,
    pub offline: u64,
    pub error: u64,
}

#[derive(Clone)]
pub struct ComponentStatusService {
    db: Db,
}

impl ComponentStatusService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn upsert_status(
        &self,
        component_id: &str,
        trading_point_id: Option<&str>,
        state: ComponentState,
        error_message: Option<&str>,
    ) -> Result<ComponentStatus> {
        self.upsert_status_at(component_id, trading_point_id, state, error_message, Utc::now())
            .await
    }

    /// Fold a status report observed at `at` into the component's row.
    pub async fn upsert_status_at(
        &self,
        component_id: &str,
        trading_point_id: Option<&str>,
        state: ComponentState,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<ComponentStatus> {
        let existing = self.component_status(component_id).await?;

        let Some(previous) = existing else {
            let is_error = state == ComponentState::Error;
            let row = json!({
                "component_id": component_id,
                "trading_point_id": trading_point_id,
                "state": state.as_str(),
                "uptime_secs": 0,
                "downtime_secs": 0,
                "error_count": i64::from(is_error),
                "last_error": if is_error { error_message } else { None },
                "last_error_time": is_error.then_some(at),
                "last_online": (state == ComponentState::Online).then_some(at),
                "last_offline": (state == ComponentState::Offline).then_some(at),
                "updated_at": at,
            });
            let inserted = self.db.insert(TABLE, vec![row]).await?;
            let row: StatusRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
            return Ok(to_domain(row));
        };

        // Elapsed time belongs to the state the component was in, not the
        // one it is entering. Out-of-order reports contribute nothing.
        let elapsed = (at - previous.updated_at).num_seconds().max(0);
        let mut uptime = previous.uptime_secs;
        let mut downtime = previous.downtime_secs;
        match previous.state {
            ComponentState::Online => uptime += elapsed,
            ComponentState::Offline | ComponentState::Error => downtime += elapsed,
        }

        let mut patch = json!({
            "state": state.as_str(),
            "uptime_secs": uptime,
            "downtime_secs": downtime,
            "updated_at": at,
        });
        if state == ComponentState::Error && previous.state != ComponentState::Error {
            patch["error_count"] = json!(previous.error_count + 1);
            patch["last_error"] = json!(error_message.unwrap_or("component reported error"));
            patch["last_error_time"] = json!(at);
        }
        match state {
            ComponentState::Online => patch["last_online"] = json!(at),
            ComponentState::Offline => patch["last_offline"] = json!(at),
            ComponentState::Error => {}
        }

        let updated = self
            .db
            .update(TABLE, patch, &[Filter::eq("component_id", component_id)])
            .await?;
        let row: StatusRow = decode(TABLE, restdb::single(TABLE, updated)?)?;
        if row.state == ComponentState::Error {
            tracing::warn!(component_id, error_count = row.error_count, "component reported error");
        }
        Ok(to_domain(row))
    }

    pub async fn component_status(&self, component_id: &str) -> Result<Option<ComponentStatus>> {
        let rows = self
            .db
            .select(
                TABLE,
                &SelectQuery::new().eq("component_id", component_id).limit(1),
            )
            .await?;
        maybe_decode::<StatusRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn list_statuses(
        &self,
        trading_point_id: Option<&str>,
    ) -> Result<Vec<ComponentStatus>> {
        let mut query = SelectQuery::new().order("component_id");
        if let Some(point) = trading_point_id {
            query = query.eq("trading_point_id", point);
        }
        let rows = self.db.select(TABLE, &query).await?;
        Ok(decode_rows::<StatusRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn summary(&self, trading_point_id: Option<&str>) -> Result<StatusSummary> {
        let mut summary = StatusSummary::default();
        for component in self.list_statuses(trading_point_id).await? {
            match component.state {
                ComponentState::Online => summary.online += 1,
                ComponentState::Offline => summary.offline += 1,
                ComponentState::Error => summary.error += 1,
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use restdb::MemoryQuerier;
    use std::sync::Arc;

    fn service() -> ComponentStatusService {
        ComponentStatusService::new(Db::fixed(Arc::new(MemoryQuerier::new())))
    }

    #[tokio::test]
    async fn elapsed_time_belongs_to_the_previous_state() {
        let svc = service();
        let start = Utc::now();

        svc.upsert_status_at("pump-1", Some("tp1"), ComponentState::Online, None, start)
            .await
            .unwrap();
        // One hour online, then goes offline.
        let status = svc
            .upsert_status_at(
                "pump-1",
                Some("tp1"),
                ComponentState::Offline,
                None,
                start + Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(status.uptime_secs, 3600);
        assert_eq!(status.downtime_secs, 0);

        // Thirty minutes offline, then back online.
        let status = svc
            .upsert_status_at(
                "pump-1",
                Some("tp1"),
                ComponentState::Online,
                None,
                start + Duration::minutes(90),
            )
            .await
            .unwrap();
        assert_eq!(status.uptime_secs, 3600);
        assert_eq!(status.downtime_secs, 1800);
        assert!((status.availability_pct() - 66.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn error_count_is_edge_triggered() {
        let svc = service();
        let start = Utc::now();

        svc.upsert_status_at("term-1", None, ComponentState::Online, None, start)
            .await
            .unwrap();
        let status = svc
            .upsert_status_at(
                "term-1",
                None,
                ComponentState::Error,
                Some("card reader jammed"),
                start + Duration::minutes(5),
            )
            .await
            .unwrap();
        assert_eq!(status.error_count, 1);
        assert_eq!(status.last_error.as_deref(), Some("card reader jammed"));
        assert_eq!(status.last_error_time, Some(start + Duration::minutes(5)));

        // Still erroring: repeated reports do not inflate the counter or
        // overwrite the first error.
        let status = svc
            .upsert_status_at(
                "term-1",
                None,
                ComponentState::Error,
                Some("still jammed"),
                start + Duration::minutes(10),
            )
            .await
            .unwrap();
        assert_eq!(status.error_count, 1);
        assert_eq!(status.last_error.as_deref(), Some("card reader jammed"));

        // Recovers, then fails again: a second edge.
        svc.upsert_status_at(
            "term-1",
            None,
            ComponentState::Online,
            None,
            start + Duration::minutes(15),
        )
        .await
        .unwrap();
        let status = svc
            .upsert_status_at(
                "term-1",
                None,
                ComponentState::Error,
                Some("jammed again"),
                start + Duration::minutes(20),
            )
            .await
            .unwrap();
        assert_eq!(status.error_count, 2);
        assert_eq!(status.last_error.as_deref(), Some("jammed again"));
    }

    #[tokio::test]
    async fn error_time_counts_as_downtime() {
        let svc = service();
        let start = Utc::now();

        svc.upsert_status_at("ctrl-1", None, ComponentState::Error, Some("boot loop"), start)
            .await
            .unwrap();
        let status = svc
            .upsert_status_at(
                "ctrl-1",
                None,
                ComponentState::Online,
                None,
                start + Duration::hours(2),
            )
            .await
            .unwrap();
        assert_eq!(status.downtime_secs, 7200);
        assert_eq!(status.uptime_secs, 0);
    }

    #[tokio::test]
    async fn last_seen_markers_follow_the_new_state() {
        let svc = service();
        let start = Utc::now();

        let status = svc
            .upsert_status_at("pump-2", None, ComponentState::Online, None, start)
            .await
            .unwrap();
        assert_eq!(status.last_online, Some(start));
        assert_eq!(status.last_offline, None);
        assert_eq!(status.availability_pct(), 0.0, "no observed time yet");

        let later = start + Duration::minutes(10);
        let status = svc
            .upsert_status_at("pump-2", None, ComponentState::Offline, None, later)
            .await
            .unwrap();
        assert_eq!(status.last_online, Some(start));
        assert_eq!(status.last_offline, Some(later));
    }

    #[tokio::test]
    async fn reliability_penalizes_frequent_errors() {
        let svc = service();
        let start = Utc::now();

        svc.upsert_status_at("pos-1", None, ComponentState::Online, None, start)
            .await
            .unwrap();
        svc.upsert_status_at(
            "pos-1",
            None,
            ComponentState::Error,
            Some("timeout"),
            start + Duration::hours(1),
        )
        .await
        .unwrap();
        let status = svc
            .upsert_status_at(
                "pos-1",
                None,
                ComponentState::Online,
                None,
                start + Duration::hours(2),
            )
            .await
            .unwrap();

        // One error over two hours: 100 - 10 * 0.5 = 95.
        assert!((status.reliability_score() - 95.0).abs() < 1e-9);
        assert_eq!(status.availability_pct(), 50.0);
    }

    #[tokio::test]
    async fn summary_counts_states_per_point() {
        let svc = service();
        svc.upsert_status("pump-1", Some("tp1"), ComponentState::Online, None)
            .await
            .unwrap();
        svc.upsert_status("pump-2", Some("tp1"), ComponentState::Error, Some("offline pump"))
            .await
            .unwrap();
        svc.upsert_status("pump-3", Some("tp2"), ComponentState::Offline, None)
            .await
            .unwrap();

        let summary = svc.summary(Some("tp1")).await.unwrap();
        assert_eq!(
            summary,
            StatusSummary {
                online: 1,
                offline: 0,
                error: 1,
            }
        );
        let all = svc.summary(None).await.unwrap();
        assert_eq!(all.offline, 1);
    }
}
