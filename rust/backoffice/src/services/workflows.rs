//! Automation workflows and their execution runs.
//!
//! A workflow is an ordered set of HTTP endpoints, each with a priority.
//! Execution calls the enabled endpoints in ascending priority order; a
//! failure at a critical priority (<= [`FATAL_PRIORITY`]) aborts the rest of
//! the run, fails the execution, and parks the workflow in the `error`
//! status, while failures further down are recorded and tolerated.

use crate::error::{Result, ServiceError};
use crate::error_log::{log_and_wrap, ErrorContext};
use crate::services::{decode, decode_rows, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const WORKFLOWS_TABLE: &str = "workflows";
const EXECUTIONS_TABLE: &str = "workflow_executions";
const SERVICE: &str = "workflows";

/// Endpoint failures at this priority or below abort the run.
pub const FATAL_PRIORITY: i32 = 3;

fn default_endpoint_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Inactive,
    Error,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Inactive => "inactive",
            WorkflowStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFrequency {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl ScheduleFrequency {
    fn unit_secs(&self) -> i64 {
        match self {
            ScheduleFrequency::Seconds => 1,
            ScheduleFrequency::Minutes => 60,
            ScheduleFrequency::Hours => 3600,
            ScheduleFrequency::Days => 86_400,
        }
    }
}

/// Run cadence: every `interval` units of `frequency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub frequency: ScheduleFrequency,
    pub interval: i64,
}

impl Schedule {
    pub fn interval_secs(&self) -> i64 {
        self.interval.saturating_mul(self.frequency.unit_secs())
    }
}

/// What the workflow applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Target {
    Network,
    TradingPoints { ids: Vec<String> },
}

impl Default for Target {
    fn default() -> Self {
        Target::Network
    }
}

/// Retry settings stored on the definition. Execution records them with the
/// run; retrying itself is the scheduler's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub schedule: Schedule,
    pub endpoints: Vec<Endpoint>,
    pub target: Target,
    pub retry_policy: RetryPolicy,
    pub max_concurrent_executions: u64,
    /// Optimistic-concurrency version, incremented on every update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkflowRow {
    #[serde(default)]
    id: String,
    name: String,
    description: Option<String>,
    status: WorkflowStatus,
    schedule: Schedule,
    endpoints: Vec<Endpoint>,
    #[serde(default)]
    target: Target,
    #[serde(default)]
    retry_policy: RetryPolicy,
    max_concurrent_executions: u64,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn to_domain(row: WorkflowRow) -> Workflow {
    Workflow {
        id: row.id,
        name: row.name,
        description: row.description,
        status: row.status,
        schedule: row.schedule,
        endpoints: row.endpoints,
        target: row.target,
        retry_policy: row.retry_policy,
        max_concurrent_executions: row.max_concurrent_executions,
        version: row.version,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

/// Outcome of validating a workflow definition. Errors block activation,
/// warnings do not.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub errors: Vec<FieldIssue>,
    pub warnings: Vec<FieldIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldIssue {
            field: field.to_string(),
            message: message.into(),
        });
    }

    fn warning(&mut self, field: &str, message: impl Into<String>) {
        self.warnings.push(FieldIssue {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointResult {
    pub url: String,
    pub priority: i32,
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub endpoint_results: Vec<EndpointResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExecutionRow {
    #[serde(default)]
    id: String,
    workflow_id: String,
    status: ExecutionStatus,
    endpoint_results: Vec<EndpointResult>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

fn execution_to_domain(row: ExecutionRow) -> Execution {
    Execution {
        id: row.id,
        workflow_id: row.workflow_id,
        status: row.status,
        endpoint_results: row.endpoint_results,
        error: row.error,
        started_at: row.started_at,
        finished_at: row.finished_at,
        duration_ms: row.duration_ms,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub success_rate_pct: f64,
    pub avg_duration_secs: f64,
}

#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub name: String,
    pub description: Option<String>,
    pub schedule: Schedule,
    pub endpoints: Vec<Endpoint>,
    pub target: Target,
    pub retry_policy: RetryPolicy,
    pub max_concurrent_executions: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub schedule: Option<Schedule>,
    pub endpoints: Option<Vec<Endpoint>>,
    pub target: Option<Target>,
    pub retry_policy: Option<RetryPolicy>,
    pub max_concurrent_executions: Option<u64>,
}

#[derive(Clone)]
pub struct WorkflowService {
    db: Db,
    http: reqwest::Client,
}

impl WorkflowService {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            http: reqwest::Client::new(),
        }
    }

    pub async fn list(&self) -> Result<Vec<Workflow>> {
        let rows = self
            .db
            .select(WORKFLOWS_TABLE, &SelectQuery::new().order("name"))
            .await?;
        Ok(decode_rows::<WorkflowRow>(WORKFLOWS_TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>> {
        let rows = self
            .db
            .select(WORKFLOWS_TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<WorkflowRow>(WORKFLOWS_TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn create(&self, input: NewWorkflow) -> Result<Workflow> {
        let now = Utc::now();
        let row = json!({
            "name": input.name,
            "description": input.description,
            "status": "draft",
            "schedule": input.schedule,
            "endpoints": input.endpoints,
            "target": input.target,
            "retry_policy": input.retry_policy,
            "max_concurrent_executions": input.max_concurrent_executions.max(1),
            "version": 1,
            "created_at": now,
            "updated_at": now,
        });
        let inserted = self.db.insert(WORKFLOWS_TABLE, vec![row]).await?;
        let row: WorkflowRow = decode(WORKFLOWS_TABLE, restdb::single(WORKFLOWS_TABLE, inserted)?)?;
        Ok(to_domain(row))
    }

    /// Update a definition with an optimistic version check: the filter on
    /// the expected version turns the write into a compare-and-swap.
    pub async fn update(
        &self,
        id: &str,
        expected_version: i64,
        update: WorkflowUpdate,
    ) -> Result<Workflow> {
        let existing = self.require(id).await?;

        let mut patch = serde_json::Map::new();
        if let Some(name) = update.name {
            patch.insert("name".into(), json!(name));
        }
        if let Some(description) = update.description {
            patch.insert("description".into(), json!(description));
        }
        if let Some(schedule) = update.schedule {
            patch.insert("schedule".into(), json!(schedule));
        }
        if let Some(endpoints) = update.endpoints {
            patch.insert("endpoints".into(), json!(endpoints));
        }
        if let Some(target) = update.target {
            patch.insert("target".into(), json!(target));
        }
        if let Some(retry_policy) = update.retry_policy {
            patch.insert("retry_policy".into(), json!(retry_policy));
        }
        if let Some(cap) = update.max_concurrent_executions {
            patch.insert("max_concurrent_executions".into(), json!(cap.max(1)));
        }
        patch.insert("version".into(), json!(expected_version + 1));
        patch.insert("updated_at".into(), json!(Utc::now()));

        let updated = self
            .db
            .update(
                WORKFLOWS_TABLE,
                patch.into(),
                &[
                    Filter::eq("id", id),
                    Filter::eq("version", expected_version),
                ],
            )
            .await?;
        match restdb::maybe_single(updated) {
            Some(row) => Ok(to_domain(decode(WORKFLOWS_TABLE, row)?)),
            None => Err(ServiceError::Conflict(format!(
                "workflow '{}'",
                existing.name
            ))),
        }
    }

    /// Structural checks on a definition. Activation requires a report with
    /// no errors.
    pub fn validate(&self, workflow: &Workflow) -> ValidationReport {
        let mut report = ValidationReport::default();

        if workflow.name.trim().is_empty() {
            report.error("name", "workflow name is required");
        }
        if workflow.endpoints.is_empty() {
            report.error("endpoints", "a workflow needs at least one endpoint");
        }
        if workflow.schedule.interval <= 0 {
            report.error("schedule", "schedule interval must be positive");
        } else if workflow.schedule.interval_secs() < 60 {
            report.warning("schedule", "schedule runs more than once a minute");
        }
        for (index, endpoint) in workflow.endpoints.iter().enumerate() {
            let field = format!("endpoints[{index}]");
            if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
                report.error(&field, format!("invalid endpoint URL '{}'", endpoint.url));
            }
            if endpoint.priority < 1 {
                report.error(&field, "endpoint priority must be at least 1");
            }
            if endpoint.timeout_secs == 0 {
                report.error(&field, "endpoint timeout must be positive");
            } else if endpoint.timeout_secs > 300 {
                report.warning(&field, "endpoint timeout above five minutes");
            }
        }
        if workflow.endpoints.iter().all(|e| !e.enabled) && !workflow.endpoints.is_empty() {
            report.error("endpoints", "all endpoints are disabled");
        }

        let mut priorities: Vec<i32> = workflow.endpoints.iter().map(|e| e.priority).collect();
        priorities.sort_unstable();
        priorities.dedup();
        if priorities.len() != workflow.endpoints.len() {
            report.warning(
                "endpoints",
                "duplicate priorities make the call order between them unspecified",
            );
        }
        if workflow.description.as_deref().unwrap_or("").trim().is_empty() {
            report.warning("description", "workflow has no description");
        }

        report
    }

    /// Activate a workflow. Refused while validation reports errors.
    pub async fn activate(&self, id: &str) -> Result<Workflow> {
        let workflow = self.require(id).await?;
        let report = self.validate(&workflow);
        if !report.is_valid() {
            let summary: Vec<String> = report
                .errors
                .iter()
                .map(|issue| format!("{}: {}", issue.field, issue.message))
                .collect();
            return Err(ServiceError::Validation(format!(
                "workflow cannot be activated: {}",
                summary.join("; ")
            )));
        }
        self.set_status(id, WorkflowStatus::Active).await
    }

    pub async fn deactivate(&self, id: &str) -> Result<Workflow> {
        self.require(id).await?;
        self.set_status(id, WorkflowStatus::Inactive).await
    }

    /// Run a workflow once. Admission is capped: when the number of pending
    /// or running executions has reached the workflow's limit, the start is
    /// refused.
    pub async fn start_execution(&self, workflow_id: &str) -> Result<Execution> {
        let workflow = self.require(workflow_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Err(ServiceError::Validation(
                "only active workflows can be executed".into(),
            ));
        }

        let mut in_flight = 0;
        for status in ["pending", "running"] {
            in_flight += self
                .db
                .count(
                    EXECUTIONS_TABLE,
                    &[
                        Filter::eq("workflow_id", workflow_id),
                        Filter::eq("status", status),
                    ],
                )
                .await?;
        }
        if in_flight >= workflow.max_concurrent_executions {
            return Err(ServiceError::Validation(format!(
                "workflow already has {in_flight} executions in flight (limit {})",
                workflow.max_concurrent_executions
            )));
        }

        let row = json!({
            "workflow_id": workflow_id,
            "status": "pending",
            "endpoint_results": [],
            "error": null,
            "started_at": Utc::now(),
            "finished_at": null,
            "duration_ms": null,
        });
        let inserted = self.db.insert(EXECUTIONS_TABLE, vec![row]).await?;
        let execution: ExecutionRow =
            decode(EXECUTIONS_TABLE, restdb::single(EXECUTIONS_TABLE, inserted)?)?;

        self.db
            .update(
                EXECUTIONS_TABLE,
                json!({ "status": "running" }),
                &[Filter::eq("id", execution.id.as_str())],
            )
            .await?;
        tracing::info!(workflow_id, execution_id = %execution.id, "workflow execution started");

        let mut endpoints: Vec<Endpoint> = workflow
            .endpoints
            .iter()
            .filter(|e| e.enabled)
            .cloned()
            .collect();
        endpoints.sort_by_key(|e| e.priority);

        let mut results = Vec::with_capacity(endpoints.len());
        let mut fatal: Option<String> = None;
        for endpoint in &endpoints {
            let result = self.call_endpoint(endpoint).await;
            let failed = !result.success;
            let message = result.message.clone();
            results.push(result);
            if failed && endpoint.priority <= FATAL_PRIORITY {
                tracing::warn!(
                    workflow_id,
                    url = %endpoint.url,
                    priority = endpoint.priority,
                    "critical endpoint failed, aborting run"
                );
                fatal = Some(format!(
                    "critical endpoint {} failed: {}",
                    endpoint.url,
                    message.unwrap_or_else(|| "no response".into())
                ));
                break;
            }
        }

        let (status, error) = match fatal {
            Some(reason) => (ExecutionStatus::Failed, Some(reason)),
            None => (ExecutionStatus::Completed, None),
        };
        let finished = self
            .finish_execution(&execution.id, execution.started_at, status, results, error)
            .await?;

        if finished.status == ExecutionStatus::Failed {
            let context = ErrorContext::default();
            if let Some(reason) = finished.error.as_deref() {
                crate::error_log::record(
                    &self.db,
                    crate::error_log::LogLevel::Error,
                    SERVICE,
                    "start_execution",
                    reason,
                    &context,
                )
                .await;
            }
            self.set_status(workflow_id, WorkflowStatus::Error).await?;
        }
        Ok(finished)
    }

    /// Stop an in-flight execution by marking its record failed. Stopping an
    /// execution that already finished returns it unchanged.
    pub async fn stop_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        for status in ["running", "pending"] {
            let updated = self
                .db
                .update(
                    EXECUTIONS_TABLE,
                    json!({
                        "status": "failed",
                        "error": "stopped",
                        "finished_at": Utc::now(),
                    }),
                    &[
                        Filter::eq("id", execution_id),
                        Filter::eq("status", status),
                    ],
                )
                .await?;
            if !updated.is_empty() {
                return maybe_decode::<ExecutionRow>(EXECUTIONS_TABLE, updated)
                    .map(|row| row.map(execution_to_domain));
            }
        }
        self.execution(execution_id).await
    }

    pub async fn execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        let rows = self
            .db
            .select(
                EXECUTIONS_TABLE,
                &SelectQuery::new().eq("id", execution_id).limit(1),
            )
            .await?;
        maybe_decode::<ExecutionRow>(EXECUTIONS_TABLE, rows).map(|row| row.map(execution_to_domain))
    }

    /// Recent executions of a workflow, newest first. `None` returns the
    /// full history.
    pub async fn executions(
        &self,
        workflow_id: &str,
        limit: Option<u64>,
    ) -> Result<Vec<Execution>> {
        let mut query = SelectQuery::new()
            .eq("workflow_id", workflow_id)
            .order_desc("started_at");
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let rows = self.db.select(EXECUTIONS_TABLE, &query).await?;
        Ok(decode_rows::<ExecutionRow>(EXECUTIONS_TABLE, rows)?
            .into_iter()
            .map(execution_to_domain)
            .collect())
    }

    pub async fn execution_stats(&self, workflow_id: &str) -> Result<ExecutionStats> {
        let executions = self.executions(workflow_id, None).await?;
        let mut stats = ExecutionStats {
            total: executions.len() as u64,
            ..Default::default()
        };

        let mut duration_sum = 0.0;
        let mut finished = 0u64;
        for execution in &executions {
            match execution.status {
                ExecutionStatus::Pending | ExecutionStatus::Running => stats.running += 1,
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
            }
            if execution.finished_at.is_some() {
                duration_sum += execution.duration_ms.unwrap_or(0) as f64 / 1000.0;
                finished += 1;
            }
        }

        if finished > 0 {
            stats.success_rate_pct = stats.completed as f64 / finished as f64 * 100.0;
            stats.avg_duration_secs = duration_sum / finished as f64;
        }
        Ok(stats)
    }

    async fn call_endpoint(&self, endpoint: &Endpoint) -> EndpointResult {
        let request = match endpoint.method.to_ascii_uppercase().as_str() {
            "POST" => self.http.post(&endpoint.url),
            "PUT" => self.http.put(&endpoint.url),
            "DELETE" => self.http.delete(&endpoint.url),
            _ => self.http.get(&endpoint.url),
        };
        let response = request
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => EndpointResult {
                url: endpoint.url.clone(),
                priority: endpoint.priority,
                success: true,
                message: None,
            },
            Ok(response) => EndpointResult {
                url: endpoint.url.clone(),
                priority: endpoint.priority,
                success: false,
                message: Some(format!("endpoint returned {}", response.status())),
            },
            Err(e) => EndpointResult {
                url: endpoint.url.clone(),
                priority: endpoint.priority,
                success: false,
                message: Some(e.to_string()),
            },
        }
    }

    async fn finish_execution(
        &self,
        execution_id: &str,
        started_at: DateTime<Utc>,
        status: ExecutionStatus,
        results: Vec<EndpointResult>,
        error: Option<String>,
    ) -> Result<Execution> {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0);
        let updated = self
            .db
            .update(
                EXECUTIONS_TABLE,
                json!({
                    "status": status.as_str(),
                    "endpoint_results": results,
                    "error": error,
                    "finished_at": finished_at,
                    "duration_ms": duration_ms,
                }),
                &[Filter::eq("id", execution_id)],
            )
            .await;
        let updated = match updated {
            Ok(rows) => rows,
            Err(e) => {
                let context = ErrorContext::default();
                return Err(
                    log_and_wrap(&self.db, SERVICE, "finish_execution", e, &context).await,
                );
            }
        };
        let row: ExecutionRow =
            decode(EXECUTIONS_TABLE, restdb::single(EXECUTIONS_TABLE, updated)?)?;
        Ok(execution_to_domain(row))
    }

    async fn require(&self, id: &str) -> Result<Workflow> {
        self.get(id)
            .await?
            .ok_or_else(|| ServiceError::Validation(format!("workflow '{id}' not found")))
    }

    async fn set_status(&self, id: &str, status: WorkflowStatus) -> Result<Workflow> {
        let updated = self
            .db
            .update(
                WORKFLOWS_TABLE,
                json!({ "status": status.as_str(), "updated_at": Utc::now() }),
                &[Filter::eq("id", id)],
            )
            .await?;
        let row: WorkflowRow = decode(WORKFLOWS_TABLE, restdb::single(WORKFLOWS_TABLE, updated)?)?;
        Ok(to_domain(row))
    }
}
