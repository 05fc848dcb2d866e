//! HTTP implementation of [`Querier`] speaking the hosted backend's
//! PostgREST-style row API.

use crate::error::{DbError, Result};
use crate::query::{Direction, Filter, FilterOp, SelectQuery};
use crate::querier::Querier;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Connection parameters for one backend client instance.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL of the hosted backend, e.g. `https://db.example.com`.
    pub base_url: String,
    /// Access key sent as both `apikey` and bearer token.
    pub api_key: String,
    /// Storage schema the client reads and writes.
    pub schema: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct HttpQuerier {
    client: reqwest::Client,
    config: HttpConfig,
}

impl HttpQuerier {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&config.api_key)
                .map_err(|_| DbError::Http("access key is not a valid header value".into()))?,
        );
        headers.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .map_err(|_| DbError::Http("access key is not a valid header value".into()))?,
        );

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, config })
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            table
        )
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let builder = self.client.request(method.clone(), self.table_url(table));
        // Reads declare the schema via Accept-Profile, writes via
        // Content-Profile.
        match method {
            Method::GET | Method::HEAD => builder.header("Accept-Profile", &self.config.schema),
            _ => builder.header("Content-Profile", &self.config.schema),
        }
    }

    async fn read_rows(table: &str, response: reqwest::Response) -> Result<Vec<Value>> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(query_error(table, status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body)? {
            Value::Array(rows) => Ok(rows),
            other => Ok(vec![other]),
        }
    }
}

#[async_trait]
impl Querier for HttpQuerier {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>> {
        let params = select_params(query);
        let response = self
            .request(Method::GET, table)
            .query(&params)
            .send()
            .await?;
        Self::read_rows(table, response).await
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&rows)
            .send()
            .await?;
        Self::read_rows(table, response).await
    }

    async fn update(&self, table: &str, patch: Value, filters: &[Filter]) -> Result<Vec<Value>> {
        let params = filter_params(filters);
        let response = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(&params)
            .json(&patch)
            .send()
            .await?;
        Self::read_rows(table, response).await
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64> {
        let params = filter_params(filters);
        let response = self
            .request(Method::DELETE, table)
            .header("Prefer", "return=representation")
            .query(&params)
            .send()
            .await?;
        let rows = Self::read_rows(table, response).await?;
        Ok(rows.len() as u64)
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64> {
        let mut params = filter_params(filters);
        params.push(("select".to_string(), "id".to_string()));
        let response = self
            .request(Method::GET, table)
            .header("Prefer", "count=exact")
            .header("Range", "0-0")
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::RANGE_NOT_SATISFIABLE {
            let body = response.text().await.unwrap_or_default();
            return Err(query_error(table, status, &body));
        }

        let range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DbError::Query {
                table: table.to_string(),
                message: "count response missing Content-Range".to_string(),
            })?;
        parse_content_range(range).ok_or_else(|| DbError::Query {
            table: table.to_string(),
            message: format!("unparseable Content-Range '{range}'"),
        })
    }
}

fn query_error(table: &str, status: StatusCode, body: &str) -> DbError {
    // The backend reports errors as JSON with a `message` field; fall back
    // to the raw body when it does not.
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| body.trim().to_string());
    tracing::warn!(table, status = %status, message = %message, "backend request failed");
    DbError::Query {
        table: table.to_string(),
        message: format!("{status}: {message}"),
    }
}

/// Render one filter as a query-string pair in the backend dialect, e.g.
/// `("status", "eq.active")` or `("id", "in.(a,b)")`.
fn filter_pair(filter: &Filter) -> (String, String) {
    let rendered = match (&filter.op, &filter.value) {
        (FilterOp::Eq, Value::Null) => "is.null".to_string(),
        (FilterOp::Neq, Value::Null) => "not.is.null".to_string(),
        (FilterOp::In, Value::Array(values)) => {
            let items: Vec<String> = values.iter().map(render_scalar).collect();
            format!("in.({})", items.join(","))
        }
        (op, value) => format!("{}.{}", op.as_str(), render_scalar(value)),
    };
    (filter.column.clone(), rendered)
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(filter_pair).collect()
}

fn select_params(query: &SelectQuery) -> Vec<(String, String)> {
    let mut params = Vec::new();
    params.push((
        "select".to_string(),
        query.columns.clone().unwrap_or_else(|| "*".to_string()),
    ));
    params.extend(filter_params(&query.filters));
    if !query.order.is_empty() {
        let rendered: Vec<String> = query
            .order
            .iter()
            .map(|(column, direction)| match direction {
                Direction::Asc => format!("{column}.asc"),
                Direction::Desc => format!("{column}.desc"),
            })
            .collect();
        params.push(("order".to_string(), rendered.join(",")));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = query.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

fn parse_content_range(range: &str) -> Option<u64> {
    // Formats: "0-0/57" or "*/0".
    range.rsplit('/').next()?.trim().parse().ok()
}
