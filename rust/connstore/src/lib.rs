//! Backend connection configuration and client resolution.
//!
//! Three pieces live here:
//!
//! 1. [`ConnectionStore`]: the persisted list of known backend connections
//!    with exactly one active at a time, plus switch/test/import/export.
//! 2. [`ClientFactory`]: lazily builds and caches an [`restdb::HttpQuerier`]
//!    keyed by the active connection's identity, rebuilding when the identity
//!    changes so configuration edits take effect on the next call.
//! 3. [`Db`]: the facade services query through; it resolves the client on
//!    every call and forwards the [`restdb::Querier`] surface unchanged.
//!
//! There is no mock or unauthenticated fallback anywhere in this crate:
//! an unresolvable connection fails the calling operation.

mod factory;
mod store;

pub use factory::{ClientFactory, Db};
pub use store::{ConnectionStore, SwitchOutcome, TestReport, DEFAULT_CONNECTION_ID};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnStoreError {
    #[error("no active connection configured")]
    NoActiveConnection,

    #[error("connection type '{0}' is not supported for database access")]
    Unsupported(String),

    #[error("mock connections are permanently disabled")]
    MockDisabled,

    #[error("connection '{0}' not found")]
    NotFound(String),

    #[error("cannot delete the active connection")]
    DeleteActive,

    #[error("cannot delete the default connection")]
    DeleteDefault,

    #[error("connection '{0}' has no access key configured")]
    MissingAccessKey(String),

    #[error("invalid configuration import: {0}")]
    InvalidImport(String),

    #[error("failed to build backend client: {0}")]
    Client(String),

    #[error(transparent)]
    Persist(#[from] localstore::StoreError),
}

pub type Result<T> = std::result::Result<T, ConnStoreError>;

/// Kind of backend a connection points at. Only `Hosted` resolves into a
/// query client; the other tags exist so stored configurations from older
/// deployments stay readable, and they are rejected at resolution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Hosted,
    ExternalApi,
    Mock,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Hosted => "hosted",
            ConnectionType::ExternalApi => "external_api",
            ConnectionType::Mock => "mock",
        }
    }
}

/// Authentication for the external trading-network API connection type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum ApiAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub anon_key: Option<String>,
    #[serde(default)]
    pub service_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub auth: Option<ApiAuth>,
}

fn default_schema() -> String {
    "public".to_string()
}

const fn default_timeout_secs() -> u64 {
    15
}

const fn default_retry_count() -> u32 {
    3
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            anon_key: None,
            service_key: None,
            timeout_secs: default_timeout_secs(),
            retry_count: default_retry_count(),
            auth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub url: String,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub settings: ConnectionSettings,
}

impl Connection {
    /// Access key used for hosted queries: the service key when present,
    /// otherwise the anonymous key.
    pub fn access_key(&self) -> Option<&str> {
        self.settings
            .service_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .or(self
                .settings
                .anon_key
                .as_deref()
                .filter(|key| !key.is_empty()))
    }
}

/// Full persisted configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub connections: Vec<Connection>,
    pub current_connection_id: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}
