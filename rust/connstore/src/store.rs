use crate::{
    ApiAuth, AppConfig, ConnStoreError, Connection, ConnectionSettings, ConnectionType, Result,
};
use chrono::Utc;
use localstore::PersistentStorage;
use parking_lot::RwLock;
use restdb::{HttpConfig, HttpQuerier, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const DEFAULT_CONNECTION_ID: &str = "primary";

const STORAGE_KEY: &str = "config/connections";

/// Table probed by the hosted-backend reachability test. Any always-present
/// table works; we use the networks dictionary.
const PROBE_TABLE: &str = "networks";

/// Result of a connection reachability test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Result of a switch attempt. A failed switch leaves the current connection
/// untouched and carries the test's error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchOutcome {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Persisted store of known backend connections.
///
/// Every mutating call immediately serializes the full configuration through
/// [`PersistentStorage`] and stamps `last_updated`.
pub struct ConnectionStore {
    storage: PersistentStorage,
    state: RwLock<AppConfig>,
}

impl ConnectionStore {
    /// Load the configuration from durable storage, seeding a hard-coded
    /// default connection when the store is empty.
    pub fn open(storage: PersistentStorage) -> Self {
        let mut config: AppConfig = storage.load(STORAGE_KEY, AppConfig::default());
        if config.connections.is_empty() {
            config.connections.push(default_connection());
            config.current_connection_id = Some(DEFAULT_CONNECTION_ID.to_string());
            config.last_updated = Some(Utc::now());
            if let Err(err) = storage.save(STORAGE_KEY, &config) {
                tracing::warn!(error = %err, "failed to persist seeded connection config");
            }
            tracing::info!("seeded default backend connection");
        }
        Self {
            storage,
            state: RwLock::new(config),
        }
    }

    /// Defensive copy of the full configuration.
    pub fn current_config(&self) -> AppConfig {
        self.state.read().clone()
    }

    /// The connection matching the stored active id, if any.
    pub fn current_connection(&self) -> Option<Connection> {
        let state = self.state.read();
        let id = state.current_connection_id.as_deref()?;
        state.connections.iter().find(|c| c.id == id).cloned()
    }

    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.state
            .read()
            .connections
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn add_connection(&self, mut connection: Connection) -> Result<Connection> {
        if connection.id.is_empty() {
            connection.id = uuid::Uuid::new_v4().to_string();
        }
        {
            let mut state = self.state.write();
            if state.connections.iter().any(|c| c.id == connection.id) {
                return Err(ConnStoreError::InvalidImport(format!(
                    "connection id '{}' already exists",
                    connection.id
                )));
            }
            if connection.is_active {
                for existing in &mut state.connections {
                    existing.is_active = false;
                }
                state.current_connection_id = Some(connection.id.clone());
            }
            state.connections.push(connection.clone());
        }
        self.persist()?;
        tracing::info!(connection_id = %connection.id, "added backend connection");
        Ok(connection)
    }

    /// Replace a connection's mutable fields. The id cannot change; activity
    /// is handled the same way as on add.
    pub fn update_connection(&self, id: &str, updated: Connection) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.connections.iter().any(|c| c.id == id) {
                return Err(ConnStoreError::NotFound(id.to_string()));
            }
            if updated.is_active {
                for existing in &mut state.connections {
                    existing.is_active = false;
                }
                state.current_connection_id = Some(id.to_string());
            }
            let is_current = state.current_connection_id.as_deref() == Some(id);
            if let Some(slot) = state.connections.iter_mut().find(|c| c.id == id) {
                slot.name = updated.name;
                slot.url = updated.url;
                slot.connection_type = updated.connection_type;
                slot.settings = updated.settings;
                slot.is_active = updated.is_active || is_current;
            }
        }
        self.persist()?;
        Ok(())
    }

    /// Delete a connection. Deleting the active or the default connection is
    /// an error, not a silent no-op.
    pub fn delete_connection(&self, id: &str) -> Result<()> {
        {
            let mut state = self.state.write();
            let connection = state
                .connections
                .iter()
                .find(|c| c.id == id)
                .ok_or_else(|| ConnStoreError::NotFound(id.to_string()))?;
            if state.current_connection_id.as_deref() == Some(id) {
                return Err(ConnStoreError::DeleteActive);
            }
            if connection.is_default {
                return Err(ConnStoreError::DeleteDefault);
            }
            state.connections.retain(|c| c.id != id);
        }
        self.persist()?;
        tracing::info!(connection_id = %id, "deleted backend connection");
        Ok(())
    }

    /// Test reachability of a connection, dispatching on its type.
    pub async fn test_connection(&self, id: &str) -> TestReport {
        let Some(connection) = self.connection(id) else {
            return TestReport {
                success: false,
                latency_ms: 0,
                error: Some(format!("connection '{id}' not found")),
            };
        };

        let started = Instant::now();
        let outcome = match connection.connection_type {
            ConnectionType::Hosted => probe_hosted(&connection).await,
            ConnectionType::ExternalApi => probe_external(&connection).await,
            ConnectionType::Mock => Err(ConnStoreError::MockDisabled.to_string()),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => TestReport {
                success: true,
                latency_ms,
                error: None,
            },
            Err(error) => TestReport {
                success: false,
                latency_ms,
                error: Some(error),
            },
        }
    }

    /// Switch the active connection, testing the target first. The switch is
    /// committed and persisted only when the test succeeds; on failure the
    /// current connection id is left unchanged.
    pub async fn switch_connection(&self, id: &str) -> SwitchOutcome {
        let report = self.test_connection(id).await;
        if !report.success {
            tracing::warn!(
                connection_id = %id,
                error = report.error.as_deref().unwrap_or("unknown"),
                "connection switch refused: target failed its test"
            );
            return SwitchOutcome {
                success: false,
                latency_ms: Some(report.latency_ms),
                error: report.error,
            };
        }

        if let Err(err) = self.commit_switch(id) {
            tracing::warn!(connection_id = %id, error = %err, "connection switch not persisted");
            return SwitchOutcome {
                success: false,
                latency_ms: Some(report.latency_ms),
                error: Some(err.to_string()),
            };
        }

        tracing::info!(connection_id = %id, latency_ms = report.latency_ms, "switched active connection");
        SwitchOutcome {
            success: true,
            latency_ms: Some(report.latency_ms),
            error: None,
        }
    }

    /// Persist the switched configuration before the in-memory state picks
    /// it up, so a failed save leaves the active connection unchanged.
    fn commit_switch(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        let mut candidate = state.clone();
        for connection in &mut candidate.connections {
            connection.is_active = connection.id == id;
        }
        candidate.current_connection_id = Some(id.to_string());
        candidate.last_updated = Some(Utc::now());
        self.storage.save(STORAGE_KEY, &candidate)?;
        *state = candidate;
        Ok(())
    }

    /// Serialize the full configuration as pretty JSON.
    pub fn export_config(&self) -> String {
        let state = self.state.read();
        serde_json::to_string_pretty(&*state).unwrap_or_else(|_| "{}".to_string())
    }

    /// Import a configuration snapshot. The payload is validated structurally
    /// (an object carrying a non-empty `connections` array, every entry with
    /// an id and a url) before anything is replaced; the single-active
    /// invariant is re-established after import.
    pub fn import_config(&self, json: &str) -> Result<()> {
        let raw: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| ConnStoreError::InvalidImport(e.to_string()))?;
        let Some(connections) = raw.get("connections").and_then(|c| c.as_array()) else {
            return Err(ConnStoreError::InvalidImport(
                "payload must contain a 'connections' array".to_string(),
            ));
        };
        if connections.is_empty() {
            return Err(ConnStoreError::InvalidImport(
                "'connections' array is empty".to_string(),
            ));
        }

        let mut parsed: Vec<Connection> = Vec::with_capacity(connections.len());
        for entry in connections {
            let connection: Connection = serde_json::from_value(entry.clone())
                .map_err(|e| ConnStoreError::InvalidImport(e.to_string()))?;
            if connection.id.is_empty() || connection.url.is_empty() {
                return Err(ConnStoreError::InvalidImport(
                    "every connection needs an id and a url".to_string(),
                ));
            }
            parsed.push(connection);
        }

        let current = raw
            .get("current_connection_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .filter(|id| parsed.iter().any(|c| &c.id == id))
            .unwrap_or_else(|| parsed[0].id.clone());

        {
            let mut state = self.state.write();
            for connection in &mut parsed {
                connection.is_active = connection.id == current;
            }
            state.connections = parsed;
            state.current_connection_id = Some(current);
        }
        self.persist()?;
        tracing::info!("imported connection configuration");
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write();
            state.last_updated = Some(Utc::now());
            state.clone()
        };
        self.storage.save(STORAGE_KEY, &snapshot)?;
        Ok(())
    }
}

fn default_connection() -> Connection {
    Connection {
        id: DEFAULT_CONNECTION_ID.to_string(),
        name: "Primary backend".to_string(),
        url: "https://db.forecourt.example".to_string(),
        connection_type: ConnectionType::Hosted,
        is_active: true,
        is_default: true,
        settings: ConnectionSettings::default(),
    }
}

/// Lightweight existence check against a known table through a throwaway
/// client.
async fn probe_hosted(connection: &Connection) -> std::result::Result<(), String> {
    let key = connection
        .access_key()
        .ok_or_else(|| ConnStoreError::MissingAccessKey(connection.id.clone()).to_string())?;
    let querier = HttpQuerier::new(HttpConfig {
        base_url: connection.url.clone(),
        api_key: key.to_string(),
        schema: connection.settings.schema.clone(),
        timeout: Duration::from_secs(connection.settings.timeout_secs),
    })
    .map_err(|e| e.to_string())?;

    querier
        .select(PROBE_TABLE, &SelectQuery::new().columns("id").limit(1))
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// `/health` probe for the external trading-network API type.
async fn probe_external(connection: &Connection) -> std::result::Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(connection.settings.timeout_secs))
        .build()
        .map_err(|e| e.to_string())?;

    let url = format!("{}/health", connection.url.trim_end_matches('/'));
    let mut request = client.get(&url);
    match &connection.settings.auth {
        Some(ApiAuth::Bearer { token }) => {
            request = request.bearer_auth(token);
        }
        Some(ApiAuth::Basic { username, password }) => {
            request = request.basic_auth(username, Some(password));
        }
        None => {}
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("health probe returned {}", response.status()))
    }
}
