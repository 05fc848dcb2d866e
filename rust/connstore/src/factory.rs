use crate::{ConnStoreError, ConnectionStore, ConnectionType, Result};
use async_trait::async_trait;
use restdb::{DbError, Filter, HttpConfig, HttpQuerier, Querier, SelectQuery};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct CachedClient {
    connection_id: String,
    client: Arc<HttpQuerier>,
}

/// Lazily builds the backend client from the currently active connection.
///
/// A single client is cached together with the identity of the connection it
/// was built from. Each resolution compares the active connection's id to the
/// cached one and rebuilds on mismatch, so editing or switching connections
/// takes effect on the next call without a restart. The cache sits behind an
/// async mutex: the compare-and-rebuild step must be atomic under tokio's
/// multithreaded runtime.
pub struct ClientFactory {
    store: Arc<ConnectionStore>,
    cached: Mutex<Option<CachedClient>>,
}

impl ClientFactory {
    pub fn new(store: Arc<ConnectionStore>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// Resolve the client for the active connection, rebuilding if the
    /// active connection changed since the last call.
    ///
    /// Fails closed: no active connection, an unsupported connection type,
    /// or a missing access key is an error, never a silent fallback.
    pub async fn resolve(&self) -> Result<Arc<HttpQuerier>> {
        let connection = self
            .store
            .current_connection()
            .ok_or(ConnStoreError::NoActiveConnection)?;

        match connection.connection_type {
            ConnectionType::Hosted => {}
            ConnectionType::Mock => return Err(ConnStoreError::MockDisabled),
            other => return Err(ConnStoreError::Unsupported(other.as_str().to_string())),
        }

        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.connection_id == connection.id {
                return Ok(Arc::clone(&entry.client));
            }
        }

        let key = connection
            .access_key()
            .ok_or_else(|| ConnStoreError::MissingAccessKey(connection.id.clone()))?;
        let client = HttpQuerier::new(HttpConfig {
            base_url: connection.url.clone(),
            api_key: key.to_string(),
            schema: connection.settings.schema.clone(),
            timeout: Duration::from_secs(connection.settings.timeout_secs),
        })
        .map_err(|e| ConnStoreError::Client(e.to_string()))?;
        let client = Arc::new(client);

        tracing::info!(connection_id = %connection.id, "built backend client");
        *cached = Some(CachedClient {
            connection_id: connection.id,
            client: Arc::clone(&client),
        });
        Ok(client)
    }
}

enum DbInner {
    /// Resolve through the connection store on every call.
    Lazy(Arc<ClientFactory>),
    /// Fixed querier, used by tests.
    Fixed(Arc<dyn Querier>),
}

/// Database handle the service layer queries through.
///
/// Every operation resolves the client first, so callers never deal with
/// client construction; when no client can be resolved the call fails with a
/// single consistent "backend unavailable" error which callers propagate
/// upward.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    pub fn new(store: Arc<ConnectionStore>) -> Self {
        Self {
            inner: Arc::new(DbInner::Lazy(Arc::new(ClientFactory::new(store)))),
        }
    }

    /// Wrap a fixed querier. Tests pair this with `restdb::MemoryQuerier`.
    pub fn fixed(querier: Arc<dyn Querier>) -> Self {
        Self {
            inner: Arc::new(DbInner::Fixed(querier)),
        }
    }

    async fn querier(&self) -> std::result::Result<Arc<dyn Querier>, DbError> {
        match self.inner.as_ref() {
            DbInner::Lazy(factory) => factory
                .resolve()
                .await
                .map(|client| client as Arc<dyn Querier>)
                .map_err(|e| DbError::Unavailable(e.to_string())),
            DbInner::Fixed(querier) => Ok(Arc::clone(querier)),
        }
    }
}

#[async_trait]
impl Querier for Db {
    async fn select(
        &self,
        table: &str,
        query: &SelectQuery,
    ) -> std::result::Result<Vec<Value>, DbError> {
        self.querier().await?.select(table, query).await
    }

    async fn insert(
        &self,
        table: &str,
        rows: Vec<Value>,
    ) -> std::result::Result<Vec<Value>, DbError> {
        self.querier().await?.insert(table, rows).await
    }

    async fn update(
        &self,
        table: &str,
        patch: Value,
        filters: &[Filter],
    ) -> std::result::Result<Vec<Value>, DbError> {
        self.querier().await?.update(table, patch, filters).await
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> std::result::Result<u64, DbError> {
        self.querier().await?.delete(table, filters).await
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> std::result::Result<u64, DbError> {
        self.querier().await?.count(table, filters).await
    }
}
