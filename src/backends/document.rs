//! Document-store adapter with bounded connection pooling.
//!
//! Logical tables map to collections; each entry is one document carrying
//! its topic, key and serialized value. Document engines bound concurrent
//! work per client connection, so the adapter multiplexes operations over a
//! bounded pool: acquisition blocks up to a configured timeout when every
//! connection is checked out, and a checked-out connection returns to the
//! pool when its guard drops, including on early error returns.

use crate::core::config::{PoolConfig, RetryConfig};
use crate::core::error::{StoreError, StoreResult};
use crate::store::allocator::{self, CasOutcome, CounterStore};
use crate::store::contract::{BackendCapabilities, StoreContract, ENUMERATION_KEY};
use crate::store::keys::{effective_topic, UNIQUE_KEY_TABLE};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Native operations of one document-engine client connection.
///
/// Filters with `topic == None` match across all topics.
#[async_trait]
pub trait DocumentConnection: Send + Sync {
    /// Create the collection if it does not exist yet; idempotent.
    async fn ensure_collection(&self, name: &str) -> StoreResult<()>;

    async fn drop_collection(&self, name: &str) -> StoreResult<bool>;

    async fn collection_exists(&self, name: &str) -> StoreResult<bool>;

    async fn find_one(
        &self,
        collection: &str,
        topic: Option<&str>,
        key: &str,
    ) -> StoreResult<Option<String>>;

    /// Insert or replace; creates the collection implicitly.
    async fn upsert_one(
        &self,
        collection: &str,
        topic: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<()>;

    /// Replace only if a matching document exists; `false` when none did.
    async fn update_one(
        &self,
        collection: &str,
        topic: Option<&str>,
        key: &str,
        value: &str,
    ) -> StoreResult<bool>;

    async fn delete_one(
        &self,
        collection: &str,
        topic: Option<&str>,
        key: &str,
    ) -> StoreResult<bool>;

    async fn find_all(
        &self,
        collection: &str,
        topic: Option<&str>,
    ) -> StoreResult<Vec<(String, String)>>;

    /// Atomic find-and-modify on a counter document.
    async fn modify_counter(
        &self,
        collection: &str,
        counter: &str,
        expected: Option<u64>,
        next: u64,
    ) -> StoreResult<CasOutcome>;
}

/// Dials new client connections.
#[async_trait]
pub trait DocumentConnector: Send + Sync {
    async fn connect(&self, endpoints: &[String]) -> StoreResult<Arc<dyn DocumentConnection>>;
}

/// Bounded pool of client connections.
///
/// Capacity is enforced with a semaphore; idle connections are reused in
/// LIFO order. New connections are dialed lazily, only when a permit is
/// held and no idle connection is available.
pub struct ConnectionPool {
    connector: Arc<dyn DocumentConnector>,
    endpoints: RwLock<Vec<String>>,
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<Arc<dyn DocumentConnection>>>>,
    acquire_timeout: Duration,
}

/// Checked-out connection; returns to the pool on drop.
pub struct PooledConnection {
    conn: Option<Arc<dyn DocumentConnection>>,
    idle: Arc<Mutex<Vec<Arc<dyn DocumentConnection>>>>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn DocumentConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.idle.lock().push(conn);
        }
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn DocumentConnector>, config: &PoolConfig) -> Self {
        Self {
            connector,
            endpoints: RwLock::new(Vec::new()),
            permits: Arc::new(Semaphore::new(config.max_connections)),
            idle: Arc::new(Mutex::new(Vec::new())),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        }
    }

    pub fn set_endpoints(&self, endpoints: &[String]) {
        *self.endpoints.write() = endpoints.to_vec();
    }

    /// Check out a connection, waiting up to the acquire timeout.
    pub async fn acquire(&self) -> StoreResult<PooledConnection> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| StoreError::connection("connection pool exhausted"))?
        .map_err(|_| StoreError::connection("connection pool closed"))?;

        // Pop under the lock, then dial unlocked; holding the idle list
        // across a network dial would block connection returns.
        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                let endpoints = self.endpoints.read().clone();
                self.connector.connect(&endpoints).await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }
}

/// Document backend adapter.
pub struct DocumentStore {
    pool: ConnectionPool,
    retry: RetryConfig,
}

impl DocumentStore {
    pub fn new(connector: Arc<dyn DocumentConnector>, pool: &PoolConfig, retry: RetryConfig) -> Self {
        Self {
            pool: ConnectionPool::new(connector, pool),
            retry,
        }
    }

    async fn collect(
        &self,
        table: &str,
        topic: Option<&str>,
    ) -> StoreResult<Vec<(String, String)>> {
        let conn = self.pool.acquire().await?;
        if !conn.collection_exists(table).await? {
            return Err(StoreError::key_not_found(table, ENUMERATION_KEY));
        }
        conn.find_all(table, topic).await
    }
}

#[async_trait]
impl StoreContract for DocumentStore {
    async fn initialize(&self, endpoints: &[String]) -> StoreResult<()> {
        if endpoints.is_empty() {
            return Err(StoreError::configuration("empty endpoint list"));
        }
        self.pool.set_endpoints(endpoints);
        // Dial once eagerly so a bad endpoint list fails here, not on the
        // first operation.
        let _conn = self.pool.acquire().await?;
        Ok(())
    }

    async fn create_table(&self, table: &str) -> StoreResult<()> {
        // Materialize the collection so enumeration can tell an empty table
        // from a missing one.
        let conn = self.pool.acquire().await?;
        conn.ensure_collection(table).await
    }

    async fn delete_table(&self, table: &str) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        if conn.drop_collection(table).await? {
            Ok(())
        } else {
            Err(StoreError::table_not_found(table))
        }
    }

    async fn get_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<String> {
        let conn = self.pool.acquire().await?;
        conn.find_one(table, topic, key)
            .await?
            .ok_or_else(|| StoreError::key_not_found(table, key))
    }

    async fn set_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        // Writes without a topic target the reserved send-all scope, same as
        // every other adapter; only reads scan across topics.
        if conn
            .update_one(table, Some(effective_topic(topic)), key, value)
            .await?
        {
            Ok(())
        } else {
            Err(StoreError::key_not_found(table, key))
        }
    }

    async fn create_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        conn.upsert_one(table, effective_topic(topic), key, value)
            .await
    }

    async fn delete_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        if conn
            .delete_one(table, Some(effective_topic(topic)), key)
            .await?
        {
            Ok(())
        } else {
            Err(StoreError::key_not_found(table, key))
        }
    }

    async fn get_all_keys(&self, table: &str, topic: Option<&str>) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .collect(table, topic)
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn get_all_entries(&self, table: &str, topic: Option<&str>) -> StoreResult<Vec<String>> {
        Ok(self
            .collect(table, topic)
            .await?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    async fn allocate_unique_key(&self, table: &str) -> StoreResult<u64> {
        allocator::allocate(self, table, &self.retry).await
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::TOPIC_SCAN | BackendCapabilities::CROSS_TOPIC_SCAN
    }
}

#[async_trait]
impl CounterStore for DocumentStore {
    async fn read_counter(&self, table: &str) -> StoreResult<Option<u64>> {
        let conn = self.pool.acquire().await?;
        match conn.find_one(UNIQUE_KEY_TABLE, None, table).await? {
            Some(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(|_| StoreError::connection(format!("corrupt counter for {table}"))),
            None => Ok(None),
        }
    }

    async fn write_counter(
        &self,
        table: &str,
        expected: Option<u64>,
        next: u64,
    ) -> StoreResult<CasOutcome> {
        let conn = self.pool.acquire().await?;
        conn.modify_counter(UNIQUE_KEY_TABLE, table, expected, next)
            .await
    }
}
