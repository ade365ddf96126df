//! Session-lease coordination backend.
//!
//! Hierarchical node-tree engines that bind clients to an expiring session
//! lease surface expiry as a fault on whatever operation was in flight. The
//! adapter wraps every native call in a bounded exponential-backoff retry:
//! the engine client reconnects under the hood, the retried call lands on
//! the fresh session, and callers only ever see a connection error once the
//! budget is spent. Not-found conditions are answered from the tree, never
//! retried.
//!
//! Layout mirrors the directory backend: `/northbound/{table}/{topic}/{key}`.

use crate::core::config::RetryConfig;
use crate::core::error::{StoreError, StoreResult};
use crate::store::allocator::{self, CasOutcome, CounterStore};
use crate::store::contract::{BackendCapabilities, StoreContract, ENUMERATION_KEY};
use crate::store::keys::{effective_topic, UNIQUE_KEY_TABLE};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

const ROOT_PATH: &str = "/northbound";

/// Native operations of a session-lease node-tree client.
///
/// Any call may fail with a transient fault when the session lease expires
/// mid-flight; the adapter owns the retry policy.
#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn connect(&self, endpoints: &[String]) -> StoreResult<()>;

    /// Create a path and any missing ancestors; idempotent.
    async fn ensure_path(&self, path: &str) -> StoreResult<()>;

    /// Read a node's value and version; `None` if the node is absent.
    async fn get_node(&self, path: &str) -> StoreResult<Option<(String, i64)>>;

    /// Write a node unconditionally, creating missing ancestors.
    async fn put_node(&self, path: &str, value: &str) -> StoreResult<()>;

    /// Write only if the node still carries `version`.
    async fn put_node_versioned(
        &self,
        path: &str,
        value: &str,
        version: i64,
    ) -> StoreResult<CasOutcome>;

    /// Create only if the node does not exist yet.
    async fn create_if_absent(&self, path: &str, value: &str) -> StoreResult<CasOutcome>;

    /// Delete a node; `false` if it was absent.
    async fn delete_node(&self, path: &str) -> StoreResult<bool>;

    /// Child node names under a path; `None` if the path is absent.
    async fn children(&self, path: &str) -> StoreResult<Option<Vec<String>>>;

    /// Delete a subtree; `false` if the root of it was absent.
    async fn delete_recursive(&self, path: &str) -> StoreResult<bool>;
}

/// Session-lease backend adapter.
pub struct SessionStore {
    client: Arc<dyn SessionClient>,
    retry: RetryConfig,
}

fn table_path(table: &str) -> String {
    format!("{ROOT_PATH}/{table}")
}

fn topic_path(table: &str, topic: Option<&str>) -> String {
    format!("{ROOT_PATH}/{table}/{}", effective_topic(topic))
}

fn entry_path(table: &str, key: &str, topic: Option<&str>) -> String {
    format!("{}/{key}", topic_path(table, topic))
}

impl SessionStore {
    pub fn new(client: Arc<dyn SessionClient>, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Run a native call, retrying session-expiry faults within the budget.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(err) if err.is_retriable() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(err.into_exhausted());
                    }
                    tracing::debug!(error = %err, attempt, "session fault, retrying");
                    tokio::time::sleep(self.retry.interval_for_attempt(attempt - 1)).await;
                }
                other => return other,
            }
        }
    }

    async fn get_retried(&self, path: &str) -> StoreResult<Option<(String, i64)>> {
        let client = Arc::clone(&self.client);
        let path = path.to_string();
        self.with_retry(|| {
            let client = Arc::clone(&client);
            let path = path.clone();
            async move { client.get_node(&path).await }
        })
        .await
    }

    async fn children_retried(&self, path: &str) -> StoreResult<Option<Vec<String>>> {
        let client = Arc::clone(&self.client);
        let path = path.to_string();
        self.with_retry(|| {
            let client = Arc::clone(&client);
            let path = path.clone();
            async move { client.children(&path).await }
        })
        .await
    }

    /// Collect `(key, value)` pairs under one topic directory.
    async fn collect_topic(
        &self,
        table: &str,
        topic: &str,
        out: &mut Vec<(String, String)>,
    ) -> StoreResult<()> {
        let dir = format!("{}/{topic}", table_path(table));
        let Some(names) = self.children_retried(&dir).await? else {
            return Ok(());
        };
        for name in names {
            if let Some((value, _)) = self.get_retried(&format!("{dir}/{name}")).await? {
                out.push((name, value));
            }
        }
        Ok(())
    }

    async fn collect(
        &self,
        table: &str,
        topic: Option<&str>,
    ) -> StoreResult<Vec<(String, String)>> {
        let topics = self
            .children_retried(&table_path(table))
            .await?
            .ok_or_else(|| StoreError::key_not_found(table, ENUMERATION_KEY))?;

        let mut out = Vec::new();
        match topic {
            Some(t) => self.collect_topic(table, effective_topic(Some(t)), &mut out).await?,
            None => {
                for t in topics {
                    self.collect_topic(table, &t, &mut out).await?;
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StoreContract for SessionStore {
    async fn initialize(&self, endpoints: &[String]) -> StoreResult<()> {
        if endpoints.is_empty() {
            return Err(StoreError::configuration("empty endpoint list"));
        }
        self.client.connect(endpoints).await?;
        let client = Arc::clone(&self.client);
        self.with_retry(|| {
            let client = Arc::clone(&client);
            async move { client.ensure_path(ROOT_PATH).await }
        })
        .await
    }

    async fn create_table(&self, table: &str) -> StoreResult<()> {
        let client = Arc::clone(&self.client);
        let path = table_path(table);
        self.with_retry(|| {
            let client = Arc::clone(&client);
            let path = path.clone();
            async move { client.ensure_path(&path).await }
        })
        .await
    }

    async fn delete_table(&self, table: &str) -> StoreResult<()> {
        let client = Arc::clone(&self.client);
        let path = table_path(table);
        let removed = self
            .with_retry(|| {
                let client = Arc::clone(&client);
                let path = path.clone();
                async move { client.delete_recursive(&path).await }
            })
            .await?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::table_not_found(table))
        }
    }

    async fn get_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<String> {
        if topic.is_some() {
            return match self.get_retried(&entry_path(table, key, topic)).await? {
                Some((value, _)) => Ok(value),
                None => Err(StoreError::key_not_found(table, key)),
            };
        }

        // No topic: the key may sit under any topic directory.
        let topics = self
            .children_retried(&table_path(table))
            .await?
            .unwrap_or_default();
        for t in topics {
            let path = format!("{}/{t}/{key}", table_path(table));
            if let Some((value, _)) = self.get_retried(&path).await? {
                return Ok(value);
            }
        }
        Err(StoreError::key_not_found(table, key))
    }

    async fn set_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let path = entry_path(table, key, topic);
        if self.get_retried(&path).await?.is_none() {
            return Err(StoreError::key_not_found(table, key));
        }
        let client = Arc::clone(&self.client);
        let value = value.to_string();
        self.with_retry(|| {
            let client = Arc::clone(&client);
            let path = path.clone();
            let value = value.clone();
            async move { client.put_node(&path, &value).await }
        })
        .await
    }

    async fn create_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let client = Arc::clone(&self.client);
        let path = entry_path(table, key, topic);
        let value = value.to_string();
        self.with_retry(|| {
            let client = Arc::clone(&client);
            let path = path.clone();
            let value = value.clone();
            async move { client.put_node(&path, &value).await }
        })
        .await
    }

    async fn delete_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<()> {
        let client = Arc::clone(&self.client);
        let path = entry_path(table, key, topic);
        let removed = self
            .with_retry(|| {
                let client = Arc::clone(&client);
                let path = path.clone();
                async move { client.delete_node(&path).await }
            })
            .await?;
        if removed {
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
impl CounterStore for SessionStore {
    async fn read_counter(&self, table: &str) -> StoreResult<Option<u64>> {
        let path = entry_path(UNIQUE_KEY_TABLE, table, None);
        match self.get_retried(&path).await? {
            Some((raw, _)) => raw
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
        let path = entry_path(UNIQUE_KEY_TABLE, table, None);
        let client = Arc::clone(&self.client);

        match expected {
            None => {
                let next = next.to_string();
                self.with_retry(|| {
                    let client = Arc::clone(&client);
                    let path = path.clone();
                    let next = next.clone();
                    async move { client.create_if_absent(&path, &next).await }
                })
                .await
            }
            Some(expected) => {
                // Version-guarded replace; a lost race shows up as either a
                // changed value or a version mismatch.
                let Some((raw, version)) = self.get_retried(&path).await? else {
                    return Ok(CasOutcome::Conflict);
                };
                if raw.parse::<u64>().ok() != Some(expected) {
                    return Ok(CasOutcome::Conflict);
                }
                let next = next.to_string();
                self.with_retry(|| {
                    let client = Arc::clone(&client);
                    let path = path.clone();
                    let next = next.clone();
                    async move { client.put_node_versioned(&path, &next, version).await }
                })
                .await
            }
        }
    }
}
