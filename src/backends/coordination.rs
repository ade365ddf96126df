//! Directory/path coordination-store adapter.
//!
//! Maps the flat `(table, key, value, topic)` model onto a hierarchical
//! path namespace: `/northbound/{table}/{topic}/{key}`. Tables are
//! directories, enumeration lists children, and writes targeting a missing
//! parent auto-create intermediate segments. The engine's long-poll watch is
//! surfaced through the [`WatchSource`] seam so the shared watch driver can
//! feed subscribers.

use crate::core::config::RetryConfig;
use crate::core::error::{StoreError, StoreResult};
use crate::notify::event::{EventFanout, EventSubscription};
use crate::notify::watch::{WatchPoll, WatchSource};
use crate::store::allocator::{self, CasOutcome, CounterStore};
use crate::store::contract::{BackendCapabilities, StoreContract, ENUMERATION_KEY};
use crate::store::keys::{effective_topic, UNIQUE_KEY_TABLE};
use async_trait::async_trait;
use std::sync::Arc;

/// Root of the northbound namespace.
pub const ROOT_PATH: &str = "/northbound";

/// A child of a directory listing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Last path segment.
    pub name: String,
    /// Leaf value; `None` when the child is itself a directory.
    pub value: Option<String>,
}

/// Native primitives of a directory/path coordination store.
///
/// The engine is expected to auto-create intermediate directories on
/// `write`, and to expose a monotonically indexed change feed for watches.
#[async_trait]
pub trait CoordinationApi: Send + Sync {
    /// Establish connectivity; idempotent.
    async fn connect(&self, endpoints: &[String]) -> StoreResult<()>;

    /// Read a leaf value; `None` if the path is absent.
    async fn read(&self, path: &str) -> StoreResult<Option<String>>;

    /// Write a leaf value, creating intermediate directories as needed.
    async fn write(&self, path: &str, value: &str) -> StoreResult<()>;

    /// Conditional leaf write: succeeds only while the stored value still
    /// equals `expected` (`None` = create-if-absent).
    async fn compare_and_swap(
        &self,
        path: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<CasOutcome>;

    /// Remove a leaf; returns whether it existed.
    async fn remove(&self, path: &str) -> StoreResult<bool>;

    /// List direct children of a directory; `None` if the directory is
    /// absent.
    async fn list_dir(&self, path: &str) -> StoreResult<Option<Vec<DirEntry>>>;

    /// Create a directory; idempotent.
    async fn make_dir(&self, path: &str) -> StoreResult<()>;

    /// Remove a directory recursively; returns whether it existed.
    async fn remove_dir(&self, path: &str) -> StoreResult<bool>;

    /// Long-poll the change feed from a change index.
    async fn watch_next(&self, from_index: u64) -> StoreResult<WatchPoll>;
}

/// Coordination-store backend adapter.
pub struct CoordinationStore {
    api: Arc<dyn CoordinationApi>,
    fanout: Arc<EventFanout>,
    retry: RetryConfig,
}

impl CoordinationStore {
    /// Create an adapter over an engine session.
    pub fn new(api: Arc<dyn CoordinationApi>, retry: RetryConfig, topic_selective: bool) -> Self {
        Self {
            api,
            fanout: Arc::new(EventFanout::new(topic_selective)),
            retry,
        }
    }

    /// The fan-out the watch driver should feed.
    pub fn fanout(&self) -> Arc<EventFanout> {
        Arc::clone(&self.fanout)
    }

    /// Watch source for the shared watch driver.
    pub fn watch_source(&self) -> Arc<dyn WatchSource> {
        Arc::new(CoordinationWatch {
            api: Arc::clone(&self.api),
        })
    }

    fn table_path(table: &str) -> String {
        format!("{ROOT_PATH}/{table}")
    }

    fn topic_path(table: &str, topic: Option<&str>) -> String {
        format!("{ROOT_PATH}/{table}/{}", effective_topic(topic))
    }

    fn entry_path(table: &str, key: &str, topic: Option<&str>) -> String {
        format!("{}/{key}", Self::topic_path(table, topic))
    }

    /// Collect `(key, value)` pairs for a table, scoped or across topics.
    async fn collect(
        &self,
        table: &str,
        topic: Option<&str>,
    ) -> StoreResult<Vec<(String, String)>> {
        let topic_dirs = self
            .api
            .list_dir(&Self::table_path(table))
            .await?
            .ok_or_else(|| StoreError::key_not_found(table, ENUMERATION_KEY))?;

        let wanted: Option<&str> = topic.map(effective_topic_of);
        let mut pairs = Vec::new();
        for dir in topic_dirs {
            if dir.value.is_some() {
                continue; // stray leaf directly under the table
            }
            if let Some(w) = wanted {
                if dir.name != w {
                    continue;
                }
            }
            let children = self
                .api
                .list_dir(&format!("{}/{}", Self::table_path(table), dir.name))
                .await?
                .unwrap_or_default();
            for child in children {
                if let Some(value) = child.value {
                    pairs.push((child.name, value));
                }
            }
        }
        Ok(pairs)
    }
}

fn effective_topic_of(topic: &str) -> &str {
    effective_topic(Some(topic))
}

#[async_trait]
impl StoreContract for CoordinationStore {
    async fn initialize(&self, endpoints: &[String]) -> StoreResult<()> {
        self.api.connect(endpoints).await?;
        self.api.make_dir(ROOT_PATH).await
    }

    async fn create_table(&self, table: &str) -> StoreResult<()> {
        self.api.make_dir(&Self::table_path(table)).await
    }

    async fn delete_table(&self, table: &str) -> StoreResult<()> {
        if self.api.remove_dir(&Self::table_path(table)).await? {
            Ok(())
        } else {
            Err(StoreError::table_not_found(table))
        }
    }

    async fn get_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<String> {
        if topic.is_some() {
            return self
                .api
                .read(&Self::entry_path(table, key, topic))
                .await?
                .ok_or_else(|| StoreError::key_not_found(table, key));
        }

        // No topic: the key may live under any topic directory.
        let pairs = self
            .collect(table, None)
            .await
            .map_err(|_| StoreError::key_not_found(table, key))?;
        pairs
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or_else(|| StoreError::key_not_found(table, key))
    }

    async fn set_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let path = Self::entry_path(table, key, topic);
        if self.api.read(&path).await?.is_none() {
            return Err(StoreError::key_not_found(table, key));
        }
        self.api.write(&path, value).await
    }

    async fn create_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        // Unconditional write; the engine auto-creates parent segments.
        self.api
            .write(&Self::entry_path(table, key, topic), value)
            .await
    }

    async fn delete_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<()> {
        if self
            .api
            .remove(&Self::entry_path(table, key, topic))
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
        BackendCapabilities::NATIVE_NOTIFICATIONS
            | BackendCapabilities::TOPIC_SCAN
            | BackendCapabilities::CROSS_TOPIC_SCAN
    }

    fn subscribe(&self) -> Option<EventSubscription> {
        Some(self.fanout.subscribe())
    }
}

#[async_trait]
impl CounterStore for CoordinationStore {
    async fn read_counter(&self, table: &str) -> StoreResult<Option<u64>> {
        let path = Self::entry_path(UNIQUE_KEY_TABLE, table, None);
        match self.api.read(&path).await? {
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
        let path = Self::entry_path(UNIQUE_KEY_TABLE, table, None);
        let expected = expected.map(|v| v.to_string());
        self.api
            .compare_and_swap(&path, expected.as_deref(), &next.to_string())
            .await
    }
}

struct CoordinationWatch {
    api: Arc<dyn CoordinationApi>,
}

#[async_trait]
impl WatchSource for CoordinationWatch {
    async fn poll(&self, from_index: u64) -> StoreResult<WatchPoll> {
        self.api.watch_next(from_index).await
    }
}
