//! Object-store adapter with numeric container handles.
//!
//! The engine addresses containers by numeric handle, not by name, so the
//! adapter keeps a name→handle registry populated lazily from the engine's
//! name lookup. One container per logical table; object names carry the
//! topic as a `topic/key` prefix so topic-scoped enumeration is a prefix
//! listing inside one container.

use crate::core::config::RetryConfig;
use crate::core::error::{StoreError, StoreResult};
use crate::store::allocator::{self, CasOutcome, CounterStore};
use crate::store::contract::{BackendCapabilities, StoreContract, ENUMERATION_KEY};
use crate::store::keys::{effective_topic, UNIQUE_KEY_TABLE};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Native operations of an object-store engine.
#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    async fn connect(&self, endpoints: &[String]) -> StoreResult<()>;

    /// Create-or-open a container by name, returning its handle.
    async fn open_container(&self, name: &str) -> StoreResult<u32>;

    /// Resolve an existing container's handle; `None` if absent.
    async fn lookup_container(&self, name: &str) -> StoreResult<Option<u32>>;

    async fn drop_container(&self, handle: u32) -> StoreResult<()>;

    async fn read(&self, handle: u32, name: &str) -> StoreResult<Option<String>>;

    async fn write(&self, handle: u32, name: &str, value: &str) -> StoreResult<()>;

    async fn write_if(
        &self,
        handle: u32,
        name: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<CasOutcome>;

    async fn remove(&self, handle: u32, name: &str) -> StoreResult<bool>;

    /// List `(name, value)` pairs whose name starts with `prefix`.
    async fn list(&self, handle: u32, prefix: &str) -> StoreResult<Vec<(String, String)>>;
}

/// Object name inside a container: `topic/key`.
fn object_name(key: &str, topic: Option<&str>) -> String {
    format!("{}/{key}", effective_topic(topic))
}

/// Strip the topic prefix off a listed object name.
fn key_of(name: &str) -> Option<&str> {
    name.split_once('/').map(|(_, key)| key)
}

/// Object-store backend adapter.
pub struct ObjectStore {
    api: Arc<dyn ObjectStoreApi>,
    handles: RwLock<HashMap<String, u32>>,
    retry: RetryConfig,
}

impl ObjectStore {
    pub fn new(api: Arc<dyn ObjectStoreApi>, retry: RetryConfig) -> Self {
        Self {
            api,
            handles: RwLock::new(HashMap::new()),
            retry,
        }
    }

    /// Resolve a table's container handle without creating it.
    async fn handle(&self, table: &str) -> StoreResult<Option<u32>> {
        if let Some(handle) = self.handles.read().get(table).copied() {
            return Ok(Some(handle));
        }
        match self.api.lookup_container(table).await? {
            Some(handle) => {
                self.handles.write().insert(table.to_string(), handle);
                Ok(Some(handle))
            }
            None => Ok(None),
        }
    }

    /// Resolve a handle, creating the container when absent.
    async fn handle_or_create(&self, table: &str) -> StoreResult<u32> {
        if let Some(handle) = self.handle(table).await? {
            return Ok(handle);
        }
        let handle = self.api.open_container(table).await?;
        self.handles.write().insert(table.to_string(), handle);
        Ok(handle)
    }

    async fn collect(
        &self,
        table: &str,
        topic: Option<&str>,
    ) -> StoreResult<Vec<(String, String)>> {
        let handle = self
            .handle(table)
            .await?
            .ok_or_else(|| StoreError::key_not_found(table, ENUMERATION_KEY))?;
        let prefix = match topic {
            Some(t) => format!("{}/", effective_topic(Some(t))),
            None => String::new(),
        };
        Ok(self
            .api
            .list(handle, &prefix)
            .await?
            .into_iter()
            .filter_map(|(name, value)| key_of(&name).map(|k| (k.to_string(), value)))
            .collect())
    }
}

#[async_trait]
impl StoreContract for ObjectStore {
    async fn initialize(&self, endpoints: &[String]) -> StoreResult<()> {
        if endpoints.is_empty() {
            return Err(StoreError::configuration("empty endpoint list"));
        }
        self.api.connect(endpoints).await?;
        // The allocator container always exists.
        self.handle_or_create(UNIQUE_KEY_TABLE).await.map(|_| ())
    }

    async fn create_table(&self, table: &str) -> StoreResult<()> {
        self.handle_or_create(table).await.map(|_| ())
    }

    async fn delete_table(&self, table: &str) -> StoreResult<()> {
        let handle = self
            .handle(table)
            .await?
            .ok_or_else(|| StoreError::table_not_found(table))?;
        self.api.drop_container(handle).await?;
        self.handles.write().remove(table);
        Ok(())
    }

    async fn get_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<String> {
        let Some(handle) = self.handle(table).await? else {
            return Err(StoreError::key_not_found(table, key));
        };

        if topic.is_some() {
            return self
                .api
                .read(handle, &object_name(key, topic))
                .await?
                .ok_or_else(|| StoreError::key_not_found(table, key));
        }

        // No topic: the key may sit under any topic prefix.
        let suffix = format!("/{key}");
        self.api
            .list(handle, "")
            .await?
            .into_iter()
            .find(|(name, _)| name.ends_with(&suffix))
            .map(|(_, value)| value)
            .ok_or_else(|| StoreError::key_not_found(table, key))
    }

    async fn set_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let Some(handle) = self.handle(table).await? else {
            return Err(StoreError::key_not_found(table, key));
        };
        let name = object_name(key, topic);
        if self.api.read(handle, &name).await?.is_none() {
            return Err(StoreError::key_not_found(table, key));
        }
        self.api.write(handle, &name, value).await
    }

    async fn create_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let handle = self.handle_or_create(table).await?;
        self.api.write(handle, &object_name(key, topic), value).await
    }

    async fn delete_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<()> {
        let Some(handle) = self.handle(table).await? else {
            return Err(StoreError::key_not_found(table, key));
        };
        if self.api.remove(handle, &object_name(key, topic)).await? {
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
impl CounterStore for ObjectStore {
    async fn read_counter(&self, table: &str) -> StoreResult<Option<u64>> {
        let handle = self.handle_or_create(UNIQUE_KEY_TABLE).await?;
        match self.api.read(handle, &object_name(table, None)).await? {
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
        let handle = self.handle_or_create(UNIQUE_KEY_TABLE).await?;
        let expected = expected.map(|v| v.to_string());
        self.api
            .write_if(
                handle,
                &object_name(table, None),
                expected.as_deref(),
                &next.to_string(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Handle-addressed engine; names resolve through a catalog.
    #[derive(Default)]
    struct FakeVault {
        catalog: Mutex<HashMap<String, u32>>,
        containers: Mutex<HashMap<u32, BTreeMap<String, String>>>,
        next_handle: AtomicU32,
        lookups: AtomicU32,
    }

    #[async_trait]
    impl ObjectStoreApi for FakeVault {
        async fn connect(&self, _endpoints: &[String]) -> StoreResult<()> {
            Ok(())
        }

        async fn open_container(&self, name: &str) -> StoreResult<u32> {
            let mut catalog = self.catalog.lock();
            if let Some(handle) = catalog.get(name) {
                return Ok(*handle);
            }
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
            catalog.insert(name.to_string(), handle);
            self.containers.lock().insert(handle, BTreeMap::new());
            Ok(handle)
        }

        async fn lookup_container(&self, name: &str) -> StoreResult<Option<u32>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.catalog.lock().get(name).copied())
        }

        async fn drop_container(&self, handle: u32) -> StoreResult<()> {
            self.containers.lock().remove(&handle);
            self.catalog.lock().retain(|_, h| *h != handle);
            Ok(())
        }

        async fn read(&self, handle: u32, name: &str) -> StoreResult<Option<String>> {
            Ok(self
                .containers
                .lock()
                .get(&handle)
                .and_then(|c| c.get(name))
                .cloned())
        }

        async fn write(&self, handle: u32, name: &str, value: &str) -> StoreResult<()> {
            self.containers
                .lock()
                .get_mut(&handle)
                .ok_or_else(|| StoreError::connection("stale container handle"))?
                .insert(name.to_string(), value.to_string());
            Ok(())
        }

        async fn write_if(
            &self,
            handle: u32,
            name: &str,
            expected: Option<&str>,
            value: &str,
        ) -> StoreResult<CasOutcome> {
            let mut containers = self.containers.lock();
            let container = containers
                .get_mut(&handle)
                .ok_or_else(|| StoreError::connection("stale container handle"))?;
            if container.get(name).map(String::as_str) != expected {
                return Ok(CasOutcome::Conflict);
            }
            container.insert(name.to_string(), value.to_string());
            Ok(CasOutcome::Committed)
        }

        async fn remove(&self, handle: u32, name: &str) -> StoreResult<bool> {
            Ok(self
                .containers
                .lock()
                .get_mut(&handle)
                .map(|c| c.remove(name).is_some())
                .unwrap_or(false))
        }

        async fn list(&self, handle: u32, prefix: &str) -> StoreResult<Vec<(String, String)>> {
            Ok(self
                .containers
                .lock()
                .get(&handle)
                .map(|c| {
                    c.iter()
                        .filter(|(n, _)| n.starts_with(prefix))
                        .map(|(n, v)| (n.clone(), v.clone()))
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    async fn store(vault: Arc<FakeVault>) -> ObjectStore {
        let store = ObjectStore::new(vault, RetryConfig::default());
        store.initialize(&["10.0.0.1:8000".to_string()]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn contract_semantics() {
        let store = store(Arc::new(FakeVault::default())).await;
        store.create_table("lport").await.unwrap();

        let err = store.set_key("lport", "p1", "v", Some("t")).await.unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound { .. }));

        store.create_key("lport", "p1", "v1", Some("t")).await.unwrap();
        store.set_key("lport", "p1", "v2", Some("t")).await.unwrap();
        assert_eq!(store.get_key("lport", "p1", Some("t")).await.unwrap(), "v2");
        assert_eq!(store.get_key("lport", "p1", None).await.unwrap(), "v2");

        store.delete_key("lport", "p1", Some("t")).await.unwrap();
        let err = store.get_key("lport", "p1", Some("t")).await.unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn handles_are_cached_after_first_lookup() {
        let vault = Arc::new(FakeVault::default());
        let store = store(Arc::clone(&vault)).await;
        store.create_table("lport").await.unwrap();

        let before = vault.lookups.load(Ordering::SeqCst);
        for i in 0..10 {
            store
                .create_key("lport", &format!("p{i}"), "v", Some("t"))
                .await
                .unwrap();
        }
        // Registry answers every resolution after the first.
        assert_eq!(vault.lookups.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn topic_prefix_listing() {
        let store = store(Arc::new(FakeVault::default())).await;
        store.create_key("lport", "p1", "v1", Some("tenant-a")).await.unwrap();
        store.create_key("lport", "p2", "v2", Some("tenant-b")).await.unwrap();

        assert_eq!(
            store.get_all_keys("lport", Some("tenant-a")).await.unwrap(),
            ["p1"]
        );
        assert_eq!(store.get_all_keys("lport", None).await.unwrap(), ["p1", "p2"]);
    }

    #[tokio::test]
    async fn table_lifecycle_and_missing_table_errors() {
        let store = store(Arc::new(FakeVault::default())).await;

        let err = store.get_all_keys("lport", None).await.unwrap_err();
        match err {
            StoreError::KeyNotFound { key, .. } => assert_eq!(key, "*"),
            other => panic!("unexpected error: {other}"),
        }
        let err = store.delete_table("lport").await.unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound { .. }));

        store.create_table("lport").await.unwrap();
        assert!(store.get_all_keys("lport", None).await.unwrap().is_empty());
        store.delete_table("lport").await.unwrap();
    }

    #[tokio::test]
    async fn allocator_over_conditional_writes() {
        let store = store(Arc::new(FakeVault::default())).await;
        assert_eq!(store.allocate_unique_key("lport").await.unwrap(), 1);
        assert_eq!(store.allocate_unique_key("lport").await.unwrap(), 2);
    }
}
