//! In-process backend.
//!
//! The reference realization of the store contract: a topic-partitioned map
//! guarded by one lock, with native change delivery through an event
//! fan-out. Single-node deployments run on it directly and the test suite
//! uses it as the authoritative semantics oracle. It is an explicit owned
//! object; nothing here lives in module-level state.

use crate::core::config::RetryConfig;
use crate::core::error::{StoreError, StoreResult};
use crate::notify::event::{Action, ChangeEvent, EventFanout, EventSubscription};
use crate::store::allocator::{self, CasOutcome, CounterStore};
use crate::store::contract::{BackendCapabilities, StoreContract, ENUMERATION_KEY};
use crate::store::keys::{effective_topic, UNIQUE_KEY_TABLE};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Entries of one table, partitioned by topic.
type TopicMap = BTreeMap<String, BTreeMap<String, String>>;

/// In-memory store with native notifications.
pub struct MemoryStore {
    tables: RwLock<HashMap<String, TopicMap>>,
    fanout: EventFanout,
    retry: RetryConfig,
}

impl MemoryStore {
    /// Create a store with broadcast (non-selective) notification fan-out.
    pub fn new() -> Self {
        Self::with_topic_selectivity(false)
    }

    /// Create a store, choosing whether notifications are filtered per
    /// topic or broadcast to every subscriber.
    pub fn with_topic_selectivity(topic_selective: bool) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            fanout: EventFanout::new(topic_selective),
            retry: RetryConfig::default(),
        }
    }

    /// Subscribe to a set of topics. An empty set receives everything.
    pub fn subscribe_topics(&self, topics: Vec<String>) -> EventSubscription {
        self.fanout.subscribe_topics(topics)
    }

    fn publish(&self, table: &str, key: &str, action: Action, value: Option<String>, topic: &str) {
        self.fanout.publish(&ChangeEvent::new(
            table,
            key,
            action,
            value,
            Some(topic.to_string()),
        ));
    }

    fn enumeration_error(table: &str) -> StoreError {
        StoreError::key_not_found(table, ENUMERATION_KEY)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreContract for MemoryStore {
    async fn initialize(&self, _endpoints: &[String]) -> StoreResult<()> {
        Ok(())
    }

    async fn create_table(&self, table: &str) -> StoreResult<()> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_insert_with(TopicMap::new);
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> StoreResult<()> {
        match self.tables.write().remove(table) {
            Some(_) => Ok(()),
            None => Err(StoreError::table_not_found(table)),
        }
    }

    async fn get_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<String> {
        let tables = self.tables.read();
        let topics = tables
            .get(table)
            .ok_or_else(|| StoreError::key_not_found(table, key))?;

        match topic {
            Some(t) => topics
                .get(effective_topic(Some(t)))
                .and_then(|entries| entries.get(key))
                .cloned()
                .ok_or_else(|| StoreError::key_not_found(table, key)),
            // No topic: the key may live under any topic scope.
            None => topics
                .values()
                .find_map(|entries| entries.get(key))
                .cloned()
                .ok_or_else(|| StoreError::key_not_found(table, key)),
        }
    }

    async fn set_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let topic = effective_topic(topic).to_string();
        {
            let mut tables = self.tables.write();
            let entries = tables
                .get_mut(table)
                .and_then(|topics| topics.get_mut(&topic))
                .and_then(|entries| entries.get_mut(key))
                .ok_or_else(|| StoreError::key_not_found(table, key))?;
            *entries = value.to_string();
        }
        self.publish(table, key, Action::Set, Some(value.to_string()), &topic);
        Ok(())
    }

    async fn create_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let topic = effective_topic(topic).to_string();
        {
            let mut tables = self.tables.write();
            // Writes targeting an absent table create it, mirroring
            // path-style backends that auto-create parents.
            let topics = tables.entry(table.to_string()).or_insert_with(TopicMap::new);
            topics
                .entry(topic.clone())
                .or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
        }
        self.publish(table, key, Action::Create, Some(value.to_string()), &topic);
        Ok(())
    }

    async fn delete_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<()> {
        let topic = effective_topic(topic).to_string();
        {
            let mut tables = self.tables.write();
            let removed = tables
                .get_mut(table)
                .and_then(|topics| topics.get_mut(&topic))
                .and_then(|entries| entries.remove(key));
            if removed.is_none() {
                return Err(StoreError::key_not_found(table, key));
            }
        }
        self.publish(table, key, Action::Delete, None, &topic);
        Ok(())
    }

    async fn get_all_keys(&self, table: &str, topic: Option<&str>) -> StoreResult<Vec<String>> {
        let tables = self.tables.read();
        let topics = tables
            .get(table)
            .ok_or_else(|| Self::enumeration_error(table))?;

        let mut keys: Vec<String> = match topic {
            Some(t) => topics
                .get(effective_topic(Some(t)))
                .map(|entries| entries.keys().cloned().collect())
                .unwrap_or_default(),
            None => topics
                .values()
                .flat_map(|entries| entries.keys().cloned())
                .collect(),
        };
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn get_all_entries(&self, table: &str, topic: Option<&str>) -> StoreResult<Vec<String>> {
        let tables = self.tables.read();
        let topics = tables
            .get(table)
            .ok_or_else(|| Self::enumeration_error(table))?;

        let values: Vec<String> = match topic {
            Some(t) => topics
                .get(effective_topic(Some(t)))
                .map(|entries| entries.values().cloned().collect())
                .unwrap_or_default(),
            None => topics
                .values()
                .flat_map(|entries| entries.values().cloned())
                .collect(),
        };
        Ok(values)
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
impl CounterStore for MemoryStore {
    async fn read_counter(&self, table: &str) -> StoreResult<Option<u64>> {
        let tables = self.tables.read();
        let value = tables
            .get(UNIQUE_KEY_TABLE)
            .and_then(|topics| topics.values().find_map(|entries| entries.get(table)));
        match value {
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
        let mut tables = self.tables.write();
        let topics = tables
            .entry(UNIQUE_KEY_TABLE.to_string())
            .or_insert_with(TopicMap::new);
        let entries = topics
            .entry(effective_topic(None).to_string())
            .or_insert_with(BTreeMap::new);

        let stored = entries.get(table).and_then(|raw| raw.parse::<u64>().ok());
        if stored != expected {
            return Ok(CasOutcome::Conflict);
        }
        entries.insert(table.to_string(), next.to_string());
        Ok(CasOutcome::Committed)
    }
}
