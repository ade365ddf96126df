//! Typed-object CRUD helpers.
//!
//! Maps typed objects onto `(table, key, value)` triples through the
//! [`StoredObject`] seam, adds optimistic version compare-and-increment on
//! updates, and pushes a change event into the notification fabric after
//! each successful mutation. The helpers are deliberately thin: multi-entry
//! updates are not transactional, matching the contract.

use crate::core::error::{StoreError, StoreResult};
use crate::notify::event::{Action, ChangeEvent, EventSink};
use crate::store::contract::StoreContract;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// A typed object that can live in the store.
///
/// Implementations are owned by the higher-level object model; the data
/// layer only needs identity, topic scope, and the optimistic version.
pub trait StoredObject: Serialize + DeserializeOwned + Send + Sync {
    /// Table this object type lives in.
    const TABLE: &'static str;

    /// Object identity within the table.
    fn id(&self) -> &str;

    /// Tenant/partition scope, if any.
    fn topic(&self) -> Option<&str>;

    /// Optimistic version, incremented on every update.
    fn version(&self) -> u64;

    /// Replace the optimistic version.
    fn set_version(&mut self, version: u64);
}

/// CRUD helper bound to one store and an optional notification sink.
pub struct ObjectCrud {
    store: Arc<dyn StoreContract>,
    sink: Option<Arc<dyn EventSink>>,
}

impl ObjectCrud {
    /// Create a helper without event publication.
    pub fn new(store: Arc<dyn StoreContract>) -> Self {
        Self { store, sink: None }
    }

    /// Create a helper that publishes a change event after each mutation.
    pub fn with_sink(store: Arc<dyn StoreContract>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            sink: Some(sink),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn StoreContract> {
        &self.store
    }

    /// Read and deserialize one object.
    pub async fn get<T: StoredObject>(&self, id: &str, topic: Option<&str>) -> StoreResult<T> {
        let raw = self.store.get_key(T::TABLE, id, topic).await?;
        decode::<T>(T::TABLE, id, &raw)
    }

    /// Serialize and store a new object (unconditional write).
    pub async fn create<T: StoredObject>(&self, object: &T) -> StoreResult<()> {
        let raw = encode(object)?;
        self.store
            .create_key(T::TABLE, object.id(), &raw, object.topic())
            .await?;
        self.notify(object, Action::Create, Some(raw));
        Ok(())
    }

    /// Update an existing object with version compare-and-increment.
    ///
    /// The stored version must equal the caller's copy; otherwise another
    /// writer got there first and a transient conflict is returned for the
    /// caller to re-read and retry. On success the object's version is
    /// bumped in place.
    pub async fn update<T: StoredObject>(&self, object: &mut T) -> StoreResult<()> {
        let stored: T = self.get(object.id(), object.topic()).await?;
        if stored.version() != object.version() {
            return Err(StoreError::transient(format!(
                "version conflict on {}/{}: stored {}, caller {}",
                T::TABLE,
                object.id(),
                stored.version(),
                object.version()
            )));
        }

        object.set_version(object.version() + 1);
        let raw = encode(object)?;
        self.store
            .set_key(T::TABLE, object.id(), &raw, object.topic())
            .await?;
        self.notify(object, Action::Set, Some(raw));
        Ok(())
    }

    /// Delete one object.
    pub async fn delete<T: StoredObject>(&self, id: &str, topic: Option<&str>) -> StoreResult<()> {
        self.store.delete_key(T::TABLE, id, topic).await?;
        if let Some(sink) = &self.sink {
            sink.publish(&ChangeEvent::new(
                T::TABLE,
                id,
                Action::Delete,
                None,
                topic.map(str::to_string),
            ));
        }
        Ok(())
    }

    /// Read and deserialize every object of a type, optionally scoped.
    pub async fn get_all<T: StoredObject>(&self, topic: Option<&str>) -> StoreResult<Vec<T>> {
        let raws = self.store.get_all_entries(T::TABLE, topic).await?;
        raws.iter()
            .map(|raw| decode::<T>(T::TABLE, "<entry>", raw))
            .collect()
    }

    fn notify<T: StoredObject>(&self, object: &T, action: Action, value: Option<String>) {
        if let Some(sink) = &self.sink {
            sink.publish(&ChangeEvent::new(
                T::TABLE,
                object.id(),
                action,
                value,
                object.topic().map(str::to_string),
            ));
        }
    }
}

fn encode<T: Serialize>(object: &T) -> StoreResult<String> {
    serde_json::to_string(object)
        .map_err(|err| StoreError::connection(format!("object serialization failed: {err}")))
}

fn decode<T: DeserializeOwned>(table: &str, key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|err| {
        StoreError::connection(format!("malformed stored object {table}/{key}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryStore;
    use crate::notify::event::EventFanout;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Port {
        id: String,
        topic: Option<String>,
        version: u64,
        admin_up: bool,
    }

    impl StoredObject for Port {
        const TABLE: &'static str = "lport";

        fn id(&self) -> &str {
            &self.id
        }

        fn topic(&self) -> Option<&str> {
            self.topic.as_deref()
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn port(id: &str) -> Port {
        Port {
            id: id.to_string(),
            topic: Some("tenant-a".to_string()),
            version: 0,
            admin_up: true,
        }
    }

    async fn crud() -> ObjectCrud {
        let store = Arc::new(MemoryStore::new());
        store.create_table("lport").await.unwrap();
        ObjectCrud::new(store)
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let crud = crud().await;
        crud.create(&port("p1")).await.unwrap();
        let loaded: Port = crud.get("p1", Some("tenant-a")).await.unwrap();
        assert_eq!(loaded.id, "p1");
        assert!(loaded.admin_up);
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let crud = crud().await;
        crud.create(&port("p1")).await.unwrap();

        let mut loaded: Port = crud.get("p1", Some("tenant-a")).await.unwrap();
        loaded.admin_up = false;
        crud.update(&mut loaded).await.unwrap();
        assert_eq!(loaded.version, 1);

        let reread: Port = crud.get("p1", Some("tenant-a")).await.unwrap();
        assert_eq!(reread.version, 1);
        assert!(!reread.admin_up);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let crud = crud().await;
        crud.create(&port("p1")).await.unwrap();

        let mut first: Port = crud.get("p1", Some("tenant-a")).await.unwrap();
        let mut second: Port = crud.get("p1", Some("tenant-a")).await.unwrap();

        crud.update(&mut first).await.unwrap();

        let err = crud.update(&mut second).await.unwrap_err();
        assert!(err.is_retriable(), "stale update must be a transient fault");
    }

    #[tokio::test]
    async fn mutations_reach_the_sink() {
        let store = Arc::new(MemoryStore::new());
        store.create_table("lport").await.unwrap();
        let fanout = Arc::new(EventFanout::new(false));
        let mut sub = fanout.subscribe();
        let crud = ObjectCrud::with_sink(store, fanout);

        crud.create(&port("p1")).await.unwrap();
        let mut loaded: Port = crud.get("p1", Some("tenant-a")).await.unwrap();
        crud.update(&mut loaded).await.unwrap();
        crud.delete::<Port>("p1", Some("tenant-a")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().action, Action::Create);
        assert_eq!(sub.recv().await.unwrap().action, Action::Set);
        assert_eq!(sub.recv().await.unwrap().action, Action::Delete);
    }

    #[tokio::test]
    async fn get_all_deserializes_every_entry() {
        let crud = crud().await;
        crud.create(&port("p1")).await.unwrap();
        crud.create(&port("p2")).await.unwrap();

        let mut ports: Vec<Port> = crud.get_all(Some("tenant-a")).await.unwrap();
        ports.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].id, "p1");
        assert_eq!(ports[1].id, "p2");
    }
}
