//! Shared fixtures for integration tests.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trellis::backends::memory::MemoryStore;
use trellis::store::crud::StoredObject;
use trellis::StoreContract;

/// Memory backend with the given tables pre-created.
pub async fn memory_store(tables: &[&str]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for table in tables {
        store.create_table(table).await.unwrap();
    }
    store
}

/// A minimal typed object for CRUD round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub topic: Option<String>,
    pub version: u64,
    pub chassis: String,
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

pub fn port(id: &str, topic: &str) -> Port {
    Port {
        id: id.to_string(),
        topic: Some(topic.to_string()),
        version: 0,
        chassis: "compute-1".to_string(),
    }
}
