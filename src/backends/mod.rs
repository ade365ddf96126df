//! Backend adapters realizing the store contract.
//!
//! One module per storage family. Remote adapters are written against a
//! narrow engine-client trait ([`cluster::ClusterNodeApi`],
//! [`widecolumn::WideColumnSession`], [`document::DocumentConnector`],
//! [`session::SessionClient`], [`objectstore::ObjectStoreApi`],
//! [`coordination::CoordinationApi`]); the adapter owns contract semantics,
//! key encoding, routing, pooling and retries, while the injected client
//! owns the wire.

pub mod cluster;
pub mod coordination;
pub mod document;
pub mod memory;
pub mod objectstore;
pub mod session;
pub mod widecolumn;

use crate::core::config::{Config, BACKEND_KINDS};
use crate::core::error::{StoreError, StoreResult};
use crate::store::contract::StoreContract;
use std::sync::Arc;
use std::time::Duration;

/// Backend families understood by the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Coordination,
    Cluster,
    WideColumn,
    Document,
    Session,
    ObjectStore,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Coordination => "coordination",
            Self::Cluster => "cluster",
            Self::WideColumn => "widecolumn",
            Self::Document => "document",
            Self::Session => "session",
            Self::ObjectStore => "objectstore",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "coordination" => Ok(Self::Coordination),
            "cluster" => Ok(Self::Cluster),
            "widecolumn" => Ok(Self::WideColumn),
            "document" => Ok(Self::Document),
            "session" => Ok(Self::Session),
            "objectstore" => Ok(Self::ObjectStore),
            other => Err(StoreError::configuration(format!(
                "unknown backend '{other}', expected one of {BACKEND_KINDS:?}"
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine clients injected into the factory.
///
/// Each remote backend family needs its client wired in by the embedding
/// application; the factory fails fast when the selected family has none.
#[derive(Default)]
pub struct BackendDrivers {
    pub coordination: Option<Arc<dyn coordination::CoordinationApi>>,
    pub cluster: Option<Arc<dyn cluster::ClusterNodeApi>>,
    pub widecolumn: Option<Arc<dyn widecolumn::WideColumnSession>>,
    pub document: Option<Arc<dyn document::DocumentConnector>>,
    pub session: Option<Arc<dyn session::SessionClient>>,
    pub objectstore: Option<Arc<dyn objectstore::ObjectStoreApi>>,
}

/// Build the configured backend and initialize it against its endpoints.
pub async fn build(
    config: &Config,
    drivers: BackendDrivers,
) -> StoreResult<Arc<dyn StoreContract>> {
    let kind: BackendKind = config.store.backend.parse()?;
    let retry = config.retry.clone();

    let store: Arc<dyn StoreContract> = match kind {
        BackendKind::Memory => Arc::new(memory::MemoryStore::with_topic_selectivity(
            config.notifications.topic_selective,
        )),
        BackendKind::Coordination => {
            let api = drivers
                .coordination
                .ok_or_else(|| missing_driver(kind))?;
            Arc::new(coordination::CoordinationStore::new(
                api,
                retry,
                config.notifications.topic_selective,
            ))
        }
        BackendKind::Cluster => {
            let api = drivers.cluster.ok_or_else(|| missing_driver(kind))?;
            Arc::new(cluster::ClusterStore::new(
                api,
                config.cluster.clone(),
                retry,
            ))
        }
        BackendKind::WideColumn => {
            let session = drivers.widecolumn.ok_or_else(|| missing_driver(kind))?;
            Arc::new(widecolumn::WideColumnStore::new(
                session,
                config.consistency.clone(),
                retry,
            ))
        }
        BackendKind::Document => {
            let connector = drivers.document.ok_or_else(|| missing_driver(kind))?;
            Arc::new(document::DocumentStore::new(
                connector,
                &config.pool,
                retry,
            ))
        }
        BackendKind::Session => {
            let client = drivers.session.ok_or_else(|| missing_driver(kind))?;
            Arc::new(session::SessionStore::new(client, retry))
        }
        BackendKind::ObjectStore => {
            let api = drivers.objectstore.ok_or_else(|| missing_driver(kind))?;
            Arc::new(objectstore::ObjectStore::new(api, retry))
        }
    };

    // Initialization fails within the configured bound instead of hanging
    // on an unreachable endpoint.
    let connect_timeout = Duration::from_millis(config.store.connect_timeout_ms);
    tokio::time::timeout(connect_timeout, store.initialize(&config.store.endpoints))
        .await
        .map_err(|_| {
            StoreError::connection(format!(
                "backend initialization timed out after {}ms",
                config.store.connect_timeout_ms
            ))
        })??;
    Ok(store)
}

fn missing_driver(kind: BackendKind) -> StoreError {
    StoreError::configuration(format!("no engine client wired for backend '{kind}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::allocator::CasOutcome;

    /// Engine client whose connect never completes.
    struct StalledCluster;

    #[async_trait::async_trait]
    impl cluster::ClusterNodeApi for StalledCluster {
        async fn connect(&self, _endpoints: &[String]) -> StoreResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn get(&self, _node: &str, _key: &str) -> StoreResult<Option<String>> {
            Err(StoreError::connection("unreachable"))
        }

        async fn put(&self, _node: &str, _key: &str, _value: &str) -> StoreResult<()> {
            Err(StoreError::connection("unreachable"))
        }

        async fn put_if(
            &self,
            _node: &str,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
        ) -> StoreResult<CasOutcome> {
            Err(StoreError::connection("unreachable"))
        }

        async fn del(&self, _node: &str, _key: &str) -> StoreResult<bool> {
            Err(StoreError::connection("unreachable"))
        }

        async fn scan(&self, _node: &str, _prefix: &str) -> StoreResult<Vec<(String, String)>> {
            Err(StoreError::connection("unreachable"))
        }

        async fn topology(&self, _endpoint: &str) -> StoreResult<Vec<cluster::SlotRange>> {
            Err(StoreError::connection("unreachable"))
        }
    }

    #[test]
    fn kind_round_trip() {
        for name in BACKEND_KINDS {
            let kind: BackendKind = name.parse().unwrap();
            assert_eq!(kind.as_str(), *name);
        }
        assert!("papyrus".parse::<BackendKind>().is_err());
    }

    #[tokio::test]
    async fn factory_builds_memory_backend() {
        let config = Config::from_toml("[store]\nbackend = \"memory\"\n").unwrap();
        let store = build(&config, BackendDrivers::default()).await.unwrap();
        store.create_table("lport").await.unwrap();
        assert!(store.supports_notifications());
    }

    #[tokio::test]
    async fn factory_rejects_unwired_backend() {
        let config = Config::from_toml(
            "[store]\nbackend = \"cluster\"\nendpoints = [\"10.0.0.1:7000\"]\n",
        )
        .unwrap();
        let err = build(&config, BackendDrivers::default())
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration { .. }));
    }

    #[tokio::test]
    async fn factory_bounds_initialization_time() {
        let config = Config::from_toml(
            "[store]\nbackend = \"cluster\"\nendpoints = [\"10.0.0.1:7000\"]\nconnect_timeout_ms = 20\n",
        )
        .unwrap();
        let drivers = BackendDrivers {
            cluster: Some(Arc::new(StalledCluster)),
            ..Default::default()
        };

        let err = build(&config, drivers).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, StoreError::Connection { .. }));
    }
}
