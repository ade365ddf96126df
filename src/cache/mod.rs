//! Local-cache reconciliation against store state.
//!
//! Change delivery is best-effort, so consumers holding a local cache must
//! periodically (and on every `sync` event) reconcile it against the store.
//! Each object type contributes a [`CacheSource`]; a [`refresher::CacheRefresher`]
//! runs the read/update/delete protocol for one type and the
//! [`engine::ReconcileEngine`] drives all registered types in an order that
//! never deletes an object before its referrers have been refreshed.

pub mod engine;
pub mod refresher;

use crate::core::error::StoreResult;
use async_trait::async_trait;

/// Collaborators one object type supplies to the reconciliation protocol.
#[async_trait]
pub trait CacheSource: Send + Sync {
    /// Table name, for diagnostics.
    fn table(&self) -> &str;

    /// IDs currently held in the local cache for this type.
    async fn cached_ids(&self) -> Vec<String>;

    /// Current `(id, value)` objects of this type in the store.
    async fn store_objects(&self) -> StoreResult<Vec<(String, String)>>;

    /// Upsert one stored object into the local cache.
    async fn upsert(&self, id: &str, value: &str);

    /// Drop one object from the local cache.
    async fn evict(&self, id: &str);
}
