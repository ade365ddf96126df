//! Per-type reconciliation protocol.

use crate::cache::CacheSource;
use crate::core::error::StoreResult;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Runs the read/update/delete protocol for one object type.
///
/// `read` snapshots the locally cached IDs as removal candidates, `update`
/// streams store state into the cache and strikes every ID it sees off the
/// candidate set, and `delete` evicts whatever remains: objects present
/// locally but gone from the store.
pub struct CacheRefresher {
    source: Arc<dyn CacheSource>,
    removal_candidates: Mutex<HashSet<String>>,
}

impl CacheRefresher {
    pub fn new(source: Arc<dyn CacheSource>) -> Self {
        Self {
            source,
            removal_candidates: Mutex::new(HashSet::new()),
        }
    }

    pub fn table(&self) -> &str {
        self.source.table()
    }

    /// Snapshot the cached IDs into the removal-candidate set.
    pub async fn read(&self) {
        let ids = self.source.cached_ids().await;
        *self.removal_candidates.lock() = ids.into_iter().collect();
    }

    /// Pull store state into the cache; every object seen is no longer a
    /// removal candidate.
    pub async fn update(&self) -> StoreResult<()> {
        let objects = self.source.store_objects().await?;
        for (id, value) in objects {
            self.source.upsert(&id, &value).await;
            self.removal_candidates.lock().remove(&id);
        }
        Ok(())
    }

    /// Evict every remaining candidate and clear the set.
    pub async fn delete(&self) {
        let stale = std::mem::take(&mut *self.removal_candidates.lock());
        for id in stale {
            tracing::debug!(table = self.table(), id, "evicting stale cache entry");
            self.source.evict(&id).await;
        }
    }

    /// Drop the candidate set without evicting anything.
    ///
    /// Used when `update` failed: candidates may still be live in the store,
    /// and evicting them on a failed read would throw away good state.
    pub fn abandon(&self) {
        self.removal_candidates.lock().clear();
    }
}
