//! Ordered multi-type reconciliation driver.

use crate::cache::refresher::CacheRefresher;
use crate::cache::CacheSource;
use std::sync::Arc;

/// Drives the per-type refreshers together.
///
/// Registration order expresses reference direction: register referenced
/// types before the types that point at them. A full pass runs every
/// `read`+`update` in registration order first, then every `delete` in
/// reverse order, so an object is never evicted before its referrers have
/// been refreshed to drop the reference.
#[derive(Default)]
pub struct ReconcileEngine {
    refreshers: Vec<CacheRefresher>,
}

impl ReconcileEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one object type. Order matters; see the type-level docs.
    pub fn register(&mut self, source: Arc<dyn CacheSource>) {
        self.refreshers.push(CacheRefresher::new(source));
    }

    pub fn len(&self) -> usize {
        self.refreshers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refreshers.is_empty()
    }

    /// One full reconciliation pass over every registered type.
    ///
    /// A type whose store read fails is skipped for this pass: its
    /// candidates are abandoned rather than evicted, since they may well
    /// still be live.
    pub async fn reconcile(&self) {
        let mut update_failed = vec![false; self.refreshers.len()];

        for (i, refresher) in self.refreshers.iter().enumerate() {
            refresher.read().await;
            if let Err(err) = refresher.update().await {
                tracing::warn!(
                    table = refresher.table(),
                    error = %err,
                    "cache update failed, keeping local entries"
                );
                refresher.abandon();
                update_failed[i] = true;
            }
        }

        for (i, refresher) in self.refreshers.iter().enumerate().rev() {
            if !update_failed[i] {
                refresher.delete().await;
            }
        }
    }

    /// Flush every local cache: snapshot and evict per type, in reverse
    /// registration order, with no store read.
    pub async fn clear_all(&self) {
        for refresher in self.refreshers.iter().rev() {
            refresher.read().await;
            refresher.delete().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{StoreError, StoreResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Source that logs every protocol call into a shared journal.
    struct JournaledSource {
        table: &'static str,
        cache: Mutex<BTreeMap<String, String>>,
        store: Mutex<Vec<(String, String)>>,
        store_down: Mutex<bool>,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl JournaledSource {
        fn new(
            table: &'static str,
            cached: &[&str],
            stored: &[&str],
            journal: Arc<Mutex<Vec<String>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                table,
                cache: Mutex::new(
                    cached
                        .iter()
                        .map(|k| (k.to_string(), "v".to_string()))
                        .collect(),
                ),
                store: Mutex::new(
                    stored.iter().map(|k| (k.to_string(), "v".to_string())).collect(),
                ),
                store_down: Mutex::new(false),
                journal,
            })
        }
    }

    #[async_trait]
    impl CacheSource for JournaledSource {
        fn table(&self) -> &str {
            self.table
        }

        async fn cached_ids(&self) -> Vec<String> {
            self.cache.lock().keys().cloned().collect()
        }

        async fn store_objects(&self) -> StoreResult<Vec<(String, String)>> {
            if *self.store_down.lock() {
                return Err(StoreError::connection("store unreachable"));
            }
            self.journal.lock().push(format!("update:{}", self.table));
            Ok(self.store.lock().clone())
        }

        async fn upsert(&self, id: &str, value: &str) {
            self.cache.lock().insert(id.to_string(), value.to_string());
        }

        async fn evict(&self, id: &str) {
            self.journal
                .lock()
                .push(format!("evict:{}:{}", self.table, id));
            self.cache.lock().remove(id);
        }
    }

    #[tokio::test]
    async fn updates_run_in_order_and_deletes_in_reverse() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        // Both types have one stale cached entry.
        let switches = JournaledSource::new("lswitch", &["s1", "gone-s"], &["s1"], journal.clone());
        let ports = JournaledSource::new("lport", &["p1", "gone-p"], &["p1"], journal.clone());

        let mut engine = ReconcileEngine::new();
        engine.register(switches);
        engine.register(ports);
        engine.reconcile().await;

        assert_eq!(
            *journal.lock(),
            [
                "update:lswitch",
                "update:lport",
                // Referencing type first on the way down.
                "evict:lport:gone-p",
                "evict:lswitch:gone-s",
            ]
        );
    }

    #[tokio::test]
    async fn failed_type_is_skipped_without_blocking_others() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let switches = JournaledSource::new("lswitch", &["s1"], &[], journal.clone());
        let ports = JournaledSource::new("lport", &["p1"], &[], journal.clone());
        *switches.store_down.lock() = true;

        let mut engine = ReconcileEngine::new();
        engine.register(Arc::clone(&switches) as Arc<dyn CacheSource>);
        engine.register(Arc::clone(&ports) as Arc<dyn CacheSource>);
        engine.reconcile().await;

        // The healthy type still reconciled; the failed one kept its cache.
        assert_eq!(*journal.lock(), ["update:lport", "evict:lport:p1"]);
        assert_eq!(switches.cache.lock().len(), 1);
        assert!(ports.cache.lock().is_empty());
    }

    #[tokio::test]
    async fn clear_all_flushes_in_reverse_without_store_reads() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let switches = JournaledSource::new("lswitch", &["s1"], &["s1"], journal.clone());
        let ports = JournaledSource::new("lport", &["p1"], &["p1"], journal.clone());

        let mut engine = ReconcileEngine::new();
        engine.register(Arc::clone(&switches) as Arc<dyn CacheSource>);
        engine.register(Arc::clone(&ports) as Arc<dyn CacheSource>);
        engine.clear_all().await;

        // No update entries: the store is never consulted.
        assert_eq!(*journal.lock(), ["evict:lport:p1", "evict:lswitch:s1"]);
        assert!(switches.cache.lock().is_empty());
        assert!(ports.cache.lock().is_empty());
    }
}
