//! Consistent-hash slot-routing adapter.
//!
//! For in-memory cluster engines with no table or topic concept: entries are
//! stored under the physical key `{table.topic}.key`, the brace-grouped
//! substring is hashed with CRC16-XMODEM and reduced modulo the fixed slot
//! count, and the owning node is looked up in a periodically refreshed
//! topology snapshot. Because all entries of one table+topic pair share a
//! hash group, they land on one node and topic-scoped enumeration is a
//! single-node prefix scan. Stale routing after resharding or failover
//! never corrupts data: the affected operation fails with a connection
//! error, the snapshot is invalidated, and the next operation re-resolves
//! routing lazily.

use crate::core::config::{ClusterConfig, RetryConfig};
use crate::core::error::{StoreError, StoreResult};
use crate::store::allocator::{self, CasOutcome, CounterStore};
use crate::store::contract::{BackendCapabilities, StoreContract, ENUMERATION_KEY};
use crate::store::keys::{hashtag, physical_key, split_physical, table_prefix, UNIQUE_KEY_TABLE};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reserved table registering created tables, so enumeration can tell a
/// missing table from an empty one on an engine that has no table concept.
const TABLE_REGISTRY: &str = "_tables";

/// CRC16-XMODEM (polynomial 0x1021), the slot-routing wire convention.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Slot owning a physical key within a fixed slot space.
pub fn slot_for_key(physical: &str, slot_count: u16) -> u16 {
    crc16(hashtag(physical).as_bytes()) % slot_count
}

/// A contiguous slot range owned by one master node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// First slot, inclusive.
    pub start: u16,
    /// Last slot, inclusive.
    pub end: u16,
    /// Owning master, `host:port`.
    pub node: String,
}

/// Snapshot of cluster slot ownership.
///
/// Ranges must partition the slot space: no gaps, no overlaps among
/// masters.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    ranges: Vec<SlotRange>,
    slot_count: u16,
}

impl ClusterTopology {
    /// Build and validate a snapshot.
    pub fn new(mut ranges: Vec<SlotRange>, slot_count: u16) -> StoreResult<Self> {
        if ranges.is_empty() {
            return Err(StoreError::configuration("empty cluster topology"));
        }
        ranges.sort_by_key(|r| r.start);

        let mut expected_start: u32 = 0;
        for range in &ranges {
            if u32::from(range.start) != expected_start {
                return Err(StoreError::configuration(format!(
                    "slot space not partitioned: expected slot {}, range starts at {}",
                    expected_start, range.start
                )));
            }
            if range.end < range.start {
                return Err(StoreError::configuration(format!(
                    "inverted slot range {}-{}",
                    range.start, range.end
                )));
            }
            expected_start = u32::from(range.end) + 1;
        }
        if expected_start != u32::from(slot_count) {
            return Err(StoreError::configuration(format!(
                "slot space not covered: ends at {} of {}",
                expected_start, slot_count
            )));
        }

        Ok(Self { ranges, slot_count })
    }

    /// Owning master of a slot.
    pub fn node_for_slot(&self, slot: u16) -> &str {
        // Validation guarantees full coverage.
        let idx = self
            .ranges
            .partition_point(|r| r.end < slot)
            .min(self.ranges.len() - 1);
        &self.ranges[idx].node
    }

    /// All distinct master nodes.
    pub fn masters(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = self.ranges.iter().map(|r| r.node.as_str()).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Configured slot-space size.
    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }
}

/// Native primitives of one cluster node.
///
/// `scan` is a prefix scan on a single node; engines expose it as a
/// pattern-matching cursor scan with `prefix*`.
#[async_trait]
pub trait ClusterNodeApi: Send + Sync {
    async fn connect(&self, endpoints: &[String]) -> StoreResult<()>;
    async fn get(&self, node: &str, key: &str) -> StoreResult<Option<String>>;
    async fn put(&self, node: &str, key: &str, value: &str) -> StoreResult<()>;
    async fn put_if(
        &self,
        node: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<CasOutcome>;
    async fn del(&self, node: &str, key: &str) -> StoreResult<bool>;
    async fn scan(&self, node: &str, prefix: &str) -> StoreResult<Vec<(String, String)>>;

    /// Fetch current slot ownership from any reachable endpoint.
    async fn topology(&self, endpoint: &str) -> StoreResult<Vec<SlotRange>>;
}

/// Slot-routing backend adapter.
pub struct ClusterStore {
    api: Arc<dyn ClusterNodeApi>,
    config: ClusterConfig,
    retry: RetryConfig,
    endpoints: RwLock<Vec<String>>,
    topology: RwLock<Option<(Arc<ClusterTopology>, Instant)>>,
}

impl ClusterStore {
    /// Create an adapter over per-node engine sessions.
    pub fn new(api: Arc<dyn ClusterNodeApi>, config: ClusterConfig, retry: RetryConfig) -> Self {
        Self {
            api,
            config,
            retry,
            endpoints: RwLock::new(Vec::new()),
            topology: RwLock::new(None),
        }
    }

    /// Current snapshot, refreshing from the cluster when absent or older
    /// than the configured refresh interval.
    async fn snapshot(&self) -> StoreResult<Arc<ClusterTopology>> {
        let refresh_after = Duration::from_millis(self.config.topology_refresh_ms);
        let cached = self.topology.read().clone();
        if let Some((topo, taken)) = cached {
            if taken.elapsed() < refresh_after {
                return Ok(topo);
            }
            // Aged out: prefer a fresh snapshot, but keep routing on the
            // stale one if every endpoint is unreachable right now.
            return match self.refresh_topology().await {
                Ok(fresh) => Ok(fresh),
                Err(err) => {
                    tracing::warn!(error = %err, "topology refresh failed, serving aged snapshot");
                    Ok(topo)
                }
            };
        }
        self.refresh_topology().await
    }

    /// Refresh the topology snapshot, trying each known endpoint.
    pub async fn refresh_topology(&self) -> StoreResult<Arc<ClusterTopology>> {
        let endpoints = self.endpoints.read().clone();
        let mut last_err = StoreError::connection("no cluster endpoints configured");
        for endpoint in &endpoints {
            match self.api.topology(endpoint).await {
                Ok(ranges) => {
                    let topo = Arc::new(ClusterTopology::new(ranges, self.config.slot_count)?);
                    tracing::info!(
                        masters = topo.masters().len(),
                        "cluster topology snapshot refreshed"
                    );
                    *self.topology.write() = Some((Arc::clone(&topo), Instant::now()));
                    return Ok(topo);
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Invalidate the snapshot after a routed operation failed, forcing a
    /// lazy re-resolve on the next operation.
    fn invalidate(&self) {
        *self.topology.write() = None;
    }

    /// Resolve the owning node for a physical key.
    async fn route(&self, physical: &str) -> StoreResult<(Arc<ClusterTopology>, String)> {
        let topo = self.snapshot().await?;
        let slot = slot_for_key(physical, topo.slot_count());
        let node = topo.node_for_slot(slot).to_string();
        Ok((topo, node))
    }

    /// Run a routed operation; on connection failure invalidate routing so
    /// the caller's retry re-resolves against fresh ownership.
    async fn routed<T, F, Fut>(&self, physical: &str, op: F) -> StoreResult<T>
    where
        F: FnOnce(Arc<dyn ClusterNodeApi>, String) -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        let (_, node) = self.route(physical).await?;
        match op(Arc::clone(&self.api), node).await {
            Ok(v) => Ok(v),
            Err(err @ StoreError::Connection { .. }) => {
                tracing::warn!(error = %err, "routed operation failed; invalidating topology");
                self.invalidate();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn registry_key(table: &str) -> String {
        physical_key(TABLE_REGISTRY, table, None)
    }

    async fn table_registered(&self, table: &str) -> StoreResult<bool> {
        let marker = Self::registry_key(table);
        self.routed(&marker.clone(), |api, node| async move {
            api.get(&node, &marker).await
        })
        .await
        .map(|v| v.is_some())
    }

    /// Scan every master for a prefix and merge the results.
    ///
    /// Cross-topic enumeration cannot assume one node sees every topic of a
    /// table, so the wildcard scan is issued to all masters explicitly.
    async fn scan_all_masters(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let topo = self.snapshot().await?;
        let mut merged = Vec::new();
        for node in topo.masters() {
            match self.api.scan(node, prefix).await {
                Ok(pairs) => merged.extend(pairs),
                Err(err @ StoreError::Connection { .. }) => {
                    self.invalidate();
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(merged)
    }

    /// Collect logical `(key, value)` pairs for a table.
    async fn collect(
        &self,
        table: &str,
        topic: Option<&str>,
    ) -> StoreResult<Vec<(String, String)>> {
        if !self.table_registered(table).await? {
            return Err(StoreError::key_not_found(table, ENUMERATION_KEY));
        }

        let pairs = match topic {
            Some(_) => {
                // One table+topic group lives on one node.
                let prefix = table_prefix(table, topic);
                let probe = prefix.clone();
                self.routed(&probe, |api, node| async move {
                    api.scan(&node, &prefix).await
                })
                .await?
            }
            None => {
                let prefix = format!("{{{table}.");
                self.scan_all_masters(&prefix).await?
            }
        };

        Ok(pairs
            .into_iter()
            .filter_map(|(physical, value)| {
                split_physical(&physical).map(|(_, _, key)| (key.to_string(), value))
            })
            .collect())
    }
}

#[async_trait]
impl StoreContract for ClusterStore {
    async fn initialize(&self, endpoints: &[String]) -> StoreResult<()> {
        if endpoints.is_empty() {
            return Err(StoreError::configuration("empty cluster endpoint list"));
        }
        *self.endpoints.write() = endpoints.to_vec();
        self.api.connect(endpoints).await?;
        self.refresh_topology().await?;
        Ok(())
    }

    async fn create_table(&self, table: &str) -> StoreResult<()> {
        let marker = Self::registry_key(table);
        let value = table.to_string();
        self.routed(&marker.clone(), |api, node| async move {
            api.put(&node, &marker, &value).await
        })
        .await
    }

    async fn delete_table(&self, table: &str) -> StoreResult<()> {
        if !self.table_registered(table).await? {
            return Err(StoreError::table_not_found(table));
        }

        // Drop every entry of the table across all masters, then the marker.
        let prefix = format!("{{{table}.");
        let pairs = self.scan_all_masters(&prefix).await?;
        for (physical, _) in pairs {
            let key = physical.clone();
            self.routed(&physical, |api, node| async move {
                api.del(&node, &key).await
            })
            .await?;
        }

        let marker = Self::registry_key(table);
        self.routed(&marker.clone(), |api, node| async move {
            api.del(&node, &marker).await
        })
        .await?;
        Ok(())
    }

    async fn get_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<String> {
        if topic.is_some() {
            let physical = physical_key(table, key, topic);
            let lookup = physical.clone();
            return self
                .routed(&physical, |api, node| async move {
                    api.get(&node, &lookup).await
                })
                .await?
                .ok_or_else(|| StoreError::key_not_found(table, key));
        }

        // No topic: the key may live under any topic group.
        let prefix = format!("{{{table}.");
        let suffix = format!("}}.{key}");
        self.scan_all_masters(&prefix)
            .await?
            .into_iter()
            .find(|(physical, _)| physical.ends_with(&suffix))
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
        let physical = physical_key(table, key, topic);
        let target = physical.clone();
        let value = value.to_string();
        let existed = self
            .routed(&physical, |api, node| async move {
                if api.get(&node, &target).await?.is_none() {
                    return Ok(false);
                }
                api.put(&node, &target, &value).await?;
                Ok(true)
            })
            .await?;
        if existed {
            Ok(())
        } else {
            Err(StoreError::key_not_found(table, key))
        }
    }

    async fn create_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        let physical = physical_key(table, key, topic);
        let target = physical.clone();
        let value = value.to_string();
        self.routed(&physical, |api, node| async move {
            api.put(&node, &target, &value).await
        })
        .await
    }

    async fn delete_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<()> {
        let physical = physical_key(table, key, topic);
        let target = physical.clone();
        let removed = self
            .routed(&physical, |api, node| async move {
                api.del(&node, &target).await
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
impl CounterStore for ClusterStore {
    async fn read_counter(&self, table: &str) -> StoreResult<Option<u64>> {
        let physical = physical_key(UNIQUE_KEY_TABLE, table, None);
        let lookup = physical.clone();
        let raw = self
            .routed(&physical, |api, node| async move {
                api.get(&node, &lookup).await
            })
            .await?;
        match raw {
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
        let physical = physical_key(UNIQUE_KEY_TABLE, table, None);
        let target = physical.clone();
        let expected = expected.map(|v| v.to_string());
        let next = next.to_string();
        self.routed(&physical, |api, node| async move {
            api.put_if(&node, &target, expected.as_deref(), &next).await
        })
        .await
    }
}
