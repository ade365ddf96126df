//! The store contract every backend adapter implements.
//!
//! The contract is the sole interface the CRUD/model layer consumes. It is
//! deliberately flat: named tables of key→value string pairs, optionally
//! scoped by topic, plus a per-table unique-key allocator and a notification
//! capability probe. Side effects are confined to the backend's own state;
//! there is no cross-table atomicity guarantee.

use crate::core::error::StoreResult;
use crate::notify::event::EventSubscription;
use async_trait::async_trait;
use bitflags::bitflags;

bitflags! {
    /// Capability bits advertised by a backend adapter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BackendCapabilities: u32 {
        /// Backend delivers change notifications natively (watch or
        /// engine-level pub/sub); no out-of-band transport is needed.
        const NATIVE_NOTIFICATIONS = 0b0000_0001;
        /// Topic-scoped enumeration runs as a single-node scan rather than
        /// a full-table read.
        const TOPIC_SCAN = 0b0000_0010;
        /// Wildcard enumeration across all topics of a table is supported.
        const CROSS_TOPIC_SCAN = 0b0000_0100;
    }
}

/// Uniform storage contract.
///
/// Semantics every adapter must preserve exactly:
///
/// - `set_key` is an update: it fails with `KeyNotFound` when the key does
///   not already exist.
/// - `create_key` is an unconditional write: it silently overwrites an
///   existing value. The asymmetry with `set_key` is intentional; dependent
///   logic relies on it.
/// - `get_all_keys`/`get_all_entries` fail with `KeyNotFound` when the table
///   itself cannot be enumerated (the key field carries `"*"`), and return
///   empty collections when the table exists but holds nothing under the
///   requested topic.
/// - `delete_table` fails with `TableNotFound` when the table is absent.
#[async_trait]
pub trait StoreContract: Send + Sync {
    /// Establish backend connectivity. Idempotent; fails with `Connection`
    /// if the backend cannot be reached within the configured timeout.
    async fn initialize(&self, endpoints: &[String]) -> StoreResult<()>;

    /// Create a table. Idempotent: re-creating an existing table neither
    /// fails nor clears its entries.
    async fn create_table(&self, table: &str) -> StoreResult<()>;

    /// Drop a table and all of its entries.
    async fn delete_table(&self, table: &str) -> StoreResult<()>;

    /// Read an entry value.
    async fn get_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<String>;

    /// Update an existing entry (update semantics, not upsert).
    async fn set_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()>;

    /// Write an entry unconditionally, overwriting silently if present.
    async fn create_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()>;

    /// Delete an entry.
    async fn delete_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<()>;

    /// Enumerate keys of a table, sorted, optionally scoped by topic.
    async fn get_all_keys(&self, table: &str, topic: Option<&str>) -> StoreResult<Vec<String>>;

    /// Enumerate values of a table, optionally scoped by topic.
    async fn get_all_entries(&self, table: &str, topic: Option<&str>) -> StoreResult<Vec<String>>;

    /// Allocate the next unique integer for `table`.
    ///
    /// Strictly increasing, duplicate-free per table across any number of
    /// concurrent callers in any number of processes.
    async fn allocate_unique_key(&self, table: &str) -> StoreResult<u64>;

    /// Capability bits for this adapter.
    fn capabilities(&self) -> BackendCapabilities;

    /// Capability probe for native change delivery.
    fn supports_notifications(&self) -> bool {
        self.capabilities()
            .contains(BackendCapabilities::NATIVE_NOTIFICATIONS)
    }

    /// Subscribe to native change notifications.
    ///
    /// Returns `None` on backends without native delivery; callers then wire
    /// up the out-of-band pub/sub transport or periodic reconciliation.
    fn subscribe(&self) -> Option<EventSubscription> {
        None
    }
}

/// Key placeholder used when an enumeration fails because the table itself
/// is missing.
pub const ENUMERATION_KEY: &str = "*";
