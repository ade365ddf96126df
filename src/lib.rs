//! Trellis: a storage-agnostic northbound data layer.
//!
//! Distributed network controllers keep their desired state in an external
//! key-value store and their working state in per-process caches. Trellis
//! provides the layer between the two: a uniform [`store::StoreContract`]
//! over pluggable backend families, a race-free per-table unique-key
//! allocator, a change-notification fabric with native-watch and
//! out-of-band pub/sub delivery, and a cache-reconciliation engine for when
//! delivery inevitably falls short.
//!
//! Backends are selected by configuration at startup and accessed through
//! the contract only; no caller ever sees an engine-specific type or error.

pub mod backends;
pub mod cache;
pub mod core;
pub mod notify;
pub mod store;

pub use crate::core::config::Config;
pub use crate::core::error::{StoreError, StoreResult};
pub use backends::{build, BackendDrivers, BackendKind};
pub use cache::engine::ReconcileEngine;
pub use cache::CacheSource;
pub use notify::event::{Action, ChangeEvent, EventFanout, EventSink, EventSubscription};
pub use store::contract::{BackendCapabilities, StoreContract};
