//! Configuration parsing and validation.
//!
//! Trellis configuration is loaded from TOML with optional programmatic
//! overrides. Sections mirror the architectural components: backend
//! selection, retry tuning, connection pooling, cluster routing, consistency
//! policy, and the notification fabric.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend selection and endpoints.
    pub store: StoreConfig,

    /// Retry tuning for session-lease backends and transient faults.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Connection pool tuning for pooled backends.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Cluster routing tuning for slot-routed backends.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Consistency and load-balancing policy for quorum backends.
    #[serde(default)]
    pub consistency: ConsistencyConfig,

    /// Change notification fabric configuration.
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Backend selection and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind: "memory", "coordination", "cluster", "widecolumn",
    /// "document", "session", or "objectstore".
    pub backend: String,

    /// Backend cluster endpoints (host:port).
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Retry tuning for transient backend faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts before the fault is surfaced as a connection error.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff interval in milliseconds.
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,

    /// Multiplier applied to the interval after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Cap on the backoff interval in milliseconds.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_interval_ms: default_base_interval_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff interval for a zero-based attempt index, capped.
    pub fn interval_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_interval_ms as f64;
        let interval = base * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((interval as u64).min(self.max_interval_ms))
    }
}

/// Connection pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum pooled connections.
    #[serde(default = "default_pool_size")]
    pub max_connections: usize,

    /// How long an acquire may block when the pool is exhausted, in
    /// milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// Cluster routing tuning for slot-routed backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Fixed slot-space size. The wire convention is 16384 slots.
    #[serde(default = "default_slot_count")]
    pub slot_count: u16,

    /// Topology snapshot refresh interval in milliseconds.
    #[serde(default = "default_topology_refresh_ms")]
    pub topology_refresh_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            slot_count: default_slot_count(),
            topology_refresh_ms: default_topology_refresh_ms(),
        }
    }
}

/// Consistency level for quorum backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsistencyLevel {
    One,
    Quorum,
    LocalQuorum,
    All,
}

/// Load-balancing policy for quorum backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingPolicy {
    RoundRobin,
    DcAware,
    TokenAware,
    Whitelist,
}

/// Consistency and load-balancing policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Consistency level applied to every statement.
    #[serde(default = "default_consistency_level")]
    pub level: ConsistencyLevel,

    /// Load-balancing policy chosen once at initialization.
    #[serde(default = "default_load_balancing")]
    pub load_balancing: LoadBalancingPolicy,

    /// Local datacenter for the dc-aware policy.
    #[serde(default)]
    pub local_dc: Option<String>,

    /// Permitted hosts for the whitelist policy.
    #[serde(default)]
    pub whitelist_hosts: Vec<String>,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            level: default_consistency_level(),
            load_balancing: default_load_balancing(),
            local_dc: None,
            whitelist_hosts: Vec::new(),
        }
    }
}

/// Notification delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationMode {
    /// Use the backend's native watch when it supports one.
    Native,
    /// Use the out-of-band pub/sub transport.
    Pubsub,
    /// No notification delivery; consumers rely on periodic reconciliation.
    None,
}

/// Change notification fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Delivery mode.
    #[serde(default = "default_notification_mode")]
    pub mode: NotificationMode,

    /// Publisher bind address for pub/sub mode.
    #[serde(default = "default_publisher_bind")]
    pub publisher_bind: String,

    /// Publisher endpoints subscribers connect to.
    #[serde(default)]
    pub publisher_endpoints: Vec<String>,

    /// Whether notifications are filtered per topic. When false, everything
    /// is broadcast under the reserved send-all topic.
    #[serde(default)]
    pub topic_selective: bool,

    /// Keep-alive frame interval in milliseconds.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,

    /// Subscriber reconnect attempts before a sync event is emitted.
    #[serde(default = "default_reconnect_budget")]
    pub reconnect_budget: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            mode: default_notification_mode(),
            publisher_bind: default_publisher_bind(),
            publisher_endpoints: Vec::new(),
            topic_selective: false,
            keepalive_ms: default_keepalive_ms(),
            reconnect_budget: default_reconnect_budget(),
        }
    }
}

// Default value functions

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_interval_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    5_000
}

fn default_pool_size() -> usize {
    16
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_slot_count() -> u16 {
    16_384
}

fn default_topology_refresh_ms() -> u64 {
    30_000
}

fn default_consistency_level() -> ConsistencyLevel {
    ConsistencyLevel::Quorum
}

fn default_load_balancing() -> LoadBalancingPolicy {
    LoadBalancingPolicy::RoundRobin
}

fn default_notification_mode() -> NotificationMode {
    NotificationMode::Native
}

fn default_publisher_bind() -> String {
    "127.0.0.1:18690".to_string()
}

fn default_keepalive_ms() -> u64 {
    10_000
}

fn default_reconnect_budget() -> u32 {
    5
}

/// Backend kinds understood by the factory.
pub const BACKEND_KINDS: &[&str] = &[
    "memory",
    "coordination",
    "cluster",
    "widecolumn",
    "document",
    "session",
    "objectstore",
];

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_store()?;
        self.validate_retry()?;
        self.validate_pool()?;
        self.validate_cluster()?;
        self.validate_consistency()?;
        self.validate_notifications()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if !BACKEND_KINDS.contains(&self.store.backend.as_str()) {
            anyhow::bail!(
                "store.backend must be one of {:?}, got: {}",
                BACKEND_KINDS,
                self.store.backend
            );
        }

        // Every remote backend needs at least one endpoint.
        if self.store.backend != "memory" && self.store.endpoints.is_empty() {
            anyhow::bail!(
                "store.endpoints required for backend '{}'",
                self.store.backend
            );
        }

        for endpoint in &self.store.endpoints {
            if !endpoint.contains(':') {
                anyhow::bail!("store.endpoints entry missing port: {}", endpoint);
            }
        }

        if self.store.connect_timeout_ms == 0 {
            anyhow::bail!("store.connect_timeout_ms must be > 0");
        }

        Ok(())
    }

    fn validate_retry(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be > 0");
        }
        if self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "retry.backoff_multiplier must be >= 1.0, got: {}",
                self.retry.backoff_multiplier
            );
        }
        if self.retry.max_interval_ms < self.retry.base_interval_ms {
            anyhow::bail!(
                "retry.max_interval_ms ({}) cannot be below retry.base_interval_ms ({})",
                self.retry.max_interval_ms,
                self.retry.base_interval_ms
            );
        }
        Ok(())
    }

    fn validate_pool(&self) -> Result<()> {
        if self.pool.max_connections == 0 {
            anyhow::bail!("pool.max_connections must be > 0");
        }
        Ok(())
    }

    fn validate_cluster(&self) -> Result<()> {
        if self.cluster.slot_count == 0 {
            anyhow::bail!("cluster.slot_count must be > 0");
        }
        Ok(())
    }

    fn validate_consistency(&self) -> Result<()> {
        if self.consistency.load_balancing == LoadBalancingPolicy::DcAware
            && self.consistency.local_dc.is_none()
        {
            anyhow::bail!("consistency.local_dc required for dc-aware load balancing");
        }
        if self.consistency.load_balancing == LoadBalancingPolicy::Whitelist
            && self.consistency.whitelist_hosts.is_empty()
        {
            anyhow::bail!("consistency.whitelist_hosts required for whitelist load balancing");
        }
        Ok(())
    }

    fn validate_notifications(&self) -> Result<()> {
        if self.notifications.mode == NotificationMode::Pubsub {
            if self.notifications.publisher_endpoints.is_empty() {
                anyhow::bail!("notifications.publisher_endpoints required for pubsub mode");
            }
            if self.notifications.keepalive_ms == 0 {
                anyhow::bail!("notifications.keepalive_ms must be > 0");
            }
        }
        Ok(())
    }
}
