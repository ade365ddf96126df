//! Wide-column adapter.
//!
//! Maps the flat table contract onto a wide-column engine: one engine table
//! per logical table inside a fixed keyspace, partitioned by topic and
//! clustered by key. The consistency level from configuration is stamped on
//! every statement; the load-balancing policy (round-robin, dc-aware,
//! token-aware or whitelist) is fixed once when the session connects and
//! never changes afterwards. Conditional writes go through the engine's
//! lightweight-transaction path so unique-key allocation stays race-free
//! across processes.

use crate::core::config::{ConsistencyConfig, ConsistencyLevel, RetryConfig};
use crate::core::error::{StoreError, StoreResult};
use crate::store::allocator::{self, CasOutcome, CounterStore};
use crate::store::contract::{BackendCapabilities, StoreContract, ENUMERATION_KEY};
use crate::store::keys::{effective_topic, UNIQUE_KEY_TABLE};
use async_trait::async_trait;
use std::sync::Arc;

/// Keyspace holding every logical table.
const KEYSPACE: &str = "northbound";

/// One statement bound with positional parameters and an explicit
/// consistency level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub cql: String,
    pub params: Vec<String>,
    pub consistency: ConsistencyLevel,
}

/// One result row, columns in selection order.
#[derive(Debug, Clone)]
pub struct Row {
    pub columns: Vec<String>,
}

/// Native session of a wide-column engine.
///
/// `execute_conditional` runs a lightweight transaction and reports whether
/// the engine applied it, which is how conditional counter writes detect
/// contention.
#[async_trait]
pub trait WideColumnSession: Send + Sync {
    /// Connect and fix the load-balancing policy for the session lifetime.
    async fn connect(&self, endpoints: &[String], policy: &ConsistencyConfig) -> StoreResult<()>;

    async fn execute(&self, statement: Statement) -> StoreResult<Vec<Row>>;

    async fn execute_conditional(&self, statement: Statement) -> StoreResult<CasOutcome>;
}

/// Wide-column backend adapter.
pub struct WideColumnStore {
    session: Arc<dyn WideColumnSession>,
    consistency: ConsistencyConfig,
    retry: RetryConfig,
}

/// Logical table names become engine identifiers verbatim, so they must be
/// plain identifiers.
fn check_ident(table: &str) -> StoreResult<()> {
    let ok = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(StoreError::configuration(format!(
            "invalid table identifier: {table:?}"
        )))
    }
}

impl WideColumnStore {
    pub fn new(
        session: Arc<dyn WideColumnSession>,
        consistency: ConsistencyConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            session,
            consistency,
            retry,
        }
    }

    fn statement(&self, cql: String, params: Vec<String>) -> Statement {
        Statement {
            cql,
            params,
            consistency: self.consistency.level,
        }
    }

    async fn read_value(
        &self,
        table: &str,
        key: &str,
        topic: Option<&str>,
    ) -> StoreResult<Option<String>> {
        check_ident(table)?;
        let statement = match topic {
            Some(topic) => self.statement(
                format!("SELECT value FROM {KEYSPACE}.{table} WHERE topic = ? AND key = ?"),
                vec![topic.to_string(), key.to_string()],
            ),
            // No topic: the key may sit under any partition.
            None => self.statement(
                format!("SELECT value FROM {KEYSPACE}.{table} WHERE key = ? ALLOW FILTERING"),
                vec![key.to_string()],
            ),
        };
        let rows = self.session.execute(statement).await?;
        Ok(rows.into_iter().next().and_then(|r| r.columns.into_iter().next()))
    }

    async fn collect(
        &self,
        table: &str,
        topic: Option<&str>,
    ) -> StoreResult<Vec<(String, String)>> {
        check_ident(table)?;
        let statement = match topic {
            Some(topic) => self.statement(
                format!("SELECT key, value FROM {KEYSPACE}.{table} WHERE topic = ?"),
                vec![topic.to_string()],
            ),
            None => self.statement(
                format!("SELECT key, value FROM {KEYSPACE}.{table}"),
                Vec::new(),
            ),
        };
        let rows = match self.session.execute(statement).await {
            Ok(rows) => rows,
            // An unknown engine table means the logical table was never
            // created; enumeration reports that as key-not-found.
            Err(StoreError::TableNotFound { .. }) => {
                return Err(StoreError::key_not_found(table, ENUMERATION_KEY));
            }
            Err(err) => return Err(err),
        };
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let mut cols = r.columns.into_iter();
                match (cols.next(), cols.next()) {
                    (Some(k), Some(v)) => Some((k, v)),
                    _ => None,
                }
            })
            .collect())
    }
}

#[async_trait]
impl StoreContract for WideColumnStore {
    async fn initialize(&self, endpoints: &[String]) -> StoreResult<()> {
        if endpoints.is_empty() {
            return Err(StoreError::configuration("empty endpoint list"));
        }
        self.session.connect(endpoints, &self.consistency).await?;
        // The allocator table always exists.
        self.create_table(UNIQUE_KEY_TABLE).await
    }

    async fn create_table(&self, table: &str) -> StoreResult<()> {
        check_ident(table)?;
        let statement = self.statement(
            format!(
                "CREATE TABLE IF NOT EXISTS {KEYSPACE}.{table} \
                 (topic text, key text, value text, PRIMARY KEY (topic, key))"
            ),
            Vec::new(),
        );
        self.session.execute(statement).await.map(|_| ())
    }

    async fn delete_table(&self, table: &str) -> StoreResult<()> {
        check_ident(table)?;
        let statement = self.statement(format!("DROP TABLE {KEYSPACE}.{table}"), Vec::new());
        self.session.execute(statement).await.map(|_| ())
    }

    async fn get_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<String> {
        match self.read_value(table, key, topic).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) | Err(StoreError::TableNotFound { .. }) => {
                Err(StoreError::key_not_found(table, key))
            }
            Err(err) => Err(err),
        }
    }

    async fn set_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        // Update semantics: refuse to materialize a missing key.
        if self.read_value(table, key, topic).await?.is_none() {
            return Err(StoreError::key_not_found(table, key));
        }
        self.create_key(table, key, value, topic).await
    }

    async fn create_key(
        &self,
        table: &str,
        key: &str,
        value: &str,
        topic: Option<&str>,
    ) -> StoreResult<()> {
        check_ident(table)?;
        let topic = effective_topic(topic);
        let statement = self.statement(
            format!("INSERT INTO {KEYSPACE}.{table} (topic, key, value) VALUES (?, ?, ?)"),
            vec![topic.to_string(), key.to_string(), value.to_string()],
        );
        self.session.execute(statement).await.map(|_| ())
    }

    async fn delete_key(&self, table: &str, key: &str, topic: Option<&str>) -> StoreResult<()> {
        if self.read_value(table, key, topic).await?.is_none() {
            return Err(StoreError::key_not_found(table, key));
        }
        let topic = effective_topic(topic);
        let statement = self.statement(
            format!("DELETE FROM {KEYSPACE}.{table} WHERE topic = ? AND key = ?"),
            vec![topic.to_string(), key.to_string()],
        );
        self.session.execute(statement).await.map(|_| ())
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
impl CounterStore for WideColumnStore {
    async fn read_counter(&self, table: &str) -> StoreResult<Option<u64>> {
        match self
            .read_value(UNIQUE_KEY_TABLE, table, Some(effective_topic(None)))
            .await?
        {
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
        let topic = effective_topic(None);
        let statement = match expected {
            None => self.statement(
                format!(
                    "INSERT INTO {KEYSPACE}.{UNIQUE_KEY_TABLE} (topic, key, value) \
                     VALUES (?, ?, ?) IF NOT EXISTS"
                ),
                vec![topic.to_string(), table.to_string(), next.to_string()],
            ),
            Some(expected) => self.statement(
                format!(
                    "UPDATE {KEYSPACE}.{UNIQUE_KEY_TABLE} SET value = ? \
                     WHERE topic = ? AND key = ? IF value = ?"
                ),
                vec![
                    next.to_string(),
                    topic.to_string(),
                    table.to_string(),
                    expected.to_string(),
                ],
            ),
        };
        self.session.execute_conditional(statement).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::LoadBalancingPolicy;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};

    type Partition = BTreeMap<(String, String), String>;

    /// In-memory grid interpreting the fixed statement shapes the adapter
    /// emits.
    #[derive(Default)]
    struct FakeGrid {
        tables: Mutex<HashMap<String, Partition>>,
        seen_consistency: Mutex<Vec<ConsistencyLevel>>,
        connect_policy: Mutex<Option<LoadBalancingPolicy>>,
    }

    impl FakeGrid {
        fn table_of(cql: &str) -> String {
            let tail = cql
                .split(&format!("{KEYSPACE}."))
                .nth(1)
                .expect("statement without keyspace");
            tail.chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect()
        }
    }

    #[async_trait]
    impl WideColumnSession for FakeGrid {
        async fn connect(
            &self,
            _endpoints: &[String],
            policy: &ConsistencyConfig,
        ) -> StoreResult<()> {
            *self.connect_policy.lock() = Some(policy.load_balancing);
            Ok(())
        }

        async fn execute(&self, statement: Statement) -> StoreResult<Vec<Row>> {
            self.seen_consistency.lock().push(statement.consistency);
            let table = Self::table_of(&statement.cql);
            let mut tables = self.tables.lock();
            let cql = statement.cql.as_str();
            let p = &statement.params;

            if cql.starts_with("CREATE TABLE") {
                tables.entry(table).or_default();
                return Ok(Vec::new());
            }
            if cql.starts_with("DROP TABLE") {
                return match tables.remove(&table) {
                    Some(_) => Ok(Vec::new()),
                    None => Err(StoreError::table_not_found(&table)),
                };
            }

            let rows = tables
                .get_mut(&table)
                .ok_or_else(|| StoreError::table_not_found(&table))?;

            if cql.starts_with("INSERT INTO") {
                rows.insert((p[0].clone(), p[1].clone()), p[2].clone());
                return Ok(Vec::new());
            }
            if cql.starts_with("DELETE FROM") {
                rows.remove(&(p[0].clone(), p[1].clone()));
                return Ok(Vec::new());
            }
            if cql.starts_with("SELECT value") {
                let found: Vec<Row> = if cql.contains("ALLOW FILTERING") {
                    rows.iter()
                        .filter(|((_, k), _)| *k == p[0])
                        .map(|(_, v)| Row { columns: vec![v.clone()] })
                        .collect()
                } else {
                    rows.get(&(p[0].clone(), p[1].clone()))
                        .map(|v| Row { columns: vec![v.clone()] })
                        .into_iter()
                        .collect()
                };
                return Ok(found);
            }
            if cql.starts_with("SELECT key, value") {
                let found: Vec<Row> = rows
                    .iter()
                    .filter(|((t, _), _)| p.is_empty() || *t == p[0])
                    .map(|((_, k), v)| Row {
                        columns: vec![k.clone(), v.clone()],
                    })
                    .collect();
                return Ok(found);
            }
            panic!("unexpected statement: {cql}");
        }

        async fn execute_conditional(&self, statement: Statement) -> StoreResult<CasOutcome> {
            self.seen_consistency.lock().push(statement.consistency);
            let table = Self::table_of(&statement.cql);
            let mut tables = self.tables.lock();
            let rows = tables.entry(table).or_default();
            let p = &statement.params;

            if statement.cql.contains("IF NOT EXISTS") {
                let slot = (p[0].clone(), p[1].clone());
                if rows.contains_key(&slot) {
                    return Ok(CasOutcome::Conflict);
                }
                rows.insert(slot, p[2].clone());
                return Ok(CasOutcome::Committed);
            }
            // UPDATE ... IF value = ?
            let slot = (p[1].clone(), p[2].clone());
            if rows.get(&slot).map(String::as_str) != Some(p[3].as_str()) {
                return Ok(CasOutcome::Conflict);
            }
            rows.insert(slot, p[0].clone());
            Ok(CasOutcome::Committed)
        }
    }

    async fn store(grid: Arc<FakeGrid>) -> WideColumnStore {
        let store = WideColumnStore::new(
            grid,
            ConsistencyConfig::default(),
            RetryConfig::default(),
        );
        store.initialize(&["10.0.0.1:9042".to_string()]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn contract_semantics() {
        let store = store(Arc::new(FakeGrid::default())).await;
        store.create_table("lport").await.unwrap();

        let err = store.set_key("lport", "p1", "v", Some("t")).await.unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound { .. }));

        store.create_key("lport", "p1", "v1", Some("t")).await.unwrap();
        assert_eq!(store.get_key("lport", "p1", Some("t")).await.unwrap(), "v1");

        store.set_key("lport", "p1", "v2", Some("t")).await.unwrap();
        assert_eq!(store.get_key("lport", "p1", Some("t")).await.unwrap(), "v2");

        store.delete_key("lport", "p1", Some("t")).await.unwrap();
        let err = store.delete_key("lport", "p1", Some("t")).await.unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn topic_partitions_and_cross_topic_reads() {
        let store = store(Arc::new(FakeGrid::default())).await;
        store.create_table("lport").await.unwrap();
        store.create_key("lport", "p1", "v1", Some("tenant-a")).await.unwrap();
        store.create_key("lport", "p2", "v2", Some("tenant-b")).await.unwrap();

        assert_eq!(
            store.get_all_keys("lport", Some("tenant-a")).await.unwrap(),
            ["p1"]
        );
        assert_eq!(store.get_all_keys("lport", None).await.unwrap(), ["p1", "p2"]);
        // Point read without a topic filters across partitions.
        assert_eq!(store.get_key("lport", "p2", None).await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn enumeration_of_missing_table() {
        let store = store(Arc::new(FakeGrid::default())).await;
        let err = store.get_all_keys("lport", None).await.unwrap_err();
        match err {
            StoreError::KeyNotFound { table, key } => {
                assert_eq!(table, "lport");
                assert_eq!(key, "*");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = store.delete_table("lport").await.unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound { .. }));
    }

    #[tokio::test]
    async fn consistency_level_is_stamped_on_every_statement() {
        let grid = Arc::new(FakeGrid::default());
        let store = WideColumnStore::new(
            Arc::clone(&grid) as Arc<dyn WideColumnSession>,
            ConsistencyConfig {
                level: ConsistencyLevel::LocalQuorum,
                ..ConsistencyConfig::default()
            },
            RetryConfig::default(),
        );
        store.initialize(&["10.0.0.1:9042".to_string()]).await.unwrap();
        store.create_table("lport").await.unwrap();
        store.create_key("lport", "p1", "v1", Some("t")).await.unwrap();
        store.allocate_unique_key("lport").await.unwrap();

        let seen = grid.seen_consistency.lock();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|l| *l == ConsistencyLevel::LocalQuorum));
    }

    #[tokio::test]
    async fn load_balancing_fixed_at_connect() {
        let grid = Arc::new(FakeGrid::default());
        let store = WideColumnStore::new(
            Arc::clone(&grid) as Arc<dyn WideColumnSession>,
            ConsistencyConfig {
                load_balancing: LoadBalancingPolicy::TokenAware,
                ..ConsistencyConfig::default()
            },
            RetryConfig::default(),
        );
        store.initialize(&["10.0.0.1:9042".to_string()]).await.unwrap();
        assert_eq!(
            *grid.connect_policy.lock(),
            Some(LoadBalancingPolicy::TokenAware)
        );
    }

    #[tokio::test]
    async fn hostile_table_name_rejected() {
        let store = store(Arc::new(FakeGrid::default())).await;
        let err = store
            .create_table("lport; DROP KEYSPACE northbound")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration { .. }));
    }

    #[tokio::test]
    async fn allocator_over_lightweight_transactions() {
        let store = store(Arc::new(FakeGrid::default())).await;
        assert_eq!(store.allocate_unique_key("lport").await.unwrap(), 1);
        assert_eq!(store.allocate_unique_key("lport").await.unwrap(), 2);
        assert_eq!(store.allocate_unique_key("lswitch").await.unwrap(), 1);
    }
}
