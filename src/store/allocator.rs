//! Optimistic unique-key allocation.
//!
//! The allocation algorithm is specified once, abstractly, and realized per
//! backend through the [`CounterStore`] seam: read the current counter,
//! attempt a conditional write of `current + 1`, retry on conflict. The
//! retry policy is an explicit loop over an explicit outcome type so it is
//! visible and testable, not exception-driven control flow.

use crate::core::config::RetryConfig;
use crate::core::error::StoreResult;
use async_trait::async_trait;

/// Outcome of a conditional counter write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The conditional write took effect.
    Committed,
    /// The stored value no longer matched the expectation; another
    /// allocator won the race.
    Conflict,
}

/// Backend seam for counter storage.
///
/// Implementations realize the conditional write however their engine
/// expresses it: a version check, a compare-and-swap primitive, or an
/// insert-if-absent for the very first allocation (`expected == None`).
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the current counter value for `table`; `None` if never
    /// allocated.
    async fn read_counter(&self, table: &str) -> StoreResult<Option<u64>>;

    /// Conditionally write `next`, succeeding only while the stored value
    /// still equals `expected`.
    async fn write_counter(
        &self,
        table: &str,
        expected: Option<u64>,
        next: u64,
    ) -> StoreResult<CasOutcome>;
}

/// Allocate the next unique key for `table`.
///
/// Conflicts are retried without bound: the operation always eventually
/// succeeds as long as allocation attempts are rarer than backend latency.
/// Transient backend faults are retried within the configured budget and
/// then surfaced as a connection error, making a failed allocation fatal to
/// the caller.
pub async fn allocate(
    store: &dyn CounterStore,
    table: &str,
    retry: &RetryConfig,
) -> StoreResult<u64> {
    let mut transient_attempts: u32 = 0;

    loop {
        let current = match read_with_budget(store, table, retry, &mut transient_attempts).await {
            Ok(v) => v,
            Err(err) => return Err(err),
        };
        let next = current.unwrap_or(0) + 1;

        match store.write_counter(table, current, next).await {
            Ok(CasOutcome::Committed) => return Ok(next),
            Ok(CasOutcome::Conflict) => {
                tracing::debug!(table, next, "unique-key allocation conflict, retrying");
                continue;
            }
            Err(err) if err.is_retriable() => {
                transient_attempts += 1;
                if transient_attempts >= retry.max_attempts {
                    return Err(err.into_exhausted());
                }
                tokio::time::sleep(retry.interval_for_attempt(transient_attempts - 1)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn read_with_budget(
    store: &dyn CounterStore,
    table: &str,
    retry: &RetryConfig,
    transient_attempts: &mut u32,
) -> StoreResult<Option<u64>> {
    loop {
        match store.read_counter(table).await {
            Ok(v) => return Ok(v),
            Err(err) if err.is_retriable() => {
                *transient_attempts += 1;
                if *transient_attempts >= retry.max_attempts {
                    return Err(err.into_exhausted());
                }
                tokio::time::sleep(retry.interval_for_attempt(*transient_attempts - 1)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
