//! Native watch delivery.
//!
//! Backends with a long-poll/watch primitive expose it through
//! [`WatchSource`]; the driver turns polled changes into [`ChangeEvent`]s on
//! the shared fan-out. On stream interruption the driver publishes a `sync`
//! event so consumers fall back to full reconciliation, then resumes from
//! the last observed change index + 1. The loop never terminates silently;
//! it only stops when cancelled.

use crate::core::config::RetryConfig;
use crate::core::error::StoreResult;
use crate::notify::event::{Action, ChangeEvent, EventFanout};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One change observed by a watch poll.
#[derive(Debug, Clone)]
pub struct WatchChange {
    /// Backend change index of this change.
    pub index: u64,
    pub table: String,
    pub key: String,
    pub action: Action,
    pub value: Option<String>,
    pub topic: Option<String>,
}

/// Outcome of a single long-poll.
#[derive(Debug, Clone)]
pub enum WatchPoll {
    /// A change at or after the requested index.
    Change(WatchChange),
    /// The poll window elapsed without a change; poll again.
    Idle,
}

/// Backend seam for native watch delivery.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    /// Block until a change at index >= `from_index` occurs, or the poll
    /// window elapses.
    async fn poll(&self, from_index: u64) -> StoreResult<WatchPoll>;
}

/// Handle to a running watch driver.
pub struct WatchHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the driver and wait for it to wind down.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.task.await;
    }
}

/// Spawn a watch driver feeding `fanout` from `source`.
///
/// `from_index` is the first change index of interest (0 for "everything the
/// backend still has").
pub fn spawn(
    source: Arc<dyn WatchSource>,
    fanout: Arc<EventFanout>,
    retry: RetryConfig,
    from_index: u64,
) -> WatchHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(run(source, fanout, retry, from_index, cancel_rx));
    WatchHandle {
        cancel: cancel_tx,
        task,
    }
}

async fn run(
    source: Arc<dyn WatchSource>,
    fanout: Arc<EventFanout>,
    retry: RetryConfig,
    mut next_index: u64,
    mut cancel: watch::Receiver<bool>,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        if *cancel.borrow() {
            return;
        }

        let poll = tokio::select! {
            result = source.poll(next_index) => result,
            _ = cancel.changed() => return,
        };

        match poll {
            Ok(WatchPoll::Change(change)) => {
                consecutive_failures = 0;
                next_index = change.index + 1;
                fanout.publish(&ChangeEvent::new(
                    change.table,
                    change.key,
                    change.action,
                    change.value,
                    change.topic,
                ));
            }
            Ok(WatchPoll::Idle) => {
                consecutive_failures = 0;
            }
            Err(err) => {
                // Stream interrupted: tell consumers to resync, back off,
                // then resume from where we left off.
                tracing::warn!(error = %err, next_index, "watch stream interrupted");
                fanout.publish(&ChangeEvent::sync());

                let attempt = consecutive_failures.min(retry.max_attempts - 1);
                consecutive_failures = consecutive_failures.saturating_add(1);
                let backoff = retry.interval_for_attempt(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.changed() => return,
                }
            }
        }
    }
}
