//! Out-of-band TCP publish/subscribe transport.
//!
//! For backends without native change delivery, writers publish their own
//! change events over a newline-framed TCP stream. A subscriber connection
//! opens with one subscription line (`SUB <topic,...>` or `SUB *`), then
//! receives one encoded event per line; an empty line is a keep-alive. The
//! subscriber end feeds a local fan-out and degrades to reconciliation:
//! after a reconnect, and again whenever the reconnect budget runs out
//! while the publisher stays unreachable, it emits a `sync` event so
//! consumers refresh from the store instead of trusting a gapped stream.

use crate::core::config::RetryConfig;
use crate::core::error::StoreResult;
use crate::notify::event::{ChangeEvent, EventFanout, EventSink};
use crate::store::keys::SEND_ALL_TOPIC;
use bytes::{BufMut, BytesMut};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const SUB_PREFIX: &str = "SUB ";
const SUB_ALL: &str = "*";

/// Event publisher serving subscriber connections.
pub struct Publisher {
    tx: broadcast::Sender<ChangeEvent>,
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Publisher {
    /// Bind and start accepting subscribers.
    pub async fn bind(
        addr: &str,
        topic_selective: bool,
        keepalive: Duration,
    ) -> StoreResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(1024);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            tx.clone(),
            topic_selective,
            keepalive,
        ));
        tracing::info!(%addr, topic_selective, "event publisher listening");
        Ok(Self {
            tx,
            addr,
            accept_task,
        })
    }

    /// Bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting. Existing connections wind down when the event
    /// channel closes with the publisher.
    pub fn stop(self) {
        self.accept_task.abort();
    }
}

impl EventSink for Publisher {
    fn publish(&self, event: &ChangeEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: broadcast::Sender<ChangeEvent>,
    topic_selective: bool,
    keepalive: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "subscriber connected");
                tokio::spawn(serve_subscriber(
                    stream,
                    tx.subscribe(),
                    topic_selective,
                    keepalive,
                ));
            }
            Err(err) => {
                tracing::warn!(error = %err, "subscriber accept failed");
            }
        }
    }
}

fn parse_subscription(line: &str) -> Option<HashSet<String>> {
    let topics = line.strip_prefix(SUB_PREFIX)?.trim();
    if topics == SUB_ALL || topics.is_empty() {
        return Some(HashSet::new());
    }
    Some(topics.split(',').map(str::to_string).collect())
}

/// Does an event belong on a connection subscribed to `topics`?
///
/// An empty set means everything. Sync events and events addressed to the
/// send-all topic bypass filtering.
fn topic_match(topics: &HashSet<String>, event: &ChangeEvent) -> bool {
    if topics.is_empty() || event.is_sync() {
        return true;
    }
    match event.topic.as_deref() {
        Some(SEND_ALL_TOPIC) | None => true,
        Some(topic) => topics.contains(topic),
    }
}

async fn write_frame(write: &mut OwnedWriteHalf, payload: &str) -> std::io::Result<()> {
    let mut frame = BytesMut::with_capacity(payload.len() + 1);
    frame.put_slice(payload.as_bytes());
    frame.put_u8(b'\n');
    write.write_all(&frame).await
}

async fn serve_subscriber(
    stream: TcpStream,
    mut rx: broadcast::Receiver<ChangeEvent>,
    topic_selective: bool,
    keepalive: Duration,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let topics = match lines.next_line().await {
        Ok(Some(line)) => match parse_subscription(&line) {
            Some(topics) => topics,
            None => {
                tracing::debug!(line, "malformed subscription, dropping connection");
                return;
            }
        },
        _ => return,
    };

    let mut keepalive_ticks = tokio::time::interval(keepalive);
    keepalive_ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let frame = tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => {
                    if topic_selective && !topic_match(&topics, &event) {
                        continue;
                    }
                    event.encode()
                }
                // This connection fell behind the channel; its stream now
                // has a gap, so tell it to resync.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged, sending sync");
                    ChangeEvent::sync().encode()
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = keepalive_ticks.tick() => String::new(),
        };

        if write_frame(&mut write, &frame).await.is_err() {
            return;
        }
    }
}

/// Handle to a running subscriber loop.
pub struct SubscriberHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriberHandle {
    /// Stop the subscriber and wait for it to wind down.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.task.await;
    }
}

/// Spawn a subscriber feeding `fanout` from the given publisher endpoints.
///
/// `topics` selects the subscription; empty subscribes to everything.
pub fn spawn_subscriber(
    endpoints: Vec<String>,
    topics: Vec<String>,
    fanout: Arc<EventFanout>,
    retry: RetryConfig,
    reconnect_budget: u32,
) -> SubscriberHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(subscriber_loop(
        endpoints,
        topics,
        fanout,
        retry,
        reconnect_budget,
        cancel_rx,
    ));
    SubscriberHandle {
        cancel: cancel_tx,
        task,
    }
}

async fn subscriber_loop(
    endpoints: Vec<String>,
    topics: Vec<String>,
    fanout: Arc<EventFanout>,
    retry: RetryConfig,
    reconnect_budget: u32,
    mut cancel: watch::Receiver<bool>,
) {
    if endpoints.is_empty() {
        tracing::error!("subscriber started with no publisher endpoints");
        return;
    }

    let subscription = if topics.is_empty() {
        format!("{SUB_PREFIX}{SUB_ALL}")
    } else {
        format!("{SUB_PREFIX}{}", topics.join(","))
    };

    let mut endpoint_idx: usize = 0;
    let mut failures: u32 = 0;
    let mut stream_was_broken = false;

    loop {
        if *cancel.borrow() {
            return;
        }

        let endpoint = &endpoints[endpoint_idx % endpoints.len()];
        endpoint_idx = endpoint_idx.wrapping_add(1);

        let connected = tokio::select! {
            result = TcpStream::connect(endpoint) => result,
            _ = cancel.changed() => return,
        };

        match connected {
            Ok(stream) => {
                failures = 0;
                if stream_was_broken {
                    // Events may have been missed while disconnected.
                    fanout.publish(&ChangeEvent::sync());
                    stream_was_broken = false;
                }
                if consume_stream(stream, &subscription, &fanout, &mut cancel)
                    .await
                    .is_err()
                {
                    stream_was_broken = true;
                }
                if *cancel.borrow() {
                    return;
                }
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                stream_was_broken = true;
                tracing::warn!(error = %err, endpoint, failures, "publisher unreachable");
                // Budget spent while still down: consumers must reconcile
                // on their own; keep dialing regardless.
                if failures == reconnect_budget {
                    fanout.publish(&ChangeEvent::sync());
                }
                let backoff = retry.interval_for_attempt(failures.saturating_sub(1));
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.changed() => return,
                }
            }
        }
    }
}

/// Read frames until the stream breaks or the subscriber is cancelled.
async fn consume_stream(
    stream: TcpStream,
    subscription: &str,
    fanout: &EventFanout,
    cancel: &mut watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    write.write_all(subscription.as_bytes()).await?;
    write.write_all(b"\n").await?;

    let mut lines = BufReader::new(read).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = cancel.changed() => return Ok(()),
        };
        match line {
            Some(line) if line.is_empty() => {} // keep-alive
            Some(line) => match ChangeEvent::decode(&line) {
                Ok(event) => fanout.publish(&event),
                Err(err) => tracing::debug!(error = %err, "undecodable event frame dropped"),
            },
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "publisher closed the stream",
                ));
            }
        }
    }
}
