//! Change notification fabric.
//!
//! Two delivery strategies share one event contract: backend-native watch
//! streams ([`watch`]) and the out-of-band TCP publish/subscribe transport
//! ([`pubsub`]). Consumers only ever see [`event::ChangeEvent`] values, so
//! they never need to know which transport delivered an event.

pub mod event;
pub mod pubsub;
pub mod watch;

pub use event::{Action, ChangeEvent, EventFanout, EventSink, EventSubscription};

use crate::core::config::{NotificationConfig, NotificationMode, RetryConfig};
use crate::core::error::StoreResult;
use std::sync::Arc;
use std::time::Duration;

/// Start the out-of-band publisher described by the configuration.
///
/// Returns `None` unless pub/sub mode is selected; native and none modes
/// need no transport of their own.
pub async fn start_publisher(
    config: &NotificationConfig,
) -> StoreResult<Option<pubsub::Publisher>> {
    if config.mode != NotificationMode::Pubsub {
        return Ok(None);
    }
    let publisher = pubsub::Publisher::bind(
        &config.publisher_bind,
        config.topic_selective,
        Duration::from_millis(config.keepalive_ms),
    )
    .await?;
    Ok(Some(publisher))
}

/// Connect a subscriber to the configured publisher endpoints, feeding
/// `fanout`. `topics` selects the subscription; empty subscribes to
/// everything. Returns `None` unless pub/sub mode is selected.
pub fn connect_subscriber(
    config: &NotificationConfig,
    retry: RetryConfig,
    topics: Vec<String>,
    fanout: Arc<EventFanout>,
) -> Option<pubsub::SubscriberHandle> {
    if config.mode != NotificationMode::Pubsub {
        return None;
    }
    Some(pubsub::spawn_subscriber(
        config.publisher_endpoints.clone(),
        topics,
        fanout,
        retry,
        config.reconnect_budget,
    ))
}
