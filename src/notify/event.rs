//! Change events and subscription plumbing.
//!
//! Every delivery strategy (backend-native watch or out-of-band pub/sub)
//! funnels into the same `ChangeEvent` shape, so consumers never need to know
//! which transport delivered an event. Events for the same key are not
//! strictly ordered across independent sources; the entry value in the store
//! stays authoritative.

use crate::core::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Action carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Entry was created.
    Create,
    /// Entry was updated.
    Set,
    /// Entry was deleted.
    Delete,
    /// Notification stream was interrupted; consumers must fall back to
    /// full reconciliation.
    Sync,
}

impl Action {
    /// Stable wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Sync => "sync",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "set" => Some(Self::Set),
            "delete" => Some(Self::Delete),
            "sync" => Some(Self::Sync),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field separator for the wire form. Values are JSON and may contain any
/// printable character, so a control character is the only safe in-band
/// delimiter.
const FIELD_SEP: char = '\x1f';

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Table the entry belongs to. `None` only for sync events.
    pub table: Option<String>,

    /// Entry key. `None` only for sync events.
    pub key: Option<String>,

    /// What happened.
    pub action: Action,

    /// Entry value after the change. `None` for deletes and sync events.
    pub value: Option<String>,

    /// Topic scope used for selective fan-out. Not part of the wire tuple.
    pub topic: Option<String>,
}

impl ChangeEvent {
    /// Create a change event for a mutation.
    pub fn new(
        table: impl Into<String>,
        key: impl Into<String>,
        action: Action,
        value: Option<String>,
        topic: Option<String>,
    ) -> Self {
        Self {
            table: Some(table.into()),
            key: Some(key.into()),
            action,
            value,
            topic,
        }
    }

    /// Create the synthetic sync event signalling stream interruption.
    pub fn sync() -> Self {
        Self {
            table: None,
            key: None,
            action: Action::Sync,
            value: None,
            topic: None,
        }
    }

    /// Check whether this is the sync fallback signal.
    pub fn is_sync(&self) -> bool {
        self.action == Action::Sync
    }

    /// Serialize as the delimited 4-tuple wire form.
    ///
    /// `table SEP key SEP action SEP value`, absent fields encoded empty.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(self.table.as_deref().unwrap_or(""));
        out.push(FIELD_SEP);
        out.push_str(self.key.as_deref().unwrap_or(""));
        out.push(FIELD_SEP);
        out.push_str(self.action.as_str());
        out.push(FIELD_SEP);
        out.push_str(self.value.as_deref().unwrap_or(""));
        out
    }

    /// Parse the delimited 4-tuple wire form.
    pub fn decode(wire: &str) -> StoreResult<Self> {
        let mut fields = wire.splitn(4, FIELD_SEP);
        let table = fields.next().unwrap_or("");
        let key = fields.next().ok_or_else(|| malformed(wire))?;
        let action = fields.next().ok_or_else(|| malformed(wire))?;
        let value = fields.next().ok_or_else(|| malformed(wire))?;

        let action = Action::parse(action).ok_or_else(|| malformed(wire))?;
        let opt = |s: &str| {
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        };

        Ok(Self {
            table: opt(table),
            key: opt(key),
            action,
            value: opt(value),
            topic: None,
        })
    }
}

fn malformed(wire: &str) -> StoreError {
    StoreError::connection(format!("malformed change event frame: {wire:?}"))
}

/// A cancellable stream of change events.
///
/// Dropping (or explicitly cancelling) the subscription detaches it from the
/// fan-out; the publishing side prunes closed receivers on the next send.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl EventSubscription {
    /// Wrap a receiver into a subscription.
    pub fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event; `None` once the producing side is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Cancel the subscription.
    pub fn cancel(self) {}
}

/// Anything that can carry a change event toward subscribers: the local
/// fan-out, or the out-of-band pub/sub publisher.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn publish(&self, event: &ChangeEvent);
}

/// Fan-out point shared by producers and their subscribers.
///
/// When topic selectivity is on, subscribers receive only events matching
/// their topics (plus everything published under the send-all topic and all
/// sync events).
pub struct EventFanout {
    subscribers: Mutex<Vec<Subscriber>>,
    topic_selective: bool,
}

struct Subscriber {
    tx: mpsc::UnboundedSender<ChangeEvent>,
    topics: Vec<String>,
}

impl EventFanout {
    /// Create a fan-out. With `topic_selective` off every subscriber sees
    /// every event.
    pub fn new(topic_selective: bool) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            topic_selective,
        }
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_topics(Vec::new())
    }

    /// Subscribe to a set of topics. An empty set means everything.
    pub fn subscribe_topics(&self, topics: Vec<String>) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { tx, topics });
        EventSubscription::new(rx)
    }

    /// Deliver an event to matching subscribers, pruning closed ones.
    pub fn publish(&self, event: &ChangeEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|sub| {
            if !self.matches(sub, event) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn matches(&self, sub: &Subscriber, event: &ChangeEvent) -> bool {
        if !self.topic_selective || sub.topics.is_empty() || event.is_sync() {
            return true;
        }
        match event.topic.as_deref() {
            Some(crate::store::keys::SEND_ALL_TOPIC) | None => true,
            Some(topic) => sub.topics.iter().any(|t| t == topic),
        }
    }
}

impl EventSink for EventFanout {
    fn publish(&self, event: &ChangeEvent) {
        EventFanout::publish(self, event);
    }
}
