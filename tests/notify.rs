//! Notification fabric behavior through the public API.

mod common;

use common::memory_store;
use std::sync::Arc;
use std::time::Duration;
use trellis::backends::memory::MemoryStore;
use trellis::core::config::{NotificationConfig, NotificationMode, RetryConfig};
use trellis::notify::pubsub::{spawn_subscriber, Publisher};
use trellis::notify::{connect_subscriber, start_publisher};
use trellis::store::crud::ObjectCrud;
use trellis::{Action, ChangeEvent, EventFanout, EventSink, StoreContract};

#[tokio::test]
async fn native_notifications_follow_writes() {
    let store = memory_store(&["lport"]).await;
    let mut sub = store.subscribe().expect("memory backend is watchable");

    store.create_key("lport", "p1", "v1", None).await.unwrap();
    store.set_key("lport", "p1", "v2", None).await.unwrap();
    store.delete_key("lport", "p1", None).await.unwrap();

    let created = sub.recv().await.unwrap();
    assert_eq!(created.action, Action::Create);
    assert_eq!(created.value.as_deref(), Some("v1"));
    assert_eq!(sub.recv().await.unwrap().action, Action::Set);

    let deleted = sub.recv().await.unwrap();
    assert_eq!(deleted.action, Action::Delete);
    assert_eq!(deleted.value, None);
}

#[tokio::test]
async fn topic_selective_subscription_filters_events() {
    let store = Arc::new(MemoryStore::with_topic_selectivity(true));
    store.create_table("lport").await.unwrap();

    let mut tenant_a = store.subscribe_topics(vec!["tenant-a".to_string()]);

    store
        .create_key("lport", "other", "v", Some("tenant-b"))
        .await
        .unwrap();
    store
        .create_key("lport", "mine", "v", Some("tenant-a"))
        .await
        .unwrap();

    // Only the tenant-a event arrives.
    assert_eq!(tenant_a.recv().await.unwrap().key.as_deref(), Some("mine"));
}

#[tokio::test]
async fn cancelled_subscription_stops_receiving() {
    let store = memory_store(&["lport"]).await;
    let sub = store.subscribe().unwrap();
    sub.cancel();

    // Publishing after cancellation must not error or leak.
    store.create_key("lport", "p1", "v1", None).await.unwrap();
}

#[tokio::test]
async fn crud_events_ride_the_pubsub_transport() {
    // Full path: typed write -> publisher -> TCP -> subscriber fan-out.
    let publisher = Arc::new(
        Publisher::bind("127.0.0.1:0", false, Duration::from_secs(60))
            .await
            .unwrap(),
    );
    let endpoint = publisher.local_addr().to_string();

    let fanout = Arc::new(EventFanout::new(false));
    let mut sub = fanout.subscribe();
    let handle = spawn_subscriber(
        vec![endpoint],
        Vec::new(),
        Arc::clone(&fanout),
        RetryConfig::default(),
        5,
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let store = memory_store(&["lport"]).await;
    let crud = ObjectCrud::with_sink(
        store as Arc<dyn StoreContract>,
        Arc::clone(&publisher) as Arc<dyn EventSink>,
    );
    crud.create(&common::port("p1", "tenant-a")).await.unwrap();
    crud.delete::<common::Port>("p1", Some("tenant-a"))
        .await
        .unwrap();

    let created = sub.recv().await.unwrap();
    assert_eq!(created.table.as_deref(), Some("lport"));
    assert_eq!(created.key.as_deref(), Some("p1"));
    assert_eq!(created.action, Action::Create);
    assert_eq!(sub.recv().await.unwrap().action, Action::Delete);

    handle.stop().await;
}

#[tokio::test]
async fn configured_pubsub_fabric_wires_end_to_end() {
    let mut notifications = NotificationConfig {
        mode: NotificationMode::Pubsub,
        publisher_bind: "127.0.0.1:0".to_string(),
        ..NotificationConfig::default()
    };

    let publisher = start_publisher(&notifications).await.unwrap().unwrap();
    notifications.publisher_endpoints = vec![publisher.local_addr().to_string()];

    let fanout = Arc::new(EventFanout::new(false));
    let mut sub = fanout.subscribe();
    let handle = connect_subscriber(
        &notifications,
        RetryConfig::default(),
        Vec::new(),
        Arc::clone(&fanout),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    publisher.publish(&ChangeEvent::new(
        "lport",
        "p1",
        Action::Create,
        Some("v".to_string()),
        None,
    ));
    assert_eq!(sub.recv().await.unwrap().key.as_deref(), Some("p1"));

    handle.stop().await;
    publisher.stop();

    // Native mode wires no transport at all.
    let native = NotificationConfig::default();
    assert!(start_publisher(&native).await.unwrap().is_none());
    assert!(connect_subscriber(&native, RetryConfig::default(), Vec::new(), fanout).is_none());
}
