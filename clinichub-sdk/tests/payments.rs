//! Payment notifications over a tenant broadcast group.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use clinichub_sdk::event::{events, procedures};
use clinichub_sdk::notifications::PaymentNotifications;
use clinichub_sdk::transport::memory::MemoryHub;
use clinichub_sdk::ConnectionState;

use common::{channel, eventually};

#[tokio::test(start_paused = true)]
async fn forwards_payment_events_for_the_watched_tenant() {
    let hub = MemoryHub::new();
    let notifications = PaymentNotifications::new(channel(&hub));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    notifications.on_payment(move |p| sink.lock().push((p.payment_id, p.status.clone())));

    notifications.channel().connect("tok").await.unwrap();
    notifications.watch_tenant("acme").await.unwrap();
    assert_eq!(hub.calls_to(procedures::JOIN_GROUP), vec![vec![json!("tenant:acme")]]);

    hub.push(
        events::PAYMENT_UPDATED,
        vec![json!({"paymentId": 11, "tenantId": "acme", "status": "paid", "amount": 45.5})],
    )
    .await;
    // malformed payloads are dropped, later events still flow
    hub.push(events::PAYMENT_UPDATED, vec![json!("garbage")]).await;
    hub.push(
        events::PAYMENT_UPDATED,
        vec![json!({"paymentId": 12, "tenantId": "acme", "status": "refunded"})],
    )
    .await;

    eventually(|| seen.lock().len() == 2).await;
    assert_eq!(
        *seen.lock(),
        vec![(11, "paid".to_string()), (12, "refunded".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn switching_tenant_leaves_the_old_group() {
    let hub = MemoryHub::new();
    let notifications = PaymentNotifications::new(channel(&hub));
    notifications.channel().connect("tok").await.unwrap();

    notifications.watch_tenant("acme").await.unwrap();
    notifications.watch_tenant("globex").await.unwrap();

    assert_eq!(hub.calls_to(procedures::LEAVE_GROUP), vec![vec![json!("tenant:acme")]]);
    assert_eq!(notifications.tenant().as_deref(), Some("globex"));
}

#[tokio::test(start_paused = true)]
async fn tenant_group_is_rejoined_after_reconnect() {
    let hub = MemoryHub::new();
    let notifications = PaymentNotifications::new(channel(&hub));
    let ch = notifications.channel().clone();
    ch.connect("tok").await.unwrap();
    notifications.watch_tenant("acme").await.unwrap();

    hub.clear_invocations();
    hub.drop_link("server restart");
    eventually(|| hub.handshakes() == 2 && ch.state() == ConnectionState::Connected).await;
    eventually(|| !hub.calls_to(procedures::JOIN_GROUP).is_empty()).await;

    assert_eq!(hub.calls_to(procedures::JOIN_GROUP), vec![vec![json!("tenant:acme")]]);
}

#[tokio::test(start_paused = true)]
async fn watching_before_connect_joins_on_connect() {
    let hub = MemoryHub::new();
    let notifications = PaymentNotifications::new(channel(&hub));
    notifications.watch_tenant("acme").await.unwrap();
    assert!(hub.invocations().is_empty());

    notifications.channel().connect("tok").await.unwrap();
    assert_eq!(hub.calls_to(procedures::JOIN_GROUP), vec![vec![json!("tenant:acme")]]);

    notifications.close().await;
    assert!(!hub.is_linked());
    assert_eq!(notifications.tenant(), None);
}
