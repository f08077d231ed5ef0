//! Shared fixtures for Herald benchmarks.

use bytes::Bytes;
use herald_core::{Broker, BrokerConfig, Entity, Hub, HubConfig, Outbox, Presence, RosterFeed};
use herald_protocol::{codec, Frame};
use tokio::runtime::Runtime;

/// Single-threaded runtime, so results measure the workers rather than
/// cross-thread wakeups.
///
/// # Panics
///
/// Panics if the runtime cannot be built.
#[must_use]
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Payload of `size` bytes of JSON-safe text.
#[must_use]
pub fn payload(size: usize) -> Bytes {
    Bytes::from("x".repeat(size))
}

/// Recipient name for index `i`.
#[must_use]
pub fn recipient(i: usize) -> String {
    format!("user-{i}")
}

/// Broker with `targets` recipients, each holding `per_target` connections.
///
/// # Panics
///
/// Panics if the broker stops while subscribing.
pub async fn subscribed_broker(
    targets: usize,
    per_target: usize,
) -> (Broker<String>, Vec<Outbox<String>>) {
    let (broker, _) = Broker::spawn(BrokerConfig::default());
    let mut outboxes = Vec::with_capacity(targets * per_target);

    for i in 0..targets {
        for _ in 0..per_target {
            let (connection, outbox) = broker.connection(recipient(i));
            broker
                .add_client(connection)
                .await
                .expect("broker stopped");
            outboxes.push(outbox);
        }
    }

    (broker, outboxes)
}

/// Hub with one group of `members` entities.
///
/// # Panics
///
/// Panics if the hub stops while joining.
pub async fn populated_hub(
    group: &str,
    members: usize,
) -> (Hub<String, String>, Vec<RosterFeed<String>>) {
    let (hub, _) = Hub::spawn(HubConfig::default());
    let mut feeds = Vec::with_capacity(members);

    for i in 0..members {
        let (presence, feed) = Presence::new(group.to_string(), Entity::new(recipient(i)));
        hub.add_client(presence).await.expect("hub stopped");
        feeds.push(feed);
    }

    (hub, feeds)
}

/// Wait for one event on every outbox and encode it as a frame. Returns the
/// number of bytes written.
pub async fn receive_encoded(outboxes: &mut [Outbox<String>]) -> usize {
    let mut written = 0;
    for outbox in outboxes.iter_mut() {
        if let Some(event) = outbox.recv().await {
            let frame = Frame::message(event.kind(), String::from_utf8_lossy(event.payload()));
            if let Ok(bytes) = codec::encode(&frame) {
                written += bytes.len();
            }
        }
    }
    written
}
