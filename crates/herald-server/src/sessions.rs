//! Streaming sessions.
//!
//! A session registers with the broker or the hub, drains its outbox or
//! roster feed into encoded frames, and deregisters when the response body
//! is dropped.

use crate::metrics::{self, kinds, SessionMetricsGuard};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use herald_core::{
    Broker, BrokerError, Connection, Entity, Event, Hub, HubError, Outbox, Presence, PresenceKey,
    RosterFeed,
};
use herald_protocol::{
    codec, Frame, Member, ProtocolError, RosterSnapshot, PRESENCE_ID, SUPERSEDED_ID,
};
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Encoded event-stream body.
pub type FrameStream = BoxStream<'static, Result<Bytes, Infallible>>;

/// Open an event stream for `recipient`.
///
/// # Errors
///
/// Returns an error if the broker has stopped.
pub async fn open_event_stream(
    broker: &Broker<String>,
    recipient: String,
    heartbeat: Duration,
) -> Result<FrameStream, BrokerError> {
    let (connection, outbox) = broker.connection(recipient);
    broker.add_client(connection.clone()).await?;

    debug!(
        recipient = %connection.target(),
        connection = %connection.id(),
        "Event stream opened"
    );

    let session = EventSession {
        outbox,
        ticker: keep_alive_timer(heartbeat),
        _registration: BrokerRegistration {
            broker: broker.clone(),
            connection: Some(connection),
        },
        _metrics: SessionMetricsGuard::new(kinds::EVENTS),
    };

    Ok(stream::unfold(session, |mut session| async move {
        loop {
            let frame = session.next_frame().await?;
            if let Some(bytes) = encode_frame(frame, kinds::EVENTS) {
                return Some((Ok(bytes), session));
            }
        }
    })
    .boxed())
}

/// Join `group` as `entity` and stream roster snapshots.
///
/// # Errors
///
/// Returns an error if the hub has stopped.
pub async fn open_presence_stream(
    hub: &Hub<String, String>,
    group: String,
    entity: Entity<String>,
    heartbeat: Duration,
) -> Result<FrameStream, HubError> {
    let (presence, feed) = Presence::new(group.clone(), entity);
    let key = hub.add_client(presence).await?;

    debug!(group = %key.group, entity = %key.entity, "Presence stream opened");

    let session = PresenceSession {
        group,
        feed,
        ticker: keep_alive_timer(heartbeat),
        finished: false,
        _registration: HubRegistration {
            hub: hub.clone(),
            key: Some(key),
        },
        _metrics: SessionMetricsGuard::new(kinds::PRESENCE),
    };

    Ok(stream::unfold(session, |mut session| async move {
        loop {
            let frame = session.next_frame().await?;
            if let Some(bytes) = encode_frame(frame, kinds::PRESENCE) {
                return Some((Ok(bytes), session));
            }
        }
    })
    .boxed())
}

struct EventSession {
    outbox: Outbox<String>,
    ticker: Interval,
    _registration: BrokerRegistration,
    _metrics: SessionMetricsGuard,
}

impl EventSession {
    async fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        tokio::select! {
            event = self.outbox.recv() => event.map(|event| Ok(event_frame(&event))),
            _ = self.ticker.tick() => Some(Ok(Frame::keep_alive())),
        }
    }
}

struct PresenceSession {
    group: String,
    feed: RosterFeed<String>,
    ticker: Interval,
    finished: bool,
    _registration: HubRegistration,
    _metrics: SessionMetricsGuard,
}

impl PresenceSession {
    async fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        if self.finished {
            return None;
        }

        tokio::select! {
            roster = self.feed.recv() => match roster {
                Some(roster) => Some(roster_frame(&self.group, &roster)),
                None => {
                    // Our own leave only happens on drop, so a closed feed
                    // means a newer session took over.
                    self.finished = true;
                    debug!(group = %self.group, "Presence stream superseded");
                    metrics::record_superseded();
                    Some(Ok(Frame::message(SUPERSEDED_ID, "{}")))
                }
            },
            _ = self.ticker.tick() => Some(Ok(Frame::keep_alive())),
        }
    }
}

/// Removes a connection from the broker when the session ends.
struct BrokerRegistration {
    broker: Broker<String>,
    connection: Option<Connection<String>>,
}

impl Drop for BrokerRegistration {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            let broker = self.broker.clone();
            spawn_cleanup(async move {
                let id = connection.id();
                match broker.remove_client(connection).await {
                    Ok(()) => debug!(connection = %id, "Event stream closed"),
                    Err(e) => debug!(connection = %id, error = %e, "Broker gone before cleanup"),
                }
            });
        }
    }
}

/// Leaves the presence group when the session ends.
struct HubRegistration {
    hub: Hub<String, String>,
    key: Option<PresenceKey<String, String>>,
}

impl Drop for HubRegistration {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let hub = self.hub.clone();
            spawn_cleanup(async move {
                let group = key.group.clone();
                match hub.remove_client(key).await {
                    Ok(()) => debug!(group = %group, "Presence stream closed"),
                    Err(e) => debug!(group = %group, error = %e, "Hub gone before cleanup"),
                }
            });
        }
    }
}

/// Run a cleanup future on the current runtime, if there is one.
fn spawn_cleanup<F>(cleanup: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(cleanup);
        }
        Err(_) => warn!("No runtime available, session cleanup skipped"),
    }
}

fn keep_alive_timer(period: Duration) -> Interval {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn encode_frame(frame: Result<Frame, ProtocolError>, kind: &'static str) -> Option<Bytes> {
    match frame.and_then(|frame| codec::encode(&frame)) {
        Ok(bytes) => {
            metrics::record_frame(kind);
            Some(bytes)
        }
        Err(e) => {
            warn!(error = %e, "Dropping frame that cannot be encoded");
            metrics::record_error("encode");
            None
        }
    }
}

/// Frame an event as its type label followed by its payload.
pub fn event_frame(event: &Event<String>) -> Frame {
    Frame::message(event.kind(), String::from_utf8_lossy(event.payload()))
}

/// Frame a roster snapshot for `group`.
///
/// # Errors
///
/// Returns an error if the snapshot cannot be serialized.
pub fn roster_frame(group: &str, roster: &[Entity<String>]) -> Result<Frame, ProtocolError> {
    let snapshot = RosterSnapshot {
        group: group.to_string(),
        members: roster
            .iter()
            .map(|entity| Member {
                id: entity.id.clone(),
                meta: entity.meta.clone(),
            })
            .collect(),
    };
    Frame::json(PRESENCE_ID, &snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::{BrokerConfig, HubConfig};
    use serde_json::json;

    const HEARTBEAT: Duration = Duration::from_secs(60);

    fn snapshot(bytes: &[u8]) -> RosterSnapshot {
        let frame = codec::decode(bytes).unwrap();
        assert_eq!(frame.id(), Some(PRESENCE_ID));
        serde_json::from_str(frame.data().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_event_stream_delivers_frames() {
        let (broker, _worker) = Broker::spawn(BrokerConfig::default());
        let mut stream = open_event_stream(&broker, "u1".to_string(), HEARTBEAT)
            .await
            .unwrap();

        broker
            .publish(Event::to("ping", "u1".to_string(), br#"{"n":1}"#.to_vec()))
            .await
            .unwrap();

        let bytes = stream.next().await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"id: ping\ndata: {\"n\":1}\n\n");
    }

    #[tokio::test]
    async fn test_dropping_event_stream_deregisters() {
        let (broker, _worker) = Broker::spawn(BrokerConfig::default());
        let stream = open_event_stream(&broker, "u1".to_string(), HEARTBEAT)
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count("u1".to_string()).await.unwrap(), 1);

        drop(stream);

        for _ in 0..100 {
            if broker.stats().await.unwrap().connection_count == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("Connection was not removed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_sends_keep_alive() {
        let (broker, _worker) = Broker::spawn(BrokerConfig::default());
        let mut stream = open_event_stream(&broker, "u1".to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        let bytes = stream.next().await.unwrap().unwrap();
        assert_eq!(&bytes[..], b": keep-alive\n\n");
    }

    #[tokio::test]
    async fn test_presence_stream_receives_roster() {
        let (hub, _worker) = Hub::spawn(HubConfig::default());

        let mut alice = open_presence_stream(
            &hub,
            "room1".to_string(),
            Entity::new("a".to_string()).with_meta(json!({"name": "Alice"})),
            HEARTBEAT,
        )
        .await
        .unwrap();
        let mut bob = open_presence_stream(
            &hub,
            "room1".to_string(),
            Entity::new("b".to_string()),
            HEARTBEAT,
        )
        .await
        .unwrap();

        for stream in [&mut alice, &mut bob] {
            let roster = snapshot(&stream.next().await.unwrap().unwrap());
            assert_eq!(roster.group, "room1");
            let mut ids: Vec<_> = roster.members.iter().map(|m| m.id.as_str()).collect();
            ids.sort_unstable();
            assert_eq!(ids, ["a", "b"]);
        }
    }

    #[tokio::test]
    async fn test_superseded_presence_stream_ends() {
        let (hub, _worker) = Hub::spawn(HubConfig::default());

        let mut first = open_presence_stream(
            &hub,
            "room1".to_string(),
            Entity::new("a".to_string()),
            HEARTBEAT,
        )
        .await
        .unwrap();
        let _second = open_presence_stream(
            &hub,
            "room1".to_string(),
            Entity::new("a".to_string()),
            HEARTBEAT,
        )
        .await
        .unwrap();

        let bytes = first.next().await.unwrap().unwrap();
        assert_eq!(codec::decode(&bytes).unwrap().id(), Some(SUPERSEDED_ID));
        assert!(first.next().await.is_none());

        // Dropping the old stream must not evict the new session.
        drop(first);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.stats().await.unwrap().member_count, 1);
    }

    #[test]
    fn test_event_frame_is_lossy_for_binary_payloads() {
        let event = Event::to("blob", "u1".to_string(), vec![0xff, b'o', b'k']);
        let frame = event_frame(&event);
        assert_eq!(frame.id(), Some("blob"));
        assert_eq!(frame.data(), Some("\u{fffd}ok"));
    }
}
