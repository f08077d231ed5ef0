//! Event broker for Herald.
//!
//! The broker fans events out to live connections keyed by recipient
//! identity. All index state lives inside a single worker task; handles talk
//! to it over bounded queues, so the index is never touched concurrently.

use crate::event::{next_id, Event, Identity};
use crate::request::{ask, submit, Acked};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Broker errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The worker task has stopped.
    #[error("Event broker is closed")]
    Closed,
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Depth of each inbound request queue.
    pub request_capacity: usize,
    /// Outbox depth for connections minted by [`Broker::connection`].
    pub outbox_capacity: usize,
    /// Give up on a single outbox after this long. `None` waits forever.
    pub delivery_timeout: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_capacity: 64,
            outbox_capacity: 256,
            delivery_timeout: None,
        }
    }
}

/// Identity of a single live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn generate() -> Self {
        Self(next_id())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live subscriber registered under one recipient identity.
///
/// Two connections with the same target are still distinct entries; identity
/// comes from the [`ConnectionId`] minted together with the outbox.
#[derive(Debug, Clone)]
pub struct Connection<T> {
    id: ConnectionId,
    target: T,
    outbox: mpsc::Sender<Arc<Event<T>>>,
}

impl<T: Identity> Connection<T> {
    /// Create a connection whose outbox holds up to `capacity` events.
    #[must_use]
    pub fn with_capacity(target: T, capacity: usize) -> (Self, Outbox<T>) {
        let (outbox, receiver) = mpsc::channel(capacity.max(1));
        let id = ConnectionId::generate();
        (Self { id, target, outbox }, Outbox { id, receiver })
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The identity this connection receives events for.
    #[must_use]
    pub fn target(&self) -> &T {
        &self.target
    }
}

/// Receiving side of a connection. Only the owning session drains it.
#[derive(Debug)]
pub struct Outbox<T> {
    id: ConnectionId,
    receiver: mpsc::Receiver<Arc<Event<T>>>,
}

impl<T> Outbox<T> {
    /// Id of the connection feeding this outbox.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the broker and every [`Connection`] clone have
    /// let go of the sending side.
    pub async fn recv(&mut self) -> Option<Arc<Event<T>>> {
        self.receiver.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<Event<T>>> {
        self.receiver.try_recv().ok()
    }
}

/// Broker statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerStats {
    /// Number of identities with at least one connection.
    pub target_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
}

enum Query<T> {
    Stats(oneshot::Sender<BrokerStats>),
    SubscriberCount(T, oneshot::Sender<usize>),
}

/// Handle to a running event broker.
///
/// Cheap to clone. The worker stops once every handle has been dropped.
#[derive(Clone)]
pub struct Broker<T: Identity> {
    connect: mpsc::Sender<Acked<Connection<T>>>,
    disconnect: mpsc::Sender<Acked<Connection<T>>>,
    notifier: mpsc::Sender<Arc<Event<T>>>,
    queries: mpsc::Sender<Query<T>>,
    outbox_capacity: usize,
}

impl<T: Identity> Broker<T> {
    /// Create a broker handle and the worker that serves it.
    ///
    /// The worker does nothing until [`BrokerWorker::run`] is polled.
    #[must_use]
    pub fn new(config: BrokerConfig) -> (Self, BrokerWorker<T>) {
        info!("Creating event broker with config: {:?}", config);
        let capacity = config.request_capacity.max(1);
        let (connect, connect_rx) = mpsc::channel(capacity);
        let (disconnect, disconnect_rx) = mpsc::channel(capacity);
        let (notifier, notifier_rx) = mpsc::channel(capacity);
        let (queries, queries_rx) = mpsc::channel(capacity);

        let handle = Self {
            connect,
            disconnect,
            notifier,
            queries,
            outbox_capacity: config.outbox_capacity,
        };
        let worker = BrokerWorker {
            connect: connect_rx,
            disconnect: disconnect_rx,
            notifier: notifier_rx,
            queries: queries_rx,
            index: Index {
                clients: HashMap::new(),
                delivery_timeout: config.delivery_timeout,
            },
        };
        (handle, worker)
    }

    /// Create a broker and spawn its worker on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn spawn(config: BrokerConfig) -> (Self, JoinHandle<()>) {
        let (handle, worker) = Self::new(config);
        (handle, tokio::spawn(worker.run()))
    }

    /// Mint a connection for `target` with the configured outbox depth.
    #[must_use]
    pub fn connection(&self, target: T) -> (Connection<T>, Outbox<T>) {
        Connection::with_capacity(target, self.outbox_capacity)
    }

    /// Register a connection.
    ///
    /// Resolves once the worker has added it to the index, so anything
    /// submitted afterwards sees the registration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the worker has stopped.
    pub async fn add_client(&self, connection: Connection<T>) -> Result<(), BrokerError> {
        submit(&self.connect, connection)
            .await
            .then_some(())
            .ok_or(BrokerError::Closed)
    }

    /// Deregister a connection. Unknown connections are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the worker has stopped.
    pub async fn remove_client(&self, connection: Connection<T>) -> Result<(), BrokerError> {
        submit(&self.disconnect, connection)
            .await
            .then_some(())
            .ok_or(BrokerError::Closed)
    }

    /// Queue an event for distribution.
    ///
    /// Resolves once the event is queued, not when it has been delivered.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the worker has stopped.
    pub async fn publish(&self, event: Event<T>) -> Result<(), BrokerError> {
        self.notifier
            .send(Arc::new(event))
            .await
            .map_err(|_| BrokerError::Closed)
    }

    /// Get broker statistics.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the worker has stopped.
    pub async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        ask(&self.queries, Query::Stats)
            .await
            .ok_or(BrokerError::Closed)
    }

    /// Number of connections registered under `target`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the worker has stopped.
    pub async fn subscriber_count(&self, target: T) -> Result<usize, BrokerError> {
        ask(&self.queries, |reply| Query::SubscriberCount(target, reply))
            .await
            .ok_or(BrokerError::Closed)
    }
}

/// The task that owns the broker index.
pub struct BrokerWorker<T: Identity> {
    connect: mpsc::Receiver<Acked<Connection<T>>>,
    disconnect: mpsc::Receiver<Acked<Connection<T>>>,
    notifier: mpsc::Receiver<Arc<Event<T>>>,
    queries: mpsc::Receiver<Query<T>>,
    index: Index<T>,
}

impl<T: Identity> BrokerWorker<T> {
    /// Serve requests one at a time until every handle is dropped.
    pub async fn run(self) {
        let Self {
            mut connect,
            mut disconnect,
            mut notifier,
            mut queries,
            mut index,
        } = self;

        info!("Event broker started");

        loop {
            tokio::select! {
                Some(acked) = connect.recv() => {
                    index.register(&acked.request);
                    acked.complete();
                }
                Some(acked) = disconnect.recv() => {
                    index.deregister(&acked.request);
                    acked.complete();
                }
                Some(event) = notifier.recv() => {
                    index.distribute(&event).await;
                }
                Some(query) = queries.recv() => match query {
                    Query::Stats(reply) => {
                        let _ = reply.send(index.stats());
                    }
                    Query::SubscriberCount(target, reply) => {
                        let _ = reply.send(index.subscriber_count(&target));
                    }
                },
                else => break,
            }
        }

        info!("Event broker stopped");
    }
}

type Outboxes<T> = HashMap<ConnectionId, mpsc::Sender<Arc<Event<T>>>>;

/// Recipient identity to the outboxes registered under it.
struct Index<T> {
    clients: HashMap<T, Outboxes<T>>,
    delivery_timeout: Option<Duration>,
}

impl<T: Identity> Index<T> {
    fn register(&mut self, connection: &Connection<T>) {
        let bucket = self.clients.entry(connection.target.clone()).or_default();
        bucket
            .entry(connection.id)
            .or_insert_with(|| connection.outbox.clone());

        debug!(
            recipient = ?connection.target,
            connection = %connection.id,
            connections = bucket.len(),
            "Connection registered"
        );
    }

    fn deregister(&mut self, connection: &Connection<T>) {
        let Some(bucket) = self.clients.get_mut(&connection.target) else {
            return;
        };
        if bucket.remove(&connection.id).is_none() {
            return;
        }

        debug!(
            recipient = ?connection.target,
            connection = %connection.id,
            connections = bucket.len(),
            "Connection deregistered"
        );

        if bucket.is_empty() {
            self.clients.remove(&connection.target);
            debug!(recipient = ?connection.target, "Removed empty target");
        }
    }

    /// Hand `event` to every outbox of every target, waiting on each.
    async fn distribute(&self, event: &Arc<Event<T>>) {
        let mut delivered = 0usize;

        for target in event.targets() {
            let Some(bucket) = self.clients.get(target) else {
                trace!(recipient = ?target, kind = %event.kind(), "No connections for target");
                continue;
            };

            for (id, outbox) in bucket {
                if self.deliver(*id, outbox, event).await {
                    delivered += 1;
                }
            }
        }

        trace!(kind = %event.kind(), recipients = delivered, "Published event");
    }

    async fn deliver(
        &self,
        id: ConnectionId,
        outbox: &mpsc::Sender<Arc<Event<T>>>,
        event: &Arc<Event<T>>,
    ) -> bool {
        let send = outbox.send(Arc::clone(event));
        let sent = match self.delivery_timeout {
            None => send.await,
            Some(limit) => match tokio::time::timeout(limit, send).await {
                Ok(sent) => sent,
                Err(_) => {
                    warn!(connection = %id, kind = %event.kind(), "Outbox stalled, event dropped");
                    return false;
                }
            },
        };

        if sent.is_err() {
            // Reader is gone; the owner still has to remove the connection.
            debug!(connection = %id, "Outbox closed");
            return false;
        }
        true
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            target_count: self.clients.len(),
            connection_count: self.clients.values().map(HashMap::len).sum(),
        }
    }

    fn subscriber_count(&self, target: &T) -> usize {
        self.clients.get(target).map(HashMap::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn spawn_broker() -> Broker<&'static str> {
        Broker::spawn(BrokerConfig::default()).0
    }

    fn ping(targets: &[&'static str]) -> Event<&'static str> {
        Event::new("ping", targets.iter().copied(), Bytes::from_static(b"{}"))
    }

    #[tokio::test]
    async fn test_targeted_delivery() {
        let broker = spawn_broker();

        let (c1, mut out1) = broker.connection("u1");
        let (c2, mut out2) = broker.connection("u2");
        broker.add_client(c1).await.unwrap();
        broker.add_client(c2).await.unwrap();

        broker.publish(ping(&["u1"])).await.unwrap();

        let event = out1.recv().await.unwrap();
        assert_eq!(event.kind(), "ping");
        assert_eq!(event.targets(), &["u1"]);

        // The stats round trip runs after the publish has been distributed.
        broker.stats().await.unwrap();
        assert!(out2.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_every_connection_of_a_target_receives() {
        let broker = spawn_broker();

        let mut outboxes = Vec::new();
        for _ in 0..3 {
            let (conn, outbox) = broker.connection("a");
            broker.add_client(conn).await.unwrap();
            outboxes.push(outbox);
        }
        let (other, mut other_outbox) = broker.connection("b");
        broker.add_client(other).await.unwrap();

        broker.publish(ping(&["a"])).await.unwrap();

        for outbox in &mut outboxes {
            assert_eq!(outbox.recv().await.unwrap().kind(), "ping");
        }
        broker.stats().await.unwrap();
        assert!(other_outbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_multiple_targets() {
        let broker = spawn_broker();

        let (a, mut out_a) = broker.connection("a");
        let (b, mut out_b) = broker.connection("b");
        broker.add_client(a).await.unwrap();
        broker.add_client(b).await.unwrap();

        broker.publish(ping(&["a", "nobody", "b"])).await.unwrap();

        assert!(out_a.recv().await.is_some());
        assert!(out_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_remove_cleans_up_target() {
        let broker = spawn_broker();

        let (conn, mut outbox) = broker.connection("a");
        broker.add_client(conn.clone()).await.unwrap();
        assert_eq!(broker.subscriber_count("a").await.unwrap(), 1);

        broker.remove_client(conn).await.unwrap();
        assert_eq!(broker.stats().await.unwrap(), BrokerStats::default());

        broker.publish(ping(&["a"])).await.unwrap();
        broker.stats().await.unwrap();
        assert!(outbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_remove_keeps_other_connections() {
        let broker = spawn_broker();

        let (first, _out1) = broker.connection("a");
        let (second, mut out2) = broker.connection("a");
        broker.add_client(first.clone()).await.unwrap();
        broker.add_client(second).await.unwrap();

        broker.remove_client(first).await.unwrap();
        assert_eq!(broker.subscriber_count("a").await.unwrap(), 1);

        broker.publish(ping(&["a"])).await.unwrap();
        assert!(out2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_add_is_single_entry() {
        let broker = spawn_broker();

        let (conn, mut outbox) = broker.connection("a");
        broker.add_client(conn.clone()).await.unwrap();
        broker.add_client(conn).await.unwrap();

        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.target_count, 1);
        assert_eq!(stats.connection_count, 1);

        broker.publish(ping(&["a"])).await.unwrap();
        assert!(outbox.recv().await.is_some());
        broker.stats().await.unwrap();
        assert!(outbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let broker = spawn_broker();

        let (registered, _out) = broker.connection("a");
        let (stranger, _stranger_out) = broker.connection("a");
        broker.add_client(registered).await.unwrap();

        broker.remove_client(stranger).await.unwrap();
        assert_eq!(broker.subscriber_count("a").await.unwrap(), 1);

        let (nobody, _nobody_out) = broker.connection("z");
        broker.remove_client(nobody).await.unwrap();
        assert_eq!(broker.stats().await.unwrap().target_count, 1);
    }

    #[tokio::test]
    async fn test_closed_outbox_is_skipped() {
        let broker = spawn_broker();

        let (gone, gone_outbox) = broker.connection("a");
        let (live, mut live_outbox) = broker.connection("a");
        broker.add_client(gone).await.unwrap();
        broker.add_client(live).await.unwrap();
        drop(gone_outbox);

        broker.publish(ping(&["a"])).await.unwrap();
        assert!(live_outbox.recv().await.is_some());

        // The dead connection stays until its owner removes it.
        assert_eq!(broker.subscriber_count("a").await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_outbox_stalls_worker() {
        let broker = spawn_broker();

        let (conn, mut outbox) = Connection::with_capacity("a", 1);
        broker.add_client(conn).await.unwrap();

        broker.publish(ping(&["a"])).await.unwrap();
        broker.publish(ping(&["a"])).await.unwrap();
        // Let the worker fill the outbox and block on the second event.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let stalled = tokio::time::timeout(Duration::from_secs(5), broker.stats()).await;
        assert!(stalled.is_err());

        assert!(outbox.recv().await.is_some());
        assert!(outbox.recv().await.is_some());
        assert_eq!(broker.stats().await.unwrap().connection_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_timeout_drops_event() {
        let config = BrokerConfig {
            delivery_timeout: Some(Duration::from_millis(50)),
            ..BrokerConfig::default()
        };
        let (broker, _worker) = Broker::spawn(config);

        let (conn, mut outbox) = Connection::with_capacity("a", 1);
        broker.add_client(conn).await.unwrap();

        broker
            .publish(Event::to("first", "a", Bytes::new()))
            .await
            .unwrap();
        broker
            .publish(Event::to("second", "a", Bytes::new()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // The second delivery timed out instead of wedging the worker.
        assert_eq!(broker.stats().await.unwrap().connection_count, 1);
        assert_eq!(outbox.recv().await.unwrap().kind(), "first");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(outbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_worker_stops_when_handles_dropped() {
        let (broker, worker) = Broker::<String>::spawn(BrokerConfig::default());
        let (conn, mut outbox) = broker.connection("a".to_string());
        broker.add_client(conn).await.unwrap();

        drop(broker);
        worker.await.unwrap();

        // The index held the last sender.
        assert!(outbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_broker_errors() {
        let (broker, worker) = Broker::<u32>::new(BrokerConfig::default());
        drop(worker);

        let (conn, _outbox) = broker.connection(1);
        assert_eq!(broker.add_client(conn).await, Err(BrokerError::Closed));
        assert_eq!(
            broker.publish(Event::to("x", 1, Bytes::new())).await,
            Err(BrokerError::Closed)
        );
        assert_eq!(broker.stats().await, Err(BrokerError::Closed));
    }
}
