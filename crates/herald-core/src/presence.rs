//! Presence tracking for Herald.
//!
//! The hub keeps one roster per group and pushes the whole roster to every
//! member whenever it changes. Each member has a single-slot feed: updates
//! are offered without blocking and skipped when the slot is still full, so
//! a slow reader only ever misses intermediate snapshots.

use crate::event::{next_id, Identity};
use crate::request::{ask, submit, Acked};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Capacity of a member's roster feed.
const ROSTER_SLOT_CAPACITY: usize = 1;

/// A roster snapshot shared by every member it is sent to.
pub type Roster<E> = Arc<[Entity<E>]>;

/// Hub errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The worker task has stopped.
    #[error("Presence hub is closed")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Depth of each inbound request queue.
    pub request_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            request_capacity: 64,
        }
    }
}

/// A participant tracked by presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity<E> {
    /// Entity id, unique within a group.
    pub id: E,
    /// User-defined metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl<E> Entity<E> {
    /// Create an entity without metadata.
    #[must_use]
    pub fn new(id: E) -> Self {
        Self { id, meta: None }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Identifies one registration, so a superseded session can't evict its
/// replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

/// Everything needed to leave a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceKey<G, E> {
    /// Group that was joined.
    pub group: G,
    /// Entity that joined.
    pub entity: E,
    /// The registration this key belongs to.
    pub registration: RegistrationId,
}

/// A request to be present in a group.
///
/// Owns the only sending side of its [`RosterFeed`]; the hub closes the feed
/// by dropping the registration when it is superseded or leaves.
#[derive(Debug)]
pub struct Presence<G, E> {
    group: G,
    entity: Entity<E>,
    registration: RegistrationId,
    notify: mpsc::Sender<Roster<E>>,
}

impl<G: Identity, E: Identity> Presence<G, E> {
    /// Create a registration for `entity` in `group` and its roster feed.
    #[must_use]
    pub fn new(group: G, entity: Entity<E>) -> (Self, RosterFeed<E>) {
        let (notify, receiver) = mpsc::channel(ROSTER_SLOT_CAPACITY);
        let presence = Self {
            group,
            entity,
            registration: RegistrationId(next_id()),
            notify,
        };
        (presence, RosterFeed { receiver })
    }

    /// The group to join.
    #[must_use]
    pub fn group(&self) -> &G {
        &self.group
    }

    /// The entity joining.
    #[must_use]
    pub fn entity(&self) -> &Entity<E> {
        &self.entity
    }

    /// Key for leaving the group later.
    #[must_use]
    pub fn key(&self) -> PresenceKey<G, E> {
        PresenceKey {
            group: self.group.clone(),
            entity: self.entity.id.clone(),
            registration: self.registration,
        }
    }

    /// Close the roster feed, telling its reader it has been replaced.
    fn invalidate(self) {
        drop(self.notify);
    }

    /// Offer a roster without waiting. Returns `true` if it was accepted.
    fn offer(&self, roster: &Roster<E>) -> bool {
        match self.notify.try_send(Arc::clone(roster)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(entity = ?self.entity.id, "Roster slot full, update skipped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Receiving side of a member's single-slot roster feed.
#[derive(Debug)]
pub struct RosterFeed<E> {
    receiver: mpsc::Receiver<Roster<E>>,
}

impl<E> RosterFeed<E> {
    /// Wait for the next roster.
    ///
    /// Returns `None` once the registration has been superseded, has left,
    /// or the hub has stopped.
    pub async fn recv(&mut self) -> Option<Roster<E>> {
        self.receiver.recv().await
    }

    /// Take the pending roster, if any.
    pub fn try_recv(&mut self) -> Option<Roster<E>> {
        self.receiver.try_recv().ok()
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStats {
    /// Number of non-empty groups.
    pub group_count: usize,
    /// Number of members across all groups.
    pub member_count: usize,
}

enum Query<G, E> {
    Stats(oneshot::Sender<HubStats>),
    Roster(G, oneshot::Sender<Vec<Entity<E>>>),
}

/// Handle to a running presence hub.
#[derive(Clone)]
pub struct Hub<G: Identity, E: Identity> {
    joins: mpsc::Sender<Acked<Presence<G, E>>>,
    leaves: mpsc::Sender<Acked<PresenceKey<G, E>>>,
    queries: mpsc::Sender<Query<G, E>>,
}

impl<G: Identity, E: Identity> Hub<G, E> {
    /// Create a hub handle and the worker that serves it.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubWorker<G, E>) {
        info!("Creating presence hub with config: {:?}", config);
        let capacity = config.request_capacity.max(1);
        let (joins, joins_rx) = mpsc::channel(capacity);
        let (leaves, leaves_rx) = mpsc::channel(capacity);
        let (queries, queries_rx) = mpsc::channel(capacity);

        let handle = Self {
            joins,
            leaves,
            queries,
        };
        let worker = HubWorker {
            joins: joins_rx,
            leaves: leaves_rx,
            queries: queries_rx,
            groups: Groups::default(),
        };
        (handle, worker)
    }

    /// Create a hub and spawn its worker on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        let (handle, worker) = Self::new(config);
        (handle, tokio::spawn(worker.run()))
    }

    /// Join a group.
    ///
    /// Resolves after the roster change, including any broadcast, has been
    /// applied. The returned key is what [`Hub::remove_client`] expects.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the worker has stopped.
    pub async fn add_client(
        &self,
        presence: Presence<G, E>,
    ) -> Result<PresenceKey<G, E>, HubError> {
        let key = presence.key();
        if submit(&self.joins, presence).await {
            Ok(key)
        } else {
            Err(HubError::Closed)
        }
    }

    /// Leave a group.
    ///
    /// Ignored if the registration is no longer present, for example because
    /// a newer registration for the same entity replaced it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the worker has stopped.
    pub async fn remove_client(&self, key: PresenceKey<G, E>) -> Result<(), HubError> {
        submit(&self.leaves, key)
            .await
            .then_some(())
            .ok_or(HubError::Closed)
    }

    /// Get hub statistics.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the worker has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        ask(&self.queries, Query::Stats)
            .await
            .ok_or(HubError::Closed)
    }

    /// Current members of `group`. Empty if the group doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the worker has stopped.
    pub async fn roster(&self, group: G) -> Result<Vec<Entity<E>>, HubError> {
        ask(&self.queries, |reply| Query::Roster(group, reply))
            .await
            .ok_or(HubError::Closed)
    }
}

/// The task that owns every roster.
pub struct HubWorker<G: Identity, E: Identity> {
    joins: mpsc::Receiver<Acked<Presence<G, E>>>,
    leaves: mpsc::Receiver<Acked<PresenceKey<G, E>>>,
    queries: mpsc::Receiver<Query<G, E>>,
    groups: Groups<G, E>,
}

impl<G: Identity, E: Identity> HubWorker<G, E> {
    /// Serve requests one at a time until every handle is dropped.
    pub async fn run(self) {
        let Self {
            mut joins,
            mut leaves,
            mut queries,
            mut groups,
        } = self;

        info!("Presence hub started");

        loop {
            tokio::select! {
                Some(acked) = joins.recv() => {
                    let (presence, done) = acked.into_parts();
                    groups.join(presence);
                    done.complete();
                }
                Some(acked) = leaves.recv() => {
                    groups.leave(&acked.request);
                    acked.complete();
                }
                Some(query) = queries.recv() => match query {
                    Query::Stats(reply) => {
                        let _ = reply.send(groups.stats());
                    }
                    Query::Roster(group, reply) => {
                        let _ = reply.send(groups.roster(&group));
                    }
                },
                else => break,
            }
        }

        info!("Presence hub stopped");
    }
}

/// Group to entity id to registration.
struct Groups<G, E> {
    groups: HashMap<G, HashMap<E, Presence<G, E>>>,
}

impl<G, E> Default for Groups<G, E> {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }
}

impl<G: Identity, E: Identity> Groups<G, E> {
    fn join(&mut self, presence: Presence<G, E>) {
        let group = presence.group.clone();
        let entity = presence.entity.id.clone();

        match self.groups.entry(group.clone()) {
            Entry::Vacant(slot) => {
                // A lone first member already knows it is alone.
                debug!(group = ?group, entity = ?entity, "Created group");
                slot.insert(HashMap::from([(entity, presence)]));
            }
            Entry::Occupied(mut slot) => {
                let members = slot.get_mut();
                match members.insert(entity.clone(), presence) {
                    Some(previous) => {
                        debug!(group = ?group, entity = ?entity, "Presence superseded");
                        previous.invalidate();
                    }
                    None => debug!(group = ?group, entity = ?entity, "Presence joined"),
                }
                broadcast(&group, members);
            }
        }
    }

    fn leave(&mut self, key: &PresenceKey<G, E>) {
        let Some(members) = self.groups.get_mut(&key.group) else {
            return;
        };
        match members.get(&key.entity) {
            Some(current) if current.registration == key.registration => {}
            Some(_) => {
                trace!(group = ?key.group, entity = ?key.entity, "Stale leave ignored");
                return;
            }
            None => return,
        }

        members.remove(&key.entity);
        debug!(group = ?key.group, entity = ?key.entity, "Presence left");

        if members.is_empty() {
            self.groups.remove(&key.group);
            debug!(group = ?key.group, "Deleted empty group");
        } else {
            broadcast(&key.group, members);
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            group_count: self.groups.len(),
            member_count: self.groups.values().map(HashMap::len).sum(),
        }
    }

    fn roster(&self, group: &G) -> Vec<Entity<E>> {
        self.groups
            .get(group)
            .map(|members| members.values().map(|p| p.entity.clone()).collect())
            .unwrap_or_default()
    }
}

/// Offer the full roster of a group to each of its members.
fn broadcast<G: Identity, E: Identity>(group: &G, members: &HashMap<E, Presence<G, E>>) {
    let roster: Roster<E> = members.values().map(|p| p.entity.clone()).collect();
    let delivered = members.values().filter(|p| p.offer(&roster)).count();

    trace!(
        group = ?group,
        members = roster.len(),
        delivered,
        "Broadcast roster"
    );
}
