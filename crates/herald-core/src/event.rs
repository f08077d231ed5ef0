//! Event types shared by the broker and the presence hub.

use bytes::Bytes;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// An identifier usable as a recipient, group or entity key.
///
/// Blanket-implemented for every type that can key a `HashMap` and cross
/// task boundaries, so `String`, `u64` or a newtype all work.
pub trait Identity: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Identity for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Process-wide counter backing connection and registration ids.
static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Mint a process-unique id.
pub(crate) fn next_id() -> u64 {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An application event addressed to zero or more recipients.
///
/// The payload is opaque to the broker. Events are immutable once built and
/// are shared between outboxes behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<T> {
    kind: String,
    targets: Vec<T>,
    payload: Bytes,
}

impl<T> Event<T> {
    /// Create a new event.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        targets: impl IntoIterator<Item = T>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind: kind.into(),
            targets: targets.into_iter().collect(),
            payload: payload.into(),
        }
    }

    /// Create an event for a single recipient.
    #[must_use]
    pub fn to(kind: impl Into<String>, target: T, payload: impl Into<Bytes>) -> Self {
        Self::new(kind, [target], payload)
    }

    /// The event type label.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Recipients, in the order they were given.
    #[must_use]
    pub fn targets(&self) -> &[T] {
        &self.targets
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
