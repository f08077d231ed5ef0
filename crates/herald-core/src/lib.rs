//! # herald-core
//!
//! Event routing and presence tracking for the Herald push server.
//!
//! This crate provides two independent building blocks:
//!
//! - **Broker** - fans targeted events out to live connections
//! - **Hub** - tracks who is present in a group and broadcasts rosters
//! - **Event** - the application message the broker routes
//!
//! ## Architecture
//!
//! ```text
//!  add/remove ──┐                         ┌──▶ Outbox (per connection)
//!  publish ─────┼──▶ BrokerWorker (index) ─┤
//!               │                         └──▶ Outbox
//!
//!  join/leave ──────▶ HubWorker (rosters) ────▶ RosterFeed (per member)
//! ```
//!
//! Each worker is a single task that owns its maps and handles one request
//! at a time, so no locks guard the state.
//!
//! ## Example
//!
//! ```rust
//! use herald_core::{Broker, BrokerConfig, Event};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), herald_core::BrokerError> {
//! let (broker, _worker) = Broker::spawn(BrokerConfig::default());
//!
//! let (connection, mut outbox) = broker.connection("user-1".to_string());
//! broker.add_client(connection).await?;
//!
//! broker
//!     .publish(Event::to("ping", "user-1".to_string(), b"{}".to_vec()))
//!     .await?;
//! assert_eq!(outbox.recv().await.unwrap().kind(), "ping");
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod event;
pub mod presence;
mod request;

pub use broker::{
    Broker, BrokerConfig, BrokerError, BrokerStats, BrokerWorker, Connection, ConnectionId, Outbox,
};
pub use event::{Event, Identity};
pub use presence::{
    Entity, Hub, HubConfig, HubError, HubStats, HubWorker, Presence, PresenceKey, RegistrationId,
    Roster, RosterFeed,
};
