//! # herald-protocol
//!
//! Wire formats for the Herald push server.
//!
//! Events and presence rosters reach clients as a `text/event-stream`:
//! a sequence of frames made of `field: value` lines and a blank-line
//! terminator. Publish requests and roster snapshots are JSON.
//!
//! ## Frame Types
//!
//! - `Message` - `id`, optional `event`, and a data block
//! - `Comment` - keep-alive and other ignored text
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, Frame};
//!
//! let frame = Frame::message("ping", r#"{"hello":"world"}"#);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(&encoded[..], b"id: ping\ndata: {\"hello\":\"world\"}\n\n");
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;

pub use codec::{decode, decode_from, encode, ProtocolError};
pub use envelope::{Member, PublishRequest, RosterSnapshot};
pub use frames::{Frame, KEEP_ALIVE, PRESENCE_ID, SUPERSEDED_ID};
