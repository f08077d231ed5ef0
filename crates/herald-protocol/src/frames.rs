//! Frame types for the Herald event stream.
//!
//! A stream is a sequence of frames, each terminated by a blank line.
//! Messages carry an optional `id`, an optional `event` name and a data
//! block; comments carry free text and are used as keep-alives.

use serde::Serialize;

use crate::codec::ProtocolError;

/// Frame id used for presence roster snapshots.
pub const PRESENCE_ID: &str = "presence";

/// Frame id sent to a presence stream that was replaced by a newer session.
pub const SUPERSEDED_ID: &str = "superseded";

/// Comment text used for keep-alive frames.
pub const KEEP_ALIVE: &str = "keep-alive";

/// A single event-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A message delivered to the client.
    Message {
        /// Value of the `id` field.
        id: Option<String>,
        /// Value of the `event` field.
        event: Option<String>,
        /// Data block. Multi-line data spans several `data` fields.
        data: String,
    },

    /// A comment line, ignored by clients.
    Comment(String),
}

impl Frame {
    /// Create a message with an id and a data block.
    #[must_use]
    pub fn message(id: impl Into<String>, data: impl Into<String>) -> Self {
        Frame::Message {
            id: Some(id.into()),
            event: None,
            data: data.into(),
        }
    }

    /// Create a message whose data is `value` serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(
        id: impl Into<String>,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::message(id, serde_json::to_string(value)?))
    }

    /// Create a comment frame.
    #[must_use]
    pub fn comment(text: impl Into<String>) -> Self {
        Frame::Comment(text.into())
    }

    /// Create a keep-alive comment.
    #[must_use]
    pub fn keep_alive() -> Self {
        Self::comment(KEEP_ALIVE)
    }

    /// Get the `id` field, if this is a message that has one.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Frame::Message { id, .. } => id.as_deref(),
            Frame::Comment(_) => None,
        }
    }

    /// Get the data block, if this is a message.
    #[must_use]
    pub fn data(&self) -> Option<&str> {
        match self {
            Frame::Message { data, .. } => Some(data),
            Frame::Comment(_) => None,
        }
    }

    /// Check if this is a comment frame.
    #[must_use]
    pub fn is_comment(&self) -> bool {
        matches!(self, Frame::Comment(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_helpers() {
        let frame = Frame::message("ping", "{}");
        assert_eq!(frame.id(), Some("ping"));
        assert_eq!(frame.data(), Some("{}"));
        assert!(!frame.is_comment());

        match frame {
            Frame::Message { event, .. } => assert!(event.is_none()),
            Frame::Comment(_) => panic!("Expected message"),
        }
    }

    #[test]
    fn test_json_frame() {
        let frame = Frame::json(PRESENCE_ID, &json!({"group": "room1"})).unwrap();
        assert_eq!(frame.id(), Some("presence"));
        assert_eq!(frame.data(), Some(r#"{"group":"room1"}"#));
    }

    #[test]
    fn test_keep_alive() {
        let frame = Frame::keep_alive();
        assert!(frame.is_comment());
        assert_eq!(frame, Frame::Comment("keep-alive".to_string()));
        assert_eq!(frame.id(), None);
    }
}
