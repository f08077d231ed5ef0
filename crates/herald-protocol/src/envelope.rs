//! JSON envelopes exchanged with HTTP clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;

/// Body of a publish request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Event type label.
    #[serde(rename = "type")]
    pub kind: String,
    /// Recipient identities.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Application payload, forwarded untouched.
    #[serde(default)]
    pub payload: Value,
}

impl PublishRequest {
    /// Serialize the payload to the bytes delivered to subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(&self.payload)?)
    }
}

/// One present member as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Entity id.
    pub id: String,
    /// Metadata supplied when the member joined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Full roster of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    /// Group name.
    pub group: String,
    /// Everyone currently present, in no particular order.
    pub members: Vec<Member>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_request_from_json() {
        let request: PublishRequest = serde_json::from_value(json!({
            "type": "ping",
            "targets": ["u1", "u2"],
            "payload": {"n": 1}
        }))
        .unwrap();

        assert_eq!(request.kind, "ping");
        assert_eq!(request.targets, ["u1", "u2"]);
        assert_eq!(request.payload_bytes().unwrap(), br#"{"n":1}"#);
    }

    #[test]
    fn test_publish_request_defaults() {
        let request: PublishRequest = serde_json::from_str(r#"{"type": "noop"}"#).unwrap();
        assert!(request.targets.is_empty());
        assert_eq!(request.payload_bytes().unwrap(), b"null");
    }

    #[test]
    fn test_roster_snapshot_json() {
        let snapshot = RosterSnapshot {
            group: "room1".to_string(),
            members: vec![
                Member {
                    id: "a".to_string(),
                    meta: Some(json!({"name": "Alice"})),
                },
                Member {
                    id: "b".to_string(),
                    meta: None,
                },
            ],
        };

        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({
                "group": "room1",
                "members": [{"id": "a", "meta": {"name": "Alice"}}, {"id": "b"}]
            })
        );
    }
}
