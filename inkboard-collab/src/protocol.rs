//! JSON wire protocol: one event object per websocket text frame.
//!
//! Inbound frames are decoded into [`ClientEvent`] at the boundary; anything
//! that is not a complete, known event is rejected there and never reaches
//! the dispatcher.
//!
//! ```text
//! inbound   {"type":"join-room"|"leave-room"|"chat"|"shape:create"|"shape:update", "roomId":..., ...}
//! outbound  {"type":"user_joined"|"user_left"|"chat"|"shape:create"|"shape:update"|"error", ...}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::auth::Identity;
use crate::shape::{ShapeDraft, ShapeFields, ShapeId, ShapePatch};
use crate::storage::ShapeRecord;

/// Event kinds a client may send.
pub const CLIENT_EVENT_TYPES: &[&str] = &[
    "join-room",
    "leave-room",
    "chat",
    "shape:create",
    "shape:update",
];

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Not JSON, or missing/invalid fields for its kind
    #[error("Invalid message format: {0}")]
    Malformed(String),
    /// Well-formed frame with a `type` the server does not handle
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Accept identifiers sent either as JSON strings or integers.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
    }

    let id = match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
    };
    if id.trim().is_empty() {
        return Err(serde::de::Error::custom("identifier must not be empty"));
    }
    Ok(id)
}

fn non_empty_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    if text.trim().is_empty() {
        return Err(serde::de::Error::custom("message must not be empty"));
    }
    Ok(text)
}

/// A decoded, validated inbound event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom {
        #[serde(deserialize_with = "string_or_number")]
        room_id: String,
    },
    #[serde(rename = "leave-room", rename_all = "camelCase")]
    LeaveRoom {
        #[serde(deserialize_with = "string_or_number")]
        room_id: String,
    },
    #[serde(rename = "chat", rename_all = "camelCase")]
    Chat {
        #[serde(deserialize_with = "string_or_number")]
        room_id: String,
        #[serde(deserialize_with = "non_empty_text")]
        message: String,
    },
    #[serde(rename = "shape:create", rename_all = "camelCase")]
    ShapeCreate {
        #[serde(deserialize_with = "string_or_number")]
        room_id: String,
        shape: ShapeDraft,
    },
    #[serde(rename = "shape:update", rename_all = "camelCase")]
    ShapeUpdate {
        #[serde(deserialize_with = "string_or_number")]
        room_id: String,
        shape: ShapePatch,
    },
}

impl ClientEvent {
    /// Decode one text frame.
    ///
    /// Unknown kinds are reported separately from malformed frames so the
    /// sender gets an accurate error.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing event type".to_string()))?;
        if !CLIENT_EVENT_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownEvent(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Room the event targets.
    pub fn room_id(&self) -> &str {
        match self {
            Self::JoinRoom { room_id }
            | Self::LeaveRoom { room_id }
            | Self::Chat { room_id, .. }
            | Self::ShapeCreate { room_id, .. }
            | Self::ShapeUpdate { room_id, .. } => room_id,
        }
    }
}

/// Canonical shape as broadcast to room members.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapeView {
    pub id: ShapeId,
    #[serde(flatten)]
    pub fields: ShapeFields,
}

impl From<ShapeRecord> for ShapeView {
    fn from(record: ShapeRecord) -> Self {
        Self {
            id: record.id,
            fields: record.fields,
        }
    }
}

/// Outbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "user_joined", rename_all = "camelCase")]
    UserJoined {
        room_id: String,
        user_id: String,
        username: String,
    },
    #[serde(rename = "user_left", rename_all = "camelCase")]
    UserLeft {
        room_id: String,
        user_id: String,
        username: String,
    },
    #[serde(rename = "chat", rename_all = "camelCase")]
    Chat {
        message: String,
        room_id: String,
        user_id: String,
        username: String,
    },
    #[serde(rename = "shape:create", rename_all = "camelCase")]
    ShapeCreated {
        shape: ShapeView,
        room_id: String,
        user_id: String,
        username: String,
    },
    #[serde(rename = "shape:update", rename_all = "camelCase")]
    ShapeUpdated {
        shape: ShapeView,
        room_id: String,
        user_id: String,
        username: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn user_joined(room_id: &str, who: &Identity) -> Self {
        Self::UserJoined {
            room_id: room_id.to_string(),
            user_id: who.user_id.clone(),
            username: who.display_name.clone(),
        }
    }

    pub fn user_left(room_id: &str, who: &Identity) -> Self {
        Self::UserLeft {
            room_id: room_id.to_string(),
            user_id: who.user_id.clone(),
            username: who.display_name.clone(),
        }
    }

    pub fn chat(room_id: &str, who: &Identity, message: &str) -> Self {
        Self::Chat {
            message: message.to_string(),
            room_id: room_id.to_string(),
            user_id: who.user_id.clone(),
            username: who.display_name.clone(),
        }
    }

    pub fn shape_created(room_id: &str, who: &Identity, record: ShapeRecord) -> Self {
        Self::ShapeCreated {
            shape: record.into(),
            room_id: room_id.to_string(),
            user_id: who.user_id.clone(),
            username: who.display_name.clone(),
        }
    }

    pub fn shape_updated(room_id: &str, who: &Identity, record: ShapeRecord) -> Self {
        Self::ShapeUpdated {
            shape: record.into(),
            room_id: room_id.to_string(),
            user_id: who.user_id.clone(),
            username: who.display_name.clone(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Point;

    fn alice() -> Identity {
        Identity {
            user_id: "u-1".into(),
            display_name: "Alice".into(),
        }
    }

    #[test]
    fn test_decode_join_room() {
        let event = ClientEvent::decode(r#"{"type":"join-room","roomId":"r1"}"#).unwrap();
        assert_eq!(event, ClientEvent::JoinRoom { room_id: "r1".into() });
    }

    #[test]
    fn test_decode_numeric_room_id() {
        let event = ClientEvent::decode(r#"{"type":"leave-room","roomId":42}"#).unwrap();
        assert_eq!(event.room_id(), "42");
    }

    #[test]
    fn test_decode_chat() {
        let event = ClientEvent::decode(r#"{"type":"chat","roomId":"r1","message":"hi"}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::Chat {
                room_id: "r1".into(),
                message: "hi".into(),
            }
        );
    }

    #[test]
    fn test_decode_shape_create() {
        let frame = r#"{"type":"shape:create","roomId":"r1",
            "shape":{"id":"local-1","type":"pencil","points":[{"x":0,"y":0},{"x":3,"y":4}]}}"#;
        match ClientEvent::decode(frame).unwrap() {
            ClientEvent::ShapeCreate { room_id, shape } => {
                assert_eq!(room_id, "r1");
                assert_eq!(shape.kind, "pencil");
                assert_eq!(shape.points.unwrap()[1], Point { x: 3.0, y: 4.0 });
            }
            other => panic!("Expected ShapeCreate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_shape_update() {
        let frame = r#"{"type":"shape:update","roomId":"r1","shape":{"id":7,"width":20}}"#;
        match ClientEvent::decode(frame).unwrap() {
            ClientEvent::ShapeUpdate { shape, .. } => {
                assert_eq!(shape.id, 7);
                assert_eq!(shape.width, Some(20.0));
                assert_eq!(shape.height, None);
            }
            other => panic!("Expected ShapeUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_not_json() {
        let err = ClientEvent::decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(err.to_string().starts_with("Invalid message format"));
    }

    #[test]
    fn test_decode_missing_type() {
        let err = ClientEvent::decode(r#"{"roomId":"r1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = ClientEvent::decode(r#"{"type":"cursor","roomId":"r1"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownEvent("cursor".into()));
    }

    #[test]
    fn test_decode_missing_required_fields() {
        for frame in [
            r#"{"type":"join-room"}"#,
            r#"{"type":"chat","roomId":"r1"}"#,
            r#"{"type":"chat","roomId":"r1","message":"   "}"#,
            r#"{"type":"chat","roomId":"","message":"hi"}"#,
            r#"{"type":"shape:create","roomId":"r1"}"#,
            r#"{"type":"shape:update","roomId":"r1","shape":{"width":3}}"#,
        ] {
            let err = ClientEvent::decode(frame).unwrap_err();
            assert!(
                matches!(err, ProtocolError::Malformed(_)),
                "{frame} should be malformed, got {err:?}"
            );
        }
    }

    #[test]
    fn test_encode_chat() {
        let json: Value =
            serde_json::from_str(&ServerEvent::chat("r1", &alice(), "hi").encode().unwrap()).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["message"], "hi");
        assert_eq!(json["roomId"], "r1");
        assert_eq!(json["userId"], "u-1");
        assert_eq!(json["username"], "Alice");
    }

    #[test]
    fn test_encode_shape_created_flattens_fields() {
        let record = ShapeRecord {
            id: 31,
            room_id: "r1".into(),
            user_id: "u-1".into(),
            fields: ShapeFields::new("rect"),
        };
        let event = ServerEvent::shape_created("r1", &alice(), record);
        let json: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "shape:create");
        assert_eq!(json["shape"]["id"], 31);
        assert_eq!(json["shape"]["type"], "rect");
        assert_eq!(json["shape"]["strokeColor"], "black");
    }

    #[test]
    fn test_encode_membership_and_error() {
        let joined: Value =
            serde_json::from_str(&ServerEvent::user_joined("r9", &alice()).encode().unwrap()).unwrap();
        assert_eq!(joined["type"], "user_joined");
        assert_eq!(joined["roomId"], "r9");

        let left: Value =
            serde_json::from_str(&ServerEvent::user_left("r9", &alice()).encode().unwrap()).unwrap();
        assert_eq!(left["type"], "user_left");

        let err: Value =
            serde_json::from_str(&ServerEvent::error("boom").encode().unwrap()).unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["message"], "boom");
    }
}
