//! Gateway wire protocol: request and response envelopes and their JSON codec.
//!
//! Requests go client → gateway as `{ "id", "type", "payload": { key: string } }`.
//! Responses and pushes go gateway → client as `{ "requestId", "type", "payload", "error" }`;
//! a null `requestId` marks an unsolicited push.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Frame type for conversational content.
pub const CHAT: &str = "chat";
/// Frame type for control commands.
pub const COMMAND: &str = "command";
/// Frame type for starting push delivery on a topic.
pub const SUBSCRIBE: &str = "subscribe";
/// Frame type for stopping push delivery on a topic.
pub const UNSUBSCRIBE: &str = "unsubscribe";

/// Request payload: string keys to string values.
pub type Payload = BTreeMap<String, String>;

/// Wire request: `{ "id", "type", "payload" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub payload: Payload,
}

/// Wire response or push: `{ "requestId", "type", "payload", "error" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(rename = "type", default)]
    pub typ: String,
    /// String content; non-string JSON values sent by a gateway are kept as their JSON text.
    #[serde(default, deserialize_with = "payload_text")]
    pub payload: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One inbound text frame after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Response(ResponseFrame),
    /// Text that is not a response envelope; kept verbatim.
    Malformed(String),
}

fn payload_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, typ: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            typ: typ.into(),
            payload,
        }
    }

    /// JSON text for the wire. String-only fields always serialize.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ResponseFrame {
    pub fn ok(request_id: impl Into<String>, typ: impl Into<String>, payload: Option<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            typ: typ.into(),
            payload,
            error: None,
        }
    }

    pub fn err(request_id: impl Into<String>, typ: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            typ: typ.into(),
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn push(typ: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            request_id: None,
            typ: typ.into(),
            payload: Some(payload.into()),
            error: None,
        }
    }

    pub fn is_push(&self) -> bool {
        self.request_id.is_none()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a response envelope; anything else comes back as [`Decoded::Malformed`].
    pub fn decode(text: &str) -> Decoded {
        match serde_json::from_str::<ResponseFrame>(text) {
            Ok(frame) => Decoded::Response(frame),
            Err(e) => {
                log::debug!("undecodable inbound frame: {}", e);
                Decoded::Malformed(text.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_wire_shape() {
        let mut payload = Payload::new();
        payload.insert("message".into(), "hi".into());
        let frame = RequestFrame::new("abc", CHAT, payload);
        let value: serde_json::Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "id": "abc", "type": "chat", "payload": { "message": "hi" } })
        );
    }

    #[test]
    fn response_with_null_request_id_is_push() {
        let text = r#"{"requestId":null,"type":"event","payload":"update","error":null}"#;
        let Decoded::Response(frame) = ResponseFrame::decode(text) else {
            panic!("expected response");
        };
        assert!(frame.is_push());
        assert_eq!(frame.payload.as_deref(), Some("update"));
    }

    #[test]
    fn response_missing_fields_default() {
        let Decoded::Response(frame) = ResponseFrame::decode(r#"{"requestId":"7"}"#) else {
            panic!("expected response");
        };
        assert_eq!(frame.request_id.as_deref(), Some("7"));
        assert_eq!(frame.typ, "");
        assert_eq!(frame.payload, None);
        assert_eq!(frame.error, None);
    }

    #[test]
    fn structured_payload_kept_as_json_text() {
        let text = r#"{"requestId":"1","type":"message","payload":{"reply":"x"}}"#;
        let Decoded::Response(frame) = ResponseFrame::decode(text) else {
            panic!("expected response");
        };
        assert_eq!(frame.payload.as_deref(), Some(r#"{"reply":"x"}"#));
    }

    #[test]
    fn non_envelope_text_is_malformed() {
        assert_eq!(
            ResponseFrame::decode("not json"),
            Decoded::Malformed("not json".to_string())
        );
        assert_eq!(
            ResponseFrame::decode("[1,2]"),
            Decoded::Malformed("[1,2]".to_string())
        );
    }

    #[test]
    fn response_serializes_nulls() {
        let value: serde_json::Value =
            serde_json::from_str(&ResponseFrame::push("event", "update").encode()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "requestId": null, "type": "event", "payload": "update", "error": null })
        );
    }
}
