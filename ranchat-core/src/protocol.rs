//! Control-channel wire format.
//!
//! Every frame is a JSON object discriminated by its `type` field. Relay
//! payloads (`signal.data`) carry their own inner `type` (or `kind`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no type field")]
    MissingType,
    #[error("malformed '{kind}' message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Filters sent with `enqueue`. Serialized flat into the message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFilters {
    pub country: String,
    pub gender: String,
    pub platform: String,
}

impl MatchFilters {
    pub fn new(
        country: impl Into<String>,
        gender: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            country: country.into(),
            gender: gender.into(),
            platform: platform.into(),
        }
    }
}

/// Client to server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        token: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Enqueue(MatchFilters),
    Dequeue,
    Signal {
        #[serde(rename = "roomId")]
        room_id: String,
        data: Value,
    },
    Leave {
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::Enqueue(_) => "enqueue",
            ClientMessage::Dequeue => "dequeue",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::Leave { .. } => "leave",
        }
    }
}

/// Server to client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Hello,
    Registered { session_id: Option<String> },
    Enqueued,
    Dequeued,
    Matched { room_id: String, initiator: bool },
    Signal { room_id: String, data: Value },
    PeerLeft,
    Left,
    LeftOk,
    Error { reason: String },
    /// A well-formed frame with a `type` we don't know.
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct RegisteredBody {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct MatchedBody {
    #[serde(rename = "roomId")]
    room_id: String,
    #[serde(default)]
    initiator: bool,
}

#[derive(Deserialize)]
struct SignalBody {
    #[serde(rename = "roomId", default)]
    room_id: String,
    #[serde(default)]
    data: Value,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .as_object()
            .ok_or(ProtocolError::NotAnObject)?
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        let malformed = |source| ProtocolError::Malformed {
            kind: kind.clone(),
            source,
        };

        let message = match kind.as_str() {
            "hello" => ServerMessage::Hello,
            "registered" => {
                let body: RegisteredBody =
                    serde_json::from_value(value.clone()).map_err(malformed)?;
                ServerMessage::Registered {
                    session_id: body.session_id,
                }
            }
            "enqueued" => ServerMessage::Enqueued,
            "dequeued" => ServerMessage::Dequeued,
            "matched" => {
                let body: MatchedBody = serde_json::from_value(value.clone()).map_err(malformed)?;
                ServerMessage::Matched {
                    room_id: body.room_id,
                    initiator: body.initiator,
                }
            }
            "signal" => {
                let body: SignalBody = serde_json::from_value(value.clone()).map_err(malformed)?;
                ServerMessage::Signal {
                    room_id: body.room_id,
                    data: body.data,
                }
            }
            "peer_left" => ServerMessage::PeerLeft,
            "left" => ServerMessage::Left,
            "left_ok" => ServerMessage::LeftOk,
            "error" => {
                let reason = ["message", "reason"]
                    .iter()
                    .filter_map(|key| value.get(*key).and_then(Value::as_str))
                    .find(|s| !s.is_empty())
                    .unwrap_or("UNKNOWN_ERROR")
                    .to_string();
                ServerMessage::Error { reason }
            }
            _ => ServerMessage::Unknown { kind: kind.clone() },
        };
        Ok(message)
    }
}

/// An SDP offer or answer as relayed between peers: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate in its JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Self-description exchanged right after a match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub flag: String,
    #[serde(default)]
    pub nonce: String,
}

/// Typed view of a relay payload (`signal.data`).
#[derive(Debug, Clone, PartialEq)]
pub enum RelayPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidate),
    End,
    CameraState { enabled: bool },
    PeerMetadata(PeerMetadata),
    /// Anything we don't classify, passed through untouched.
    Other(Value),
}

const CAMERA_FLAG_KEYS: [&str; 5] = ["enabled", "on", "camOn", "videoEnabled", "videoOn"];

impl RelayPayload {
    /// Classifies a relay payload by its inner `type` (or `kind`), case-insensitively.
    pub fn from_value(data: Value) -> Result<Self, ProtocolError> {
        let kind = ["type", "kind"]
            .iter()
            .filter_map(|key| data.get(*key).and_then(Value::as_str))
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        let malformed = |source| ProtocolError::Malformed {
            kind: kind.clone(),
            source,
        };

        let payload = match kind.as_str() {
            "offer" => RelayPayload::Offer(SessionDescription::offer(
                extract_sdp(&data).ok_or_else(|| malformed(missing_field("sdp")))?,
            )),
            "answer" => RelayPayload::Answer(SessionDescription::answer(
                extract_sdp(&data).ok_or_else(|| malformed(missing_field("sdp")))?,
            )),
            "ice" => {
                let inner = match data.get("candidate") {
                    Some(candidate @ Value::Object(_)) => candidate.clone(),
                    _ => data.clone(),
                };
                RelayPayload::Ice(serde_json::from_value(inner).map_err(malformed)?)
            }
            "end" | "leave" => RelayPayload::End,
            "cam_state" | "cam" => {
                let enabled = CAMERA_FLAG_KEYS
                    .iter()
                    .filter_map(|key| data.get(*key))
                    .find(|v| !v.is_null())
                    .is_some_and(truthy);
                RelayPayload::CameraState { enabled }
            }
            "peer_info" => {
                RelayPayload::PeerMetadata(serde_json::from_value(data).map_err(malformed)?)
            }
            _ => RelayPayload::Other(data),
        };
        Ok(payload)
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        match self {
            RelayPayload::Offer(desc) | RelayPayload::Answer(desc) => {
                return serde_json::to_value(desc).unwrap_or(Value::Null);
            }
            RelayPayload::Ice(candidate) => {
                map.insert("type".into(), "ice".into());
                map.insert(
                    "candidate".into(),
                    serde_json::to_value(candidate).unwrap_or(Value::Null),
                );
            }
            RelayPayload::End => {
                map.insert("type".into(), "end".into());
            }
            RelayPayload::CameraState { enabled } => {
                map.insert("type".into(), "cam_state".into());
                map.insert("enabled".into(), Value::Bool(*enabled));
            }
            RelayPayload::PeerMetadata(metadata) => {
                if let Ok(Value::Object(fields)) = serde_json::to_value(metadata) {
                    map = fields;
                }
                map.insert("type".into(), "peer_info".into());
            }
            RelayPayload::Other(value) => return value.clone(),
        }
        Value::Object(map)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayPayload::Offer(_) => "offer",
            RelayPayload::Answer(_) => "answer",
            RelayPayload::Ice(_) => "ice",
            RelayPayload::End => "end",
            RelayPayload::CameraState { .. } => "cam_state",
            RelayPayload::PeerMetadata(_) => "peer_info",
            RelayPayload::Other(_) => "other",
        }
    }
}

/// `sdp` may be the SDP text or a nested `{type, sdp}` description.
fn extract_sdp(data: &Value) -> Option<String> {
    match data.get("sdp")? {
        Value::String(sdp) => Some(sdp.clone()),
        nested @ Value::Object(_) => nested.get("sdp")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn missing_field(field: &'static str) -> serde_json::Error {
    <serde_json::Error as serde::de::Error>::missing_field(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_serializes_with_session_id() {
        let msg = ClientMessage::Register {
            token: "tok".into(),
            session_id: "user-1".into(),
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "register", "token": "tok", "sessionId": "user-1"})
        );
    }

    #[test]
    fn enqueue_flattens_filters() {
        let msg = ClientMessage::Enqueue(MatchFilters::new("KR", "male", "linux"));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "enqueue", "country": "KR", "gender": "male", "platform": "linux"})
        );
    }

    #[test]
    fn leave_omits_missing_room() {
        let value: Value =
            serde_json::from_str(&ClientMessage::Leave { room_id: None }.to_json().unwrap())
                .unwrap();
        assert_eq!(value, json!({"type": "leave"}));

        let value: Value = serde_json::from_str(&ClientMessage::Dequeue.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "dequeue"}));
    }

    #[test]
    fn parses_matched_and_defaults_initiator() {
        let msg = ServerMessage::parse(r#"{"type":"matched","roomId":"r1","initiator":true}"#)
            .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Matched {
                room_id: "r1".into(),
                initiator: true
            }
        );

        let msg = ServerMessage::parse(r#"{"type":"matched","roomId":"r2"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Matched {
                room_id: "r2".into(),
                initiator: false
            }
        );
    }

    #[test]
    fn error_prefers_message_then_reason() {
        let msg = ServerMessage::parse(r#"{"type":"error","reason":"RATE_LIMIT"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Error {
                reason: "RATE_LIMIT".into()
            }
        );
        let msg = ServerMessage::parse(r#"{"type":"error"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Error {
                reason: "UNKNOWN_ERROR".into()
            }
        );
    }

    #[test]
    fn unknown_and_malformed_frames() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"surprise"}"#).unwrap(),
            ServerMessage::Unknown {
                kind: "surprise".into()
            }
        );
        assert!(matches!(
            ServerMessage::parse("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            ServerMessage::parse(r#"{"roomId":"r1"}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"matched"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn relay_kind_is_case_insensitive_and_accepts_kind_field() {
        let payload = RelayPayload::from_value(json!({"kind": "OFFER", "sdp": "v=0"})).unwrap();
        assert_eq!(payload, RelayPayload::Offer(SessionDescription::offer("v=0")));
    }

    #[test]
    fn ice_candidate_nested_or_flat() {
        let nested = RelayPayload::from_value(json!({
            "type": "ice",
            "candidate": {"candidate": "candidate:1 1 udp 1 1.2.3.4 5 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .unwrap();
        let flat = RelayPayload::from_value(json!({
            "type": "ice",
            "candidate": "candidate:1 1 udp 1 1.2.3.4 5 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();
        assert_eq!(nested, flat);
        match nested {
            RelayPayload::Ice(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn camera_state_accepts_alternate_flags() {
        for data in [
            json!({"type": "cam_state", "enabled": true}),
            json!({"type": "cam_state", "camOn": 1}),
            json!({"type": "cam", "videoOn": true}),
        ] {
            assert_eq!(
                RelayPayload::from_value(data).unwrap(),
                RelayPayload::CameraState { enabled: true }
            );
        }
        assert_eq!(
            RelayPayload::from_value(json!({"type": "cam_state", "on": false})).unwrap(),
            RelayPayload::CameraState { enabled: false }
        );
    }

    #[test]
    fn leave_maps_to_end_and_unknown_passes_through() {
        assert_eq!(
            RelayPayload::from_value(json!({"type": "leave"})).unwrap(),
            RelayPayload::End
        );
        let data = json!({"type": "sticker", "id": 7});
        assert_eq!(
            RelayPayload::from_value(data.clone()).unwrap(),
            RelayPayload::Other(data)
        );
    }

    #[test]
    fn peer_metadata_keeps_nonce_on_the_wire() {
        let metadata = PeerMetadata {
            country: "KR".into(),
            language: "ko".into(),
            gender: "female".into(),
            flag: "🇰🇷".into(),
            nonce: "abc".into(),
        };
        let value = RelayPayload::PeerMetadata(metadata.clone()).to_value();
        assert_eq!(value["type"], "peer_info");
        assert_eq!(value["nonce"], "abc");
        assert_eq!(
            RelayPayload::from_value(value).unwrap(),
            RelayPayload::PeerMetadata(metadata)
        );
    }

    #[test]
    fn offer_relays_as_description() {
        let value = RelayPayload::Offer(SessionDescription::offer("v=0\r\n")).to_value();
        assert_eq!(value, json!({"type": "offer", "sdp": "v=0\r\n"}));
    }
}
