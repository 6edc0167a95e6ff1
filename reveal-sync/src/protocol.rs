//! JSON wire protocol between the coordinator and its clients.
//!
//! Every frame is a UTF-8 text frame carrying one tagged JSON object:
//! ```text
//! client → server   {"type":"register","clientId":"a","isReady":false}
//!                   {"type":"ready","clientId":"a","isReady":true}
//!
//! server → client   {"type":"full_state","state":{…}}
//!                   {"type":"partial_state","clientId":"a","isReady":true,…}
//!                   {"type":"start","targetTimestampUTC":"…","readyCount":2,…}
//!                   {"type":"image_updated"}
//!                   {"type":"error","error":"…"}
//! ```
//!
//! Inbound frames are decoded once at the boundary into [`ClientMessage`];
//! everything past the read loop matches on the closed variant set.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::OverallState;

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Binds the connection to a stable identity. Must come first.
    Register { client_id: String, is_ready: bool },
    /// Barrier vote for the current round.
    ///
    /// The identity bound at registration is authoritative; the optional
    /// `client_id` is informational.
    Ready {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        is_ready: bool,
    },
}

/// Loosely-typed shape used only to tell unknown types from malformed bodies.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "clientId")]
    client_id: Option<String>,
    #[serde(default, rename = "isReady")]
    is_ready: bool,
}

impl ClientMessage {
    pub fn register(client_id: impl Into<String>, is_ready: bool) -> Self {
        Self::Register {
            client_id: client_id.into(),
            is_ready,
        }
    }

    pub fn ready(client_id: impl Into<String>, is_ready: bool) -> Self {
        Self::Ready {
            client_id: Some(client_id.into()),
            is_ready,
        }
    }

    /// Decode a text frame.
    ///
    /// Unknown `type` values yield [`ProtocolError::UnknownType`] so the
    /// caller can ignore them instead of treating them as malformed.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.kind.as_str() {
            "register" => {
                let client_id = envelope
                    .client_id
                    .filter(|id| !id.is_empty())
                    .ok_or(ProtocolError::MissingClientId)?;
                Ok(Self::Register {
                    client_id,
                    is_ready: envelope.is_ready,
                })
            }
            "ready" => Ok(Self::Ready {
                client_id: envelope.client_id,
                is_ready: envelope.is_ready,
            }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Wire name of this message's type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Ready { .. } => "ready",
        }
    }
}

/// Full room snapshot carried by `full_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub ready_count: usize,
    pub total_count: usize,
    pub overall_state: OverallState,
    pub has_image: bool,
    /// RFC 3339 reveal instant, empty when no round is triggered.
    #[serde(rename = "targetTimeUTC")]
    pub target_time_utc: String,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent point-to-point after registration, broadcast after a reset.
    FullState { state: StateSnapshot },
    /// Broadcast after any registration, readiness change or eviction.
    PartialState {
        client_id: String,
        is_ready: bool,
        ready_count: usize,
        total_count: usize,
    },
    /// Broadcast once per round when the barrier is satisfied.
    Start {
        #[serde(rename = "targetTimestampUTC")]
        target_timestamp_utc: String,
        ready_count: usize,
        total_count: usize,
    },
    /// The shared content changed and should be fetched again.
    ImageUpdated,
    /// Protocol violation, sent right before the server closes.
    Error { error: String },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FullState { .. } => "full_state",
            Self::PartialState { .. } => "partial_state",
            Self::Start { .. } => "start",
            Self::ImageUpdated => "image_updated",
            Self::Error { .. } => "error",
        }
    }
}

/// Format an instant the way it travels on the wire (RFC 3339, nanoseconds, `Z`).
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a wire timestamp back into UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ProtocolError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ProtocolError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Register message without a client id")]
    MissingClientId,
    #[error("First message must be of type 'register', received '{0}'")]
    ExpectedRegister(String),
    #[error("Connection is registered as '{bound}', cannot register as '{requested}'")]
    Rebind { bound: String, requested: String },
    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_register() {
        let msg = ClientMessage::decode(r#"{"type":"register","clientId":"alice","isReady":true}"#)
            .unwrap();
        assert_eq!(msg, ClientMessage::register("alice", true));
    }

    #[test]
    fn test_decode_register_defaults_readiness() {
        let msg = ClientMessage::decode(r#"{"type":"register","clientId":"bob"}"#).unwrap();
        assert_eq!(msg, ClientMessage::register("bob", false));
    }

    #[test]
    fn test_decode_register_without_id() {
        let err = ClientMessage::decode(r#"{"type":"register","isReady":true}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingClientId));

        let err = ClientMessage::decode(r#"{"type":"register","clientId":""}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingClientId));
    }

    #[test]
    fn test_decode_ready_without_id() {
        let msg = ClientMessage::decode(r#"{"type":"ready","isReady":true}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Ready {
                client_id: None,
                is_ready: true
            }
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = ClientMessage::decode(r#"{"type":"dance","clientId":"a"}"#).unwrap_err();
        match err {
            ProtocolError::UnknownType(kind) => assert_eq!(kind, "dance"),
            other => panic!("Expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            ClientMessage::decode("not json").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
        // A missing type tag is malformed, not unknown.
        assert!(matches!(
            ClientMessage::decode(r#"{"clientId":"a"}"#).unwrap_err(),
            ProtocolError::Malformed(_)
        ));
        // Wrong field type.
        assert!(matches!(
            ClientMessage::decode(r#"{"type":"ready","isReady":"yes"}"#).unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }

    #[test]
    fn test_client_message_wire_names() {
        let text = ClientMessage::ready("alice", true).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "ready");
        assert_eq!(value["clientId"], "alice");
        assert_eq!(value["isReady"], true);
    }

    #[test]
    fn test_full_state_wire_shape() {
        let msg = ServerMessage::FullState {
            state: StateSnapshot {
                ready_count: 1,
                total_count: 2,
                overall_state: OverallState::WaitingForReady,
                has_image: true,
                target_time_utc: String::new(),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "full_state");
        assert_eq!(value["state"]["readyCount"], 1);
        assert_eq!(value["state"]["totalCount"], 2);
        assert_eq!(value["state"]["overallState"], "WaitingForReady");
        assert_eq!(value["state"]["hasImage"], true);
        assert_eq!(value["state"]["targetTimeUTC"], "");
    }

    #[test]
    fn test_partial_state_wire_shape() {
        let msg = ServerMessage::PartialState {
            client_id: "alice".into(),
            is_ready: false,
            ready_count: 0,
            total_count: 3,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "partial_state");
        assert_eq!(value["clientId"], "alice");
        assert_eq!(value["isReady"], false);
        assert_eq!(value["readyCount"], 0);
        assert_eq!(value["totalCount"], 3);
    }

    #[test]
    fn test_start_wire_shape() {
        let msg = ServerMessage::Start {
            target_timestamp_utc: "2026-01-01T00:00:03.000000000Z".into(),
            ready_count: 2,
            total_count: 2,
        };
        let text = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["targetTimestampUTC"], "2026-01-01T00:00:03.000000000Z");
        assert_eq!(ServerMessage::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_unit_variants_wire_shape() {
        assert_eq!(
            ServerMessage::ImageUpdated.encode().unwrap(),
            r#"{"type":"image_updated"}"#
        );
        let err = ServerMessage::Error {
            error: "nope".into(),
        };
        assert_eq!(err.encode().unwrap(), r#"{"type":"error","error":"nope"}"#);
    }

    #[test]
    fn test_timestamp_format_is_utc_nanos() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 5).unwrap();
        assert_eq!(format_timestamp(t), "2026-03-01T12:00:05.000000000Z");
        assert_eq!(parse_timestamp(&format_timestamp(t)).unwrap(), t);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        let err = parse_timestamp("tomorrow-ish").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTimestamp { .. }));
        assert!(err.to_string().contains("tomorrow-ish"));
    }

    #[test]
    fn test_parse_timestamp_normalizes_offset() {
        let parsed = parse_timestamp("2026-03-01T14:00:05+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 5).unwrap());
    }
}
