//! # Session Protocol Messages
//!
//! Defines the session message envelope and its typed payloads, exchanged
//! with the broker as JSON text frames. Field names **must stay in sync**
//! with the broker's message schema — any change here must be mirrored
//! there and stay backward-compatible.
//!
//! Decoding is two-phase: the envelope is parsed first with the payload
//! kept as a raw JSON slice, then the `messageType` tag selects the
//! concrete payload type to parse the slice into.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::error::SessionError;

// ─── Payload Types ──────────────────────────────────────────────

/// Opens a port-forward session to a pod port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortForwardInitData {
    pub namespace: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    pub port: u16,
}

/// Opens an exec session inside a pod container. The port-forward client
/// never sends this, but the broker schema includes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodExecInitData {
    pub namespace: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "containerName")]
    pub container_name: String,
    pub cmd: String,
}

/// Client→broker data chunk, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdinData {
    pub input: String,
}

/// Broker→client data chunk, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdoutData {
    pub out: String,
}

/// Announces the end of a session, with exit metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationData {
    #[serde(rename = "processExitCode")]
    pub process_exit_code: i32,
    #[serde(rename = "exitMessage")]
    pub exit_message: String,
}

/// Remote terminal dimensions. Only meaningful for exec sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSizeData {
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KeepAliveData {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PingData {}

/// Acknowledges receipt of a previously sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckData {
    #[serde(rename = "ackedMessageID")]
    pub acked_message_id: String,
}

/// Reports a failure related to a previously received message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(rename = "originalMessageID")]
    pub original_message_id: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
}

/// Payload of a session message; the variant determines the wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PortForwardInit(PortForwardInitData),
    PodExecInit(PodExecInitData),
    Stdin(StdinData),
    Stdout(StdoutData),
    Termination(TerminationData),
    TerminalSize(TerminalSizeData),
    KeepAlive(KeepAliveData),
    Ack(AckData),
    Ping(PingData),
    Error(ErrorData),
}

impl Payload {
    /// The `messageType` tag this payload is carried under.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::PortForwardInit(_) => "port_forward_init",
            Payload::PodExecInit(_) => "pod_exec_init",
            Payload::Stdin(_) => "stdin",
            Payload::Stdout(_) => "stdout",
            Payload::Termination(_) => "termination",
            Payload::TerminalSize(_) => "terminal-size",
            Payload::KeepAlive(_) => "keep-alive",
            Payload::Ack(_) => "ack",
            Payload::Ping(_) => "ping",
            Payload::Error(_) => "error",
        }
    }
}

// ─── Envelope ───────────────────────────────────────────────────

/// One session message: the wire unit of the protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    /// Unique per sender; referenced by acks and error replies.
    pub message_id: String,
    /// Assigned by the broker in the init-ack; empty until then.
    pub session_id: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

/// Raw wire shape of [`SessionMessage`]; `data` stays undecoded until the
/// tag is known.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "messageId")]
    message_id: String,
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "messageType")]
    message_type: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
    timestamp: DateTime<Utc>,
}

impl SessionMessage {
    /// Builds a message with a fresh uuid identifier and current timestamp.
    pub fn new(session_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Serializes the message to its JSON wire form.
    pub fn encode(&self) -> Result<String, SessionError> {
        let data = match &self.payload {
            Payload::PortForwardInit(d) => serde_json::value::to_raw_value(d),
            Payload::PodExecInit(d) => serde_json::value::to_raw_value(d),
            Payload::Stdin(d) => serde_json::value::to_raw_value(d),
            Payload::Stdout(d) => serde_json::value::to_raw_value(d),
            Payload::Termination(d) => serde_json::value::to_raw_value(d),
            Payload::TerminalSize(d) => serde_json::value::to_raw_value(d),
            Payload::KeepAlive(d) => serde_json::value::to_raw_value(d),
            Payload::Ack(d) => serde_json::value::to_raw_value(d),
            Payload::Ping(d) => serde_json::value::to_raw_value(d),
            Payload::Error(d) => serde_json::value::to_raw_value(d),
        }
        .map_err(|e| {
            SessionError::Protocol(format!("failed to encode {} payload: {e}", self.payload.tag()))
        })?;

        let envelope = WireEnvelope {
            message_id: self.message_id.clone(),
            session_id: self.session_id.clone(),
            message_type: self.payload.tag().to_string(),
            data: Some(data),
            timestamp: self.timestamp,
        };
        serde_json::to_string(&envelope)
            .map_err(|e| SessionError::Protocol(format!("failed to encode message: {e}")))
    }

    /// Parses a message from its JSON wire form.
    ///
    /// Unsupported `messageType` tags fail with a protocol error. A missing
    /// or null `data` field is tolerated for payloads without required
    /// fields (keep-alive, ping).
    pub fn decode(raw: &str) -> Result<Self, SessionError> {
        let envelope: WireEnvelope = serde_json::from_str(raw)
            .map_err(|e| SessionError::Protocol(format!("malformed session message: {e}")))?;

        let data = match envelope.data.as_deref().map(RawValue::get) {
            None | Some("null") => "{}",
            Some(d) => d,
        };

        let tag = envelope.message_type.as_str();
        let payload = match tag {
            "port_forward_init" => Payload::PortForwardInit(decode_data(data, tag)?),
            "pod_exec_init" => Payload::PodExecInit(decode_data(data, tag)?),
            "stdin" => Payload::Stdin(decode_data(data, tag)?),
            "stdout" => Payload::Stdout(decode_data(data, tag)?),
            "termination" => Payload::Termination(decode_data(data, tag)?),
            "terminal-size" => Payload::TerminalSize(decode_data(data, tag)?),
            "keep-alive" => Payload::KeepAlive(decode_data(data, tag)?),
            "ack" => Payload::Ack(decode_data(data, tag)?),
            "ping" => Payload::Ping(decode_data(data, tag)?),
            "error" => Payload::Error(decode_data(data, tag)?),
            other => {
                return Err(SessionError::Protocol(format!(
                    "unsupported message type {other}"
                )))
            }
        };

        Ok(Self {
            message_id: envelope.message_id,
            session_id: envelope.session_id,
            payload,
            timestamp: envelope.timestamp,
        })
    }
}

fn decode_data<T: DeserializeOwned>(raw: &str, tag: &str) -> Result<T, SessionError> {
    serde_json::from_str(raw)
        .map_err(|e| SessionError::Protocol(format!("bad {tag} payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn round_trips_every_payload_variant() {
        let payloads = vec![
            Payload::PortForwardInit(PortForwardInitData {
                namespace: "default".into(),
                pod_name: "api".into(),
                port: 8080,
            }),
            Payload::PodExecInit(PodExecInitData {
                namespace: "default".into(),
                pod_name: "api".into(),
                container_name: "main".into(),
                cmd: "sh".into(),
            }),
            Payload::Stdin(StdinData {
                input: "3q2+7w==".into(),
            }),
            Payload::Stdout(StdoutData {
                out: "aGVsbG8=".into(),
            }),
            Payload::Termination(TerminationData {
                process_exit_code: 0,
                exit_message: "done".into(),
            }),
            Payload::TerminalSize(TerminalSizeData {
                width: 80,
                height: 24,
            }),
            Payload::KeepAlive(KeepAliveData {}),
            Payload::Ack(AckData {
                acked_message_id: "m-1".into(),
            }),
            Payload::Ping(PingData {}),
            Payload::Error(ErrorData {
                original_message_id: "m-1".into(),
                error_message: "boom".into(),
            }),
        ];

        for payload in payloads {
            let msg = SessionMessage {
                message_id: "m-42".into(),
                session_id: "s-1".into(),
                payload,
                timestamp: fixed_time(),
            };
            let decoded = SessionMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn encodes_the_exact_wire_layout() {
        let msg = SessionMessage {
            message_id: "m-1".into(),
            session_id: "s-1".into(),
            payload: Payload::Stdin(StdinData {
                input: "3q2+7w==".into(),
            }),
            timestamp: fixed_time(),
        };
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"messageId":"m-1","sessionId":"s-1","messageType":"stdin","data":{"input":"3q2+7w=="},"timestamp":"2023-11-14T22:13:20Z"}"#
        );
    }

    #[test]
    fn preserves_broker_field_names() {
        let ack = SessionMessage {
            message_id: "m-2".into(),
            session_id: "s-1".into(),
            payload: Payload::Ack(AckData {
                acked_message_id: "m-1".into(),
            }),
            timestamp: fixed_time(),
        };
        assert!(ack.encode().unwrap().contains(r#""ackedMessageID":"m-1""#));

        let err = SessionMessage {
            message_id: "m-3".into(),
            session_id: "s-1".into(),
            payload: Payload::Error(ErrorData {
                original_message_id: "m-1".into(),
                error_message: "bad".into(),
            }),
            timestamp: fixed_time(),
        };
        let encoded = err.encode().unwrap();
        assert!(encoded.contains(r#""originalMessageID":"m-1""#));
        assert!(encoded.contains(r#""errorMessage":"bad""#));

        let init = SessionMessage {
            message_id: "m-4".into(),
            session_id: String::new(),
            payload: Payload::PortForwardInit(PortForwardInitData {
                namespace: "default".into(),
                pod_name: "api".into(),
                port: 8080,
            }),
            timestamp: fixed_time(),
        };
        let encoded = init.encode().unwrap();
        assert!(encoded.contains(r#""messageType":"port_forward_init""#));
        assert!(encoded.contains(r#""podName":"api""#));
    }

    #[test]
    fn rejects_unsupported_message_types() {
        let raw = r#"{"messageId":"m-1","sessionId":"","messageType":"resize-window","data":{},"timestamp":"2023-11-14T22:13:20Z"}"#;
        let err = SessionMessage::decode(raw).unwrap_err();
        assert!(err.to_string().contains("unsupported message type"));
    }

    #[test]
    fn tolerates_missing_data_field() {
        let raw = r#"{"messageId":"m-1","sessionId":"s-1","messageType":"keep-alive","timestamp":"2023-11-14T22:13:20Z"}"#;
        let msg = SessionMessage::decode(raw).unwrap();
        assert_eq!(msg.payload, Payload::KeepAlive(KeepAliveData {}));

        let raw = r#"{"messageId":"m-1","sessionId":"s-1","messageType":"ping","data":null,"timestamp":"2023-11-14T22:13:20Z"}"#;
        let msg = SessionMessage::decode(raw).unwrap();
        assert_eq!(msg.payload, Payload::Ping(PingData {}));
    }

    #[test]
    fn rejects_malformed_payloads() {
        let raw = r#"{"messageId":"m-1","sessionId":"","messageType":"ack","data":{"ackedMessageID":7},"timestamp":"2023-11-14T22:13:20Z"}"#;
        let err = SessionMessage::decode(raw).unwrap_err();
        assert!(err.to_string().contains("bad ack payload"));
    }
}
