//! Wire protocol between the meridian controller and its probes.
//!
//! Every WebSocket frame carries exactly one JSON [`Envelope`]. The envelope
//! is decoded in two passes: first the outer `{type, request_id, timestamp,
//! data}` shape, then the `data` object against the payload schema selected
//! by `type`. Unknown `type` values surface as [`Payload::Unknown`] so the
//! receiver can log and drop them without tearing down the session; unknown
//! fields inside `data` are ignored for forward compatibility.

mod results;

pub use results::*;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

// Probe -> controller.
pub const MSG_REGISTER: &str = "register";
pub const MSG_HEARTBEAT: &str = "heartbeat";
pub const MSG_TASK_RESULT: &str = "task_result";
pub const MSG_TASK_STATUS: &str = "task_status";
pub const MSG_ERROR: &str = "error";

// Controller -> probe.
pub const MSG_REGISTER_ACK: &str = "register_ack";
pub const MSG_HEARTBEAT_ACK: &str = "heartbeat_ack";
pub const MSG_TASK_ASSIGN: &str = "task_assign";
pub const MSG_TASK_CANCEL: &str = "task_cancel";
pub const MSG_CONFIG: &str = "config";

// Both directions.
pub const MSG_PING: &str = "ping";
pub const MSG_PONG: &str = "pong";

// Task-type vocabulary. Probes declare these as capabilities; the wildcard
// `all` matches every type.
pub const TASK_ICMP_PING: &str = "icmp_ping";
pub const TASK_TCP_PING: &str = "tcp_ping";
pub const TASK_TRACEROUTE: &str = "traceroute";
pub const TASK_HTTP_TEST: &str = "http_test";
pub const TASK_BIRD_ROUTE: &str = "bird_route";
pub const CAPABILITY_ALL: &str = "all";

/// Whether a task type supports continuous (re-dispatching) mode. Continuous
/// runs are forced to `count=1` per tick, so only the incremental probes
/// qualify.
pub fn supports_continuous(task_type: &str) -> bool {
    matches!(task_type, TASK_ICMP_PING | TASK_TCP_PING)
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
    #[error("invalid {msg_type} payload: {source}")]
    InvalidPayload {
        msg_type: String,
        source: serde_json::Error,
    },
}

/// The frame-level message shape. One frame on the wire is one envelope;
/// `timestamp` is Unix seconds and is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(msg_type: &str, data: impl Serialize) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    /// First decode pass: raw frame text to envelope. A frame without a
    /// `type` field fails here, which receivers treat as a protocol error.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Second decode pass: interpret `data` against the schema selected by
    /// `type`. Unknown types are preserved, not rejected.
    pub fn payload(&self) -> Result<Payload, ProtocolError> {
        fn typed<T: DeserializeOwned>(env: &Envelope) -> Result<T, ProtocolError> {
            serde_json::from_value(env.data.clone()).map_err(|source| {
                ProtocolError::InvalidPayload {
                    msg_type: env.msg_type.clone(),
                    source,
                }
            })
        }

        Ok(match self.msg_type.as_str() {
            MSG_REGISTER => Payload::Register(typed(self)?),
            MSG_REGISTER_ACK => Payload::RegisterAck(typed(self)?),
            MSG_HEARTBEAT => Payload::Heartbeat(typed(self)?),
            MSG_HEARTBEAT_ACK => Payload::HeartbeatAck(typed(self)?),
            MSG_TASK_ASSIGN => Payload::TaskAssign(typed(self)?),
            MSG_TASK_CANCEL => Payload::TaskCancel(typed(self)?),
            MSG_TASK_RESULT => Payload::TaskResult(typed(self)?),
            MSG_TASK_STATUS => Payload::TaskStatus(typed(self)?),
            MSG_ERROR => Payload::Error(typed(self)?),
            MSG_CONFIG => Payload::Config(typed(self)?),
            MSG_PING => Payload::Ping,
            MSG_PONG => Payload::Pong,
            other => Payload::Unknown(other.to_string()),
        })
    }
}

/// Typed view over an envelope's `data`, tagged by the envelope `type`.
#[derive(Debug, Clone)]
pub enum Payload {
    Register(RegisterPayload),
    RegisterAck(RegisterAckPayload),
    Heartbeat(HeartbeatPayload),
    HeartbeatAck(HeartbeatAckPayload),
    TaskAssign(TaskAssignPayload),
    TaskCancel(TaskCancelPayload),
    TaskResult(TaskResultPayload),
    TaskStatus(TaskStatusPayload),
    Error(ErrorPayload),
    Config(SessionConfig),
    Ping,
    Pong,
    Unknown(String),
}

/// Sent by a probe immediately after dialing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub probe_id: String,
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterAckPayload {
    pub success: bool,
    #[serde(default)]
    pub probe_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub config: SessionConfig,
}

/// Runtime knobs pushed to the probe on registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub heartbeat_interval: u64,
    pub max_concurrent_tasks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 30,
            max_concurrent_tasks: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub probe_id: String,
    pub status: String,
    #[serde(default)]
    pub active_tasks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatAckPayload {
    pub timestamp: i64,
    pub next_heartbeat: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskAssignPayload {
    pub task_id: String,
    pub execution_id: String,
    pub task_type: String,
    pub target: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    /// Seconds. Zero means no per-task timeout.
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCancelPayload {
    pub execution_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub reason: String,
}

/// The single terminal report a probe emits per execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub execution_id: String,
    pub task_id: String,
    #[serde(default)]
    pub probe_id: String,
    /// "success" or "failed".
    pub status: String,
    #[serde(default)]
    pub result_data: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatusPayload {
    pub execution_id: String,
    pub task_id: String,
    #[serde(default)]
    pub probe_id: String,
    pub status: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::new(
            MSG_TASK_CANCEL,
            TaskCancelPayload {
                execution_id: "e-1".into(),
                task_id: "t-1".into(),
                reason: "operator".into(),
            },
        );
        let decoded = Envelope::decode(&env.encode()).unwrap();
        match decoded.payload().unwrap() {
            Payload::TaskCancel(c) => {
                assert_eq!(c.execution_id, "e-1");
                assert_eq!(c.reason, "operator");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_preserved_not_rejected() {
        let raw = r#"{"type":"mystery","request_id":"r","timestamp":1,"data":{"x":1}}"#;
        let env = Envelope::decode(raw).unwrap();
        assert!(matches!(env.payload().unwrap(), Payload::Unknown(t) if t == "mystery"));
    }

    #[test]
    fn missing_type_is_a_protocol_error() {
        let raw = r#"{"request_id":"r","timestamp":1,"data":{}}"#;
        assert!(Envelope::decode(raw).is_err());
    }

    #[test]
    fn unknown_fields_in_data_are_ignored() {
        let raw = r#"{"type":"heartbeat","request_id":"r","timestamp":9,
                      "data":{"probe_id":"p-1","status":"online","active_tasks":2,"future_field":true}}"#;
        let env = Envelope::decode(raw).unwrap();
        match env.payload().unwrap() {
            Payload::Heartbeat(hb) => {
                assert_eq!(hb.probe_id, "p-1");
                assert_eq!(hb.active_tasks, 2);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn malformed_data_reports_the_message_type() {
        let raw = r#"{"type":"task_assign","request_id":"r","timestamp":1,"data":{"task_id":7}}"#;
        let env = Envelope::decode(raw).unwrap();
        let err = env.payload().unwrap_err();
        assert!(err.to_string().contains("task_assign"));
    }

    #[test]
    fn continuous_support_is_limited_to_incremental_types() {
        assert!(supports_continuous(TASK_ICMP_PING));
        assert!(supports_continuous(TASK_TCP_PING));
        assert!(!supports_continuous(TASK_TRACEROUTE));
        assert!(!supports_continuous(TASK_HTTP_TEST));
        assert!(!supports_continuous(TASK_BIRD_ROUTE));
    }
}
