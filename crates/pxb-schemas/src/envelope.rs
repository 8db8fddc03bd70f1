//! Session message envelope.
//!
//! One JSON object shape covers every message on the bidirectional session:
//! client commands, subscription control, acks, and server-pushed events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Cmd,
    Event,
    Ack,
    Response,
    Error,
    Subscribe,
    Unsubscribe,
    Resume,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    /// Client-chosen correlation for cmd ↔ response/error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Command operation name, for `cmd`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Ack detail: "subscribed" | "unsubscribed" | "pong".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<String>,
}

impl Envelope {
    fn bare(msg_type: MsgType) -> Self {
        Envelope {
            msg_type,
            id: None,
            op: None,
            channel: None,
            seq: None,
            since: None,
            data: None,
            code: None,
            message: None,
            ack: None,
        }
    }

    pub fn event(channel: &str, seq: i64, data: Value) -> Self {
        Envelope {
            channel: Some(channel.to_string()),
            seq: Some(seq),
            data: Some(data),
            ..Envelope::bare(MsgType::Event)
        }
    }

    pub fn response(id: Option<String>, data: Value) -> Self {
        Envelope {
            id,
            data: Some(data),
            ..Envelope::bare(MsgType::Response)
        }
    }

    pub fn error(id: Option<String>, code: &str, message: String) -> Self {
        Envelope {
            id,
            code: Some(code.to_string()),
            message: Some(message),
            ..Envelope::bare(MsgType::Error)
        }
    }

    pub fn ack(what: &str, channel: Option<String>) -> Self {
        Envelope {
            ack: Some(what.to_string()),
            channel,
            ..Envelope::bare(MsgType::Ack)
        }
    }
}
