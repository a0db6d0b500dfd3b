//! JSON frame formats for the WebSocket transport.
//!
//! Every frame in either direction is a single JSON text message. Client
//! frames carry an `event` name selecting the operation, an optional `id`
//! correlating request/response pairs, and an operation-specific `data`
//! object. Server frames are either pushed events or responses to an `id`.

use crate::actors::OutboundEvent;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A frame received from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    /// Operation name, e.g. `set-password` or the connection's configured
    /// message-event name.
    pub event: String,
    /// Correlation id for operations that produce a response frame.
    #[serde(default)]
    pub id: Option<u64>,
    /// Operation payload.
    #[serde(default)]
    pub data: Value,
}

/// A frame pushed to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// An unsolicited event.
    Event { event: String, data: Value },
    /// The response to a client frame that carried an `id`.
    Response { id: u64, data: Value },
}

/// Render an [`OutboundEvent`] as the frame the client sees.
#[must_use]
pub fn server_frame(event: OutboundEvent) -> ServerFrame {
    match event {
        OutboundEvent::ExtraDataUpdated { userid, extra } => ServerFrame::Event {
            event: "extra-data-updated".to_string(),
            data: json!({ "userid": userid, "extra": extra }),
        },
        OutboundEvent::PeerConnected { userid } => ServerFrame::Event {
            event: "peer-connected".to_string(),
            data: json!({ "userid": userid }),
        },
        OutboundEvent::PeerDisconnected { userid } => ServerFrame::Event {
            event: "peer-disconnected".to_string(),
            data: json!({ "userid": userid }),
        },
        OutboundEvent::PasswordRequired { userid } => ServerFrame::Event {
            event: "password-required".to_string(),
            data: json!({ "userid": userid }),
        },
        OutboundEvent::InvalidPassword { userid, password } => ServerFrame::Event {
            event: "invalid-password".to_string(),
            data: json!({ "userid": userid, "password": password }),
        },
        OutboundEvent::MaxTriesExceeded { userid } => ServerFrame::Event {
            event: "max-tries-exceeded".to_string(),
            data: json!({ "userid": userid }),
        },
        OutboundEvent::JoinTimedOut { userid } => ServerFrame::Event {
            event: "join-timed-out".to_string(),
            data: json!({ "userid": userid }),
        },
        OutboundEvent::Message { event, message } => ServerFrame::Event {
            event,
            data: serde_json::to_value(message).unwrap_or(Value::Null),
        },
    }
}
