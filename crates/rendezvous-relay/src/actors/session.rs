//! Per-identity session state and the transport-facing client handle.

use common::secret::SecretString;
use common::types::{ConnectionId, ExtraData};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::messages::OutboundEvent;

/// A borrowed view of one transport connection's outbound channel.
///
/// The transport layer owns the connection; the relay only holds clones of
/// this handle - one on the session itself and one per connection-graph
/// edge pointing at it. An edge's clone is captured at edge-creation time
/// and never revalidated, so it can go stale if the peer reconnects under
/// the same identity without an explicit disconnect; delivery through a
/// stale handle fails and the event is dropped with a log line.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    connection_id: ConnectionId,
    outbound: mpsc::Sender<OutboundEvent>,
}

impl ClientHandle {
    #[must_use]
    pub fn new(connection_id: ConnectionId, outbound: mpsc::Sender<OutboundEvent>) -> Self {
        Self {
            connection_id,
            outbound,
        }
    }

    /// Get the owning connection's id.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Push an event to the connection. Returns false if the connection is
    /// gone (closed channel), which callers treat as a silent drop.
    pub async fn deliver(&self, event: OutboundEvent) -> bool {
        if self.outbound.send(event).await.is_err() {
            debug!(
                target: "relay.session",
                connection_id = %self.connection_id,
                "Dropped event for closed connection"
            );
            return false;
        }
        true
    }
}

/// State for one registered identity.
///
/// Created on first contact (registration, or implicitly when a routed
/// envelope names an unseen sender), destroyed exactly once on departure.
#[derive(Debug)]
pub struct Session {
    /// The owning connection's handle.
    pub handle: ClientHandle,
    /// Peer id -> that peer's handle as captured at edge-creation time.
    pub connected_with: HashMap<String, ClientHandle>,
    /// Discoverable via the public-moderator prefix query.
    pub is_public_moderator: bool,
    /// Caller-defined metadata, replaced wholesale on update.
    pub extra: ExtraData,
    /// Gates join requests to this identity when set.
    pub password: Option<SecretString>,
    /// Event name under which this session's forwarded messages are
    /// delivered to recipients.
    pub message_event: String,
}

impl Session {
    #[must_use]
    pub fn new(handle: ClientHandle, message_event: String) -> Self {
        Self {
            handle,
            connected_with: HashMap::new(),
            is_public_moderator: false,
            extra: common::types::empty_extra(),
            password: None,
            message_event,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_reaches_the_connection() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ClientHandle::new(ConnectionId(1), tx);

        let delivered = handle
            .deliver(OutboundEvent::PeerConnected {
                userid: "bob".to_string(),
            })
            .await;

        assert!(delivered);
        assert_eq!(
            rx.recv().await,
            Some(OutboundEvent::PeerConnected {
                userid: "bob".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_deliver_to_closed_connection_is_a_silent_drop() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let handle = ClientHandle::new(ConnectionId(2), tx);

        let delivered = handle
            .deliver(OutboundEvent::PeerDisconnected {
                userid: "bob".to_string(),
            })
            .await;

        assert!(!delivered);
    }

    #[test]
    fn test_new_session_defaults() {
        let (tx, _rx) = mpsc::channel(4);
        let session = Session::new(ClientHandle::new(ConnectionId(3), tx), "ev".to_string());

        assert!(session.connected_with.is_empty());
        assert!(!session.is_public_moderator);
        assert!(session.password.is_none());
        assert_eq!(session.extra, serde_json::json!({}));
        assert_eq!(session.message_event, "ev");
    }
}
