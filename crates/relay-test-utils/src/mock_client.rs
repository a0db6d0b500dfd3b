//! In-process relay client for dispatcher tests.
//!
//! `TestClient` stands in for a WebSocket connection: it holds the
//! `ClientHandle` registered with the dispatcher and the receiving end of
//! its outbound event channel, with assertion helpers that fail the test on
//! timeout or mismatch.

use common::types::ConnectionId;
use rendezvous_relay::actors::{
    ClientHandle, Envelope, ForwardedMessage, OutboundEvent, RelayActorHandle, RelayMetrics,
    RelaySettings, RouteAck,
};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::fixtures::TEST_MESSAGE_EVENT;

/// How long `TestClient` waits for an expected event before failing.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn a relay dispatcher with default settings for tests.
#[must_use]
pub fn test_relay(relay_id: &str) -> RelayActorHandle {
    RelayActorHandle::new(
        relay_id.to_string(),
        RelaySettings::default(),
        RelayMetrics::new(),
    )
}

/// Spawn a relay dispatcher with explicit settings for tests.
#[must_use]
pub fn test_relay_with_settings(relay_id: &str, settings: RelaySettings) -> RelayActorHandle {
    RelayActorHandle::new(relay_id.to_string(), settings, RelayMetrics::new())
}

/// An in-process client connected to the dispatcher.
pub struct TestClient {
    userid: String,
    handle: ClientHandle,
    rx: mpsc::Receiver<OutboundEvent>,
}

impl TestClient {
    /// Create a client without registering it.
    #[must_use]
    pub fn new(connection_id: u64, userid: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            userid: userid.into(),
            handle: ClientHandle::new(ConnectionId(connection_id), tx),
            rx,
        }
    }

    /// Create a client and register its identity with the dispatcher.
    ///
    /// # Panics
    ///
    /// Panics if the dispatcher is unreachable.
    pub async fn register(
        relay: &RelayActorHandle,
        connection_id: u64,
        userid: impl Into<String>,
    ) -> Self {
        let client = Self::new(connection_id, userid);
        relay
            .connect(
                client.userid.clone(),
                client.handle.clone(),
                TEST_MESSAGE_EVENT.to_string(),
            )
            .await
            .expect("connect should reach the dispatcher");
        client
    }

    /// The identity this client registered.
    #[must_use]
    pub fn userid(&self) -> &str {
        &self.userid
    }

    /// A clone of the handle the dispatcher delivers to.
    #[must_use]
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.handle.connection_id()
    }

    /// Route an envelope as this connection.
    ///
    /// # Panics
    ///
    /// Panics if the dispatcher is unreachable.
    pub async fn send(&self, relay: &RelayActorHandle, envelope: Envelope) -> RouteAck {
        relay
            .route(
                envelope,
                self.handle.clone(),
                TEST_MESSAGE_EVENT.to_string(),
            )
            .await
            .expect("route should reach the dispatcher")
    }

    /// Receive the next outbound event.
    ///
    /// # Panics
    ///
    /// Panics if no event arrives within the timeout.
    pub async fn recv(&mut self) -> OutboundEvent {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .unwrap_or_else(|_| panic!("{}: timed out waiting for an event", self.userid))
            .unwrap_or_else(|| panic!("{}: outbound channel closed", self.userid))
    }

    /// Receive an event if one is already queued.
    pub fn try_recv(&mut self) -> Option<OutboundEvent> {
        self.rx.try_recv().ok()
    }

    /// Expect a `peer-connected` event for `userid`.
    ///
    /// # Panics
    ///
    /// Panics on timeout or a different event.
    pub async fn expect_peer_connected(&mut self, userid: &str) {
        let event = self.recv().await;
        assert_eq!(
            event,
            OutboundEvent::PeerConnected {
                userid: userid.to_string()
            },
            "{}: expected peer-connected for {userid}",
            self.userid
        );
    }

    /// Expect a `peer-disconnected` event for `userid`.
    ///
    /// # Panics
    ///
    /// Panics on timeout or a different event.
    pub async fn expect_peer_disconnected(&mut self, userid: &str) {
        let event = self.recv().await;
        assert_eq!(
            event,
            OutboundEvent::PeerDisconnected {
                userid: userid.to_string()
            },
            "{}: expected peer-disconnected for {userid}",
            self.userid
        );
    }

    /// Expect a forwarded message and return it.
    ///
    /// # Panics
    ///
    /// Panics on timeout or a different event.
    pub async fn expect_message(&mut self) -> ForwardedMessage {
        match self.recv().await {
            OutboundEvent::Message { event, message } => {
                assert_eq!(
                    event, TEST_MESSAGE_EVENT,
                    "{}: forwarded under unexpected event name",
                    self.userid
                );
                message
            }
            other => panic!("{}: expected a forwarded message, got {other:?}", self.userid),
        }
    }

    /// Assert that no event is queued.
    ///
    /// # Panics
    ///
    /// Panics if an event is waiting.
    pub fn assert_silent(&mut self) {
        if let Ok(event) = self.rx.try_recv() {
            panic!("{}: expected silence, got {event:?}", self.userid);
        }
    }

    /// Drop the receiving end, leaving the registered handle stale.
    ///
    /// Messages forwarded through edges that captured this handle will be
    /// dropped by the router from now on.
    #[must_use]
    pub fn into_stale_handle(self) -> ClientHandle {
        self.handle
    }
}
