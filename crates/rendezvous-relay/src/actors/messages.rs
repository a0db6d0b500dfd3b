//! Command and event types for the relay dispatcher.
//!
//! Inbound traffic arrives as [`RelayCommand`] values on the dispatcher's
//! mailbox; everything the relay pushes back out to a connection is an
//! [`OutboundEvent`]. The ad hoc boolean flags clients put in message
//! payloads (`newParticipationRequest`, `shiftedModerationControl`, ...)
//! are resolved once, at the router's entry, into a [`MessageKind`] - the
//! rest of the pipeline never re-inspects the payload.

use common::secret::SecretString;
use common::types::{ConnectionId, ExtraData};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::session::ClientHandle;

/// Reserved pseudo-recipient for relay-answered queries.
pub const SYSTEM_RECIPIENT: &str = "system";

/// Payload flag: this message asks to join the target's session.
const FLAG_JOIN_REQUEST: &str = "newParticipationRequest";
/// Payload flag: this message transfers moderation control.
const FLAG_MODERATION_HANDOFF: &str = "shiftedModerationControl";
/// Payload flag: deliver the handoff only when the sender departs.
const FLAG_FIRED_ON_LEAVE: &str = "firedOnLeave";
/// Payload flag: this is a presence probe for the id in `userid`.
const FLAG_DETECT_PRESENCE: &str = "detectPresence";
/// Payload field naming the presence probe's target.
const FIELD_PRESENCE_TARGET: &str = "userid";

/// An addressed message in flight between two identities.
///
/// Transient: envelopes are routed, deferred or dropped, never stored as
/// session state (the one exception is a pending moderation handoff). The
/// `extra` field is overwritten by the router with the sender's current
/// metadata at forward time, whatever the client supplied.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Identity the message claims to come from.
    pub sender: String,
    /// Target identity, or the reserved sentinel `"system"`.
    #[serde(rename = "remoteUserId")]
    pub remote_user_id: String,
    /// Opaque body; may carry the routing flags resolved by [`MessageKind`].
    #[serde(rename = "message", default)]
    pub payload: serde_json::Value,
    /// Password supplied for a gated join, if any.
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Sender metadata; replaced by the router before forwarding.
    #[serde(default = "common::types::empty_extra")]
    pub extra: ExtraData,
}

/// What a routed envelope is asking for, resolved once from payload flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// A request to join the target's session (password gate applies).
    JoinRequest,
    /// A moderation control transfer, immediate or deferred to departure.
    ModerationHandoff { fired_on_leave: bool },
    /// A `"system"`-addressed presence probe for `target`.
    PresenceProbe { target: String },
    /// Anything else: forwarded verbatim.
    Plain,
}

impl MessageKind {
    /// Resolve the kind of an envelope from its payload flags.
    #[must_use]
    pub fn resolve(envelope: &Envelope) -> Self {
        let payload = &envelope.payload;

        if flag(payload, FLAG_MODERATION_HANDOFF) {
            return Self::ModerationHandoff {
                fired_on_leave: flag(payload, FLAG_FIRED_ON_LEAVE),
            };
        }

        if envelope.remote_user_id == SYSTEM_RECIPIENT && flag(payload, FLAG_DETECT_PRESENCE) {
            // A probe with no (or a non-string) target is still a probe;
            // nobody is registered under the empty id, so it answers absent.
            let target = payload
                .get(FIELD_PRESENCE_TARGET)
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Self::PresenceProbe { target };
        }

        if flag(payload, FLAG_JOIN_REQUEST) {
            return Self::JoinRequest;
        }

        Self::Plain
    }
}

fn flag(payload: &serde_json::Value, name: &str) -> bool {
    payload.get(name).and_then(serde_json::Value::as_bool) == Some(true)
}

/// A forwarded envelope as delivered to the recipient's connection.
///
/// The supplied password is deliberately absent: it was consumed by the
/// password gate and has no business reaching the other end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardedMessage {
    pub sender: String,
    #[serde(rename = "remoteUserId")]
    pub remote_user_id: String,
    #[serde(rename = "message")]
    pub payload: serde_json::Value,
    pub extra: ExtraData,
}

/// Events the relay pushes to a connection's outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// A peer's metadata was replaced; sent to every connected peer.
    ExtraDataUpdated { userid: String, extra: ExtraData },
    /// The rendezvous with `userid` completed; sent to both ends.
    PeerConnected { userid: String },
    /// `userid` departed or severed the edge to this connection.
    PeerDisconnected { userid: String },
    /// The join target has a password and none was supplied.
    PasswordRequired { userid: String },
    /// The supplied password did not match; echoes the rejected value.
    InvalidPassword { userid: String, password: String },
    /// Too many rejected attempts; further joins are short-circuited.
    MaxTriesExceeded { userid: String },
    /// The join target never appeared within the retry budget.
    JoinTimedOut { userid: String },
    /// A forwarded message, delivered under the sender's configured
    /// message-event name.
    Message {
        event: String,
        message: ForwardedMessage,
    },
}

/// A registered identity flagged discoverable, as returned by the
/// public-moderator query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicModerator {
    pub userid: String,
    pub extra: ExtraData,
}

/// Synchronous outcome of routing one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAck {
    /// The envelope was dispatched (forwarded, deferred, gated or dropped);
    /// any further outcome arrives as outbound events.
    Accepted,
    /// The envelope was a presence probe; this is the answer.
    Presence { userid: String, present: bool },
}

/// A point-in-time view of the dispatcher's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub relay_id: String,
    pub sessions: usize,
    pub pending_joins: usize,
    pub deferred_handoffs: usize,
}

/// Commands processed by the relay dispatcher, one at a time.
#[derive(Debug)]
pub enum RelayCommand {
    /// A connection registered (or re-registered) an identity.
    Connect {
        userid: String,
        handle: ClientHandle,
        message_event: String,
    },
    /// Replace the session's metadata wholesale and notify connected peers.
    UpdateExtra {
        connection_id: ConnectionId,
        extra: ExtraData,
    },
    /// Flag the session as a discoverable public moderator.
    BecomePublicModerator { connection_id: ConnectionId },
    /// Discovery-ordered public moderators whose id starts with `prefix`.
    GetPublicModerators {
        connection_id: ConnectionId,
        prefix: String,
        respond_to: oneshot::Sender<Vec<PublicModerator>>,
    },
    /// Move the connection's session under a new identity. Only the owning
    /// connection may rename; a mismatch silently starts a fresh anonymous
    /// session under the new id instead.
    Rename {
        handle: ClientHandle,
        message_event: String,
        new_userid: String,
    },
    /// Set the password gating joins to this identity.
    SetPassword {
        connection_id: ConnectionId,
        password: SecretString,
    },
    /// Sever the edge to `target` in both directions.
    DisconnectWith {
        connection_id: ConnectionId,
        target: String,
        respond_to: oneshot::Sender<()>,
    },
    /// Route one addressed envelope.
    Route {
        envelope: Envelope,
        inbound: ClientHandle,
        message_event: String,
        respond_to: oneshot::Sender<RouteAck>,
    },
    /// One tick of a pending join's retry timer.
    RetryTick { requester: String, target: String },
    /// Departure notification from the transport layer.
    Disconnect { connection_id: ConnectionId },
    /// Point-in-time dispatcher state.
    GetStatus {
        respond_to: oneshot::Sender<RelayStatus>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(remote: &str, payload: serde_json::Value) -> Envelope {
        Envelope {
            sender: "alice".to_string(),
            remote_user_id: remote.to_string(),
            payload,
            password: None,
            extra: common::types::empty_extra(),
        }
    }

    #[test]
    fn test_resolve_plain_message() {
        let kind = MessageKind::resolve(&envelope("bob", json!({"sdp": "offer"})));
        assert_eq!(kind, MessageKind::Plain);
    }

    #[test]
    fn test_resolve_join_request() {
        let kind = MessageKind::resolve(&envelope(
            "bob",
            json!({"newParticipationRequest": true}),
        ));
        assert_eq!(kind, MessageKind::JoinRequest);
    }

    #[test]
    fn test_resolve_moderation_handoff() {
        let immediate = MessageKind::resolve(&envelope(
            "bob",
            json!({"shiftedModerationControl": true, "firedOnLeave": false}),
        ));
        assert_eq!(
            immediate,
            MessageKind::ModerationHandoff {
                fired_on_leave: false
            }
        );

        let deferred = MessageKind::resolve(&envelope(
            "bob",
            json!({"shiftedModerationControl": true, "firedOnLeave": true}),
        ));
        assert_eq!(
            deferred,
            MessageKind::ModerationHandoff {
                fired_on_leave: true
            }
        );
    }

    #[test]
    fn test_resolve_presence_probe() {
        let kind = MessageKind::resolve(&envelope(
            "system",
            json!({"detectPresence": true, "userid": "bob"}),
        ));
        assert_eq!(
            kind,
            MessageKind::PresenceProbe {
                target: "bob".to_string()
            }
        );
    }

    #[test]
    fn test_presence_flag_only_applies_to_system_recipient() {
        let kind = MessageKind::resolve(&envelope(
            "bob",
            json!({"detectPresence": true, "userid": "carol"}),
        ));
        assert_eq!(kind, MessageKind::Plain);
    }

    #[test]
    fn test_presence_probe_without_target_probes_the_empty_id() {
        let kind = MessageKind::resolve(&envelope("system", json!({"detectPresence": true})));
        assert_eq!(
            kind,
            MessageKind::PresenceProbe {
                target: String::new()
            }
        );

        let kind = MessageKind::resolve(&envelope(
            "system",
            json!({"detectPresence": true, "userid": 42}),
        ));
        assert_eq!(
            kind,
            MessageKind::PresenceProbe {
                target: String::new()
            }
        );
    }

    #[test]
    fn test_non_boolean_flag_is_ignored() {
        let kind = MessageKind::resolve(&envelope(
            "bob",
            json!({"newParticipationRequest": "yes"}),
        ));
        assert_eq!(kind, MessageKind::Plain);
    }

    #[test]
    fn test_envelope_deserializes_wire_shape() {
        use common::secret::ExposeSecret;

        let envelope: Envelope = serde_json::from_value(json!({
            "sender": "alice",
            "remoteUserId": "bob",
            "message": {"newParticipationRequest": true},
            "password": "pw1",
        }))
        .unwrap();

        assert_eq!(envelope.sender, "alice");
        assert_eq!(envelope.remote_user_id, "bob");
        assert_eq!(
            envelope.password.as_ref().map(ExposeSecret::expose_secret),
            Some("pw1")
        );
        assert_eq!(envelope.extra, json!({}));
    }

    #[test]
    fn test_forwarded_message_serializes_wire_shape() {
        let msg = ForwardedMessage {
            sender: "alice".to_string(),
            remote_user_id: "bob".to_string(),
            payload: json!({"sdp": "offer"}),
            extra: json!({"name": "Alice"}),
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "sender": "alice",
                "remoteUserId": "bob",
                "message": {"sdp": "offer"},
                "extra": {"name": "Alice"},
            })
        );
    }
}
