//! Integration tests for the relay routing protocol.
//!
//! Exercises the dispatcher end to end through in-process clients:
//! rendezvous, password-gated joins, join retries, moderation handoff,
//! presence, rename and departure cleanup.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use std::time::Duration;

use relay_test_utils::{
    random_userid, test_relay, test_relay_with_settings, EnvelopeBuilder, TestClient,
};
use rendezvous_relay::actors::{OutboundEvent, RelaySettings, RouteAck};
use serde_json::json;

// ============================================================================
// Rendezvous and forwarding
// ============================================================================

#[tokio::test]
async fn test_join_establishes_rendezvous_and_forwards() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    let ack = alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "bob")
                .join()
                .payload(json!({"sdp": "offer"}))
                .build(),
        )
        .await;
    assert_eq!(ack, RouteAck::Accepted);

    alice.expect_peer_connected("bob").await;
    bob.expect_peer_connected("alice").await;

    let message = bob.expect_message().await;
    assert_eq!(message.sender, "alice");
    assert_eq!(message.remote_user_id, "bob");
    assert_eq!(message.payload["sdp"], "offer");

    relay.cancel();
}

#[tokio::test]
async fn test_forwarded_message_carries_senders_current_extra() {
    let relay = test_relay("relay-1");
    let alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    relay
        .update_extra(alice.connection_id(), json!({"name": "Alice"}))
        .await
        .unwrap();

    // The envelope claims different metadata; the router stamps in the
    // registered value.
    alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "bob")
                .extra(json!({"name": "Mallory"}))
                .build(),
        )
        .await;

    bob.expect_peer_connected("alice").await;
    let message = bob.expect_message().await;
    assert_eq!(message.extra["name"], "Alice");

    relay.cancel();
}

#[tokio::test]
async fn test_plain_message_to_absent_recipient_is_dropped_silently() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;

    let ack = alice
        .send(&relay, EnvelopeBuilder::new("alice", "ghost").build())
        .await;
    assert_eq!(ack, RouteAck::Accepted);

    // No retry is armed for plain messages.
    let status = relay.status().await.unwrap();
    assert_eq!(status.pending_joins, 0);
    alice.assert_silent();

    relay.cancel();
}

#[tokio::test]
async fn test_unregistered_sender_is_registered_implicitly() {
    let relay = test_relay("relay-1");
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    // "alice" never connected; her first routed envelope registers her.
    let alice = TestClient::new(1, "alice");
    relay
        .route(
            EnvelopeBuilder::new("alice", "bob").build(),
            alice.handle(),
            "relay-message".to_string(),
        )
        .await
        .unwrap();

    bob.expect_peer_connected("alice").await;
    let status = relay.status().await.unwrap();
    assert_eq!(status.sessions, 2);

    relay.cancel();
}

#[tokio::test]
async fn test_stale_edge_drops_message_without_severing() {
    let relay = test_relay("relay-1");
    let alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").build())
        .await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;

    // Bob's receiver goes away without a departure notification while the
    // registered handle lives on. The edge keeps pointing at the dead
    // channel.
    let _stale = bob.into_stale_handle();

    let ack = alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").build())
        .await;
    assert_eq!(ack, RouteAck::Accepted);

    // The registry is untouched: bob's session is still present.
    let status = relay.status().await.unwrap();
    assert_eq!(status.sessions, 2);

    relay.cancel();
}

// ============================================================================
// Password gate
// ============================================================================

#[tokio::test]
async fn test_join_without_password_is_rejected() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    relay
        .set_password(bob.connection_id(), "s3cret".to_string().into())
        .await
        .unwrap();

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").join().build())
        .await;

    assert_eq!(
        alice.recv().await,
        OutboundEvent::PasswordRequired {
            userid: "bob".to_string()
        }
    );
    bob.assert_silent();

    relay.cancel();
}

#[tokio::test]
async fn test_invalid_password_echoes_rejected_value() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let bob = TestClient::register(&relay, 2, "bob").await;

    relay
        .set_password(bob.connection_id(), "s3cret".to_string().into())
        .await
        .unwrap();

    alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "bob")
                .join()
                .password("guess")
                .build(),
        )
        .await;

    assert_eq!(
        alice.recv().await,
        OutboundEvent::InvalidPassword {
            userid: "bob".to_string(),
            password: "guess".to_string()
        }
    );

    relay.cancel();
}

#[tokio::test]
async fn test_fourth_attempt_short_circuits_regardless_of_password() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let bob = TestClient::register(&relay, 2, "bob").await;

    relay
        .set_password(bob.connection_id(), "s3cret".to_string().into())
        .await
        .unwrap();

    for attempt in 0..3 {
        alice
            .send(
                &relay,
                EnvelopeBuilder::new("alice", "bob")
                    .join()
                    .password(format!("wrong-{attempt}"))
                    .build(),
            )
            .await;
        assert!(
            matches!(alice.recv().await, OutboundEvent::InvalidPassword { .. }),
            "attempt {attempt} should be rejected individually"
        );
    }

    // The fourth attempt carries the correct password, but the counter has
    // already burned through its budget.
    alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "bob")
                .join()
                .password("s3cret")
                .build(),
        )
        .await;
    assert_eq!(
        alice.recv().await,
        OutboundEvent::MaxTriesExceeded {
            userid: "bob".to_string()
        }
    );

    relay.cancel();
}

#[tokio::test]
async fn test_correct_password_joins_before_exhaustion() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    relay
        .set_password(bob.connection_id(), "s3cret".to_string().into())
        .await
        .unwrap();

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").join().build())
        .await;
    let _ = alice.recv().await; // password-required

    alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "bob")
                .join()
                .password("s3cret")
                .build(),
        )
        .await;

    alice.expect_peer_connected("bob").await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;

    relay.cancel();
}

#[tokio::test]
async fn test_password_gate_ignores_non_join_messages() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    relay
        .set_password(bob.connection_id(), "s3cret".to_string().into())
        .await
        .unwrap();

    // A plain message routes without touching the gate.
    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").build())
        .await;

    alice.expect_peer_connected("bob").await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;

    relay.cancel();
}

// ============================================================================
// Join retry scheduler
// ============================================================================

fn fast_retry(ticks: u32) -> RelaySettings {
    RelaySettings {
        max_password_tries: 3,
        join_retry_ticks: ticks,
        join_retry_interval: Duration::from_millis(100),
    }
}

#[tokio::test(start_paused = true)]
async fn test_join_completes_when_target_appears_late() {
    let relay = test_relay_with_settings("relay-1", fast_retry(120));
    let mut alice = TestClient::register(&relay, 1, "alice").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").join().build())
        .await;
    assert_eq!(relay.status().await.unwrap().pending_joins, 1);

    let mut bob = TestClient::register(&relay, 2, "bob").await;

    // The parked envelope is delivered on the next tick.
    alice.expect_peer_connected("bob").await;
    bob.expect_peer_connected("alice").await;
    let message = bob.expect_message().await;
    assert_eq!(message.sender, "alice");

    assert_eq!(relay.status().await.unwrap().pending_joins, 0);

    relay.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_join_times_out_when_target_never_appears() {
    let relay = test_relay_with_settings("relay-1", fast_retry(3));
    let mut alice = TestClient::register(&relay, 1, "alice").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "ghost").join().build())
        .await;

    assert_eq!(
        alice.recv().await,
        OutboundEvent::JoinTimedOut {
            userid: "ghost".to_string()
        }
    );
    assert_eq!(relay.status().await.unwrap().pending_joins, 0);

    // Exhaustion is terminal: no further events arrive.
    tokio::time::sleep(Duration::from_secs(1)).await;
    alice.assert_silent();

    relay.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_rearmed_join_replaces_previous_retry() {
    let relay = test_relay_with_settings("relay-1", fast_retry(3));
    let mut alice = TestClient::register(&relay, 1, "alice").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "ghost").join().build())
        .await;
    alice
        .send(&relay, EnvelopeBuilder::new("alice", "ghost").join().build())
        .await;

    // Only one pending join exists for the pair, so exhaustion produces
    // exactly one timeout event.
    assert_eq!(relay.status().await.unwrap().pending_joins, 1);
    assert_eq!(
        alice.recv().await,
        OutboundEvent::JoinTimedOut {
            userid: "ghost".to_string()
        }
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    alice.assert_silent();

    relay.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_zero_tick_budget_times_out_on_first_tick() {
    // Config rejects a zero budget, but the settings struct can be built
    // with one directly; it must exhaust cleanly instead of underflowing.
    let relay = test_relay_with_settings("relay-1", fast_retry(0));
    let mut alice = TestClient::register(&relay, 1, "alice").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "ghost").join().build())
        .await;

    assert_eq!(
        alice.recv().await,
        OutboundEvent::JoinTimedOut {
            userid: "ghost".to_string()
        }
    );
    assert_eq!(relay.status().await.unwrap().pending_joins, 0);

    relay.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_parked_join_from_departed_requester_is_dropped() {
    let relay = test_relay_with_settings("relay-1", fast_retry(120));
    let alice = TestClient::register(&relay, 1, "alice").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").join().build())
        .await;
    assert_eq!(relay.status().await.unwrap().pending_joins, 1);

    // Alice departs while her join is parked. When bob shows up the parked
    // envelope no longer has a registered sender, so the tick drops it
    // instead of delivering.
    relay.disconnect(alice.connection_id()).await.unwrap();
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    bob.assert_silent();
    assert_eq!(relay.status().await.unwrap().pending_joins, 0);

    relay.cancel();
}

// ============================================================================
// Presence
// ============================================================================

#[tokio::test]
async fn test_presence_probe_reports_registered_identities() {
    let relay = test_relay("relay-1");
    let alice = TestClient::register(&relay, 1, "alice").await;
    let _bob = TestClient::register(&relay, 2, "bob").await;

    let ack = alice
        .send(&relay, EnvelopeBuilder::new("alice", "x").presence("bob").build())
        .await;
    assert_eq!(
        ack,
        RouteAck::Presence {
            userid: "bob".to_string(),
            present: true
        }
    );

    let ack = alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "x").presence("ghost").build(),
        )
        .await;
    assert_eq!(
        ack,
        RouteAck::Presence {
            userid: "ghost".to_string(),
            present: false
        }
    );

    relay.cancel();
}

#[tokio::test]
async fn test_presence_probe_for_own_identity_is_false() {
    let relay = test_relay("relay-1");
    let alice = TestClient::register(&relay, 1, "alice").await;

    let ack = alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "x").presence("alice").build(),
        )
        .await;
    assert_eq!(
        ack,
        RouteAck::Presence {
            userid: "alice".to_string(),
            present: false
        }
    );

    relay.cancel();
}

#[tokio::test]
async fn test_presence_probe_without_target_reports_absent() {
    let relay = test_relay("relay-1");
    let alice = TestClient::register(&relay, 1, "alice").await;

    // A probe that names no target is still answered, never forwarded.
    let ack = alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "system")
                .payload(json!({"detectPresence": true}))
                .build(),
        )
        .await;
    assert_eq!(
        ack,
        RouteAck::Presence {
            userid: String::new(),
            present: false
        }
    );

    relay.cancel();
}

// ============================================================================
// Moderation handoff
// ============================================================================

#[tokio::test]
async fn test_immediate_handoff_is_forwarded_at_once() {
    let relay = test_relay("relay-1");
    let alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "bob").handoff(false).build(),
        )
        .await;

    bob.expect_peer_connected("alice").await;
    let message = bob.expect_message().await;
    assert_eq!(message.payload["shiftedModerationControl"], true);

    let status = relay.status().await.unwrap();
    assert_eq!(status.deferred_handoffs, 0);

    relay.cancel();
}

#[tokio::test]
async fn test_deferred_handoff_is_delivered_at_departure() {
    let relay = test_relay("relay-1");
    let alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    // Establish the edge first so departure delivery forwards through it.
    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").build())
        .await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;

    alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "bob")
                .handoff(true)
                .payload(json!({"broadcasters": ["cam-1"]}))
                .build(),
        )
        .await;
    bob.assert_silent();
    assert_eq!(relay.status().await.unwrap().deferred_handoffs, 1);

    relay.disconnect(alice.connection_id()).await.unwrap();

    // Departure notification first, then the handoff.
    bob.expect_peer_disconnected("alice").await;
    let message = bob.expect_message().await;
    assert_eq!(message.payload["broadcasters"][0], "cam-1");

    let status = relay.status().await.unwrap();
    assert_eq!(status.deferred_handoffs, 0);
    assert_eq!(status.sessions, 1);

    relay.cancel();
}

#[tokio::test]
async fn test_later_deferred_handoff_overwrites_earlier() {
    let relay = test_relay("relay-1");
    let alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").build())
        .await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;

    alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "bob")
                .handoff(true)
                .payload(json!({"generation": 1}))
                .build(),
        )
        .await;
    alice
        .send(
            &relay,
            EnvelopeBuilder::new("alice", "bob")
                .handoff(true)
                .payload(json!({"generation": 2}))
                .build(),
        )
        .await;
    assert_eq!(relay.status().await.unwrap().deferred_handoffs, 1);

    relay.disconnect(alice.connection_id()).await.unwrap();

    bob.expect_peer_disconnected("alice").await;
    let message = bob.expect_message().await;
    assert_eq!(message.payload["generation"], 2);
    bob.assert_silent();

    relay.cancel();
}

// ============================================================================
// Departure cleanup
// ============================================================================

#[tokio::test]
async fn test_disconnect_notifies_each_peer_exactly_once() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;
    let mut carol = TestClient::register(&relay, 3, "carol").await;

    for peer in ["bob", "carol"] {
        alice
            .send(&relay, EnvelopeBuilder::new("alice", peer).build())
            .await;
    }
    alice.expect_peer_connected("bob").await;
    alice.expect_peer_connected("carol").await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;
    carol.expect_peer_connected("alice").await;
    let _ = carol.expect_message().await;

    relay.disconnect(alice.connection_id()).await.unwrap();

    bob.expect_peer_disconnected("alice").await;
    carol.expect_peer_disconnected("alice").await;
    bob.assert_silent();
    carol.assert_silent();

    // The departed identity is gone from the registry.
    let ack = bob
        .send(&relay, EnvelopeBuilder::new("bob", "x").presence("alice").build())
        .await;
    assert_eq!(
        ack,
        RouteAck::Presence {
            userid: "alice".to_string(),
            present: false
        }
    );

    relay.cancel();
}

#[tokio::test]
async fn test_disconnect_with_severs_both_directions() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").build())
        .await;
    alice.expect_peer_connected("bob").await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;

    relay
        .disconnect_with(alice.connection_id(), "bob".to_string())
        .await
        .unwrap();

    assert_eq!(
        alice.recv().await,
        OutboundEvent::PeerDisconnected {
            userid: "bob".to_string()
        }
    );
    assert_eq!(
        bob.recv().await,
        OutboundEvent::PeerDisconnected {
            userid: "alice".to_string()
        }
    );

    // Both sessions survive; only the edge is gone. A new message simply
    // rendezvouses again.
    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").build())
        .await;
    alice.expect_peer_connected("bob").await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;

    relay.cancel();
}

#[tokio::test]
async fn test_disconnect_of_unknown_connection_is_a_no_op() {
    let relay = test_relay("relay-1");
    let _alice = TestClient::register(&relay, 1, "alice").await;

    relay
        .disconnect(common::types::ConnectionId(99))
        .await
        .unwrap();

    assert_eq!(relay.status().await.unwrap().sessions, 1);

    relay.cancel();
}

// ============================================================================
// Registry semantics
// ============================================================================

#[tokio::test]
async fn test_reconnect_under_same_identity_resets_the_session() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").build())
        .await;
    alice.expect_peer_connected("bob").await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;

    relay
        .set_password(bob.connection_id(), "s3cret".to_string().into())
        .await
        .unwrap();

    // Bob reconnects under the same identity: the replacement session has
    // no edges, no flags and no password.
    let mut bob2 = TestClient::register(&relay, 3, "bob").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").join().build())
        .await;

    // The gate no longer applies, so alice is not challenged. Her edge to
    // "bob" still points at the first connection though, and that is where
    // the join lands; stale edges are never revalidated.
    alice.assert_silent();
    let message = bob.expect_message().await;
    assert_eq!(message.sender, "alice");
    bob2.assert_silent();

    relay.cancel();
}

#[tokio::test]
async fn test_extra_update_broadcasts_to_connected_peers() {
    let relay = test_relay("relay-1");
    let mut alice = TestClient::register(&relay, 1, "alice").await;
    let mut bob = TestClient::register(&relay, 2, "bob").await;
    let mut carol = TestClient::register(&relay, 3, "carol").await;

    alice
        .send(&relay, EnvelopeBuilder::new("alice", "bob").build())
        .await;
    alice.expect_peer_connected("bob").await;
    bob.expect_peer_connected("alice").await;
    let _ = bob.expect_message().await;

    relay
        .update_extra(alice.connection_id(), json!({"muted": true}))
        .await
        .unwrap();

    assert_eq!(
        bob.recv().await,
        OutboundEvent::ExtraDataUpdated {
            userid: "alice".to_string(),
            extra: json!({"muted": true})
        }
    );
    // Carol never exchanged a message with alice and hears nothing.
    carol.assert_silent();

    relay.cancel();
}

#[tokio::test]
async fn test_many_identities_route_independently() {
    let relay = test_relay("relay-1");

    let hub = TestClient::register(&relay, 0, "hub").await;
    let mut spokes = Vec::new();
    for n in 1..=8u64 {
        let userid = random_userid("spoke");
        let client = TestClient::register(&relay, n, userid).await;
        hub.send(
            &relay,
            EnvelopeBuilder::new("hub", client.userid()).build(),
        )
        .await;
        spokes.push(client);
    }

    for spoke in &mut spokes {
        spoke.expect_peer_connected("hub").await;
        let message = spoke.expect_message().await;
        assert_eq!(message.remote_user_id, spoke.userid());
    }

    let status = relay.status().await.unwrap();
    assert_eq!(status.sessions, 9);

    relay.cancel();
}
