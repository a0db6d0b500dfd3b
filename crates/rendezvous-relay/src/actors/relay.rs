//! `RelayActor` - the singleton dispatcher that owns all relay state.
//!
//! The actor owns the session registry, the connection graph, pending join
//! retries, per-connection password attempt counters and deferred
//! moderation handoffs. Commands are processed one at a time in arrival
//! order, so every command's mutations are atomic relative to all others;
//! transport tasks and retry timers interact with the state exclusively
//! through [`RelayActorHandle`].
//!
//! # Lazy rendezvous
//!
//! Connection-graph edges are not pre-declared. The first message routed
//! between two live identities creates both directed edges (each capturing
//! the other side's handle at that moment) and notifies both ends with
//! `peer-connected`. Edges are never revalidated afterward: a peer that
//! reconnects under the same identity without an explicit disconnect leaves
//! the old handle on existing edges, and forwarding through it fails as a
//! logged drop. This mirrors the protocol this relay is compatible with.

use crate::errors::RelayError;

use super::messages::{
    Envelope, MessageKind, OutboundEvent, PublicModerator, RelayCommand, RelayStatus, RouteAck,
    SYSTEM_RECIPIENT,
};
use super::metrics::RelayMetrics;
use super::retry::spawn_join_timer;
use super::session::{ClientHandle, Session};

use common::secret::{ExposeSecret, SecretString};
use common::types::{ConnectionId, ExtraData};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the dispatcher mailbox.
const RELAY_CHANNEL_BUFFER: usize = 1024;

/// Tunables for the dispatcher, derived from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Rejected password attempts allowed before short-circuiting.
    pub max_password_tries: u32,
    /// Ticks a pending join waits for its target before timing out.
    pub join_retry_ticks: u32,
    /// Interval between join retry ticks.
    pub join_retry_interval: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_password_tries: crate::config::DEFAULT_MAX_PASSWORD_TRIES,
            join_retry_ticks: crate::config::DEFAULT_JOIN_RETRY_TICKS,
            join_retry_interval: Duration::from_millis(
                crate::config::DEFAULT_JOIN_RETRY_INTERVAL_MS,
            ),
        }
    }
}

impl From<&crate::config::Config> for RelaySettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            max_password_tries: config.max_password_tries,
            join_retry_ticks: config.join_retry_ticks,
            join_retry_interval: Duration::from_millis(config.join_retry_interval_ms),
        }
    }
}

/// Handle to the `RelayActor`.
///
/// This is the public interface for interacting with the dispatcher. All
/// methods are async; request/response operations return their value via a
/// oneshot channel.
#[derive(Clone)]
pub struct RelayActorHandle {
    sender: mpsc::Sender<RelayCommand>,
    cancel_token: CancellationToken,
}

impl RelayActorHandle {
    /// Create a new `RelayActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(relay_id: String, settings: RelaySettings, metrics: Arc<RelayMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(RELAY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RelayActor::new(
            relay_id,
            settings,
            receiver,
            sender.clone(),
            cancel_token.clone(),
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Register (or re-register) an identity for a connection.
    pub async fn connect(
        &self,
        userid: String,
        handle: ClientHandle,
        message_event: String,
    ) -> Result<(), RelayError> {
        self.send(RelayCommand::Connect {
            userid,
            handle,
            message_event,
        })
        .await
    }

    /// Replace the connection's session metadata and notify its peers.
    pub async fn update_extra(
        &self,
        connection_id: ConnectionId,
        extra: ExtraData,
    ) -> Result<(), RelayError> {
        self.send(RelayCommand::UpdateExtra {
            connection_id,
            extra,
        })
        .await
    }

    /// Flag the connection's session as a discoverable public moderator.
    pub async fn become_public_moderator(
        &self,
        connection_id: ConnectionId,
    ) -> Result<(), RelayError> {
        self.send(RelayCommand::BecomePublicModerator { connection_id })
            .await
    }

    /// Query public moderators whose id starts with `prefix` (empty = all),
    /// in discovery order, excluding the caller.
    pub async fn get_public_moderators(
        &self,
        connection_id: ConnectionId,
        prefix: String,
    ) -> Result<Vec<PublicModerator>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::GetPublicModerators {
            connection_id,
            prefix,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Rename the connection's identity. Silent when the connection does
    /// not own the claimed identity.
    pub async fn rename(
        &self,
        handle: ClientHandle,
        message_event: String,
        new_userid: String,
    ) -> Result<(), RelayError> {
        self.send(RelayCommand::Rename {
            handle,
            message_event,
            new_userid,
        })
        .await
    }

    /// Set the password gating joins to the connection's identity.
    pub async fn set_password(
        &self,
        connection_id: ConnectionId,
        password: SecretString,
    ) -> Result<(), RelayError> {
        self.send(RelayCommand::SetPassword {
            connection_id,
            password,
        })
        .await
    }

    /// Sever the edge between the caller and `target` in both directions.
    pub async fn disconnect_with(
        &self,
        connection_id: ConnectionId,
        target: String,
    ) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::DisconnectWith {
            connection_id,
            target,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Route one addressed envelope from a connection.
    pub async fn route(
        &self,
        envelope: Envelope,
        inbound: ClientHandle,
        message_event: String,
    ) -> Result<RouteAck, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::Route {
            envelope,
            inbound,
            message_event,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Departure notification for a connection.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), RelayError> {
        self.send(RelayCommand::Disconnect { connection_id }).await
    }

    /// Get a point-in-time view of the dispatcher's state.
    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::GetStatus { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (for shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for tasks that should stop with the relay.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    async fn send(&self, command: RelayCommand) -> Result<(), RelayError> {
        self.sender
            .send(command)
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }
}

/// A join request waiting for its target to appear.
#[derive(Debug)]
struct PendingJoin {
    /// The original envelope, re-delivered once when the target registers.
    envelope: Envelope,
    /// Ticks left before the join times out.
    ticks_remaining: u32,
    /// Cancels the retry timer task.
    cancel: CancellationToken,
}

/// The `RelayActor` implementation.
pub struct RelayActor {
    /// Relay instance ID.
    relay_id: String,
    /// Dispatcher tunables.
    settings: RelaySettings,
    /// Command receiver.
    receiver: mpsc::Receiver<RelayCommand>,
    /// Command sender, cloned into retry timer tasks.
    sender: mpsc::Sender<RelayCommand>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    /// Session registry, in discovery order.
    sessions: IndexMap<String, Session>,
    /// Transport connection -> the identity it registered.
    connections: HashMap<ConnectionId, String>,
    /// Moderator id -> handoff envelope deferred to departure.
    deferred_handoffs: HashMap<String, Envelope>,
    /// Rejected password attempts per inbound connection.
    password_tries: HashMap<ConnectionId, u32>,
    /// (requester, target) -> join waiting for the target to appear.
    pending_joins: HashMap<(String, String), PendingJoin>,
    /// Shared metrics.
    metrics: Arc<RelayMetrics>,
}

impl RelayActor {
    fn new(
        relay_id: String,
        settings: RelaySettings,
        receiver: mpsc::Receiver<RelayCommand>,
        sender: mpsc::Sender<RelayCommand>,
        cancel_token: CancellationToken,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            relay_id,
            settings,
            receiver,
            sender,
            cancel_token,
            sessions: IndexMap::new(),
            connections: HashMap::new(),
            deferred_handoffs: HashMap::new(),
            password_tries: HashMap::new(),
            pending_joins: HashMap::new(),
            metrics,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "relay.dispatcher", fields(relay_id = %self.relay_id))]
    async fn run(mut self) {
        info!(
            target: "relay.dispatcher",
            relay_id = %self.relay_id,
            "RelayActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.dispatcher",
                        relay_id = %self.relay_id,
                        "RelayActor received cancellation signal"
                    );
                    break;
                }

                cmd = self.receiver.recv() => {
                    match cmd {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            info!(
                                target: "relay.dispatcher",
                                relay_id = %self.relay_id,
                                "RelayActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.dispatcher",
            relay_id = %self.relay_id,
            sessions = self.sessions.len(),
            pending_joins = self.pending_joins.len(),
            "RelayActor stopped"
        );
    }

    /// Handle a single command.
    async fn handle_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Connect {
                userid,
                handle,
                message_event,
            } => {
                self.handle_connect(userid, handle, message_event);
            }

            RelayCommand::UpdateExtra {
                connection_id,
                extra,
            } => {
                self.handle_update_extra(connection_id, extra).await;
            }

            RelayCommand::BecomePublicModerator { connection_id } => {
                if let Some(session) = self.session_for_connection_mut(connection_id) {
                    session.is_public_moderator = true;
                }
            }

            RelayCommand::GetPublicModerators {
                connection_id,
                prefix,
                respond_to,
            } => {
                let list = self.public_moderators(connection_id, &prefix);
                let _ = respond_to.send(list);
            }

            RelayCommand::Rename {
                handle,
                message_event,
                new_userid,
            } => {
                self.handle_rename(handle, message_event, new_userid);
            }

            RelayCommand::SetPassword {
                connection_id,
                password,
            } => {
                if let Some(session) = self.session_for_connection_mut(connection_id) {
                    session.password = Some(password);
                }
            }

            RelayCommand::DisconnectWith {
                connection_id,
                target,
                respond_to,
            } => {
                self.handle_disconnect_with(connection_id, &target).await;
                let _ = respond_to.send(());
            }

            RelayCommand::Route {
                envelope,
                inbound,
                message_event,
                respond_to,
            } => {
                self.handle_route(envelope, inbound, message_event, respond_to)
                    .await;
            }

            RelayCommand::RetryTick { requester, target } => {
                self.handle_retry_tick(requester, target).await;
            }

            RelayCommand::Disconnect { connection_id } => {
                self.handle_disconnect(connection_id).await;
            }

            RelayCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(RelayStatus {
                    relay_id: self.relay_id.clone(),
                    sessions: self.sessions.len(),
                    pending_joins: self.pending_joins.len(),
                    deferred_handoffs: self.deferred_handoffs.len(),
                });
            }
        }
    }

    fn handle_connect(&mut self, userid: String, handle: ClientHandle, message_event: String) {
        info!(
            target: "relay.registry",
            userid = %userid,
            connection_id = %handle.connection_id(),
            "Session registered"
        );

        self.connections.insert(handle.connection_id(), userid.clone());
        // Wholesale replacement: a reconnect under the same identity starts
        // with no edges, no flags and no password.
        self.sessions
            .insert(userid, Session::new(handle, message_event));
        self.metrics.set_active_sessions(self.sessions.len());
    }

    async fn handle_update_extra(&mut self, connection_id: ConnectionId, extra: ExtraData) {
        let Some(userid) = self.connections.get(&connection_id).cloned() else {
            return;
        };

        let peers = {
            let Some(session) = self.sessions.get_mut(&userid) else {
                return;
            };
            session.extra = extra.clone();
            session.connected_with.keys().cloned().collect::<Vec<_>>()
        };

        // Notify each connected peer's current session handle; peers whose
        // session is gone are skipped.
        for peer in peers {
            if let Some(peer_session) = self.sessions.get(&peer) {
                let _ = peer_session
                    .handle
                    .deliver(OutboundEvent::ExtraDataUpdated {
                        userid: userid.clone(),
                        extra: extra.clone(),
                    })
                    .await;
            }
        }
    }

    fn handle_rename(&mut self, handle: ClientHandle, message_event: String, new_userid: String) {
        let connection_id = handle.connection_id();

        if let Some(old_userid) = self.connections.get(&connection_id).cloned() {
            let owns = self
                .sessions
                .get(&old_userid)
                .is_some_and(|s| s.handle.connection_id() == connection_id);

            if owns {
                if new_userid == old_userid {
                    return;
                }
                if let Some(session) = self.sessions.shift_remove(&old_userid) {
                    info!(
                        target: "relay.registry",
                        old_userid = %old_userid,
                        new_userid = %new_userid,
                        "Session renamed"
                    );
                    self.sessions.insert(new_userid.clone(), session);
                    self.connections.insert(connection_id, new_userid);
                }
                return;
            }
        }

        // The connection does not own the identity on file: the rename is
        // silently ignored and the connection starts over under the new id
        // with a fresh anonymous session.
        debug!(
            target: "relay.registry",
            connection_id = %connection_id,
            new_userid = %new_userid,
            "Rename with mismatched handle; starting fresh session"
        );
        self.connections.insert(connection_id, new_userid.clone());
        self.sessions
            .insert(new_userid, Session::new(handle, message_event));
        self.metrics.set_active_sessions(self.sessions.len());
    }

    async fn handle_disconnect_with(&mut self, connection_id: ConnectionId, target: &str) {
        let Some(requester) = self.connections.get(&connection_id).cloned() else {
            return;
        };

        let own_edge = self
            .sessions
            .get_mut(&requester)
            .and_then(|s| s.connected_with.remove(target).map(|_| s.handle.clone()));
        if let Some(handle) = own_edge {
            let _ = handle
                .deliver(OutboundEvent::PeerDisconnected {
                    userid: target.to_string(),
                })
                .await;
        }

        let back_edge = self
            .sessions
            .get_mut(target)
            .and_then(|s| s.connected_with.remove(&requester).map(|_| s.handle.clone()));
        if let Some(handle) = back_edge {
            let _ = handle
                .deliver(OutboundEvent::PeerDisconnected { userid: requester })
                .await;
        }
    }

    async fn handle_route(
        &mut self,
        envelope: Envelope,
        inbound: ClientHandle,
        message_event: String,
        respond_to: oneshot::Sender<RouteAck>,
    ) {
        let kind = MessageKind::resolve(&envelope);

        if kind == MessageKind::JoinRequest
            && envelope.remote_user_id != SYSTEM_RECIPIENT
            && !self.apply_password_gate(&envelope, &inbound).await
        {
            let _ = respond_to.send(RouteAck::Accepted);
            return;
        }

        let is_join = kind == MessageKind::JoinRequest;

        match kind {
            MessageKind::ModerationHandoff {
                fired_on_leave: true,
            } => {
                // At most one pending handoff per moderator; a new arrival
                // overwrites rather than queues.
                debug!(
                    target: "relay.router",
                    moderator = %envelope.sender,
                    "Moderation handoff deferred to departure"
                );
                self.deferred_handoffs
                    .insert(envelope.sender.clone(), envelope);
                let _ = respond_to.send(RouteAck::Accepted);
                return;
            }

            MessageKind::ModerationHandoff {
                fired_on_leave: false,
            } => {
                self.deliver(envelope).await;
                let _ = respond_to.send(RouteAck::Accepted);
                return;
            }

            MessageKind::PresenceProbe { target } => {
                let own_id = self
                    .connections
                    .get(&inbound.connection_id())
                    .cloned()
                    .unwrap_or_else(|| envelope.sender.clone());
                // An identity cannot detect its own presence via this path.
                let present = target != own_id && self.sessions.contains_key(&target);
                let _ = respond_to.send(RouteAck::Presence {
                    userid: target,
                    present,
                });
                return;
            }

            MessageKind::JoinRequest | MessageKind::Plain => {}
        }

        self.ensure_sender(&envelope, &inbound, &message_event);
        self.deliver(envelope.clone()).await;

        // The join target has not appeared yet: park the envelope and keep
        // checking once per tick, up to the retry budget.
        if is_join && !self.has_edge(&envelope.sender, &envelope.remote_user_id) {
            self.arm_join_retry(envelope);
        }

        let _ = respond_to.send(RouteAck::Accepted);
    }

    /// Apply the password gate to a join request. Returns true when routing
    /// may proceed.
    async fn apply_password_gate(&mut self, envelope: &Envelope, inbound: &ClientHandle) -> bool {
        let target = &envelope.remote_user_id;
        let Some(expected) = self
            .sessions
            .get(target)
            .and_then(|s| s.password.as_ref().cloned())
        else {
            // No password on the target: the gate does not apply.
            return true;
        };

        let connection_id = inbound.connection_id();
        let tries = self.password_tries.get(&connection_id).copied().unwrap_or(0);

        // Failures 1..=max are rejected individually with specific
        // feedback; everything after is short-circuited without even
        // consulting the supplied password.
        if tries >= self.settings.max_password_tries {
            let _ = inbound
                .deliver(OutboundEvent::MaxTriesExceeded {
                    userid: target.clone(),
                })
                .await;
            self.metrics.record_join_rejected();
            return false;
        }

        match &envelope.password {
            None => {
                self.password_tries.insert(connection_id, tries + 1);
                let _ = inbound
                    .deliver(OutboundEvent::PasswordRequired {
                        userid: target.clone(),
                    })
                    .await;
                self.metrics.record_join_rejected();
                false
            }
            Some(supplied) if supplied.expose_secret() != expected.expose_secret() => {
                self.password_tries.insert(connection_id, tries + 1);
                let _ = inbound
                    .deliver(OutboundEvent::InvalidPassword {
                        userid: target.clone(),
                        password: supplied.expose_secret().to_string(),
                    })
                    .await;
                self.metrics.record_join_rejected();
                false
            }
            Some(_) => true,
        }
    }

    /// Create an anonymous session for an unseen sender, bound to the
    /// inbound connection.
    fn ensure_sender(&mut self, envelope: &Envelope, inbound: &ClientHandle, message_event: &str) {
        if self.sessions.contains_key(&envelope.sender) {
            return;
        }
        debug!(
            target: "relay.registry",
            userid = %envelope.sender,
            connection_id = %inbound.connection_id(),
            "Implicitly registering unseen sender"
        );
        self.sessions.insert(
            envelope.sender.clone(),
            Session::new(inbound.clone(), message_event.to_string()),
        );
        self.metrics.set_active_sessions(self.sessions.len());
    }

    /// The forwarding step: rendezvous if needed, then forward along the
    /// sender's edge with the sender's current extra stamped in.
    async fn deliver(&mut self, envelope: Envelope) {
        let sender_id = envelope.sender;
        let target_id = envelope.remote_user_id;

        if !self.sessions.contains_key(&sender_id) {
            warn!(
                target: "relay.router",
                sender = %sender_id,
                recipient = %target_id,
                "Dropping message from unknown sender"
            );
            self.metrics.record_message_dropped();
            return;
        }

        if !self.has_edge(&sender_id, &target_id) {
            if let Some(target_handle) = self.sessions.get(&target_id).map(|t| t.handle.clone()) {
                let Some(sender_handle) = self.sessions.get(&sender_id).map(|s| s.handle.clone())
                else {
                    return;
                };

                if let Some(sender) = self.sessions.get_mut(&sender_id) {
                    sender
                        .connected_with
                        .insert(target_id.clone(), target_handle.clone());
                }
                if let Some(target) = self.sessions.get_mut(&target_id) {
                    target
                        .connected_with
                        .insert(sender_id.clone(), sender_handle.clone());
                }

                info!(
                    target: "relay.router",
                    a = %sender_id,
                    b = %target_id,
                    "Rendezvous established"
                );
                self.metrics.record_rendezvous();

                let _ = sender_handle
                    .deliver(OutboundEvent::PeerConnected {
                        userid: target_id.clone(),
                    })
                    .await;
                let _ = target_handle
                    .deliver(OutboundEvent::PeerConnected {
                        userid: sender_id.clone(),
                    })
                    .await;
            }
        }

        let forward = self.sessions.get(&sender_id).and_then(|s| {
            s.connected_with
                .get(&target_id)
                .map(|edge| (edge.clone(), s.message_event.clone(), s.extra.clone()))
        });

        match forward {
            Some((edge, event, extra)) => {
                let message = super::messages::ForwardedMessage {
                    sender: sender_id,
                    remote_user_id: target_id,
                    payload: envelope.payload,
                    extra,
                };
                if edge
                    .deliver(OutboundEvent::Message { event, message })
                    .await
                {
                    self.metrics.record_message_routed();
                } else {
                    // Stale edge handle: the peer's connection is gone.
                    self.metrics.record_message_dropped();
                }
            }
            None => {
                debug!(
                    target: "relay.router",
                    sender = %sender_id,
                    recipient = %target_id,
                    "No edge and no live recipient; message not forwarded"
                );
            }
        }
    }

    fn has_edge(&self, from: &str, to: &str) -> bool {
        self.sessions
            .get(from)
            .is_some_and(|s| s.connected_with.contains_key(to))
    }

    fn arm_join_retry(&mut self, envelope: Envelope) {
        let key = (envelope.sender.clone(), envelope.remote_user_id.clone());

        // Re-arming replaces the previous pending join for this pair.
        if let Some(previous) = self.pending_joins.remove(&key) {
            previous.cancel.cancel();
        }

        debug!(
            target: "relay.retry",
            requester = %key.0,
            join_target = %key.1,
            ticks = self.settings.join_retry_ticks,
            "Join target absent; arming retry timer"
        );

        let cancel = self.cancel_token.child_token();
        // Detached task, stopped via the token.
        let _timer = spawn_join_timer(
            self.sender.clone(),
            key.0.clone(),
            key.1.clone(),
            self.settings.join_retry_interval,
            cancel.clone(),
        );

        self.pending_joins.insert(
            key,
            PendingJoin {
                envelope,
                ticks_remaining: self.settings.join_retry_ticks,
                cancel,
            },
        );
    }

    async fn handle_retry_tick(&mut self, requester: String, target: String) {
        let key = (requester, target);
        if !self.pending_joins.contains_key(&key) {
            // Tick raced a terminal condition; nothing to do.
            return;
        }

        if self.sessions.contains_key(&key.1) {
            if let Some(pending) = self.pending_joins.remove(&key) {
                pending.cancel.cancel();
                info!(
                    target: "relay.retry",
                    requester = %key.0,
                    join_target = %key.1,
                    "Join target appeared; completing rendezvous"
                );
                self.deliver(pending.envelope).await;
            }
            return;
        }

        let exhausted = match self.pending_joins.get_mut(&key) {
            Some(pending) => {
                // Saturating: a zero-tick budget exhausts on the first tick.
                pending.ticks_remaining = pending.ticks_remaining.saturating_sub(1);
                pending.ticks_remaining == 0
            }
            None => return,
        };

        if exhausted {
            if let Some(pending) = self.pending_joins.remove(&key) {
                pending.cancel.cancel();
            }
            info!(
                target: "relay.retry",
                requester = %key.0,
                join_target = %key.1,
                "Join target never appeared; giving up"
            );
            self.metrics.record_join_timed_out();

            if let Some(session) = self.sessions.get(&key.0) {
                let _ = session
                    .handle
                    .deliver(OutboundEvent::JoinTimedOut {
                        userid: key.1.clone(),
                    })
                    .await;
            }
        }
    }

    async fn handle_disconnect(&mut self, connection_id: ConnectionId) {
        self.password_tries.remove(&connection_id);

        let Some(userid) = self.connections.remove(&connection_id) else {
            return;
        };

        let deferral = self.deferred_handoffs.remove(&userid);

        // Notify every connected peer exactly once (via the stored edge
        // handle) and sever the peer's back edge.
        if let Some(session) = self.sessions.get(&userid) {
            let peers: Vec<(String, ClientHandle)> = session
                .connected_with
                .iter()
                .map(|(peer, edge)| (peer.clone(), edge.clone()))
                .collect();

            for (peer, edge) in peers {
                let _ = edge
                    .deliver(OutboundEvent::PeerDisconnected {
                        userid: userid.clone(),
                    })
                    .await;

                if let Some(peer_session) = self.sessions.get_mut(&peer) {
                    peer_session.connected_with.remove(&userid);
                }
            }
        }

        // The departing identity still counts as registered while its
        // deferred handoff is routed.
        if let Some(envelope) = deferral {
            info!(
                target: "relay.router",
                moderator = %userid,
                "Delivering deferred moderation handoff"
            );
            self.deliver(envelope).await;
        }

        if self.sessions.shift_remove(&userid).is_some() {
            info!(
                target: "relay.registry",
                userid = %userid,
                connection_id = %connection_id,
                "Session removed"
            );
        }
        self.metrics.set_active_sessions(self.sessions.len());
    }

    fn session_for_connection_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Session> {
        let userid = self.connections.get(&connection_id)?;
        self.sessions.get_mut(userid)
    }

    fn public_moderators(
        &self,
        connection_id: ConnectionId,
        prefix: &str,
    ) -> Vec<PublicModerator> {
        let caller = self.connections.get(&connection_id);

        self.sessions
            .iter()
            .filter(|(userid, session)| {
                session.is_public_moderator
                    && userid.starts_with(prefix)
                    && caller != Some(userid)
            })
            .map(|(userid, session)| PublicModerator {
                userid: userid.clone(),
                extra: session.extra.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_handle() -> RelayActorHandle {
        RelayActorHandle::new(
            "relay-test".to_string(),
            RelaySettings::default(),
            RelayMetrics::new(),
        )
    }

    fn client(id: u64) -> (ClientHandle, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (ClientHandle::new(ConnectionId(id), tx), rx)
    }

    fn plain(sender: &str, target: &str, payload: serde_json::Value) -> Envelope {
        Envelope {
            sender: sender.to_string(),
            remote_user_id: target.to_string(),
            payload,
            password: None,
            extra: common::types::empty_extra(),
        }
    }

    #[tokio::test]
    async fn test_rendezvous_and_forwarding() {
        let relay = test_handle();
        let (alice, mut alice_rx) = client(1);
        let (bob, mut bob_rx) = client(2);

        relay
            .connect("alice".to_string(), alice.clone(), "ev".to_string())
            .await
            .unwrap();
        relay
            .connect("bob".to_string(), bob.clone(), "ev".to_string())
            .await
            .unwrap();

        let ack = relay
            .route(
                plain("alice", "bob", json!({"sdp": "offer"})),
                alice.clone(),
                "ev".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(ack, RouteAck::Accepted);

        assert_eq!(
            alice_rx.recv().await,
            Some(OutboundEvent::PeerConnected {
                userid: "bob".to_string()
            })
        );
        assert_eq!(
            bob_rx.recv().await,
            Some(OutboundEvent::PeerConnected {
                userid: "alice".to_string()
            })
        );

        match bob_rx.recv().await {
            Some(OutboundEvent::Message { event, message }) => {
                assert_eq!(event, "ev");
                assert_eq!(message.sender, "alice");
                assert_eq!(message.payload, json!({"sdp": "offer"}));
            }
            other => panic!("expected forwarded message, got {other:?}"),
        }

        relay.cancel();
    }

    #[tokio::test]
    async fn test_message_to_absent_recipient_is_not_forwarded() {
        let relay = test_handle();
        let (alice, mut alice_rx) = client(1);

        relay
            .connect("alice".to_string(), alice.clone(), "ev".to_string())
            .await
            .unwrap();
        relay
            .route(
                plain("alice", "ghost", json!({"hello": 1})),
                alice.clone(),
                "ev".to_string(),
            )
            .await
            .unwrap();

        // No rendezvous, no forwarding, no error: just silence.
        let status = relay.status().await.unwrap();
        assert_eq!(status.pending_joins, 0);
        assert!(alice_rx.try_recv().is_err());

        relay.cancel();
    }

    #[tokio::test]
    async fn test_message_from_unregistered_sender_is_dropped() {
        let metrics = RelayMetrics::new();
        let relay = RelayActorHandle::new(
            "relay-test".to_string(),
            RelaySettings::default(),
            Arc::clone(&metrics),
        );
        let (bob, mut bob_rx) = client(1);
        relay
            .connect("bob".to_string(), bob.clone(), "ev".to_string())
            .await
            .unwrap();

        // An immediate moderation handoff skips implicit registration, so
        // the forwarding step sees a sender with no session and drops it.
        let (ghost, _ghost_rx) = client(2);
        relay
            .route(
                plain(
                    "ghost",
                    "bob",
                    json!({"shiftedModerationControl": true, "firedOnLeave": false}),
                ),
                ghost,
                "ev".to_string(),
            )
            .await
            .unwrap();

        let status = relay.status().await.unwrap();
        assert_eq!(status.sessions, 1);
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().messages_dropped, 1);

        relay.cancel();
    }

    #[tokio::test]
    async fn test_rename_moves_session_for_owning_connection() {
        let relay = test_handle();
        let (alice, _alice_rx) = client(1);

        relay
            .connect("alice".to_string(), alice.clone(), "ev".to_string())
            .await
            .unwrap();
        relay
            .rename(alice.clone(), "ev".to_string(), "alice2".to_string())
            .await
            .unwrap();

        // Presence probe from another connection sees the new id only.
        let (probe, _probe_rx) = client(2);
        relay
            .connect("probe".to_string(), probe.clone(), "ev".to_string())
            .await
            .unwrap();

        let ack = relay
            .route(
                plain(
                    "probe",
                    "system",
                    json!({"detectPresence": true, "userid": "alice2"}),
                ),
                probe.clone(),
                "ev".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(
            ack,
            RouteAck::Presence {
                userid: "alice2".to_string(),
                present: true
            }
        );

        let ack = relay
            .route(
                plain(
                    "probe",
                    "system",
                    json!({"detectPresence": true, "userid": "alice"}),
                ),
                probe.clone(),
                "ev".to_string(),
            )
            .await
            .unwrap();
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
    async fn test_rename_with_foreign_handle_starts_fresh_session() {
        let relay = test_handle();
        let (alice, _alice_rx) = client(1);
        let (intruder, _intruder_rx) = client(2);

        relay
            .connect("alice".to_string(), alice.clone(), "ev".to_string())
            .await
            .unwrap();
        // The intruder registers, then its connection entry is made to
        // claim alice's identity by registering under it from a different
        // connection. The rename guard compares handles, not names.
        relay
            .connect("alice".to_string(), intruder.clone(), "ev".to_string())
            .await
            .unwrap();

        // alice's original connection no longer owns the session on file,
        // so its rename silently creates a fresh session instead of moving
        // the registered one.
        relay
            .rename(alice.clone(), "ev".to_string(), "alice-renamed".to_string())
            .await
            .unwrap();

        let (probe, _probe_rx) = client(3);
        relay
            .connect("probe".to_string(), probe.clone(), "ev".to_string())
            .await
            .unwrap();

        // Both ids exist: "alice" (still owned by the intruder's
        // connection) and the fresh "alice-renamed".
        let ack = relay
            .route(
                plain(
                    "probe",
                    "system",
                    json!({"detectPresence": true, "userid": "alice"}),
                ),
                probe.clone(),
                "ev".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(
            ack,
            RouteAck::Presence {
                userid: "alice".to_string(),
                present: true
            }
        );

        let ack = relay
            .route(
                plain(
                    "probe",
                    "system",
                    json!({"detectPresence": true, "userid": "alice-renamed"}),
                ),
                probe,
                "ev".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(
            ack,
            RouteAck::Presence {
                userid: "alice-renamed".to_string(),
                present: true
            }
        );

        relay.cancel();
    }

    #[tokio::test]
    async fn test_public_moderators_in_discovery_order_excluding_caller() {
        let relay = test_handle();
        let (m1, _rx1) = client(1);
        let (m2, _rx2) = client(2);
        let (caller, _rx3) = client(3);

        relay
            .connect("mod-bravo".to_string(), m1.clone(), "ev".to_string())
            .await
            .unwrap();
        relay
            .connect("mod-alpha".to_string(), m2.clone(), "ev".to_string())
            .await
            .unwrap();
        relay
            .connect("mod-caller".to_string(), caller.clone(), "ev".to_string())
            .await
            .unwrap();

        for handle in [&m1, &m2, &caller] {
            relay
                .become_public_moderator(handle.connection_id())
                .await
                .unwrap();
        }

        let list = relay
            .get_public_moderators(caller.connection_id(), "mod-".to_string())
            .await
            .unwrap();

        // Discovery order, not lexicographic; the caller is excluded.
        let ids: Vec<&str> = list.iter().map(|m| m.userid.as_str()).collect();
        assert_eq!(ids, vec!["mod-bravo", "mod-alpha"]);

        let filtered = relay
            .get_public_moderators(caller.connection_id(), "mod-a".to_string())
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].userid, "mod-alpha");

        relay.cancel();
    }

    #[tokio::test]
    async fn test_status_counts() {
        let relay = test_handle();
        let (alice, _rx) = client(1);

        relay
            .connect("alice".to_string(), alice.clone(), "ev".to_string())
            .await
            .unwrap();
        relay
            .route(
                plain(
                    "alice",
                    "mod",
                    json!({"shiftedModerationControl": true, "firedOnLeave": true}),
                ),
                alice.clone(),
                "ev".to_string(),
            )
            .await
            .unwrap();

        let status = relay.status().await.unwrap();
        assert_eq!(status.relay_id, "relay-test");
        assert_eq!(status.sessions, 1);
        assert_eq!(status.deferred_handoffs, 1);
        assert_eq!(status.pending_joins, 0);

        relay.cancel();
    }

    #[tokio::test]
    async fn test_cancellation() {
        let relay = test_handle();
        assert!(!relay.is_cancelled());
        relay.cancel();
        assert!(relay.is_cancelled());
    }
}
