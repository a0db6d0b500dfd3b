//! WebSocket endpoint for relay clients.
//!
//! Each accepted socket becomes one connection: it is assigned a
//! `ConnectionId`, registered with the dispatcher under the identity from
//! the `userid` query parameter (or a generated UUID), and served by two
//! tasks. The read loop parses client frames and turns them into dispatcher
//! calls; a writer task drains the connection's outbound event channel and
//! the request/response channel into the socket.
//!
//! Query parameters:
//! - `userid` - identity to register; generated when absent
//! - `msgEvent` - event name for forwarded messages on this connection;
//!   falls back to the configured default

use crate::actors::{ClientHandle, Envelope, OutboundEvent, RelayActorHandle, RouteAck};
use crate::config::Config;
use crate::transport::wire::{server_frame, ClientFrame, ServerFrame};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::types::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Buffered outbound events per connection before the dispatcher starts
/// observing delivery failures.
const OUTBOUND_BUFFER: usize = 256;
/// Buffered request/response frames per connection.
const RESPONSE_BUFFER: usize = 16;

/// Shared state for the WebSocket router.
#[derive(Clone)]
pub struct WsState {
    relay: RelayActorHandle,
    config: Arc<Config>,
    next_connection_id: Arc<AtomicU64>,
}

impl WsState {
    #[must_use]
    pub fn new(relay: RelayActorHandle, config: Arc<Config>) -> Self {
        Self {
            relay,
            config,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Create the client-facing router with the WebSocket endpoint.
pub fn ws_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<WsState>,
) -> Response {
    let connection_id = ConnectionId(state.next_connection_id.fetch_add(1, Ordering::Relaxed));
    let userid = params
        .get("userid")
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let message_event = params
        .get("msgEvent")
        .cloned()
        .unwrap_or_else(|| state.config.message_event.clone());

    ws.on_upgrade(move |socket| {
        handle_connection(socket, state, connection_id, userid, message_event)
    })
}

async fn handle_connection(
    socket: WebSocket,
    state: WsState,
    connection_id: ConnectionId,
    userid: String,
    message_event: String,
) {
    info!(
        target: "relay.transport",
        connection_id = %connection_id,
        userid = %userid,
        message_event = %message_event,
        "Connection established"
    );

    let (out_tx, out_rx) = mpsc::channel::<OutboundEvent>(OUTBOUND_BUFFER);
    let (resp_tx, resp_rx) = mpsc::channel::<ServerFrame>(RESPONSE_BUFFER);
    let handle = ClientHandle::new(connection_id, out_tx);

    if state
        .relay
        .connect(userid.clone(), handle.clone(), message_event.clone())
        .await
        .is_err()
    {
        warn!(
            target: "relay.transport",
            connection_id = %connection_id,
            "Dispatcher unavailable, dropping connection"
        );
        return;
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, out_rx, resp_rx));

    let cancel = state.relay.child_token();
    read_loop(
        stream,
        &state,
        &handle,
        &message_event,
        &resp_tx,
        &cancel,
    )
    .await;

    // Departure cleanup runs whether the client closed, errored out or the
    // relay is shutting down.
    let _ = state.relay.disconnect(connection_id).await;
    writer.abort();

    info!(
        target: "relay.transport",
        connection_id = %connection_id,
        "Connection closed"
    );
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<OutboundEvent>,
    mut resp_rx: mpsc::Receiver<ServerFrame>,
) {
    loop {
        let frame = tokio::select! {
            event = out_rx.recv() => match event {
                Some(event) => server_frame(event),
                None => break,
            },
            response = resp_rx.recv() => match response {
                Some(response) => response,
                None => break,
            },
        };

        let Ok(text) = serde_json::to_string(&frame) else {
            continue;
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    state: &WsState,
    handle: &ClientHandle,
    message_event: &str,
    resp_tx: &mpsc::Sender<ServerFrame>,
    cancel: &CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(error) => {
                        debug!(
                            target: "relay.transport",
                            connection_id = %handle.connection_id(),
                            %error,
                            "Discarding malformed frame"
                        );
                        continue;
                    }
                };
                dispatch_frame(state, handle, message_event, resp_tx, frame).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // binary/ping/pong frames carry no protocol meaning
            Some(Err(error)) => {
                debug!(
                    target: "relay.transport",
                    connection_id = %handle.connection_id(),
                    %error,
                    "Socket error"
                );
                break;
            }
        }
    }
}

async fn dispatch_frame(
    state: &WsState,
    handle: &ClientHandle,
    message_event: &str,
    resp_tx: &mpsc::Sender<ServerFrame>,
    frame: ClientFrame,
) {
    let connection_id = handle.connection_id();

    match frame.event.as_str() {
        "extra-data-updated" => {
            let _ = state.relay.update_extra(connection_id, frame.data).await;
        }

        "become-public-moderator" => {
            let _ = state.relay.become_public_moderator(connection_id).await;
        }

        "get-public-moderators" => {
            let prefix = frame
                .data
                .get("userIdStartsWith")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Ok(list) = state.relay.get_public_moderators(connection_id, prefix).await {
                respond(resp_tx, frame.id, serde_json::to_value(list).unwrap_or(Value::Null))
                    .await;
            }
        }

        "rename" => {
            let Some(new_userid) = frame.data.get("userid").and_then(Value::as_str) else {
                return;
            };
            let _ = state
                .relay
                .rename(
                    handle.clone(),
                    message_event.to_string(),
                    new_userid.to_string(),
                )
                .await;
        }

        "set-password" => {
            let Some(password) = frame.data.get("password").and_then(Value::as_str) else {
                return;
            };
            let _ = state
                .relay
                .set_password(connection_id, password.to_string().into())
                .await;
        }

        "disconnect-with" => {
            let Some(target) = frame.data.get("remoteUserId").and_then(Value::as_str) else {
                return;
            };
            if state
                .relay
                .disconnect_with(connection_id, target.to_string())
                .await
                .is_ok()
            {
                respond(resp_tx, frame.id, json!({ "done": true })).await;
            }
        }

        event if event == message_event => {
            let envelope: Envelope = match serde_json::from_value(frame.data) {
                Ok(envelope) => envelope,
                Err(error) => {
                    debug!(
                        target: "relay.transport",
                        connection_id = %connection_id,
                        %error,
                        "Discarding malformed envelope"
                    );
                    return;
                }
            };

            match state
                .relay
                .route(envelope, handle.clone(), message_event.to_string())
                .await
            {
                Ok(RouteAck::Presence { userid, present }) => {
                    respond(
                        resp_tx,
                        frame.id,
                        json!({ "userid": userid, "present": present }),
                    )
                    .await;
                }
                Ok(RouteAck::Accepted) => {
                    respond(resp_tx, frame.id, json!({ "accepted": true })).await;
                }
                Err(_) => {}
            }
        }

        other => {
            debug!(
                target: "relay.transport",
                connection_id = %connection_id,
                event = %other,
                "Unknown frame event"
            );
        }
    }
}

/// Send a response frame when the client asked for one.
async fn respond(resp_tx: &mpsc::Sender<ServerFrame>, id: Option<u64>, data: Value) {
    if let Some(id) = id {
        let _ = resp_tx.send(ServerFrame::Response { id, data }).await;
    }
}
