//! WebSocket handling - the per-connection protocol state machine.
//!
//! Each transport connection is mapped to exactly one session at connect
//! time, replays its durable history, then handles message, heartbeat and
//! end-session events for the lifetime of the connection. Session ids on
//! inbound events are advisory and resolved through one deterministic
//! precedence order: event override, then the connection-bound id, then
//! rejection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use chatdock_protocol::{ClientMessage, MessageRole, ServerMessage, Session, SessionStatus};

use crate::persistence::{SessionStore, StoreError};
use crate::AppContext;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Human-readable notice sent with the `session_closed` event.
const SESSION_CLOSED_NOTICE: &str = "Session closed. Thanks for chatting with us!";

/// Content of the SYSTEM message appended on explicit end-session.
const SESSION_ENDED_MARKER: &str = "Session ended by visitor";

fn normalize_non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Connect-time identity, supplied by the client as query parameters.
/// Both values are advisory, never a trust boundary.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub visitor_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(ctx): State<Arc<AppContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, ctx))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, params: ConnectParams, ctx: Arc<AppContext>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        visitor_id = %params.visitor_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel for sending messages to this client
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let client_tx = outbound_tx.clone();

    // Resolve exactly one session for this connection. A store failure here
    // is fatal to the connection: notify, then drain and terminate with no
    // binding left behind.
    let session = match resolve_session(&ctx.store, &params).await {
        Ok(session) => session,
        Err(e) => {
            warn!(
                component = "session",
                event = "session.resolve.failed",
                connection_id = conn_id,
                visitor_id = %params.visitor_id,
                error = %e,
                "Session resolution failed, terminating connection"
            );
            send_json(
                &client_tx,
                ServerMessage::Error {
                    code: "resolution_failed".to_string(),
                    message: "could not resolve a session for this connection".to_string(),
                },
            )
            .await;
            drop(client_tx);
            drop(outbound_tx);
            let _ = send_task.await;
            return;
        }
    };

    // Register with the session registry before announcing the session, so
    // a message event sent by the client immediately on receiving the
    // announcement (or a concurrent broadcast) cannot be lost.
    let (broadcast_tx, broadcast_rx) = mpsc::channel::<ServerMessage>(100);
    ctx.registry.register(&session.id, conn_id, broadcast_tx);
    spawn_broadcast_forwarder(broadcast_rx, outbound_tx.clone());

    let mut bound_session_id = Some(session.id.clone());

    send_json(
        &client_tx,
        ServerMessage::Session {
            session_id: session.id.clone(),
            visitor_id: session.visitor_id.clone(),
            status: session.status,
        },
    )
    .await;

    // History replay, ascending, bounded; only when non-empty.
    match ctx.store.list_messages(&session.id, ctx.history_page_size).await {
        Ok(messages) if !messages.is_empty() => {
            send_json(&client_tx, ServerMessage::History { messages }).await;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(
                component = "session",
                event = "session.history.failed",
                connection_id = conn_id,
                session_id = %session.id,
                error = %e,
                "History replay failed"
            );
            send_json(
                &client_tx,
                ServerMessage::Error {
                    code: "history_failed".to_string(),
                    message: "could not load session history".to_string(),
                },
            )
            .await;
        }
    }

    // Connecting counts as activity.
    if let Err(e) = ctx.store.touch_session(&session.id).await {
        warn!(
            component = "session",
            event = "session.touch.failed",
            connection_id = conn_id,
            session_id = %session.id,
            error = %e,
            "Failed to refresh session activity on connect"
        );
    }

    // Handle incoming messages
    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    "Failed to parse client message"
                );
                send_json(
                    &client_tx,
                    ServerMessage::Error {
                        code: "parse_error".to_string(),
                        message: e.to_string(),
                    },
                )
                .await;
                continue;
            }
        };

        handle_client_message(client_msg, &mut bound_session_id, &client_tx, &ctx, conn_id).await;
    }

    if let Some(session_id) = &bound_session_id {
        ctx.registry.unregister(session_id, conn_id);
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

/// Send a ServerMessage through the outbound channel
async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

/// Forward registry broadcasts into this connection's outbound channel.
/// When the outbound channel closes (client disconnect), the task exits
/// and the registry prunes the dead sender on its next broadcast.
fn spawn_broadcast_forwarder(
    mut rx: mpsc::Receiver<ServerMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                break;
            }
        }
    });
}

/// Resolve the session to bind for a new connection.
///
/// Precedence: a supplied, still-open session id wins; then the visitor's
/// most recently created open session; then a fresh session. The claimed
/// values are advisory, so an unknown or closed claimed id simply falls
/// through to the next step.
async fn resolve_session(
    store: &SessionStore,
    params: &ConnectParams,
) -> Result<Session, StoreError> {
    if let Some(claimed) = normalize_non_empty(params.session_id.as_deref()) {
        if let Some(session) = store.find_session(claimed).await? {
            if session.status != SessionStatus::Closed {
                return Ok(session);
            }
        }
    }

    if let Some(session) = store.find_open_session_for_visitor(&params.visitor_id).await? {
        return Ok(session);
    }

    store.create_session(&params.visitor_id, None).await
}

/// Resolve the target session id for an inbound event: event override,
/// then connection-bound id.
fn resolve_target(override_id: Option<&str>, bound: &Option<String>) -> Option<String> {
    normalize_non_empty(override_id)
        .map(str::to_string)
        .or_else(|| bound.clone())
}

async fn handle_client_message(
    msg: ClientMessage,
    bound_session_id: &mut Option<String>,
    client_tx: &mpsc::Sender<OutboundMessage>,
    ctx: &Arc<AppContext>,
    conn_id: u64,
) {
    match msg {
        ClientMessage::Message {
            session_id,
            content,
            metadata,
        } => {
            handle_message(
                session_id,
                content,
                metadata,
                bound_session_id,
                client_tx,
                ctx,
                conn_id,
            )
            .await;
        }
        ClientMessage::Heartbeat { session_id } => {
            handle_heartbeat(session_id, bound_session_id, ctx, conn_id).await;
        }
        ClientMessage::EndSession { session_id } => {
            handle_end_session(session_id, bound_session_id, client_tx, ctx, conn_id).await;
        }
    }
}

/// A visitor chat turn: persist and echo the USER message, obtain a reply
/// from the responder, persist and echo the BOT message.
async fn handle_message(
    override_id: Option<String>,
    content: String,
    metadata: Option<Value>,
    bound_session_id: &Option<String>,
    client_tx: &mpsc::Sender<OutboundMessage>,
    ctx: &Arc<AppContext>,
    conn_id: u64,
) {
    let content = content.trim();
    if content.is_empty() {
        // Empty turns are dropped silently, not an error.
        return;
    }

    let Some(target_id) = resolve_target(override_id.as_deref(), bound_session_id) else {
        send_json(
            client_tx,
            ServerMessage::Error {
                code: "no_session".to_string(),
                message: "no session id resolvable for this event".to_string(),
            },
        )
        .await;
        return;
    };

    // Re-check status immediately before accepting content: CLOSED is
    // sticky and a closed session never accepts new turns, even from a
    // connection that bound it while it was still open.
    let session = match ctx.store.find_session(&target_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            send_json(
                client_tx,
                ServerMessage::Status {
                    status: SessionStatus::Closed,
                },
            )
            .await;
            return;
        }
        Err(e) => {
            warn!(
                component = "session",
                event = "message.lookup_failed",
                connection_id = conn_id,
                session_id = %target_id,
                error = %e,
                "Session lookup failed for message event"
            );
            send_store_error(client_tx).await;
            return;
        }
    };

    if session.status == SessionStatus::Closed {
        send_json(
            client_tx,
            ServerMessage::Status {
                status: SessionStatus::Closed,
            },
        )
        .await;
        return;
    }

    let user_message = match ctx
        .store
        .append_message(&target_id, MessageRole::User, content)
        .await
    {
        Ok(message) => message,
        Err(e) => {
            warn!(
                component = "session",
                event = "message.persist_failed",
                connection_id = conn_id,
                session_id = %target_id,
                error = %e,
                "Failed to persist user message"
            );
            send_store_error(client_tx).await;
            return;
        }
    };

    ctx.registry
        .broadcast(
            &target_id,
            ServerMessage::Message {
                session_id: target_id.clone(),
                message: user_message,
            },
        )
        .await;

    if let Err(e) = ctx.store.touch_session(&target_id).await {
        warn!(
            component = "session",
            event = "session.touch.failed",
            connection_id = conn_id,
            session_id = %target_id,
            error = %e,
            "Failed to refresh session activity"
        );
    }

    // Trailing context window for the responder. The call below can take
    // tens of seconds; it only suspends this connection's event loop,
    // never other connections.
    let history = match ctx.store.list_messages(&target_id, ctx.context_window).await {
        Ok(history) => history,
        Err(e) => {
            warn!(
                component = "session",
                event = "message.history_failed",
                connection_id = conn_id,
                session_id = %target_id,
                error = %e,
                "Failed to load trailing history"
            );
            send_store_error(client_tx).await;
            return;
        }
    };

    let reply = ctx
        .responder
        .reply(&target_id, content, &history, metadata.as_ref())
        .await;

    match ctx
        .store
        .append_message(&target_id, MessageRole::Bot, &reply)
        .await
    {
        Ok(bot_message) => {
            ctx.registry
                .broadcast(
                    &target_id,
                    ServerMessage::Message {
                        session_id: target_id.clone(),
                        message: bot_message,
                    },
                )
                .await;
        }
        Err(e) => {
            warn!(
                component = "session",
                event = "message.persist_failed",
                connection_id = conn_id,
                session_id = %target_id,
                error = %e,
                "Failed to persist bot message"
            );
            send_store_error(client_tx).await;
        }
    }
}

/// Heartbeats are best-effort: no-op without a resolvable id, silent on
/// success, logged (never surfaced) on failure.
async fn handle_heartbeat(
    override_id: Option<String>,
    bound_session_id: &Option<String>,
    ctx: &Arc<AppContext>,
    conn_id: u64,
) {
    let Some(target_id) = resolve_target(override_id.as_deref(), bound_session_id) else {
        return;
    };

    match ctx.store.touch_session(&target_id).await {
        Ok(true) => {
            debug!(
                component = "session",
                event = "session.heartbeat",
                connection_id = conn_id,
                session_id = %target_id,
                "Heartbeat refreshed session activity"
            );
        }
        Ok(false) => {
            debug!(
                component = "session",
                event = "session.heartbeat.ignored",
                connection_id = conn_id,
                session_id = %target_id,
                "Heartbeat ignored for closed or missing session"
            );
        }
        Err(e) => {
            warn!(
                component = "session",
                event = "session.heartbeat.failed",
                connection_id = conn_id,
                session_id = %target_id,
                error = %e,
                "Heartbeat failed"
            );
        }
    }
}

/// Explicit termination: close the session, append a SYSTEM marker,
/// notify the originating connection, unbind.
async fn handle_end_session(
    override_id: Option<String>,
    bound_session_id: &mut Option<String>,
    client_tx: &mpsc::Sender<OutboundMessage>,
    ctx: &Arc<AppContext>,
    conn_id: u64,
) {
    let Some(target_id) = resolve_target(override_id.as_deref(), bound_session_id) else {
        return;
    };

    info!(
        component = "session",
        event = "session.end.requested",
        connection_id = conn_id,
        session_id = %target_id,
        "End session requested"
    );

    let closed_now = match ctx.store.close_session(&target_id).await {
        Ok(changed) => changed,
        Err(e) => {
            warn!(
                component = "session",
                event = "session.end.failed",
                connection_id = conn_id,
                session_id = %target_id,
                error = %e,
                "Failed to close session"
            );
            send_store_error(client_tx).await;
            return;
        }
    };

    // CLOSED status is the source of truth; the SYSTEM marker and the
    // notification are best-effort. An already-closed session skips the
    // duplicate marker but still notifies and unbinds.
    if closed_now {
        if let Err(e) = ctx
            .store
            .append_message(&target_id, MessageRole::System, SESSION_ENDED_MARKER)
            .await
        {
            warn!(
                component = "session",
                event = "session.end.marker_failed",
                connection_id = conn_id,
                session_id = %target_id,
                error = %e,
                "Failed to append session termination marker"
            );
        }
    }

    send_json(
        client_tx,
        ServerMessage::SessionClosed {
            session_id: target_id.clone(),
            message: SESSION_CLOSED_NOTICE.to_string(),
        },
    )
    .await;

    // Unbind so future events on this connection re-resolve explicitly or
    // are rejected. Only the connection's own binding is affected when the
    // event targeted another session by override.
    if bound_session_id.as_deref() == Some(target_id.as_str()) {
        ctx.registry.unregister(&target_id, conn_id);
        *bound_session_id = None;
    }
}

async fn send_store_error(client_tx: &mpsc::Sender<OutboundMessage>) {
    send_json(
        client_tx,
        ServerMessage::Error {
            code: "store_error".to_string(),
            message: "a storage operation failed; please retry".to_string(),
        },
    )
    .await;
}
