//! Duplex channel listener: authenticates WebSocket upgrades and binds the
//! accepted channel to a session.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use tabbridge_core::ids::{ConnectionId, SessionId};
use tabbridge_core::wire;
use tabbridge_session::DuplexHandle;

use crate::server::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// The upgrade handshake carries the credential as a query parameter only.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler. The access-control decision happens here,
/// before the upgrade: an undecodable credential is refused with 401 and the
/// connection is never established.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsAuthQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(session_id) = state.decoder.decode(query.token.as_deref()).await else {
        tracing::warn!("Rejected duplex upgrade: unauthorized");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_duplex(socket, session_id, state))
        .into_response()
}

/// Run one accepted duplex connection: bind it to the session, flush any
/// queued backlog, then split into writer/reader tasks until either side
/// closes.
pub async fn handle_duplex(socket: WebSocket, session_id: SessionId, state: AppState) {
    let connection_id = ConnectionId::new();
    let (tx, mut rx) = mpsc::channel::<String>(state.config.max_send_queue);

    let superseded = state
        .store
        .bind_duplex(
            &session_id,
            DuplexHandle {
                connection_id: connection_id.clone(),
                tx: tx.clone(),
            },
        )
        .await;
    // Dropping the superseded sender lets the replaced connection's writer
    // observe closure and shut its socket down.
    drop(superseded);
    tracing::info!(session_id = %session_id, connection_id = %connection_id, "Duplex channel bound");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward frames from the session's channel + periodic ping.
    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(session_id = %writer_session, "Sent ping");
                }
            }
        }
    });

    // Deliver messages queued while no channel could receive them.
    let backlog = state.store.drain_outbound(&session_id).await;
    if !backlog.is_empty() {
        tracing::info!(
            session_id = %session_id,
            count = backlog.len(),
            "Flushing queued outbound backlog"
        );
        for message in backlog {
            if tx.send(message.payload.to_string()).await.is_err() {
                break;
            }
        }
    }
    drop(tx);

    // Reader task: classify inbound frames and route replies.
    let reader_state = state.clone();
    let reader_session = session_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    route_inbound(&reader_state, &reader_session, text.as_str()).await;
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    // Only the connection that still owns the binding unbinds and rejects;
    // a superseded connection must not tear down its replacement.
    if state.store.unbind_duplex(&session_id, &connection_id).await {
        let rejected = state.correlator.reject_all(&session_id).await;
        tracing::info!(
            session_id = %session_id,
            connection_id = %connection_id,
            rejected_calls = rejected,
            "Duplex channel closed"
        );
    } else {
        tracing::debug!(
            session_id = %session_id,
            connection_id = %connection_id,
            "Superseded duplex connection closed"
        );
    }
}

/// Route one inbound text frame. Replies settle their pending entry via the
/// correlator; everything else is logged and dropped.
pub(crate) async fn route_inbound(state: &AppState, session_id: &SessionId, text: &str) {
    match wire::classify(text) {
        Ok(wire::Inbound::Reply { id, outcome }) => {
            if !state.correlator.resolve_reply(session_id, &id, outcome).await {
                tracing::debug!(session_id = %session_id, "Unmatched reply on duplex channel");
            }
        }
        Ok(wire::Inbound::Request { method, .. }) | Ok(wire::Inbound::Notification { method }) => {
            tracing::debug!(session_id = %session_id, method, "Ignoring peer-initiated message");
        }
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Dropping malformed duplex message");
        }
    }
}
