//! Request gateway: authenticated HTTP calls forwarded to the session's
//! duplex peer, plus local diagnostics that never leave the store.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use tabbridge_core::ids::SessionId;
use tabbridge_core::rpc::{self, GatewayRequest, GatewayResponse};
use tabbridge_core::BridgeError;
use tabbridge_session::SessionStore;

use crate::auth;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    pub token: Option<String>,
}

/// Clears the transient gateway-connected flag when the call finishes,
/// whichever exit path it takes.
struct GatewayGuard {
    store: Arc<SessionStore>,
    session_id: SessionId,
}

impl Drop for GatewayGuard {
    fn drop(&mut self) {
        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            store.set_gateway_connected(&session_id, false).await;
        });
    }
}

/// POST rpc endpoint.
pub async fn rpc_handler(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let credential = auth::bearer_token(&headers, query.token.as_deref());
    let Some(session_id) = state.decoder.decode(credential.as_deref()).await else {
        return (StatusCode::UNAUTHORIZED, Json(GatewayResponse::unauthorized())).into_response();
    };

    let request: GatewayRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(GatewayResponse::parse_error(format!("invalid request body: {e}"))),
            )
                .into_response();
        }
    };

    // Local diagnostic methods are pure reads: no session creation, no
    // gateway-connected marking.
    if is_local_method(&request.method) {
        let (status, response) = dispatch(&state, &session_id, request).await;
        return (status, Json(response)).into_response();
    }

    state.store.set_gateway_connected(&session_id, true).await;
    let _guard = GatewayGuard {
        store: Arc::clone(&state.store),
        session_id: session_id.clone(),
    };

    let (status, response) = dispatch(&state, &session_id, request).await;
    (status, Json(response)).into_response()
}

/// Methods answered from the store without a peer round-trip.
fn is_local_method(method: &str) -> bool {
    matches!(method, "bridge/status" | "bridge/peer_alive")
}

/// Route one authenticated gateway request. Local methods answer from the
/// store; anything else goes through the correlator to the duplex peer.
pub(crate) async fn dispatch(
    state: &AppState,
    session_id: &SessionId,
    request: GatewayRequest,
) -> (StatusCode, GatewayResponse) {
    let params = request.params.unwrap_or_else(|| serde_json::json!({}));

    match request.method.as_str() {
        "bridge/status" => match state.store.snapshot(session_id).await {
            Some(snap) => (
                StatusCode::OK,
                GatewayResponse::success(
                    request.id,
                    serde_json::to_value(snap).unwrap_or_default(),
                ),
            ),
            None => (
                StatusCode::NOT_FOUND,
                GatewayResponse::error(
                    request.id,
                    rpc::SESSION_NOT_FOUND,
                    format!("session not found: {session_id}"),
                ),
            ),
        },
        "bridge/peer_alive" => {
            let health = state.store.health(session_id).await;
            let connected = match state.store.get(session_id) {
                Some(session) => session.lock().await.is_duplex_connected(),
                None => false,
            };
            (
                StatusCode::OK,
                GatewayResponse::success(
                    request.id,
                    serde_json::json!({
                        "connected": connected,
                        "health": health.label(),
                    }),
                ),
            )
        }
        method => match request.id {
            // Correlated call: needs a live peer round-trip.
            Some(id) => {
                match state
                    .correlator
                    .call_peer(session_id, method, &params, Some(&id))
                    .await
                {
                    Ok(result) => (StatusCode::OK, GatewayResponse::success(Some(id), result)),
                    Err(e) => failure_response(state, Some(id), e),
                }
            }
            // Notification: deliver on the live channel or queue it.
            None => {
                let frame = serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": method,
                    "params": params,
                });
                let delivery = state.store.send_or_queue(session_id, frame).await;
                (
                    StatusCode::OK,
                    GatewayResponse::success(
                        None,
                        serde_json::json!({ "delivered": delivery.as_str() }),
                    ),
                )
            }
        },
    }
}

/// Map a bridge failure onto the gateway's structured error shape. Internal
/// detail only leaks when the deployment opts in.
fn failure_response(
    state: &AppState,
    id: Option<serde_json::Value>,
    err: BridgeError,
) -> (StatusCode, GatewayResponse) {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let response = match &err {
        BridgeError::PeerError(value) => GatewayResponse::error_with_data(
            id,
            err.reason_code(),
            "peer returned an error",
            value.clone(),
        ),
        BridgeError::Internal(detail) => {
            tracing::error!(error = %detail, "Gateway internal failure");
            let message = if state.config.expose_internal_errors {
                detail.clone()
            } else {
                "internal error".to_string()
            };
            GatewayResponse::error(id, err.reason_code(), message)
        }
        other => GatewayResponse::error(id, other.reason_code(), other.to_string()),
    };

    (status, response)
}

/// GET diagnostics for the authenticated session.
pub async fn session_info_handler(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    let credential = auth::bearer_token(&headers, query.token.as_deref());
    let Some(session_id) = state.decoder.decode(credential.as_deref()).await else {
        return (StatusCode::UNAUTHORIZED, Json(GatewayResponse::unauthorized())).into_response();
    };

    match state.store.snapshot(&session_id).await {
        Some(snap) => (StatusCode::OK, Json(snap)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(GatewayResponse::error(
                None,
                rpc::SESSION_NOT_FOUND,
                format!("session not found: {session_id}"),
            )),
        )
            .into_response(),
    }
}

/// Liveness endpoint.
pub async fn health_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "sessions": state.store.len(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tabbridge_core::ids::ConnectionId;
    use tabbridge_session::{Delivery, DuplexHandle};
    use tokio::sync::mpsc;

    use crate::auth::make_test_token;
    use crate::server::{test_state, ServerConfig};

    fn request(method: &str, id: Option<serde_json::Value>) -> GatewayRequest {
        GatewayRequest {
            method: method.to_string(),
            params: Some(serde_json::json!({})),
            id,
        }
    }

    #[tokio::test]
    async fn unauthorized_call_never_touches_the_store() {
        let state = test_state(ServerConfig::default());

        let response = rpc_handler(
            State(state.clone()),
            Query(AuthQuery { token: None }),
            HeaderMap::new(),
            r#"{"method":"bridge/peer_alive"}"#.to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let state = test_state(ServerConfig::default());

        let response = rpc_handler(
            State(state.clone()),
            Query(AuthQuery { token: Some("garbage".into()) }),
            HeaderMap::new(),
            r#"{"method":"bridge/peer_alive"}"#.to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn unparseable_body_is_a_parse_error() {
        let state = test_state(ServerConfig::default());

        let response = rpc_handler(
            State(state.clone()),
            Query(AuthQuery { token: Some(make_test_token("abc")) }),
            HeaderMap::new(),
            "{not json".to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn gateway_flag_is_cleared_after_the_call() {
        let state = test_state(ServerConfig::default());
        let token = make_test_token("abc");
        let id = SessionId::from_raw("abc");

        let response = rpc_handler(
            State(state.clone()),
            Query(AuthQuery { token: Some(token) }),
            HeaderMap::new(),
            r#"{"method":"tools/changed","params":{}}"#.to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        // The guard clears the flag from a spawned task; give it a beat.
        let mut cleared = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let session = state.store.get(&id).unwrap();
            if !session.lock().await.gateway_connected {
                cleared = true;
                break;
            }
        }
        assert!(cleared, "gateway-connected flag never cleared");
        assert!(state.store.contains(&id));
    }

    #[tokio::test]
    async fn local_methods_do_not_create_the_session() {
        let state = test_state(ServerConfig::default());
        let token = make_test_token("abc");

        let response = rpc_handler(
            State(state.clone()),
            Query(AuthQuery { token: Some(token.clone()) }),
            HeaderMap::new(),
            r#"{"method":"bridge/status","id":1}"#.to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(state.store.is_empty());

        let response = rpc_handler(
            State(state.clone()),
            Query(AuthQuery { token: Some(token) }),
            HeaderMap::new(),
            r#"{"method":"bridge/peer_alive"}"#.to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn peer_alive_answers_locally() {
        let state = test_state(ServerConfig::default());
        let id = SessionId::from_raw("abc");
        state.store.set_gateway_connected(&id, true).await;

        let (status, response) = dispatch(&state, &id, request("bridge/peer_alive", None)).await;
        assert_eq!(status, StatusCode::OK);
        let result = response.result.unwrap();
        assert_eq!(result["connected"], false);
        assert_eq!(result["health"], "HEALTHY");
    }

    #[tokio::test]
    async fn peer_alive_reports_bound_duplex() {
        let state = test_state(ServerConfig::default());
        let id = SessionId::from_raw("abc");
        let (tx, _rx) = mpsc::channel(4);
        state
            .store
            .bind_duplex(&id, DuplexHandle { connection_id: ConnectionId::new(), tx })
            .await;

        let (_, response) = dispatch(&state, &id, request("bridge/peer_alive", None)).await;
        let result = response.result.unwrap();
        assert_eq!(result["connected"], true);
        assert_eq!(result["health"], "HEALTHY");
    }

    #[tokio::test]
    async fn status_reports_snapshot_fields() {
        let state = test_state(ServerConfig::default());
        let id = SessionId::from_raw("abc");
        state.store.set_gateway_connected(&id, true).await;
        state.store.enqueue_outbound(&id, serde_json::json!({"n": 1})).await;

        let (status, response) = dispatch(&state, &id, request("bridge/status", Some(serde_json::json!(1)))).await;
        assert_eq!(status, StatusCode::OK);
        let result = response.result.unwrap();
        assert_eq!(result["sessionId"], "abc");
        assert_eq!(result["pendingMessagesCount"], 1);
        assert_eq!(result["pendingRequestsCount"], 0);
        assert_eq!(result["isGatewayConnected"], true);
        assert_eq!(result["isDuplexConnected"], false);
    }

    #[tokio::test]
    async fn status_for_unknown_session_is_not_found() {
        let state = test_state(ServerConfig::default());
        let id = SessionId::from_raw("ghost");

        let (status, response) = dispatch(&state, &id, request("bridge/status", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(response.error.unwrap().code, "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn correlated_call_without_peer_fails_with_reason_code() {
        let state = test_state(ServerConfig::default());
        let id = SessionId::from_raw("abc");
        state.store.set_gateway_connected(&id, true).await;

        let (status, response) =
            dispatch(&state, &id, request("tools/call", Some(serde_json::json!(1)))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "NO_PEER_CONNECTED");
    }

    #[tokio::test]
    async fn notification_is_queued_without_peer() {
        let state = test_state(ServerConfig::default());
        let id = SessionId::from_raw("abc");

        let (status, response) = dispatch(&state, &id, request("tools/changed", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.result.unwrap()["delivered"], Delivery::Queued.as_str());

        let snap = state.store.snapshot(&id).await.unwrap();
        assert_eq!(snap.pending_messages_count, 1);
    }

    #[tokio::test]
    async fn notification_is_delivered_over_live_peer() {
        let state = test_state(ServerConfig::default());
        let id = SessionId::from_raw("abc");
        let (tx, mut rx) = mpsc::channel(4);
        state
            .store
            .bind_duplex(&id, DuplexHandle { connection_id: ConnectionId::new(), tx })
            .await;

        let (_, response) = dispatch(&state, &id, request("tools/changed", None)).await;
        assert_eq!(response.result.unwrap()["delivered"], Delivery::Peer.as_str());

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["method"], "tools/changed");
        assert_eq!(frame["jsonrpc"], "2.0");
        assert!(frame.get("id").is_none());
    }

    #[tokio::test]
    async fn internal_detail_hidden_unless_opted_in() {
        let hidden = test_state(ServerConfig::default());
        let (_, response) = failure_response(
            &hidden,
            None,
            BridgeError::Internal("connection pool exhausted".into()),
        );
        assert_eq!(response.error.unwrap().message, "internal error");

        let exposed = test_state(ServerConfig {
            expose_internal_errors: true,
            ..Default::default()
        });
        let (_, response) = failure_response(
            &exposed,
            None,
            BridgeError::Internal("connection pool exhausted".into()),
        );
        assert_eq!(response.error.unwrap().message, "connection pool exhausted");
    }

    #[tokio::test]
    async fn peer_error_carries_peer_payload_as_data() {
        let state = test_state(ServerConfig::default());
        let (status, response) = failure_response(
            &state,
            Some(serde_json::json!(1)),
            BridgeError::PeerError(serde_json::json!({"code": -32601})),
        );
        assert_eq!(status, StatusCode::OK);
        let error = response.error.unwrap();
        assert_eq!(error.code, "PEER_ERROR");
        assert_eq!(error.data.unwrap()["code"], -32601);
    }

    #[tokio::test]
    async fn session_info_requires_auth_and_existing_session() {
        let state = test_state(ServerConfig::default());

        let response = session_info_handler(
            State(state.clone()),
            Query(AuthQuery { token: None }),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = session_info_handler(
            State(state.clone()),
            Query(AuthQuery { token: Some(make_test_token("ghost")) }),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        state
            .store
            .get_or_create(&SessionId::from_raw("abc"))
            .await;
        let response = session_info_handler(
            State(state.clone()),
            Query(AuthQuery { token: Some(make_test_token("abc")) }),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
