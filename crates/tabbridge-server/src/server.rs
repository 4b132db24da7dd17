use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tabbridge_session::{Correlator, SessionStore, StoreConfig};

use crate::auth::CredentialDecoder;
use crate::{gateway, ws};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub request_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_outbound_queue: usize,
    pub expose_internal_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9092,
            max_send_queue: 256,
            request_timeout_secs: 15,
            session_ttl_secs: 300,
            sweep_interval_secs: 30,
            max_outbound_queue: 100,
            expose_internal_errors: false,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub correlator: Arc<Correlator>,
    pub decoder: Arc<dyn CredentialDecoder>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(gateway::rpc_handler))
        .route("/session", get(gateway::session_info_handler))
        .route("/health", get(gateway::health_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server. Returns a handle that owns the session
/// store and background tasks.
pub async fn start(
    config: ServerConfig,
    decoder: Arc<dyn CredentialDecoder>,
) -> Result<ServerHandle, std::io::Error> {
    let store = Arc::new(SessionStore::new(StoreConfig {
        max_outbound_queue: config.max_outbound_queue,
        session_ttl: Duration::from_secs(config.session_ttl_secs),
        sweep_interval: Duration::from_secs(config.sweep_interval_secs),
    }));
    Arc::clone(&store).start_sweep();

    let correlator = Arc::new(Correlator::new(
        Arc::clone(&store),
        Duration::from_secs(config.request_timeout_secs),
    ));

    let state = AppState {
        store: Arc::clone(&store),
        correlator,
        decoder,
        config: Arc::new(config),
    };

    let router = build_router(state.clone());
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Bridge server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        store,
        _server: server,
    })
}

/// Handle returned by `start()` — keeps background tasks alive and drives
/// shutdown.
pub struct ServerHandle {
    pub port: u16,
    pub store: Arc<SessionStore>,
    _server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting work and release every session. Idempotent.
    pub async fn shutdown(&self) {
        self.store.shutdown().await;
        self._server.abort();
    }
}

/// Fresh state over an isolated store, for handler-level tests.
#[cfg(test)]
pub(crate) fn test_state(config: ServerConfig) -> AppState {
    let store = Arc::new(SessionStore::new(StoreConfig {
        max_outbound_queue: config.max_outbound_queue,
        session_ttl: Duration::from_secs(config.session_ttl_secs),
        sweep_interval: Duration::from_secs(config.sweep_interval_secs),
    }));
    let correlator = Arc::new(Correlator::new(
        Arc::clone(&store),
        Duration::from_secs(config.request_timeout_secs),
    ));
    AppState {
        store,
        correlator,
        decoder: Arc::new(crate::auth::UnverifiedJwtDecoder),
        config: Arc::new(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{make_test_token, UnverifiedJwtDecoder};

    #[test]
    fn build_router_creates_routes() {
        let state = test_state(ServerConfig::default());
        let _router = build_router(state);
        // If this doesn't panic, the router was built successfully
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let config = ServerConfig {
            port: 0, // Random port
            ..Default::default()
        };
        let handle = start(config, Arc::new(UnverifiedJwtDecoder)).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn rpc_endpoint_rejects_missing_credential() {
        let config = ServerConfig { port: 0, ..Default::default() };
        let handle = start(config, Arc::new(UnverifiedJwtDecoder)).await.unwrap();

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/rpc", handle.port);
        let resp = client
            .post(&url)
            .body(r#"{"method":"bridge/peer_alive"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
        assert!(handle.store.is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn rpc_endpoint_answers_peer_alive() {
        let config = ServerConfig { port: 0, ..Default::default() };
        let handle = start(config, Arc::new(UnverifiedJwtDecoder)).await.unwrap();

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/rpc", handle.port);
        let resp = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", make_test_token("abc")))
            .body(r#"{"method":"bridge/peer_alive","id":1}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["connected"], false);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn session_diagnostics_served_over_http() {
        let config = ServerConfig { port: 0, ..Default::default() };
        let handle = start(config, Arc::new(UnverifiedJwtDecoder)).await.unwrap();

        let client = reqwest::Client::new();
        let token = make_test_token("abc");

        // Unknown session first.
        let url = format!("http://127.0.0.1:{}/session?token={}", handle.port, token);
        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        // A notification creates the session; diagnostics then resolve.
        let rpc_url = format!("http://127.0.0.1:{}/rpc", handle.port);
        client
            .post(&rpc_url)
            .query(&[("token", token.as_str())])
            .body(r#"{"method":"tools/changed","params":{}}"#)
            .send()
            .await
            .unwrap();

        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["sessionId"], "abc");
        assert!(body.get("createdAt").is_some());
        assert!(body.get("health").is_some());

        handle.shutdown().await;
    }
}
