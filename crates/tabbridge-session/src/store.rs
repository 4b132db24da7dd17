use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use tabbridge_core::ids::{ConnectionId, SessionId};

use crate::session::{
    Delivery, DuplexHandle, Health, HealthReason, QueuedMessage, Session, SessionSnapshot,
};

/// Store tuning: outbound queue bound, idle timeout, sweep period.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub max_outbound_queue: usize,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_outbound_queue: 100,
            session_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Authoritative map from session id to session state. All mutation goes
/// through these operations; per-session fields are guarded by the session's
/// own lock, so no multi-step update is ever observed torn.
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    config: StoreConfig,
    sweep_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            sweep_handle: std::sync::Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Look up an existing session without creating one.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Return the existing session or lazily create it, refreshing
    /// `last_activity` either way.
    pub async fn get_or_create(&self, id: &SessionId) -> Arc<Mutex<Session>> {
        let session = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::info!(session_id = %id, "Session created");
                Arc::new(Mutex::new(Session::new(id.clone())))
            })
            .value()
            .clone();
        session.lock().await.touch();
        session
    }

    /// Bind a duplex channel to the session, returning any superseded
    /// handle. The caller drops it, which lets the old connection's writer
    /// task observe closure and shut the socket down.
    pub async fn bind_duplex(
        &self,
        id: &SessionId,
        handle: DuplexHandle,
    ) -> Option<DuplexHandle> {
        let session = self.get_or_create(id).await;
        let superseded = session.lock().await.bind_duplex(handle);
        if superseded.is_some() {
            tracing::info!(session_id = %id, "Duplex binding superseded by new connection");
        }
        superseded
    }

    /// Clear the duplex binding if `connection_id` still owns it. Returns
    /// whether anything was unbound. The session itself is kept.
    pub async fn unbind_duplex(&self, id: &SessionId, connection_id: &ConnectionId) -> bool {
        match self.get(id) {
            Some(session) => {
                let mut guard = session.lock().await;
                let unbound = guard.unbind_duplex(connection_id);
                if unbound {
                    guard.touch();
                }
                unbound
            }
            None => false,
        }
    }

    /// Toggle the transient HTTP-activity flag. Setting it lazily creates
    /// the session; clearing it never does.
    pub async fn set_gateway_connected(&self, id: &SessionId, connected: bool) {
        if connected {
            let session = self.get_or_create(id).await;
            session.lock().await.gateway_connected = true;
        } else if let Some(session) = self.get(id) {
            let mut guard = session.lock().await;
            guard.gateway_connected = false;
            guard.touch();
        }
    }

    /// Append a server-initiated message to the session's bounded queue.
    pub async fn enqueue_outbound(&self, id: &SessionId, payload: serde_json::Value) {
        let session = self.get_or_create(id).await;
        let evicted = session
            .lock()
            .await
            .push_outbound(payload, self.config.max_outbound_queue);
        if let Some(dropped) = evicted {
            tracing::warn!(
                session_id = %id,
                queued_at = %dropped.queued_at,
                "Outbound queue full, dropping oldest message"
            );
        }
    }

    /// Deliver a message on the live duplex channel, or queue it when no
    /// channel can take it.
    pub async fn send_or_queue(&self, id: &SessionId, payload: serde_json::Value) -> Delivery {
        let session = self.get_or_create(id).await;
        let mut guard = session.lock().await;

        if let Some(duplex) = guard.duplex() {
            let text = payload.to_string();
            match duplex.tx.try_send(text) {
                Ok(()) => {
                    guard.touch();
                    return Delivery::Peer;
                }
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(session_id = %id, "Duplex send queue full, queueing message");
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(session_id = %id, "Duplex channel closed, queueing message");
                }
            }
        }

        let evicted = guard.push_outbound(payload, self.config.max_outbound_queue);
        if let Some(dropped) = evicted {
            tracing::warn!(
                session_id = %id,
                queued_at = %dropped.queued_at,
                "Outbound queue full, dropping oldest message"
            );
        }
        Delivery::Queued
    }

    /// Atomically take and clear the session's outbound queue.
    pub async fn drain_outbound(&self, id: &SessionId) -> Vec<QueuedMessage> {
        match self.get(id) {
            Some(session) => session.lock().await.drain_outbound(),
            None => Vec::new(),
        }
    }

    /// Health per the invariant: not expired AND at least one connection.
    pub async fn health(&self, id: &SessionId) -> Health {
        match self.get(id) {
            Some(session) => session.lock().await.health(self.config.session_ttl, Utc::now()),
            None => Health::Unhealthy(HealthReason::NotFound),
        }
    }

    /// Diagnostics record, or `None` for an unknown session.
    pub async fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        match self.get(id) {
            Some(session) => Some(
                session
                    .lock()
                    .await
                    .snapshot(self.config.session_ttl, Utc::now()),
            ),
            None => None,
        }
    }

    pub async fn pending_count(&self, id: &SessionId) -> usize {
        match self.get(id) {
            Some(session) => session.lock().await.in_flight_len(),
            None => 0,
        }
    }

    /// Remove every session idle past the timeout, closing its duplex
    /// channel and rejecting its outstanding calls. One session's cleanup
    /// never aborts another's.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let candidates: Vec<(SessionId, Arc<Mutex<Session>>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut removed = 0;
        for (id, session) in candidates {
            let mut guard = session.lock().await;
            if !guard.is_expired(self.config.session_ttl, now) {
                continue;
            }
            let rejected = guard.reject_in_flight();
            let handle = guard.clear_duplex();
            drop(guard);
            drop(handle);
            self.sessions.remove(&id);
            removed += 1;
            tracing::info!(
                session_id = %id,
                rejected_calls = rejected,
                "Expired idle session"
            );
        }
        removed
    }

    /// Start the periodic expiry sweep. A second call replaces the previous
    /// task.
    pub fn start_sweep(self: Arc<Self>) {
        let store = Arc::clone(&self);
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume first immediate tick
            loop {
                ticker.tick().await;
                let removed = store.sweep_expired().await;
                if removed > 0 {
                    tracing::info!(removed = removed, "Session expiry sweep");
                }
            }
        });
        if let Some(old) = self.sweep_handle.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    /// Stop the sweep and release every session and its resources.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }

        let all: Vec<Arc<Mutex<Session>>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();

        for session in all {
            let mut guard = session.lock().await;
            guard.reject_in_flight();
            guard.clear_duplex();
        }
    }
}
