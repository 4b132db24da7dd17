use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use tabbridge_core::ids::{ConnectionId, RequestId, SessionId};
use tabbridge_core::wire::ReplyOutcome;
use tabbridge_core::BridgeError;

/// Live duplex channel bound to a session. The sender feeds the writer task
/// of the owning WebSocket connection; dropping it closes that connection.
#[derive(Clone)]
pub struct DuplexHandle {
    pub connection_id: ConnectionId,
    pub tx: mpsc::Sender<String>,
}

/// Server-initiated message waiting for a client able to receive it.
#[derive(Clone, Debug, Serialize)]
pub struct QueuedMessage {
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

/// One outstanding peer call awaiting its reply. Settling consumes the
/// entry, so each request id sees at most one outcome.
pub struct PendingCall {
    pub method: String,
    pub created_at: DateTime<Utc>,
    reply_tx: oneshot::Sender<Result<serde_json::Value, BridgeError>>,
}

impl PendingCall {
    pub fn new(
        method: impl Into<String>,
        reply_tx: oneshot::Sender<Result<serde_json::Value, BridgeError>>,
    ) -> Self {
        Self {
            method: method.into(),
            created_at: Utc::now(),
            reply_tx,
        }
    }

    /// Deliver the terminal outcome. The caller may have already given up
    /// (timeout), in which case the send is a no-op.
    pub fn settle(self, outcome: Result<serde_json::Value, BridgeError>) {
        let _ = self.reply_tx.send(outcome);
    }

    pub fn settle_reply(self, outcome: ReplyOutcome) {
        match outcome {
            ReplyOutcome::Result(value) => self.settle(Ok(value)),
            ReplyOutcome::Error(value) => self.settle(Err(BridgeError::PeerError(value))),
        }
    }
}

/// Computed session health.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy(HealthReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthReason {
    NotFound,
    Expired,
    NoActiveConnections,
}

impl HealthReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "session not found",
            Self::Expired => "session expired",
            Self::NoActiveConnections => "no active connections",
        }
    }
}

impl Health {
    /// Wire label: `"HEALTHY"` or `"UNHEALTHY (<reason>)"`.
    pub fn label(&self) -> String {
        match self {
            Self::Healthy => "HEALTHY".to_string(),
            Self::Unhealthy(reason) => format!("UNHEALTHY ({})", reason.as_str()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// How an outbound message left the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Written onto the live duplex channel.
    Peer,
    /// No live channel could take it; held in the outbound queue.
    Queued,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Queued => "queued",
        }
    }
}

/// Diagnostics record for one session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_duplex_connected: bool,
    pub is_gateway_connected: bool,
    pub pending_messages_count: usize,
    pub pending_requests_count: usize,
    pub health: String,
}

/// State for one logical client identity, possibly spanning multiple
/// physical connections over its lifetime.
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub gateway_connected: bool,
    duplex: Option<DuplexHandle>,
    outbound: VecDeque<QueuedMessage>,
    in_flight: HashMap<RequestId, PendingCall>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity: now,
            gateway_connected: false,
            duplex: None,
            outbound: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn is_expired(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        now.signed_duration_since(self.last_activity) > ttl
    }

    pub fn duplex(&self) -> Option<&DuplexHandle> {
        self.duplex.as_ref()
    }

    pub fn is_duplex_connected(&self) -> bool {
        self.duplex.is_some()
    }

    /// Bind a duplex channel, returning any superseded handle so the caller
    /// can drop it and let the old connection wind down.
    pub fn bind_duplex(&mut self, handle: DuplexHandle) -> Option<DuplexHandle> {
        self.touch();
        self.duplex.replace(handle)
    }

    /// Clear the binding only if `connection_id` still owns it. A stale
    /// close racing a rebind must not unbind the replacement channel.
    pub fn unbind_duplex(&mut self, connection_id: &ConnectionId) -> bool {
        match &self.duplex {
            Some(handle) if &handle.connection_id == connection_id => {
                self.duplex = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear_duplex(&mut self) -> Option<DuplexHandle> {
        self.duplex.take()
    }

    /// Append to the outbound queue, evicting the oldest entry past `max`.
    /// Returns the evicted message, if any.
    pub fn push_outbound(
        &mut self,
        payload: serde_json::Value,
        max: usize,
    ) -> Option<QueuedMessage> {
        self.touch();
        self.outbound.push_back(QueuedMessage {
            payload,
            queued_at: Utc::now(),
        });
        if self.outbound.len() > max {
            self.outbound.pop_front()
        } else {
            None
        }
    }

    /// Take-and-clear the outbound queue.
    pub fn drain_outbound(&mut self) -> Vec<QueuedMessage> {
        self.touch();
        self.outbound.drain(..).collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn register_call(&mut self, request_id: RequestId, call: PendingCall) {
        self.touch();
        self.in_flight.insert(request_id, call);
    }

    pub fn take_call(&mut self, request_id: &RequestId) -> Option<PendingCall> {
        self.in_flight.remove(request_id)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Force-reject every outstanding call. Used when the duplex channel
    /// closes or the session is removed; no entry may outlive its channel.
    pub fn reject_in_flight(&mut self) -> usize {
        let rejected = self.in_flight.len();
        for (_, call) in self.in_flight.drain() {
            call.settle(Err(BridgeError::PeerDisconnected));
        }
        rejected
    }

    pub fn health(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> Health {
        if self.is_expired(ttl, now) {
            Health::Unhealthy(HealthReason::Expired)
        } else if self.duplex.is_some() || self.gateway_connected {
            Health::Healthy
        } else {
            Health::Unhealthy(HealthReason::NoActiveConnections)
        }
    }

    pub fn snapshot(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            is_duplex_connected: self.duplex.is_some(),
            is_gateway_connected: self.gateway_connected,
            pending_messages_count: self.outbound.len(),
            pending_requests_count: self.in_flight.len(),
            health: self.health(ttl, now).label(),
        }
    }
}
