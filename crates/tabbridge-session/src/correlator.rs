//! Matches asynchronous request/response pairs flowing over a session's
//! duplex channel.
//!
//! Every peer call registers a pending entry keyed by `(session, request id)`
//! before its frame is written, then waits on a oneshot with a timeout. The
//! entry is removed by exactly one of: a matching reply, the timeout, a
//! channel disconnect, or session expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;

use tabbridge_core::ids::{RequestId, SessionId};
use tabbridge_core::wire::{self, ReplyOutcome};
use tabbridge_core::BridgeError;

use crate::session::PendingCall;
use crate::store::SessionStore;

pub struct Correlator {
    store: Arc<SessionStore>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(store: Arc<SessionStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Send a correlated request to the session's duplex peer and wait for
    /// the matching reply.
    ///
    /// Fails immediately with `NoPeerConnected` when no duplex channel is
    /// bound; no timer is started in that case. A caller-supplied id is
    /// carried on the wire verbatim; otherwise one is generated.
    pub async fn call_peer(
        &self,
        session_id: &SessionId,
        method: &str,
        params: &serde_json::Value,
        id: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError> {
        let Some(session) = self.store.get(session_id) else {
            return Err(BridgeError::NoPeerConnected(session_id.clone()));
        };

        let (wire_id, request_id) = match id {
            Some(value) => match wire::id_key(value) {
                Some(key) => (value.clone(), RequestId::from_raw(key)),
                None => {
                    return Err(BridgeError::MalformedMessage(
                        "request id is not a string or number".into(),
                    ))
                }
            },
            None => {
                let generated = RequestId::new();
                let value = serde_json::Value::String(generated.as_str().to_string());
                (value, generated)
            }
        };

        let (reply_tx, mut reply_rx) = oneshot::channel();
        let tx = {
            let mut guard = session.lock().await;
            let Some(duplex) = guard.duplex() else {
                return Err(BridgeError::NoPeerConnected(session_id.clone()));
            };
            let tx = duplex.tx.clone();
            guard.register_call(request_id.clone(), PendingCall::new(method, reply_tx));
            tx
        };

        let frame = wire::request_frame(&wire_id, method, params);
        if let Err(e) = tx.try_send(frame.to_string()) {
            self.remove_entry(session_id, &request_id).await;
            return match e {
                TrySendError::Closed(_) => Err(BridgeError::PeerDisconnected),
                TrySendError::Full(_) => {
                    tracing::warn!(session_id = %session_id, method, "Duplex send queue full");
                    Err(BridgeError::Internal("duplex send queue full".into()))
                }
            };
        }

        tracing::debug!(
            session_id = %session_id,
            request_id = %request_id,
            method,
            "Peer call dispatched"
        );

        match tokio::time::timeout(self.timeout, &mut reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            // Entry dropped without a settle: the session went away.
            Ok(Err(_)) => Err(BridgeError::PeerDisconnected),
            Err(_elapsed) => {
                if self.remove_entry(session_id, &request_id).await {
                    Err(BridgeError::PeerTimeout {
                        method: method.to_string(),
                    })
                } else {
                    // The reply won the race at the deadline and the entry
                    // is already settled (or about to be); take its outcome.
                    match reply_rx.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(BridgeError::PeerDisconnected),
                    }
                }
            }
        }
    }

    /// Settle the pending entry matching an inbound reply. Returns whether
    /// anything matched; unmatched replies are the caller's to log.
    pub async fn resolve_reply(
        &self,
        session_id: &SessionId,
        id: &serde_json::Value,
        outcome: ReplyOutcome,
    ) -> bool {
        let Some(key) = wire::id_key(id) else {
            return false;
        };
        let request_id = RequestId::from_raw(key);
        let Some(session) = self.store.get(session_id) else {
            return false;
        };

        let call = {
            let mut guard = session.lock().await;
            guard.touch();
            guard.take_call(&request_id)
        };
        match call {
            Some(call) => {
                tracing::debug!(
                    session_id = %session_id,
                    request_id = %request_id,
                    method = %call.method,
                    "Peer reply matched"
                );
                call.settle_reply(outcome);
                true
            }
            None => false,
        }
    }

    /// Force-reject every pending entry for the session. Run when its
    /// duplex channel disconnects so no entry outlives the channel.
    pub async fn reject_all(&self, session_id: &SessionId) -> usize {
        match self.store.get(session_id) {
            Some(session) => {
                let rejected = session.lock().await.reject_in_flight();
                if rejected > 0 {
                    tracing::info!(
                        session_id = %session_id,
                        rejected = rejected,
                        "Rejected in-flight calls after duplex disconnect"
                    );
                }
                rejected
            }
            None => 0,
        }
    }

    pub async fn pending_count(&self, session_id: &SessionId) -> usize {
        self.store.pending_count(session_id).await
    }

    async fn remove_entry(&self, session_id: &SessionId, request_id: &RequestId) -> bool {
        match self.store.get(session_id) {
            Some(session) => session.lock().await.take_call(request_id).is_some(),
            None => false,
        }
    }
}
