use crate::ids::SessionId;
use crate::rpc;

/// Typed error hierarchy for bridge operations.
/// Classifies failures by where they surface: at the auth boundary, on a
/// diagnostic lookup, or during a peer round-trip.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BridgeError {
    // Boundary — terminal, no retry
    #[error("credential missing or undecodable")]
    Unauthorized,
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    // Peer round-trip
    #[error("no duplex peer connected for session {0}")]
    NoPeerConnected(SessionId),
    #[error("peer call timed out: {method}")]
    PeerTimeout { method: String },
    #[error("duplex channel disconnected")]
    PeerDisconnected,
    #[error("peer returned an error")]
    PeerError(serde_json::Value),

    // Transport
    #[error("malformed duplex message: {0}")]
    MalformedMessage(String),

    // Everything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Machine-checkable reason code surfaced in gateway responses.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => rpc::UNAUTHORIZED,
            Self::SessionNotFound(_) => rpc::SESSION_NOT_FOUND,
            Self::NoPeerConnected(_) => rpc::NO_PEER_CONNECTED,
            Self::PeerTimeout { .. } => rpc::PEER_TIMEOUT,
            Self::PeerDisconnected => rpc::PEER_DISCONNECTED,
            Self::PeerError(_) => rpc::PEER_ERROR,
            Self::MalformedMessage(_) => rpc::PARSE_ERROR,
            Self::Internal(_) => rpc::INTERNAL_ERROR,
        }
    }

    /// True for failures of the peer round-trip itself, as opposed to
    /// auth/lookup failures at the boundary.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Self::NoPeerConnected(_)
                | Self::PeerTimeout { .. }
                | Self::PeerDisconnected
                | Self::PeerError(_)
        )
    }

    /// HTTP status the gateway maps this failure to. Peer failures stay 200
    /// with a structured error body; only boundary and internal failures
    /// change the transport status.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::SessionNotFound(_) => 404,
            Self::Internal(_) => 500,
            _ => 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes() {
        assert_eq!(BridgeError::Unauthorized.reason_code(), "UNAUTHORIZED");
        assert_eq!(
            BridgeError::SessionNotFound(SessionId::from_raw("abc")).reason_code(),
            "SESSION_NOT_FOUND"
        );
        assert_eq!(
            BridgeError::NoPeerConnected(SessionId::from_raw("abc")).reason_code(),
            "NO_PEER_CONNECTED"
        );
        assert_eq!(
            BridgeError::PeerTimeout { method: "tools/call".into() }.reason_code(),
            "PEER_TIMEOUT"
        );
        assert_eq!(BridgeError::PeerDisconnected.reason_code(), "PEER_DISCONNECTED");
        assert_eq!(BridgeError::Internal("boom".into()).reason_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn peer_failure_classification() {
        assert!(BridgeError::NoPeerConnected(SessionId::from_raw("s")).is_peer_failure());
        assert!(BridgeError::PeerTimeout { method: "m".into() }.is_peer_failure());
        assert!(BridgeError::PeerDisconnected.is_peer_failure());
        assert!(!BridgeError::Unauthorized.is_peer_failure());
        assert!(!BridgeError::Internal("x".into()).is_peer_failure());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(BridgeError::Unauthorized.http_status(), 401);
        assert_eq!(
            BridgeError::SessionNotFound(SessionId::from_raw("s")).http_status(),
            404
        );
        assert_eq!(BridgeError::Internal("x".into()).http_status(), 500);
        assert_eq!(BridgeError::PeerDisconnected.http_status(), 200);
        assert_eq!(
            BridgeError::PeerTimeout { method: "m".into() }.http_status(),
            200
        );
    }

    #[test]
    fn timeout_display_names_method() {
        let err = BridgeError::PeerTimeout { method: "tools/call".into() };
        assert!(err.to_string().contains("tools/call"));
    }
}
