use serde::{Deserialize, Serialize};

/// Request accepted on the gateway's rpc endpoint.
#[derive(Debug, Deserialize)]
pub struct GatewayRequest {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

/// Structured gateway response: `{ id, success, result?, error? }`.
#[derive(Debug, Serialize)]
pub struct GatewayResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayErrorBody>,
}

/// Error object carried by a failed gateway response.
#[derive(Debug, Serialize)]
pub struct GatewayErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// Reason codes surfaced to gateway callers.
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
pub const NO_PEER_CONNECTED: &str = "NO_PEER_CONNECTED";
pub const PEER_TIMEOUT: &str = "PEER_TIMEOUT";
pub const PEER_DISCONNECTED: &str = "PEER_DISCONNECTED";
pub const PEER_ERROR: &str = "PEER_ERROR";
pub const PARSE_ERROR: &str = "PARSE_ERROR";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

impl GatewayResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(
        id: Option<serde_json::Value>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(GatewayErrorBody {
                code: code.to_string(),
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn error_with_data(
        id: Option<serde_json::Value>,
        code: &str,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(GatewayErrorBody {
                code: code.to_string(),
                message: message.into(),
                data: Some(data),
            }),
        }
    }

    pub fn unauthorized() -> Self {
        Self::error(None, UNAUTHORIZED, "credential missing or invalid")
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::error(None, PARSE_ERROR, msg)
    }
}
