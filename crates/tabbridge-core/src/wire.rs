//! JSON-RPC 2.0 envelope handling for the duplex channel.
//!
//! Inbound frames are classified permissively: a frame with a `method` is a
//! peer-initiated request or notification, a frame with an `id` plus a
//! `result` or `error` member is a reply. Anything else is malformed and gets
//! dropped by the listener.

use crate::errors::BridgeError;

/// A classified inbound duplex frame.
#[derive(Debug)]
pub enum Inbound {
    Request {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
    },
    Reply {
        id: serde_json::Value,
        outcome: ReplyOutcome,
    },
}

/// Terminal payload of a reply frame.
#[derive(Debug, Clone)]
pub enum ReplyOutcome {
    Result(serde_json::Value),
    Error(serde_json::Value),
}

/// Classify a raw text frame from the duplex channel.
pub fn classify(text: &str) -> Result<Inbound, BridgeError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| BridgeError::MalformedMessage(format!("not JSON: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| BridgeError::MalformedMessage("not a JSON object".into()))?;

    if let Some(method) = obj.get("method").and_then(|m| m.as_str()) {
        return Ok(match obj.get("id") {
            Some(id) if !id.is_null() => Inbound::Request {
                id: id.clone(),
                method: method.to_string(),
            },
            _ => Inbound::Notification {
                method: method.to_string(),
            },
        });
    }

    let id = match obj.get("id") {
        Some(id) if !id.is_null() => id.clone(),
        _ => return Err(BridgeError::MalformedMessage("missing method and id".into())),
    };

    // `result: null` is a legal reply, so presence matters, not value.
    if obj.contains_key("result") {
        Ok(Inbound::Reply {
            id,
            outcome: ReplyOutcome::Result(obj["result"].clone()),
        })
    } else if obj.contains_key("error") {
        Ok(Inbound::Reply {
            id,
            outcome: ReplyOutcome::Error(obj["error"].clone()),
        })
    } else {
        Err(BridgeError::MalformedMessage(
            "id without result or error".into(),
        ))
    }
}

/// Build the request frame written to the duplex peer.
pub fn request_frame(
    id: &serde_json::Value,
    method: &str,
    params: &serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Normalize a JSON-RPC id into a correlation key. String and numeric ids
/// are accepted; anything else cannot be correlated.
pub fn id_key(id: &serde_json::Value) -> Option<String> {
    match id {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
