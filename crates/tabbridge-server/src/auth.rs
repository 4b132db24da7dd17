use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::Engine;

use tabbridge_core::ids::SessionId;

/// Turns an opaque bearer credential into a session identifier.
///
/// The trait is the seam between the bridge and whatever identity assertion
/// a deployment uses: a verified-JWT implementation can slot in without any
/// change to the listener or gateway.
#[async_trait]
pub trait CredentialDecoder: Send + Sync {
    /// `None` for a missing or undecodable credential. Never errors.
    async fn decode(&self, credential: Option<&str>) -> Option<SessionId>;
}

/// Extracts the `sub` claim from a compact JWT without verifying the
/// signature. Mock-grade by design: identity is asserted, not proven.
pub struct UnverifiedJwtDecoder;

#[async_trait]
impl CredentialDecoder for UnverifiedJwtDecoder {
    async fn decode(&self, credential: Option<&str>) -> Option<SessionId> {
        let token = credential?;
        match decode_subject(token) {
            Some(sub) => {
                tracing::debug!(session_id = %sub, "Decoded session id from credential");
                Some(SessionId::from_raw(sub))
            }
            None => {
                tracing::warn!("Failed to decode session id from credential");
                None
            }
        }
    }
}

fn decode_subject(token: &str) -> Option<String> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let claims_b64 = parts.next()?;
    let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(claims_b64)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&claims).ok()?;
    claims.get("sub")?.as_str().map(str::to_string)
}

/// Pull the credential off a gateway call. The `Authorization` header takes
/// precedence over the `token` query parameter; a `Bearer ` prefix is
/// stripped when present.
pub fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        if let Ok(raw) = value.to_str() {
            let token = raw.strip_prefix("Bearer ").unwrap_or(raw);
            return Some(token.to_string());
        }
    }
    query_token.map(str::to_string)
}

/// Unsigned compact JWT for tests.
#[cfg(test)]
pub(crate) fn make_test_token(sub: &str) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = engine.encode(serde_json::json!({ "sub": sub }).to_string());
    format!("{header}.{claims}.sig")
}
