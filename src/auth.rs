//! Shared-secret authentication for the controller.
//!
//! Operator endpoints require `Authorization: Bearer <token>`. WebSocket
//! upgrades (agent registration and the operator terminal) carry the token in
//! a `?token=` query parameter instead, since browsers can't set headers on a
//! WebSocket handshake. Bridge endpoints are not authenticated here: their ids
//! are random, single-use and only valid for the bridge timeout.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// The expected token, shared with [`require_token`] through router state.
#[derive(Clone)]
pub struct Token(pub String);

/// Axum middleware rejecting requests without a valid bearer token.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: token present but wrong
pub async fn require_token(State(token): State<Token>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header", "code": "UNAUTHORIZED"})),
        )
            .into_response();
    };

    if !constant_time_eq(token.0.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid token", "code": "FORBIDDEN"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Check a `?token=` query value, for WebSocket upgrades.
pub fn check_query_token(expected: &str, provided: Option<&str>) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    match provided {
        Some(p) if constant_time_eq(expected.as_bytes(), p.as_bytes()) => Ok(()),
        Some(_) => Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid token", "code": "FORBIDDEN"})),
        )),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing token", "code": "UNAUTHORIZED"})),
        )),
    }
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so response times don't reveal the token length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}
