//! Bearer-token authentication for protected routes.

use std::collections::HashMap;

use axum::{
    extract::{Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tracing::debug;

use super::error::ApiError;
use super::state::AppState;

/// Reject requests that do not carry the configured token.
///
/// The token is read from `Authorization: Bearer <token>` or, for WebSocket
/// clients that cannot set headers, from the `token` query parameter.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.auth_token.is_empty() {
        return Ok(next.run(req).await);
    }

    let header_token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(bearer_token_from_header)
        .transpose()?;

    let query_token = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(mut params)| params.remove("token"));

    let Some(token) = header_token.map(str::to_string).or(query_token) else {
        debug!(path = %req.uri().path(), "Missing credentials");
        return Err(ApiError::unauthorized("missing bearer token"));
    };

    if !constant_time_eq(token.as_bytes(), state.auth_token.as_bytes()) {
        debug!(path = %req.uri().path(), "Rejected invalid token");
        return Err(ApiError::unauthorized("invalid token"));
    }

    Ok(next.run(req).await)
}

fn bearer_token_from_header(header: &str) -> Result<&str, ApiError> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("invalid authorization header"))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
