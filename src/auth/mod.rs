#![forbid(unsafe_code)]

pub mod google;
pub mod jwt;
pub mod routes;
pub mod types;

use axum::http::HeaderMap;

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Verifies the bearer session token of an HTTP request.
pub fn authorize(headers: &HeaderMap, secret: &str) -> Result<types::Claims, types::AuthError> {
    let token = bearer_token(headers).ok_or(types::AuthError::MissingToken)?;
    jwt::verify_session_token(token, secret)
}
