#![forbid(unsafe_code)]

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("credential rejected: {0}")]
    InvalidCredential(String),
    #[error("identity provider unreachable: {0}")]
    ProviderUnavailable(String),
    #[error("invalid token")]
    InvalidToken,
    #[error("missing authorization")]
    MissingToken,
    #[error("token expired")]
    TokenExpired,
    #[error("token signing failed: {0}")]
    Signing(String),
    #[error("authentication not configured")]
    NotConfigured,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingCredential => (StatusCode::BAD_REQUEST, "Missing credential"),
            AuthError::InvalidCredential(_) => (StatusCode::UNAUTHORIZED, "Invalid credential"),
            AuthError::ProviderUnavailable(_) => (StatusCode::BAD_GATEWAY, "Identity provider unavailable"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::Signing(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Token signing failed"),
            AuthError::NotConfigured => (StatusCode::SERVICE_UNAVAILABLE, "Authentication not configured"),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Verified identity of a signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GoogleLoginRequest {
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub iat: u64,
    pub exp: u64,
}

impl Claims {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.sub.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            avatar: self.avatar.clone(),
        }
    }
}
