#![forbid(unsafe_code)]

use crate::auth::{jwt, types::*};
use crate::signaling::SignalingServer;
use axum::{extract::State, Json};
use tracing::{info, warn};

/// POST /api/auth/google
pub async fn google_login(
    State(server): State<SignalingServer>,
    Json(req): Json<GoogleLoginRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    let verifier = server.credential_verifier().ok_or(AuthError::NotConfigured)?;

    let credential = req
        .credential
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(AuthError::MissingCredential)?;

    let user = verifier.verify(credential).await.map_err(|e| {
        warn!("Google sign-in failed: {e}");
        e
    })?;

    let token = jwt::issue_session_token(&user, server.jwt_secret(), server.session_token_ttl())?;
    info!("User signed in: {} ({})", user.email, user.id);

    Ok(Json(AuthResponse { token, user }))
}
