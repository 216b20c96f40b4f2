#![forbid(unsafe_code)]

// External credential verification against Google's token-info endpoint.

use crate::auth::types::{AuthError, UserProfile};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Exchanges a third-party identity credential for a verified profile.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserProfile, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    aud: String,
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

pub struct GoogleVerifier {
    client_id: String,
    tokeninfo_url: String,
    http_client: reqwest::Client,
}

impl GoogleVerifier {
    pub fn new(client_id: String, tokeninfo_url: String) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with custom config, using defaults: {e}");
                reqwest::Client::new()
            });

        Self {
            client_id,
            tokeninfo_url,
            http_client,
        }
    }
}

#[async_trait]
impl CredentialVerifier for GoogleVerifier {
    async fn verify(&self, credential: &str) -> Result<UserProfile, AuthError> {
        let response = self
            .http_client
            .get(&self.tokeninfo_url)
            .query(&[("id_token", credential)])
            .send()
            .await
            .map_err(|e| AuthError::ProviderUnavailable(e.to_string()))?;

        if response.status().is_client_error() {
            debug!(status = %response.status(), "Credential rejected by token-info endpoint");
            return Err(AuthError::InvalidCredential(format!("status {}", response.status())));
        }
        if !response.status().is_success() {
            return Err(AuthError::ProviderUnavailable(format!("status {}", response.status())));
        }

        let info: TokenInfo = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidCredential(format!("malformed token info: {e}")))?;

        if info.aud != self.client_id {
            return Err(AuthError::InvalidCredential("audience mismatch".to_string()));
        }

        let email = info.email.unwrap_or_default();
        let name = info
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| email.clone());

        Ok(UserProfile {
            id: info.sub,
            name,
            email,
            avatar: info.picture,
        })
    }
}
