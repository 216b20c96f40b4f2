#![forbid(unsafe_code)]

use crate::auth::types::{AuthError, Claims, UserProfile};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn issue_session_token(user: &UserProfile, secret: &str, ttl: Duration) -> Result<String, AuthError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| AuthError::Signing("System clock error".to_string()))?;

    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        name: user.name.clone(),
        avatar: user.avatar.clone(),
        iat: now.as_secs(),
        exp: now.as_secs() + ttl.as_secs(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Signing(format!("JWT encode error: {e}")))
}

pub fn verify_session_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })?;

    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-at-least-32-bytes-long!!";

    fn alice() -> UserProfile {
        UserProfile {
            id: "google-123".to_string(),
            name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
            avatar: Some("https://example.com/a.png".to_string()),
        }
    }

    #[test]
    fn test_issue_and_verify_token() {
        let token = issue_session_token(&alice(), SECRET, Duration::from_secs(3600)).unwrap();
        let claims = verify_session_token(&token, SECRET).unwrap();
        assert_eq!(claims.sub, "google-123");
        assert_eq!(claims.profile(), alice());
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_invalid_secret_rejects() {
        let token = issue_session_token(&alice(), "secret-1", Duration::from_secs(60)).unwrap();
        let result = verify_session_token(&token, "secret-2");
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_expired_token_rejects() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let claims = Claims {
            sub: "google-123".to_string(),
            email: "alice@example.com".to_string(),
            name: "Alice".to_string(),
            avatar: None,
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
        assert!(matches!(verify_session_token(&token, SECRET), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_garbage_token_rejects() {
        let result = verify_session_token("not.a.jwt", SECRET);
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }
}
