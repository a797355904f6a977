//! Bearer tokens
//!
//! Access and refresh tokens are HS256 JWTs over a typed [`Claims`] set.
//! The `kind` claim keeps a refresh token from being used as an access
//! token and vice versa.

use crate::error::ApiError;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use meshgate_common::{Error, Result, User};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(72 * 60 * 60);
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

/// Token pair handed to clients after login or refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub auth_token: String,
    pub refresh_token: String,
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn issue(&self, user: &User) -> Result<TokenResponse> {
        Ok(TokenResponse {
            auth_token: self.sign(user, TokenKind::Access, self.access_ttl)?,
            refresh_token: self.sign(user, TokenKind::Refresh, self.refresh_ttl)?,
        })
    }

    fn sign(&self, user: &User, kind: TokenKind, ttl: Duration) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            kind,
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token encoding failed: {}", e)))
    }

    /// Decode and validate a token of the expected kind.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| Error::Unauthorized(format!("invalid token: {}", e)))?;

        if data.claims.kind != kind {
            return Err(Error::Unauthorized("wrong token kind".to_string()));
        }
        Ok(data.claims)
    }
}

/// Development secret used when none is configured
pub fn random_secret() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Claims of the caller's access token
pub fn current_user(tokens: &TokenIssuer, headers: &HeaderMap) -> std::result::Result<Claims, ApiError> {
    let token = extract_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("Missing or invalid authorization header".to_string()))?;
    tokens
        .verify(token, TokenKind::Access)
        .map_err(|_| ApiError::Unauthorized("Invalid or expired token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            subject: "sub".to_string(),
            email: "a@example.com".to_string(),
            name: "Alice".to_string(),
            given_name: String::new(),
            family_name: String::new(),
            picture: None,
            locale: None,
            verified_email: true,
        }
    }

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(b"test-secret", DEFAULT_ACCESS_TTL, DEFAULT_REFRESH_TTL)
    }

    #[test]
    fn test_issue_and_verify() {
        let user = user();
        let tokens = issuer().issue(&user).unwrap();

        let claims = issuer().verify(&tokens.auth_token, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.email, "a@example.com");
        assert!(claims.exp - claims.iat == DEFAULT_ACCESS_TTL.as_secs() as i64);

        let refresh = issuer().verify(&tokens.refresh_token, TokenKind::Refresh).unwrap();
        assert_eq!(refresh.sub, user.id);
    }

    #[test]
    fn test_kind_is_enforced() {
        let tokens = issuer().issue(&user()).unwrap();
        assert!(issuer().verify(&tokens.refresh_token, TokenKind::Access).is_err());
        assert!(issuer().verify(&tokens.auth_token, TokenKind::Refresh).is_err());
    }

    #[test]
    fn test_wrong_secret_and_expiry() {
        let tokens = issuer().issue(&user()).unwrap();
        let other = TokenIssuer::new(b"other", DEFAULT_ACCESS_TTL, DEFAULT_REFRESH_TTL);
        assert!(other.verify(&tokens.auth_token, TokenKind::Access).is_err());

        // Past expiry by more than the default leeway
        let expired = TokenIssuer::new(b"test-secret", Duration::ZERO, Duration::ZERO);
        let mut claims = issuer()
            .verify(&expired.issue(&user()).unwrap().auth_token, TokenKind::Access)
            .unwrap();
        claims.exp -= 3600;
        let stale = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(issuer().verify(&stale, TokenKind::Access).is_err());
    }

    #[test]
    fn test_current_user_from_headers() {
        let tokens = issuer().issue(&user()).unwrap();
        let mut headers = HeaderMap::new();
        assert!(current_user(&issuer(), &headers).is_err());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", tokens.auth_token)).unwrap(),
        );
        assert!(current_user(&issuer(), &headers).is_ok());
    }
}
