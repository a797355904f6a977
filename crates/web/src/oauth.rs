//! OAuth authorization-code exchange against the identity provider

use meshgate_common::{Error, Result, UserProfile};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// OAuth client settings. Endpoint defaults point at Google.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: String::new(),
            auth_url: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
            scopes: vec![
                "https://www.googleapis.com/auth/userinfo.email".to_string(),
                "https://www.googleapis.com/auth/userinfo.profile".to_string(),
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenExchange {
    access_token: String,
}

pub struct OAuthClient {
    config: OAuthConfig,
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Provider login URL. `state` comes back on the callback and names the
    /// channel the waiting session listens on.
    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let scopes = self.config.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.config.auth_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("response_type", "code"),
                ("scope", scopes.as_str()),
                ("state", state),
                ("access_type", "online"),
            ],
        )
        .map_err(|e| Error::InvalidInput(format!("invalid auth_url: {}", e)))?;
        Ok(url.into())
    }

    /// Exchange an authorization code for the user's profile
    pub async fn exchange(&self, code: &str) -> Result<UserProfile> {
        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_url.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Unauthorized(format!("token exchange failed: {}", e)))?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("Token exchange rejected: {}", body);
            return Err(Error::Unauthorized("token exchange rejected".to_string()));
        }

        let token: TokenExchange = resp
            .json()
            .await
            .map_err(|e| Error::Unauthorized(format!("token parse failed: {}", e)))?;

        let profile: UserProfile = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Unauthorized(format!("userinfo failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Unauthorized(format!("userinfo parse failed: {}", e)))?;

        debug!("Fetched profile for {}", profile.email);
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorize_url_carries_state() {
        let client = OAuthClient::new(OAuthConfig {
            client_id: "cid".to_string(),
            redirect_url: "https://gw.example/auth/google/callback".to_string(),
            ..Default::default()
        });

        let url = Url::parse(&client.authorize_url("session-123").unwrap()).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["state"], "session-123");
        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "https://gw.example/auth/google/callback");
        assert!(params["scope"].contains("userinfo.email"));
    }
}
