//! Login, OAuth callback and token refresh

use crate::auth::{TokenKind, TokenResponse};
use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use meshgate_common::relay::publish_json;
use meshgate_common::UserProfile;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    refresh_token: String,
}

/// Redirect to the identity provider. The session token becomes the OAuth
/// `state` and later names the handoff channel.
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let oauth = state
        .oauth
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("OAuth is not configured".to_string()))?;
    let url = oauth.authorize_url(&token)?;
    Ok(Redirect::temporary(&url).into_response())
}

pub async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    let oauth = state
        .oauth
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("OAuth is not configured".to_string()))?;

    if query.code.is_empty() {
        return Err(ApiError::BadRequest("Missing authorization code".to_string()));
    }
    if query.state.is_empty() {
        return Err(ApiError::BadRequest("Missing state".to_string()));
    }

    let profile = oauth.exchange(&query.code).await.map_err(|e| {
        warn!("OAuth exchange failed: {}", e);
        ApiError::Unauthorized("Failed to exchange token".to_string())
    })?;

    complete_login(&state, &query.state, &profile).await?;
    Ok("You may close this window".into_response())
}

/// Record the user, mint tokens and hand them to whoever waits on `channel`.
pub async fn complete_login(
    state: &AppState,
    channel: &str,
    profile: &UserProfile,
) -> Result<TokenResponse, ApiError> {
    let user = state.registry.upsert_user(profile).await?;
    let tokens = state.tokens.issue(&user)?;

    let delivered = publish_json(state.broker.as_ref(), channel, &tokens).await?;
    if delivered == 0 {
        warn!("No session waiting on login channel {}", channel);
    }
    info!("Login completed for {}", user.email);
    Ok(tokens)
}

pub async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(req) = payload?;
    let claims = state
        .tokens
        .verify(&req.refresh_token, TokenKind::Refresh)
        .map_err(|_| ApiError::Unauthorized("Invalid refresh token".to_string()))?;

    let user = state
        .registry
        .get_user(claims.sub)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("User not found".to_string()))?;

    Ok(Json(state.tokens.issue(&user)?))
}
