//! Device, peer and issuance handlers

use crate::auth::current_user;
use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::HeaderMap,
    Json,
};
use meshgate_common::{DeviceView, Error, IssueRequest, IssuedCertificate, NewDevice, NewPeer, Peer};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct PeersQuery {
    #[serde(rename = "networkId", alias = "network_id")]
    network_id: String,
}

pub async fn register_device_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<NewDevice>, JsonRejection>,
) -> Result<Json<DeviceView>, ApiError> {
    let user = current_user(&state.tokens, &headers)?;
    let Json(req) = payload?;
    let device = state.registry.register_device(user.sub, &req).await?;
    Ok(Json(DeviceView::from(&device)))
}

pub async fn list_devices_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceView>>, ApiError> {
    let user = current_user(&state.tokens, &headers)?;
    let devices = state.registry.list_devices(user.sub).await?;
    Ok(Json(devices.iter().map(DeviceView::from).collect()))
}

pub async fn register_node_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<NewPeer>, JsonRejection>,
) -> Result<Json<Peer>, ApiError> {
    let user = current_user(&state.tokens, &headers)?;
    let Json(req) = payload?;
    Ok(Json(state.registry.upsert_peer(user.sub, &req).await?))
}

pub async fn list_peers_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PeersQuery>,
) -> Result<Json<Vec<Peer>>, ApiError> {
    let user = current_user(&state.tokens, &headers)?;
    Ok(Json(state.registry.list_peers(user.sub, &query.network_id).await?))
}

pub async fn sign_public_key_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<IssueRequest>, JsonRejection>,
) -> Result<Json<IssuedCertificate>, ApiError> {
    let user = current_user(&state.tokens, &headers)?;
    let Json(req) = payload?;

    match state.authority.sign_public_key(user.sub, &req).await {
        Ok(issued) => Ok(Json(issued)),
        Err(Error::InvalidInput(msg)) => Err(ApiError::BadRequest(msg)),
        Err(e) => {
            warn!("Issuance for device {} failed: {}", req.device_id, e);
            Err(ApiError::Internal("Failed to sign public key".to_string()))
        }
    }
}
