//! Signaling transports over HTTP: one-shot SSE, continuous SSE, HTTP
//! publish and the duplex WebSocket.

use crate::auth::{current_user, extract_token, TokenKind};
use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::future::ready;
use futures::{SinkExt, StreamExt};
use meshgate_common::relay::{
    continuous_frames, device_channel, one_shot_frames, relay_signal, StreamFrame, WireFrame,
    COMPLETE_DATA, COMPLETE_EVENT,
};
use meshgate_common::{Error, SignalRequest};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

fn sse_event(frame: StreamFrame) -> Event {
    match frame {
        StreamFrame::Message(text) => Event::default().data(text),
        StreamFrame::Complete => Event::default().event(COMPLETE_EVENT).data(COMPLETE_DATA),
    }
}

/// One-shot stream for the login handoff. Unauthenticated: the session token
/// in the path is the capability.
pub async fn login_sse_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let subscription = state.broker.subscribe(&token).await?;
    debug!("Waiting for login on {}", token);

    let events = one_shot_frames(subscription).map(|frame| Ok::<_, Infallible>(sse_event(frame)));
    Ok(Sse::new(events).into_response())
}

/// Continuous stream of envelopes addressed to one of the caller's devices.
pub async fn receive_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Result<Response, ApiError> {
    let user = current_user(&state.tokens, &headers)?;
    let device = state
        .registry
        .find_user_device(user.sub, &device_id)
        .await?
        .ok_or_else(|| ApiError::from(Error::not_found("device", device_id.clone())))?;

    let subscription = state.broker.subscribe(&device_channel(&device)).await?;
    info!("Device {} receiving over SSE", device_id);

    let events = continuous_frames(subscription).map(|frame| Ok::<_, Infallible>(sse_event(frame)));
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new().interval(state.probe_interval))
        .into_response())
}

/// Publish an envelope to the caller's device `:id`. The sender is resolved
/// by `uniqueId` among the caller's devices; the path names the target.
pub async fn send_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(target): Path<String>,
    payload: Result<Json<SignalRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state.tokens, &headers)?;
    let Json(mut req) = payload?;
    req.device_id = target;
    req.validate()?;

    let sender = state
        .registry
        .find_user_device(user.sub, &req.unique_id)
        .await?
        .ok_or_else(|| ApiError::from(Error::not_found("device", req.unique_id.clone())))?;

    let kind = req.kind.clone();
    let delivered =
        relay_signal(state.broker.as_ref(), state.registry.as_ref(), &sender, req).await?;
    debug!("Sent {} from {} ({})", kind, sender.device_id, delivered);

    Ok(Json(serde_json::json!({ "delivered": delivered })))
}

/// Duplex WebSocket. The access token comes from `?token=` or the
/// Authorization header; the first text frame names the device.
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query
        .token
        .as_deref()
        .or_else(|| extract_token(&headers))
        .ok_or_else(|| ApiError::Unauthorized("Missing token".to_string()))?;
    let claims = state
        .tokens
        .verify(token, TokenKind::Access)
        .map_err(|_| ApiError::Unauthorized("Invalid or expired token".to_string()))?;

    Ok(ws.on_upgrade(move |socket| handle_duplex(state, claims.sub, socket)))
}

async fn handle_duplex(state: Arc<AppState>, user_id: Uuid, socket: WebSocket) {
    let (sender, receiver) = socket.split();
    let tx = sender.with(|frame: WireFrame| ready(Ok::<_, axum::Error>(to_message(frame))));
    let mut rx = receiver.filter_map(|msg| ready(from_message(msg)));

    let device = match state.duplex.handshake(user_id, &mut rx).await {
        Ok(device) => device,
        Err(e) => {
            warn!("Duplex handshake failed: {}", e);
            return;
        }
    };

    let session = match state.duplex.open(device).await {
        Ok(session) => session,
        Err(e) => {
            warn!("Failed to open duplex session: {}", e);
            return;
        }
    };

    session.run(tx, rx).await;
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Ping => Message::Ping(Vec::new()),
        WireFrame::Pong => Message::Pong(Vec::new()),
        WireFrame::Close => Message::Close(None),
    }
}

fn from_message(msg: Result<Message, axum::Error>) -> Option<Result<WireFrame, axum::Error>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(WireFrame::Text(text))),
        Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(|t| Ok(WireFrame::Text(t))),
        Ok(Message::Ping(_)) => Some(Ok(WireFrame::Ping)),
        Ok(Message::Pong(_)) => Some(Ok(WireFrame::Pong)),
        Ok(Message::Close(_)) => Some(Ok(WireFrame::Close)),
        Err(e) => Some(Err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_mapping() {
        assert_eq!(to_message(WireFrame::Text("x".into())), Message::Text("x".into()));
        assert!(matches!(to_message(WireFrame::Ping), Message::Ping(_)));

        assert_eq!(
            from_message(Ok(Message::Binary(b"{}".to_vec()))).unwrap().unwrap(),
            WireFrame::Text("{}".to_string())
        );
        assert!(from_message(Ok(Message::Binary(vec![0xff, 0xfe]))).is_none());
        assert_eq!(
            from_message(Ok(Message::Close(None))).unwrap().unwrap(),
            WireFrame::Close
        );
    }
}
