//! Signaling relay
//!
//! Turns broker subscriptions into transport-neutral frame streams. The HTTP
//! and RPC layers only translate [`StreamFrame`] and [`WireFrame`] to their
//! own wire types.
//!
//! One-shot sessions (login handoff) deliver a single message followed by a
//! completion marker. Duplex sessions forward broker traffic to the peer,
//! republish peer envelopes to their target channel and probe liveness on a
//! fixed interval. Every exit path drops the [`Subscription`], which releases
//! it at the broker.
//!
//! Device channels are named by the registry id of the device, never by the
//! client-chosen `deviceId`, which is only unique per user. Targets named by
//! a sender are resolved among the sender's own devices.

use crate::broker::{Broker, Subscription};
use crate::registry::DeviceRegistry;
use crate::types::{Device, SignalRequest, SignalResponse};
use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::{self, Stream};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// SSE event name of the terminal frame on one-shot streams
pub const COMPLETE_EVENT: &str = "complete";

/// Data carried by the terminal frame on one-shot streams
pub const COMPLETE_DATA: &str = "Authentication completed";

/// Default liveness probe interval on duplex sessions
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Frame emitted on server-to-client event streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// A relayed payload, verbatim
    Message(String),
    /// Terminal marker; nothing follows it
    Complete,
}

/// Frame exchanged with a duplex peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Ping,
    Pong,
    Close,
}

/// Why a duplex session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer sent close or its stream ended
    PeerClosed,
    /// Reading from the peer failed
    TransportError,
    /// Forwarding a broker message to the peer failed
    WriteFailed,
    /// Sending a liveness probe failed
    ProbeFailed,
    /// The broker closed the subscription
    BrokerClosed,
}

impl SessionEnd {
    /// Disconnects are normal terminations, everything else is a failure.
    pub fn is_normal(&self) -> bool {
        matches!(self, SessionEnd::PeerClosed)
    }
}

/// Broker channel carrying envelopes addressed to `device`.
pub fn device_channel(device: &Device) -> String {
    device.id.to_string()
}

/// Serialize `value` and publish it to `channel`.
pub async fn publish_json<T: Serialize + ?Sized>(
    broker: &dyn Broker,
    channel: &str,
    value: &T,
) -> Result<usize> {
    let payload = serde_json::to_vec(value)?;
    broker.publish(channel, Bytes::from(payload)).await
}

enum OneShot {
    Waiting(Subscription),
    Delivered,
    Closed,
}

/// Frames for a one-shot session: the first message, then [`StreamFrame::Complete`].
///
/// Later broker traffic is never read; the subscription is released as soon
/// as the first message arrives. A first message that is not JSON ends the
/// stream with no frames at all.
pub fn one_shot_frames(subscription: Subscription) -> impl Stream<Item = StreamFrame> + Send {
    stream::unfold(OneShot::Waiting(subscription), |state| async move {
        match state {
            OneShot::Waiting(mut sub) => {
                let msg = sub.recv().await?;
                let channel = sub.channel().to_string();
                drop(sub);

                match json_text(&msg.payload) {
                    Some(text) => {
                        debug!("Delivering one-shot message on {}", channel);
                        Some((StreamFrame::Message(text), OneShot::Delivered))
                    }
                    None => {
                        warn!("Malformed one-shot payload on {}, closing", channel);
                        None
                    }
                }
            }
            OneShot::Delivered => Some((StreamFrame::Complete, OneShot::Closed)),
            OneShot::Closed => None,
        }
    })
}

/// Frames for a long-lived receive stream: every valid signaling envelope on
/// the channel, in publish order. Malformed payloads are dropped.
pub fn continuous_frames(subscription: Subscription) -> impl Stream<Item = StreamFrame> + Send {
    stream::unfold(subscription, |mut sub| async move {
        loop {
            let msg = sub.recv().await?;
            match envelope_text(&msg.payload) {
                Some(text) => return Some((StreamFrame::Message(text), sub)),
                None => warn!("Dropping malformed envelope on {}", msg.channel),
            }
        }
    })
}

/// Answer one RPC request: resolve the sender by `uniqueId` among the
/// user's devices and echo the request back enriched with the device
/// record. No broker involvement.
pub async fn resolve_signal(
    registry: &dyn DeviceRegistry,
    user_id: Uuid,
    request: SignalRequest,
) -> Result<SignalResponse> {
    if request.unique_id.is_empty() {
        return Err(Error::InvalidInput("uniqueId is required".to_string()));
    }

    let device = registry
        .find_user_device(user_id, &request.unique_id)
        .await?
        .ok_or_else(|| Error::not_found("device", request.unique_id.clone()))?;

    Ok(request.into_response(&device))
}

/// Publish `request` from `sender` to the device it names in `deviceId`.
/// The target must belong to the sender's user. Returns the number of
/// subscribers the envelope reached.
pub async fn relay_signal(
    broker: &dyn Broker,
    registry: &dyn DeviceRegistry,
    sender: &Device,
    request: SignalRequest,
) -> Result<usize> {
    request.validate()?;

    let target = registry
        .find_user_device(sender.user_id, &request.device_id)
        .await?
        .ok_or_else(|| Error::not_found("device", request.device_id.clone()))?;

    let response = request.into_response(sender);
    let delivered = publish_json(broker, &device_channel(&target), &response).await?;
    debug!(
        "Relayed {} from {} to {} ({})",
        response.kind, sender.device_id, target.device_id, delivered
    );
    Ok(delivered)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceHello {
    #[serde(alias = "device_id")]
    device_id: String,
}

/// Builds duplex sessions
#[derive(Clone)]
pub struct DuplexRelay {
    broker: Arc<dyn Broker>,
    registry: Arc<dyn DeviceRegistry>,
    probe_interval: Duration,
}

impl DuplexRelay {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<dyn DeviceRegistry>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            broker,
            registry,
            probe_interval,
        }
    }

    /// Read the peer's first text frame, `{"deviceId": ...}`, and resolve it
    /// among the user's devices.
    pub async fn handshake<R, E>(&self, user_id: Uuid, rx: &mut R) -> Result<Device>
    where
        R: Stream<Item = std::result::Result<WireFrame, E>> + Unpin,
        E: Display,
    {
        let text = loop {
            match rx.next().await {
                Some(Ok(WireFrame::Text(text))) => break text,
                Some(Ok(WireFrame::Ping)) | Some(Ok(WireFrame::Pong)) => continue,
                Some(Ok(WireFrame::Close)) | None => {
                    return Err(Error::InvalidInput(
                        "session closed before device handshake".to_string(),
                    ))
                }
                Some(Err(e)) => {
                    return Err(Error::InvalidInput(format!("handshake read failed: {}", e)))
                }
            }
        };

        let hello: DeviceHello = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidInput(format!("invalid device handshake: {}", e)))?;

        self.registry
            .find_user_device(user_id, &hello.device_id)
            .await?
            .ok_or_else(|| Error::not_found("device", hello.device_id))
    }

    /// Subscribe to the device's channel. Messages published from here on
    /// are buffered until [`DuplexSession::run`] forwards them.
    pub async fn open(&self, device: Device) -> Result<DuplexSession> {
        let subscription = self.broker.subscribe(&device_channel(&device)).await?;
        info!("Opened duplex session for device {}", device.device_id);
        Ok(DuplexSession {
            device,
            subscription,
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            probe_interval: self.probe_interval,
        })
    }
}

/// An open duplex session bound to one device channel
pub struct DuplexSession {
    device: Device,
    subscription: Subscription,
    broker: Arc<dyn Broker>,
    registry: Arc<dyn DeviceRegistry>,
    probe_interval: Duration,
}

impl DuplexSession {
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Pump until either direction ends. The subscription is released when
    /// this returns.
    pub async fn run<S, R, E>(self, tx: S, rx: R) -> SessionEnd
    where
        S: Sink<WireFrame> + Unpin + Send,
        S::Error: Display,
        R: Stream<Item = std::result::Result<WireFrame, E>> + Unpin + Send,
        E: Display,
    {
        let DuplexSession {
            device,
            subscription,
            broker,
            registry,
            probe_interval,
        } = self;

        let outbound = forward_to_peer(subscription, tx, probe_interval);
        let inbound = forward_to_broker(&device, broker.as_ref(), registry.as_ref(), rx);

        let end = tokio::select! {
            end = outbound => end,
            end = inbound => end,
        };

        if end.is_normal() {
            info!("Duplex session for {} closed by peer", device.device_id);
        } else {
            warn!("Duplex session for {} ended: {:?}", device.device_id, end);
        }
        end
    }
}

async fn forward_to_peer<S>(
    mut subscription: Subscription,
    mut tx: S,
    probe_interval: Duration,
) -> SessionEnd
where
    S: Sink<WireFrame> + Unpin,
    S::Error: Display,
{
    let mut probe = interval_at(Instant::now() + probe_interval, probe_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = subscription.recv() => {
                let Some(msg) = msg else {
                    return SessionEnd::BrokerClosed;
                };
                let Some(text) = envelope_text(&msg.payload) else {
                    warn!("Dropping malformed envelope on {}", msg.channel);
                    continue;
                };
                if let Err(e) = tx.send(WireFrame::Text(text)).await {
                    debug!("Write to peer on {} failed: {}", msg.channel, e);
                    return SessionEnd::WriteFailed;
                }
            }
            _ = probe.tick() => {
                if let Err(e) = tx.send(WireFrame::Ping).await {
                    debug!("Probe on {} failed: {}", subscription.channel(), e);
                    return SessionEnd::ProbeFailed;
                }
            }
        }
    }
}

async fn forward_to_broker<R, E>(
    device: &Device,
    broker: &dyn Broker,
    registry: &dyn DeviceRegistry,
    mut rx: R,
) -> SessionEnd
where
    R: Stream<Item = std::result::Result<WireFrame, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = rx.next().await {
        let text = match frame {
            Ok(WireFrame::Text(text)) => text,
            Ok(WireFrame::Ping) | Ok(WireFrame::Pong) => continue,
            Ok(WireFrame::Close) => return SessionEnd::PeerClosed,
            Err(e) => {
                debug!("Read from {} failed: {}", device.device_id, e);
                return SessionEnd::TransportError;
            }
        };

        let request = match serde_json::from_str::<SignalRequest>(&text) {
            Ok(req) => req,
            Err(e) => {
                warn!("Dropping malformed request from {}: {}", device.device_id, e);
                continue;
            }
        };

        let target = request.device_id.clone();
        match relay_signal(broker, registry, device, request).await {
            Ok(_) => {}
            Err(e @ Error::InvalidInput(_)) | Err(e @ Error::NotFound { .. }) => {
                warn!("Dropping request from {}: {}", device.device_id, e);
            }
            Err(e) => warn!("Publish from {} to {} failed: {}", device.device_id, target, e),
        }
    }
    SessionEnd::PeerClosed
}

fn json_text(payload: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?;
    serde_json::from_str::<serde_json::Value>(text).ok()?;
    Some(text.to_string())
}

fn envelope_text(payload: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?;
    serde_json::from_str::<SignalResponse>(text).ok()?;
    Some(text.to_string())
}
