//! Channel broker
//!
//! Named pub/sub channels with at-most-once delivery and no persistence.
//! A message published while nobody is subscribed is lost.
//!
//! [`MemoryBroker`] serves a single node; [`RedisBroker`] shares channels
//! between gateway instances through Redis `PUBLISH`/`SUBSCRIBE`.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, Stream};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Default per-channel buffer before slow subscribers start lagging
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One message received from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Publish/subscribe collaborator used by every relay transport
#[async_trait]
pub trait Broker: Send + Sync {
    /// Returns the number of subscribers the message was handed to.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Live subscription to one channel. Dropping it releases the subscription.
pub struct Subscription {
    channel: String,
    // Declared before `release` so the receiver is gone when the release
    // hook counts remaining receivers.
    rx: broadcast::Receiver<Bytes>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            rx,
            release: None,
        }
    }

    /// Run `release` after the receiver has been dropped.
    pub fn with_release(mut self, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the channel is closed.
    /// Messages lost to lag are logged and skipped.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => {
                    return Some(BrokerMessage {
                        channel: self.channel.clone(),
                        payload,
                    })
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber on {} lagged, {} messages lost", self.channel, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = BrokerMessage> + Send {
        stream::unfold(self, |mut sub| async move {
            let msg = sub.recv().await?;
            Some((msg, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            // Swap in a detached receiver so the real one is released first
            let (_, detached) = broadcast::channel::<Bytes>(1);
            drop(std::mem::replace(&mut self.rx, detached));
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// In-process broker backed by one broadcast channel per name.
/// Channels are created on first subscribe and removed when the last
/// subscriber goes away.
#[derive(Clone)]
pub struct MemoryBroker {
    channels: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of channels with at least one live subscriber
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        check_channel(channel)?;

        let delivered = match self.channels.get(channel) {
            // send only fails when there are no receivers
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };
        debug!("Published to {} ({} subscribers)", channel, delivered);
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        check_channel(channel)?;

        let capacity = self.capacity;
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();

        let channels = self.channels.clone();
        let name = channel.to_string();
        debug!("Subscribed to {}", channel);

        Ok(Subscription::new(channel, rx).with_release(move || {
            if channels
                .remove_if(&name, |_, tx| tx.receiver_count() == 0)
                .is_some()
            {
                debug!("Released channel {}", name);
            }
        }))
    }
}

fn check_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(Error::InvalidInput("channel name is empty".to_string()));
    }
    Ok(())
}

/// Broker backed by a Redis server.
///
/// Publishing goes through one shared, reconnecting connection. Each
/// subscription holds its own pub/sub connection, forwarded into a local
/// broadcast channel until the subscription is dropped.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    publisher: ConnectionManager,
    capacity: usize,
}

impl RedisBroker {
    pub async fn connect(url: &str, capacity: usize) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_connection_manager().await?;
        info!("Connected to Redis broker at {}", url);
        Ok(Self {
            client,
            publisher,
            capacity: capacity.max(1),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        check_channel(channel)?;

        let mut conn = self.publisher.clone();
        let delivered: usize = conn.publish(channel, &payload[..]).await?;
        debug!("Published to {} ({} subscribers)", channel, delivered);
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        check_channel(channel)?;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = broadcast::channel(self.capacity);
        let name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                // Only fails once the subscription has been dropped
                if tx.send(Bytes::copy_from_slice(msg.get_payload_bytes())).is_err() {
                    break;
                }
            }
            debug!("Redis subscription to {} ended", name);
        });
        debug!("Subscribed to {}", channel);

        let abort = forwarder.abort_handle();
        Ok(Subscription::new(channel, rx).with_release(move || abort.abort()))
    }
}
