// ============================
// pairchat-backend-lib/src/bridge.rs
// ============================
//! Cross-process fan-out bus, keyed by room name.
//!
//! Every room publishes through the bridge and receives its own messages
//! back through its subscription, so connections attached to the same room
//! on different server processes see one delivery order. Delivery is
//! at-most-once; order is preserved within a room channel and unspecified
//! across rooms.
use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::ChatError;

/// Buffer depth for a single room subscription.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Process-shared publish/subscribe channel, one logical channel per room.
#[async_trait]
pub trait FanoutBridge: Send + Sync {
    /// Publish a frame to a room channel. Not retried on failure.
    async fn publish(&self, room: &str, payload: String) -> Result<(), ChatError>;

    /// Open a subscription on a room channel.
    async fn subscribe(&self, room: &str) -> Result<BridgeSubscription, ChatError>;
}

/// Inbound stream of frames for one room. Dropping it (or calling
/// [`BridgeSubscription::close`]) cancels the subscription; closing twice
/// is safe.
pub struct BridgeSubscription {
    rx: mpsc::Receiver<String>,
}

impl BridgeSubscription {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next frame, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Cancel the subscription without blocking.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// In-memory bus: a topic map of broadcast channels. Serves single-process
/// deployments and lets tests run several registries against one bus to
/// simulate separate server processes.
#[derive(Default)]
pub struct MemoryBridge {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriber count for a topic (test observability).
    pub fn subscriber_count(&self, room: &str) -> usize {
        self.topics
            .lock()
            .get(room)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, room: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .clone()
    }
}

#[async_trait]
impl FanoutBridge for MemoryBridge {
    async fn publish(&self, room: &str, payload: String) -> Result<(), ChatError> {
        // no subscribers is not an error, the frame is simply dropped
        let _ = self.sender(room).send(payload);
        Ok(())
    }

    async fn subscribe(&self, room: &str) -> Result<BridgeSubscription, ChatError> {
        let mut source = self.sender(room).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let room = room.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // cancellation must not wait for the next frame
                    _ = tx.closed() => break,
                    received = source.recv() => match received {
                        Ok(frame) => {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(room = %room, skipped, "bridge subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(BridgeSubscription::new(rx))
    }
}

/// Redis-backed bus: one Redis pub/sub channel per room, shared by every
/// server process pointed at the same Redis.
pub struct RedisBridge {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
}

impl RedisBridge {
    pub async fn connect(url: &str) -> Result<Self, ChatError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl FanoutBridge for RedisBridge {
    async fn publish(&self, room: &str, payload: String) -> Result<(), ChatError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let _: () = conn.publish(room, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, room: &str) -> Result<BridgeSubscription, ChatError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(room).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let room = room.to_string();

        tokio::spawn(async move {
            {
                let mut stream = pubsub.on_message();
                loop {
                    let msg = tokio::select! {
                        // cancellation must not wait for the next frame
                        _ = tx.closed() => break,
                        msg = stream.next() => match msg {
                            Some(msg) => msg,
                            None => break,
                        },
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(room = %room, error = %e, "undecodable bridge payload");
                            continue;
                        }
                    };
                    if tx.send(payload).await.is_err() {
                        break;
                    }
                }
            }
            if let Err(e) = pubsub.unsubscribe(&room).await {
                debug!(room = %room, error = %e, "unsubscribe after close failed");
            }
        });

        Ok(BridgeSubscription::new(rx))
    }
}
