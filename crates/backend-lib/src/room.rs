// ============================
// pairchat-backend-lib/src/room.rs
// ============================
//! Rooms: ephemeral named groups of connections sharing a broadcast scope.
//!
//! A room never writes to a socket directly. Outgoing messages go to the
//! fan-out bridge, and local delivery happens when the room's own bridge
//! subscription hands the frame back — one delivery path, one order, no
//! matter which process the sender was on.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use pairchat_common::Identity;

use crate::bridge::FanoutBridge;
use crate::connection::Connection;
use crate::error::ChatError;
use crate::metrics::MESSAGES_RELAYED;

/// Initial delay before resubscribing after a bridge failure.
const RESUBSCRIBE_BASE: Duration = Duration::from_millis(100);
/// Resubscribe delay cap.
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(5);

type Members = Arc<Mutex<HashMap<Identity, Connection>>>;

/// One live room in this process. The member map is mutated only by the
/// registry actor; the relay task reads it when fanning out.
pub struct Room {
    name: String,
    members: Members,
    outbound_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
}

impl Room {
    /// Create the room and start its background relay task. The relay
    /// subscribes to the bridge channel named after the room and keeps that
    /// subscription alive (with backoff) until the room is torn down.
    pub fn spawn(name: String, bridge: Arc<dyn FanoutBridge>) -> Self {
        let members: Members = Arc::new(Mutex::new(HashMap::new()));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(relay_task(
            name.clone(),
            bridge,
            members.clone(),
            outbound_rx,
            shutdown_rx,
        ));

        Self {
            name,
            members,
            outbound_tx,
            shutdown_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attach(&self, conn: Connection) {
        self.members.lock().insert(conn.identity.clone(), conn);
    }

    /// Remove a member; returns true when the room is now empty.
    pub fn detach(&self, identity: &str) -> bool {
        let mut members = self.members.lock();
        members.remove(identity);
        members.is_empty()
    }

    pub fn member_identities(&self) -> Vec<Identity> {
        self.members.lock().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Hand a frame to the relay task for publication on the bridge.
    pub fn broadcast(&self, frame: String) -> Result<(), ChatError> {
        self.outbound_tx
            .send(frame)
            .map_err(|_| ChatError::BridgeUnavailable(format!("room {} relay gone", self.name)))
    }

    /// Tear the room down: the relay unsubscribes from the bridge before
    /// member references are released.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Background task owning the room's bridge subscription.
async fn relay_task(
    name: String,
    bridge: Arc<dyn FanoutBridge>,
    members: Members,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = RESUBSCRIBE_BASE;

    'relay: loop {
        let mut sub = match bridge.subscribe(&name).await {
            Ok(sub) => {
                backoff = RESUBSCRIBE_BASE;
                sub
            }
            Err(e) => {
                warn!(room = %name, error = %e, "bridge subscribe failed, backing off");
                tokio::select! {
                    _ = shutdown_rx.changed() => break 'relay,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    sub.close();
                    break 'relay;
                }
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        // at-most-once: an undelivered broadcast is not retried
                        if let Err(e) = bridge.publish(&name, frame).await {
                            warn!(room = %name, error = %e, "bridge publish failed");
                        }
                    }
                    None => {
                        sub.close();
                        break 'relay;
                    }
                },
                inbound = sub.recv() => match inbound {
                    Some(frame) => {
                        let connections: Vec<Connection> =
                            members.lock().values().cloned().collect();
                        counter!(MESSAGES_RELAYED).increment(connections.len() as u64);
                        for conn in connections {
                            conn.send(frame.clone());
                        }
                    }
                    None => {
                        debug!(room = %name, "bridge subscription ended, resubscribing");
                        tokio::select! {
                            _ = shutdown_rx.changed() => break 'relay,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
                        break;
                    }
                },
            }
        }
    }

    // subscription is gone by now; release member references
    members.lock().clear();
    debug!(room = %name, "relay task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MemoryBridge;
    use crate::config::{OverflowPolicy, QueueSettings};
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_conn(identity: &str) -> Connection {
        let conn = Connection::new(
            identity.to_string(),
            &QueueSettings {
                capacity: 16,
                overflow: OverflowPolicy::DropOldest,
            },
        );
        conn.mark_open();
        conn
    }

    async fn next_frame(conn: &Connection) -> Option<String> {
        timeout(Duration::from_secs(1), conn.next_outbound())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_broadcast_returns_through_the_bridge() {
        let bridge = Arc::new(MemoryBridge::new());
        let room = Room::spawn("r1".to_string(), bridge);

        let a = test_conn("u1");
        let b = test_conn("u2");
        room.attach(a.clone());
        room.attach(b.clone());

        // allow the relay task to subscribe
        tokio::time::sleep(Duration::from_millis(20)).await;

        room.broadcast("frame-1".to_string()).unwrap();

        assert_eq!(next_frame(&a).await.as_deref(), Some("frame-1"));
        assert_eq!(next_frame(&b).await.as_deref(), Some("frame-1"));
    }

    #[tokio::test]
    async fn test_sender_receives_its_own_broadcast() {
        // uniform ordering: local members hear the bridge echo, senders included
        let bridge = Arc::new(MemoryBridge::new());
        let room = Room::spawn("r1".to_string(), bridge);

        let a = test_conn("u1");
        room.attach(a.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        room.broadcast("self-echo".to_string()).unwrap();
        assert_eq!(next_frame(&a).await.as_deref(), Some("self-echo"));
    }

    #[tokio::test]
    async fn test_detach_reports_empty() {
        let bridge = Arc::new(MemoryBridge::new());
        let room = Room::spawn("r1".to_string(), bridge);

        room.attach(test_conn("u1"));
        room.attach(test_conn("u2"));

        assert!(!room.detach("u1"));
        assert!(room.detach("u2"));
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_bridge_subscription() {
        let bridge = Arc::new(MemoryBridge::new());
        let room = Room::spawn("r1".to_string(), bridge.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.subscriber_count("r1"), 1);

        room.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.subscriber_count("r1"), 0);
    }
}
