// ============================
// pairchat-backend-lib/src/connection.rs
// ============================
//! Per-connection state: identity, outbound queue, and the writer pump.
//!
//! One `Connection` exists per live socket. Producers (rooms, the router,
//! the matchmaker) push frames onto the bounded outbound queue and never
//! block; the writer pump drains the queue onto the wire and emits the
//! liveness probe. The reader side lives in `ws_router`, next to the
//! socket it owns.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use pairchat_common::Identity;

use crate::config::{KeepaliveSettings, OverflowPolicy, QueueSettings};
use crate::metrics::QUEUE_OVERFLOW;

/// Distinguishes successive connections of the same identity, so a stale
/// unregister cannot evict a replacement connection.
pub type ConnectionId = Uuid;

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Cheap-to-clone handle to one live connection.
#[derive(Clone)]
pub struct Connection {
    pub identity: Identity,
    pub id: ConnectionId,
    queue: Arc<OutboundQueue>,
    state: Arc<AtomicU8>,
}

impl Connection {
    pub fn new(identity: Identity, queue: &QueueSettings) -> Self {
        Self {
            identity,
            id: Uuid::new_v4(),
            queue: Arc::new(OutboundQueue::new(queue.capacity, queue.overflow)),
            state: Arc::new(AtomicU8::new(ConnState::Connecting as u8)),
        }
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Handshake done, reader and writer running.
    pub fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            ConnState::Connecting as u8,
            ConnState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Enqueue a frame for delivery. Never blocks; on a full queue the
    /// configured overflow policy drops a frame and the overflow is logged.
    pub fn send(&self, frame: String) {
        if self.is_closing() {
            return;
        }
        if let Some(dropped) = self.queue.push(frame) {
            counter!(QUEUE_OVERFLOW).increment(1);
            warn!(
                identity = %self.identity,
                policy = ?self.queue.policy,
                dropped_bytes = dropped.len(),
                "outbound queue overflow"
            );
        }
    }

    /// Begin teardown. Idempotent and safe to call from any task: the first
    /// call moves `Open -> Closing` and wakes the writer, later calls are
    /// no-ops.
    pub fn close(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnState::Closing as u8 {
                return;
            }
            match self.state.compare_exchange(
                current,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.queue.close();
    }

    pub fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) >= ConnState::Closing as u8
    }

    fn mark_closed(&self) {
        self.state.store(ConnState::Closed as u8, Ordering::Release);
    }

    /// Next frame to write, or `None` once the connection is closing and the
    /// queue is drained. Single consumer: the writer pump.
    pub async fn next_outbound(&self) -> Option<String> {
        self.queue.next().await
    }

    /// Non-blocking variant of [`Connection::next_outbound`].
    pub fn try_next_outbound(&self) -> Option<String> {
        self.queue.try_pop()
    }
}

/// Bounded FIFO with a configurable full-queue policy.
struct OutboundQueue {
    frames: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

struct QueueInner {
    frames: VecDeque<String>,
    closed: bool,
}

impl OutboundQueue {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            frames: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    /// Push a frame, returning the frame that was dropped, if any.
    fn push(&self, frame: String) -> Option<String> {
        let dropped = {
            let mut inner = self.frames.lock();
            if inner.closed {
                return None;
            }
            if inner.frames.len() < self.capacity {
                inner.frames.push_back(frame);
                None
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let dropped = inner.frames.pop_front();
                        inner.frames.push_back(frame);
                        dropped
                    }
                    OverflowPolicy::DropNewest => Some(frame),
                }
            }
        };
        self.notify.notify_one();
        dropped
    }

    fn try_pop(&self) -> Option<String> {
        self.frames.lock().frames.pop_front()
    }

    fn close(&self) {
        self.frames.lock().closed = true;
        self.notify.notify_one();
    }

    async fn next(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.frames.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Writer pump: drains the outbound queue onto the socket and emits the
/// periodic liveness probe. Exits when the connection closes or the
/// transport fails, leaving the connection in `Closed`.
pub async fn write_pump(
    conn: Connection,
    mut sink: SplitSink<WebSocket, Message>,
    keepalive: KeepaliveSettings,
) {
    let start = tokio::time::Instant::now() + keepalive.ping_interval();
    let mut ping = tokio::time::interval_at(start, keepalive.ping_interval());

    loop {
        tokio::select! {
            frame = conn.next_outbound() => match frame {
                Some(text) => {
                    let write = sink.send(Message::Text(text.into()));
                    match timeout(keepalive.write_timeout(), write).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(identity = %conn.identity, error = %e, "write failed");
                            break;
                        }
                        Err(_) => {
                            debug!(identity = %conn.identity, "write timed out");
                            break;
                        }
                    }
                }
                // queue closed and drained: say goodbye
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                let probe = sink.send(Message::Ping(axum::body::Bytes::new()));
                match timeout(keepalive.write_timeout(), probe).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(identity = %conn.identity, "liveness probe failed");
                        break;
                    }
                }
            }
        }
    }

    conn.close();
    conn.mark_closed();
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_settings(capacity: usize, overflow: OverflowPolicy) -> QueueSettings {
        QueueSettings { capacity, overflow }
    }

    #[test]
    fn test_state_machine_moves_forward_only() {
        let conn = Connection::new(
            "u1".to_string(),
            &queue_settings(4, OverflowPolicy::DropOldest),
        );
        assert_eq!(conn.state(), ConnState::Connecting);

        conn.mark_open();
        assert_eq!(conn.state(), ConnState::Open);

        conn.close();
        assert_eq!(conn.state(), ConnState::Closing);

        // re-opening a closing connection is not possible
        conn.mark_open();
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[test]
    fn test_close_is_idempotent() {
        let conn = Connection::new(
            "u1".to_string(),
            &queue_settings(4, OverflowPolicy::DropOldest),
        );
        conn.mark_open();
        conn.close();
        conn.close();
        assert!(conn.is_closing());
    }

    #[test]
    fn test_drop_oldest_overflow() {
        let conn = Connection::new(
            "u1".to_string(),
            &queue_settings(2, OverflowPolicy::DropOldest),
        );
        conn.mark_open();
        conn.send("a".to_string());
        conn.send("b".to_string());
        conn.send("c".to_string());

        assert_eq!(conn.try_next_outbound().as_deref(), Some("b"));
        assert_eq!(conn.try_next_outbound().as_deref(), Some("c"));
        assert_eq!(conn.try_next_outbound(), None);
    }

    #[test]
    fn test_drop_newest_overflow() {
        let conn = Connection::new(
            "u1".to_string(),
            &queue_settings(2, OverflowPolicy::DropNewest),
        );
        conn.mark_open();
        conn.send("a".to_string());
        conn.send("b".to_string());
        conn.send("c".to_string());

        assert_eq!(conn.try_next_outbound().as_deref(), Some("a"));
        assert_eq!(conn.try_next_outbound().as_deref(), Some("b"));
        assert_eq!(conn.try_next_outbound(), None);
    }

    #[test]
    fn test_send_after_close_is_dropped() {
        let conn = Connection::new(
            "u1".to_string(),
            &queue_settings(4, OverflowPolicy::DropOldest),
        );
        conn.mark_open();
        conn.close();
        conn.send("late".to_string());
        assert_eq!(conn.try_next_outbound(), None);
    }

    #[tokio::test]
    async fn test_next_outbound_wakes_on_send() {
        let conn = Connection::new(
            "u1".to_string(),
            &queue_settings(4, OverflowPolicy::DropOldest),
        );
        conn.mark_open();

        let waiter = conn.clone();
        let handle = tokio::spawn(async move { waiter.next_outbound().await });

        tokio::task::yield_now().await;
        conn.send("wake".to_string());

        assert_eq!(handle.await.unwrap().as_deref(), Some("wake"));
    }

    #[tokio::test]
    async fn test_next_outbound_returns_none_after_drain_and_close() {
        let conn = Connection::new(
            "u1".to_string(),
            &queue_settings(4, OverflowPolicy::DropOldest),
        );
        conn.mark_open();
        conn.send("last".to_string());
        conn.close();

        assert_eq!(conn.next_outbound().await.as_deref(), Some("last"));
        assert_eq!(conn.next_outbound().await, None);
    }

    #[test]
    fn test_connection_ids_distinguish_reconnects() {
        let a = Connection::new(
            "u1".to_string(),
            &queue_settings(4, OverflowPolicy::DropOldest),
        );
        let b = Connection::new(
            "u1".to_string(),
            &queue_settings(4, OverflowPolicy::DropOldest),
        );
        assert_ne!(a.id, b.id);
    }
}
