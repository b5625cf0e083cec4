// ============================
// pairchat-backend-lib/src/matchmaker.rs
// ============================
//! The registry actor: room assignment and pairing for live connections.
//!
//! All shared registry state — the connection map, the free set, and the
//! room map — is owned by one actor task and mutated only through its
//! command channel. That single ownership boundary is what keeps eviction,
//! pairing, and teardown atomic: a half-closed connection is never
//! matchable, and rehydrated rooms are deduplicated by the room-name map.
//!
//! The actor performs no I/O. Persistence work (assignments, room
//! deletions) is described as [`PersistOp`] values in each reply and
//! executed by the caller, outside the actor.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use pairchat_common::{Identity, ServerEnvelope};

use crate::bridge::FanoutBridge;
use crate::connection::{Connection, ConnectionId};
use crate::error::ChatError;
use crate::metrics::{MATCHES_MADE, ROOM_CREATED, ROOM_DELETED, ROOM_REHYDRATED};
use crate::room::Room;
use crate::storage::RecordStore;

/// Persistence side effect to run after an actor reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOp {
    Assign {
        identity: Identity,
        room: Option<String>,
    },
    DeleteRoom {
        room: String,
    },
}

/// How a registration resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// No free counterpart yet; parked in the free set.
    Waiting,
    /// Joined an already-assigned room (live or rehydrated).
    Attached { room: String },
    /// Matched with a free counterpart in a new room.
    Paired { room: String, companion: Identity },
}

/// Reply to a `register` call.
#[derive(Debug)]
pub struct RegisterOutcome {
    pub attachment: Attachment,
    pub persist: Vec<PersistOp>,
}

/// Reply to a `disconnect` call.
#[derive(Debug, Default)]
pub struct DisconnectOutcome {
    /// Identities whose connections were closed, sender included.
    pub closed: Vec<Identity>,
    pub persist: Vec<PersistOp>,
}

/// Registry counters, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub free: usize,
    pub rooms: usize,
}

/// Message sent *into* the actor
enum Command {
    Register {
        identity: Identity,
        conn: Connection,
        assigned_room: Option<String>,
        resp: oneshot::Sender<RegisterOutcome>,
    },
    Unregister {
        identity: Identity,
        conn_id: ConnectionId,
        resp: oneshot::Sender<Vec<PersistOp>>,
    },
    Join {
        identity: Identity,
        target_room: String,
        resp: oneshot::Sender<Result<Vec<PersistOp>, ChatError>>,
    },
    Disconnect {
        identity: Identity,
        resp: oneshot::Sender<DisconnectOutcome>,
    },
    ResolveRoom {
        identity: Identity,
        resp: oneshot::Sender<Option<String>>,
    },
    PublishToRoom {
        room: String,
        frame: String,
        resp: oneshot::Sender<Result<(), ChatError>>,
    },
    Stats {
        resp: oneshot::Sender<RegistryStats>,
    },
}

/// Handle that other components keep: the actor's command channel.
#[derive(Clone)]
pub struct MatchmakerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl MatchmakerHandle {
    /// Spawn the registry actor for this process.
    pub fn spawn(bridge: Arc<dyn FanoutBridge>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let registry = Registry::new(bridge);
        tokio::spawn(registry.run(cmd_rx));
        Self { cmd_tx }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ChatError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx.send(make(resp_tx))?;
        resp_rx
            .await
            .map_err(|_| ChatError::Internal("registry unavailable".to_string()))
    }

    /// Register a connection, evicting any prior connection for the same
    /// identity. Attaches to the assigned room when one exists (rehydrating
    /// it if needed), otherwise enters the free set and attempts a pairing.
    pub async fn register(
        &self,
        identity: Identity,
        conn: Connection,
        assigned_room: Option<String>,
    ) -> Result<RegisterOutcome, ChatError> {
        self.call(|resp| Command::Register {
            identity,
            conn,
            assigned_room,
            resp,
        })
        .await
    }

    /// Remove a connection from the registry. Stale connection ids (an
    /// evicted predecessor, a repeated call) are no-ops.
    pub async fn unregister(
        &self,
        identity: &str,
        conn_id: ConnectionId,
    ) -> Result<Vec<PersistOp>, ChatError> {
        self.call(|resp| Command::Unregister {
            identity: identity.to_string(),
            conn_id,
            resp,
        })
        .await
    }

    /// Attach an already-registered connection to a live room.
    pub async fn join(
        &self,
        identity: &str,
        target_room: &str,
    ) -> Result<Vec<PersistOp>, ChatError> {
        self.call(|resp| Command::Join {
            identity: identity.to_string(),
            target_room: target_room.to_string(),
            resp,
        })
        .await?
    }

    /// Tear down the sender's room, closing every member connection.
    pub async fn disconnect(&self, identity: &str) -> Result<DisconnectOutcome, ChatError> {
        self.call(|resp| Command::Disconnect {
            identity: identity.to_string(),
            resp,
        })
        .await
    }

    /// The room the identity is currently attached to, if any.
    pub async fn resolve_room(&self, identity: &str) -> Result<Option<String>, ChatError> {
        self.call(|resp| Command::ResolveRoom {
            identity: identity.to_string(),
            resp,
        })
        .await
    }

    /// Broadcast a serialized frame to a live room via the bridge.
    pub async fn publish_to_room(&self, room: &str, frame: String) -> Result<(), ChatError> {
        self.call(|resp| Command::PublishToRoom {
            room: room.to_string(),
            frame,
            resp,
        })
        .await?
    }

    pub async fn stats(&self) -> Result<RegistryStats, ChatError> {
        self.call(|resp| Command::Stats { resp }).await
    }
}

/// Run the persistence side effects from an actor reply. Failures are
/// logged and do not roll back the in-memory transition.
pub async fn apply_persist_ops(store: &dyn RecordStore, ops: &[PersistOp]) {
    for op in ops {
        let result = match op {
            PersistOp::Assign { identity, room } => {
                store.set_assigned_room(identity, room.as_deref()).await
            }
            PersistOp::DeleteRoom { room } => store.delete_room(room).await,
        };
        if let Err(e) = result {
            tracing::warn!(?op, error = %e, "persistence side effect failed");
        }
    }
}

struct ConnectionEntry {
    conn: Connection,
    room: Option<String>,
}

struct Registry {
    bridge: Arc<dyn FanoutBridge>,
    connections: HashMap<Identity, ConnectionEntry>,
    free: HashSet<Identity>,
    rooms: HashMap<String, Room>,
}

impl Registry {
    fn new(bridge: Arc<dyn FanoutBridge>) -> Self {
        Self {
            bridge,
            connections: HashMap::new(),
            free: HashSet::new(),
            rooms: HashMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Register {
                    identity,
                    conn,
                    assigned_room,
                    resp,
                } => {
                    let _ = resp.send(self.handle_register(identity, conn, assigned_room));
                }
                Command::Unregister {
                    identity,
                    conn_id,
                    resp,
                } => {
                    let _ = resp.send(self.handle_unregister(&identity, conn_id));
                }
                Command::Join {
                    identity,
                    target_room,
                    resp,
                } => {
                    let _ = resp.send(self.handle_join(&identity, &target_room));
                }
                Command::Disconnect { identity, resp } => {
                    let _ = resp.send(self.handle_disconnect(&identity));
                }
                Command::ResolveRoom { identity, resp } => {
                    let room = self
                        .connections
                        .get(&identity)
                        .and_then(|entry| entry.room.clone());
                    let _ = resp.send(room);
                }
                Command::PublishToRoom { room, frame, resp } => {
                    let result = match self.rooms.get(&room) {
                        Some(live) => live.broadcast(frame),
                        None => Err(ChatError::RoomNotFound(room)),
                    };
                    let _ = resp.send(result);
                }
                Command::Stats { resp } => {
                    let _ = resp.send(RegistryStats {
                        connections: self.connections.len(),
                        free: self.free.len(),
                        rooms: self.rooms.len(),
                    });
                }
            }
        }
        debug!("registry actor stopped");
    }

    fn handle_register(
        &mut self,
        identity: Identity,
        conn: Connection,
        assigned_room: Option<String>,
    ) -> RegisterOutcome {
        let mut persist = Vec::new();

        // Idempotent reconnect: at most one active connection per identity.
        // The eviction and the re-attach happen in this same actor turn, so
        // the room never observes an intermediate empty state.
        let evicted_room = self.evict(&identity);

        let attachment = match assigned_room {
            Some(room_name) => {
                self.attach(&identity, conn.clone(), &room_name);
                Attachment::Attached { room: room_name }
            }
            None => match self.take_candidate(&identity) {
                Some(companion) => {
                    let room_name = Uuid::new_v4().to_string();
                    let room = Room::spawn(room_name.clone(), self.bridge.clone());
                    self.rooms.insert(room_name.clone(), room);
                    counter!(ROOM_CREATED).increment(1);
                    counter!(MATCHES_MADE).increment(1);

                    self.attach(&identity, conn.clone(), &room_name);
                    if let Some(entry) = self.connections.get_mut(&companion) {
                        entry.room = Some(room_name.clone());
                        if let Some(live) = self.rooms.get(&room_name) {
                            live.attach(entry.conn.clone());
                        }
                        // match notification goes straight onto both queues
                        let frame = ServerEnvelope::Connected.to_frame();
                        entry.conn.send(frame.clone());
                        conn.send(frame);
                    }

                    persist.push(PersistOp::Assign {
                        identity: identity.clone(),
                        room: Some(room_name.clone()),
                    });
                    persist.push(PersistOp::Assign {
                        identity: companion.clone(),
                        room: Some(room_name.clone()),
                    });

                    info!(room = %room_name, a = %identity, b = %companion, "paired");
                    Attachment::Paired {
                        room: room_name,
                        companion,
                    }
                }
                None => {
                    self.free.insert(identity.clone());
                    self.connections.insert(
                        identity.clone(),
                        ConnectionEntry { conn, room: None },
                    );
                    Attachment::Waiting
                }
            },
        };

        // The evicted connection's old room may now be empty, unless the
        // replacement just re-attached to it.
        if let Some(old_room) = evicted_room {
            let still_current = matches!(
                &attachment,
                Attachment::Attached { room } | Attachment::Paired { room, .. }
                    if *room == old_room
            );
            if !still_current {
                self.teardown_if_empty(&old_room, &mut persist);
            }
        }

        RegisterOutcome {
            attachment,
            persist,
        }
    }

    fn handle_unregister(&mut self, identity: &str, conn_id: ConnectionId) -> Vec<PersistOp> {
        let mut persist = Vec::new();

        let is_current = self
            .connections
            .get(identity)
            .map(|entry| entry.conn.id == conn_id)
            .unwrap_or(false);
        if !is_current {
            // already gone, or the id belongs to an evicted predecessor
            return persist;
        }

        if let Some(entry) = self.connections.remove(identity) {
            self.free.remove(identity);
            entry.conn.close();
            if let Some(room_name) = entry.room {
                if let Some(room) = self.rooms.get(&room_name) {
                    room.detach(identity);
                }
                self.teardown_if_empty(&room_name, &mut persist);
            }
        }
        persist
    }

    fn handle_join(
        &mut self,
        identity: &str,
        target_room: &str,
    ) -> Result<Vec<PersistOp>, ChatError> {
        if !self.rooms.contains_key(target_room) {
            return Err(ChatError::RoomNotFound(target_room.to_string()));
        }
        let Some(entry) = self.connections.get_mut(identity) else {
            return Err(ChatError::Internal(format!(
                "join from unregistered identity {identity}"
            )));
        };

        // repeated join for the current room is a no-op
        if entry.room.as_deref() == Some(target_room) {
            return Ok(Vec::new());
        }

        let mut persist = Vec::new();
        let conn = entry.conn.clone();
        let previous = entry.room.replace(target_room.to_string());

        self.free.remove(identity);
        if let Some(old_room) = previous {
            if let Some(room) = self.rooms.get(&old_room) {
                room.detach(identity);
            }
            self.teardown_if_empty(&old_room, &mut persist);
        }
        if let Some(room) = self.rooms.get(target_room) {
            room.attach(conn);
        }
        persist.push(PersistOp::Assign {
            identity: identity.to_string(),
            room: Some(target_room.to_string()),
        });
        Ok(persist)
    }

    fn handle_disconnect(&mut self, identity: &str) -> DisconnectOutcome {
        let mut outcome = DisconnectOutcome::default();

        let Some(room_name) = self
            .connections
            .get(identity)
            .and_then(|entry| entry.room.clone())
        else {
            // no room: repeated disconnect, or a free connection — no-op
            return outcome;
        };

        let Some(room) = self.rooms.remove(&room_name) else {
            return outcome;
        };

        for member in room.member_identities() {
            if let Some(entry) = self.connections.remove(&member) {
                entry.conn.close();
            }
            self.free.remove(&member);
            outcome.persist.push(PersistOp::Assign {
                identity: member.clone(),
                room: None,
            });
            outcome.closed.push(member);
        }

        room.shutdown();
        counter!(ROOM_DELETED).increment(1);
        outcome.persist.push(PersistOp::DeleteRoom { room: room_name });
        outcome
    }

    /// Remove any prior connection for this identity, closing it. Returns
    /// the room it was attached to, whose emptiness is the caller's problem.
    fn evict(&mut self, identity: &str) -> Option<String> {
        let entry = self.connections.remove(identity)?;
        self.free.remove(identity);
        entry.conn.close();
        debug!(identity = %identity, "evicted stale connection");
        if let Some(room_name) = &entry.room {
            if let Some(room) = self.rooms.get(room_name) {
                room.detach(identity);
            }
        }
        entry.room
    }

    /// Attach a connection to a room, rehydrating the room if it is not
    /// live in this process. The room-name map guarantees one live room
    /// object per name.
    fn attach(&mut self, identity: &str, conn: Connection, room_name: &str) {
        if !self.rooms.contains_key(room_name) {
            let room = Room::spawn(room_name.to_string(), self.bridge.clone());
            self.rooms.insert(room_name.to_string(), room);
            counter!(ROOM_REHYDRATED).increment(1);
            debug!(room = %room_name, "rehydrated room");
        }
        if let Some(room) = self.rooms.get(room_name) {
            room.attach(conn.clone());
        }
        self.free.remove(identity);
        self.connections.insert(
            identity.to_string(),
            ConnectionEntry {
                conn,
                room: Some(room_name.to_string()),
            },
        );
    }

    /// Any free connection other than the one being registered. O(free set),
    /// no fairness promised.
    fn take_candidate(&mut self, exclude: &str) -> Option<Identity> {
        let candidate = self
            .free
            .iter()
            .find(|candidate| candidate.as_str() != exclude)
            .cloned()?;
        self.free.remove(&candidate);
        Some(candidate)
    }

    /// Empty rooms are torn down in the same registry operation that
    /// emptied them.
    fn teardown_if_empty(&mut self, room_name: &str, persist: &mut Vec<PersistOp>) {
        let empty = self
            .rooms
            .get(room_name)
            .map(|room| room.is_empty())
            .unwrap_or(false);
        if empty {
            if let Some(room) = self.rooms.remove(room_name) {
                room.shutdown();
            }
            counter!(ROOM_DELETED).increment(1);
            persist.push(PersistOp::DeleteRoom {
                room: room_name.to_string(),
            });
            debug!(room = %room_name, "room torn down");
        }
    }
}
