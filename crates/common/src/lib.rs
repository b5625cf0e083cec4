// ================
// common/src/lib.rs
// ================
//! Wire protocol shared by the pairchat client and server.
//!
//! Every frame on the wire is a JSON object tagged by its `action` field.
//! The ciphertext payload is opaque to the server: it is carried unchanged
//! from the sending client to every member of the room.

use serde::{Deserialize, Serialize};

/// Stable handle for one participant across reconnects: a fingerprint,
/// a hashed address, or an authenticated user id.
pub type Identity = String;

/// Opaque end-to-end encrypted payload. The server never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherPayload {
    pub data: String,
    pub salt: String,
    pub iv: String,
}

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Relay a message to the sender's current room. The room is resolved
    /// server-side; a `target_room` supplied by the client is ignored.
    Publish {
        message: CipherPayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_room: Option<String>,
    },
    /// Attach to an already-existing room.
    Join { target_room: String },
    /// End the conversation for every member of the sender's room.
    Disconnect,
}

/// Frames sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Emitted to both parties when the matchmaker pairs them.
    Connected,
    /// A relayed room message. `error` is populated when the message was
    /// delivered but could not be saved to the transcript.
    Publish {
        message: CipherPayload,
        from: Identity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A request-scoped failure, e.g. joining a room that does not exist.
    Error { code: ErrorCode, detail: String },
}

/// Machine-readable error codes carried on `ServerEnvelope::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomNotFound,
    PersistenceFailure,
}

impl ServerEnvelope {
    /// Serialize for the wire. The envelope types contain nothing that can
    /// fail to serialize, so a failure collapses to an error frame.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            String::from(r#"{"action":"error","code":"persistence_failure","detail":"encode failed"}"#)
        })
    }
}
