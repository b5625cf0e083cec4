// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTED: &str = "ws.connections";
pub const WS_DISCONNECTED: &str = "ws.disconnections";
pub const ROOM_CREATED: &str = "rooms.created";
pub const ROOM_REHYDRATED: &str = "rooms.rehydrated";
pub const ROOM_DELETED: &str = "rooms.deleted";
pub const MATCHES_MADE: &str = "matchmaker.paired";
pub const MESSAGES_RELAYED: &str = "messages.relayed";
pub const QUEUE_OVERFLOW: &str = "queue.overflow";
pub const DECODE_ERRORS: &str = "decode.errors";
pub const TRANSCRIPT_FAILURES: &str = "transcript.failures";
