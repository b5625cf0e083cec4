// ============================
// pairchat-backend-lib/src/router.rs
// ============================
//! Inbound envelope dispatch: publish, join, disconnect.
use chrono::Utc;
use metrics::counter;
use tracing::{debug, warn};

use pairchat_common::{CipherPayload, ClientEnvelope, ErrorCode, ServerEnvelope};

use crate::connection::Connection;
use crate::error::ChatError;
use crate::matchmaker::apply_persist_ops;
use crate::metrics::{DECODE_ERRORS, TRANSCRIPT_FAILURES};
use crate::storage::TranscriptEntry;
use crate::AppState;

/// Parse one raw inbound frame and dispatch it. Malformed input is dropped
/// with a logged decode error; the connection stays open.
pub async fn route(state: &AppState, conn: &Connection, raw: &str) {
    let envelope: ClientEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            counter!(DECODE_ERRORS).increment(1);
            warn!(identity = %conn.identity, error = %e, "dropping undecodable frame");
            return;
        }
    };

    match envelope {
        ClientEnvelope::Publish { message, .. } => handle_publish(state, conn, message).await,
        ClientEnvelope::Join { target_room } => handle_join(state, conn, &target_room).await,
        ClientEnvelope::Disconnect => handle_disconnect(state, conn).await,
    }
}

/// Relay a message to the sender's room. The transcript write is
/// best-effort: on failure the broadcast still goes out, flagged so clients
/// can tell delivered-but-not-saved from saved.
async fn handle_publish(state: &AppState, conn: &Connection, message: CipherPayload) {
    let room = match state.matchmaker.resolve_room(&conn.identity).await {
        Ok(Some(room)) => room,
        Ok(None) => {
            conn.send(
                ServerEnvelope::Error {
                    code: ErrorCode::RoomNotFound,
                    detail: "not attached to a room".to_string(),
                }
                .to_frame(),
            );
            return;
        }
        Err(e) => {
            warn!(identity = %conn.identity, error = %e, "room lookup failed");
            return;
        }
    };

    let entry = TranscriptEntry {
        from: conn.identity.clone(),
        time: Utc::now(),
        message: message.clone(),
    };
    let save_error = match state.store.append_to_transcript(&room, &entry).await {
        Ok(()) => None,
        Err(e) => {
            counter!(TRANSCRIPT_FAILURES).increment(1);
            warn!(room = %room, error = %e, "transcript append failed");
            Some("message delivered but not saved".to_string())
        }
    };

    let frame = ServerEnvelope::Publish {
        message,
        from: conn.identity.clone(),
        error: save_error,
    }
    .to_frame();

    match state.matchmaker.publish_to_room(&room, frame).await {
        Ok(()) => {}
        Err(ChatError::RoomNotFound(_)) => {
            // room died between resolve and publish
            conn.send(
                ServerEnvelope::Error {
                    code: ErrorCode::RoomNotFound,
                    detail: format!("room {room} no longer exists"),
                }
                .to_frame(),
            );
        }
        Err(e) => warn!(room = %room, error = %e, "broadcast failed"),
    }
}

async fn handle_join(state: &AppState, conn: &Connection, target_room: &str) {
    match state.matchmaker.join(&conn.identity, target_room).await {
        Ok(ops) => {
            apply_persist_ops(state.store.as_ref(), &ops).await;
            debug!(identity = %conn.identity, room = %target_room, "joined room");
        }
        Err(ChatError::RoomNotFound(room)) => {
            conn.send(
                ServerEnvelope::Error {
                    code: ErrorCode::RoomNotFound,
                    detail: format!("room {room} does not exist"),
                }
                .to_frame(),
            );
        }
        Err(e) => warn!(identity = %conn.identity, error = %e, "join failed"),
    }
}

/// End the conversation for every member of the sender's room. Repeats are
/// no-ops: an already-torn-down room resolves to an empty outcome.
async fn handle_disconnect(state: &AppState, conn: &Connection) {
    match state.matchmaker.disconnect(&conn.identity).await {
        Ok(outcome) => {
            if !outcome.closed.is_empty() {
                debug!(
                    identity = %conn.identity,
                    members = outcome.closed.len(),
                    "conversation ended"
                );
            }
            apply_persist_ops(state.store.as_ref(), &outcome.persist).await;
        }
        Err(e) => warn!(identity = %conn.identity, error = %e, "disconnect failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FingerprintProvider;
    use crate::bridge::MemoryBridge;
    use crate::config::Settings;
    use crate::storage::{MemoryStore, RecordStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_state() -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(
            Settings::default(),
            store.clone(),
            Arc::new(MemoryBridge::new()),
            Arc::new(FingerprintProvider::new("salt".to_string())),
        );
        (state, store)
    }

    fn test_conn(state: &AppState, identity: &str) -> Connection {
        let conn = Connection::new(identity.to_string(), &state.settings.queue);
        conn.mark_open();
        conn
    }

    fn payload(data: &str) -> CipherPayload {
        CipherPayload {
            data: data.to_string(),
            salt: "s".to_string(),
            iv: "i".to_string(),
        }
    }

    async fn next_frame(conn: &Connection) -> Option<String> {
        timeout(Duration::from_secs(1), conn.next_outbound())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_undecodable_frame_leaves_connection_open() {
        let (state, _) = test_state();
        let conn = test_conn(&state, "u1");
        state
            .matchmaker
            .register("u1".to_string(), conn.clone(), None)
            .await
            .unwrap();

        route(&state, &conn, "{not json").await;
        route(&state, &conn, r#"{"action":"warp"}"#).await;

        assert!(!conn.is_closing());
        assert_eq!(conn.try_next_outbound(), None);
    }

    #[tokio::test]
    async fn test_publish_without_room_reports_error() {
        let (state, _) = test_state();
        let conn = test_conn(&state, "u1");
        state
            .matchmaker
            .register("u1".to_string(), conn.clone(), None)
            .await
            .unwrap();

        route(
            &state,
            &conn,
            &serde_json::to_string(&ClientEnvelope::Publish {
                message: payload("x"),
                target_room: None,
            })
            .unwrap(),
        )
        .await;

        let frame = next_frame(&conn).await.unwrap();
        let reply: ServerEnvelope = serde_json::from_str(&frame).unwrap();
        assert!(matches!(
            reply,
            ServerEnvelope::Error { code: ErrorCode::RoomNotFound, .. }
        ));
    }

    #[tokio::test]
    async fn test_publish_appends_transcript_and_echoes() {
        let (state, store) = test_state();
        let conn = test_conn(&state, "u1");
        state
            .matchmaker
            .register("u1".to_string(), conn.clone(), Some("r1".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        route(
            &state,
            &conn,
            r#"{"action":"publish","message":{"data":"x","salt":"s","iv":"i"}}"#,
        )
        .await;

        // the sender hears its own broadcast back through the bridge
        let frame = next_frame(&conn).await.unwrap();
        let echo: ServerEnvelope = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            echo,
            ServerEnvelope::Publish {
                message: payload("x"),
                from: "u1".to_string(),
                error: None,
            }
        );

        let transcript = store.room_transcript("r1").await.unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].from, "u1");
        assert_eq!(transcript[0].message, payload("x"));
    }

    #[tokio::test]
    async fn test_publish_broadcasts_despite_persistence_failure() {
        let (state, store) = test_state();
        let conn = test_conn(&state, "u1");
        state
            .matchmaker
            .register("u1".to_string(), conn.clone(), Some("r1".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.fail_appends(true);
        route(
            &state,
            &conn,
            r#"{"action":"publish","message":{"data":"x","salt":"s","iv":"i"}}"#,
        )
        .await;

        let frame = next_frame(&conn).await.unwrap();
        let echo: ServerEnvelope = serde_json::from_str(&frame).unwrap();
        let ServerEnvelope::Publish { error, .. } = echo else {
            panic!("expected a publish echo");
        };
        assert_eq!(error.as_deref(), Some("message delivered but not saved"));
    }

    #[tokio::test]
    async fn test_join_missing_room_replies_room_not_found() {
        let (state, _) = test_state();
        let conn = test_conn(&state, "u1");
        state
            .matchmaker
            .register("u1".to_string(), conn.clone(), None)
            .await
            .unwrap();

        route(&state, &conn, r#"{"action":"join","target_room":"r9"}"#).await;

        let frame = next_frame(&conn).await.unwrap();
        let reply: ServerEnvelope = serde_json::from_str(&frame).unwrap();
        assert!(matches!(
            reply,
            ServerEnvelope::Error { code: ErrorCode::RoomNotFound, .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_clears_assignments_and_room() {
        let (state, store) = test_state();
        let c1 = test_conn(&state, "u1");
        let c2 = test_conn(&state, "u2");
        state
            .matchmaker
            .register("u1".to_string(), c1.clone(), None)
            .await
            .unwrap();
        state
            .matchmaker
            .register("u2".to_string(), c2.clone(), None)
            .await
            .unwrap();
        // both got their match notification
        assert!(next_frame(&c1).await.is_some());
        assert!(next_frame(&c2).await.is_some());

        route(&state, &c1, r#"{"action":"disconnect"}"#).await;

        assert!(c1.is_closing());
        assert!(c2.is_closing());
        assert_eq!(store.assigned_room("u1").await.unwrap(), None);
        assert_eq!(store.assigned_room("u2").await.unwrap(), None);

        // repeated disconnect is a no-op
        route(&state, &c1, r#"{"action":"disconnect"}"#).await;
    }
}
