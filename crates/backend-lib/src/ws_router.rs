// ============================
// pairchat-backend-lib/src/ws_router.rs
// ============================
//! WebSocket route and per-socket lifecycle.
//!
//! The handshake resolves the caller's identity before the upgrade; a
//! rejected credential never becomes a socket. After the upgrade one writer
//! task and the inline reader loop run until either side ends, then the
//! connection is unregistered and its persistence side effects applied.
use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{stream::SplitStream, StreamExt};
use metrics::counter;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use pairchat_common::Identity;

use crate::connection::{self, Connection};
use crate::matchmaker::{apply_persist_ops, Attachment};
use crate::metrics::{WS_CONNECTED, WS_DISCONNECTED};
use crate::router;
use crate::AppState;

/// Create the WebSocket router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/chat", get(chat_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChatQuery {
    /// Optional credential; absent means an anonymous visitor.
    token: Option<String>,
}

/// Handler for WebSocket connections
async fn chat_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ChatQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = match state.identity.identify(query.token.as_deref(), addr.ip()) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(peer = %addr, error = %e, "handshake rejected");
            return e.into_response();
        }
    };

    counter!(WS_CONNECTED).increment(1);
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let assigned_room = match state.store.assigned_room(&identity).await {
        Ok(assigned) => assigned,
        Err(e) => {
            warn!(identity = %identity, error = %e, "assignment lookup failed");
            None
        }
    };

    let conn = Connection::new(identity.clone(), &state.settings.queue);
    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(connection::write_pump(
        conn.clone(),
        sink,
        state.settings.keepalive.clone(),
    ));
    conn.mark_open();

    match state
        .matchmaker
        .register(identity.clone(), conn.clone(), assigned_room)
        .await
    {
        Ok(outcome) => {
            match &outcome.attachment {
                Attachment::Waiting => debug!(identity = %identity, "waiting for a companion"),
                Attachment::Attached { room } => {
                    debug!(identity = %identity, room = %room, "attached to assigned room");
                }
                Attachment::Paired { room, companion } => {
                    info!(identity = %identity, room = %room, companion = %companion, "matched");
                }
            }
            apply_persist_ops(state.store.as_ref(), &outcome.persist).await;
        }
        Err(e) => {
            warn!(identity = %identity, error = %e, "registration failed");
            conn.close();
            writer.abort();
            return;
        }
    }

    tokio::select! {
        () = read_loop(&state, &conn, stream) => {}
        _ = &mut writer => {}
    }

    // Cleanup: close, unregister, persist whatever the teardown decided.
    conn.close();
    match state.matchmaker.unregister(&identity, conn.id).await {
        Ok(ops) => apply_persist_ops(state.store.as_ref(), &ops).await,
        Err(e) => warn!(identity = %identity, error = %e, "unregister failed"),
    }
    writer.abort();
    counter!(WS_DISCONNECTED).increment(1);
    debug!(identity = %identity, "socket closed");
}

/// Inbound loop. The liveness window bounds every wait: it is refreshed by
/// any frame, pongs included, and expiring forces the close path.
async fn read_loop(state: &AppState, conn: &Connection, mut stream: SplitStream<WebSocket>) {
    let pong_window = state.settings.keepalive.pong_timeout();
    let max_frame = state.settings.max_frame_bytes;

    loop {
        let message = match timeout(pong_window, stream.next()).await {
            Err(_) => {
                debug!(identity = %conn.identity, "liveness window expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(identity = %conn.identity, error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if text.len() > max_frame {
                    warn!(
                        identity = %conn.identity,
                        len = text.len(),
                        "inbound frame over size limit"
                    );
                    break;
                }
                router::route(state, conn, text.as_str()).await;
            }
            Message::Close(_) => break,
            // pings are answered by the transport layer; pongs only refresh
            // the liveness window
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                debug!(identity = %conn.identity, "ignoring binary frame");
            }
        }

        if conn.is_closing() {
            break;
        }
    }
}
