// ============================
// pairchat-backend-lib/src/lib.rs
// ============================
//! Core functionality for the pairchat relay server: connection lifecycle,
//! room management, matchmaking, and cross-process message fan-out.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod matchmaker;
pub mod metrics;
pub mod room;
pub mod router;
pub mod storage;
pub mod ws_router;

use std::sync::Arc;

use crate::auth::IdentityProvider;
use crate::bridge::FanoutBridge;
use crate::config::Settings;
use crate::matchmaker::MatchmakerHandle;
use crate::storage::RecordStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Settings manager
    pub settings: Arc<Settings>,
    /// Persistent record store for identities and room transcripts
    pub store: Arc<dyn RecordStore>,
    /// Cross-process publish/subscribe bus
    pub bridge: Arc<dyn FanoutBridge>,
    /// Identity provider for incoming connections
    pub identity: Arc<dyn IdentityProvider>,
    /// Handle to this process's registry actor
    pub matchmaker: MatchmakerHandle,
}

impl AppState {
    /// Wire up the application state, spawning the registry actor.
    pub fn new(
        settings: Settings,
        store: Arc<dyn RecordStore>,
        bridge: Arc<dyn FanoutBridge>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let matchmaker = MatchmakerHandle::spawn(bridge.clone());
        Self {
            settings: Arc::new(settings),
            store,
            bridge,
            identity,
            matchmaker,
        }
    }
}
