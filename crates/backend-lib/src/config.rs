// ============================
// pairchat-backend-lib/src/config.rs
// ============================
//! Configuration management.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Redis URL for the cross-process fan-out bus. When absent, the server
    /// runs with the in-memory bus (single process only).
    pub redis_url: Option<String>,
    /// Data directory path for the flat-file record store
    pub data_dir: PathBuf,
    /// Salt mixed into anonymous visitor fingerprints
    pub fingerprint_salt: String,
    /// Maximum inbound frame size in bytes
    pub max_frame_bytes: usize,
    /// Outbound queue behaviour
    pub queue: QueueSettings,
    /// Keepalive windows
    pub keepalive: KeepaliveSettings,
}

/// Per-connection outbound queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Queue depth before the overflow policy kicks in
    pub capacity: usize,
    /// What to drop when the queue is full
    pub overflow: OverflowPolicy,
}

/// Which end of a full outbound queue loses a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

/// Liveness probe timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveSettings {
    /// Max wait when writing a frame to the peer
    pub write_timeout_secs: u64,
    /// Max time until the next liveness response from the peer
    pub pong_timeout_secs: u64,
    /// Probe interval, must be less than the pong window
    pub ping_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().expect("static socket addr"),
            redis_url: None,
            data_dir: PathBuf::from("data"),
            fingerprint_salt: "pairchat-dev-salt".to_string(),
            max_frame_bytes: 10_000,
            queue: QueueSettings::default(),
            keepalive: KeepaliveSettings::default(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            write_timeout_secs: 10,
            pong_timeout_secs: 60,
            ping_interval_secs: 54,
        }
    }
}

impl KeepaliveSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl Settings {
    /// Load settings: defaults, then `pairchat.toml`, then `PAIRCHAT_*`
    /// environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from("pairchat.toml")
    }

    /// Load settings with an explicit config file path.
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PAIRCHAT_"))
            .extract()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_reference_keepalive_windows() {
        let settings = Settings::default();
        assert_eq!(settings.keepalive.write_timeout(), Duration::from_secs(10));
        assert_eq!(settings.keepalive.pong_timeout(), Duration::from_secs(60));
        assert_eq!(settings.keepalive.ping_interval(), Duration::from_secs(54));
        assert!(settings.keepalive.ping_interval() < settings.keepalive.pong_timeout());
        assert_eq!(settings.max_frame_bytes, 10_000);
        assert!(settings.redis_url.is_none());
    }

    #[test]
    fn test_overflow_policy_parses_kebab_case() {
        let policy: OverflowPolicy = serde_json::from_str(r#""drop-newest""#).unwrap();
        assert_eq!(policy, OverflowPolicy::DropNewest);
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let settings = Settings::load_from("does-not-exist.toml").unwrap();
        assert_eq!(settings.queue.capacity, 256);
        assert_eq!(settings.queue.overflow, OverflowPolicy::DropOldest);
    }
}
