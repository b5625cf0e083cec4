// ============================
// pairchat-backend-lib/src/auth.rs
// ============================
//! Identity resolution for incoming connections.
//!
//! Token issuance and verification live outside this crate; the core only
//! needs "resolve this caller to a stable identity". Anonymous visitors are
//! identified by a salted hash of their address, so the same visitor maps to
//! the same identity across reconnects without storing the raw address.

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use pairchat_common::Identity;

use crate::error::ChatError;

/// Resolves a caller to a stable [`Identity`].
pub trait IdentityProvider: Send + Sync {
    /// A verified credential wins; otherwise the caller is identified by
    /// their peer address fingerprint.
    fn identify(&self, credential: Option<&str>, peer: IpAddr) -> Result<Identity, ChatError>;
}

/// Identifies anonymous visitors by scrypt(address, salt).
pub struct FingerprintProvider {
    salt: String,
}

impl FingerprintProvider {
    pub fn new(salt: String) -> Self {
        Self { salt }
    }

    /// scrypt with N=16384, r=8, p=1 and a 32-byte key, base64-encoded.
    pub fn fingerprint(&self, peer: IpAddr) -> Result<Identity, ChatError> {
        let params = scrypt::Params::new(14, 8, 1, 32)
            .map_err(|e| ChatError::Internal(format!("invalid scrypt params: {e}")))?;
        let mut hash = [0u8; 32];
        scrypt::scrypt(
            peer.to_string().as_bytes(),
            self.salt.as_bytes(),
            &params,
            &mut hash,
        )
        .map_err(|e| ChatError::Internal(format!("fingerprint failed: {e}")))?;
        Ok(BASE64.encode(hash))
    }
}

impl IdentityProvider for FingerprintProvider {
    fn identify(&self, _credential: Option<&str>, peer: IpAddr) -> Result<Identity, ChatError> {
        self.fingerprint(peer)
    }
}

/// Accepts callers whose token maps to a known identity, refusing everyone
/// else. Stands in for the external credential verifier in tests and
/// single-tenant deployments.
pub struct StaticTokenProvider {
    tokens: Vec<(String, Identity)>,
    fallback: FingerprintProvider,
}

impl StaticTokenProvider {
    pub fn new(tokens: Vec<(String, Identity)>, salt: String) -> Self {
        Self {
            tokens,
            fallback: FingerprintProvider::new(salt),
        }
    }
}

impl IdentityProvider for StaticTokenProvider {
    fn identify(&self, credential: Option<&str>, peer: IpAddr) -> Result<Identity, ChatError> {
        match credential {
            Some(token) => self
                .tokens
                .iter()
                .find(|(t, _)| t == token)
                .map(|(_, identity)| identity.clone())
                .ok_or_else(|| ChatError::TransportRejected("unknown credential".to_string())),
            None => self.fallback.identify(None, peer),
        }
    }
}
