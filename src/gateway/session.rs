//! SSH client handler with trust-on-first-use host key verification.
//!
//! # Architecture
//!
//! - `SshClientHandler`: A russh client handler that computes the SHA-256
//!   fingerprint of the server key and either adopts it (no stored
//!   fingerprint) or requires an exact match (stored fingerprint).
//! - The observed fingerprint is written into a shared slot so the caller can
//!   persist it after the dial succeeds.
//!
//! A mismatch rejects the key, which makes russh abort the handshake. It is
//! never silently ignored.

use std::sync::{Arc, Mutex};

use russh::{client, keys};
use tracing::warn;

/// Shared slot receiving the fingerprint observed during the handshake.
pub type FingerprintSlot = Arc<Mutex<Option<String>>>;

/// Client handler for russh implementing trust-on-first-use.
pub struct SshClientHandler {
    expected: Option<String>,
    observed: FingerprintSlot,
}

impl SshClientHandler {
    /// Create a handler that expects `expected` (or adopts the first key seen
    /// when `None`) and reports the observed key into `observed`.
    pub fn new(expected: Option<String>, observed: FingerprintSlot) -> Self {
        Self {
            expected: expected.filter(|fp| !fp.trim().is_empty()),
            observed,
        }
    }
}

/// Format a public key fingerprint as `SHA256:<base64>`.
pub fn fingerprint_of(key: &keys::PublicKey) -> String {
    key.fingerprint(keys::HashAlg::Sha256).to_string()
}

/// Decide whether an observed fingerprint is acceptable.
pub(crate) fn verify_fingerprint(expected: Option<&str>, observed: &str) -> bool {
    match expected {
        None => true,
        Some(expected) => expected == observed,
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let observed = fingerprint_of(server_public_key);

        if let Ok(mut slot) = self.observed.lock() {
            *slot = Some(observed.clone());
        }

        let accepted = verify_fingerprint(self.expected.as_deref(), &observed);
        if !accepted {
            warn!(
                "Host key fingerprint mismatch: expected {:?}, got {}",
                self.expected, observed
            );
        }
        Ok(accepted)
    }
}
