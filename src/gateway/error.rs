//! Error taxonomy for the gateway and retry classification for SSH dials.
//!
//! Every failure in this crate is scoped to one session, one pulse or one
//! subscriber and reported back to its own caller. [`GatewayError`] carries
//! the category so the caller can decide how to surface it:
//!
//! - **Auth**: bad or expired ticket, bad pulse secret, host key mismatch.
//!   Rejected before any side effect.
//! - **Connect**: remote dial or handshake failure. Logged, session aborted,
//!   user-visible error frame.
//! - **Protocol**: session/PTY/shell setup failure. Same treatment as Connect.
//! - **Stream**: I/O error mid-session. Triggers graceful teardown, never an
//!   error frame.
//!
//! # Retry Classification
//!
//! Dial errors are classified by message into transient failures worth a
//! retry and permanent failures that should fail immediately:
//!
//! 1. **Authentication failures (NOT retryable)**: wrong password, rejected
//!    key, host key mismatch.
//! 2. **Connection errors (retryable)**: refused, timed out, unreachable.
//! 3. **Unknown errors**: retried unless they look like SSH protocol errors.
//!
//! Authentication patterns take precedence over connection patterns.

use thiserror::Error;

/// Errors produced by the session bridge, the monitoring pipeline and their
/// collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Bad or expired ticket, bad pulse secret, rejected credentials.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Remote dial or handshake failure.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Session, PTY or shell setup failure.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// I/O failure on a live stream.
    #[error("stream error: {0}")]
    Stream(String),
    /// Requested host or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Credential material is missing or unusable.
    #[error("credential error: {0}")]
    Credential(String),
    /// Persistence collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Whether this error should be retried when it comes out of a dial.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Connect(msg) => is_retryable_error(msg),
            _ => false,
        }
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "host key",
    "unknown key",
    "fingerprint mismatch",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

/// Determines if an error message describes a transient failure.
///
/// Authentication and host-key failures are never retryable, even when the
/// message also mentions a timeout, to avoid account lockouts.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    for auth_err in AUTH_ERRORS {
        if error_lower.contains(auth_err) {
            return false;
        }
    }

    for retryable_err in RETRYABLE_ERRORS {
        if error_lower.contains(retryable_err) {
            return true;
        }
    }

    // Unknown errors are retried unless they look like SSH protocol errors
    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}
