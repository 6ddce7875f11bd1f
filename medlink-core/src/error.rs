//! Error types shared across modules.

use crate::challenge::ChallengeError;

/// Transport and radio failures. Returned to the immediate caller; the core never retries.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("radio access not granted")]
    PermissionDenied,

    #[error("radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device not connected: {0}")]
    NotConnected(String),

    #[error("connection to {device_id} failed: {reason}")]
    ConnectionFailed { device_id: String, reason: String },

    #[error("connection attempt to {0} timed out")]
    ConnectTimeout(String),

    #[error("chunk write to {device_id} failed: {reason}")]
    WriteFailed { device_id: String, reason: String },

    #[error("send to {0} cancelled by disconnect")]
    Cancelled(String),

    #[error("device {0} is not verified against a trusted key")]
    Untrusted(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] ChallengeError),

    #[error("encode error: {0}")]
    Encode(String),
}

/// Failures of the identity and trust persistence collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("stored key is invalid: {0}")]
    InvalidKey(String),
}
