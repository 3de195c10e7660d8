//! Failure kinds surfaced through request completions.

use crate::request_id::RequestId;

/// Coarse classification of a [`BridgeError`], for callers deciding what to
/// tell an end user ("timed out", "likely deadlocked", "rejected", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CapacityExceeded,
    Timeout,
    AbsoluteTimeoutExceeded,
    ExtensionLimitExceeded,
    ProgressStalled,
    Rejected,
    Disconnected,
    Cancelled,
    SendFailed,
    NotConnected,
    QueueFull,
    Abandoned,
}

/// Every failure is terminal for its request; nothing here is retried internally.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("Max pending requests limit reached ({limit})")]
    CapacityExceeded { limit: usize },

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout {
        request_id: RequestId,
        timeout_ms: u64,
    },

    #[error("Request {request_id} exceeded absolute timeout of {limit_ms}ms")]
    AbsoluteTimeoutExceeded {
        request_id: RequestId,
        limit_ms: u64,
    },

    #[error(
        "Request {request_id} exceeded max progress extensions ({extensions}), possible deadlock"
    )]
    ExtensionLimitExceeded {
        request_id: RequestId,
        extensions: u32,
    },

    #[error("Request {request_id} progress stalled at {percent}% after {updates} identical updates")]
    ProgressStalled {
        request_id: RequestId,
        percent: f64,
        updates: u32,
    },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Failed to send request: {0}")]
    SendFailed(String),

    #[error("Automation bridge not connected")]
    NotConnected,

    #[error("Request queue full ({limit} waiting)")]
    QueueFull { limit: usize },

    #[error("Request abandoned before completion")]
    Abandoned,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::AbsoluteTimeoutExceeded { .. } => ErrorKind::AbsoluteTimeoutExceeded,
            Self::ExtensionLimitExceeded { .. } => ErrorKind::ExtensionLimitExceeded,
            Self::ProgressStalled { .. } => ErrorKind::ProgressStalled,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Disconnected(_) => ErrorKind::Disconnected,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::SendFailed(_) => ErrorKind::SendFailed,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::Abandoned => ErrorKind::Abandoned,
        }
    }

    /// True for the timeout family: soft deadline, absolute cap, deadlock and stall guards.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout
                | ErrorKind::AbsoluteTimeoutExceeded
                | ErrorKind::ExtensionLimitExceeded
                | ErrorKind::ProgressStalled
        )
    }
}
