//! Error hierarchy for the fusion client.
//!
//! Every failure the runtime can observe is a [`FusionError`]. Errors are
//! classified by [`ErrorKind`]:
//!
//! - [`ErrorKind::Transport`]: fetch or socket failures. Retried with backoff
//!   by the bootstrapper, or sends the subscription into reconnect-wait.
//! - [`ErrorKind::Protocol`]: a well-formed response missing the correlation
//!   fields, or a payload that cannot be decoded. Never retried in place.
//! - [`ErrorKind::Timeout`]: the socket handshake exceeded the open timeout.
//! - [`ErrorKind::Cancelled`]: the owning subscription went away. Internal
//!   only; never delivered to a consumer.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for fusion operations.
pub type Result<T> = std::result::Result<T, FusionError>;

/// Broad error class used for retry and reconnect decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or socket failure.
    Transport,
    /// Malformed or incomplete server response.
    Protocol,
    /// Connection open timed out.
    Timeout,
    /// Operation abandoned because its owner unsubscribed.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Top-level error type for the fusion client.
#[derive(Debug, Error)]
pub enum FusionError {
    /// The bootstrap request returned a non-success status.
    #[error("request failed with status {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Status text or body excerpt.
        message: String,
    },

    /// The bootstrap request could not be sent or its body not read.
    #[error("network error: {0}")]
    Network(String),

    /// The socket could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The socket closed (server-initiated or network failure).
    #[error("connection closed ({code}): {reason}")]
    ConnectionClosed {
        /// WebSocket close code, `1006` when no close frame was seen.
        code: u16,
        /// Close reason reported by the peer.
        reason: String,
    },

    /// The configured endpoint URI could not be turned into a socket URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A successful response lacked the publication header, or it was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A value could not be decoded into the subscriber's type.
    #[error("failed to decode value: {0}")]
    Decode(String),

    /// The socket handshake did not complete in time.
    #[error("connection open timed out after {timeout_ms}ms")]
    OpenTimeout {
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The owning subscription was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl FusionError {
    /// Error class for retry decisions.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http { .. }
            | Self::Network(_)
            | Self::ConnectionFailed(_)
            | Self::ConnectionClosed { .. }
            | Self::InvalidEndpoint(_) => ErrorKind::Transport,
            Self::Protocol(_) | Self::Decode(_) => ErrorKind::Protocol,
            Self::OpenTimeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the bootstrapper should retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }

    /// Whether this error is terminal for the current setup attempt.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

impl From<serde_json::Error> for FusionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
