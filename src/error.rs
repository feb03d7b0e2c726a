//! # Core Error Taxonomy
//!
//! Every subsystem classifies failures at its public boundary into the
//! categories below and either recovers locally (retry, fallback) or
//! surfaces a typed error to the caller. Panics from invariant violations
//! never cross a process boundary; the supervisor observes child death
//! and restarts with backoff.
//!
//! ## Categories
//!
//! - **Config**: invalid parameter combinations, caught once at startup
//! - **Transient network**: DNS timeout, connect refused, resets; carry a
//!   retry-advisability flag
//! - **Protocol**: malformed frames, decode failures, unknown opcodes;
//!   close the offending connection or channel, never retry
//! - **Policy denial**: shield blocks and cookie refusals, reported on the
//!   audit log target rather than as operational errors
//! - **Resource exhaustion**: full queues and saturated pools, surfaced
//!   synchronously so callers can apply backpressure
//! - **Invariant**: programmer errors, fatal to the offending subsystem

use std::time::Duration;
use thiserror::Error;

/// Typed error surfaced by every public subsystem boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient network failure; `retryable` advises the caller.
    #[error("network error ({kind:?}): {detail}")]
    Network {
        /// Which transient failure occurred.
        kind: NetworkErrorKind,
        /// Human-readable context.
        detail: String,
        /// Whether retrying the operation is advisable.
        retryable: bool,
    },

    /// Protocol violation on a connection or channel. Not retryable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The privacy shield or another policy layer refused the operation.
    #[error("denied by policy: {0}")]
    PolicyDenied(String),

    /// A bounded queue, cache, or worker pool is at capacity.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A suspendable operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The channel or connection was closed while the operation was pending.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// An internal invariant was violated. Fatal to the subsystem.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Failure serializing or deserializing a message or blob.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error from a transport or the host OS.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transient network failure kinds, mirroring the connect failure surface
/// of the HTTP/3 client and the DNS resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// The peer actively refused the connection.
    Refused,
    /// No route to the peer.
    Unreachable,
    /// The attempt exceeded its deadline.
    TimedOut,
    /// The transport handshake failed.
    HandshakeFailed,
    /// The peer reset an established connection.
    ConnectionReset,
    /// An individual stream was reset by the peer.
    StreamReset,
    /// The name could not be resolved.
    DnsFailure,
}

impl CoreError {
    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Timeouts and transient network errors flagged retryable qualify;
    /// protocol errors and policy denials never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Network { retryable, .. } => *retryable,
            CoreError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Shorthand for a retryable transient network error.
    pub fn transient(kind: NetworkErrorKind, detail: impl Into<String>) -> Self {
        CoreError::Network {
            kind,
            detail: detail.into(),
            retryable: true,
        }
    }

    /// Shorthand for a non-retryable network error.
    pub fn network_fatal(kind: NetworkErrorKind, detail: impl Into<String>) -> Self {
        CoreError::Network {
            kind,
            detail: detail.into(),
            retryable: false,
        }
    }
}

/// Convenience alias used across all subsystems.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(CoreError::transient(NetworkErrorKind::Refused, "x").is_retryable());
        assert!(CoreError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(!CoreError::Protocol("bad frame".into()).is_retryable());
        assert!(!CoreError::PolicyDenied("tracker".into()).is_retryable());
        assert!(!CoreError::network_fatal(NetworkErrorKind::HandshakeFailed, "x").is_retryable());
    }
}
