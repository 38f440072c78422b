// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are categorized by where they occur (session I/O, codec, handshake,
//! storage adapter) and carry enough context for debugging. No error is ever
//! propagated to the application context: network failures surface only as a
//! peer's absence from convergence.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Policy |
//! |------------|-----------|--------|
//! | `Disconnected` | Yes | Close session; outbound connectors redial with backoff, accepted sessions are forgotten |
//! | `ConnectFailed` | Yes | Connector backs off and retries; never fatal to the engine |
//! | `Io` | Yes | Treated as a disconnect at the session boundary |
//! | `MalformedFrame` | No | Close session; on the datagram channel the packet is dropped silently instead |
//! | `OversizedFrame` | No | Close session |
//! | `HandshakeRejected` | No | Close this connection without retry; the connector may still dial again |
//! | `Storage` | No | Log and drop the entry; never crash the reactor |
//! | `Config` | No | Refuse to start |
//! | `InvalidState` | No | Engine lifecycle violation (bug in the caller) |
//! | `Shutdown` | No | Orderly close of all sessions; idempotent |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to determine whether an operation
//! should be retried with backoff. Retryable errors indicate transient network
//! conditions; non-retryable errors indicate protocol violations, bugs, or
//! configuration problems.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Peer EOF, reset, or heartbeat timeout.
    ///
    /// The session closes; an outbound connector redials with backoff.
    #[error("peer {peer} disconnected: {message}")]
    Disconnected { peer: String, message: String },

    /// Outbound connection attempt failed.
    ///
    /// Never fatal to the engine; the connector backs off and retries.
    #[error("connect to {addr} failed: {message}")]
    ConnectFailed { addr: String, message: String },

    /// A record or entry could not be decoded.
    ///
    /// On the reliable stream this closes the session. On the datagram
    /// channel the packet is dropped silently instead.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A record's declared length exceeds the session buffer cap.
    #[error("oversized frame: length {length} exceeds {max}")]
    OversizedFrame { length: usize, max: usize },

    /// The welcome record was unacceptable: identifier out of range,
    /// self-collision, or an active session already owns the identifier.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    /// The storage adapter failed.
    ///
    /// The offending entry is logged and dropped; the reactor never crashes.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid or missing configuration. Fix the config and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Engine lifecycle violation (e.g. `start()` on a running engine).
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Socket-level I/O failure, treated as a disconnect.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    Shutdown,
}

impl ReplicationError {
    /// Create a `Disconnected` error for a peer.
    pub fn disconnected(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Disconnected {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Create a `HandshakeRejected` error.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::HandshakeRejected {
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Disconnected { .. } => true,
            Self::ConnectFailed { .. } => true,
            Self::Io(_) => true,
            Self::MalformedFrame(_) => false,
            Self::OversizedFrame { .. } => false,
            Self::HandshakeRejected { .. } => false,
            Self::Storage(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_disconnected() {
        let err = ReplicationError::disconnected("3", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_is_retryable_connect_failed() {
        let err = ReplicationError::ConnectFailed {
            addr: "10.0.0.2:8076".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("10.0.0.2:8076"));
    }

    #[test]
    fn test_is_retryable_io() {
        let err = ReplicationError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_retryable_malformed_frame() {
        let err = ReplicationError::MalformedFrame("key length exceeds frame".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_oversized_frame() {
        let err = ReplicationError::OversizedFrame {
            length: 70_000,
            max: 9216,
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("70000"));
        assert!(err.to_string().contains("9216"));
    }

    #[test]
    fn test_not_retryable_handshake_rejected() {
        let err = ReplicationError::rejected("identifier 200 out of range");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("200"));
    }

    #[test]
    fn test_not_retryable_storage() {
        let err = ReplicationError::Storage("map capacity exhausted".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("identifier must be 1..=127".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        assert!(!ReplicationError::Shutdown.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        fn read_zero() -> Result<()> {
            Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
            Ok(())
        }
        let err = read_zero().unwrap_err();
        assert!(matches!(err, ReplicationError::Io(_)));
    }
}
