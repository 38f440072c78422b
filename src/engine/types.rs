//! Engine state types.
//!
//! Defines the state machine for the replicator lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting
//!    │                              │
//!    │ (already stopped)            │ (listener bound, connectors spawned)
//!    ↓                              ↓
//! Stopped ←──── ShuttingDown ←── Running
//!                    ↑ shutdown()
//!
//!    start() failure (bind error, bad config) → Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `Replicator::new()`. No sockets open.
//! - **Connecting**: `start()` called; binding the listener and spawning
//!   connectors.
//! - **Running**: Normal operation. Sessions replicate; connectors redial
//!   lost peers with backoff.
//! - **ShuttingDown**: `shutdown()` called. Sessions half-close and drain.
//! - **Stopped**: Graceful shutdown complete. The map stays usable; no
//!   further replication occurs.
//! - **Failed**: `start()` could not bring the engine up.

/// State of the replicator.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](crate::Replicator::start) to begin replication.
    Created,

    /// Binding sockets and spawning connectors.
    Connecting,

    /// Running and replicating.
    Running,

    /// Shutting down gracefully.
    ///
    /// Sessions half-close output and briefly drain input.
    /// Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Stopped.
    ///
    /// Engine has shut down cleanly. Safe to drop.
    Stopped,

    /// Failed to start.
    ///
    /// Check logs for error details. Engine cannot recover from this state.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Connecting => write!(f, "Connecting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}
