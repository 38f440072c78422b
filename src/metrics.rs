//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Session lifecycle and handshakes
//! - Entries sent, applied, and discarded by the merge rule
//! - Connector attempts and backoff
//! - Heartbeats
//! - Datagram channel traffic and drops
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state.

use metrics::{counter, gauge};

/// Record an outbound connection attempt.
pub fn record_connect(addr: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_connects_total", "addr" => addr.to_string(), "status" => status)
        .increment(1);
}

/// Record a session phase transition.
pub fn record_session_phase(remote: u8, phase: &str) {
    counter!("replication_session_transitions_total", "remote" => remote.to_string(), "phase" => phase.to_string()).increment(1);
}

/// Record a rejected handshake.
pub fn record_handshake_rejected(reason: &str) {
    counter!("replication_handshakes_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record slots tagged at bootstrap.
pub fn record_bootstrap_backlog(remote: u8, tagged: usize) {
    counter!("replication_bootstrap_slots_total", "remote" => remote.to_string())
        .increment(tagged as u64);
}

/// Record entries serialized and sent on a session.
pub fn record_entries_sent(remote: u8, count: usize) {
    counter!("replication_entries_sent_total", "remote" => remote.to_string())
        .increment(count as u64);
}

/// Record an incoming entry that won the merge rule and was installed.
pub fn record_entry_applied(remote: u8) {
    counter!("replication_entries_applied_total", "remote" => remote.to_string()).increment(1);
}

/// Record an incoming entry discarded by the merge rule.
pub fn record_entry_discarded(remote: u8) {
    counter!("replication_entries_discarded_total", "remote" => remote.to_string()).increment(1);
}

/// Record a storage failure while applying an incoming entry.
pub fn record_storage_error(remote: u8) {
    counter!("replication_storage_errors_total", "remote" => remote.to_string()).increment(1);
}

/// Record a heartbeat sent on an idle session.
pub fn record_heartbeat_sent(remote: u8) {
    counter!("replication_heartbeats_sent_total", "remote" => remote.to_string()).increment(1);
}

/// Gauge for number of active sessions.
pub fn set_active_sessions(count: usize) {
    gauge!("replication_active_sessions").set(count as f64);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting (0=created, 1=connecting, ...).
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}

/// Record a datagram sent on the best-effort channel.
pub fn record_datagram_sent() {
    counter!("replication_datagrams_sent_total").increment(1);
}

/// Record a received datagram dropped before application.
pub fn record_datagram_dropped(reason: &str) {
    counter!("replication_datagrams_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a datagram entry applied to the map.
pub fn record_datagram_applied() {
    counter!("replication_datagrams_applied_total").increment(1);
}
