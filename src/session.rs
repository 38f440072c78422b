// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-peer replication sessions.
//!
//! One session runs per reliable connection to a remote peer, whichever side
//! dialed:
//!
//! ```text
//!         ┌──────────┐  connect/accept  ┌──────────┐
//!   ───►  │Connecting├─────────────────►│Handshake │
//!         └──────────┘                  └────┬─────┘
//!                                            │ welcome sent AND received
//!                                            ▼
//!                                      ┌───────────┐
//!                                      │ Bootstrap │  (iterator seeded from
//!                                      └────┬──────┘   the remote's last-seen)
//!                                           ▼
//!                                      ┌───────────┐
//!                                      │Replicating│◄──── steady state
//!                                      └────┬──────┘
//!                                           │ error / EOF / timeout
//!                                           ▼
//!                                         Closed
//! ```
//!
//! Both sides send the 9-byte welcome (identifier + highest locally observed
//! timestamp) first. On receipt the session binds the modification iterator
//! for the remote identifier and seeds it with `dirty_entries_from`, then
//! replicates: outbound chunks are drained from the iterator until the chunk
//! budget is spent, written, and the task yields so other sessions get a
//! turn; inbound bytes are reassembled into records and applied under the
//! merge rule.
//!
//! # Heartbeats
//!
//! When configured, a session idle on the write side for one interval sends a
//! zero-length record; a session that has read nothing for two intervals
//! closes with `Disconnected`.
//!
//! # Closing
//!
//! Fatal conditions (EOF, write error, malformed or oversized frame,
//! handshake rejection) end the session. On shutdown the session half-closes
//! its output, drains input briefly, then hard-closes. Storage errors are
//! logged and the entry dropped; they never end the session.

use crate::codec::{FrameSink, FrameWriter, RecordReader};
use crate::config::ReplicatorConfig;
use crate::entry::{identifier_in_range, Entry, MAX_IDENTIFIER, MIN_IDENTIFIER};
use crate::error::{ReplicationError, Result};
use crate::iter::ModificationIterator;
use crate::metrics;
use crate::store::ReplicatedStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn, Instrument};

/// Welcome record: one identifier byte plus eight timestamp bytes.
pub const WELCOME_LEN: usize = 9;

/// How long to wait for the remote's welcome before giving up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a closing session drains inbound bytes after half-closing.
const DRAIN_DEADLINE: Duration = Duration::from_millis(250);

/// Which side opened the connection (logging only; the protocol is
/// symmetric).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Per-session tuning derived from [`ReplicatorConfig`].
#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub entry_max_size: usize,
    pub packet_size: usize,
    pub heartbeat: Option<Duration>,
}

impl SessionTuning {
    pub fn from_config(config: &ReplicatorConfig) -> Self {
        Self {
            entry_max_size: config.entry_max_size,
            packet_size: config.packet_size,
            heartbeat: config.heartbeat_duration(),
        }
    }

    /// Per-session buffer cap.
    pub fn buffer_cap(&self) -> usize {
        self.packet_size + self.entry_max_size
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            entry_max_size: 1024,
            packet_size: 8192,
            heartbeat: None,
        }
    }
}

/// Tracks which remote identifiers own an active session.
///
/// Sessions hold a [`SessionClaim`] token instead of a back-pointer to the
/// engine; dropping the token releases the identifier.
pub struct SessionRegistry {
    active: DashMap<u8, ()>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
        }
    }

    /// Claim an identifier for a new session.
    ///
    /// Returns `None` if an active session already owns it.
    pub fn claim(self: &Arc<Self>, remote: u8) -> Option<SessionClaim> {
        match self.active.entry(remote) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(SessionClaim {
                    registry: Arc::clone(self),
                    remote,
                })
            }
        }
    }

    /// Identifiers with an active session, sorted.
    pub fn active_peers(&self) -> Vec<u8> {
        let mut peers: Vec<u8> = self.active.iter().map(|r| *r.key()).collect();
        peers.sort_unstable();
        peers
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the claimed identifier on drop.
pub struct SessionClaim {
    registry: Arc<SessionRegistry>,
    remote: u8,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.registry.active.remove(&self.remote);
    }
}

/// Drive one session to completion.
///
/// Returns the reason the session closed; retryable errors are expected
/// during normal operation (peers restart, networks flap).
pub(crate) async fn run_session<S: ReplicatedStore>(
    stream: TcpStream,
    direction: Direction,
    store: Arc<S>,
    registry: Arc<SessionRegistry>,
    tuning: SessionTuning,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let span = tracing::info_span!("session", %direction, peer = %peer_addr);

    async move {
        stream.set_nodelay(true).ok();
        let (mut rd, mut wr) = stream.into_split();

        // Welcome is sent first, by both sides, regardless of direction.
        let mut welcome = [0u8; WELCOME_LEN];
        welcome[0] = store.identifier();
        welcome[1..].copy_from_slice(&store.last_modification().to_be_bytes());
        wr.write_all(&welcome).await?;

        let mut incoming = [0u8; WELCOME_LEN];
        match timeout(HANDSHAKE_TIMEOUT, rd.read_exact(&mut incoming)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ReplicationError::disconnected(
                    peer_addr,
                    "connection closed during handshake",
                ));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                metrics::record_handshake_rejected("timeout");
                return Err(ReplicationError::rejected("welcome not received in time"));
            }
        }

        let remote = incoming[0];
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&incoming[1..]);
        let remote_last_seen = u64::from_be_bytes(ts_bytes);

        if !identifier_in_range(remote) {
            metrics::record_handshake_rejected("identifier_out_of_range");
            return Err(ReplicationError::rejected(format!(
                "identifier {remote} outside {MIN_IDENTIFIER}..={MAX_IDENTIFIER}"
            )));
        }
        if remote == store.identifier() {
            metrics::record_handshake_rejected("self_collision");
            return Err(ReplicationError::rejected(format!(
                "peer announced our own identifier {remote}"
            )));
        }
        let claim = match registry.claim(remote) {
            Some(claim) => claim,
            None => {
                metrics::record_handshake_rejected("duplicate_session");
                return Err(ReplicationError::rejected(format!(
                    "peer {remote} already owns an active session"
                )));
            }
        };
        metrics::set_active_sessions(registry.len());
        info!(remote, remote_last_seen, "welcome exchanged");

        // Bootstrap: seed the backlog with everything the remote missed.
        metrics::record_session_phase(remote, "bootstrap");
        let iterator = store.modification_iterator_for(remote);
        let tagged = iterator.dirty_entries_from(remote_last_seen);
        metrics::record_bootstrap_backlog(remote, tagged);
        debug!(remote, tagged, "bootstrap backlog seeded");

        metrics::record_session_phase(remote, "replicating");
        let result = replicate(&mut rd, &mut wr, remote, &store, &iterator, &tuning, shutdown_rx).await;

        metrics::record_session_phase(remote, "closed");
        drop(claim);
        metrics::set_active_sessions(registry.len());
        match &result {
            Err(e) if e.is_retryable() => debug!(remote, error = %e, "session closed"),
            Err(e) => warn!(remote, error = %e, "session closed"),
            Ok(()) => {}
        }
        result
    }
    .instrument(span)
    .await
}

/// Steady-state bidirectional replication.
async fn replicate<S: ReplicatedStore>(
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
    remote: u8,
    store: &Arc<S>,
    iterator: &ModificationIterator,
    tuning: &SessionTuning,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let cap = tuning.buffer_cap();
    let mut reader = RecordReader::new(cap);
    let mut writer = FrameWriter::new(cap);
    let mut last_read = Instant::now();
    let mut last_write = Instant::now();

    loop {
        // A session spawned after the signal flipped has already "seen" the
        // watch value, so changed() alone is not enough.
        if *shutdown_rx.borrow() {
            shutdown_drain(rd, wr, &mut reader, remote, store).await;
            return Err(ReplicationError::Shutdown);
        }

        // Drain the iterator into one chunk. The chunk ends when the iterator
        // runs dry or one more maximum-size entry would not fit.
        let sent = {
            let mut sink = FrameSink::new(&mut writer, tuning.entry_max_size);
            while iterator.next_entry(&mut sink) {}
            sink.delivered()
        };
        if !writer.is_empty() {
            let chunk = writer.take();
            wr.write_all(&chunk).await?;
            last_write = Instant::now();
            if sent > 0 {
                metrics::record_entries_sent(remote, sent);
                trace!(remote, sent, bytes = chunk.len(), "chunk written");
            }
            // One chunk per pass: give other sessions a turn.
            tokio::task::yield_now().await;
            continue;
        }

        let heartbeat_pause = tuning
            .heartbeat
            .map(|hb| hb / 2)
            .unwrap_or(Duration::from_secs(60));

        tokio::select! {
            read = rd.read_buf(reader.buffer_mut()) => {
                let n = read?;
                if n == 0 {
                    return Err(ReplicationError::disconnected(
                        remote.to_string(),
                        "connection closed by peer",
                    ));
                }
                last_read = Instant::now();
                apply_records(&mut reader, remote, store)?;
            }
            _ = iterator.work_notified() => {
                // New dirty slots; loop back to drain them.
            }
            _ = tokio::time::sleep(heartbeat_pause), if tuning.heartbeat.is_some() => {
                if let Some(hb) = tuning.heartbeat {
                    if last_read.elapsed() >= hb * 2 {
                        return Err(ReplicationError::disconnected(
                            remote.to_string(),
                            format!("nothing read for {}ms", (hb * 2).as_millis()),
                        ));
                    }
                    if last_write.elapsed() >= hb {
                        writer.write_heartbeat();
                        let chunk = writer.take();
                        wr.write_all(&chunk).await?;
                        last_write = Instant::now();
                        metrics::record_heartbeat_sent(remote);
                        trace!(remote, "heartbeat sent");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    shutdown_drain(rd, wr, &mut reader, remote, store).await;
                    return Err(ReplicationError::Shutdown);
                }
            }
        }
    }
}

/// Half-close output, drain input up to a small deadline, then hard-close.
async fn shutdown_drain<S: ReplicatedStore>(
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
    reader: &mut RecordReader,
    remote: u8,
    store: &Arc<S>,
) {
    let _ = wr.shutdown().await;
    let deadline = Instant::now() + DRAIN_DEADLINE;
    loop {
        match timeout_at(deadline, rd.read_buf(reader.buffer_mut())).await {
            Ok(Ok(n)) if n > 0 => {
                if apply_records(reader, remote, store).is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
}

/// Apply every fully reassembled record to the store.
///
/// Storage errors drop the entry and keep the session alive; malformed or
/// oversized frames are returned and close it.
fn apply_records<S: ReplicatedStore>(
    reader: &mut RecordReader,
    remote: u8,
    store: &Arc<S>,
) -> Result<()> {
    while let Some(record) = reader.next_record()? {
        if record.is_empty() {
            trace!(remote, "heartbeat received");
            continue;
        }
        let entry = Entry::decode(&record)?;
        match store.apply_incoming(entry) {
            Ok(true) => metrics::record_entry_applied(remote),
            Ok(false) => metrics::record_entry_discarded(remote),
            Err(e) => {
                warn!(remote, error = %e, "storage rejected incoming entry, dropping");
                metrics::record_storage_error(remote);
            }
        }
    }
    Ok(())
}
