//! Best-effort datagram replication.
//!
//! A supplementary lossy broadcast channel alongside the reliable mesh. Each
//! packet carries exactly one serialized entry behind a guard header:
//!
//! ```text
//! packet := u16 invertedLength  u16 length  length bytes payload
//! ```
//!
//! The guard is the bitwise complement of the length. On receive, a packet
//! whose guard does not match its length, or whose remaining bytes differ
//! from the declared length, is dropped silently. There is no retransmit and
//! no acknowledgment; convergence is guaranteed only if the reliable channel
//! is also configured.
//!
//! The send side drains a dedicated modification iterator (reserved channel
//! identifier [`DATAGRAM_CHANNEL`]), one entry per datagram, no batching.

use crate::entry::Entry;
use crate::iter::EntrySink;
use crate::metrics;
use crate::store::{ReplicatedStore, DATAGRAM_CHANNEL};
use crate::session::SessionTuning;
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Guard header: inverted length plus length.
pub const GUARD_HEADER_LEN: usize = 4;

/// Encode one entry as a guarded datagram payload.
///
/// Returns `None` if the entry declined to serialize.
pub fn encode_packet(entry: &Entry) -> Option<BytesMut> {
    let mut buf = BytesMut::with_capacity(GUARD_HEADER_LEN + entry.encoded_len());
    buf.put_u16(0);
    buf.put_u16(0);
    let written = entry.encode(&mut buf);
    if written == 0 {
        return None;
    }
    debug_assert!(written <= u16::MAX as usize);
    let length = written as u16;
    buf[0..2].copy_from_slice(&(!length).to_be_bytes());
    buf[2..4].copy_from_slice(&length.to_be_bytes());
    Some(buf)
}

/// Decode a guarded datagram.
///
/// Returns `None` for anything suspect; the datagram channel drops silently
/// rather than erroring.
pub fn decode_packet(packet: &[u8]) -> Option<Entry> {
    if packet.len() < GUARD_HEADER_LEN {
        metrics::record_datagram_dropped("truncated_header");
        return None;
    }
    let guard = u16::from_be_bytes([packet[0], packet[1]]);
    let length = u16::from_be_bytes([packet[2], packet[3]]);
    if guard != !length {
        metrics::record_datagram_dropped("guard_mismatch");
        return None;
    }
    if packet.len() - GUARD_HEADER_LEN != length as usize {
        metrics::record_datagram_dropped("length_mismatch");
        return None;
    }
    match Entry::decode(&packet[GUARD_HEADER_LEN..]) {
        Ok(entry) => Some(entry),
        Err(e) => {
            trace!(error = %e, "dropping undecodable datagram");
            metrics::record_datagram_dropped("undecodable");
            None
        }
    }
}

/// Captures one entry per packet for the send side.
struct PacketSink {
    packet: Option<BytesMut>,
}

impl EntrySink for PacketSink {
    fn on_entry(&mut self, entry: &Entry) -> bool {
        match encode_packet(entry) {
            Some(packet) => {
                self.packet = Some(packet);
                true
            }
            None => false,
        }
    }
}

/// Run the datagram loop until shutdown.
///
/// Receive and send use distinct interests: inbound packets are applied as
/// they arrive, and the dedicated iterator is drained (one entry per
/// datagram) whenever work is marked.
pub(crate) async fn run_datagram<S: ReplicatedStore>(
    socket: UdpSocket,
    broadcast: SocketAddr,
    store: Arc<S>,
    tuning: SessionTuning,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let iterator = store.modification_iterator_for(DATAGRAM_CHANNEL);
    let mut recv_buf = vec![0u8; tuning.buffer_cap()];

    info!(%broadcast, "Datagram replicator running");
    loop {
        // Drain pending entries, one per packet. Best effort: a failed send
        // is logged and the entry is not retried on this channel.
        loop {
            let mut sink = PacketSink { packet: None };
            if !iterator.next_entry(&mut sink) {
                break;
            }
            let Some(packet) = sink.packet else { break };
            match socket.send_to(&packet, broadcast).await {
                Ok(_) => metrics::record_datagram_sent(),
                Err(e) => {
                    warn!(error = %e, "Datagram send failed");
                    break;
                }
            }
        }

        tokio::select! {
            res = socket.recv_from(&mut recv_buf) => match res {
                Ok((len, from)) => {
                    let Some(entry) = decode_packet(&recv_buf[..len]) else {
                        continue;
                    };
                    trace!(%from, key = ?entry.key, "datagram entry received");
                    match store.apply_incoming(entry) {
                        Ok(true) => metrics::record_datagram_applied(),
                        Ok(false) => {}
                        Err(e) => {
                            warn!(error = %e, "storage rejected datagram entry, dropping");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Datagram receive failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = iterator.work_notified() => {
                // Loop back to drain.
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Datagram replicator stopped");
}
