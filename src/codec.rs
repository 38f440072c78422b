// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream framing codec.
//!
//! Records on the reliable stream are length-prefixed: a big-endian `u16`
//! length followed by that many payload bytes. A length of 0 is reserved for
//! heartbeats and carries no payload.
//!
//! # Reading
//!
//! [`RecordReader`] tolerates arbitrary partial reads: bytes are appended to
//! a reassembly buffer and a record is surfaced only once fully present. A
//! declared length above the configured cap fails with `OversizedFrame`
//! before any payload is buffered for it.
//!
//! # Writing
//!
//! [`FrameWriter::write_record`] reserves the 2-byte length, lets the fill
//! callback append the payload, then back-patches the length. If the callback
//! writes nothing ("externalizer declined"), the reservation is rolled back
//! and the buffer is exactly as it was.

use crate::entry::Entry;
use crate::error::{ReplicationError, Result};
use crate::iter::EntrySink;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the record length prefix.
pub const HEADER_LEN: usize = 2;

/// Reassembles length-prefixed records from a byte stream.
pub struct RecordReader {
    buf: BytesMut,
    max_payload: usize,
}

impl RecordReader {
    /// Create a reader that rejects records longer than `max_payload`.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_payload + HEADER_LEN),
            max_payload,
        }
    }

    /// The reassembly buffer; the session reads socket bytes directly into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete record, if one is fully present.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An empty payload is a
    /// heartbeat. Fails with `OversizedFrame` when a record's declared length
    /// exceeds the cap.
    pub fn next_record(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if length > self.max_payload {
            return Err(ReplicationError::OversizedFrame {
                length,
                max: self.max_payload,
            });
        }
        if self.buf.len() < HEADER_LEN + length {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(length).freeze()))
    }
}

/// Builds an outbound chunk of length-prefixed records.
pub struct FrameWriter {
    buf: BytesMut,
    capacity: usize,
}

impl FrameWriter {
    /// Create a writer with a soft chunk capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes still available before the chunk capacity is reached.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Check whether the chunk holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of buffered chunk bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Write one record: reserve the length prefix, run `fill` to append the
    /// payload, back-patch the length.
    ///
    /// Returns the payload length, or 0 if `fill` wrote nothing, in which
    /// case the reservation is rolled back and the buffer is unchanged.
    pub fn write_record<F>(&mut self, fill: F) -> usize
    where
        F: FnOnce(&mut BytesMut) -> usize,
    {
        let mark = self.buf.len();
        self.buf.put_u16(0);
        let written = fill(&mut self.buf);
        debug_assert_eq!(written, self.buf.len() - mark - HEADER_LEN);
        if written == 0 {
            self.buf.truncate(mark);
            return 0;
        }
        debug_assert!(written <= u16::MAX as usize);
        let prefix = (written as u16).to_be_bytes();
        self.buf[mark..mark + HEADER_LEN].copy_from_slice(&prefix);
        written
    }

    /// Append a zero-length heartbeat record.
    pub fn write_heartbeat(&mut self) {
        self.buf.put_u16(0);
    }

    /// Take the buffered chunk, leaving the writer empty.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }
}

/// Adapts a [`FrameWriter`] to the modification iterator's [`EntrySink`].
///
/// Declines (and thereby re-sets the slot's dirty bit) when the chunk cannot
/// be guaranteed to fit one more maximum-size entry; the session then sends
/// the chunk and retries the entry on the next pass.
pub struct FrameSink<'a> {
    writer: &'a mut FrameWriter,
    entry_max_size: usize,
    delivered: usize,
}

impl<'a> FrameSink<'a> {
    pub fn new(writer: &'a mut FrameWriter, entry_max_size: usize) -> Self {
        Self {
            writer,
            entry_max_size,
            delivered: 0,
        }
    }

    /// Number of entries accepted into the chunk so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}

impl EntrySink for FrameSink<'_> {
    fn on_entry(&mut self, entry: &Entry) -> bool {
        if self.writer.remaining() < HEADER_LEN + self.entry_max_size {
            return false;
        }
        if self.writer.write_record(|buf| entry.encode(buf)) == 0 {
            return false;
        }
        self.delivered += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Version;

    #[test]
    fn test_reader_needs_more_bytes() {
        let mut reader = RecordReader::new(1024);
        assert!(reader.next_record().unwrap().is_none());

        reader.buffer_mut().put_u8(0x00);
        assert!(reader.next_record().unwrap().is_none());

        reader.buffer_mut().put_u8(0x03);
        assert!(reader.next_record().unwrap().is_none());

        reader.buffer_mut().put_slice(b"ab");
        assert!(reader.next_record().unwrap().is_none());

        reader.buffer_mut().put_u8(b'c');
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(&record[..], b"abc");
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_reader_multiple_records_in_one_read() {
        let mut reader = RecordReader::new(1024);
        let buf = reader.buffer_mut();
        buf.put_u16(2);
        buf.put_slice(b"hi");
        buf.put_u16(0); // heartbeat
        buf.put_u16(3);
        buf.put_slice(b"yes");

        assert_eq!(&reader.next_record().unwrap().unwrap()[..], b"hi");
        let heartbeat = reader.next_record().unwrap().unwrap();
        assert!(heartbeat.is_empty());
        assert_eq!(&reader.next_record().unwrap().unwrap()[..], b"yes");
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_reader_heartbeat_only() {
        let mut reader = RecordReader::new(1024);
        reader.buffer_mut().put_u16(0);
        let record = reader.next_record().unwrap().unwrap();
        assert!(record.is_empty());
    }

    #[test]
    fn test_reader_oversized_record() {
        let mut reader = RecordReader::new(16);
        reader.buffer_mut().put_u16(17);
        let err = reader.next_record().unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::OversizedFrame { length: 17, max: 16 }
        ));
    }

    #[test]
    fn test_reader_byte_at_a_time() {
        // A full stream chopped into single bytes yields the same records.
        let mut wire = BytesMut::new();
        wire.put_u16(4);
        wire.put_slice(b"data");
        wire.put_u16(1);
        wire.put_u8(b'x');

        let mut reader = RecordReader::new(64);
        let mut records = Vec::new();
        for byte in wire.iter() {
            reader.buffer_mut().put_u8(*byte);
            while let Some(record) = reader.next_record().unwrap() {
                records.push(record);
            }
        }
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][..], b"data");
        assert_eq!(&records[1][..], b"x");
    }

    #[test]
    fn test_writer_backpatches_length() {
        let mut writer = FrameWriter::new(64);
        let written = writer.write_record(|buf| {
            buf.put_slice(b"hello");
            5
        });
        assert_eq!(written, 5);

        let chunk = writer.take();
        assert_eq!(&chunk[..2], &[0x00, 0x05]);
        assert_eq!(&chunk[2..], b"hello");
        assert!(writer.is_empty());
    }

    #[test]
    fn test_writer_rolls_back_declined_record() {
        let mut writer = FrameWriter::new(64);
        writer.write_record(|buf| {
            buf.put_slice(b"kept");
            4
        });
        let len_before = writer.len();

        let written = writer.write_record(|_| 0);
        assert_eq!(written, 0);
        assert_eq!(writer.len(), len_before);

        let chunk = writer.take();
        assert_eq!(&chunk[2..], b"kept");
    }

    #[test]
    fn test_writer_heartbeat() {
        let mut writer = FrameWriter::new(64);
        writer.write_heartbeat();
        let chunk = writer.take();
        assert_eq!(&chunk[..], &[0x00, 0x00]);
    }

    #[test]
    fn test_writer_remaining_shrinks() {
        let mut writer = FrameWriter::new(32);
        assert_eq!(writer.remaining(), 32);
        writer.write_record(|buf| {
            buf.put_slice(b"abcd");
            4
        });
        assert_eq!(writer.remaining(), 32 - HEADER_LEN - 4);
    }

    #[test]
    fn test_frame_sink_declines_when_chunk_nearly_full() {
        let entry = Entry::put(b"k".to_vec(), b"v".to_vec(), Version::new(1, 1));
        let entry_max = entry.encoded_len();

        // Room for exactly one entry plus its header.
        let mut writer = FrameWriter::new(2 * (HEADER_LEN + entry_max) - 1);
        let mut sink = FrameSink::new(&mut writer, entry_max);
        assert!(sink.on_entry(&entry));
        assert!(!sink.on_entry(&entry));
        assert_eq!(sink.delivered(), 1);
    }

    #[test]
    fn test_frame_sink_roundtrips_through_reader() {
        let entries = vec![
            Entry::put(b"a".to_vec(), b"1".to_vec(), Version::new(10, 1)),
            Entry::tombstone(b"b".to_vec(), Version::new(11, 2)),
            Entry::put(b"c".to_vec(), vec![0u8; 100], Version::new(12, 3)),
        ];

        let mut writer = FrameWriter::new(4096);
        {
            let mut sink = FrameSink::new(&mut writer, 256);
            for entry in &entries {
                assert!(sink.on_entry(entry));
            }
            assert_eq!(sink.delivered(), 3);
        }

        let chunk = writer.take();
        let mut reader = RecordReader::new(4096);
        reader.buffer_mut().extend_from_slice(&chunk);

        let mut decoded = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            decoded.push(Entry::decode(&record).unwrap());
        }
        assert_eq!(decoded, entries);
    }
}
