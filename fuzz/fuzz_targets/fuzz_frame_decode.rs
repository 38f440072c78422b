//! Fuzz target for record reassembly.
//!
//! Feeds arbitrary bytes through the record reader in arbitrary chunkings;
//! it must never panic, and every surfaced record must respect the cap.

#![no_main]

use libfuzzer_sys::fuzz_target;
use meshmap::codec::RecordReader;

fuzz_target!(|input: (u8, Vec<u8>)| {
    let (chunk_hint, data) = input;
    let chunk = usize::from(chunk_hint).max(1);

    let mut reader = RecordReader::new(1024);
    for piece in data.chunks(chunk) {
        reader.buffer_mut().extend_from_slice(piece);
        loop {
            match reader.next_record() {
                Ok(Some(record)) => assert!(record.len() <= 1024),
                Ok(None) => break,
                // Oversized frame: the session would close here.
                Err(_) => return,
            }
        }
    }
});
