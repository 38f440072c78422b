//! Fuzz target for entry payload decoding.
//!
//! Entries arrive from untrusted peers; decoding must never panic and a
//! successful decode must re-encode to the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use meshmap::Entry;

fuzz_target!(|data: &[u8]| {
    if let Ok(entry) = Entry::decode(data) {
        // Round-trip: a decodable payload re-encodes byte-identically.
        let mut buf = bytes::BytesMut::new();
        let written = entry.encode(&mut buf);
        assert!(written >= 1);
        assert_eq!(&buf[..], data);
    }
});
