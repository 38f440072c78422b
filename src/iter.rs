// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-remote modification iterators.
//!
//! For each remote peer the map keeps a bitset with one bit per slot. A bit
//! is set when the slot is locally mutated and cleared when the slot has been
//! handed to that peer's session. Each bitset carries a monotonic cursor so
//! scanning is round-robin fair by slot, not ordered by timestamp; the merge
//! rule makes that safe.
//!
//! # Transactional Handoff
//!
//! [`ModificationIterator::next_entry`] clears a bit, loads the slot, and
//! offers the entry to the caller's [`EntrySink`]. The sink is free to
//! decline (e.g. the outbound chunk is full); a decline restores the bit so
//! the entry is retried. This is a function call returning a result, not a
//! coroutine.
//!
//! # Concurrency
//!
//! The application context sets bits (under the map's per-slot write), the
//! session context clears them. A concurrent set/clear on the same bit
//! resolves by the decline path re-setting the bit.

use crate::entry::Entry;
use crate::store::SlotTable;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Receives entries from [`ModificationIterator::next_entry`].
///
/// Return `false` to decline the entry; the iterator restores the dirty bit
/// and the entry is retried later.
pub trait EntrySink {
    fn on_entry(&mut self, entry: &Entry) -> bool;
}

/// Per-remote cursor over locally changed slots.
pub struct ModificationIterator {
    remote: u8,
    slots: Arc<SlotTable>,
    words: Vec<AtomicU64>,
    cursor: AtomicUsize,
    pending: AtomicUsize,
    work: Notify,
}

impl ModificationIterator {
    pub(crate) fn new(remote: u8, slots: Arc<SlotTable>) -> Self {
        let words = (slots.capacity() + 63) / 64;
        Self {
            remote,
            slots,
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            cursor: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            work: Notify::new(),
        }
    }

    /// The remote identifier this iterator feeds.
    pub fn remote(&self) -> u8 {
        self.remote
    }

    /// Mark a slot dirty for this remote.
    ///
    /// Called by the map under its per-slot write, and by `next_entry` when
    /// the sink declines. Wakes the waiting session when new work appears.
    pub(crate) fn set(&self, slot: usize) {
        let mask = 1u64 << (slot % 64);
        let prev = self.words[slot / 64].fetch_or(mask, Ordering::AcqRel);
        if prev & mask == 0 {
            self.pending.fetch_add(1, Ordering::AcqRel);
            self.work.notify_one();
        }
    }

    /// Clear a slot's bit; returns whether it was set.
    fn test_and_clear(&self, slot: usize) -> bool {
        let mask = 1u64 << (slot % 64);
        let prev = self.words[slot / 64].fetch_and(!mask, Ordering::AcqRel);
        if prev & mask != 0 {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Whether any slot is currently dirty.
    pub fn has_work(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    /// Number of dirty slots.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// A future resolving when new work is marked.
    ///
    /// Create the future *before* draining, then await it: a set that races
    /// the drain stores a wakeup permit instead of being lost.
    pub fn work_notified(&self) -> Notified<'_> {
        self.work.notified()
    }

    /// Scan for the next dirty slot and hand its entry to `sink`.
    ///
    /// Scans from the cursor, wrapping once. Returns `true` if an entry was
    /// delivered, `false` if a full scan produced none or the sink declined
    /// (in which case the bit is restored and the cursor stays on the slot).
    pub fn next_entry<S: EntrySink + ?Sized>(&self, sink: &mut S) -> bool {
        let capacity = self.slots.capacity();
        if capacity == 0 {
            return false;
        }
        let start = self.cursor.load(Ordering::Acquire);
        for offset in 0..capacity {
            let slot = (start + offset) % capacity;
            if !self.test_and_clear(slot) {
                continue;
            }
            let Some(entry) = self.slots.get_slot(slot) else {
                // Stale bit on a never-written slot; nothing to send.
                continue;
            };
            if sink.on_entry(&entry) {
                self.cursor.store((slot + 1) % capacity, Ordering::Release);
                return true;
            }
            // Declined: restore the bit and retry this slot first next pass.
            self.set(slot);
            self.cursor.store(slot, Ordering::Release);
            return false;
        }
        false
    }

    /// Bulk-mark every slot whose entry has `lastModifiedTimestamp >= timestamp`.
    ///
    /// Used at bootstrap to replay everything the remote missed. Returns the
    /// number of slots tagged.
    pub fn dirty_entries_from(&self, timestamp: u64) -> usize {
        let mut tagged = 0;
        self.slots.scan_versions(|slot, version| {
            if version.timestamp >= timestamp {
                self.set(slot);
                tagged += 1;
            }
        });
        tagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ReplicatedStore, SharedMap};

    /// Collects every offered entry.
    struct CollectSink(Vec<Entry>);

    impl EntrySink for CollectSink {
        fn on_entry(&mut self, entry: &Entry) -> bool {
            self.0.push(entry.clone());
            true
        }
    }

    /// Declines everything.
    struct DeclineSink;

    impl EntrySink for DeclineSink {
        fn on_entry(&mut self, _entry: &Entry) -> bool {
            false
        }
    }

    #[test]
    fn test_next_entry_empty() {
        let map = SharedMap::new(1);
        let iter = map.modification_iterator_for(2);
        let mut sink = CollectSink(Vec::new());
        assert!(!iter.next_entry(&mut sink));
        assert!(sink.0.is_empty());
        assert!(!iter.has_work());
    }

    #[test]
    fn test_put_marks_and_next_entry_delivers_once() {
        let map = SharedMap::new(1);
        let iter = map.modification_iterator_for(2);

        map.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert!(iter.has_work());
        assert_eq!(iter.pending(), 1);

        let mut sink = CollectSink(Vec::new());
        assert!(iter.next_entry(&mut sink));
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].key, b"k");

        // Exactly once: a second scan yields nothing.
        assert!(!iter.next_entry(&mut sink));
        assert_eq!(sink.0.len(), 1);
        assert!(!iter.has_work());
    }

    #[test]
    fn test_decline_restores_bit() {
        let map = SharedMap::new(1);
        let iter = map.modification_iterator_for(2);
        map.put(b"k".to_vec(), b"v".to_vec()).unwrap();

        assert!(!iter.next_entry(&mut DeclineSink));
        // Still dirty; a willing sink gets it on retry.
        assert!(iter.has_work());
        let mut sink = CollectSink(Vec::new());
        assert!(iter.next_entry(&mut sink));
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn test_each_remote_has_independent_bits() {
        let map = SharedMap::new(1);
        let iter2 = map.modification_iterator_for(2);
        let iter3 = map.modification_iterator_for(3);
        map.put(b"k".to_vec(), b"v".to_vec()).unwrap();

        let mut sink = CollectSink(Vec::new());
        assert!(iter2.next_entry(&mut sink));

        // Consuming for peer 2 leaves peer 3's bit set.
        assert!(iter3.has_work());
        let mut sink3 = CollectSink(Vec::new());
        assert!(iter3.next_entry(&mut sink3));
        assert_eq!(sink3.0.len(), 1);
    }

    #[test]
    fn test_fairness_cursor_round_robins() {
        let map = SharedMap::new(1);
        let iter = map.modification_iterator_for(2);
        for i in 0..4u8 {
            map.put(vec![i], vec![i]).unwrap();
        }

        let mut sink = CollectSink(Vec::new());
        while iter.next_entry(&mut sink) {}
        assert_eq!(sink.0.len(), 4);
        // Slot order, each exactly once.
        let keys: Vec<_> = sink.0.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![vec![0], vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_rewrite_before_consume_sends_latest_value_once() {
        let map = SharedMap::new(1);
        let iter = map.modification_iterator_for(2);
        map.put(b"k".to_vec(), b"old".to_vec()).unwrap();
        map.put(b"k".to_vec(), b"new".to_vec()).unwrap();

        assert_eq!(iter.pending(), 1);
        let mut sink = CollectSink(Vec::new());
        assert!(iter.next_entry(&mut sink));
        assert!(!iter.next_entry(&mut sink));
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].value.as_deref(), Some(b"new".as_ref()));
    }

    #[test]
    fn test_writes_before_any_session_are_already_tagged() {
        let map = SharedMap::new(1);
        map.put(b"early".to_vec(), b"1".to_vec()).unwrap();

        // Trackers exist from construction, so a peer that shows up later
        // still receives writes made before its session formed.
        let iter = map.modification_iterator_for(2);
        assert!(iter.has_work());
    }

    #[test]
    fn test_dirty_entries_from_zero_retags_consumed_slots() {
        let map = SharedMap::new(1);
        map.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        map.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        map.remove(b"a".to_vec()).unwrap();

        // Consume everything, as a previous session would have.
        let iter = map.modification_iterator_for(2);
        let mut sink = CollectSink(Vec::new());
        while iter.next_entry(&mut sink) {}
        assert!(!iter.has_work());

        // Bootstrap replay: a remote reporting lastSeen 0 gets everything,
        // tombstones included.
        let tagged = iter.dirty_entries_from(0);
        assert_eq!(tagged, 2); // two slots: "a" (tombstone) and "b"

        let mut replay = CollectSink(Vec::new());
        while iter.next_entry(&mut replay) {}
        assert_eq!(replay.0.len(), 2);
        assert!(replay.0.iter().any(|e| e.key == b"a" && e.is_tombstone()));
    }

    #[test]
    fn test_dirty_entries_from_timestamp_filters() {
        let map = SharedMap::new(1);
        map.put(b"old".to_vec(), b"1".to_vec()).unwrap();
        let cutoff = map.last_modification() + 1;
        map.put(b"new".to_vec(), b"2".to_vec()).unwrap();

        let iter = map.modification_iterator_for(2);
        let mut sink = CollectSink(Vec::new());
        while iter.next_entry(&mut sink) {}

        // Only the entry at or past the cutoff is replayed.
        let tagged = iter.dirty_entries_from(cutoff);
        assert_eq!(tagged, 1);

        let mut replay = CollectSink(Vec::new());
        assert!(iter.next_entry(&mut replay));
        assert_eq!(replay.0[0].key, b"new");
    }

    #[test]
    fn test_dirty_entries_from_is_idempotent_for_pending() {
        let map = SharedMap::new(1);
        map.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        let iter = map.modification_iterator_for(2);
        iter.dirty_entries_from(0);
        iter.dirty_entries_from(0);
        assert_eq!(iter.pending(), 1);
    }

    #[tokio::test]
    async fn test_work_notified_wakes_on_set() {
        let map = SharedMap::new(1);
        let iter = map.modification_iterator_for(2);

        let notified = iter.work_notified();
        map.put(b"k".to_vec(), b"v".to_vec()).unwrap();

        // Must complete without hanging.
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .expect("set() should wake the waiter");
    }
}
