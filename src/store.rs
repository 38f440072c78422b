// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage adapter and the bundled in-memory map.
//!
//! The engine consumes storage through [`ReplicatedStore`]; [`SharedMap`] is
//! the bundled implementation: a fixed-capacity, slot-addressed in-memory map
//! with last-writer-wins merge semantics.
//!
//! # Contexts
//!
//! The *application* context calls [`SharedMap::put`] / [`SharedMap::remove`] /
//! [`SharedMap::get`]; these never block on the network. The *reactor*
//! context reads slots and applies incoming entries. All slot access goes
//! through one `RwLock` with short critical sections; the per-peer dirty bits
//! are atomics so sessions clear them without taking the write lock.
//!
//! # Tagging Invariant
//!
//! Trackers exist for the whole identifier space from map construction, so a
//! mutation made before any session forms is still tagged and replays once
//! the peer shows up. A local mutation sets every remote tracker's bit for
//! the slot *before* releasing the slot write lock, so the mutation is never
//! observable to an iterator without its bit set. Incoming entries installed
//! by [`SharedMap::apply_incoming`] do **not** tag any bits: a receiver never
//! re-broadcasts what it was sent.

use crate::entry::{Entry, Version, MAX_IDENTIFIER};
use crate::error::{ReplicationError, Result};
use crate::iter::ModificationIterator;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Default slot capacity of a [`SharedMap`].
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default maximum serialized entry size accepted by a [`SharedMap`].
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 1024;

/// Reserved channel identifier for the datagram replicator's dedicated
/// modification iterator. Outside the valid mesh range on purpose.
pub const DATAGRAM_CHANNEL: u8 = 0;

/// Storage consumed by the replication engine.
pub trait ReplicatedStore: Send + Sync + 'static {
    /// This node's mesh identifier.
    fn identifier(&self) -> u8;

    /// Highest `lastModifiedTimestamp` ever stored locally, across all keys.
    /// Embedded in the outgoing welcome.
    fn last_modification(&self) -> u64;

    /// The modification iterator bound to `remote`. Idempotent: the same
    /// identifier always returns the same iterator.
    fn modification_iterator_for(&self, remote: u8) -> Arc<ModificationIterator>;

    /// Read one slot.
    fn read_slot(&self, slot: usize) -> Result<Option<Entry>>;

    /// Apply an incoming entry under the merge rule.
    ///
    /// Returns `true` if the entry won and was installed, `false` if it was
    /// discarded. Installed entries are not tagged for re-broadcast.
    fn apply_incoming(&self, entry: Entry) -> Result<bool>;
}

/// Monotonic millisecond clock for local mutation timestamps.
///
/// Timestamps are milliseconds since the Unix epoch. `next()` returns
/// `max(now, last + 1)`, so successive local mutations are strictly
/// increasing and the modifier-identifier tiebreak only arbitrates
/// cross-node ties.
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Next local timestamp, strictly greater than any previously issued.
    pub fn next(&self) -> u64 {
        let now = epoch_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Slot storage shared between the map and its iterators.
pub(crate) struct SlotTable {
    inner: RwLock<SlotsInner>,
    capacity: usize,
}

struct SlotsInner {
    entries: Vec<Option<Entry>>,
    index: HashMap<Vec<u8>, usize>,
    used: usize,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(SlotsInner {
                entries: (0..capacity).map(|_| None).collect(),
                index: HashMap::new(),
                used: 0,
            }),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn get_slot(&self, slot: usize) -> Option<Entry> {
        let inner = self.inner.read().expect("map lock poisoned");
        inner.entries.get(slot).and_then(Clone::clone)
    }

    /// Visit `(slot, version)` for every occupied slot.
    pub(crate) fn scan_versions(&self, mut f: impl FnMut(usize, Version)) {
        let inner = self.inner.read().expect("map lock poisoned");
        for (slot, entry) in inner.entries.iter().enumerate() {
            if let Some(entry) = entry {
                f(slot, entry.version);
            }
        }
    }
}

impl SlotsInner {
    /// Slot for `key`, allocating one if the key is new.
    fn slot_for(&mut self, key: &[u8], capacity: usize) -> Result<usize> {
        if let Some(&slot) = self.index.get(key) {
            return Ok(slot);
        }
        if self.used == capacity {
            return Err(ReplicationError::Storage(format!(
                "map capacity exhausted ({capacity} slots)"
            )));
        }
        let slot = self.used;
        self.used += 1;
        self.index.insert(key.to_vec(), slot);
        Ok(slot)
    }
}

/// The bundled in-memory replicated map.
///
/// Construct with [`new`](Self::new) or [`with_limits`](Self::with_limits),
/// wrap in an [`Arc`], and hand it to [`Replicator::new`](crate::Replicator::new).
/// Slot capacity is fixed at construction; tombstones keep their slot until a
/// later entry supersedes them (tombstone GC is out of scope here).
pub struct SharedMap {
    identifier: u8,
    max_entry_bytes: usize,
    slots: Arc<SlotTable>,
    /// One tracker per channel identifier (0 = datagram, 1..=127 = peers),
    /// indexed by identifier. Allocated up front so writes made before a
    /// session exists are still tagged for that peer.
    trackers: Vec<Arc<ModificationIterator>>,
    clock: VersionClock,
    last_modification: AtomicU64,
}

impl SharedMap {
    /// Create a map with default capacity and entry size limit.
    ///
    /// `identifier` must be in `1..=127`; the engine validates this via the
    /// configuration before replicating.
    pub fn new(identifier: u8) -> Self {
        Self::with_limits(identifier, DEFAULT_CAPACITY, DEFAULT_MAX_ENTRY_BYTES)
    }

    /// Create a map with explicit slot capacity and entry size limit.
    ///
    /// `max_entry_bytes` should match the engine's `entry_max_size` so every
    /// accepted entry is guaranteed to fit an outbound chunk.
    pub fn with_limits(identifier: u8, capacity: usize, max_entry_bytes: usize) -> Self {
        let slots = Arc::new(SlotTable::new(capacity));
        let trackers = (0..=MAX_IDENTIFIER)
            .map(|id| Arc::new(ModificationIterator::new(id, Arc::clone(&slots))))
            .collect();
        Self {
            identifier,
            max_entry_bytes,
            slots,
            trackers,
            clock: VersionClock::new(),
            last_modification: AtomicU64::new(0),
        }
    }

    /// Store a value. Never blocks on the network.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        let version = Version::new(self.clock.next(), self.identifier);
        let entry = Entry::put(key, value, version);
        self.check_size(&entry)?;
        self.install_local(entry)?;
        Ok(())
    }

    /// Delete a key by installing a tombstone.
    ///
    /// Returns whether a live value existed. Deleting an unknown key still
    /// writes (and replicates) the tombstone.
    pub fn remove(&self, key: impl Into<Vec<u8>>) -> Result<bool> {
        let version = Version::new(self.clock.next(), self.identifier);
        let entry = Entry::tombstone(key, version);
        self.check_size(&entry)?;
        self.install_local(entry)
    }

    /// Read a live value. Tombstones are absent to readers.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.slots.inner.read().expect("map lock poisoned");
        let slot = *inner.index.get(key)?;
        inner.entries[slot]
            .as_ref()
            .and_then(|entry| entry.value.clone())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let inner = self.slots.inner.read().expect("map lock poisoned");
        inner
            .entries
            .iter()
            .flatten()
            .filter(|e| !e.is_tombstone())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live entries, ordered by key.
    ///
    /// Two converged maps produce equal snapshots; used by the convergence
    /// tests.
    pub fn live_entries(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let inner = self.slots.inner.read().expect("map lock poisoned");
        inner
            .entries
            .iter()
            .flatten()
            .filter_map(|e| Some((e.key.clone(), e.value.clone()?)))
            .collect()
    }

    fn check_size(&self, entry: &Entry) -> Result<()> {
        let len = entry.encoded_len();
        if len > self.max_entry_bytes {
            return Err(ReplicationError::Storage(format!(
                "entry of {len} bytes exceeds max_entry_bytes {}",
                self.max_entry_bytes
            )));
        }
        Ok(())
    }

    /// Install a local mutation and tag every tracker before the slot write
    /// lock is released.
    fn install_local(&self, entry: Entry) -> Result<bool> {
        let timestamp = entry.version.timestamp;
        let mut inner = self.slots.inner.write().expect("map lock poisoned");
        let slot = inner.slot_for(&entry.key, self.slots.capacity)?;
        let had_live = inner.entries[slot]
            .as_ref()
            .is_some_and(|e| !e.is_tombstone());
        trace!(slot, key = %String::from_utf8_lossy(&entry.key), tombstone = entry.is_tombstone(), "local mutation");
        inner.entries[slot] = Some(entry);
        self.last_modification.fetch_max(timestamp, Ordering::AcqRel);
        for tracker in &self.trackers {
            if tracker.remote() != self.identifier {
                tracker.set(slot);
            }
        }
        Ok(had_live)
    }
}

impl ReplicatedStore for SharedMap {
    fn identifier(&self) -> u8 {
        self.identifier
    }

    fn last_modification(&self) -> u64 {
        self.last_modification.load(Ordering::Acquire)
    }

    fn modification_iterator_for(&self, remote: u8) -> Arc<ModificationIterator> {
        // Identifiers are 7-bit; sessions validate the range before binding.
        Arc::clone(&self.trackers[(remote & MAX_IDENTIFIER) as usize])
    }

    fn read_slot(&self, slot: usize) -> Result<Option<Entry>> {
        Ok(self.slots.get_slot(slot))
    }

    fn apply_incoming(&self, entry: Entry) -> Result<bool> {
        let timestamp = entry.version.timestamp;
        let mut inner = self.slots.inner.write().expect("map lock poisoned");
        let slot = inner.slot_for(&entry.key, self.slots.capacity)?;
        let wins = match &inner.entries[slot] {
            None => true,
            Some(local) => entry.version > local.version,
        };
        if wins {
            trace!(
                slot,
                key = %String::from_utf8_lossy(&entry.key),
                modifier = entry.version.modifier,
                "incoming entry installed"
            );
            inner.entries[slot] = Some(entry);
            self.last_modification.fetch_max(timestamp, Ordering::AcqRel);
            // No tracker tagging: incoming updates are not re-broadcast.
        } else {
            trace!(
                slot,
                key = %String::from_utf8_lossy(&entry.key),
                "incoming entry discarded by merge rule"
            );
        }
        Ok(wins)
    }
}
