// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

//! The tail of the log that exists only in memory.

use slog::Logger;

use crate::raftpb::{Entry, Snapshot};

/// Entries appended locally but not yet handed back as durable, plus an
/// incoming snapshot awaiting application, if any.
///
/// `entries[i]` holds log position `i + offset`. The offset may lie below the
/// end of the durable log: the next persistence pass then truncates the
/// durable log before writing, which is exactly how conflict repair reaches
/// disk.
#[derive(Debug)]
pub struct Unstable {
    /// An incoming snapshot, if any, waiting to be applied by the store.
    pub snapshot: Option<Snapshot>,

    /// All entries not yet written to storage.
    pub entries: Vec<Entry>,

    /// The log position of `entries[0]`.
    pub offset: u64,

    /// Logger scoped to this node.
    pub logger: Logger,
}

impl Unstable {
    /// Creates an empty unstable tail starting at `offset`.
    pub fn new(offset: u64, logger: Logger) -> Unstable {
        Unstable {
            offset,
            snapshot: None,
            entries: vec![],
            logger,
        }
    }

    /// The first index covered here, which exists only while a snapshot is
    /// pending (its index plus one).
    pub fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot
            .as_ref()
            .map(|snap| snap.get_metadata().index + 1)
    }

    /// The last index covered here, from the entries if there are any, else
    /// from the pending snapshot.
    pub fn maybe_last_index(&self) -> Option<u64> {
        match self.entries.len() {
            0 => self.snapshot.as_ref().map(|snap| snap.get_metadata().index),
            len => Some(self.offset + len as u64 - 1),
        }
    }

    /// The term at `idx`, when `idx` is covered by the entries or is exactly
    /// the pending snapshot's index.
    pub fn maybe_term(&self, idx: u64) -> Option<u64> {
        if idx < self.offset {
            let snapshot = self.snapshot.as_ref()?;
            let meta = snapshot.get_metadata();
            if idx == meta.index {
                Some(meta.term)
            } else {
                None
            }
        } else {
            self.maybe_last_index().and_then(|last| {
                if idx > last {
                    return None;
                }
                Some(self.entries[(idx - self.offset) as usize].term)
            })
        }
    }

    /// Marks entries up to `(idx, term)` as durable, releasing them from the
    /// tail. Ignored if `(idx, term)` no longer names a live unstable entry:
    /// the tail was truncated by a conflicting append after the persistence
    /// pass started, and the stale prefix must not be released.
    pub fn stable_to(&mut self, idx: u64, term: u64) {
        match self.maybe_term(idx) {
            Some(t) if t == term && idx >= self.offset => {
                let stable = (idx + 1 - self.offset) as usize;
                self.entries.drain(..stable);
                self.offset = idx + 1;
            }
            _ => (),
        }
    }

    /// Releases the pending snapshot after the store applied it.
    ///
    /// Ignored unless `idx` names the pending snapshot, so a stale
    /// acknowledgment cannot release a newer snapshot.
    pub fn stable_snap_to(&mut self, idx: u64) {
        if let Some(snap) = &self.snapshot {
            if snap.get_metadata().index == idx {
                self.snapshot = None;
            }
        }
    }

    /// Replaces the whole tail with an incoming snapshot.
    pub fn restore(&mut self, snap: Snapshot) {
        self.entries.clear();
        self.offset = snap.get_metadata().index + 1;
        self.snapshot = Some(snap);
    }

    /// Appends entries, truncating any overlapping suffix first.
    pub fn truncate_and_append(&mut self, ents: &[Entry]) {
        let after = ents[0].index;
        let next = self.offset + self.entries.len() as u64;
        if after == next {
            // Contiguous; nothing to truncate.
        } else if after <= self.offset {
            // Everything here is being replaced.
            self.offset = after;
            self.entries.clear();
        } else {
            // Keep [offset, after), drop the rest.
            self.must_check_outofbounds(self.offset, after);
            self.entries.truncate((after - self.offset) as usize);
        }
        self.entries.extend_from_slice(ents);
    }

    /// A borrowed slice of positions `[lo, hi)`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the tail.
    pub fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        self.must_check_outofbounds(lo, hi);
        let off = self.offset as usize;
        &self.entries[lo as usize - off..hi as usize - off]
    }

    fn must_check_outofbounds(&self, lo: u64, hi: u64) {
        if lo > hi {
            fatal!(self.logger, "invalid unstable.slice {} > {}", lo, hi)
        }
        let upper = self.offset + self.entries.len() as u64;
        if lo < self.offset || hi > upper {
            fatal!(
                self.logger,
                "unstable.slice[{}, {}) out of bound [{}, {})",
                lo,
                hi,
                self.offset,
                upper
            )
        }
    }
}
