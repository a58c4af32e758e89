// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use std::cmp;

use slog::Logger;

use crate::errors::{Error, Result, StorageError};
use crate::log_unstable::Unstable;
use crate::raftpb::{Entry, Snapshot};
use crate::storage::Storage;
use crate::util;

pub use crate::util::NO_LIMIT;

/// The single logical log a node reasons about: an immutable stable prefix
/// owned by the storage adapter, continued by the in-memory [`Unstable`]
/// tail, with the commit and apply watermarks that separate "replicated",
/// "safe to apply" and "already applied".
pub struct RaftLog<T: Storage> {
    /// The stable entries since the last snapshot.
    pub store: T,

    /// The unstable tail and any pending snapshot, waiting for durability.
    pub unstable: Unstable,

    /// The highest position known to be durable on a quorum.
    pub committed: u64,

    /// The highest position handed to the apply callback.
    ///
    /// Invariant: `applied <= committed`.
    pub applied: u64,
}

impl<T: Storage> std::fmt::Display for RaftLog<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "committed={}, applied={}, unstable.offset={}, unstable.entries.len()={}",
            self.committed,
            self.applied,
            self.unstable.offset,
            self.unstable.entries.len()
        )
    }
}

impl<T: Storage> RaftLog<T> {
    /// Creates a log over `store`, with both watermarks at the last
    /// compaction point.
    pub fn new(store: T, logger: Logger) -> RaftLog<T> {
        let first_index = store.first_index().unwrap();
        let last_index = store.last_index().unwrap();

        RaftLog {
            store,
            committed: first_index - 1,
            applied: first_index - 1,
            unstable: Unstable::new(last_index + 1, logger),
        }
    }

    /// The term of the last entry.
    ///
    /// # Panics
    ///
    /// Fatal if the last entry's term is not retrievable, which cannot
    /// happen on an intact log.
    pub fn last_term(&self) -> u64 {
        match self.term(self.last_index()) {
            Ok(t) => t,
            Err(e) => fatal!(
                self.unstable.logger,
                "unexpected error when getting the last term: {:?}",
                e
            ),
        }
    }

    /// A read-only handle on the storage adapter.
    #[inline]
    pub fn store(&self) -> &T {
        &self.store
    }

    /// A mutable handle on the storage adapter.
    #[inline]
    pub fn mut_store(&mut self) -> &mut T {
        &mut self.store
    }

    /// The term of the entry at `idx`.
    ///
    /// Indexes outside `[first_index - 1, last_index]` answer 0 rather than
    /// erroring: callers compare terms for matching, and "not there" never
    /// matches.
    pub fn term(&self, idx: u64) -> Result<u64> {
        let dummy_idx = self.first_index() - 1;
        if idx < dummy_idx || idx > self.last_index() {
            return Ok(0u64);
        }

        match self.unstable.maybe_term(idx) {
            Some(term) => Ok(term),
            _ => self.store.term(idx).map_err(|e| {
                match e {
                    Error::Store(StorageError::Compacted)
                    | Error::Store(StorageError::Unavailable) => {}
                    _ => fatal!(self.unstable.logger, "unexpected error: {:?}", e),
                }
                e
            }),
        }
    }

    /// The first index still reachable through this log.
    pub fn first_index(&self) -> u64 {
        match self.unstable.maybe_first_index() {
            Some(idx) => idx,
            None => self.store.first_index().unwrap(),
        }
    }

    /// The last index of the log.
    pub fn last_index(&self) -> u64 {
        match self.unstable.maybe_last_index() {
            Some(idx) => idx,
            None => self.store.last_index().unwrap(),
        }
    }

    /// Finds the first entry in `ents` that actually conflicts with this log
    /// (same index, different term).
    ///
    /// Returns 0 when nothing conflicts and nothing is new; returns the
    /// first new index when `ents` merely extends the log. The caller relies
    /// on this to truncate as little as possible: matching prefixes are
    /// never re-written.
    ///
    /// `ents` must be contiguous and start right after the position the
    /// caller matched.
    pub fn find_conflict(&self, ents: &[Entry]) -> u64 {
        for e in ents {
            if !self.match_term(e.index, e.term) {
                if e.index <= self.last_index() {
                    info!(
                        self.unstable.logger,
                        "found conflict at index {index}",
                        index = e.index;
                        "existing term" => self.term(e.index).unwrap_or(0),
                        "conflicting term" => e.term,
                    );
                }
                return e.index;
            }
        }
        0
    }

    /// Whether the entry at `idx` carries `term`.
    pub fn match_term(&self, idx: u64, term: u64) -> bool {
        self.term(idx).map(|t| t == term).unwrap_or(false)
    }

    /// The append-side of replication: accepts `ents` if this log matches
    /// `(idx, term)`, truncating from the first real conflict and appending
    /// from there, then advancing the commit watermark to
    /// `min(committed, last_new_index)`.
    ///
    /// Returns `None` when `(idx, term)` does not match; the caller rejects
    /// the message and reports its actual last index as the hint.
    ///
    /// # Panics
    ///
    /// Fatal if a conflict lies at or below the committed watermark;
    /// committed entries are immutable by definition.
    pub fn maybe_append(
        &mut self,
        idx: u64,
        term: u64,
        committed: u64,
        ents: &[Entry],
    ) -> Option<(u64, u64)> {
        if !self.match_term(idx, term) {
            return None;
        }

        let conflict_idx = self.find_conflict(ents);
        if conflict_idx == 0 {
            // Nothing to write; everything already present.
        } else if conflict_idx <= self.committed {
            fatal!(
                self.unstable.logger,
                "entry {} conflicts with committed entry {}",
                conflict_idx,
                self.committed
            )
        } else {
            let start = (conflict_idx - (idx + 1)) as usize;
            self.append(&ents[start..]);
        }
        let last_new_index = idx + ents.len() as u64;
        self.commit_to(cmp::min(committed, last_new_index));
        Some((conflict_idx, last_new_index))
    }

    /// Advances the commit watermark. Never moves backwards.
    ///
    /// # Panics
    ///
    /// Fatal if `to_commit` lies past the last index: a commit index is a
    /// claim about entries this log holds, so an out-of-range one means the
    /// protocol state upstream is already corrupt.
    pub fn commit_to(&mut self, to_commit: u64) {
        if self.committed >= to_commit {
            return;
        }
        if self.last_index() < to_commit {
            fatal!(
                self.unstable.logger,
                "to_commit {} is out of range [last_index {}]",
                to_commit,
                self.last_index()
            )
        }
        self.committed = to_commit;
    }

    /// Advances the applied watermark to `idx`.
    ///
    /// # Panics
    ///
    /// Fatal if `idx` is above committed or below the current applied
    /// position.
    pub fn applied_to(&mut self, idx: u64) {
        if idx == 0 {
            return;
        }
        if self.committed < idx || idx < self.applied {
            fatal!(
                self.unstable.logger,
                "applied({}) is out of range [prev_applied({}), committed({})]",
                idx,
                self.applied,
                self.committed
            )
        }
        self.applied = idx;
    }

    /// The applied watermark.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Durability handshake: storage reports entries up to `(idx, term)`
    /// persisted, releasing them from the unstable tail.
    pub fn stable_to(&mut self, idx: u64, term: u64) {
        self.unstable.stable_to(idx, term)
    }

    /// Durability handshake for a pending snapshot.
    pub fn stable_snap_to(&mut self, idx: u64) {
        self.unstable.stable_snap_to(idx)
    }

    /// The unstable tail.
    pub fn unstable(&self) -> &Unstable {
        &self.unstable
    }

    /// Appends entries to the unstable tail, truncating any conflicting
    /// suffix first. Returns the new last index.
    ///
    /// # Panics
    ///
    /// Fatal if the entries would rewrite committed positions.
    pub fn append(&mut self, ents: &[Entry]) -> u64 {
        trace!(
            self.unstable.logger,
            "appending to unstable";
            "ents" => ?ents,
        );
        if ents.is_empty() {
            return self.last_index();
        }

        let after = ents[0].index - 1;
        if after < self.committed {
            fatal!(
                self.unstable.logger,
                "after {} is out of range [committed {}]",
                after,
                self.committed
            )
        }
        self.unstable.truncate_and_append(ents);
        self.last_index()
    }

    /// The entries waiting for the durability handshake, if any.
    pub fn unstable_entries(&self) -> Option<&[Entry]> {
        if self.unstable.entries.is_empty() {
            return None;
        }
        Some(&self.unstable.entries)
    }

    /// Entries from `idx` to the end, limited to `max_size` encoded bytes.
    pub fn entries(&self, idx: u64, max_size: impl Into<Option<u64>>) -> Result<Vec<Entry>> {
        let max_size = max_size.into();
        let last = self.last_index();
        if idx > last {
            return Ok(Vec::new());
        }
        self.slice(idx, last + 1, max_size)
    }

    /// Every reachable entry.
    pub fn all_entries(&self) -> Vec<Entry> {
        let first_index = self.first_index();
        match self.entries(first_index, None) {
            Err(e) => {
                // A compaction can race a caller that read first_index a
                // moment ago; retry against the new boundary.
                if e == Error::Store(StorageError::Compacted) {
                    return self.all_entries();
                }
                fatal!(self.unstable.logger, "unexpected error: {:?}", e);
            }
            Ok(ents) => ents,
        }
    }

    /// Whether a log ending in `(last_index, term)` is at least as
    /// up-to-date as this one: a later last term wins, and within the same
    /// last term the longer log wins, ties included. This asymmetric
    /// "greater or equal" is what lets two identical logs vote for each
    /// other.
    pub fn is_up_to_date(&self, last_index: u64, term: u64) -> bool {
        term > self.last_term() || (term == self.last_term() && last_index >= self.last_index())
    }

    /// Committed entries past `since_idx` that are ready for application.
    ///
    /// Returns nothing while a snapshot application is pending: applying
    /// log entries before the snapshot they logically follow would feed the
    /// state machine out of order.
    pub fn next_entries_since(&self, since_idx: u64) -> Option<Vec<Entry>> {
        if self.unstable.snapshot.is_some() {
            return None;
        }
        let offset = cmp::max(since_idx + 1, self.first_index());
        let committed = self.committed;
        if committed + 1 > offset {
            match self.slice(offset, committed + 1, None) {
                Ok(vec) => return Some(vec),
                Err(e) => fatal!(self.unstable.logger, "{}", e),
            }
        }
        None
    }

    /// Committed-but-unapplied entries, ready for application.
    pub fn next_entries(&self) -> Option<Vec<Entry>> {
        self.next_entries_since(self.applied)
    }

    /// Whether entries are ready for application past `since_idx`.
    pub fn has_next_entries_since(&self, since_idx: u64) -> bool {
        if self.unstable.snapshot.is_some() {
            return false;
        }
        let offset = cmp::max(since_idx + 1, self.first_index());
        self.committed + 1 > offset
    }

    /// Whether entries are ready for application.
    pub fn has_next_entries(&self) -> bool {
        self.has_next_entries_since(self.applied)
    }

    /// The snapshot that covers this log's prefix: the pending one when a
    /// restore is in flight, otherwise whatever storage has.
    pub fn snapshot(&self) -> Result<Snapshot> {
        if let Some(snap) = self.unstable.snapshot.as_ref() {
            return Ok(snap.clone());
        }
        self.store.snapshot()
    }

    pub(crate) fn pending_snapshot(&self) -> Option<&Snapshot> {
        self.unstable.snapshot.as_ref()
    }

    fn must_check_outofbounds(&self, low: u64, high: u64) -> Option<Error> {
        if low > high {
            fatal!(self.unstable.logger, "invalid slice {} > {}", low, high)
        }
        let first_index = self.first_index();
        if low < first_index {
            return Some(Error::Store(StorageError::Compacted));
        }
        if high > self.last_index() + 1 {
            fatal!(
                self.unstable.logger,
                "slice[{},{}) out of bound[{},{}]",
                low,
                high,
                first_index,
                self.last_index()
            )
        }
        None
    }

    /// Commits `max_index` if it is coverable and its entry carries `term`.
    ///
    /// The term check is the commit safety rule: a leader may only count
    /// replication of entries from its own term toward commitment; earlier
    /// terms ride along implicitly.
    pub fn maybe_commit(&mut self, max_index: u64, term: u64) -> bool {
        if max_index > self.committed && self.term(max_index).map_or(false, |t| t == term) {
            debug!(
                self.unstable.logger,
                "committing index {index}",
                index = max_index
            );
            self.commit_to(max_index);
            true
        } else {
            false
        }
    }

    /// Entries `[low, high)` by value, spanning the stable/unstable
    /// boundary transparently, truncated to `max_size` encoded bytes.
    pub fn slice(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
    ) -> Result<Vec<Entry>> {
        let max_size = max_size.into();
        if let Some(err) = self.must_check_outofbounds(low, high) {
            return Err(err);
        }

        let mut ents = vec![];
        if low == high {
            return Ok(ents);
        }

        if low < self.unstable.offset {
            let stable_high = cmp::min(high, self.unstable.offset);
            match self.store.entries(low, stable_high, max_size) {
                Err(e) => match e {
                    Error::Store(StorageError::Compacted) => return Err(e),
                    Error::Store(StorageError::Unavailable) => fatal!(
                        self.unstable.logger,
                        "entries[{}:{}) is unavailable from storage",
                        low,
                        stable_high,
                    ),
                    _ => fatal!(self.unstable.logger, "unexpected error: {:?}", e),
                },
                Ok(entries) => {
                    ents = entries;
                    if (ents.len() as u64) < stable_high - low {
                        // Storage truncated at its size limit already.
                        return Ok(ents);
                    }
                }
            }
        }

        if high > self.unstable.offset {
            let offset = self.unstable.offset;
            let unstable = self.unstable.slice(cmp::max(low, offset), high);
            ents.extend_from_slice(unstable);
        }
        util::limit_size(&mut ents, max_size);
        Ok(ents)
    }

    /// Resets the whole log onto `snapshot`: the commit watermark jumps to
    /// its index and the unstable tail holds it until storage applies it.
    pub fn restore(&mut self, snapshot: Snapshot) {
        info!(
            self.unstable.logger,
            "log [{log}] starts to restore snapshot [index: {snapshot_index}, term: {snapshot_term}]",
            log = self.to_string(),
            snapshot_index = snapshot.get_metadata().index,
            snapshot_term = snapshot.get_metadata().term,
        );
        self.committed = snapshot.get_metadata().index;
        self.unstable.restore(snapshot);
    }
}
