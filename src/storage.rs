// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

//! The durable side of the log, seen from the consensus core.
//!
//! The core reads the stable log exclusively through the [`Storage`] trait;
//! writing (appending what a `Ready` hands back, applying snapshots,
//! compacting) stays between the embedder and its storage engine. The
//! [`MemStorage`] here is the reference implementation the tests run
//! against, and the template for integrating a real engine.

use std::cmp;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{Error, Result, StorageError};
use crate::raftpb::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use crate::util::limit_size;

/// The durable state a node recovers from at startup.
#[derive(Debug, Clone, Default)]
pub struct RaftState {
    /// The last persisted term/vote/commit triple.
    pub hard_state: HardState,
    /// The membership as of the last snapshot or conf change.
    pub conf_state: ConfState,
}

impl RaftState {
    /// Creates a `RaftState`.
    pub fn new(hard_state: HardState, conf_state: ConfState) -> RaftState {
        RaftState {
            hard_state,
            conf_state,
        }
    }

    /// Whether the state describes a node that has ever joined a group.
    pub fn initialized(&self) -> bool {
        self.conf_state != ConfState::default()
    }
}

/// What the consensus core needs from durable log storage.
///
/// Implementations are free to buffer internally, but every method is
/// answered synchronously from the core's point of view. When a method
/// returns an error the core refuses to participate further; recovery is the
/// application's concern.
pub trait Storage {
    /// Returns the recovered `RaftState`. Called once, when the node starts.
    fn initial_state(&self) -> Result<RaftState>;

    /// Returns the entries in `[low, high)`, total size limited to
    /// `max_size` encoded bytes (at least one entry is returned when any
    /// exist, so progress is always possible).
    fn entries(&self, low: u64, high: u64, max_size: impl Into<Option<u64>>)
        -> Result<Vec<Entry>>;

    /// Returns the term of entry `idx`, which must be in
    /// `[first_index() - 1, last_index()]`. The term of the entry just below
    /// `first_index` is retained for matching even though the entry itself
    /// may be gone.
    fn term(&self, idx: u64) -> Result<u64>;

    /// The index of the first entry still available (everything below it has
    /// been folded into the latest snapshot).
    fn first_index(&self) -> Result<u64>;

    /// The index of the last entry in the log.
    fn last_index(&self) -> Result<u64>;

    /// Returns the most recent snapshot.
    ///
    /// If a snapshot is being generated right now, return
    /// [`StorageError::SnapshotTemporarilyUnavailable`]; the leader retries
    /// later, without tearing anything down.
    fn snapshot(&self) -> Result<Snapshot>;
}

/// The in-memory storage core behind [`MemStorage`].
#[derive(Default)]
pub struct MemStorageCore {
    raft_state: RaftState,
    // entries[i] has position i + snapshot_metadata.index + 1
    entries: Vec<Entry>,
    // Metadata of the last compaction.
    snapshot_metadata: SnapshotMetadata,
    // Makes the next snapshot() report "temporarily unavailable" once.
    trigger_snap_unavailable: bool,
}

impl MemStorageCore {
    /// Persists a hard state.
    pub fn set_hardstate(&mut self, hs: HardState) {
        self.raft_state.hard_state = hs;
    }

    /// The current hard state.
    pub fn hard_state(&self) -> &HardState {
        &self.raft_state.hard_state
    }

    /// Mutable access to the hard state.
    pub fn mut_hard_state(&mut self) -> &mut HardState {
        &mut self.raft_state.hard_state
    }

    /// Persists a conf state.
    pub fn set_conf_state(&mut self, cs: ConfState) {
        self.raft_state.conf_state = cs;
    }

    /// Marks entries up to `index` committed in the hard state.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not in the log.
    pub fn commit_to(&mut self, index: u64) -> Result<()> {
        assert!(
            self.has_entry_at(index),
            "commit_to {} but the entry does not exist",
            index
        );
        let diff = (index - self.entries[0].index) as usize;
        self.raft_state.hard_state.commit = index;
        self.raft_state.hard_state.term = self.entries[diff].term;
        Ok(())
    }

    #[inline]
    fn has_entry_at(&self, index: u64) -> bool {
        !self.entries.is_empty() && index >= self.first_index() && index <= self.last_index()
    }

    fn first_index(&self) -> u64 {
        match self.entries.first() {
            Some(e) => e.index,
            None => self.snapshot_metadata.index + 1,
        }
    }

    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(e) => e.index,
            None => self.snapshot_metadata.index,
        }
    }

    /// Overwrites the contents with the given snapshot.
    ///
    /// Refuses a snapshot older than what is already here.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let index = meta.index;

        if self.first_index() > index {
            return Err(Error::Store(StorageError::SnapshotOutOfDate));
        }

        self.snapshot_metadata = meta.clone();
        self.raft_state.hard_state.term = cmp::max(self.raft_state.hard_state.term, meta.term);
        self.raft_state.hard_state.commit = index;
        self.entries.clear();
        self.raft_state.conf_state = meta.get_conf_state().clone();
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();

        // The snapshot covers what the state machine could have applied:
        // everything up to the committed index.
        let meta = snapshot.mut_metadata();
        meta.index = self.raft_state.hard_state.commit;
        meta.term = match meta.index.cmp(&self.snapshot_metadata.index) {
            cmp::Ordering::Equal => self.snapshot_metadata.term,
            cmp::Ordering::Greater => {
                let offset = self.entries[0].index;
                self.entries[(meta.index - offset) as usize].term
            }
            cmp::Ordering::Less => {
                panic!(
                    "commit {} < snapshot_metadata.index {}",
                    meta.index, self.snapshot_metadata.index
                );
            }
        };
        meta.set_conf_state(self.raft_state.conf_state.clone());
        snapshot
    }

    /// Discards all entries up to `compact_index` exclusive. An
    /// already-compacted target is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `compact_index` lies past `last_index() + 1`.
    pub fn compact(&mut self, compact_index: u64) -> Result<()> {
        if compact_index <= self.first_index() {
            return Ok(());
        }
        if compact_index > self.last_index() + 1 {
            panic!(
                "compact {} is out of bound (last index {})",
                compact_index,
                self.last_index()
            );
        }

        let offset = (compact_index - self.entries[0].index) as usize;
        // Remember the term boundary so matching at first_index - 1 keeps
        // working after the drain.
        self.snapshot_metadata.index = compact_index - 1;
        self.snapshot_metadata.term = self.entries[offset - 1].term;
        self.entries.drain(..offset);
        Ok(())
    }

    /// Appends entries to the log, replacing any conflicting suffix.
    ///
    /// # Panics
    ///
    /// Panics if the entries overwrite compacted positions or leave a gap
    /// after the current last index.
    pub fn append(&mut self, ents: &[Entry]) -> Result<()> {
        if ents.is_empty() {
            return Ok(());
        }
        if self.first_index() > ents[0].index {
            panic!(
                "overwriting compacted logs, compacted: {}, append: {}",
                self.first_index() - 1,
                ents[0].index,
            );
        }
        if self.last_index() + 1 < ents[0].index {
            panic!(
                "raft logs should be continuous, last index: {}, new appended: {}",
                self.last_index(),
                ents[0].index,
            );
        }

        let diff = (ents[0].index - self.first_index()) as usize;
        self.entries.truncate(diff);
        self.entries.extend_from_slice(ents);
        Ok(())
    }

    /// Makes the next `snapshot()` call fail once with
    /// `SnapshotTemporarilyUnavailable`.
    pub fn trigger_snap_unavailable(&mut self) {
        self.trigger_snap_unavailable = true;
    }
}

/// A thread-safe in-memory [`Storage`].
///
/// Cloning shares the underlying store; the tests clone one instance into
/// several simulated nodes' views. Mutation goes through [`MemStorage::wl`].
#[derive(Clone, Default)]
pub struct MemStorage {
    core: Arc<RwLock<MemStorageCore>>,
}

impl MemStorage {
    /// Creates an empty store.
    ///
    /// The first configuration must arrive through `apply_snapshot`,
    /// `initialize_with_conf_state`, or replayed conf-change entries before
    /// the node can campaign.
    pub fn new() -> MemStorage {
        MemStorage::default()
    }

    /// Creates a store bootstrapped with the given membership and an empty
    /// log, the state a node is born with when it founds a group.
    pub fn new_with_conf_state<T>(conf_state: T) -> MemStorage
    where
        ConfState: From<T>,
    {
        let store = MemStorage::new();
        store.initialize_with_conf_state(conf_state);
        store
    }

    /// Installs the given membership into an empty store.
    ///
    /// # Panics
    ///
    /// Panics if the store has any state already.
    pub fn initialize_with_conf_state<T>(&self, conf_state: T)
    where
        ConfState: From<T>,
    {
        assert!(!self.initial_state().unwrap().initialized());
        self.wl().raft_state.conf_state = ConfState::from(conf_state);
    }

    /// Acquires read access to the core.
    pub fn rl(&self) -> RwLockReadGuard<'_, MemStorageCore> {
        self.core.read().unwrap()
    }

    /// Acquires write access to the core.
    pub fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.core.write().unwrap()
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> Result<RaftState> {
        Ok(self.rl().raft_state.clone())
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
    ) -> Result<Vec<Entry>> {
        let max_size = max_size.into();
        let core = self.rl();
        if low < core.first_index() {
            return Err(Error::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            panic!(
                "index out of bound (last: {}, high: {})",
                core.last_index() + 1,
                high
            );
        }
        if low == high {
            return Ok(Vec::new());
        }

        let offset = core.entries[0].index;
        let lo = (low - offset) as usize;
        let hi = (high - offset) as usize;
        let mut ents = core.entries[lo..hi].to_vec();
        limit_size(&mut ents, max_size);
        Ok(ents)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        let core = self.rl();
        if idx == core.snapshot_metadata.index {
            return Ok(core.snapshot_metadata.term);
        }

        let offset = core.first_index();
        if idx < offset {
            return Err(Error::Store(StorageError::Compacted));
        }
        if idx > core.last_index() {
            return Err(Error::Store(StorageError::Unavailable));
        }
        Ok(core.entries[(idx - offset) as usize].term)
    }

    fn first_index(&self) -> Result<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let mut core = self.wl();
        if core.trigger_snap_unavailable {
            core.trigger_snap_unavailable = false;
            Err(Error::Store(StorageError::SnapshotTemporarilyUnavailable))
        } else {
            Ok(core.snapshot())
        }
    }
}
