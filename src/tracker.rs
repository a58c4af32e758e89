// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

mod inflights;
mod progress;
mod state;

pub use self::inflights::Inflights;
pub use self::progress::Progress;
pub use self::state::ProgressState;

use crate::confchange::{MapChange, MapChangeType};
use crate::quorum::{AckedIndexer, VoteResult};
use crate::raftpb::ConfState;
use crate::{DefaultHashBuilder, HashMap, HashSet, JointConfig};

/// The membership the tracker currently enforces.
#[derive(Clone, Debug, Default, PartialEq, Getters)]
pub struct Configuration {
    /// The voter sets. `voters.outgoing` is populated exactly while the
    /// group sits in a joint configuration.
    #[get = "pub"]
    pub(crate) voters: JointConfig,
    /// Ids receiving the log without voting.
    ///
    /// Invariant: `learners` never intersects either voter set. A peer's
    /// role is unambiguous at any moment, joint configuration or not.
    #[get = "pub"]
    pub(crate) learners: HashSet<u64>,
    /// Outgoing voters that demote to learner when the joint configuration
    /// is left. They cannot be learners yet, because a peer may not be voter
    /// and learner at once.
    #[get = "pub"]
    pub(crate) learners_next: HashSet<u64>,
    /// Whether the leave-joint entry is appended automatically once the
    /// entry that created this joint configuration is applied.
    #[get = "pub"]
    pub(crate) auto_leave: bool,
}

impl Configuration {
    pub(crate) fn with_capacity(voters: usize, learners: usize) -> Self {
        Self {
            voters: JointConfig::with_capacity(voters),
            learners: HashSet::with_capacity_and_hasher(learners, DefaultHashBuilder::default()),
            learners_next: HashSet::default(),
            auto_leave: false,
        }
    }

    /// Renders the configuration as a wire `ConfState` with sorted id lists.
    pub fn to_conf_state(&self) -> ConfState {
        let sorted = |set: &HashSet<u64>| {
            let mut ids: Vec<u64> = set.iter().cloned().collect();
            ids.sort_unstable();
            ids
        };
        ConfState {
            voters: self.voters.incoming.slice(),
            voters_outgoing: self.voters.outgoing.slice(),
            learners: sorted(&self.learners),
            learners_next: sorted(&self.learners_next),
            auto_leave: self.auto_leave,
        }
    }
}

/// The per-peer progress map. Keyed by peer id; exactly the peers of the
/// current configuration are present.
pub type ProgressMap = HashMap<u64, Progress>;

impl AckedIndexer for ProgressMap {
    fn acked_index(&self, voter_id: u64) -> Option<u64> {
        self.get(&voter_id).map(|pr| pr.matched)
    }
}

/// Owns every per-peer [`Progress`], the active [`Configuration`] and the
/// ballot record of the election in flight, and aggregates them into the
/// quorum decisions the state machine acts on.
///
/// Exclusively owned by the consensus state machine; there is one logical
/// writer and no concurrent access (all concurrency lives at the driver
/// boundary).
#[derive(Clone)]
pub struct ProgressTracker {
    progress: ProgressMap,
    conf: Configuration,
    votes: HashMap<u64, bool>,

    max_inflight: usize,
    max_inflight_bytes: u64,
}

impl ProgressTracker {
    /// Creates a tracker with empty configuration.
    pub fn new(max_inflight: usize, max_inflight_bytes: u64) -> Self {
        Self::with_capacity(0, 0, max_inflight, max_inflight_bytes)
    }

    /// Creates a tracker with the given capacities reserved.
    pub fn with_capacity(
        voters: usize,
        learners: usize,
        max_inflight: usize,
        max_inflight_bytes: u64,
    ) -> Self {
        ProgressTracker {
            progress: HashMap::with_capacity_and_hasher(
                voters + learners,
                DefaultHashBuilder::default(),
            ),
            conf: Configuration::with_capacity(voters, learners),
            votes: HashMap::default(),
            max_inflight,
            max_inflight_bytes,
        }
    }

    /// Whether the configuration is a lone voter and it is `id`.
    pub fn is_singleton(&self, id: u64) -> bool {
        self.conf.voters.is_singleton() && self.conf.voters.contains(id)
    }

    /// The active configuration.
    #[inline]
    pub fn conf(&self) -> &Configuration {
        &self.conf
    }

    /// The progress of every tracked peer.
    #[inline]
    pub fn progress(&self) -> &ProgressMap {
        &self.progress
    }

    /// The progress of one peer.
    #[inline]
    pub fn get(&self, id: u64) -> Option<&Progress> {
        self.progress.get(&id)
    }

    /// Mutable progress of one peer.
    #[inline]
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Progress> {
        self.progress.get_mut(&id)
    }

    /// Iterates all peers and their progress.
    ///
    /// Iteration order is arbitrary; quorum questions go through
    /// [`ProgressTracker::has_quorum`] and friends, never through counting
    /// here, because a joint configuration has two electorates.
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&u64, &Progress)> {
        self.progress.iter()
    }

    /// Mutable variant of [`ProgressTracker::iter`].
    #[inline]
    pub fn iter_mut(&mut self) -> impl ExactSizeIterator<Item = (&u64, &mut Progress)> {
        self.progress.iter_mut()
    }

    /// The ids of all voters (both halves while joint).
    pub fn voter_ids(&self) -> HashSet<u64> {
        self.conf.voters.ids().iter().collect()
    }

    /// The ids of all learners.
    #[inline]
    pub fn learner_ids(&self) -> &HashSet<u64> {
        &self.conf.learners
    }

    /// The highest index the current quorum has durably replicated.
    ///
    /// While joint, this is the minimum of the two groups' majority medians;
    /// entries from older terms become committable only through the
    /// state machine's current-term check layered on top of this value.
    pub fn maximal_committed_index(&self) -> u64 {
        self.conf.voters.committed_index(&self.progress)
    }

    /// Records that `id` voted `granted` in the election in flight. Only the
    /// first ballot from a peer counts; re-deliveries change nothing.
    pub fn record_vote(&mut self, id: u64, granted: bool) {
        self.votes.entry(id).or_insert(granted);
    }

    /// Clears the ballot record. Called on every term change.
    pub fn reset_votes(&mut self) {
        self.votes.clear();
    }

    /// Counts the recorded ballots and classifies the election. Ballots from
    /// non-voters (a removed peer, a learner's stray response) are ignored
    /// in the counts.
    pub fn tally_votes(&self) -> (usize, usize, VoteResult) {
        let (mut granted, mut rejected) = (0, 0);
        for (id, vote) in &self.votes {
            if !self.conf.voters.contains(*id) {
                continue;
            }
            if *vote {
                granted += 1;
            } else {
                rejected += 1;
            }
        }
        let result = self
            .conf
            .voters
            .vote_result(|id| self.votes.get(&id).cloned());
        (granted, rejected, result)
    }

    /// Whether the ids in `potential_quorum` form a quorum of the current
    /// configuration. The only correct way to answer quorum questions while
    /// a joint configuration may be active.
    #[inline]
    pub fn has_quorum(&self, potential_quorum: &HashSet<u64>) -> bool {
        self.conf
            .voters
            .vote_result(|id| potential_quorum.get(&id).map(|_| true))
            == VoteResult::Won
    }

    /// Whether a quorum has been heard from since the previous sweep, from
    /// the perspective of leader `perspective_of`. Clears every peer's
    /// `recent_active` for the next sweep. Leader only.
    pub fn quorum_recently_active(&mut self, perspective_of: u64) -> bool {
        let mut active = HashSet::default();
        for (&id, pr) in self.progress.iter_mut() {
            if id == perspective_of {
                pr.recent_active = true;
                active.insert(id);
            } else if pr.recent_active {
                active.insert(id);
                pr.recent_active = false;
            }
        }
        self.has_quorum(&active)
    }

    /// Installs a configuration produced by the `Changer` along with the
    /// progress-map edits it implies. Newly tracked peers start probing at
    /// `next_idx` and count as recently active so that an immediately
    /// following check-quorum sweep cannot evict them.
    pub fn apply_conf(&mut self, conf: Configuration, changes: MapChange, next_idx: u64) {
        self.conf = conf;
        for (id, change_type) in changes {
            match change_type {
                MapChangeType::Add => {
                    let mut pr = Progress::new(next_idx, self.max_inflight, self.max_inflight_bytes);
                    pr.recent_active = true;
                    self.progress.insert(id, pr);
                }
                MapChangeType::Remove => {
                    self.progress.remove(&id);
                }
            }
        }
        let learners = &self.conf.learners;
        for (id, pr) in self.progress.iter_mut() {
            pr.is_learner = learners.contains(id);
        }
        self.assert_progress_and_configuration_consistent();
    }

    /// Drops all configuration and progress, ahead of replaying a snapshot's
    /// `ConfState`.
    pub(crate) fn clear(&mut self) {
        self.progress.clear();
        self.conf.voters.clear();
        self.conf.learners.clear();
        self.conf.learners_next.clear();
        self.conf.auto_leave = false;
    }

    fn assert_progress_and_configuration_consistent(&self) {
        debug_assert!(self
            .conf
            .voters
            .ids()
            .iter()
            .chain(self.conf.learners.iter().cloned())
            .chain(self.conf.learners_next.iter().cloned())
            .all(|id| self.progress.contains_key(&id)));
    }
}
