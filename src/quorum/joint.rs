// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use std::cmp;

use super::{AckedIndexer, VoteResult};
use crate::util::Union;
use crate::HashSet;
use crate::MajorityConfig;

/// Two (possibly overlapping) majority configurations that must both agree.
///
/// Outside a membership transition `outgoing` is empty and the joint
/// configuration degenerates to its incoming majority.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Configuration {
    pub(crate) incoming: MajorityConfig,
    pub(crate) outgoing: MajorityConfig,
}

impl Configuration {
    /// Creates a non-joint configuration from the given voter set.
    pub fn new(voters: HashSet<u64>) -> Configuration {
        Configuration {
            incoming: MajorityConfig::new(voters),
            outgoing: MajorityConfig::default(),
        }
    }

    /// Creates an empty configuration with the given capacity reserved.
    pub fn with_capacity(cap: usize) -> Configuration {
        Configuration {
            incoming: MajorityConfig::with_capacity(cap),
            outgoing: MajorityConfig::default(),
        }
    }

    /// The highest index committed by the joint quorum: an index is jointly
    /// committed only when each constituent majority has replicated it, so
    /// this is the minimum of the two per-group medians.
    pub fn committed_index(&self, l: &impl AckedIndexer) -> u64 {
        cmp::min(self.incoming.committed_index(l), self.outgoing.committed_index(l))
    }

    /// The joint outcome of a vote: won only if both majorities won, lost as
    /// soon as either lost, pending otherwise.
    pub fn vote_result(&self, check: impl Fn(u64) -> Option<bool>) -> VoteResult {
        let i = self.incoming.vote_result(&check);
        let o = self.outgoing.vote_result(check);
        match (i, o) {
            (VoteResult::Won, VoteResult::Won) => VoteResult::Won,
            (VoteResult::Lost, _) | (_, VoteResult::Lost) => VoteResult::Lost,
            _ => VoteResult::Pending,
        }
    }

    /// Clears all ids.
    pub fn clear(&mut self) {
        self.incoming.clear();
        self.outgoing.clear();
    }

    /// Whether the configuration consists of exactly one voter and is not in
    /// a transition.
    pub fn is_singleton(&self) -> bool {
        self.outgoing.voters.is_empty() && self.incoming.voters.len() == 1
    }

    /// A union view over the ids of both halves, without cloning.
    pub fn ids(&self) -> Union<'_> {
        Union::new(&self.incoming.voters, &self.outgoing.voters)
    }

    /// Whether `id` is a voter in either half.
    #[inline]
    pub fn contains(&self, id: u64) -> bool {
        self.incoming.voters.contains(&id) || self.outgoing.voters.contains(&id)
    }
}
