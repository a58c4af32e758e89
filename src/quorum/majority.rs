// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use std::ops::{Deref, DerefMut};

use super::{AckedIndexer, VoteResult};
use crate::{DefaultHashBuilder, HashSet};

/// A set of ids that decides by simple majority.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Configuration {
    pub(crate) voters: HashSet<u64>,
}

impl Configuration {
    /// Creates a configuration from the given voter set.
    pub fn new(voters: HashSet<u64>) -> Configuration {
        Configuration { voters }
    }

    /// Creates an empty configuration with the given capacity reserved.
    pub fn with_capacity(cap: usize) -> Configuration {
        Configuration {
            voters: HashSet::with_capacity_and_hasher(cap, DefaultHashBuilder::default()),
        }
    }

    /// The voter ids as a sorted vector.
    pub fn slice(&self) -> Vec<u64> {
        let mut voters: Vec<u64> = self.voters.iter().cloned().collect();
        voters.sort_unstable();
        voters
    }

    /// The highest index acknowledged by a majority of this configuration.
    ///
    /// A voter with no acknowledged index counts as zero, so e.g. matched
    /// indexes `[2, 2, 2, 4, 5]` commit 2. An empty configuration commits
    /// everything (`u64::MAX`); that convention lets the vacant half of a
    /// joint configuration defer entirely to the populated half.
    pub fn committed_index(&self, l: &impl AckedIndexer) -> u64 {
        if self.voters.is_empty() {
            return u64::MAX;
        }

        let mut matched: Vec<u64> = self
            .voters
            .iter()
            .map(|v| l.acked_index(*v).unwrap_or_default())
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched[crate::majority(matched.len()) - 1]
    }

    /// Classifies a partial vote over this configuration: `Won` once a
    /// majority said yes, `Lost` once a majority said no, `Pending` while the
    /// missing ballots could still swing it either way.
    ///
    /// An empty configuration wins by convention, for the same joint-quorum
    /// reason as in `committed_index`.
    pub fn vote_result(&self, check: impl Fn(u64) -> Option<bool>) -> VoteResult {
        if self.voters.is_empty() {
            return VoteResult::Won;
        }

        let (mut yes, mut missing) = (0, 0);
        for v in &self.voters {
            match check(*v) {
                Some(true) => yes += 1,
                None => missing += 1,
                _ => (),
            }
        }
        let q = crate::majority(self.voters.len());
        if yes >= q {
            VoteResult::Won
        } else if yes + missing >= q {
            VoteResult::Pending
        } else {
            VoteResult::Lost
        }
    }
}

impl Deref for Configuration {
    type Target = HashSet<u64>;

    #[inline]
    fn deref(&self) -> &HashSet<u64> {
        &self.voters
    }
}

impl DerefMut for Configuration {
    #[inline]
    fn deref_mut(&mut self) -> &mut HashSet<u64> {
        &mut self.voters
    }
}
