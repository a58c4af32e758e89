// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

//! Quorum arithmetic over voter sets, independent of any per-peer state.

pub mod joint;
pub mod majority;

use std::fmt::{self, Debug, Display, Formatter};

use crate::HashMap;

/// The outcome of a vote as far as it can be decided.
#[derive(Clone, Copy, PartialEq)]
pub enum VoteResult {
    /// Neither "yes" nor "no" has reached quorum yet; the decision depends on
    /// votes still outstanding.
    Pending,
    /// A quorum has voted "no".
    Lost,
    /// A quorum has voted "yes".
    Won,
}

impl Display for VoteResult {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VoteResult::Won => write!(f, "VoteWon"),
            VoteResult::Lost => write!(f, "VoteLost"),
            VoteResult::Pending => write!(f, "VotePending"),
        }
    }
}

impl Debug for VoteResult {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Supplies, for each voter id, the highest log index that voter has
/// acknowledged as durable. The quorum computations are written against this
/// trait so they can run over the live progress map or over a plain map in
/// tests.
pub trait AckedIndexer {
    /// The acknowledged index of `voter_id`, if one is tracked.
    fn acked_index(&self, voter_id: u64) -> Option<u64>;
}

/// A plain map from voter id to acknowledged index.
pub type AckIndexer = HashMap<u64, u64>;

impl AckedIndexer for AckIndexer {
    #[inline]
    fn acked_index(&self, voter: u64) -> Option<u64> {
        self.get(&voter).cloned()
    }
}
