// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use std::fmt;

/// The flow-control state a leader keeps for one follower.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ProgressState {
    /// The leader does not know where the follower's log ends. At most one
    /// append is outstanding at a time; its response reveals the true end.
    #[default]
    Probe,
    /// The follower is known to accept appends; the leader streams entries
    /// optimistically, bounded by the inflight window.
    Replicate,
    /// The follower is behind the retained log and is being sent a snapshot.
    /// All replication to it is paused until the snapshot resolves.
    Snapshot,
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressState::Probe => write!(f, "StateProbe"),
            ProgressState::Replicate => write!(f, "StateReplicate"),
            ProgressState::Snapshot => write!(f, "StateSnapshot"),
        }
    }
}
