// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use crate::raft::{Raft, SoftState, StateRole};
use crate::raftpb::HardState;
use crate::storage::Storage;
use crate::tracker::ProgressTracker;

/// A point-in-time copy of a node's externally interesting state, for
/// monitoring and debugging.
#[derive(Default)]
pub struct Status {
    /// The id of this node.
    pub id: u64,
    /// The durable term/vote/commit triple.
    pub hs: HardState,
    /// The volatile role and leader view.
    pub ss: SoftState,
    /// The applied watermark.
    pub applied: u64,
    /// The per-peer progress, populated only on the leader (no one else
    /// tracks peers).
    pub progress: Option<ProgressTracker>,
}

impl Status {
    /// Captures the status of `raft`.
    pub fn new<T: Storage>(raft: &Raft<T>) -> Status {
        let mut s = Status {
            id: raft.id,
            ..Default::default()
        };
        s.hs = raft.hard_state();
        s.ss = raft.soft_state();
        s.applied = raft.raft_log.applied();
        if s.ss.raft_state == StateRole::Leader {
            s.progress = Some(raft.prs().clone());
        }
        s
    }
}
