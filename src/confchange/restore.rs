// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use super::changer::Changer;
use crate::raftpb::{new_conf_change_single, ConfChangeSingle, ConfChangeType, ConfState};
use crate::tracker::ProgressTracker;
use crate::Result;

/// Expresses `cs` as two change sequences: one that builds the configuration
/// that will be outgoing, and one that, applied on top of it, produces `cs`
/// itself (entering the joint state if `cs` is joint).
fn to_conf_change_single(cs: &ConfState) -> (Vec<ConfChangeSingle>, Vec<ConfChangeSingle>) {
    // Working through an example:
    //   voters=(1 2 3) learners=(5) outgoing=(1 2 4 6) learners_next=(4)
    //
    // The pre-joint configuration had voters (1 2 4 6); (1 2) stayed on,
    // (4 6) are leaving, and 4 will turn learner when the joint state ends.
    //
    // outgoing = add 1; add 2; add 4; add 6
    // incoming = remove 1; remove 2; remove 4; remove 6
    //            add 1; add 2; add 3
    //            add-learner 5
    //            add-learner 4
    //
    // Replaying `outgoing` over an empty configuration yields quorum
    // (1 2 4 6); entering joint with `incoming` then yields
    //   (1 2 3)&&(1 2 4 6) learners=(5) learners_next=(4)
    let mut incoming = Vec::new();
    let mut outgoing = Vec::new();
    for id in &cs.voters_outgoing {
        outgoing.push(new_conf_change_single(*id, ConfChangeType::AddNode));
    }

    // Unwind the outgoing voters first so the additions below start from a
    // clean incoming set.
    for id in &cs.voters_outgoing {
        incoming.push(new_conf_change_single(*id, ConfChangeType::RemoveNode));
    }
    for id in &cs.voters {
        incoming.push(new_conf_change_single(*id, ConfChangeType::AddNode));
    }
    for id in &cs.learners {
        incoming.push(new_conf_change_single(*id, ConfChangeType::AddLearnerNode));
    }
    for id in &cs.learners_next {
        incoming.push(new_conf_change_single(*id, ConfChangeType::AddLearnerNode));
    }
    (outgoing, incoming)
}

/// Replays `cs` into `tracker`, which must hold an empty configuration.
/// Progress for peers created along the way starts at `next_idx`.
pub fn restore(tracker: &mut ProgressTracker, next_idx: u64, cs: &ConfState) -> Result<()> {
    let (outgoing, incoming) = to_conf_change_single(cs);
    if outgoing.is_empty() {
        for i in incoming {
            let (cfg, changes) = Changer::new(tracker).simple(&[i])?;
            tracker.apply_conf(cfg, changes, next_idx);
        }
    } else {
        for cc in outgoing {
            let (cfg, changes) = Changer::new(tracker).simple(&[cc])?;
            tracker.apply_conf(cfg, changes, next_idx);
        }
        let (cfg, changes) = Changer::new(tracker).enter_joint(cs.auto_leave, &incoming)?;
        tracker.apply_conf(cfg, changes, next_idx);
    }
    Ok(())
}
