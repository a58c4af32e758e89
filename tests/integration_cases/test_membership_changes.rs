// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use crate::test_logger;
use crate::test_util::*;
use trellis_raft::prelude::*;
use trellis_raft::raftpb::{new_conf_change_single, ConfChangeI};
use trellis_raft::StateRole;

fn single(node_id: u64, ty: ConfChangeType) -> ConfChangeV2 {
    ConfChangeV2 {
        changes: vec![new_conf_change_single(node_id, ty)],
        ..Default::default()
    }
}

fn joint(changes: Vec<(u64, ConfChangeType)>) -> ConfChangeV2 {
    ConfChangeV2 {
        changes: changes
            .into_iter()
            .map(|(id, ty)| new_conf_change_single(id, ty))
            .collect(),
        ..Default::default()
    }
}

#[test]
fn test_simple_add_remove_and_promote() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1], 10, 1, new_storage(), &l);

    let cs = r
        .apply_conf_change(&single(2, ConfChangeType::AddNode))
        .unwrap();
    assert_eq!(cs.voters, vec![1, 2]);
    assert!(r.prs().get(2).is_some());

    let cs = r
        .apply_conf_change(&single(3, ConfChangeType::AddLearnerNode))
        .unwrap();
    assert_eq!(cs.learners, vec![3]);
    assert!(r.prs().get(3).unwrap().is_learner);

    // Promoting the learner moves it between sets without a new progress.
    let cs = r
        .apply_conf_change(&single(3, ConfChangeType::AddNode))
        .unwrap();
    assert_eq!(cs.voters, vec![1, 2, 3]);
    assert!(cs.learners.is_empty());
    assert!(!r.prs().get(3).unwrap().is_learner);

    let cs = r
        .apply_conf_change(&single(2, ConfChangeType::RemoveNode))
        .unwrap();
    assert_eq!(cs.voters, vec![1, 3]);
    assert!(r.prs().get(2).is_none());
}

// A v1 conf change is equivalent to the single-step v2 change.
#[test]
fn test_v1_conf_change_applies_like_v2() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1], 10, 1, new_storage(), &l);
    let mut cc = ConfChange {
        node_id: 2,
        ..Default::default()
    };
    cc.set_change_type(ConfChangeType::AddNode);
    let cs = r.apply_conf_change(&cc.into_v2()).unwrap();
    assert_eq!(cs.voters, vec![1, 2]);
}

// A multi-member change passes through a joint configuration: both voter
// sets are live until the explicit (or automatic) leave.
#[test]
fn test_joint_consensus_enter_and_leave() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);

    let cc = joint(vec![
        (2, ConfChangeType::RemoveNode),
        (3, ConfChangeType::AddNode),
    ]);
    assert_eq!(cc.enter_joint(), Some(true));
    let cs = r.apply_conf_change(&cc).unwrap();
    assert_eq!(cs.voters, vec![1, 3]);
    assert_eq!(cs.voters_outgoing, vec![1, 2]);
    assert!(cs.auto_leave);
    // The outgoing voter is still tracked while the joint config holds.
    assert!(r.prs().get(2).is_some());

    // The empty change leaves the joint configuration.
    let cs = r.apply_conf_change(&ConfChangeV2::default()).unwrap();
    assert_eq!(cs.voters, vec![1, 3]);
    assert!(cs.voters_outgoing.is_empty());
    assert!(!cs.auto_leave);
    assert!(r.prs().get(2).is_none());
}

// While a joint configuration holds, commitment requires both electorates.
#[test]
fn test_joint_quorum_needs_both_halves() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);
    r.become_candidate();
    r.become_leader();
    // Swap 2 out for 3 and 4: incoming (1 3 4), outgoing (1 2).
    r.apply_conf_change(&joint(vec![
        (2, ConfChangeType::RemoveNode),
        (3, ConfChangeType::AddNode),
        (4, ConfChangeType::AddNode),
    ]))
    .unwrap();
    r.read_messages();

    let propose = new_message_with_entries(
        1,
        1,
        MessageType::MsgPropose,
        vec![new_entry(0, 0, SOME_DATA)],
    );
    r.step(propose).unwrap();
    r.read_messages();
    let index = r.raft_log.last_index();

    // A majority of the incoming half alone does not commit...
    for from in [3, 4] {
        let mut ack = new_message(from, 1, MessageType::MsgAppendResponse, 0);
        ack.term = r.term;
        ack.index = index;
        r.step(ack).unwrap();
        r.read_messages();
    }
    assert!(r.raft_log.committed < index);

    // ...until the outgoing half also covers the entry.
    let mut ack = new_message(2, 1, MessageType::MsgAppendResponse, 0);
    ack.term = r.term;
    ack.index = index;
    r.step(ack).unwrap();
    assert_eq!(r.raft_log.committed, index);
}

// Only one conf change may be in flight: a second proposal is demoted to an
// empty normal entry while the first is unapplied.
#[test]
fn test_second_conf_change_demoted_while_pending() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1], 10, 1, new_storage(), &l);
    r.step(new_message(1, 1, MessageType::MsgHup, 0)).unwrap();
    assert_eq!(r.state, StateRole::Leader);

    let mut conf_entry = Entry::default();
    conf_entry.set_entry_type(EntryType::EntryConfChange);
    let m =
        new_message_with_entries(1, 1, MessageType::MsgPropose, vec![conf_entry.clone()]);
    r.step(m).unwrap();
    assert_eq!(r.pending_conf_index, 2);
    assert_eq!(
        r.raft_log.entries(2, None).unwrap()[0].get_entry_type(),
        EntryType::EntryConfChange
    );

    // The second one is silently flattened into a no-op.
    let m = new_message_with_entries(1, 1, MessageType::MsgPropose, vec![conf_entry]);
    r.step(m).unwrap();
    let e = &r.raft_log.entries(3, None).unwrap()[0];
    assert_eq!(e.get_entry_type(), EntryType::EntryNormal);
    assert!(e.data.is_empty());
    assert_eq!(r.pending_conf_index, 2, "unchanged by the demoted proposal");
}

// Removing the node a leadership transfer is aimed at abandons the
// transfer.
#[test]
fn test_removing_transfer_target_aborts_transfer() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2, 3], 10, 1, new_storage(), &l);
    r.become_candidate();
    r.become_leader();
    // Keep 2 behind so the transfer stays pending.
    let m = new_message_with_entries(
        1,
        1,
        MessageType::MsgPropose,
        vec![new_entry(0, 0, SOME_DATA)],
    );
    r.step(m).unwrap();
    r.step(new_message(2, 1, MessageType::MsgTransferLeader, 0))
        .unwrap();
    assert_eq!(r.lead_transferee, Some(2));

    r.apply_conf_change(&single(2, ConfChangeType::RemoveNode))
        .unwrap();
    assert_eq!(r.lead_transferee, None);
}

// Removing the last voter is an invariant violation, not a refusal.
#[test]
#[should_panic]
fn test_removing_last_voter_is_fatal() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1], 10, 1, new_storage(), &l);
    let _ = r.apply_conf_change(&single(1, ConfChangeType::RemoveNode));
}

// Shrinking the quorum can commit entries without any new acknowledgment.
#[test]
fn test_removal_can_advance_commit() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2, 3], 10, 1, new_storage(), &l);
    r.become_candidate();
    r.become_leader();
    let m = new_message_with_entries(
        1,
        1,
        MessageType::MsgPropose,
        vec![new_entry(0, 0, SOME_DATA)],
    );
    r.step(m).unwrap();
    r.read_messages();

    // Node 2 acknowledges only the no-op; the proposal at index 2 stays
    // uncommitted while silent node 3 is still a voter.
    let mut ack = new_message(2, 1, MessageType::MsgAppendResponse, 0);
    ack.term = r.term;
    ack.index = 1;
    r.step(ack).unwrap();
    r.read_messages();
    assert_eq!(r.raft_log.committed, 1);

    // Dropping silent node 3 makes {1, 2} the whole electorate; the
    // recomputed quorum still stops at what 2 acknowledged.
    r.apply_conf_change(&single(3, ConfChangeType::RemoveNode))
        .unwrap();
    assert_eq!(r.raft_log.committed, 1);

    // And 2's next acknowledgment commits the tail.
    let mut ack = new_message(2, 1, MessageType::MsgAppendResponse, 0);
    ack.term = r.term;
    ack.index = 2;
    r.step(ack).unwrap();
    assert_eq!(r.raft_log.committed, 2);
}
