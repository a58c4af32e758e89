// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use crate::test_logger;
use crate::test_util::*;
use trellis_raft::prelude::*;
use trellis_raft::ProgressState;

fn testing_snap() -> Snapshot {
    new_snapshot(11, 11, vec![1, 2])
}

// Brings node 1 up as a leader whose retained log starts past what peer 2
// holds, so any probe of peer 2 must fall back to a snapshot.
fn leader_with_compacted_log() -> Interface {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1], 10, 1, new_storage(), &l);
    r.restore(testing_snap());
    r.become_candidate();
    r.become_leader();
    r.read_messages();
    r
}

fn reject_probe(r: &mut Interface) {
    let next = r.prs().get(2).unwrap().next_idx;
    let mut m = new_message(2, 1, MessageType::MsgAppendResponse, 0);
    m.term = r.term;
    m.index = next - 1;
    m.reject = true;
    m.reject_hint = 0;
    r.step(m).unwrap();
}

// A peer whose next index fell off the retained log gets a snapshot, and
// replication to it pauses until the snapshot resolves.
#[test]
fn test_lagging_peer_receives_snapshot() {
    let mut r = leader_with_compacted_log();
    r.mut_prs().get_mut(2).unwrap().recent_active = true;
    reject_probe(&mut r);

    let msgs = r.read_messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get_msg_type(), MessageType::MsgSnapshot);
    assert_eq!(msgs[0].get_snapshot().get_metadata().index, 11);

    let pr = r.prs().get(2).unwrap();
    assert_eq!(pr.state, ProgressState::Snapshot);
    assert_eq!(pr.pending_snapshot, 11);
    assert!(pr.is_paused());

    // Nothing further is sent while the snapshot is in flight.
    let m = new_message_with_entries(
        1,
        1,
        MessageType::MsgPropose,
        vec![new_entry(0, 0, SOME_DATA)],
    );
    r.step(m).unwrap();
    assert!(r.read_messages().is_empty());
}

// A snapshot a silent peer would probably not receive is not even
// generated: the send is skipped until the peer is heard from again.
#[test]
fn test_snapshot_skipped_for_inactive_peer() {
    let mut r = leader_with_compacted_log();
    {
        let pr = r.mut_prs().get_mut(2).unwrap();
        pr.next_idx = 1;
        pr.recent_active = false;
    }
    // A broadcast that would need a snapshot for peer 2 sends it nothing.
    let m = new_message_with_entries(
        1,
        1,
        MessageType::MsgPropose,
        vec![new_entry(0, 0, SOME_DATA)],
    );
    r.step(m).unwrap();
    assert!(r
        .read_messages()
        .iter()
        .all(|m| m.get_msg_type() != MessageType::MsgSnapshot));
    assert_eq!(r.prs().get(2).unwrap().state, ProgressState::Probe);
}

// The application reporting a failed transfer sends the peer back to
// probing (still paused until the next heartbeat response).
#[test]
fn test_snapshot_failure_report_returns_to_probe() {
    let mut r = leader_with_compacted_log();
    r.mut_prs().get_mut(2).unwrap().recent_active = true;
    reject_probe(&mut r);
    r.read_messages();

    let mut report = new_message(2, 1, MessageType::MsgSnapStatus, 0);
    report.reject = true;
    r.step(report).unwrap();

    let pr = r.prs().get(2).unwrap();
    assert_eq!(pr.state, ProgressState::Probe);
    assert_eq!(pr.pending_snapshot, 0);
    assert!(pr.is_paused());
}

// An acknowledgment at or past the pending snapshot index proves the
// follower's log is reconnected; streaming resumes directly.
#[test]
fn test_snapshot_ack_reconnects_replication() {
    let mut r = leader_with_compacted_log();
    r.mut_prs().get_mut(2).unwrap().recent_active = true;
    reject_probe(&mut r);
    r.read_messages();
    assert_eq!(r.prs().get(2).unwrap().state, ProgressState::Snapshot);

    let mut ack = new_message(2, 1, MessageType::MsgAppendResponse, 0);
    ack.term = r.term;
    ack.index = 11;
    r.step(ack).unwrap();

    let pr = r.prs().get(2).unwrap();
    assert_eq!(pr.state, ProgressState::Replicate);
    assert_eq!(pr.matched, 11);
    assert_eq!(pr.next_idx, 12);
}

// A follower installs a snapshot it cannot match and answers with the
// snapshot's last index.
#[test]
fn test_follower_installs_snapshot_from_message() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);

    let mut m = new_message(2, 1, MessageType::MsgSnapshot, 0);
    m.term = 2;
    m.set_snapshot(new_snapshot(11, 2, vec![1, 2]));
    r.step(m).unwrap();

    let msgs = r.read_messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get_msg_type(), MessageType::MsgAppendResponse);
    assert_eq!(msgs[0].index, 11);

    assert_eq!(r.raft_log.committed, 11);
    assert_eq!(r.raft_log.term(11).unwrap(), 2);
    assert!(r.raft_log.unstable.snapshot.is_some());
}

// A snapshot the log already covers only fast-forwards the commit index;
// matching entries are never discarded.
#[test]
fn test_snapshot_covering_log_fast_forwards_commit() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);
    r.raft_log
        .append(&(1..=5).map(|i| empty_entry(1, i)).collect::<Vec<_>>());

    assert!(!r.restore(new_snapshot(5, 1, vec![1, 2])));
    assert_eq!(r.raft_log.committed, 5);
    assert_eq!(r.raft_log.last_index(), 5, "entries survived");
}

// A snapshot behind the commit index is stale and refused.
#[test]
fn test_stale_snapshot_is_ignored() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);
    assert!(r.restore(testing_snap()));
    assert_eq!(r.raft_log.committed, 11);
    assert!(!r.restore(new_snapshot(5, 5, vec![1, 2])));
    assert_eq!(r.raft_log.committed, 11);
}

// A snapshot whose configuration does not know this node is refused; the
// node must not wipe its log on a misdirected snapshot.
#[test]
fn test_snapshot_without_self_is_ignored() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);
    assert!(!r.restore(new_snapshot(11, 11, vec![2, 3])));
    assert_eq!(r.raft_log.committed, 0);
}
