// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use crate::test_logger;
use crate::test_util::*;
use trellis_raft::prelude::*;
use trellis_raft::{Error, StateRole};

// A fresh three-node group elects the first campaigner: term 1, a log of
// exactly the new leader's no-op entry.
#[test]
fn test_leader_election() {
    let l = test_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);

    let leader = &nt.peers[&1];
    assert_eq!(leader.state, StateRole::Leader);
    assert_eq!(leader.term, 1);
    assert_eq!(leader.raft_log.last_index(), 1);
    assert_eq!(
        leader.raft_log.entries(1, None).unwrap(),
        vec![empty_entry(1, 1)]
    );

    for id in 1..=3u64 {
        assert_eq!(nt.peers[&id].leader_id, 1, "peer {}", id);
        assert_eq!(nt.peers[&id].term, 1, "peer {}", id);
    }
}

#[test]
fn test_leader_election_single_node() {
    let l = test_logger();
    let mut nt = Network::new(vec![None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    assert_eq!(nt.peers[&1].state, StateRole::Leader);
    assert_eq!(nt.peers[&1].raft_log.committed, 1);
}

// A committed proposal reaches every peer with the proposed bytes intact.
#[test]
fn test_log_replication() {
    let l = test_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    nt.send(vec![new_message(1, 1, MessageType::MsgPropose, 1)]);

    for id in 1..=3u64 {
        let p = nt.peers.get_mut(&id).unwrap();
        assert_eq!(p.raft_log.committed, 2, "peer {}", id);
        let payloads: Vec<_> = p
            .raft_log
            .next_entries()
            .unwrap()
            .into_iter()
            .filter(|e| !e.data.is_empty())
            .collect();
        assert_eq!(payloads.len(), 1, "peer {}", id);
        assert_eq!(payloads[0].data, b"somedata".to_vec(), "peer {}", id);
        assert_eq!(payloads[0].index, 2, "peer {}", id);
    }
}

// A proposal stepped into a follower is forwarded to the leader and commits
// cluster-wide.
#[test]
fn test_proposal_forwarded_by_follower() {
    let l = test_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    nt.send(vec![new_message(2, 2, MessageType::MsgPropose, 1)]);

    for id in 1..=3u64 {
        assert_eq!(nt.peers[&id].raft_log.committed, 2, "peer {}", id);
    }
}

#[test]
fn test_proposal_dropped_without_leader() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2, 3], 10, 1, new_storage(), &l);
    assert_eq!(
        r.step(new_message(1, 1, MessageType::MsgPropose, 1)),
        Err(Error::ProposalDropped)
    );

    r.become_candidate();
    assert_eq!(
        r.step(new_message(1, 1, MessageType::MsgPropose, 1)),
        Err(Error::ProposalDropped)
    );
}

// The conflict-repair path: a follower holding a stale entry at index 2
// accepts an append that matches at index 1, truncates the stale suffix and
// appends the replacement, committing min(leader_commit, last_new_index).
#[test]
fn test_follower_repairs_conflicting_suffix() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);
    r.raft_log.append(&[empty_entry(1, 1), empty_entry(1, 2)]);

    let mut m = new_message_with_entries(2, 1, MessageType::MsgAppend, vec![empty_entry(2, 2)]);
    m.term = 2;
    m.log_term = 1;
    m.index = 1;
    m.commit = 3;
    r.step(m).unwrap();

    let msgs = r.read_messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].get_msg_type(), MessageType::MsgAppendResponse);
    assert!(!msgs[0].reject, "matching append must not be rejected");
    assert_eq!(msgs[0].index, 2);

    assert_eq!(r.raft_log.last_index(), 2);
    assert_eq!(r.raft_log.term(2).unwrap(), 2);
    assert_eq!(r.raft_log.committed, 2);
}

// A rejection carries the follower's real last index so the leader jumps
// next straight to the conflict point instead of walking back one at a time.
#[test]
fn test_append_rejection_carries_hint() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);
    r.raft_log.append(&[empty_entry(1, 1)]);

    // The sender assumes a much longer log.
    let mut m = new_message_with_entries(2, 1, MessageType::MsgAppend, vec![empty_entry(2, 8)]);
    m.term = 2;
    m.log_term = 2;
    m.index = 7;
    r.step(m).unwrap();

    let msgs = r.read_messages();
    assert_eq!(msgs.len(), 1);
    assert!(msgs[0].reject);
    assert_eq!(msgs[0].index, 7);
    assert_eq!(msgs[0].reject_hint, 1);
}

// Election safety: one ballot per term, and only for up-to-date logs.
#[test]
fn test_vote_granted_at_most_once_per_term() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2, 3], 10, 1, new_storage(), &l);

    let mut m = new_message(2, 1, MessageType::MsgRequestVote, 0);
    m.term = 2;
    m.log_term = 0;
    m.index = 0;
    r.step(m).unwrap();
    let msgs = r.read_messages();
    assert!(!msgs[0].reject);
    assert_eq!(r.vote, 2);

    // A competing candidate in the same term is turned away.
    let mut m = new_message(3, 1, MessageType::MsgRequestVote, 0);
    m.term = 2;
    m.log_term = 0;
    m.index = 0;
    r.step(m).unwrap();
    let msgs = r.read_messages();
    assert!(msgs[0].reject);
    assert_eq!(r.vote, 2);
}

#[test]
fn test_vote_requires_up_to_date_log() {
    let l = test_logger();
    // Voter's log ends at (term 2, index 2).
    // (candidate log_term, candidate index, granted)
    let tests = vec![
        (1, 1, false),
        (1, 2, false),
        (2, 1, false),
        // Ties are up-to-date: two identical logs may vote for each other.
        (2, 2, true),
        (2, 3, true),
        (3, 1, true),
    ];
    for (i, (log_term, index, granted)) in tests.into_iter().enumerate() {
        let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);
        r.raft_log.append(&[empty_entry(1, 1), empty_entry(2, 2)]);

        let mut m = new_message(2, 1, MessageType::MsgRequestVote, 0);
        m.term = 3;
        m.log_term = log_term;
        m.index = index;
        r.step(m).unwrap();
        let msgs = r.read_messages();
        assert_eq!(msgs[0].reject, !granted, "#{}", i);
    }
}

// A message from a dead term is dropped silently (no response, no state
// change) under the default configuration.
#[test]
fn test_stale_term_message_ignored() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);
    r.become_follower(2, 2);

    let mut m = new_message(2, 1, MessageType::MsgAppend, 0);
    m.term = 1;
    r.step(m).unwrap();
    assert!(r.read_messages().is_empty());
    assert_eq!(r.term, 2);
}

// A stale vote request is answered with a rejection carrying the real term,
// so the straggler converges instead of campaigning into the void.
#[test]
fn test_stale_vote_request_gets_rejection() {
    let l = test_logger();
    for msg_type in [
        MessageType::MsgRequestVote,
        MessageType::MsgRequestPreVote,
    ] {
        let mut r = new_test_raft(1, vec![1, 2], 10, 1, new_storage(), &l);
        r.become_follower(5, 2);

        let mut m = new_message(2, 1, msg_type, 0);
        m.term = 3;
        r.step(m).unwrap();

        let msgs = r.read_messages();
        assert_eq!(msgs.len(), 1, "{:?}", msg_type);
        assert!(msgs[0].reject, "{:?}", msg_type);
        assert_eq!(msgs[0].term, 5, "{:?}", msg_type);
    }
}

// Re-delivered acknowledgments change nothing: progress indexes are
// monotonic and the commit index is recomputed to the same value.
#[test]
fn test_duplicate_append_response_is_idempotent() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2, 3], 10, 1, new_storage(), &l);
    r.become_candidate();
    r.become_leader();
    r.read_messages();

    let mut ack = new_message(2, 1, MessageType::MsgAppendResponse, 0);
    ack.term = r.term;
    ack.index = 1;
    r.step(ack.clone()).unwrap();
    r.read_messages();

    let committed = r.raft_log.committed;
    let (matched, next_idx) = {
        let pr = r.prs().get(2).unwrap();
        (pr.matched, pr.next_idx)
    };
    assert_eq!(committed, 1);

    r.step(ack).unwrap();
    assert!(r.read_messages().is_empty(), "duplicate ack must not send");
    assert_eq!(r.raft_log.committed, committed);
    let pr = r.prs().get(2).unwrap();
    assert_eq!((pr.matched, pr.next_idx), (matched, next_idx));
}

#[test]
fn test_duplicate_heartbeat_response_is_idempotent() {
    let l = test_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    nt.send(vec![new_message(1, 1, MessageType::MsgPropose, 1)]);

    // All peers caught up; a repeated heartbeat response sends nothing new.
    let term = nt.peers[&1].term;
    let mut resp = new_message(2, 1, MessageType::MsgHeartbeatResponse, 0);
    resp.term = term;
    resp.commit = nt.peers[&2].raft_log.committed;

    let leader = nt.peers.get_mut(&1).unwrap();
    leader.step(resp.clone()).unwrap();
    assert!(leader.read_messages().is_empty());
    let committed = leader.raft_log.committed;
    leader.step(resp).unwrap();
    assert!(leader.read_messages().is_empty());
    assert_eq!(leader.raft_log.committed, committed);
}

// With check-quorum on, a leader that stops hearing from a quorum abdicates
// within an election timeout.
#[test]
fn test_check_quorum_leader_steps_down() {
    let l = test_logger();
    let mut config = new_test_config(1, 10, 1);
    config.check_quorum = true;
    let storage = new_storage();
    storage.initialize_with_conf_state((vec![1, 2, 3], vec![]));
    let mut r = new_test_raft_with_config(&config, storage, &l);

    r.become_candidate();
    r.become_leader();
    assert_eq!(r.state, StateRole::Leader);

    for _ in 0..r.election_timeout() {
        r.tick();
    }
    assert_eq!(r.state, StateRole::Follower);
}

// Pre-vote non-disruption: a node campaigning from behind a partition
// neither advances its own term nor deposes the working leader.
#[test]
fn test_pre_vote_does_not_disrupt_leader() {
    let l = test_logger();
    let mut nt = Network::new_with_config(vec![None, None, None], true, &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    assert_eq!(nt.peers[&1].state, StateRole::Leader);

    // Node 3 misses a commit behind a partition.
    nt.isolate(3);
    nt.send(vec![new_message(1, 1, MessageType::MsgPropose, 1)]);

    // Its campaign goes nowhere and, crucially, does not bump its term.
    let p3 = nt.peers.get_mut(&3).unwrap();
    p3.step(new_message(3, 3, MessageType::MsgHup, 0)).unwrap();
    p3.read_messages();
    assert_eq!(p3.state, StateRole::PreCandidate);
    assert_eq!(p3.term, 1);

    // Healed, its pre-vote is refused on log freshness and it falls back in
    // line; the leader never noticed.
    nt.recover();
    nt.send(vec![new_message(3, 3, MessageType::MsgHup, 0)]);
    assert_eq!(nt.peers[&3].state, StateRole::Follower);
    assert_eq!(nt.peers[&1].state, StateRole::Leader);
    assert_eq!(nt.peers[&1].term, 1);
}

// An up-to-date transfer target receives TimeoutNow at once and takes over.
#[test]
fn test_leader_transfer_to_up_to_date_node() {
    let l = test_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);

    nt.send(vec![new_message(3, 1, MessageType::MsgTransferLeader, 0)]);
    assert_eq!(nt.peers[&3].state, StateRole::Leader);
    assert_eq!(nt.peers[&1].state, StateRole::Follower);
    assert_eq!(nt.peers[&1].leader_id, 3);
}

// A lagging transfer target is caught up first, then ordered to campaign.
#[test]
fn test_leader_transfer_after_catch_up() {
    let l = test_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);

    nt.isolate(3);
    nt.send(vec![new_message(1, 1, MessageType::MsgPropose, 1)]);
    assert!(nt.peers[&3].raft_log.last_index() < nt.peers[&1].raft_log.last_index());

    nt.recover();
    nt.send(vec![new_message(3, 1, MessageType::MsgTransferLeader, 0)]);
    assert_eq!(nt.peers[&3].state, StateRole::Leader);
    assert_eq!(nt.peers[&1].state, StateRole::Follower);
    // The missed entry, then the new leader's no-op on top.
    assert_eq!(nt.peers[&3].raft_log.last_index(), 3);
}

// While a transfer is pending the leader refuses proposals; if the target
// never takes over, the transfer is abandoned after an election timeout.
#[test]
fn test_leader_transfer_timeout_aborts() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2, 3], 10, 1, new_storage(), &l);
    r.become_candidate();
    r.become_leader();
    // Propose without any acknowledgments so peer 2 stays behind.
    r.step(new_message(1, 1, MessageType::MsgPropose, 1))
        .unwrap();
    r.read_messages();

    r.step(new_message(2, 1, MessageType::MsgTransferLeader, 0))
        .unwrap();
    assert_eq!(r.lead_transferee, Some(2));
    assert_eq!(
        r.step(new_message(1, 1, MessageType::MsgPropose, 1)),
        Err(Error::ProposalDropped)
    );

    // A second transfer to a different node supersedes the first.
    r.step(new_message(3, 1, MessageType::MsgTransferLeader, 0))
        .unwrap();
    assert_eq!(r.lead_transferee, Some(3));

    for _ in 0..r.election_timeout() {
        r.tick();
    }
    assert_eq!(r.lead_transferee, None);
    assert_eq!(r.state, StateRole::Leader);
    assert!(r
        .step(new_message(1, 1, MessageType::MsgPropose, 1))
        .is_ok());
}

// ReadIndex is refused until the leader commits in its own term; after that
// a heartbeat round-trip to a quorum releases exactly one read state at the
// recorded commit index.
#[test]
fn test_read_index_requires_commit_in_own_term() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1, 2, 3], 10, 1, new_storage(), &l);
    r.become_candidate();
    r.become_leader();
    r.read_messages();

    let ctx = b"ctx1".to_vec();
    let req = new_message_with_entries(
        1,
        1,
        MessageType::MsgReadIndex,
        vec![new_entry(0, 0, Some("ctx1"))],
    );

    // The term's no-op is not committed yet: no read states appear.
    r.step(req.clone()).unwrap();
    assert!(r.read_states.is_empty());
    assert_eq!(r.read_messages().len(), 0);

    // Commit the no-op.
    let mut ack = new_message(2, 1, MessageType::MsgAppendResponse, 0);
    ack.term = r.term;
    ack.index = 1;
    r.step(ack).unwrap();
    assert_eq!(r.raft_log.committed, 1);
    r.read_messages();

    // Now the request fans out as a heartbeat carrying the context.
    r.step(req).unwrap();
    let msgs = r.read_messages();
    let heartbeats: Vec<_> = msgs
        .iter()
        .filter(|m| m.get_msg_type() == MessageType::MsgHeartbeat)
        .collect();
    assert_eq!(heartbeats.len(), 2);
    assert!(heartbeats.iter().all(|m| m.context == ctx));

    // One response completes the quorum (leader plus one).
    let mut resp = new_message(2, 1, MessageType::MsgHeartbeatResponse, 0);
    resp.term = r.term;
    resp.context = ctx.clone();
    r.step(resp).unwrap();

    assert_eq!(r.read_states.len(), 1);
    assert_eq!(r.read_states[0].index, 1);
    assert_eq!(r.read_states[0].request_ctx, ctx);
}

// A learner replicates and votes but never campaigns, whoever asks.
#[test]
fn test_learner_votes_but_never_campaigns() {
    let l = test_logger();
    let mut r = new_test_learner_raft(2, vec![1], vec![2], 10, 1, new_storage(), &l);
    assert!(!r.promotable());

    r.step(new_message(2, 2, MessageType::MsgHup, 0)).unwrap();
    assert_eq!(r.state, StateRole::Follower);

    let mut m = new_message(1, 2, MessageType::MsgTimeoutNow, 0);
    m.term = 1;
    r.step(m).unwrap();
    assert_eq!(r.state, StateRole::Follower);

    // It still grants votes.
    let mut m = new_message(1, 2, MessageType::MsgRequestVote, 0);
    m.term = 2;
    m.log_term = 0;
    m.index = 0;
    r.step(m).unwrap();
    let msgs = r.read_messages();
    assert!(!msgs[0].reject);
}

// Cutting one leader-follower link does not stop the group: the remaining
// quorum commits, and only the cut-off peer lags.
#[test]
fn test_partial_partition_still_commits() {
    let l = test_logger();
    let mut nt = Network::new(vec![None, None, None], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);

    nt.cut(1, 2);
    nt.send(vec![new_message(1, 1, MessageType::MsgPropose, 1)]);

    assert_eq!(nt.peers[&1].raft_log.committed, 2);
    assert_eq!(nt.peers[&3].raft_log.committed, 2);
    assert_eq!(nt.peers[&2].raft_log.committed, 1, "cut off from the leader");
}

// A quorum carries the group past one silent peer: two of three suffice to
// elect and to commit.
#[test]
fn test_quorum_commit_with_unresponsive_peer() {
    let l = test_logger();
    let mut nt = Network::new(vec![None, None, NOP_STEPPER], &l);
    nt.send(vec![new_message(1, 1, MessageType::MsgHup, 0)]);
    nt.send(vec![new_message(1, 1, MessageType::MsgPropose, 1)]);

    assert_eq!(nt.peers[&1].state, StateRole::Leader);
    assert_eq!(nt.peers[&1].raft_log.committed, 2);
    assert_eq!(nt.peers[&2].raft_log.committed, 2);
}

// Campaigning is deferred while a conf-change entry sits committed but
// unapplied, so a new leader cannot race an half-applied membership.
#[test]
fn test_campaign_blocked_by_pending_conf_entry() {
    let l = test_logger();
    let mut r = new_test_raft(1, vec![1], 10, 1, new_storage(), &l);
    // A committed-but-unapplied conf change.
    let mut e = Entry::default();
    e.set_entry_type(EntryType::EntryConfChange);
    e.index = 1;
    e.term = 1;
    r.raft_log.append(&[e]);
    r.raft_log.commit_to(1);

    r.step(new_message(1, 1, MessageType::MsgHup, 0)).unwrap();
    assert_eq!(r.state, StateRole::Follower, "campaign must be deferred");
}
