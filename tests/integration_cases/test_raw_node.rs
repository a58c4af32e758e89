// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use crate::test_logger;
use crate::test_util::*;
use prost::Message as ProstMsg;
use trellis_raft::prelude::*;
use trellis_raft::raftpb::{new_conf_change_single, ConfChangeI};
use trellis_raft::storage::MemStorage;
use trellis_raft::Error;

fn new_raw_node(id: u64, voters: Vec<u64>, l: &slog::Logger) -> (RawNode<MemStorage>, MemStorage) {
    let storage = MemStorage::new_with_conf_state((voters, vec![]));
    let config = new_test_config(id, 10, 1);
    let node = RawNode::new(&config, storage.clone(), l).unwrap();
    (node, storage)
}

// Runs one full Ready turn: persist, apply conf changes, advance. Returns
// the conf states applied along the way.
fn drive_ready(node: &mut RawNode<MemStorage>, storage: &MemStorage) -> Vec<ConfState> {
    let mut applied = Vec::new();
    let rd = node.ready();
    storage.wl().append(rd.entries()).unwrap();
    for e in rd.committed_entries.clone().unwrap_or_default() {
        if e.get_entry_type() == EntryType::EntryConfChangeV2 {
            let cc = ConfChangeV2::decode(e.data.as_slice()).unwrap();
            applied.push(node.apply_conf_change(&cc).unwrap());
        } else if e.get_entry_type() == EntryType::EntryConfChange {
            let cc = ConfChange::decode(e.data.as_slice()).unwrap();
            applied.push(node.apply_conf_change(&cc).unwrap());
        }
    }
    node.advance(rd);
    applied
}

#[test]
fn test_raw_node_ready_cycle_single_node() {
    let l = test_logger();
    let (mut node, storage) = new_raw_node(1, vec![1], &l);

    assert!(!node.has_ready());
    node.campaign().unwrap();
    assert!(node.has_ready());

    let rd = node.ready();
    assert!(rd.must_sync());
    assert!(rd.ss().is_some());
    assert_eq!(rd.hs().unwrap().commit, 1);
    assert_eq!(rd.entries(), &[empty_entry(1, 1)][..]);
    assert_eq!(rd.committed_entries.as_ref().unwrap().len(), 1);
    storage.wl().append(rd.entries()).unwrap();
    node.advance(rd);
    assert!(!node.has_ready());

    node.propose(vec![], b"somedata".to_vec()).unwrap();
    let rd = node.ready();
    assert_eq!(rd.entries().len(), 1);
    assert_eq!(rd.entries()[0].data, b"somedata".to_vec());
    let committed = rd.committed_entries.clone().unwrap();
    assert_eq!(committed.last().unwrap().data, b"somedata".to_vec());
    storage.wl().append(rd.entries()).unwrap();
    node.advance(rd);
    assert_eq!(node.raft.raft_log.applied(), 2);
}

#[test]
fn test_raw_node_rejects_misrouted_messages() {
    let l = test_logger();
    let (mut node, _storage) = new_raw_node(1, vec![1], &l);

    // Local triggers must not arrive over the wire.
    assert_eq!(
        node.step(new_message(1, 1, MessageType::MsgHup, 0)),
        Err(Error::StepLocalMsg)
    );
    // A response from a peer nobody tracks is unattributable.
    let mut m = new_message(9, 1, MessageType::MsgAppendResponse, 0);
    m.term = 1;
    assert_eq!(node.step(m), Err(Error::StepPeerNotFound));
}

// The uncommitted-size ceiling refuses proposals synchronously and releases
// budget as entries commit and apply.
#[test]
fn test_raw_node_proposal_admission_by_uncommitted_size() {
    let l = test_logger();
    let storage = MemStorage::new_with_conf_state((vec![1], vec![]));
    let mut config = new_test_config(1, 10, 1);
    config.max_uncommitted_size = 1024;
    let mut node = RawNode::new(&config, storage.clone(), &l).unwrap();
    node.campaign().unwrap();
    drive_ready(&mut node, &storage);

    node.propose(vec![], vec![b'x'; 600]).unwrap();
    assert_eq!(
        node.propose(vec![], vec![b'y'; 600]),
        Err(Error::ProposalDropped)
    );

    // Committing (and applying) the first proposal frees the budget.
    drive_ready(&mut node, &storage);
    node.propose(vec![], vec![b'y'; 600]).unwrap();
}

#[test]
fn test_raw_node_read_index_on_singleton() {
    let l = test_logger();
    let (mut node, storage) = new_raw_node(1, vec![1], &l);
    node.campaign().unwrap();
    drive_ready(&mut node, &storage);

    node.read_index(b"query-7".to_vec());
    let rd = node.ready();
    assert_eq!(rd.read_states().len(), 1);
    assert_eq!(rd.read_states()[0].request_ctx, b"query-7".to_vec());
    assert_eq!(rd.read_states()[0].index, node.raft.raft_log.committed);
    node.advance(rd);
    assert_eq!(node.raft.ready_read_count(), 0);
}

// A joint change proposed with auto-leave runs the whole arc on its own:
// enter the joint configuration when applied, then the automatically
// proposed empty change leaves it.
#[test]
fn test_raw_node_auto_leaves_joint_config() {
    let l = test_logger();
    let (mut node, storage) = new_raw_node(1, vec![1], &l);
    node.campaign().unwrap();
    drive_ready(&mut node, &storage);

    let cc = ConfChangeV2 {
        changes: vec![
            new_conf_change_single(2, ConfChangeType::AddLearnerNode),
            new_conf_change_single(3, ConfChangeType::AddLearnerNode),
        ],
        ..Default::default()
    };
    assert_eq!(cc.enter_joint(), Some(true));
    node.propose_conf_change(vec![], cc).unwrap();

    let applied = drive_ready(&mut node, &storage);
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].voters, vec![1]);
    assert_eq!(applied[0].voters_outgoing, vec![1], "joint entered");
    assert_eq!(applied[0].learners, vec![2, 3]);
    assert!(applied[0].auto_leave);

    // The leave-joint entry was appended by the apply hook; the next turn
    // commits and applies it.
    let applied = drive_ready(&mut node, &storage);
    assert_eq!(applied.len(), 1);
    assert!(applied[0].voters_outgoing.is_empty(), "joint left");
    assert!(!applied[0].auto_leave);
    assert_eq!(applied[0].learners, vec![2, 3]);
}

// A v1-encoded conf change proposed through the driving API decodes and
// applies.
#[test]
fn test_raw_node_propose_conf_change_v1() {
    let l = test_logger();
    let (mut node, storage) = new_raw_node(1, vec![1], &l);
    node.campaign().unwrap();
    drive_ready(&mut node, &storage);

    let mut cc = ConfChange {
        node_id: 2,
        ..Default::default()
    };
    cc.set_change_type(ConfChangeType::AddNode);
    node.propose_conf_change(vec![], cc).unwrap();

    let applied = drive_ready(&mut node, &storage);
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].voters, vec![1, 2]);
}

// Hard state, snapshot and messages surface through Ready in the order the
// driver is supposed to honor.
#[test]
fn test_raw_node_emits_messages_after_persistence_point() {
    let l = test_logger();
    let (mut node, storage) = new_raw_node(1, vec![1, 2], &l);
    node.campaign().unwrap();

    let rd = node.ready();
    // The vote for self must be durable before the vote request is sent.
    assert!(rd.must_sync());
    assert_eq!(rd.hs().unwrap().vote, 1);
    assert_eq!(rd.hs().unwrap().term, 1);
    let vote_reqs: Vec<_> = rd
        .messages
        .iter()
        .filter(|m| m.get_msg_type() == MessageType::MsgRequestVote)
        .collect();
    assert_eq!(vote_reqs.len(), 1);
    assert_eq!(vote_reqs[0].to, 2);
    storage.wl().append(rd.entries()).unwrap();
    node.advance(rd);
}
