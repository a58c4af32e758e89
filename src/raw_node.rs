// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

//! The driver-facing surface of the consensus core.
//!
//! A [`RawNode`] is stepped by the surrounding storage layer: inbound
//! messages and local triggers go in, and after each call the driver takes a
//! [`Ready`] (entries to persist, entries to apply, messages to send), acts
//! on it in that order, and calls [`RawNode::advance`].

use std::mem;

use prost::Message as ProstMsg;
use slog::Logger;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::raft::{Raft, SoftState};
use crate::raftpb::{
    ConfChangeI, ConfState, Entry, EntryType, HardState, Message, MessageType, Snapshot,
};
use crate::read_only::ReadState;
use crate::status::Status;
use crate::storage::Storage;

/// How a shipped snapshot worked out, reported by the application.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SnapshotStatus {
    /// The follower received and applied the snapshot.
    Finish,
    /// The transfer failed; the follower must be probed again later.
    Failure,
}

/// Whether `t` is a local trigger kind that must never arrive over the
/// network.
pub fn is_local_msg(t: MessageType) -> bool {
    matches!(
        t,
        MessageType::MsgHup
            | MessageType::MsgBeat
            | MessageType::MsgUnreachable
            | MessageType::MsgSnapStatus
            | MessageType::MsgCheckQuorum
    )
}

fn is_response_msg(t: MessageType) -> bool {
    matches!(
        t,
        MessageType::MsgAppendResponse
            | MessageType::MsgRequestVoteResponse
            | MessageType::MsgHeartbeatResponse
            | MessageType::MsgUnreachable
            | MessageType::MsgRequestPreVoteResponse
    )
}

/// Everything the node wants from its driver at one point in time.
///
/// The contract: persist `entries` (and the snapshot) before sending
/// `messages`; apply `committed_entries` whenever convenient; then call
/// `advance`.
#[derive(Default, Debug, PartialEq)]
pub struct Ready {
    ss: Option<SoftState>,

    hs: Option<HardState>,

    read_states: Vec<ReadState>,

    entries: Vec<Entry>,

    snapshot: Snapshot,

    /// Entries committed by the quorum and not yet applied. Hand them to
    /// the state machine in order.
    pub committed_entries: Option<Vec<Entry>>,

    /// Outbound messages, to be sent after `entries` are durable.
    /// A `MsgSnapshot` in here obliges the driver to eventually call
    /// [`RawNode::report_snapshot`] for the receiving peer.
    pub messages: Vec<Message>,

    must_sync: bool,
}

impl Ready {
    fn new<T: Storage>(
        raft: &mut Raft<T>,
        prev_ss: &SoftState,
        prev_hs: &HardState,
        since_idx: Option<u64>,
    ) -> Ready {
        let mut rd = Ready {
            entries: raft.raft_log.unstable_entries().unwrap_or(&[]).to_vec(),
            ..Default::default()
        };
        if !raft.msgs.is_empty() {
            mem::swap(&mut raft.msgs, &mut rd.messages);
        }
        rd.committed_entries = Some(
            (match since_idx {
                None => raft.raft_log.next_entries(),
                Some(idx) => raft.raft_log.next_entries_since(idx),
            })
            .unwrap_or_default(),
        );
        let ss = raft.soft_state();
        if &ss != prev_ss {
            rd.ss = Some(ss);
        }
        let hs = raft.hard_state();
        if &hs != prev_hs {
            if hs.vote != prev_hs.vote || hs.term != prev_hs.term || !rd.entries.is_empty() {
                rd.must_sync = true;
            }
            rd.hs = Some(hs);
        }
        if raft.raft_log.unstable.snapshot.is_some() {
            rd.snapshot = raft.raft_log.unstable.snapshot.clone().unwrap();
        }
        if !raft.read_states.is_empty() {
            rd.read_states = raft.read_states.clone();
        }
        rd
    }

    /// The new volatile state, if it changed. Need not be stored.
    #[inline]
    pub fn ss(&self) -> Option<&SoftState> {
        self.ss.as_ref()
    }

    /// The new durable state, if it changed. Must be persisted before the
    /// messages go out.
    #[inline]
    pub fn hs(&self) -> Option<&HardState> {
        self.hs.as_ref()
    }

    /// Confirmed read requests. A read is serviceable locally once the
    /// applied index reaches the read state's index.
    #[inline]
    pub fn read_states(&self) -> &[ReadState] {
        &self.read_states
    }

    /// Entries to persist before the messages go out.
    #[inline]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// The snapshot to persist, if any.
    #[inline]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Whether the hard state and entries must hit disk synchronously
    /// before the messages go out, or may be written lazily.
    #[inline]
    pub fn must_sync(&self) -> bool {
        self.must_sync
    }
}

/// The thread-unsafe handle a driver steps a node through.
pub struct RawNode<T: Storage> {
    /// The wrapped consensus state machine.
    pub raft: Raft<T>,
    prev_ss: SoftState,
    prev_hs: HardState,
}

impl<T: Storage> RawNode<T> {
    /// Creates a node from `config` over `store`.
    pub fn new(config: &Config, store: T, logger: &Logger) -> Result<Self> {
        assert_ne!(config.id, 0, "config.id must not be zero");
        let r = Raft::new(config, store, logger)?;
        let mut rn = RawNode {
            raft: r,
            prev_hs: Default::default(),
            prev_ss: Default::default(),
        };
        rn.prev_hs = rn.raft.hard_state();
        rn.prev_ss = rn.raft.soft_state();
        info!(
            rn.raft.logger,
            "RawNode created with id {id}",
            id = rn.raft.id
        );
        Ok(rn)
    }

    /// Creates a node with the crate's default logger.
    #[cfg(feature = "default-logger")]
    pub fn with_default_logger(c: &Config, store: T) -> Result<Self> {
        Self::new(c, store, &crate::default_logger())
    }

    fn commit_ready(&mut self, rd: Ready) {
        if let Some(ss) = rd.ss {
            self.prev_ss = ss;
        }
        if let Some(hs) = rd.hs {
            if hs != HardState::default() {
                self.prev_hs = hs;
            }
        }
        if let Some(committed) = &rd.committed_entries {
            self.raft.reduce_uncommitted_size(committed);
        }
        if !rd.entries.is_empty() {
            let e = rd.entries.last().unwrap();
            self.raft.raft_log.stable_to(e.index, e.term);
        }
        if rd.snapshot != Snapshot::default() {
            self.raft
                .raft_log
                .stable_snap_to(rd.snapshot.get_metadata().index);
        }
        if !rd.read_states.is_empty() {
            self.raft.read_states.clear();
        }
    }

    /// Advances the logical clock one tick. Returns true when readiness
    /// probably needs handling.
    pub fn tick(&mut self) -> bool {
        self.raft.tick()
    }

    /// Starts an election on this node.
    pub fn campaign(&mut self) -> Result<()> {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgHup);
        self.raft.step(m)
    }

    /// Proposes `data` for the log. `context` travels with the entry,
    /// untouched.
    pub fn propose(&mut self, context: Vec<u8>, data: Vec<u8>) -> Result<()> {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgPropose);
        m.from = self.raft.id;
        m.entries = vec![Entry {
            data,
            context,
            ..Default::default()
        }];
        self.raft.step(m)
    }

    /// Broadcasts heartbeats if this node leads; a no-op otherwise.
    pub fn ping(&mut self) {
        self.raft.ping()
    }

    /// Proposes a configuration change (either encoding).
    ///
    /// For a joint change entered with `auto_leave` false, the caller must
    /// eventually propose an empty `ConfChangeV2` to leave the joint state.
    pub fn propose_conf_change(&mut self, context: Vec<u8>, cc: impl ConfChangeI) -> Result<()> {
        let (data, ty) = if let Some(cc) = cc.as_v1() {
            (cc.encode_to_vec(), EntryType::EntryConfChange)
        } else {
            (
                cc.as_v2().as_ref().encode_to_vec(),
                EntryType::EntryConfChangeV2,
            )
        };
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgPropose);
        let mut e = Entry {
            data,
            context,
            ..Default::default()
        };
        e.set_entry_type(ty);
        m.entries = vec![e];
        self.raft.step(m)
    }

    /// Applies a committed configuration change to this node. The driver
    /// calls this when it applies the change entry, and persists the
    /// returned `ConfState` alongside.
    pub fn apply_conf_change(&mut self, cc: &impl ConfChangeI) -> Result<ConfState> {
        self.raft.apply_conf_change(&cc.as_v2())
    }

    /// Steps an inbound message into the state machine.
    pub fn step(&mut self, m: Message) -> Result<()> {
        // Local triggers must not arrive from the outside.
        if is_local_msg(m.get_msg_type()) {
            return Err(Error::StepLocalMsg);
        }
        if self.raft.prs().get(m.from).is_some() || !is_response_msg(m.get_msg_type()) {
            return self.raft.step(m);
        }
        Err(Error::StepPeerNotFound)
    }

    /// The readiness computed against an explicit applied index.
    pub fn ready_since(&mut self, applied_idx: u64) -> Ready {
        Ready::new(
            &mut self.raft,
            &self.prev_ss,
            &self.prev_hs,
            Some(applied_idx),
        )
    }

    /// The current readiness.
    pub fn ready(&mut self) -> Ready {
        Ready::new(&mut self.raft, &self.prev_ss, &self.prev_hs, None)
    }

    /// Whether a `Ready` computed against `applied_idx` would carry work.
    pub fn has_ready_since(&self, applied_idx: Option<u64>) -> bool {
        let raft = &self.raft;
        if !raft.msgs.is_empty() || raft.raft_log.unstable_entries().is_some() {
            return true;
        }
        if !raft.read_states.is_empty() {
            return true;
        }
        if self.snap().map_or(false, |s| !s.is_empty()) {
            return true;
        }
        let has_unapplied_entries = match applied_idx {
            None => raft.raft_log.has_next_entries(),
            Some(idx) => raft.raft_log.has_next_entries_since(idx),
        };
        if has_unapplied_entries {
            return true;
        }
        if raft.soft_state() != self.prev_ss {
            return true;
        }
        let hs = raft.hard_state();
        if hs != HardState::default() && hs != self.prev_hs {
            return true;
        }
        false
    }

    /// Whether a `Ready` would carry work.
    #[inline]
    pub fn has_ready(&self) -> bool {
        self.has_ready_since(None)
    }

    /// The snapshot pending application, if any.
    #[inline]
    pub fn snap(&self) -> Option<&Snapshot> {
        self.raft.snap()
    }

    /// Acknowledges a fully handled `Ready`: persistence is assumed done,
    /// and everything committed in it is marked applied.
    pub fn advance(&mut self, rd: Ready) {
        self.advance_append(rd);
        let commit_idx = self.prev_hs.commit;
        if commit_idx != 0 {
            // Mark all committed entries applied, whether or not this Ready
            // restated the hard state: on a quiet log the commit index moves
            // without a new HardState being emitted.
            self.advance_apply(commit_idx);
        }
    }

    /// Acknowledges the persistence half of a `Ready` only; the driver
    /// advances the applied index separately with [`RawNode::advance_apply`].
    #[inline]
    pub fn advance_append(&mut self, rd: Ready) {
        self.commit_ready(rd);
    }

    /// Registers application progress up to `applied`.
    #[inline]
    pub fn advance_apply(&mut self, applied: u64) {
        self.raft.commit_apply(applied);
    }

    /// A point-in-time status snapshot.
    #[inline]
    pub fn status(&self) -> Status {
        Status::new(&self.raft)
    }

    /// Reports that the last send to `id` failed. Replication to it falls
    /// back to probing.
    pub fn report_unreachable(&mut self, id: u64) {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgUnreachable);
        m.from = id;
        // An error here only means we are no longer leader; nothing to do.
        let _ = self.raft.step(m);
    }

    /// Reports how shipping a snapshot to `id` went.
    pub fn report_snapshot(&mut self, id: u64, status: SnapshotStatus) {
        let rej = status == SnapshotStatus::Failure;
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgSnapStatus);
        m.from = id;
        m.reject = rej;
        let _ = self.raft.step(m);
    }

    /// Tries to transfer leadership to `transferee`.
    pub fn transfer_leader(&mut self, transferee: u64) {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgTransferLeader);
        m.from = transferee;
        let _ = self.raft.step(m);
    }

    /// Requests a linearizable read point. Once confirmed it surfaces as a
    /// [`ReadState`] carrying the same `rctx` in a later `Ready`; the read
    /// may be served as soon as the applied index reaches its index.
    pub fn read_index(&mut self, rctx: Vec<u8>) {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgReadIndex);
        m.entries = vec![Entry {
            data: rctx,
            ..Default::default()
        }];
        let _ = self.raft.step(m);
    }

    /// A read-only handle on the store.
    #[inline]
    pub fn store(&self) -> &T {
        self.raft.store()
    }

    /// A mutable handle on the store.
    #[inline]
    pub fn mut_store(&mut self) -> &mut T {
        self.raft.mut_store()
    }
}
