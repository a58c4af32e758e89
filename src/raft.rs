// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use std::cmp;
use std::ops::{Deref, DerefMut};

use rand::Rng;
use slog::Logger;

use crate::confchange::{self, Changer};
use crate::config::Config;
use crate::errors::{Error, Result, StorageError};
use crate::quorum::VoteResult;
use crate::raft_log::RaftLog;
use crate::raftpb::{
    conf_state_eq, ConfChangeV2, ConfState, Entry, EntryType, HardState, Message, MessageType,
    Snapshot,
};
use crate::read_only::{ReadOnly, ReadOnlyOption, ReadState};
use crate::storage::Storage;
use crate::tracker::{ProgressState, ProgressTracker};
use crate::{util, HashSet};

/// Context value marking a campaign as the pre-vote round.
pub const CAMPAIGN_PRE_ELECTION: &[u8] = b"CampaignPreElection";
/// Context value marking a campaign as a binding election round.
pub const CAMPAIGN_ELECTION: &[u8] = b"CampaignElection";
/// Context value marking a campaign forced by leadership transfer, which
/// overrides the leader-lease vote suppression.
pub const CAMPAIGN_TRANSFER: &[u8] = b"CampaignTransfer";

/// A constant representing an unknown or absent node id.
pub const INVALID_ID: u64 = 0;
/// A constant representing an absent log index.
pub const INVALID_INDEX: u64 = 0;

/// The role a node currently plays in its group.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum StateRole {
    /// Accepts entries from a leader and votes in elections.
    #[default]
    Follower,
    /// Campaigns for leadership with a real term bump.
    Candidate,
    /// The at-most-one decision maker of the current term.
    Leader,
    /// Runs the non-binding pre-vote round before daring a real election.
    PreCandidate,
}

/// Volatile state useful for observing a node; never persisted.
#[derive(Default, PartialEq, Eq, Debug, Clone)]
pub struct SoftState {
    /// The leader as far as this node knows, or `INVALID_ID`.
    pub leader_id: u64,
    /// The node's current role.
    pub raft_state: StateRole,
}

fn new_message(to: u64, field_type: MessageType, from: Option<u64>) -> Message {
    let mut m = Message {
        to,
        ..Default::default()
    };
    if let Some(id) = from {
        m.from = id;
    }
    m.set_msg_type(field_type);
    m
}

/// Maps vote and pre-vote request types to their response types.
pub fn vote_resp_msg_type(t: MessageType) -> MessageType {
    match t {
        MessageType::MsgRequestVote => MessageType::MsgRequestVoteResponse,
        MessageType::MsgRequestPreVote => MessageType::MsgRequestPreVoteResponse,
        _ => panic!("not a vote message: {:?}", t),
    }
}

/// The consensus state proper, split out of [`Raft`] so that message
/// handlers can hold a mutable progress entry and still reach the log and
/// the mailbox (distinct fields borrow independently).
pub struct RaftCore<T: Storage> {
    /// The current election term.
    pub term: u64,

    /// Who this node voted for in the current term, or `INVALID_ID`.
    pub vote: u64,

    /// The id of this node.
    pub id: u64,

    /// Confirmed read requests ready for the driver to consume.
    pub read_states: Vec<ReadState>,

    /// The replicated log.
    pub raft_log: RaftLog<T>,

    /// Per-peer bound on in-flight append messages.
    pub max_inflight: usize,

    /// Per-peer bound on in-flight append payload bytes (0 = unbounded).
    pub max_inflight_bytes: u64,

    /// Byte budget for the entries of one append message.
    pub max_msg_size: u64,

    /// The node's current role.
    pub state: StateRole,

    /// Whether this node may campaign: it is a voter of the current
    /// configuration and tracks its own progress. Learners are never
    /// promotable, no matter who asks.
    promotable: bool,

    /// The leader of the current term as known here, or `INVALID_ID`.
    pub leader_id: u64,

    /// The target of the leadership transfer in progress, if any.
    pub lead_transferee: Option<u64>,

    /// Upper bound under which a configuration change may be pending in the
    /// log without having been applied. At most one change may be in that
    /// window at a time; proposals of a second one are demoted to no-ops
    /// until the window clears.
    pub pending_conf_index: u64,

    /// The queue of read-only requests awaiting quorum confirmation.
    pub read_only: ReadOnly,

    /// Ticks since the node last heard from a current leader (follower), or
    /// since the election timer last fired (leader/candidate).
    pub election_elapsed: usize,

    /// Ticks since the last heartbeat broadcast. Leader only.
    heartbeat_elapsed: usize,

    /// Whether the leader steps down when an election timeout passes without
    /// hearing from a quorum.
    pub check_quorum: bool,

    /// Whether elections start with the non-binding pre-vote round.
    pub pre_vote: bool,

    /// Combined payload bytes of proposed-but-uncommitted entries. Leader
    /// only; the admission ceiling applies to this number.
    uncommitted_size: u64,
    max_uncommitted_size: u64,

    batch_append: bool,

    heartbeat_timeout: usize,
    election_timeout: usize,

    // Fixed per reset, drawn uniformly from
    // [min_election_timeout, max_election_timeout).
    randomized_election_timeout: usize,
    min_election_timeout: usize,
    max_election_timeout: usize,

    pub(crate) logger: Logger,
}

/// The consensus state machine of one node.
pub struct Raft<T: Storage> {
    prs: ProgressTracker,

    /// The outbound mailbox. The driver drains it (directly or through a
    /// `Ready`) after every `step`/`tick`; the core never re-reads a message
    /// once pushed.
    pub msgs: Vec<Message>,

    /// The core state. Also reachable through `Deref`.
    pub r: RaftCore<T>,
}

impl<T: Storage> Deref for Raft<T> {
    type Target = RaftCore<T>;

    #[inline]
    fn deref(&self) -> &RaftCore<T> {
        &self.r
    }
}

impl<T: Storage> DerefMut for Raft<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut RaftCore<T> {
        &mut self.r
    }
}

trait AssertSend: Send {}

impl<T: Storage + Send> AssertSend for Raft<T> {}

impl<T: Storage> Raft<T> {
    /// Creates a consensus state machine from `config`, recovering whatever
    /// `store` holds.
    pub fn new(c: &Config, store: T, logger: &Logger) -> Result<Self> {
        c.validate()?;
        let logger = logger.new(o!("raft_id" => c.id));
        let raft_state = store.initial_state()?;
        let conf_state = raft_state.conf_state;

        let mut r = Raft {
            prs: ProgressTracker::new(c.max_inflight_msgs, c.max_inflight_bytes),
            msgs: Default::default(),
            r: RaftCore {
                id: c.id,
                read_states: Default::default(),
                raft_log: RaftLog::new(store, logger.clone()),
                max_inflight: c.max_inflight_msgs,
                max_inflight_bytes: c.max_inflight_bytes,
                max_msg_size: c.max_size_per_msg,
                state: StateRole::Follower,
                promotable: false,
                check_quorum: c.check_quorum,
                pre_vote: c.pre_vote,
                read_only: ReadOnly::new(c.read_only_option),
                heartbeat_timeout: c.heartbeat_tick,
                election_timeout: c.election_tick,
                leader_id: Default::default(),
                lead_transferee: None,
                term: Default::default(),
                election_elapsed: Default::default(),
                pending_conf_index: Default::default(),
                vote: Default::default(),
                heartbeat_elapsed: Default::default(),
                uncommitted_size: 0,
                max_uncommitted_size: c.max_uncommitted_size,
                batch_append: c.batch_append,
                randomized_election_timeout: 0,
                min_election_timeout: c.min_election_tick(),
                max_election_timeout: c.max_election_tick(),
                logger,
            },
        };

        let next_idx = r.raft_log.last_index() + 1;
        if let Err(e) = confchange::restore(&mut r.prs, next_idx, &conf_state) {
            fatal!(r.logger, "unable to restore configuration: {}", e);
        }
        let new_cs = r.post_conf_change();
        if !conf_state_eq(&new_cs, &conf_state) {
            fatal!(
                r.logger,
                "invalid restore: {:?} != {:?}",
                conf_state,
                new_cs
            );
        }

        if raft_state.hard_state != HardState::default() {
            r.load_state(&raft_state.hard_state);
        }
        if c.applied > 0 {
            r.commit_apply(c.applied);
        }
        let term = r.term;
        r.become_follower(term, INVALID_ID);

        info!(
            r.logger,
            "newRaft";
            "term" => r.term,
            "commit" => r.raft_log.committed,
            "applied" => r.raft_log.applied,
            "last index" => r.raft_log.last_index(),
            "last term" => r.raft_log.last_term(),
            "peers" => ?r.prs.conf().voters(),
        );
        Ok(r)
    }

    /// Creates a consensus state machine with the crate's default logger.
    #[cfg(feature = "default-logger")]
    pub fn with_default_logger(c: &Config, store: T) -> Result<Self> {
        Self::new(c, store, &crate::default_logger())
    }

    /// A read-only handle on the store.
    #[inline]
    pub fn store(&self) -> &T {
        &self.raft_log.store
    }

    /// A mutable handle on the store.
    #[inline]
    pub fn mut_store(&mut self) -> &mut T {
        &mut self.raft_log.store
    }

    /// The snapshot pending application, if any.
    #[inline]
    pub fn snap(&self) -> Option<&Snapshot> {
        self.raft_log.unstable.snapshot.as_ref()
    }

    /// How many read requests are waiting for quorum confirmation.
    #[inline]
    pub fn pending_read_count(&self) -> usize {
        self.read_only.pending_read_count()
    }

    /// How many confirmed read states the driver has not consumed yet.
    #[inline]
    pub fn ready_read_count(&self) -> usize {
        self.read_states.len()
    }

    /// The current volatile state.
    pub fn soft_state(&self) -> SoftState {
        SoftState {
            leader_id: self.leader_id,
            raft_state: self.state,
        }
    }

    /// The current durable state.
    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.raft_log.committed,
        }
    }

    /// Pins the randomized election timeout; tests use this to take the
    /// randomness out of election races.
    #[doc(hidden)]
    pub fn set_randomized_election_timeout(&mut self, t: usize) {
        assert!(self.min_election_timeout <= t && t < self.max_election_timeout);
        self.randomized_election_timeout = t;
    }

    /// The configured election timeout in ticks.
    pub fn election_timeout(&self) -> usize {
        self.election_timeout
    }

    /// The configured heartbeat timeout in ticks.
    pub fn heartbeat_timeout(&self) -> usize {
        self.heartbeat_timeout
    }

    /// The current randomized election timeout in ticks.
    pub fn randomized_election_timeout(&self) -> usize {
        self.randomized_election_timeout
    }

    /// Whether an entry of this node's own term has been committed, which is
    /// the leader's proof that its commit index is authoritative.
    pub fn commit_to_current_term(&self) -> bool {
        self.raft_log
            .term(self.raft_log.committed)
            .map_or(false, |t| t == self.term)
    }

    /// The progress tracker.
    pub fn prs(&self) -> &ProgressTracker {
        &self.prs
    }

    /// The mutable progress tracker.
    pub fn mut_prs(&mut self) -> &mut ProgressTracker {
        &mut self.prs
    }
}

impl<T: Storage> RaftCore<T> {
    // Stamps the sender and (where the protocol requires it) the term, then
    // places the message in the mailbox.
    fn send(&mut self, mut m: Message, msgs: &mut Vec<Message>) {
        debug!(
            self.logger,
            "sending from {from} to {to}",
            from = self.id,
            to = m.to;
            "msg" => ?m,
        );
        m.from = self.id;
        if m.get_msg_type() == MessageType::MsgRequestVote
            || m.get_msg_type() == MessageType::MsgRequestPreVote
            || m.get_msg_type() == MessageType::MsgRequestVoteResponse
            || m.get_msg_type() == MessageType::MsgRequestPreVoteResponse
        {
            if m.term == 0 {
                // Campaign messages carry an explicit term: a pre-vote asks
                // about a term the node has not adopted yet, and a granted
                // pre-vote response echoes the asked-for term, so the local
                // term is the wrong value for all four kinds.
                fatal!(
                    self.logger,
                    "term should be set when sending {:?}",
                    m.get_msg_type()
                );
            }
        } else {
            if m.term != 0 {
                fatal!(
                    self.logger,
                    "term should not be set when sending {:?} (was {})",
                    m.get_msg_type(),
                    m.term
                );
            }
            // Proposals and read requests are forwarded without a term so
            // they pass term gating at the leader whatever its term is.
            if m.get_msg_type() != MessageType::MsgPropose
                && m.get_msg_type() != MessageType::MsgReadIndex
            {
                m.term = self.term;
            }
        }
        msgs.push(m);
    }

    fn prepare_send_snapshot(
        &mut self,
        m: &mut Message,
        pr: &mut crate::tracker::Progress,
        to: u64,
    ) -> bool {
        if !pr.recent_active {
            debug!(
                self.logger,
                "ignore sending snapshot to {} since it is not recently active", to;
            );
            return false;
        }

        m.set_msg_type(MessageType::MsgSnapshot);
        let snapshot_r = self.raft_log.snapshot();
        if let Err(e) = snapshot_r {
            if e == Error::Store(StorageError::SnapshotTemporarilyUnavailable) {
                debug!(
                    self.logger,
                    "snapshot for {} is not ready yet; will retry", to;
                );
                return false;
            }
            fatal!(self.logger, "unexpected error: {:?}", e);
        }
        let snapshot = snapshot_r.unwrap();
        if snapshot.get_metadata().index == 0 {
            fatal!(self.logger, "need non-empty snapshot");
        }
        let (sindex, sterm) = (snapshot.get_metadata().index, snapshot.get_metadata().term);
        m.set_snapshot(snapshot);
        info!(
            self.logger,
            "[firstindex: {first_index}, commit: {committed}] sent snapshot[index: {snapshot_index}, term: {snapshot_term}] to {to}",
            first_index = self.raft_log.first_index(),
            committed = self.raft_log.committed,
            snapshot_index = sindex,
            snapshot_term = sterm,
            to = to;
            "progress" => ?pr,
        );
        pr.become_snapshot(sindex);
        true
    }

    fn prepare_send_entries(
        &mut self,
        m: &mut Message,
        pr: &mut crate::tracker::Progress,
        term: u64,
        ents: Vec<Entry>,
    ) {
        m.set_msg_type(MessageType::MsgAppend);
        m.index = pr.next_idx - 1;
        m.log_term = term;
        m.commit = self.raft_log.committed;
        let bytes = util::payloads_size(&ents);
        m.entries = ents;
        if !m.entries.is_empty() {
            let last = m.entries.last().unwrap().index;
            pr.update_sent(last, bytes);
        }
    }

    // Folds `ents` into an append already in the mailbox for the same peer,
    // when the ranges are contiguous. Returns whether it did.
    fn try_batching(
        &mut self,
        to: u64,
        msgs: &mut [Message],
        pr: &mut crate::tracker::Progress,
        ents: &mut Vec<Entry>,
    ) -> bool {
        let mut is_batched = false;
        for msg in msgs {
            if msg.get_msg_type() == MessageType::MsgAppend && msg.to == to {
                if !ents.is_empty() {
                    if !util::is_continuous_ents(msg, ents) {
                        return is_batched;
                    }
                    let bytes = util::payloads_size(ents);
                    let mut batched_entries = std::mem::take(&mut msg.entries);
                    batched_entries.append(ents);
                    msg.entries = batched_entries;
                    let last_idx = msg.entries.last().unwrap().index;
                    pr.update_sent(last_idx, bytes);
                }
                msg.commit = self.raft_log.committed;
                is_batched = true;
                break;
            }
        }
        is_batched
    }

    // Sends an append carrying new entries (or the commit index alone) to a
    // peer; substitutes a snapshot when the peer's next index has been
    // compacted away.
    fn send_append(
        &mut self,
        to: u64,
        pr: &mut crate::tracker::Progress,
        msgs: &mut Vec<Message>,
    ) {
        self.maybe_send_append(to, pr, true, msgs);
    }

    // The workhorse behind `send_append`. `allow_empty` lets pure
    // commit-index updates through; batch sends set it false so they never
    // emit useless empty messages. Returns whether a message was sent (or
    // folded into an existing one).
    fn maybe_send_append(
        &mut self,
        to: u64,
        pr: &mut crate::tracker::Progress,
        allow_empty: bool,
        msgs: &mut Vec<Message>,
    ) -> bool {
        if pr.is_paused() {
            trace!(
                self.logger,
                "skipping send to {to}, it's paused",
                to = to;
                "progress" => ?pr,
            );
            return false;
        }
        let mut m = Message {
            to,
            ..Default::default()
        };
        let term = self.raft_log.term(pr.next_idx - 1);
        let ents = self.raft_log.entries(pr.next_idx, self.max_msg_size);
        if !allow_empty && ents.as_ref().ok().map_or(true, |e| e.is_empty()) {
            return false;
        }
        match (term, ents) {
            (Ok(term), Ok(mut ents)) => {
                if self.batch_append && self.try_batching(to, msgs, pr, &mut ents) {
                    return true;
                }
                self.prepare_send_entries(&mut m, pr, term, ents)
            }
            _ => {
                // The peer's next index has fallen off the retained log;
                // only a snapshot can reconnect it.
                if !self.prepare_send_snapshot(&mut m, pr, to) {
                    return false;
                }
            }
        }
        self.send(m, msgs);
        true
    }

    // Sends an empty heartbeat, carrying min(matched, committed) so a
    // follower is never told about a commit past what it provably holds.
    fn send_heartbeat(
        &mut self,
        to: u64,
        pr: &crate::tracker::Progress,
        ctx: Option<Vec<u8>>,
        msgs: &mut Vec<Message>,
    ) {
        let mut m = Message {
            to,
            ..Default::default()
        };
        m.set_msg_type(MessageType::MsgHeartbeat);
        m.commit = cmp::min(pr.matched, self.raft_log.committed);
        if let Some(context) = ctx {
            m.context = context;
        }
        self.send(m, msgs);
    }

    // Resolves a confirmed read: local requests turn into a `ReadState` for
    // the driver, forwarded ones turn into a response message for the
    // follower that relayed them.
    fn handle_ready_read_index(&mut self, mut req: Message, index: u64) -> Option<Message> {
        if req.from == INVALID_ID || req.from == self.id {
            let rs = ReadState {
                index,
                request_ctx: req.take_entries()[0].take_data(),
            };
            self.read_states.push(rs);
            return None;
        }
        let mut to_send = Message::default();
        to_send.set_msg_type(MessageType::MsgReadIndexResp);
        to_send.to = req.from;
        to_send.index = index;
        to_send.entries = req.take_entries();
        Some(to_send)
    }
}

impl<T: Storage> Raft<T> {
    /// Sends an append (or snapshot) to the given peer, if it is not paused.
    pub fn send_append(&mut self, to: u64) {
        let pr = match self.prs.get_mut(to) {
            Some(pr) => pr,
            None => return,
        };
        self.r.send_append(to, pr, &mut self.msgs)
    }

    /// Sends appends to every peer that is not up to date and not paused.
    pub fn bcast_append(&mut self) {
        let self_id = self.r.id;
        let core = &mut self.r;
        let msgs = &mut self.msgs;
        self.prs
            .iter_mut()
            .filter(|&(id, _)| *id != self_id)
            .for_each(|(id, pr)| core.send_append(*id, pr, msgs));
    }

    /// Broadcasts heartbeats if this node is the leader; a no-op otherwise.
    pub fn ping(&mut self) {
        if self.state == StateRole::Leader {
            self.bcast_heartbeat();
        }
    }

    /// Broadcasts heartbeats to every peer, carrying the newest pending
    /// read-index context if one is waiting for confirmation.
    pub fn bcast_heartbeat(&mut self) {
        let ctx = self.read_only.last_pending_request_ctx();
        self.bcast_heartbeat_with_ctx(ctx)
    }

    fn bcast_heartbeat_with_ctx(&mut self, ctx: Option<Vec<u8>>) {
        let self_id = self.r.id;
        let core = &mut self.r;
        let msgs = &mut self.msgs;
        self.prs
            .iter_mut()
            .filter(|&(id, _)| *id != self_id)
            .for_each(|(id, pr)| core.send_heartbeat(*id, pr, ctx.clone(), msgs));
    }

    /// Recomputes the commit index from the quorum's acknowledged indexes.
    /// Returns true if it advanced (the caller then broadcasts appends so
    /// followers learn of it).
    pub fn maybe_commit(&mut self) -> bool {
        let mci = self.prs.maximal_committed_index();
        self.r.raft_log.maybe_commit(mci, self.r.term)
    }

    /// Registers that the application applied the log up to `applied`.
    ///
    /// On the leader this is also the point where an auto-leave joint
    /// configuration, once its change entry is applied, gets its leave-joint
    /// entry proposed.
    pub fn commit_apply(&mut self, applied: u64) {
        let old_applied = self.raft_log.applied;
        self.raft_log.applied_to(applied);

        if *self.prs.conf().auto_leave()
            && old_applied <= self.pending_conf_index
            && self.pending_conf_index <= applied
            && self.state == StateRole::Leader
        {
            // Empty payload: decodes to the empty ConfChangeV2, which is the
            // leave-joint request, and admission can never refuse it since
            // it registers zero bytes.
            let mut entry = Entry::default();
            entry.set_entry_type(EntryType::EntryConfChangeV2);
            if !self.append_entry(&mut [entry]) {
                fatal!(
                    self.logger,
                    "appending an empty leave-joint entry should never be refused"
                );
            }
            self.pending_conf_index = self.raft_log.last_index();
            info!(
                self.logger,
                "initiating automatic transition out of joint configuration";
                "config" => ?self.prs.conf(),
            );
            self.bcast_append();
        }
    }

    /// Clears volatile per-term state and adopts `term`.
    pub fn reset(&mut self, term: u64) {
        if self.term != term {
            self.term = term;
            self.vote = INVALID_ID;
        }
        self.leader_id = INVALID_ID;
        self.reset_randomized_election_timeout();
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;

        self.abort_leader_transfer();

        self.prs.reset_votes();

        self.pending_conf_index = 0;
        self.uncommitted_size = 0;
        self.r.read_only = ReadOnly::new(self.r.read_only.option);

        let last_index = self.r.raft_log.last_index();
        let self_id = self.r.id;
        for (&id, pr) in self.prs.iter_mut() {
            pr.reset(last_index + 1);
            if id == self_id {
                pr.matched = last_index;
            }
        }
    }

    /// Stamps `es` with the current term and the next indexes and appends
    /// them locally. Returns false (appending nothing) when the uncommitted
    /// payload ceiling refuses the batch.
    pub fn append_entry(&mut self, es: &mut [Entry]) -> bool {
        if !self.maybe_increase_uncommitted_size(es) {
            return false;
        }

        let mut li = self.raft_log.last_index();
        for (i, e) in es.iter_mut().enumerate() {
            e.term = self.term;
            e.index = li + 1 + i as u64;
        }
        li = self.raft_log.append(es);

        let self_id = self.id;
        self.prs.get_mut(self_id).unwrap().maybe_update(li);

        // The caller broadcasts regardless; committing here covers the
        // single-voter group where no acknowledgment will ever arrive.
        self.maybe_commit();
        true
    }

    // Charges `ents` against the uncommitted-payload ceiling. A batch that
    // would cross the ceiling is refused outright, with one exception:
    // when nothing is uncommitted, even an oversized batch is admitted, so
    // a single large proposal cannot wedge the group forever.
    fn maybe_increase_uncommitted_size(&mut self, ents: &[Entry]) -> bool {
        let size = util::payloads_size(ents);
        if self.uncommitted_size > 0
            && size > 0
            && self.uncommitted_size + size > self.max_uncommitted_size
        {
            return false;
        }
        self.uncommitted_size += size;
        true
    }

    /// Releases committed entries from the uncommitted-payload account.
    /// Followers carry no account (it is reset on every term change), so
    /// this is effectively leader-only.
    pub fn reduce_uncommitted_size(&mut self, ents: &[Entry]) {
        if self.uncommitted_size == 0 {
            return;
        }
        let size = util::payloads_size(ents);
        if size > self.uncommitted_size {
            // Can only happen while transferring leadership mid-flight;
            // saturate rather than underflow.
            self.uncommitted_size = 0;
        } else {
            self.uncommitted_size -= size;
        }
    }

    #[doc(hidden)]
    pub fn uncommitted_size(&self) -> u64 {
        self.uncommitted_size
    }

    /// Advances the logical clock one tick. Returns true if the tick
    /// produced work for the driver (messages, a campaign).
    pub fn tick(&mut self) -> bool {
        match self.state {
            StateRole::Follower | StateRole::PreCandidate | StateRole::Candidate => {
                self.tick_election()
            }
            StateRole::Leader => self.tick_heartbeat(),
        }
    }

    /// The election half of `tick`: counts toward the randomized election
    /// timeout and campaigns when it fires. Never fires on an unpromotable
    /// node.
    pub fn tick_election(&mut self) -> bool {
        self.election_elapsed += 1;
        if !self.promotable || !self.pass_election_timeout() {
            return false;
        }

        self.election_elapsed = 0;
        let m = new_message(INVALID_ID, MessageType::MsgHup, Some(self.id));
        let _ = self.step(m);
        true
    }

    // The leader half of `tick`: heartbeats on the heartbeat interval, and
    // once per election interval runs the check-quorum sweep and abandons a
    // leadership transfer that failed to finish in time.
    fn tick_heartbeat(&mut self) -> bool {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        let mut has_ready = false;
        if self.election_elapsed >= self.election_timeout {
            self.election_elapsed = 0;
            if self.check_quorum {
                has_ready = true;
                let m = new_message(INVALID_ID, MessageType::MsgCheckQuorum, Some(self.id));
                let _ = self.step(m);
            }
            if self.state == StateRole::Leader && self.lead_transferee.is_some() {
                self.abort_leader_transfer()
            }
        }

        if self.state != StateRole::Leader {
            return has_ready;
        }

        if self.heartbeat_elapsed >= self.heartbeat_timeout {
            self.heartbeat_elapsed = 0;
            has_ready = true;
            let m = new_message(INVALID_ID, MessageType::MsgBeat, Some(self.id));
            let _ = self.step(m);
        }
        has_ready
    }

    /// Converts this node to a follower of `leader_id` (which may be
    /// unknown) at `term`.
    pub fn become_follower(&mut self, term: u64, leader_id: u64) {
        self.reset(term);
        self.leader_id = leader_id;
        self.state = StateRole::Follower;
        info!(
            self.logger,
            "became follower at term {term}",
            term = self.term;
        );
    }

    /// Converts this node to a candidate, bumping the term and voting for
    /// itself.
    ///
    /// # Panics
    ///
    /// Panics on a leader; a leader never campaigns against itself.
    pub fn become_candidate(&mut self) {
        assert_ne!(
            self.state,
            StateRole::Leader,
            "invalid transition [leader -> candidate]"
        );
        let term = self.term + 1;
        self.reset(term);
        let id = self.id;
        self.vote = id;
        self.state = StateRole::Candidate;
        info!(
            self.logger,
            "became candidate at term {term}",
            term = self.term;
        );
    }

    /// Converts this node to a pre-candidate. Deliberately changes neither
    /// term nor vote: the pre-vote round must be free of durable side
    /// effects, or it could disrupt a working leader.
    pub fn become_pre_candidate(&mut self) {
        assert_ne!(
            self.state,
            StateRole::Leader,
            "invalid transition [leader -> pre-candidate]"
        );
        self.state = StateRole::PreCandidate;
        self.prs.reset_votes();
        // A leader in the minority partition steps down here without being
        // able to tell anyone.
        self.leader_id = INVALID_ID;
        info!(
            self.logger,
            "became pre-candidate at term {term}",
            term = self.term;
        );
    }

    /// Converts this node to leader: every peer restarts in probe state
    /// with `next` just past the leader's log, and a no-op entry of the new
    /// term is appended so the new leader can commit.
    ///
    /// # Panics
    ///
    /// Panics on a follower; only candidates win elections.
    pub fn become_leader(&mut self) {
        assert_ne!(
            self.state,
            StateRole::Follower,
            "invalid transition [follower -> leader]"
        );
        let term = self.term;
        self.reset(term);
        self.leader_id = self.id;
        self.state = StateRole::Leader;

        // The leader trivially replicates to itself.
        let id = self.id;
        self.prs.get_mut(id).unwrap().become_replicate();

        // There may or may not be a pending conf change somewhere in the
        // tail; assuming there is one until the tail is applied is cheap
        // and safe, scanning the tail is not.
        self.pending_conf_index = self.raft_log.last_index();

        // The no-op carries the new term into the log; nothing can commit
        // before it does.
        if !self.append_entry(&mut [Entry::default()]) {
            fatal!(self.logger, "appending an empty entry should never be refused");
        }

        info!(
            self.logger,
            "became leader at term {term}",
            term = self.term;
        );
    }

    fn num_pending_conf(&self, ents: &[Entry]) -> usize {
        ents.iter()
            .filter(|e| {
                e.get_entry_type() == EntryType::EntryConfChange
                    || e.get_entry_type() == EntryType::EntryConfChangeV2
            })
            .count()
    }

    // Registers a ballot and, if it decides the election, acts on the
    // outcome: a won pre-vote escalates to the real election, a won election
    // takes leadership, a lost round falls back to follower at the current
    // term.
    fn poll(&mut self, from: u64, msg_type: MessageType, vote: bool) -> VoteResult {
        self.prs.record_vote(from, vote);
        let (granted, rejected, res) = self.prs.tally_votes();
        if from != self.id {
            info!(
                self.logger,
                "received votes response";
                "vote" => vote,
                "from" => from,
                "msg type" => ?msg_type,
                "granted" => granted,
                "rejected" => rejected,
                "term" => self.term,
            );
        }
        match res {
            VoteResult::Won => {
                if self.state == StateRole::PreCandidate {
                    self.campaign(CAMPAIGN_ELECTION);
                } else {
                    self.become_leader();
                    self.bcast_append();
                }
            }
            VoteResult::Lost => {
                // A pre-vote response may carry our prospective future term;
                // stay at the current one.
                let term = self.term;
                self.become_follower(term, INVALID_ID);
            }
            VoteResult::Pending => (),
        }
        res
    }

    /// Campaigns for leadership. Pre-vote campaigns solicit ballots for the
    /// *next* term without adopting it; only a won pre-vote escalates into
    /// a real, term-bumping election.
    pub fn campaign(&mut self, campaign_type: &[u8]) {
        let (vote_msg, term) = if campaign_type == CAMPAIGN_PRE_ELECTION {
            self.become_pre_candidate();
            (MessageType::MsgRequestPreVote, self.term + 1)
        } else {
            self.become_candidate();
            (MessageType::MsgRequestVote, self.term)
        };
        let self_id = self.id;
        if VoteResult::Won == self.poll(self_id, vote_resp_msg_type(vote_msg), true) {
            // Voting for ourself settled it: a single-voter group.
            return;
        }

        let mut voters: Vec<u64> = self
            .prs
            .conf()
            .voters()
            .ids()
            .iter()
            .filter(|&id| id != self_id)
            .collect();
        voters.sort_unstable();
        for id in voters {
            info!(
                self.logger,
                "[logterm: {log_term}, index: {log_index}] sent request to {id}",
                log_term = self.raft_log.last_term(),
                log_index = self.raft_log.last_index(),
                id = id;
                "term" => self.term,
                "msg" => ?vote_msg,
            );
            let mut m = new_message(id, vote_msg, None);
            m.term = term;
            m.index = self.raft_log.last_index();
            m.log_term = self.raft_log.last_term();
            if campaign_type == CAMPAIGN_TRANSFER {
                m.context = campaign_type.to_vec();
            }
            self.r.send(m, &mut self.msgs);
        }
    }

    /// Advances the state machine with one inbound message. The single
    /// entry point for protocol traffic and local triggers alike.
    pub fn step(&mut self, m: Message) -> Result<()> {
        // Term gating first; it may demote us before dispatch.
        if m.term == 0 {
            // Local trigger.
        } else if m.term > self.term {
            if m.get_msg_type() == MessageType::MsgRequestVote
                || m.get_msg_type() == MessageType::MsgRequestPreVote
            {
                let force = m.context == CAMPAIGN_TRANSFER;
                let in_lease = self.check_quorum
                    && self.leader_id != INVALID_ID
                    && self.election_elapsed < self.election_timeout;
                if !force && in_lease {
                    // A server inside the minimum election timeout of
                    // hearing from its leader neither updates its term nor
                    // grants the vote: a peer that was removed (or cut off)
                    // must not be able to disturb a functioning group.
                    info!(
                        self.logger,
                        "[logterm: {log_term}, index: {log_index}, vote: {vote}] ignored vote from \
                         {from} [logterm: {msg_term}, index: {msg_index}]: lease is not expired",
                        log_term = self.raft_log.last_term(),
                        log_index = self.raft_log.last_index(),
                        vote = self.vote,
                        from = m.from,
                        msg_term = m.log_term,
                        msg_index = m.index;
                        "term" => self.term,
                        "remaining ticks" => self.election_timeout - self.election_elapsed,
                        "msg type" => ?m.get_msg_type(),
                    );
                    return Ok(());
                }
            }

            if m.get_msg_type() == MessageType::MsgRequestPreVote
                || (m.get_msg_type() == MessageType::MsgRequestPreVoteResponse && !m.reject)
            {
                // Pre-vote requests never move the recipient's term, and a
                // granted pre-vote response carries the term we asked about,
                // not one we should adopt: we adopt it only by winning the
                // round and campaigning for real.
            } else {
                info!(
                    self.logger,
                    "received a message with higher term from {from}",
                    from = m.from;
                    "term" => self.term,
                    "message_term" => m.term,
                    "msg type" => ?m.get_msg_type(),
                );
                if m.get_msg_type() == MessageType::MsgAppend
                    || m.get_msg_type() == MessageType::MsgHeartbeat
                    || m.get_msg_type() == MessageType::MsgSnapshot
                {
                    self.become_follower(m.term, m.from);
                } else {
                    self.become_follower(m.term, INVALID_ID);
                }
            }
        } else if m.term < self.term {
            if (self.check_quorum || self.pre_vote)
                && (m.get_msg_type() == MessageType::MsgHeartbeat
                    || m.get_msg_type() == MessageType::MsgAppend)
            {
                // A leader at a lower term is talking to us. Under
                // check-quorum or pre-vote its own term can no longer be
                // advanced by our vote requests (we drop or they ignore),
                // so answer with an append response at our term to march it
                // forward; otherwise the stale leader could linger.
                let to_send = new_message(m.from, MessageType::MsgAppendResponse, None);
                self.r.send(to_send, &mut self.msgs);
            } else if m.get_msg_type() == MessageType::MsgRequestVote
                || m.get_msg_type() == MessageType::MsgRequestPreVote
            {
                // Answer stale campaigns with a rejection instead of
                // dropping them: the rejection carries our term, which is
                // the fastest way for the straggler to rejoin reality.
                info!(
                    self.logger,
                    "[logterm: {log_term}, index: {log_index}, vote: {vote}] rejected {msg_type} from {from} \
                     [logterm: {msg_term}, index: {msg_index}] at term {term}",
                    log_term = self.raft_log.last_term(),
                    log_index = self.raft_log.last_index(),
                    vote = self.vote,
                    msg_type = format!("{:?}", m.get_msg_type()),
                    from = m.from,
                    msg_term = m.log_term,
                    msg_index = m.index,
                    term = self.term;
                );
                let mut to_send = new_message(m.from, vote_resp_msg_type(m.get_msg_type()), None);
                to_send.term = self.term;
                to_send.reject = true;
                self.r.send(to_send, &mut self.msgs);
            } else {
                info!(
                    self.logger,
                    "ignored a message with lower term from {from}",
                    from = m.from;
                    "term" => self.term,
                    "msg type" => ?m.get_msg_type(),
                    "msg term" => m.term,
                );
            }
            return Ok(());
        }

        match m.get_msg_type() {
            MessageType::MsgHup => self.hup(false),
            MessageType::MsgRequestVote | MessageType::MsgRequestPreVote => {
                // We may grant if this repeats a vote we already cast...
                let can_vote = (self.vote == m.from)
                    // ...or we have not voted and know of no leader this term...
                    || (self.vote == INVALID_ID && self.leader_id == INVALID_ID)
                    // ...or it is a pre-vote for a future term...
                    || (m.get_msg_type() == MessageType::MsgRequestPreVote && m.term > self.term);
                // ...and only if the candidate's log is at least as
                // up-to-date as ours (ties count as up-to-date).
                if can_vote && self.raft_log.is_up_to_date(m.index, m.log_term) {
                    // The response echoes the *message's* term, not ours: a
                    // pre-vote asks about a future term while our local term
                    // stays put, and the campaigner drops responses at
                    // out-of-date terms.
                    self.log_vote_approve(&m);
                    let mut to_send =
                        new_message(m.from, vote_resp_msg_type(m.get_msg_type()), None);
                    to_send.reject = false;
                    to_send.term = m.term;
                    self.r.send(to_send, &mut self.msgs);
                    if m.get_msg_type() == MessageType::MsgRequestVote {
                        // Only binding votes are remembered.
                        self.election_elapsed = 0;
                        self.vote = m.from;
                    }
                } else {
                    self.log_vote_reject(&m);
                    let mut to_send =
                        new_message(m.from, vote_resp_msg_type(m.get_msg_type()), None);
                    to_send.reject = true;
                    to_send.term = self.term;
                    self.r.send(to_send, &mut self.msgs);
                }
            }
            _ => match self.state {
                StateRole::PreCandidate | StateRole::Candidate => self.step_candidate(m)?,
                StateRole::Follower => self.step_follower(m)?,
                StateRole::Leader => self.step_leader(m)?,
            },
        }
        Ok(())
    }

    fn hup(&mut self, transfer_leader: bool) {
        if self.state == StateRole::Leader {
            debug!(self.logger, "ignoring MsgHup because already leader");
            return;
        }
        if !self.promotable {
            warn!(
                self.logger,
                "unpromotable node; not campaigning";
            );
            return;
        }

        // A pending snapshot's index shows up via maybe_first_index; the
        // snapshot carries its own configuration, so only pending conf
        // entries in the applied..committed window block campaigning.
        let first_index = match self.raft_log.unstable.maybe_first_index() {
            Some(idx) => idx,
            None => self.raft_log.applied + 1,
        };

        let ents = self
            .raft_log
            .slice(first_index, self.raft_log.committed + 1, None)
            .unwrap_or_else(|e| {
                fatal!(
                    self.logger,
                    "unexpected error getting unapplied entries [{}, {}): {:?}",
                    first_index,
                    self.raft_log.committed + 1,
                    e
                );
            });
        let n = self.num_pending_conf(&ents);
        if n != 0 {
            warn!(
                self.logger,
                "cannot campaign at term {term} since there are still {pending_changes} pending \
                 configuration changes to apply",
                term = self.term,
                pending_changes = n;
            );
            return;
        }
        info!(
            self.logger,
            "starting a new election";
            "term" => self.term,
        );
        if transfer_leader {
            self.campaign(CAMPAIGN_TRANSFER);
        } else if self.pre_vote {
            self.campaign(CAMPAIGN_PRE_ELECTION);
        } else {
            self.campaign(CAMPAIGN_ELECTION);
        }
    }

    fn log_vote_approve(&self, m: &Message) {
        info!(
            self.logger,
            "[logterm: {log_term}, index: {log_index}, vote: {vote}] cast vote for {from} [logterm: {msg_term}, index: {msg_index}] \
             at term {term}",
            log_term = self.raft_log.last_term(),
            log_index = self.raft_log.last_index(),
            vote = self.vote,
            from = m.from,
            msg_term = m.log_term,
            msg_index = m.index,
            term = self.term;
            "msg type" => ?m.get_msg_type(),
        );
    }

    fn log_vote_reject(&self, m: &Message) {
        info!(
            self.logger,
            "[logterm: {log_term}, index: {log_index}, vote: {vote}] rejected vote from {from} [logterm: {msg_term}, index: \
             {msg_index}] at term {term}",
            log_term = self.raft_log.last_term(),
            log_index = self.raft_log.last_index(),
            vote = self.vote,
            from = m.from,
            msg_term = m.log_term,
            msg_index = m.index,
            term = self.term;
            "msg type" => ?m.get_msg_type(),
        );
    }

    fn handle_append_response(&mut self, m: &Message) {
        let pr = match self.prs.get_mut(m.from) {
            Some(pr) => pr,
            None => {
                debug!(self.logger, "no progress available for {}", m.from);
                return;
            }
        };
        pr.recent_active = true;

        if m.reject {
            debug!(
                self.r.logger,
                "received append rejection";
                "reject hint" => m.reject_hint,
                "from" => m.from,
                "index" => m.index,
            );

            if pr.maybe_decr_to(m.index, m.reject_hint) {
                debug!(
                    self.r.logger,
                    "decreased progress of {}",
                    m.from;
                    "progress" => ?pr,
                );
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                self.send_append(m.from);
            }
            return;
        }

        let old_paused = pr.is_paused();
        if !pr.maybe_update(m.index) {
            // A duplicate or reordered acknowledgment; nothing changes.
            return;
        }

        match pr.state {
            ProgressState::Probe => pr.become_replicate(),
            ProgressState::Snapshot => {
                if pr.snapshot_overlaps_ack() {
                    // The follower's acknowledged log already reaches the
                    // in-flight snapshot: the log is reconnected, resume
                    // streaming.
                    debug!(
                        self.r.logger,
                        "snapshot caught up by acks, resumed sending replication messages to {from}",
                        from = m.from;
                        "progress" => ?pr,
                    );
                    pr.become_replicate();
                }
            }
            ProgressState::Replicate => pr.ins.free_to(m.index),
        }

        if self.maybe_commit() {
            self.bcast_append();
        } else if old_paused {
            // The peer was gated; now that the acknowledgment lifted the
            // gate, restart the flow to it.
            self.send_append(m.from);
        }

        // Flow control may now admit several more (size-limited) sends at
        // once; drain them without emitting empty commit-only messages.
        let pr = self.prs.get_mut(m.from).unwrap();
        while self.r.maybe_send_append(m.from, pr, false, &mut self.msgs) {}

        // A transfer target that has fully caught up gets its TimeoutNow.
        if Some(m.from) == self.r.lead_transferee {
            let last_index = self.r.raft_log.last_index();
            if pr.matched == last_index {
                info!(
                    self.logger,
                    "sent MsgTimeoutNow to {from} after received MsgAppResp",
                    from = m.from;
                );
                self.send_timeout_now(m.from);
            }
        }
    }

    fn handle_heartbeat_response(&mut self, m: &Message) {
        let pr = match self.prs.get_mut(m.from) {
            Some(pr) => pr,
            None => {
                debug!(self.logger, "no progress available for {}", m.from);
                return;
            }
        };
        pr.recent_active = true;
        pr.resume();

        // If the window sits full, free one slot so the next append can
        // carry the freshest commit index.
        if pr.state == ProgressState::Replicate && pr.ins.full() {
            pr.ins.free_first_one();
        }
        if pr.matched < self.r.raft_log.last_index() {
            self.r.send_append(m.from, pr, &mut self.msgs);
        }

        if self.read_only.option != ReadOnlyOption::Safe || m.context.is_empty() {
            return;
        }

        match self.r.read_only.recv_ack(m.from, &m.context) {
            Some(acks) if self.prs.has_quorum(acks) => {}
            _ => return,
        }

        for rs in self.r.read_only.advance(&m.context, &self.r.logger) {
            if let Some(m) = self.r.handle_ready_read_index(rs.req, rs.index) {
                self.r.send(m, &mut self.msgs);
            }
        }
    }

    fn handle_transfer_leader(&mut self, m: &Message) {
        let from = m.from;
        if self.prs.get(from).is_none() {
            debug!(self.logger, "no progress available for {}", from);
            return;
        }
        if self.prs.learner_ids().contains(&from) {
            debug!(self.logger, "ignored transferring leadership to a learner");
            return;
        }

        let lead_transferee = from;
        if let Some(last_lead_transferee) = self.lead_transferee {
            if last_lead_transferee == lead_transferee {
                info!(
                    self.logger,
                    "[term {term}] transfer leadership to {lead_transferee} is in progress, ignores request \
                     to same node",
                    term = self.term,
                    lead_transferee = lead_transferee;
                );
                return;
            }
            self.abort_leader_transfer();
            info!(
                self.logger,
                "[term {term}] abort previous transferring leadership to {last_lead_transferee}",
                term = self.term,
                last_lead_transferee = last_lead_transferee;
            );
        }
        if lead_transferee == self.id {
            debug!(
                self.logger,
                "already leader; ignored transferring leadership to self"
            );
            return;
        }
        info!(
            self.logger,
            "[term {term}] starts to transfer leadership to {lead_transferee}",
            term = self.term,
            lead_transferee = lead_transferee;
        );
        // The transfer must finish within one election timeout or be
        // abandoned, so the group does not sit leaderless on a lost target.
        self.election_elapsed = 0;
        self.lead_transferee = Some(lead_transferee);
        let pr = self.prs.get_mut(from).unwrap();
        if pr.matched == self.r.raft_log.last_index() {
            info!(
                self.r.logger,
                "sends MsgTimeoutNow to {lead_transferee} immediately as its log is up to date",
                lead_transferee = lead_transferee;
            );
            self.send_timeout_now(lead_transferee);
        } else {
            self.r.send_append(lead_transferee, pr, &mut self.msgs);
        }
    }

    fn handle_snapshot_status(&mut self, m: &Message) {
        let pr = match self.prs.get_mut(m.from) {
            Some(pr) => pr,
            None => {
                debug!(self.logger, "no progress available for {}", m.from);
                return;
            }
        };
        if pr.state != ProgressState::Snapshot {
            return;
        }
        if m.reject {
            pr.snapshot_failure();
            pr.become_probe();
            debug!(
                self.r.logger,
                "snapshot failed, resumed sending replication messages to {from}",
                from = m.from;
                "progress" => ?pr,
            );
        } else {
            pr.become_probe();
            debug!(
                self.r.logger,
                "snapshot succeeded, resumed sending replication messages to {from}",
                from = m.from;
                "progress" => ?pr,
            );
        }
        // After a delivered snapshot, wait for the append response before
        // probing again; after a failed one, wait out a heartbeat interval.
        pr.flow_paused = true;
    }

    fn handle_unreachable(&mut self, m: &Message) {
        let pr = match self.prs.get_mut(m.from) {
            Some(pr) => pr,
            None => {
                debug!(self.logger, "no progress available for {}", m.from);
                return;
            }
        };
        // An optimistically streamed append has likely been lost; fall back
        // to probing so match/next re-converge from acknowledgments.
        if pr.state == ProgressState::Replicate {
            pr.become_probe();
        }
        debug!(
            self.r.logger,
            "failed to send message to {from} because it is unreachable",
            from = m.from;
            "progress" => ?pr,
        );
    }

    fn step_leader(&mut self, mut m: Message) -> Result<()> {
        // Triggers and proposals that carry no per-peer progress.
        match m.get_msg_type() {
            MessageType::MsgBeat => {
                self.bcast_heartbeat();
                return Ok(());
            }
            MessageType::MsgCheckQuorum => {
                if !self.check_quorum_active() {
                    warn!(
                        self.logger,
                        "stepped down to follower since quorum is not active";
                    );
                    let term = self.term;
                    self.become_follower(term, INVALID_ID);
                }
                return Ok(());
            }
            MessageType::MsgPropose => {
                if m.entries.is_empty() {
                    fatal!(self.logger, "stepped empty MsgPropose");
                }
                if !self.prs.conf().voters().contains(self.id) {
                    // We were removed from the configuration while serving
                    // as leader; new proposals have nowhere safe to go.
                    return Err(Error::ProposalDropped);
                }
                if self.lead_transferee.is_some() {
                    debug!(
                        self.logger,
                        "[term {term}] transfer leadership to {lead_transferee} is in progress; dropping \
                         proposal",
                        term = self.term,
                        lead_transferee = self.lead_transferee.unwrap();
                    );
                    return Err(Error::ProposalDropped);
                }

                for (i, e) in m.entries.iter_mut().enumerate() {
                    if e.get_entry_type() == EntryType::EntryConfChange
                        || e.get_entry_type() == EntryType::EntryConfChangeV2
                    {
                        if self.has_pending_conf() {
                            info!(
                                self.logger,
                                "ignoring conf change; config is already pending";
                                "entry" => ?e,
                                "index" => self.pending_conf_index,
                                "applied" => self.raft_log.applied,
                            );
                            // Demote to an empty normal entry so indexes
                            // already promised to the proposer stay valid.
                            *e = Entry::default();
                            e.set_entry_type(EntryType::EntryNormal);
                        } else {
                            self.pending_conf_index = self.raft_log.last_index() + i as u64 + 1;
                        }
                    }
                }
                if !self.append_entry(&mut m.entries) {
                    // The uncommitted-payload ceiling refused the batch.
                    info!(
                        self.logger,
                        "dropping proposal over the uncommitted size ceiling";
                        "uncommitted" => self.uncommitted_size(),
                    );
                    return Err(Error::ProposalDropped);
                }
                self.bcast_append();
                return Ok(());
            }
            MessageType::MsgReadIndex => {
                if !self.commit_to_current_term() {
                    // Until an entry of this term commits, the leader cannot
                    // prove its commit index is current; the request is
                    // silently discarded and the client retries.
                    return Ok(());
                }

                let mut self_set = HashSet::default();
                self_set.insert(self.id);
                if !self.prs.has_quorum(&self_set) {
                    match self.read_only.option {
                        ReadOnlyOption::Safe => {
                            let ctx = m.entries[0].data.to_vec();
                            self.r
                                .read_only
                                .add_request(self.r.raft_log.committed, m, self.r.id);
                            self.bcast_heartbeat_with_ctx(Some(ctx));
                        }
                        ReadOnlyOption::LeaseBased => {
                            let read_index = self.raft_log.committed;
                            if let Some(m) = self.r.handle_ready_read_index(m, read_index) {
                                self.r.send(m, &mut self.msgs);
                            }
                        }
                    }
                } else {
                    // A quorum of one confirms itself.
                    let read_index = self.raft_log.committed;
                    if let Some(m) = self.r.handle_ready_read_index(m, read_index) {
                        self.r.send(m, &mut self.msgs);
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        match m.get_msg_type() {
            MessageType::MsgAppendResponse => self.handle_append_response(&m),
            MessageType::MsgHeartbeatResponse => self.handle_heartbeat_response(&m),
            MessageType::MsgSnapStatus => self.handle_snapshot_status(&m),
            MessageType::MsgUnreachable => self.handle_unreachable(&m),
            MessageType::MsgTransferLeader => self.handle_transfer_leader(&m),
            _ => {}
        }

        Ok(())
    }

    // Candidate and pre-candidate share a step function; they differ only in
    // which vote-response kind belongs to their round.
    fn step_candidate(&mut self, m: Message) -> Result<()> {
        match m.get_msg_type() {
            MessageType::MsgPropose => {
                info!(
                    self.logger,
                    "no leader at term {term}; dropping proposal",
                    term = self.term;
                );
                return Err(Error::ProposalDropped);
            }
            MessageType::MsgAppend => {
                debug_assert_eq!(self.term, m.term);
                self.become_follower(m.term, m.from);
                self.handle_append_entries(&m);
            }
            MessageType::MsgHeartbeat => {
                debug_assert_eq!(self.term, m.term);
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m);
            }
            MessageType::MsgSnapshot => {
                debug_assert_eq!(self.term, m.term);
                self.become_follower(m.term, m.from);
                self.handle_snapshot(m);
            }
            MessageType::MsgRequestPreVoteResponse | MessageType::MsgRequestVoteResponse => {
                // A candidate can still receive stale pre-vote responses
                // from its own pre-candidate phase; only responses matching
                // the current round count.
                if (self.state == StateRole::PreCandidate
                    && m.get_msg_type() != MessageType::MsgRequestPreVoteResponse)
                    || (self.state == StateRole::Candidate
                        && m.get_msg_type() != MessageType::MsgRequestVoteResponse)
                {
                    return Ok(());
                }
                self.poll(m.from, m.get_msg_type(), !m.reject);
            }
            MessageType::MsgTimeoutNow => debug!(
                self.logger,
                "{term} ignored MsgTimeoutNow from {from}",
                term = self.term,
                from = m.from;
                "state" => ?self.state,
            ),
            _ => {}
        }
        Ok(())
    }

    fn step_follower(&mut self, mut m: Message) -> Result<()> {
        match m.get_msg_type() {
            MessageType::MsgPropose => {
                if self.leader_id == INVALID_ID {
                    info!(
                        self.logger,
                        "no leader at term {term}; dropping proposal",
                        term = self.term;
                    );
                    return Err(Error::ProposalDropped);
                }
                m.to = self.leader_id;
                self.r.send(m, &mut self.msgs);
            }
            MessageType::MsgAppend => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_append_entries(&m);
            }
            MessageType::MsgHeartbeat => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_heartbeat(m);
            }
            MessageType::MsgSnapshot => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_snapshot(m);
            }
            MessageType::MsgTransferLeader => {
                if self.leader_id == INVALID_ID {
                    info!(
                        self.logger,
                        "no leader at term {term}; dropping leader transfer msg",
                        term = self.term;
                    );
                    return Ok(());
                }
                m.to = self.leader_id;
                self.r.send(m, &mut self.msgs);
            }
            MessageType::MsgTimeoutNow => {
                if self.promotable {
                    info!(
                        self.logger,
                        "[term {term}] received MsgTimeoutNow from {from} and starts an election to \
                         get leadership",
                        term = self.term,
                        from = m.from;
                    );
                    // Transfer campaigns skip pre-vote: the sender is a live
                    // leader stepping aside, not a possibly-partitioned
                    // stray, so the safety round is pure latency.
                    self.hup(true);
                } else {
                    info!(
                        self.logger,
                        "received MsgTimeoutNow from {} but is not promotable",
                        m.from;
                    );
                }
            }
            MessageType::MsgReadIndex => {
                if self.leader_id == INVALID_ID {
                    info!(
                        self.logger,
                        "no leader at term {term}; dropping index reading msg",
                        term = self.term;
                    );
                    return Ok(());
                }
                m.to = self.leader_id;
                self.r.send(m, &mut self.msgs);
            }
            MessageType::MsgReadIndexResp => {
                if m.entries.len() != 1 {
                    error!(
                        self.logger,
                        "invalid format of MsgReadIndexResp from {}",
                        m.from;
                        "entries count" => m.entries.len(),
                    );
                    return Ok(());
                }
                let rs = ReadState {
                    index: m.index,
                    request_ctx: m.take_entries()[0].take_data(),
                };
                self.read_states.push(rs);
                // The index is the leader's commit index, and the leader
                // only answers reads once it committed in its own term, so
                // the entry at that index carries the message's term.
                self.raft_log.maybe_commit(m.index, m.term);
            }
            _ => {}
        }
        Ok(())
    }

    /// Follower side of replication: verify the message matches our log,
    /// repair the divergence if there is one, and answer with our resulting
    /// last index (or a rejection carrying our actual last index as the
    /// hint).
    pub fn handle_append_entries(&mut self, m: &Message) {
        if m.index < self.raft_log.committed {
            // Already committed past the sender's view; just tell it where
            // we are.
            debug!(self.logger, "got message with lower index than committed");
            let mut to_send = Message::default();
            to_send.set_msg_type(MessageType::MsgAppendResponse);
            to_send.to = m.from;
            to_send.index = self.raft_log.committed;
            to_send.commit = self.raft_log.committed;
            self.r.send(to_send, &mut self.msgs);
            return;
        }

        let mut to_send = Message::default();
        to_send.to = m.from;
        to_send.set_msg_type(MessageType::MsgAppendResponse);

        if let Some((_, last_idx)) = self
            .r
            .raft_log
            .maybe_append(m.index, m.log_term, m.commit, &m.entries)
        {
            to_send.index = last_idx;
        } else {
            debug!(
                self.logger,
                "rejected append [logterm: {msg_log_term}, index: {msg_index}] from {from}",
                msg_log_term = m.log_term,
                msg_index = m.index,
                from = m.from;
                "index" => m.index,
                "logterm" => ?self.raft_log.term(m.index),
            );
            to_send.index = m.index;
            to_send.reject = true;
            to_send.reject_hint = self.raft_log.last_index();
        }

        to_send.commit = self.raft_log.committed;
        self.r.send(to_send, &mut self.msgs);
    }

    /// Follower side of heartbeats: adopt the (pre-clamped) commit hint and
    /// echo the context back so the leader can confirm reads.
    pub fn handle_heartbeat(&mut self, mut m: Message) {
        self.raft_log.commit_to(m.commit);
        let mut to_send = Message::default();
        to_send.set_msg_type(MessageType::MsgHeartbeatResponse);
        to_send.to = m.from;
        to_send.context = m.take_context();
        to_send.commit = self.raft_log.committed;
        self.r.send(to_send, &mut self.msgs);
    }

    fn handle_snapshot(&mut self, mut m: Message) {
        let metadata = m.get_snapshot().get_metadata();
        let (sindex, sterm) = (metadata.index, metadata.term);
        if self.restore(m.take_snapshot()) {
            info!(
                self.logger,
                "[commit: {commit}, term: {term}] restored snapshot [index: {snapshot_index}, term: {snapshot_term}]",
                term = self.term,
                commit = self.raft_log.committed,
                snapshot_index = sindex,
                snapshot_term = sterm;
            );
            let mut to_send = Message::default();
            to_send.set_msg_type(MessageType::MsgAppendResponse);
            to_send.to = m.from;
            to_send.index = self.raft_log.last_index();
            self.r.send(to_send, &mut self.msgs);
        } else {
            info!(
                self.logger,
                "[commit: {commit}] ignored snapshot [index: {snapshot_index}, term: {snapshot_term}]",
                commit = self.raft_log.committed,
                snapshot_index = sindex,
                snapshot_term = sterm;
            );
            let mut to_send = Message::default();
            to_send.set_msg_type(MessageType::MsgAppendResponse);
            to_send.to = m.from;
            to_send.index = self.raft_log.committed;
            self.r.send(to_send, &mut self.msgs);
        }
    }

    /// Resets the node onto `snap`: the log jumps to the snapshot's index
    /// and the configuration is replayed from its metadata. Returns false
    /// when the snapshot is stale or redundant (the response then reports
    /// the commit index instead of the snapshot index).
    pub fn restore(&mut self, snap: Snapshot) -> bool {
        if snap.get_metadata().index < self.raft_log.committed {
            return false;
        }
        if self.state != StateRole::Follower {
            // A leader or candidate stepped a snapshot; that means the
            // group has another leader, so step down and let the usual
            // term machinery sort it out.
            warn!(
                self.logger,
                "non-follower attempted to restore snapshot; becoming follower";
                "state" => ?self.state,
            );
            let term = self.term + 1;
            self.become_follower(term, INVALID_ID);
            return false;
        }

        let meta = snap.get_metadata();
        let cs = meta.get_conf_state();
        if !cs.voters.contains(&self.id)
            && !cs.learners.contains(&self.id)
            && !cs.voters_outgoing.contains(&self.id)
        {
            warn!(
                self.logger,
                "this node is not in the snapshot's configuration; ignoring snapshot";
                "snapshot index" => meta.index,
            );
            return false;
        }

        if self.raft_log.match_term(meta.index, meta.term) {
            // Our log already covers the snapshot; fast-forward the commit
            // watermark instead of discarding matching entries.
            info!(
                self.logger,
                "[commit: {commit}, lastindex: {last_index}, lastterm: {last_term}] fast-forwarded commit to \
                 snapshot [index: {snapshot_index}, term: {snapshot_term}]",
                commit = self.raft_log.committed,
                last_index = self.raft_log.last_index(),
                last_term = self.raft_log.last_term(),
                snapshot_index = meta.index,
                snapshot_term = meta.term;
            );
            self.raft_log.commit_to(meta.index);
            return false;
        }

        info!(
            self.logger,
            "[commit: {commit}, lastindex: {last_index}, lastterm: {last_term}] starts to \
             restore snapshot [index: {snapshot_index}, term: {snapshot_term}]",
            commit = self.raft_log.committed,
            last_index = self.raft_log.last_index(),
            last_term = self.raft_log.last_term(),
            snapshot_index = meta.index,
            snapshot_term = meta.term;
        );

        let cs = cs.clone();
        self.r.raft_log.restore(snap);

        // Rebuild the tracker from the snapshot's configuration.
        self.prs.clear();
        let next_idx = self.raft_log.last_index() + 1;
        if let Err(e) = confchange::restore(&mut self.prs, next_idx, &cs) {
            fatal!(
                self.r.logger,
                "unable to restore configuration from snapshot: {}",
                e
            );
        }
        let id = self.id;
        let pr = self.prs.get_mut(id).unwrap();
        pr.maybe_update(next_idx - 1);
        let new_cs = self.post_conf_change();
        if !conf_state_eq(&new_cs, &cs) {
            fatal!(self.r.logger, "invalid restore: {:?} != {:?}", cs, new_cs);
        }
        true
    }

    /// Applies a committed, already-decoded configuration change to this
    /// node, returning the resulting `ConfState` for the store to persist.
    ///
    /// # Panics
    ///
    /// Fatal when the change cannot be applied to the current configuration
    /// (it was validated at proposal time, so an invalid one here means the
    /// replicated state diverged).
    pub fn apply_conf_change(&mut self, cc: &ConfChangeV2) -> Result<ConfState> {
        let (cfg, changes) = {
            let mut changer = Changer::new(&self.prs);
            let res = if cc.leave_joint() {
                changer.leave_joint()
            } else if let Some(auto_leave) = cc.enter_joint() {
                changer.enter_joint(auto_leave, &cc.changes)
            } else {
                changer.simple(&cc.changes)
            };
            match res {
                Ok(conf_changes) => conf_changes,
                Err(e) => fatal!(self.logger, "unable to apply conf change: {}", e),
            }
        };
        let next_idx = self.raft_log.last_index() + 1;
        self.prs.apply_conf(cfg, changes, next_idx);
        Ok(self.post_conf_change())
    }

    // Reacts to a configuration that just changed under us, whichever path
    // installed it.
    fn post_conf_change(&mut self) -> ConfState {
        info!(self.logger, "switched to configuration"; "config" => ?self.prs.conf());
        let cs = self.prs.conf().to_conf_state();
        let is_voter = self.prs.conf().voters().contains(self.id);
        self.promotable = is_voter;
        if self.state != StateRole::Leader || cs.voters.is_empty() {
            return cs;
        }

        // The quorum may have shrunk; entries and pending reads can become
        // committable without any new acknowledgment.
        if self.maybe_commit() {
            self.bcast_append();
        } else {
            // Newly added peers need their first probe.
            let self_id = self.r.id;
            let core = &mut self.r;
            let msgs = &mut self.msgs;
            self.prs
                .iter_mut()
                .filter(|&(id, _)| *id != self_id)
                .for_each(|(id, pr)| {
                    core.maybe_send_append(*id, pr, false, msgs);
                });
        }
        if let Some(ctx) = self.read_only.last_pending_request_ctx() {
            let prs = &self.prs;
            if self
                .r
                .read_only
                .recv_ack(self.r.id, &ctx)
                .map_or(false, |acks| prs.has_quorum(acks))
            {
                for rs in self.r.read_only.advance(&ctx, &self.r.logger) {
                    if let Some(m) = self.r.handle_ready_read_index(rs.req, rs.index) {
                        self.r.send(m, &mut self.msgs);
                    }
                }
            }
        }

        // A transfer target that lost its voter seat can no longer lead.
        if self
            .lead_transferee
            .map_or(false, |e| !self.prs.conf().voters().contains(e))
        {
            self.abort_leader_transfer();
        }
        cs
    }

    /// Whether a configuration change might be in the log but unapplied.
    /// May answer yes conservatively.
    #[inline]
    pub fn has_pending_conf(&self) -> bool {
        self.pending_conf_index > self.raft_log.applied
    }

    /// Whether this node may campaign.
    pub fn promotable(&self) -> bool {
        self.promotable
    }

    /// Adopts a recovered hard state.
    ///
    /// # Panics
    ///
    /// Fatal if the recovered commit index lies outside the recovered log.
    pub fn load_state(&mut self, hs: &HardState) {
        if hs.commit < self.raft_log.committed || hs.commit > self.raft_log.last_index() {
            fatal!(
                self.logger,
                "hs.commit {} is out of range [{}, {}]",
                hs.commit,
                self.raft_log.committed,
                self.raft_log.last_index()
            )
        }
        self.raft_log.committed = hs.commit;
        self.term = hs.term;
        self.vote = hs.vote;
    }

    /// Whether the election timer has reached this term's randomized
    /// timeout.
    pub fn pass_election_timeout(&self) -> bool {
        self.election_elapsed >= self.randomized_election_timeout
    }

    /// Redraws the randomized election timeout. The randomness is what
    /// breaks ties between simultaneous candidates.
    pub fn reset_randomized_election_timeout(&mut self) {
        let prev_timeout = self.randomized_election_timeout;
        let timeout =
            rand::thread_rng().gen_range(self.min_election_timeout..self.max_election_timeout);
        debug!(
            self.logger,
            "reset election timeout {prev_timeout} -> {timeout} at {election_elapsed}",
            prev_timeout = prev_timeout,
            timeout = timeout,
            election_elapsed = self.election_elapsed;
        );
        self.randomized_election_timeout = timeout;
    }

    // Runs the check-quorum sweep from this leader's perspective.
    fn check_quorum_active(&mut self) -> bool {
        let self_id = self.id;
        self.prs.quorum_recently_active(self_id)
    }

    /// Orders `to` to campaign immediately, bypassing pre-vote.
    pub fn send_timeout_now(&mut self, to: u64) {
        let msg = new_message(to, MessageType::MsgTimeoutNow, None);
        self.r.send(msg, &mut self.msgs);
    }

    /// Abandons the leadership transfer in progress, if any.
    pub fn abort_leader_transfer(&mut self) {
        self.lead_transferee = None;
    }
}
