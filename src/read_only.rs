// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

//! Bookkeeping for linearizable reads.

use std::collections::VecDeque;

use slog::Logger;

use crate::raftpb::Message;
use crate::{HashMap, HashSet};

/// How a read-only request is proven linearizable.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ReadOnlyOption {
    /// Confirms the leader's commit index with a heartbeat round-trip to a
    /// quorum before releasing the read. Always safe; the default.
    #[default]
    Safe,
    /// Trusts the leader lease instead of a round-trip. Cheaper, but unsound
    /// under unbounded clock drift, since the lease is a claim about time.
    LeaseBased,
}

/// A read request the leader has proven safe: once the application has
/// applied up to `index`, it may serve the read identified by `request_ctx`.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct ReadState {
    /// The commit index recorded when the request arrived.
    pub index: u64,
    /// The caller-supplied correlation token. Requests and confirmations
    /// pair up by this token, not by any separate id.
    pub request_ctx: Vec<u8>,
}

/// A read request still waiting for its quorum of heartbeat responses.
#[derive(Default, Debug, Clone)]
pub struct ReadIndexStatus {
    /// The original request message, kept to answer the requester.
    pub req: Message,
    /// The leader's commit index when the request was accepted.
    pub index: u64,
    /// Who has confirmed the heartbeat carrying this request's context.
    pub acks: HashSet<u64>,
}

/// The FIFO of read requests in flight. Requests confirm in arrival order:
/// a quorum for a later request implicitly confirms every earlier one.
#[derive(Default, Debug, Clone)]
pub struct ReadOnly {
    /// The configured confirmation mode.
    pub option: ReadOnlyOption,
    pub(crate) pending_read_index: HashMap<Vec<u8>, ReadIndexStatus>,
    pub(crate) read_index_queue: VecDeque<Vec<u8>>,
}

impl ReadOnly {
    pub(crate) fn new(option: ReadOnlyOption) -> ReadOnly {
        ReadOnly {
            option,
            pending_read_index: HashMap::default(),
            read_index_queue: VecDeque::new(),
        }
    }

    /// Enqueues a read request received at commit index `index`. A context
    /// already in flight is not enqueued twice; its first confirmation will
    /// answer both arrivals.
    pub fn add_request(&mut self, index: u64, req: Message, self_id: u64) {
        let ctx = {
            let key: &[u8] = req.entries[0].data.as_ref();
            if self.pending_read_index.contains_key(key) {
                return;
            }
            key.to_vec()
        };
        let mut acks = HashSet::default();
        acks.insert(self_id);
        let status = ReadIndexStatus { req, index, acks };
        self.pending_read_index.insert(ctx.clone(), status);
        self.read_index_queue.push_back(ctx);
    }

    /// Records that `id` answered the heartbeat carrying `ctx`. Returns the
    /// ack set so the caller can test it for quorum.
    pub fn recv_ack(&mut self, id: u64, ctx: &[u8]) -> Option<&HashSet<u64>> {
        self.pending_read_index.get_mut(ctx).map(|rs| {
            rs.acks.insert(id);
            &rs.acks
        })
    }

    /// Dequeues every request up to and including the one identified by
    /// `ctx`, in arrival order. Returns nothing if `ctx` is not pending.
    pub fn advance(&mut self, ctx: &[u8], logger: &Logger) -> Vec<ReadIndexStatus> {
        let mut rss = vec![];
        if let Some(i) = self.read_index_queue.iter().position(|x| {
            if !self.pending_read_index.contains_key(x) {
                fatal!(logger, "cannot find corresponding read state from pending map");
            }
            *x == ctx
        }) {
            for _ in 0..=i {
                let rs = self.read_index_queue.pop_front().unwrap();
                let status = self.pending_read_index.remove(&rs).unwrap();
                rss.push(status);
            }
        }
        rss
    }

    /// The context of the most recently enqueued request, if any. Heartbeats
    /// carry this so one round-trip confirms the whole queue.
    pub fn last_pending_request_ctx(&self) -> Option<Vec<u8>> {
        self.read_index_queue.back().cloned()
    }

    /// How many requests are waiting for confirmation.
    #[inline]
    pub fn pending_read_count(&self) -> usize {
        self.read_index_queue.len()
    }
}
