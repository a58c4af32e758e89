// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

pub use super::read_only::{ReadOnlyOption, ReadState};
use super::{
    errors::{Error, Result},
    util::NO_LIMIT,
    INVALID_ID,
};

/// The parameters a consensus instance starts with.
#[derive(Clone)]
pub struct Config {
    /// The identity of the local node. It cannot be 0 and must be unique in
    /// the group.
    pub id: u64,

    /// The number of `tick` calls that must pass between elections. A
    /// follower that hears nothing from a leader for this many ticks starts
    /// campaigning. Must be larger than `heartbeat_tick`; ten heartbeats per
    /// election timeout is a reasonable ratio.
    pub election_tick: usize,

    /// The number of `tick` calls between leader heartbeats.
    pub heartbeat_tick: usize,

    /// The index the store had already applied before this restart. Entries
    /// at or below it are never handed out for application again. Only set
    /// when restarting.
    pub applied: u64,

    /// Upper bound, in encoded bytes, on the entries packed into a single
    /// append message. Smaller values cheapen probing and message loss at the
    /// cost of steady-state throughput. 0 allows one entry per message.
    pub max_size_per_msg: u64,

    /// How many append messages may be in flight to one peer during
    /// optimistic replication. Sized to avoid overflowing the transport's
    /// send buffer.
    pub max_inflight_msgs: usize,

    /// Optional payload-byte bound across a peer's in-flight appends,
    /// on top of the message-count bound. 0 disables it.
    pub max_inflight_bytes: u64,

    /// Ceiling on the combined payload size of proposed-but-uncommitted
    /// entries on the leader. Proposals that would cross it are dropped, not
    /// queued. A lone oversized proposal is still admitted when nothing is
    /// uncommitted, so the ceiling cannot wedge the group.
    pub max_uncommitted_size: u64,

    /// Whether the leader verifies, once per election timeout, that it has
    /// heard from a quorum, stepping down otherwise.
    pub check_quorum: bool,

    /// Enables the pre-vote round: a node asks whether it *could* win before
    /// bumping its term, so a rejoining partitioned node cannot disrupt a
    /// working leader.
    pub pre_vote: bool,

    /// Lower bound of the randomized election timeout, in ticks. 0 means
    /// `election_tick`.
    pub min_election_tick: usize,

    /// Upper bound (exclusive) of the randomized election timeout, in ticks.
    /// 0 means `2 * election_tick`.
    pub max_election_tick: usize,

    /// How linearizable reads are confirmed: `Safe` proves the commit index
    /// with a heartbeat round-trip to a quorum; `LeaseBased` trusts the
    /// leader lease and requires `check_quorum`.
    pub read_only_option: ReadOnlyOption,

    /// Folds consecutive appends to the same peer into one message when the
    /// entry ranges are contiguous.
    pub batch_append: bool,
}

impl Default for Config {
    fn default() -> Self {
        const HEARTBEAT_TICK: usize = 2;
        Self {
            id: 0,
            election_tick: HEARTBEAT_TICK * 10,
            heartbeat_tick: HEARTBEAT_TICK,
            applied: 0,
            max_size_per_msg: 0,
            max_inflight_msgs: 256,
            max_inflight_bytes: 0,
            max_uncommitted_size: NO_LIMIT,
            check_quorum: false,
            pre_vote: false,
            min_election_tick: 0,
            max_election_tick: 0,
            read_only_option: ReadOnlyOption::Safe,
            batch_append: false,
        }
    }
}

impl Config {
    /// Creates a new config with the given id.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// The minimum number of ticks before an election.
    #[inline]
    pub fn min_election_tick(&self) -> usize {
        if self.min_election_tick == 0 {
            self.election_tick
        } else {
            self.min_election_tick
        }
    }

    /// The maximum number of ticks before an election.
    #[inline]
    pub fn max_election_tick(&self) -> usize {
        if self.max_election_tick == 0 {
            2 * self.election_tick
        } else {
            self.max_election_tick
        }
    }

    /// Runs validations against the config.
    pub fn validate(&self) -> Result<()> {
        if self.id == INVALID_ID {
            return Err(Error::ConfigInvalid("invalid node id".to_owned()));
        }

        if self.heartbeat_tick == 0 {
            return Err(Error::ConfigInvalid(
                "heartbeat tick must be greater than 0".to_owned(),
            ));
        }

        if self.election_tick <= self.heartbeat_tick {
            return Err(Error::ConfigInvalid(
                "election tick must be greater than heartbeat tick".to_owned(),
            ));
        }

        let min_timeout = self.min_election_tick();
        let max_timeout = self.max_election_tick();
        if min_timeout < self.election_tick {
            return Err(Error::ConfigInvalid(format!(
                "min election tick {} must not be less than election tick {}",
                min_timeout, self.election_tick
            )));
        }

        if min_timeout >= max_timeout {
            return Err(Error::ConfigInvalid(format!(
                "min election tick {} should be less than max election tick {}",
                min_timeout, max_timeout
            )));
        }

        if self.max_inflight_msgs == 0 {
            return Err(Error::ConfigInvalid(
                "max inflight messages must be greater than 0".to_owned(),
            ));
        }

        if self.max_uncommitted_size < self.max_size_per_msg {
            return Err(Error::ConfigInvalid(
                "max uncommitted size should not be less than max size per message".to_owned(),
            ));
        }

        if self.read_only_option == ReadOnlyOption::LeaseBased && !self.check_quorum {
            return Err(Error::ConfigInvalid(
                "read_only_option == LeaseBased requires check_quorum == true".into(),
            ));
        }

        Ok(())
    }
}
