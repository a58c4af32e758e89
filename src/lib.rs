// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

/*!
The replicated-log consensus core of the Trellis graph store.

Trellis keeps every mutation of the graph (vertex and edge writes, schema
updates, bulk-import batches) in a strongly-ordered, fault-tolerant log that
is replicated across the nodes of a group with the Raft protocol. This crate
is that log's decision maker: a deterministic, single-threaded state machine
that elects a leader, replicates entries, repairs diverged followers, ships
snapshots to peers that have fallen off the retained log, and reconfigures
the group through joint consensus.

The crate deliberately stops at the consensus boundary. It does not know what
the payload bytes mean, does not persist anything itself, does not own a
network socket and does not schedule timers. The surrounding storage layer
drives it through [`RawNode`]: deliver inbound messages with `step`, advance
the logical clock with `tick`, and after each call drain a [`Ready`], the
batch of entries to persist, entries to apply and messages to send, then
acknowledge it with `advance`.

```no_run
use trellis_raft::{prelude::*, storage::MemStorage};

let config = Config {
    id: 1,
    ..Default::default()
};
let storage = MemStorage::new_with_conf_state((vec![1], vec![]));
let logger = trellis_raft::default_logger();
let mut node = RawNode::new(&config, storage, &logger).unwrap();
node.campaign().unwrap();
```

Determinism is load-bearing: given the same configuration, the same storage
contents and the same message sequence, two instances produce identical
outputs. All randomness is confined to the election timeout, which is fixed
at `reset` time and can be pinned by tests.
*/

#![deny(clippy::all)]
#![recursion_limit = "128"]

#[macro_use]
extern crate getset;
#[macro_use]
extern crate slog;

/// Emits a critical-level log line and aborts via panic.
///
/// Reserved for broken safety invariants (a commit index past the end of the
/// log, a configuration with no voters, an impossible storage answer).
/// Continuing past any of these risks corrupting the replicated state.
macro_rules! fatal {
    ($logger:expr, $msg:expr) => {{
        let msg = format!("{}", $msg);
        crit!($logger, "{}", msg);
        panic!("{}", msg)
    }};
    ($logger:expr, $fmt:expr, $($arg:tt)+) => {{
        fatal!($logger, format!($fmt, $($arg)+))
    }};
}

mod config;
mod confchange;
mod errors;
mod log_unstable;
mod quorum;
mod raft;
mod raft_log;
pub mod raftpb;
mod raw_node;
mod read_only;
mod status;
pub mod storage;
mod tracker;
pub mod util;

pub use self::config::Config;
pub use self::confchange::{Changer, MapChange, MapChangeType};
pub use self::errors::{Error, Result, StorageError};
pub use self::log_unstable::Unstable;
pub use self::quorum::joint::Configuration as JointConfig;
pub use self::quorum::majority::Configuration as MajorityConfig;
pub use self::quorum::{AckIndexer, AckedIndexer, VoteResult};
pub use self::raft::{
    vote_resp_msg_type, Raft, RaftCore, SoftState, StateRole, CAMPAIGN_ELECTION,
    CAMPAIGN_PRE_ELECTION, CAMPAIGN_TRANSFER, INVALID_ID, INVALID_INDEX,
};
pub use self::raft_log::RaftLog;
pub use self::raw_node::{is_local_msg, RawNode, Ready, SnapshotStatus};
pub use self::read_only::{ReadOnlyOption, ReadState};
pub use self::status::Status;
pub use self::storage::{RaftState, Storage};
pub use self::tracker::{Configuration, Inflights, Progress, ProgressState, ProgressTracker};
pub use self::util::NO_LIMIT;

use std::hash::BuildHasherDefault;

/// The default hasher for the maps and sets this crate keys by peer id.
///
/// Peer ids are small integers chosen by the application; fx hashing them is
/// measurably cheaper than SipHash and the keys are not attacker-controlled.
pub type DefaultHashBuilder = BuildHasherDefault<fxhash::FxHasher>;
/// A `HashMap` using the default hasher.
pub type HashMap<K, V> = std::collections::HashMap<K, V, DefaultHashBuilder>;
/// A `HashSet` using the default hasher.
pub type HashSet<K> = std::collections::HashSet<K, DefaultHashBuilder>;

/// The number of acknowledgments that constitutes a majority of `total`.
#[inline]
pub fn majority(total: usize) -> usize {
    (total / 2) + 1
}

/// A convenience prelude re-exporting the types nearly every embedder needs.
pub mod prelude {
    //! ```
    //! use trellis_raft::prelude::*;
    //! ```

    pub use crate::raftpb::{
        ConfChange, ConfChangeSingle, ConfChangeTransition, ConfChangeType, ConfChangeV2,
        ConfState, Entry, EntryType, HardState, Message, MessageType, Snapshot, SnapshotMetadata,
    };

    pub use crate::config::Config;
    pub use crate::raft::{Raft, SoftState, StateRole};
    pub use crate::raw_node::{RawNode, Ready, SnapshotStatus};
    pub use crate::read_only::{ReadOnlyOption, ReadState};
    pub use crate::status::Status;
    pub use crate::storage::{RaftState, Storage};
    pub use crate::tracker::Progress;
}

/// The global logger used when a caller does not supply one.
///
/// Honors `RUST_LOG` through `slog-envlogger` and prints through an async
/// terminal drain shared for the lifetime of the process. Primarily for
/// tests and examples; production embedders pass their own logger.
#[cfg(feature = "default-logger")]
pub fn default_logger() -> slog::Logger {
    use slog::Drain;
    use std::sync::OnceLock;

    static LOGGER: OnceLock<slog::Logger> = OnceLock::new();
    LOGGER
        .get_or_init(|| {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build();
            let drain = slog_envlogger::new(drain);
            let drain = slog_async::Async::new(drain.fuse())
                .chan_size(4096)
                .overflow_strategy(slog_async::OverflowStrategy::Block)
                .build()
                .fuse();
            slog::Logger::root(drain, o!())
        })
        .clone()
}
