// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use std::{cmp, io};

use thiserror::Error;

/// The base error type of the consensus core.
///
/// Everything here is a *recoverable refusal*: the caller asked for something
/// the core cannot do right now (or ever), and the core's own state is
/// untouched. Broken invariants never surface as an `Error`; they abort
/// through the crate's fatal path instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is invalid.
    #[error("raft: invalid configuration: {0}")]
    ConfigInvalid(String),
    /// An IO error occurred.
    #[error("raft: io error: {0}")]
    Io(#[from] io::Error),
    /// A local trigger kind was received over the network.
    #[error("raft: cannot step raft local message")]
    StepLocalMsg,
    /// The message's sender is not tracked by any progress, so the response
    /// cannot be attributed.
    #[error("raft: cannot step as peer not found")]
    StepPeerNotFound,
    /// The proposal was refused and not appended. Callers may retry against
    /// the current leader once one is known.
    #[error("raft: proposal dropped")]
    ProposalDropped,
    /// The storage adapter failed.
    #[error("raft: storage error: {0}")]
    Store(#[from] StorageError),
    /// A protocol payload failed to decode.
    #[error("raft: codec error: {0}")]
    CodecError(#[from] prost::DecodeError),
    /// The requested membership change cannot be applied to the current
    /// configuration.
    #[error("raft: conf change error: {0}")]
    ConfChangeError(String),
    /// The node exists, but should not.
    #[error("raft: node {0} already exists in the {1} set")]
    Exists(u64, &'static str),
    /// The node does not exist, but should.
    #[error("raft: node {0} is not in the {1} set")]
    NotExists(u64, &'static str),
}

impl cmp::PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::StepPeerNotFound, Error::StepPeerNotFound) => true,
            (Error::StepLocalMsg, Error::StepLocalMsg) => true,
            (Error::ProposalDropped, Error::ProposalDropped) => true,
            (Error::Store(e1), Error::Store(e2)) => e1 == e2,
            (Error::Io(e1), Error::Io(e2)) => e1.kind() == e2.kind(),
            (Error::ConfigInvalid(e1), Error::ConfigInvalid(e2)) => e1 == e2,
            (Error::ConfChangeError(e1), Error::ConfChangeError(e2)) => e1 == e2,
            (Error::Exists(id1, set1), Error::Exists(id2, set2)) => id1 == id2 && set1 == set2,
            (Error::NotExists(id1, set1), Error::NotExists(id2, set2)) => {
                id1 == id2 && set1 == set2
            }
            _ => false,
        }
    }
}

/// An error reported by the storage adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested range was compacted into a snapshot.
    #[error("log compacted")]
    Compacted,
    /// The requested range is past the end of the durable log.
    #[error("log unavailable")]
    Unavailable,
    /// The available snapshot does not reach the requested index.
    #[error("snapshot out of date")]
    SnapshotOutOfDate,
    /// The snapshot is being generated and is not ready to ship.
    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,
    /// Some other error occurred.
    #[error("unknown storage error: {0}")]
    Other(#[from] Box<dyn std::error::Error + Sync + Send>),
}

impl cmp::PartialEq for StorageError {
    fn eq(&self, other: &StorageError) -> bool {
        matches!(
            (self, other),
            (StorageError::Compacted, StorageError::Compacted)
                | (StorageError::Unavailable, StorageError::Unavailable)
                | (
                    StorageError::SnapshotOutOfDate,
                    StorageError::SnapshotOutOfDate
                )
                | (
                    StorageError::SnapshotTemporarilyUnavailable,
                    StorageError::SnapshotTemporarilyUnavailable,
                )
        )
    }
}

/// A result type that wraps up the consensus errors.
pub type Result<T> = std::result::Result<T, Error>;
