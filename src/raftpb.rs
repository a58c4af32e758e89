// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

//! The wire types of the replication protocol.
//!
//! These structs are the prost encoding of `trellis.raftpb`, committed to the
//! tree so that embedders do not need `protoc` to build the crate. The field
//! tags are stable and must never be reused; the transport encodes messages
//! with [`prost::Message`] and nothing else.

use std::borrow::Cow;

/// A single slot of the replicated log.
///
/// For `EntryNormal` entries `data` carries an opaque payload chosen by the
/// store above; the consensus core never inspects it. For the conf-change
/// entry types `data` carries an encoded [`ConfChange`] or [`ConfChangeV2`].
/// `context` is free for the proposer and travels with the entry unchanged.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Entry {
    #[prost(enumeration = "EntryType", tag = "1")]
    pub entry_type: i32,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub index: u64,
    #[prost(bytes, tag = "4")]
    pub data: ::std::vec::Vec<u8>,
    #[prost(bytes, tag = "5")]
    pub context: ::std::vec::Vec<u8>,
}

/// Metadata carried by a snapshot: the configuration as of the snapshot and
/// the log position it compacts up to (inclusive).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotMetadata {
    #[prost(message, optional, tag = "1")]
    pub conf_state: ::std::option::Option<ConfState>,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(uint64, tag = "3")]
    pub term: u64,
}

/// A point-in-time image of the applied state, used to catch up peers that
/// have fallen off the retained log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Snapshot {
    #[prost(bytes, tag = "1")]
    pub data: ::std::vec::Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub metadata: ::std::option::Option<SnapshotMetadata>,
}

/// The single message type exchanged between peers (and, for the local
/// trigger kinds, stepped into a node by its own driver). Which fields are
/// meaningful depends on `msg_type`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub msg_type: i32,
    #[prost(uint64, tag = "2")]
    pub to: u64,
    #[prost(uint64, tag = "3")]
    pub from: u64,
    #[prost(uint64, tag = "4")]
    pub term: u64,
    #[prost(uint64, tag = "5")]
    pub log_term: u64,
    #[prost(uint64, tag = "6")]
    pub index: u64,
    #[prost(message, repeated, tag = "7")]
    pub entries: ::std::vec::Vec<Entry>,
    #[prost(uint64, tag = "8")]
    pub commit: u64,
    #[prost(message, optional, tag = "9")]
    pub snapshot: ::std::option::Option<Snapshot>,
    #[prost(bool, tag = "10")]
    pub reject: bool,
    #[prost(uint64, tag = "11")]
    pub reject_hint: u64,
    #[prost(bytes, tag = "12")]
    pub context: ::std::vec::Vec<u8>,
}

/// The durable per-node state. Must be persisted before any message that
/// depends on it leaves the node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HardState {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub vote: u64,
    #[prost(uint64, tag = "3")]
    pub commit: u64,
}

/// The membership of the group. `voters_outgoing` is non-empty exactly while
/// a joint configuration is in effect; `learners_next` stages outgoing voters
/// that become learners when the joint state is left.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfState {
    #[prost(uint64, repeated, tag = "1")]
    pub voters: ::std::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "2")]
    pub learners: ::std::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "3")]
    pub voters_outgoing: ::std::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "4")]
    pub learners_next: ::std::vec::Vec<u64>,
    #[prost(bool, tag = "5")]
    pub auto_leave: bool,
}

/// The legacy single-step membership change.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfChange {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(enumeration = "ConfChangeType", tag = "2")]
    pub change_type: i32,
    #[prost(uint64, tag = "3")]
    pub node_id: u64,
    #[prost(bytes, tag = "4")]
    pub context: ::std::vec::Vec<u8>,
}

/// One step of a [`ConfChangeV2`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfChangeSingle {
    #[prost(enumeration = "ConfChangeType", tag = "1")]
    pub change_type: i32,
    #[prost(uint64, tag = "2")]
    pub node_id: u64,
}

/// A membership change that may alter several members at once, which forces
/// the group through a joint configuration.
///
/// With `Auto` transition and a single change the group skips the joint state
/// entirely; otherwise the joint state is entered and, for `Auto` and
/// `Implicit`, left automatically once the change entry is applied.
/// `Explicit` leaves the group in the joint state until an empty
/// `ConfChangeV2` is proposed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfChangeV2 {
    #[prost(enumeration = "ConfChangeTransition", tag = "1")]
    pub transition: i32,
    #[prost(message, repeated, tag = "2")]
    pub changes: ::std::vec::Vec<ConfChangeSingle>,
    #[prost(bytes, tag = "3")]
    pub context: ::std::vec::Vec<u8>,
}

/// The kind of an [`Entry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EntryType {
    EntryNormal = 0,
    EntryConfChange = 1,
    EntryConfChangeV2 = 2,
}

/// The kind of a [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    MsgHup = 0,
    MsgBeat = 1,
    MsgPropose = 2,
    MsgAppend = 3,
    MsgAppendResponse = 4,
    MsgRequestVote = 5,
    MsgRequestVoteResponse = 6,
    MsgSnapshot = 7,
    MsgHeartbeat = 8,
    MsgHeartbeatResponse = 9,
    MsgUnreachable = 10,
    MsgSnapStatus = 11,
    MsgCheckQuorum = 12,
    MsgTransferLeader = 13,
    MsgTimeoutNow = 14,
    MsgReadIndex = 15,
    MsgReadIndexResp = 16,
    MsgRequestPreVote = 17,
    MsgRequestPreVoteResponse = 18,
}

/// The operation of a [`ConfChangeSingle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConfChangeType {
    AddNode = 0,
    RemoveNode = 1,
    AddLearnerNode = 2,
}

/// How a [`ConfChangeV2`] moves through the joint configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConfChangeTransition {
    /// Joint only if more than one change is requested; left automatically.
    Auto = 0,
    /// Joint always; left automatically.
    Implicit = 1,
    /// Joint always; left only by an explicit empty change.
    Explicit = 2,
}

static SNAPSHOT_METADATA_DEFAULT: SnapshotMetadata = SnapshotMetadata {
    conf_state: None,
    index: 0,
    term: 0,
};

static SNAPSHOT_DEFAULT: Snapshot = Snapshot {
    data: Vec::new(),
    metadata: None,
};

static CONF_STATE_DEFAULT: ConfState = ConfState {
    voters: Vec::new(),
    learners: Vec::new(),
    voters_outgoing: Vec::new(),
    learners_next: Vec::new(),
    auto_leave: false,
};

impl Entry {
    /// The decoded entry type.
    #[inline]
    pub fn get_entry_type(&self) -> EntryType {
        EntryType::from_i32(self.entry_type).unwrap_or(EntryType::EntryNormal)
    }

    /// Takes the payload out of the entry, leaving it empty.
    #[inline]
    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl Message {
    /// The decoded message type.
    #[inline]
    pub fn get_msg_type(&self) -> MessageType {
        MessageType::from_i32(self.msg_type).unwrap_or(MessageType::MsgHup)
    }

    /// Takes the entries out of the message.
    #[inline]
    pub fn take_entries(&mut self) -> Vec<Entry> {
        std::mem::take(&mut self.entries)
    }

    /// Takes the context out of the message.
    #[inline]
    pub fn take_context(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.context)
    }

    /// The attached snapshot, or an empty one.
    #[inline]
    pub fn get_snapshot(&self) -> &Snapshot {
        self.snapshot.as_ref().unwrap_or(&SNAPSHOT_DEFAULT)
    }

    /// Takes the snapshot out of the message, leaving an empty one.
    #[inline]
    pub fn take_snapshot(&mut self) -> Snapshot {
        self.snapshot.take().unwrap_or_default()
    }

    /// Attaches a snapshot.
    #[inline]
    pub fn set_snapshot(&mut self, snap: Snapshot) {
        self.snapshot = Some(snap);
    }
}

impl Snapshot {
    /// The metadata, or an empty one for the default snapshot.
    #[inline]
    pub fn get_metadata(&self) -> &SnapshotMetadata {
        self.metadata.as_ref().unwrap_or(&SNAPSHOT_METADATA_DEFAULT)
    }

    /// Mutable access to the metadata, materializing it if absent.
    #[inline]
    pub fn mut_metadata(&mut self) -> &mut SnapshotMetadata {
        self.metadata.get_or_insert_with(SnapshotMetadata::default)
    }

    /// A snapshot is empty when it does not cover any log index. Empty
    /// snapshots never travel between peers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.get_metadata().index == 0
    }
}

impl SnapshotMetadata {
    /// The configuration stored in the metadata, or an empty one.
    #[inline]
    pub fn get_conf_state(&self) -> &ConfState {
        self.conf_state.as_ref().unwrap_or(&CONF_STATE_DEFAULT)
    }

    /// Stores the configuration.
    #[inline]
    pub fn set_conf_state(&mut self, cs: ConfState) {
        self.conf_state = Some(cs);
    }
}

impl<Iter1, Iter2> From<(Iter1, Iter2)> for ConfState
where
    Iter1: IntoIterator<Item = u64>,
    Iter2: IntoIterator<Item = u64>,
{
    fn from((voters, learners): (Iter1, Iter2)) -> Self {
        ConfState {
            voters: voters.into_iter().collect(),
            learners: learners.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// Whether two conf states describe the same membership, ignoring ordering.
pub fn conf_state_eq(lhs: &ConfState, rhs: &ConfState) -> bool {
    fn sorted(ids: &[u64]) -> Vec<u64> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids
    }
    lhs.auto_leave == rhs.auto_leave
        && sorted(&lhs.voters) == sorted(&rhs.voters)
        && sorted(&lhs.learners) == sorted(&rhs.learners)
        && sorted(&lhs.voters_outgoing) == sorted(&rhs.voters_outgoing)
        && sorted(&lhs.learners_next) == sorted(&rhs.learners_next)
}

/// Builds a [`ConfChangeSingle`].
pub fn new_conf_change_single(node_id: u64, ty: ConfChangeType) -> ConfChangeSingle {
    ConfChangeSingle {
        node_id,
        change_type: ty as i32,
    }
}

impl ConfChange {
    /// The decoded change type.
    #[inline]
    pub fn get_change_type(&self) -> ConfChangeType {
        ConfChangeType::from_i32(self.change_type).unwrap_or(ConfChangeType::AddNode)
    }

}

impl ConfChangeSingle {
    /// The decoded change type.
    #[inline]
    pub fn get_change_type(&self) -> ConfChangeType {
        ConfChangeType::from_i32(self.change_type).unwrap_or(ConfChangeType::AddNode)
    }
}

impl ConfChangeV2 {
    /// The decoded transition.
    #[inline]
    pub fn get_transition(&self) -> ConfChangeTransition {
        ConfChangeTransition::from_i32(self.transition).unwrap_or(ConfChangeTransition::Auto)
    }

    /// Whether applying this change enters a joint configuration and, if so,
    /// whether it should be left automatically. `None` means the change is
    /// simple and skips the joint state.
    pub fn enter_joint(&self) -> Option<bool> {
        if self.get_transition() != ConfChangeTransition::Auto || self.changes.len() > 1 {
            match self.get_transition() {
                ConfChangeTransition::Auto | ConfChangeTransition::Implicit => Some(true),
                ConfChangeTransition::Explicit => Some(false),
            }
        } else {
            None
        }
    }

    /// Whether this change requests leaving the joint configuration: an empty
    /// change with the `Auto` transition.
    #[inline]
    pub fn leave_joint(&self) -> bool {
        self.get_transition() == ConfChangeTransition::Auto && self.changes.is_empty()
    }
}

/// Abstracts over the two conf-change encodings so that the driving API can
/// accept either. A v1 change is upgraded to the equivalent single-step v2
/// change; v2 is the native representation.
pub trait ConfChangeI {
    /// Converts into the v2 representation.
    fn into_v2(self) -> ConfChangeV2;

    /// Borrows (or builds) the v2 representation.
    fn as_v2(&self) -> Cow<'_, ConfChangeV2>;

    /// The v1 representation, when this is one.
    fn as_v1(&self) -> Option<&ConfChange>;
}

impl ConfChangeI for ConfChange {
    fn into_v2(self) -> ConfChangeV2 {
        ConfChangeV2 {
            transition: ConfChangeTransition::Auto as i32,
            changes: vec![new_conf_change_single(self.node_id, self.get_change_type())],
            context: self.context,
        }
    }

    fn as_v2(&self) -> Cow<'_, ConfChangeV2> {
        Cow::Owned(self.clone().into_v2())
    }

    fn as_v1(&self) -> Option<&ConfChange> {
        Some(self)
    }
}

impl ConfChangeI for ConfChangeV2 {
    fn into_v2(self) -> ConfChangeV2 {
        self
    }

    fn as_v2(&self) -> Cow<'_, ConfChangeV2> {
        Cow::Borrowed(self)
    }

    fn as_v1(&self) -> Option<&ConfChange> {
        None
    }
}
