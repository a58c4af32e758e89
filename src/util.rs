// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

//! Small helpers shared by the log, tracker and state machine.

use std::fmt::Write;

use prost::Message as ProstMsg;

use crate::raftpb::{Entry, Message};
use crate::HashSet;

/// A number to represent that there is no limit.
pub const NO_LIMIT: u64 = u64::MAX;

/// Truncates `entries` so that their combined encoded size stays within
/// `max`, always keeping at least the first entry so that progress is made
/// even when a single entry exceeds the budget.
pub fn limit_size<T: ProstMsg + Clone>(entries: &mut Vec<T>, max: Option<u64>) {
    if entries.len() <= 1 {
        return;
    }
    let max = match max {
        None | Some(NO_LIMIT) => return,
        Some(max) => max,
    };

    let mut size = 0;
    let limit = entries
        .iter()
        .take_while(|&e| {
            if size == 0 {
                // The first entry is counted but never dropped.
                size += e.encoded_len() as u64;
                return true;
            }
            size += e.encoded_len() as u64;
            size <= max
        })
        .count();

    entries.truncate(limit);
}

/// The payload bytes a single entry contributes to flow-control accounting.
///
/// Only the opaque payload counts: index, term and framing overhead are not
/// charged against the uncommitted-size and inflight-byte ceilings, matching
/// what the ceilings are configured in terms of.
#[inline]
pub fn entry_payload_size(e: &Entry) -> u64 {
    e.data.len() as u64
}

/// The combined payload size of a batch of entries.
#[inline]
pub fn payloads_size(ents: &[Entry]) -> u64 {
    ents.iter().map(entry_payload_size).sum()
}

/// Whether `ents` continues exactly where the entries already in `msg` stop.
/// Only contiguous runs may be folded into one append message.
pub fn is_continuous_ents(msg: &Message, ents: &[Entry]) -> bool {
    if !msg.entries.is_empty() && !ents.is_empty() {
        let expected_next_idx = msg.entries.last().unwrap().index + 1;
        return expected_next_idx == ents.first().unwrap().index;
    }
    true
}

/// A view over the union of two id sets, used for joint configurations
/// without materializing the combined set.
pub struct Union<'a> {
    first: &'a HashSet<u64>,
    second: &'a HashSet<u64>,
}

impl<'a> Union<'a> {
    /// Creates a union view of the two sets.
    pub fn new(first: &'a HashSet<u64>, second: &'a HashSet<u64>) -> Union<'a> {
        Union { first, second }
    }

    /// Whether `id` is in either set.
    #[inline]
    pub fn contains(&self, id: u64) -> bool {
        self.first.contains(&id) || self.second.contains(&id)
    }

    /// Iterates the union.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.first.union(self.second).cloned()
    }

    /// Whether both sets are empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// The number of distinct ids in the union.
    #[inline]
    pub fn len(&self) -> usize {
        self.first.union(self.second).count()
    }
}

impl std::fmt::Display for Union<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.iter().collect();
        ids.sort_unstable();
        let mut s = String::from("(");
        for (i, id) in ids.iter().enumerate() {
            if i != 0 {
                s.push(' ');
            }
            write!(s, "{}", id).unwrap();
        }
        s.push(')');
        f.write_str(&s)
    }
}
