// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

mod test_membership_changes;
mod test_raft;
mod test_raft_snap;
mod test_raw_node;
