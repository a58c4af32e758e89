// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

//! Shared fixtures for the integration suite: message builders, a raft
//! wrapper that tolerates placeholder peers, and a simulated message-routing
//! network with drop/cut/isolate filters. All of this is test-only; the
//! production crate knows nothing about it.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use rand::Rng;
use slog::Logger;
use trellis_raft::prelude::*;
use trellis_raft::storage::MemStorage;
use trellis_raft::{Config, Raft, Result, NO_LIMIT};

/// Payload used by proposals throughout the suite.
pub const SOME_DATA: Option<&'static str> = Some("somedata");

pub fn new_entry(term: u64, index: u64, data: Option<&str>) -> Entry {
    Entry {
        term,
        index,
        data: data.map(|d| d.as_bytes().to_vec()).unwrap_or_default(),
        ..Default::default()
    }
}

pub fn empty_entry(term: u64, index: u64) -> Entry {
    new_entry(term, index, None)
}

pub fn new_message(from: u64, to: u64, t: MessageType, n: usize) -> Message {
    let mut m = Message {
        from,
        to,
        ..Default::default()
    };
    m.set_msg_type(t);
    if n > 0 {
        m.entries = (0..n).map(|_| new_entry(0, 0, SOME_DATA)).collect();
    }
    m
}

pub fn new_message_with_entries(from: u64, to: u64, t: MessageType, ents: Vec<Entry>) -> Message {
    let mut m = Message {
        from,
        to,
        entries: ents,
        ..Default::default()
    };
    m.set_msg_type(t);
    m
}

pub fn new_snapshot(index: u64, term: u64, voters: Vec<u64>) -> Snapshot {
    let mut s = Snapshot::default();
    s.mut_metadata().index = index;
    s.mut_metadata().term = term;
    s.mut_metadata().set_conf_state(ConfState::from((voters, vec![])));
    s
}

pub fn new_storage() -> MemStorage {
    MemStorage::new()
}

pub fn new_test_config(id: u64, election_tick: usize, heartbeat_tick: usize) -> Config {
    Config {
        id,
        election_tick,
        heartbeat_tick,
        max_size_per_msg: NO_LIMIT,
        max_inflight_msgs: 256,
        ..Default::default()
    }
}

/// Builds a raft whose storage is seeded with `peers` as voters (unless the
/// storage already carries a configuration).
pub fn new_test_raft(
    id: u64,
    peers: Vec<u64>,
    election_tick: usize,
    heartbeat_tick: usize,
    storage: MemStorage,
    l: &Logger,
) -> Interface {
    let config = new_test_config(id, election_tick, heartbeat_tick);
    if !storage.initial_state().unwrap().initialized() && !peers.is_empty() {
        storage.initialize_with_conf_state((peers, vec![]));
    }
    new_test_raft_with_config(&config, storage, l)
}

pub fn new_test_raft_with_prevote(
    id: u64,
    peers: Vec<u64>,
    election_tick: usize,
    heartbeat_tick: usize,
    storage: MemStorage,
    pre_vote: bool,
    l: &Logger,
) -> Interface {
    let mut config = new_test_config(id, election_tick, heartbeat_tick);
    config.pre_vote = pre_vote;
    if !storage.initial_state().unwrap().initialized() && !peers.is_empty() {
        storage.initialize_with_conf_state((peers, vec![]));
    }
    new_test_raft_with_config(&config, storage, l)
}

pub fn new_test_learner_raft(
    id: u64,
    peers: Vec<u64>,
    learners: Vec<u64>,
    election_tick: usize,
    heartbeat_tick: usize,
    storage: MemStorage,
    l: &Logger,
) -> Interface {
    if !storage.initial_state().unwrap().initialized() {
        storage.initialize_with_conf_state((peers, learners));
    }
    let config = new_test_config(id, election_tick, heartbeat_tick);
    new_test_raft_with_config(&config, storage, l)
}

pub fn new_test_raft_with_config(config: &Config, storage: MemStorage, l: &Logger) -> Interface {
    Interface::new(Raft::new(config, storage, l).unwrap())
}

/// A placeholder peer that swallows every message, standing in for a node
/// the test does not model.
pub const NOP_STEPPER: Option<Interface> = Some(Interface { raft: None });

/// A thin wrapper over `Raft<MemStorage>` that can also be a black hole
/// (`raft: None`), so network topologies may include unmodeled peers.
pub struct Interface {
    /// The wrapped raft, if any.
    pub raft: Option<Raft<MemStorage>>,
}

impl Interface {
    pub fn new(r: Raft<MemStorage>) -> Interface {
        Interface { raft: Some(r) }
    }

    pub fn step(&mut self, m: Message) -> Result<()> {
        match self.raft {
            Some(_) => Raft::step(self, m),
            None => Ok(()),
        }
    }

    pub fn read_messages(&mut self) -> Vec<Message> {
        match self.raft {
            Some(_) => self.msgs.drain(..).collect(),
            None => vec![],
        }
    }
}

impl Deref for Interface {
    type Target = Raft<MemStorage>;
    fn deref(&self) -> &Raft<MemStorage> {
        self.raft.as_ref().unwrap()
    }
}

impl DerefMut for Interface {
    fn deref_mut(&mut self) -> &mut Raft<MemStorage> {
        self.raft.as_mut().unwrap()
    }
}

#[derive(Default, Debug, PartialEq, Eq, Hash)]
struct Connem {
    from: u64,
    to: u64,
}

/// A simulated network of raft peers. No sockets: `send` steps messages
/// into recipients and keeps pumping until the exchange settles, subject to
/// the drop/ignore filters configured on the network.
#[derive(Default)]
pub struct Network {
    /// The peers, keyed by id (ids are assigned 1..=n in vector order).
    pub peers: HashMap<u64, Interface>,
    /// The shared storages backing the peers built by the network.
    pub storage: HashMap<u64, MemStorage>,
    dropm: HashMap<Connem, f64>,
    ignorem: HashMap<MessageType, bool>,
}

impl Network {
    /// Builds a network from `peers`; a `None` slot becomes a freshly
    /// created raft knowing every id in the network.
    pub fn new(peers: Vec<Option<Interface>>, l: &Logger) -> Network {
        Network::new_with_config(peers, false, l)
    }

    /// `new`, with pre-vote configurable on the rafts the network creates.
    pub fn new_with_config(
        mut peers: Vec<Option<Interface>>,
        pre_vote: bool,
        l: &Logger,
    ) -> Network {
        let size = peers.len();
        let peer_addrs: Vec<u64> = (1..=size as u64).collect();
        let mut nstorage = HashMap::new();
        let mut npeers = HashMap::new();
        for (p, id) in peers.drain(..).zip(peer_addrs.clone()) {
            match p {
                None => {
                    let storage = MemStorage::new_with_conf_state((peer_addrs.clone(), vec![]));
                    nstorage.insert(id, storage.clone());
                    let r = new_test_raft_with_prevote(
                        id,
                        peer_addrs.clone(),
                        10,
                        1,
                        storage,
                        pre_vote,
                        l,
                    );
                    npeers.insert(id, r);
                }
                Some(p) => {
                    npeers.insert(id, p);
                }
            }
        }
        Network {
            peers: npeers,
            storage: nstorage,
            ..Default::default()
        }
    }

    /// Swallows every message of the given kind from now on.
    pub fn ignore(&mut self, t: MessageType) {
        self.ignorem.insert(t, true);
    }

    /// Applies the drop/ignore filters to a batch of messages.
    pub fn filter(&self, msgs: impl IntoIterator<Item = Message>) -> Vec<Message> {
        msgs.into_iter()
            .filter(|m| {
                if self
                    .ignorem
                    .get(&m.get_msg_type())
                    .cloned()
                    .unwrap_or(false)
                {
                    return false;
                }
                // Hups never travel; a test leaking one is broken.
                assert_ne!(m.get_msg_type(), MessageType::MsgHup, "unexpected MsgHup");
                let perc = self
                    .dropm
                    .get(&Connem {
                        from: m.from,
                        to: m.to,
                    })
                    .cloned()
                    .unwrap_or(0f64);
                rand::thread_rng().gen::<f64>() >= perc
            })
            .collect()
    }

    /// Drains the pending outbound messages of every peer.
    pub fn read_messages(&mut self) -> Vec<Message> {
        self.peers
            .iter_mut()
            .flat_map(|(_peer, p)| p.read_messages())
            .collect()
    }

    /// Steps `msgs` into their recipients and keeps routing the responses
    /// until the network goes quiet.
    pub fn send(&mut self, msgs: Vec<Message>) {
        let mut msgs = msgs;
        while !msgs.is_empty() {
            let mut new_msgs = vec![];
            for m in msgs.drain(..) {
                let resp = {
                    let p = self.peers.get_mut(&m.to).unwrap();
                    let _ = p.step(m);
                    p.read_messages()
                };
                new_msgs.append(&mut self.filter(resp));
            }
            msgs.append(&mut new_msgs);
        }
    }

    /// Delivers `msgs` without gathering responses; errors propagate.
    pub fn dispatch(&mut self, msgs: impl IntoIterator<Item = Message>) -> Result<()> {
        for m in self.filter(msgs) {
            let to = m.to;
            let p = self.peers.get_mut(&to).unwrap();
            p.step(m)?;
        }
        Ok(())
    }

    /// Drops traffic from `from` to `to` with probability `perc` (1.0 = all).
    pub fn drop(&mut self, from: u64, to: u64, perc: f64) {
        self.dropm.insert(Connem { from, to }, perc);
    }

    /// Severs both directions between two peers.
    pub fn cut(&mut self, one: u64, other: u64) {
        self.drop(one, other, 1f64);
        self.drop(other, one, 1f64);
    }

    /// Severs a peer from everyone else.
    pub fn isolate(&mut self, id: u64) {
        for i in 0..self.peers.len() as u64 {
            let nid = i + 1;
            if nid != id {
                self.drop(id, nid, 1.0);
                self.drop(nid, id, 1.0);
            }
        }
    }

    /// Lifts every drop/ignore rule.
    pub fn recover(&mut self) {
        self.dropm = HashMap::new();
        self.ignorem = HashMap::new();
    }
}
