// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

use crate::raftpb::{ConfChangeSingle, ConfChangeType};
use crate::tracker::{Configuration, ProgressMap, ProgressTracker};
use crate::{Error, Result};

/// One edit to the progress map.
pub enum MapChangeType {
    /// Start tracking the peer.
    Add,
    /// Stop tracking the peer.
    Remove,
}

/// The progress-map edits a configuration change implies, in order.
pub type MapChange = Vec<(u64, MapChangeType)>;

/// Staged progress-map edits over a read-only base map. Changes accumulate
/// here while the new configuration is validated, and are handed to the
/// tracker only once everything checks out.
struct StagedMap<'a> {
    changes: MapChange,
    base: &'a ProgressMap,
}

impl StagedMap<'_> {
    fn into_changes(self) -> MapChange {
        self.changes
    }

    fn contains(&self, id: u64) -> bool {
        match self.changes.iter().rfind(|(i, _)| *i == id) {
            Some((_, MapChangeType::Remove)) => false,
            Some((_, MapChangeType::Add)) => true,
            None => self.base.contains_key(&id),
        }
    }
}

/// Computes new configurations from the tracker's current one, refusing any
/// change that would violate the membership invariants before it can take
/// effect. Nothing here mutates the tracker; the caller installs the
/// returned configuration and map edits through `ProgressTracker::apply_conf`.
pub struct Changer<'a> {
    tracker: &'a ProgressTracker,
}

impl Changer<'_> {
    /// Creates a changer reading from `tracker`.
    pub fn new(tracker: &ProgressTracker) -> Changer {
        Changer { tracker }
    }

    /// Enters a joint configuration: the current incoming voters are copied
    /// to the outgoing set, then `ccs` is applied to the incoming set. In the
    /// Raft thesis's notation this builds `C_{old,new}`, which stays in
    /// effect until [`Changer::leave_joint`].
    pub fn enter_joint(
        &self,
        auto_leave: bool,
        ccs: &[ConfChangeSingle],
    ) -> Result<(Configuration, MapChange)> {
        if super::joint(self.tracker.conf()) {
            return Err(Error::ConfChangeError(
                "configuration is already joint".to_owned(),
            ));
        }
        let (mut cfg, mut prs) = self.check_and_copy()?;
        if cfg.voters().incoming.is_empty() {
            // Adding nodes to an empty config is allowed (bootstrap), but a
            // joint transition out of nothing is not.
            return Err(Error::ConfChangeError(
                "can't make a zero-voter config joint".to_owned(),
            ));
        }
        cfg.voters
            .outgoing
            .extend(cfg.voters.incoming.iter().cloned());
        self.apply(&mut cfg, &mut prs, ccs)?;
        cfg.auto_leave = auto_leave;
        check_invariants(&cfg, &prs)?;
        Ok((cfg, prs.into_changes()))
    }

    /// Leaves the joint configuration: the incoming set becomes the sole
    /// electorate, outgoing voters without a seat in it stop being tracked,
    /// and staged learners take their learner role.
    pub fn leave_joint(&self) -> Result<(Configuration, MapChange)> {
        if !super::joint(self.tracker.conf()) {
            return Err(Error::ConfChangeError(
                "can't leave a non-joint config".to_owned(),
            ));
        }
        let (mut cfg, mut prs) = self.check_and_copy()?;
        cfg.learners.extend(cfg.learners_next.drain());

        for id in &*cfg.voters.outgoing {
            if !cfg.voters.incoming.contains(id) && !cfg.learners.contains(id) {
                prs.changes.push((*id, MapChangeType::Remove));
            }
        }

        cfg.voters.outgoing.clear();
        cfg.auto_leave = false;
        check_invariants(&cfg, &prs)?;
        Ok((cfg, prs.into_changes()))
    }

    /// Applies `ccs` without a joint transition. Refused when the aggregate
    /// change would alter the voter set by more than one member; that is
    /// what joint consensus exists for.
    pub fn simple(&mut self, ccs: &[ConfChangeSingle]) -> Result<(Configuration, MapChange)> {
        if super::joint(self.tracker.conf()) {
            return Err(Error::ConfChangeError(
                "can't apply simple config change in joint config".to_owned(),
            ));
        }
        let (mut cfg, mut prs) = self.check_and_copy()?;
        self.apply(&mut cfg, &mut prs, ccs)?;
        if cfg
            .voters
            .incoming
            .symmetric_difference(&self.tracker.conf().voters.incoming)
            .count()
            > 1
        {
            return Err(Error::ConfChangeError(
                "more than one voter changed without entering joint config".to_owned(),
            ));
        }
        check_invariants(&cfg, &prs)?;
        Ok((cfg, prs.into_changes()))
    }

    /// Applies the changes to the incoming half (outgoing is frozen for the
    /// duration of a joint state).
    fn apply(
        &self,
        cfg: &mut Configuration,
        prs: &mut StagedMap,
        ccs: &[ConfChangeSingle],
    ) -> Result<()> {
        for cc in ccs {
            if cc.node_id == 0 {
                // A zeroed node id marks a change the proposer withdrew.
                continue;
            }
            match cc.get_change_type() {
                ConfChangeType::AddNode => self.make_voter(cfg, prs, cc.node_id),
                ConfChangeType::AddLearnerNode => self.make_learner(cfg, prs, cc.node_id),
                ConfChangeType::RemoveNode => self.remove(cfg, prs, cc.node_id),
            }
        }
        if cfg.voters().incoming.is_empty() {
            return Err(Error::ConfChangeError("removed all voters".to_owned()));
        }
        Ok(())
    }

    /// Adds or promotes `id` to voter in the incoming config.
    fn make_voter(&self, cfg: &mut Configuration, prs: &mut StagedMap, id: u64) {
        if !prs.contains(id) {
            self.init_progress(cfg, prs, id, false);
            return;
        }

        cfg.voters.incoming.insert(id);
        cfg.learners.remove(&id);
        cfg.learners_next.remove(&id);
    }

    /// Makes `id` a learner, or stages it to become one when the joint state
    /// ends.
    ///
    /// A voter of the outgoing config cannot become a learner immediately
    /// (it would be voter and learner at once), so it parks in
    /// `learners_next` until `leave_joint` seats it.
    fn make_learner(&self, cfg: &mut Configuration, prs: &mut StagedMap, id: u64) {
        if !prs.contains(id) {
            self.init_progress(cfg, prs, id, true);
            return;
        }

        if cfg.learners.contains(&id) {
            return;
        }

        cfg.voters.incoming.remove(&id);
        cfg.learners.remove(&id);
        cfg.learners_next.remove(&id);

        if cfg.voters().outgoing.contains(&id) {
            cfg.learners_next.insert(id);
        } else {
            cfg.learners.insert(id);
        }
    }

    /// Removes `id` as voter or learner from the incoming config.
    fn remove(&self, cfg: &mut Configuration, prs: &mut StagedMap, id: u64) {
        if !prs.contains(id) {
            return;
        }

        cfg.voters.incoming.remove(&id);
        cfg.learners.remove(&id);
        cfg.learners_next.remove(&id);

        // An outgoing voter keeps its progress until the joint state ends.
        if !cfg.voters.outgoing.contains(&id) {
            prs.changes.push((id, MapChangeType::Remove));
        }
    }

    fn init_progress(&self, cfg: &mut Configuration, prs: &mut StagedMap, id: u64, learner: bool) {
        if !learner {
            cfg.voters.incoming.insert(id);
        } else {
            cfg.learners.insert(id);
        }
        prs.changes.push((id, MapChangeType::Add));
    }

    /// Copies the tracker's configuration after checking it is itself sane.
    fn check_and_copy(&self) -> Result<(Configuration, StagedMap)> {
        let prs = StagedMap {
            changes: vec![],
            base: self.tracker.progress(),
        };
        check_invariants(self.tracker.conf(), &prs)?;
        Ok((self.tracker.conf().clone(), prs))
    }
}

/// Verifies the configuration and the (staged) progress map agree: every
/// member has progress, learners and voters are disjoint, staged learners
/// exist only while joint.
///
/// The empty configuration is deliberately legal: it is the starting point
/// of bootstrap, which transitions from nothing into the first real config.
fn check_invariants(cfg: &Configuration, prs: &StagedMap) -> Result<()> {
    for id in cfg.voters().ids().iter() {
        if !prs.contains(id) {
            return Err(Error::ConfChangeError(format!(
                "no progress for voter {}",
                id
            )));
        }
    }
    for id in &cfg.learners {
        if !prs.contains(*id) {
            return Err(Error::ConfChangeError(format!(
                "no progress for learner {}",
                id
            )));
        }
        if cfg.voters().outgoing.contains(id) {
            return Err(Error::ConfChangeError(format!(
                "{} is in learners and outgoing voters",
                id
            )));
        }
        if cfg.voters().incoming.contains(id) {
            return Err(Error::ConfChangeError(format!(
                "{} is in learners and incoming voters",
                id
            )));
        }
    }
    for id in &cfg.learners_next {
        if !prs.contains(*id) {
            return Err(Error::ConfChangeError(format!(
                "no progress for staged learner {}",
                id
            )));
        }
        // A learner is staged only because it still sits in the outgoing
        // voter set.
        if !cfg.voters().outgoing.contains(id) {
            return Err(Error::ConfChangeError(format!(
                "{} is in learners_next but not in outgoing voters",
                id
            )));
        }
    }

    if !super::joint(cfg) {
        if !cfg.learners_next().is_empty() {
            return Err(Error::ConfChangeError(
                "learners_next must be empty when not joint".to_owned(),
            ));
        }
        if cfg.auto_leave {
            return Err(Error::ConfChangeError(
                "auto_leave must be false when not joint".to_owned(),
            ));
        }
    }

    Ok(())
}
