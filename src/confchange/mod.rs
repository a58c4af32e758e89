// Copyright 2025 The Trellis Project Developers. Licensed under Apache-2.0.

//! Validated transitions between membership configurations.

mod changer;
mod restore;

pub use self::changer::{Changer, MapChange, MapChangeType};
pub use self::restore::restore;

use crate::tracker::Configuration;

/// Whether the configuration is joint, i.e. mid-transition.
#[inline]
pub fn joint(cfg: &Configuration) -> bool {
    !cfg.voters().outgoing.is_empty()
}
