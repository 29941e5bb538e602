//! Placement and migration policies.
//!
//! - [`placement`]: where the current step's KV write lands (beta)
//! - [`migration`]: how already-placed entries move between tiers

pub mod migration;
pub mod placement;
