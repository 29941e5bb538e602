//! Location codes for a token's per-layer KV cache entry.

use serde::{Deserialize, Serialize};

/// Where one (token, layer) KV cache entry currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    /// Code 0: resident in the fast tier.
    Fast,
    /// Code 1: resident in the far tier.
    Far,
    /// Code 2: never computed because the step was skipped.
    NotMaterialized,
    /// Code 3: not yet placed.
    Uninitialized,
}

impl Location {
    /// All codes in numeric order.
    pub const ALL: [Location; 4] = [
        Location::Fast,
        Location::Far,
        Location::NotMaterialized,
        Location::Uninitialized,
    ];

    /// Numeric location code.
    pub fn code(&self) -> u8 {
        match self {
            Location::Fast => 0,
            Location::Far => 1,
            Location::NotMaterialized => 2,
            Location::Uninitialized => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Location> {
        Location::ALL.get(code as usize).copied()
    }

    /// Whether the entry holds bytes in either tier.
    pub fn is_resident(&self) -> bool {
        matches!(self, Location::Fast | Location::Far)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Fast => write!(f, "fast"),
            Location::Far => write!(f, "far"),
            Location::NotMaterialized => write!(f, "not-materialized"),
            Location::Uninitialized => write!(f, "uninitialized"),
        }
    }
}

/// Per-layer count of tracked tokens by location code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerCensus {
    counts: [u64; 4],
}

impl LayerCensus {
    /// Tokens whose entry at this layer has the given location.
    pub fn count(&self, location: Location) -> u64 {
        self.counts[location.code() as usize]
    }

    /// Tokens tracked at this layer, whatever their location.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Tokens holding bytes in either tier at this layer.
    pub fn resident(&self) -> u64 {
        self.count(Location::Fast) + self.count(Location::Far)
    }

    pub(crate) fn add(&mut self, location: Location) {
        self.counts[location.code() as usize] += 1;
    }

    pub(crate) fn moved(&mut self, from: Location, to: Location) {
        self.counts[from.code() as usize] -= 1;
        self.counts[to.code() as usize] += 1;
    }
}
