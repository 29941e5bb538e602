//! Prefill placement: how the ledger looks before the first decode step.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::ledger::TierLedger;
use crate::cache::location::Location;

/// How prefill tokens are pre-placed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum InitializerKind {
    /// Fill the fast tier in token order until it is full; the rest goes far.
    FillFast,
    /// Within each batch of tokens, keep the bandwidth-optimal share fast.
    BestRatioPerBatch,
    /// Everything far; only migration brings entries into the fast tier.
    AllFar,
}

impl std::fmt::Display for InitializerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitializerKind::FillFast => write!(f, "FillFast"),
            InitializerKind::BestRatioPerBatch => write!(f, "BestRatioPerBatch"),
            InitializerKind::AllFar => write!(f, "AllFar"),
        }
    }
}

impl InitializerKind {
    /// Reserve resident model weights, then place every prefill (token, layer) entry.
    pub fn apply(self, ledger: &mut TierLedger) {
        if !ledger.reserve_weights() {
            warn!(
                capacity = ledger.capacity(),
                "Resident model weights do not fit in the fast tier"
            );
        }

        let config = ledger.config().clone();
        let kv_bytes = ledger.kv_layer_bytes();
        let batch = config.policy.init_batch.max(1);
        let fast_per_batch = (batch as f64 * ledger.best_alpha()).floor() as u64;

        for token in 0..config.model.prefill_tokens {
            let prefer_fast = match self {
                InitializerKind::FillFast => true,
                InitializerKind::BestRatioPerBatch => token % batch <= fast_per_batch,
                InitializerKind::AllFar => false,
            };
            for layer in 0..ledger.n_layers() {
                let location = if prefer_fast && ledger.try_reserve(kv_bytes) {
                    Location::Fast
                } else {
                    Location::Far
                };
                ledger.set_location(token, layer, location);
            }
        }

        info!(
            initializer = %self,
            prefill_tokens = config.model.prefill_tokens,
            utilization = ledger.occupancy_ratio(),
            "Initialization complete"
        );
    }
}
