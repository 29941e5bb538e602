//! Placement policy: decides where the current step's KV write lands.
//!
//! Every variant makes a binary choice. It either attempts a fast-tier
//! reservation for the new entry or sends it straight to the far tier; a
//! failed reservation also lands far. The returned write fraction (beta) is
//! therefore always 0.0 or 1.0.

use serde::{Deserialize, Serialize};

use crate::cache::ledger::TierLedger;
use crate::cache::location::Location;
use crate::config::PolicyConfig;
use crate::trace::{Stage, StepKey};

/// Placement policy variants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementKind {
    /// Always try the fast tier.
    PreferFast,
    /// Early layers fast, later layers far, split at `floor(L * best_alpha)`.
    SplitToken,
    /// The bandwidth-optimal share of each token batch goes fast.
    BatchRatio,
    /// Fast unless upcoming steps are about to skip this token.
    LookAheadBatch,
    /// Fast only while the layer has few not-materialized entries.
    LayerImportance,
    /// Fast while the layer's fast-resident share is below `best_alpha`.
    AlphaLayersDistribution,
}

impl std::fmt::Display for PlacementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlacementKind::PreferFast => "PreferFast",
            PlacementKind::SplitToken => "SplitToken",
            PlacementKind::BatchRatio => "BatchRatio",
            PlacementKind::LookAheadBatch => "LookAheadBatch",
            PlacementKind::LayerImportance => "LayerImportance",
            PlacementKind::AlphaLayersDistribution => "AlphaLayersDistribution",
        };
        f.write_str(name)
    }
}

/// A configured placement policy.
#[derive(Debug, Clone)]
pub struct Placement {
    kind: PlacementKind,
    config: PolicyConfig,
}

impl Placement {
    pub fn new(kind: PlacementKind, config: PolicyConfig) -> Self {
        Self { kind, config }
    }

    pub fn kind(&self) -> PlacementKind {
        self.kind
    }

    /// Place the write of the step at `key` and return the fast-tier write fraction.
    ///
    /// Feed-forward steps write no KV entry and leave the ledger untouched.
    /// Fully skipped attention steps record the entry as not materialized.
    pub fn place(&self, ledger: &mut TierLedger, key: StepKey) -> f64 {
        if key.stage == Stage::FeedForward {
            return 0.0;
        }
        if ledger.trace().get(key).skip_layer {
            ledger.set_location(key.token, key.layer, Location::NotMaterialized);
            return 0.0;
        }

        let write = ledger.step_volumes(key).write;
        if self.wants_fast(ledger, key) && ledger.try_reserve(write) {
            ledger.set_location(key.token, key.layer, Location::Fast);
            1.0
        } else {
            ledger.set_location(key.token, key.layer, Location::Far);
            0.0
        }
    }

    /// Whether this variant attempts a fast-tier reservation for `key`.
    fn wants_fast(&self, ledger: &TierLedger, key: StepKey) -> bool {
        let best_alpha = ledger.best_alpha();
        match self.kind {
            PlacementKind::PreferFast => true,
            PlacementKind::SplitToken => {
                let split = (ledger.n_layers() as f64 * best_alpha).floor() as usize;
                key.layer < split
            }
            PlacementKind::BatchRatio => {
                let batch = self.config.batch_ratio_batch.max(1);
                let fast_share = (batch as f64 * best_alpha).floor() as u64;
                key.token % batch <= fast_share
            }
            PlacementKind::LookAheadBatch => {
                let trace = ledger.trace();
                !(1..=self.config.lookahead_batch)
                    .any(|ahead| trace.get(key.ahead(ahead)).skips(key.token))
            }
            PlacementKind::LayerImportance => {
                let skipped = ledger.census(key.layer).count(Location::NotMaterialized);
                skipped < self.config.layer_skip_limit as u64
            }
            PlacementKind::AlphaLayersDistribution => {
                let tracked = ledger.tracked_tokens();
                if tracked == 0 {
                    return true;
                }
                let fast = ledger.census(key.layer).count(Location::Fast);
                (fast as f64 / tracked as f64) < best_alpha
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::trace::Trace;

    const KV: u64 = 16;

    fn ledger(trace: Trace, n_layers: usize, capacity_entries: u64) -> TierLedger {
        let mut config = Config::default();
        config.model.n_layers = n_layers;
        config.model.hidden_dim = 4;
        config.model.dtype_size = 2;
        config.model.param_count = 0.0;
        config.tiers.fast_capacity = capacity_entries * KV;
        TierLedger::new(Arc::new(config), Arc::new(trace))
    }

    fn placement(kind: PlacementKind) -> Placement {
        Placement::new(kind, PolicyConfig::default())
    }

    fn attn(token: u64, layer: usize) -> StepKey {
        StepKey::new(token, layer, Stage::Attention)
    }

    #[test]
    fn test_prefer_fast_until_full() {
        let mut ledger = ledger(Trace::new(), 1, 2);
        let policy = placement(PlacementKind::PreferFast);
        assert_eq!(policy.place(&mut ledger, attn(0, 0)), 1.0);
        assert_eq!(policy.place(&mut ledger, attn(1, 0)), 1.0);
        assert_eq!(policy.place(&mut ledger, attn(2, 0)), 0.0);
        assert_eq!(ledger.peek(2, 0), Location::Far);
        assert_eq!(ledger.used(), 2 * KV);
    }

    #[test]
    fn test_skipped_step_not_materialized() {
        let trace = Trace::parse_str("h\n0,0,0,[],True\n").unwrap();
        let mut ledger = ledger(trace, 1, 2);
        let beta = placement(PlacementKind::PreferFast).place(&mut ledger, attn(0, 0));
        assert_eq!(beta, 0.0);
        assert_eq!(ledger.peek(0, 0), Location::NotMaterialized);
        assert_eq!(ledger.used(), 0);
    }

    #[test]
    fn test_feed_forward_writes_nothing() {
        let mut ledger = ledger(Trace::new(), 1, 2);
        let key = StepKey::new(0, 0, Stage::FeedForward);
        assert_eq!(placement(PlacementKind::PreferFast).place(&mut ledger, key), 0.0);
        assert_eq!(ledger.tracked_tokens(), 0);
    }

    #[test]
    fn test_split_token_by_layer() {
        // floor(8 * 0.845) = 6: layers 0..6 try fast.
        let mut ledger = ledger(Trace::new(), 8, 100);
        let policy = placement(PlacementKind::SplitToken);
        assert_eq!(policy.place(&mut ledger, attn(0, 5)), 1.0);
        assert_eq!(policy.place(&mut ledger, attn(0, 6)), 0.0);
        assert_eq!(ledger.peek(0, 6), Location::Far);
    }

    #[test]
    fn test_batch_ratio_by_token() {
        // floor(16 * 0.845) = 13: tokens 0..=13 of each batch of 16 try fast.
        let mut ledger = ledger(Trace::new(), 1, 100);
        let policy = placement(PlacementKind::BatchRatio);
        assert_eq!(policy.place(&mut ledger, attn(13, 0)), 1.0);
        assert_eq!(policy.place(&mut ledger, attn(14, 0)), 0.0);
        assert_eq!(policy.place(&mut ledger, attn(15, 0)), 0.0);
        assert_eq!(policy.place(&mut ledger, attn(16, 0)), 1.0);
    }

    #[test]
    fn test_look_ahead_batch_avoids_soon_skipped_tokens() {
        let trace = Trace::parse_str("h\n12,0,0,[10],False\n").unwrap();
        let mut ledger = ledger(trace, 1, 100);
        let policy = placement(PlacementKind::LookAheadBatch);
        // Token 10 is skipped two steps later.
        assert_eq!(policy.place(&mut ledger, attn(10, 0)), 0.0);
        assert_eq!(policy.place(&mut ledger, attn(11, 0)), 1.0);
    }

    #[test]
    fn test_layer_importance_limit() {
        let mut ledger = ledger(Trace::new(), 2, 100);
        let policy = Placement::new(
            PlacementKind::LayerImportance,
            PolicyConfig {
                layer_skip_limit: 2,
                ..Default::default()
            },
        );
        ledger.set_location(0, 0, Location::NotMaterialized);
        assert_eq!(policy.place(&mut ledger, attn(5, 0)), 1.0);
        ledger.set_location(1, 0, Location::NotMaterialized);
        assert_eq!(policy.place(&mut ledger, attn(6, 0)), 0.0);
        // Layer 1 is unaffected.
        assert_eq!(policy.place(&mut ledger, attn(6, 1)), 1.0);
    }

    #[test]
    fn test_alpha_layers_distribution() {
        let mut ledger = ledger(Trace::new(), 1, 100);
        let policy = placement(PlacementKind::AlphaLayersDistribution);
        // Nothing tracked yet.
        assert_eq!(policy.place(&mut ledger, attn(0, 0)), 1.0);
        // 1 of 1 tracked tokens fast: 1.0 >= best_alpha.
        assert_eq!(policy.place(&mut ledger, attn(1, 0)), 0.0);
        // 1 of 2 fast: 0.5 < best_alpha.
        assert_eq!(policy.place(&mut ledger, attn(2, 0)), 1.0);
    }
}
