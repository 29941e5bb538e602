//! Tier ledger: the single source of truth for KV cache residency.
//!
//! The ledger owns
//! - the location grid: one [`Location`] per (token, layer), created lazily
//! - the fast-tier capacity counter, guarded by [`TierLedger::try_reserve`] and
//!   [`TierLedger::release`]
//! - a per-layer census of location codes, kept in step with the grid so that
//!   step volumes and read fractions never scan every tracked token
//!
//! Placement and migration policies hold `&mut TierLedger` and go through
//! these operations; nothing else touches the grid or the counter.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use crate::cache::location::{LayerCensus, Location};
use crate::config::{Accounting, Config};
use crate::trace::{Stage, StepKey, TokenId, Trace};

/// Bytes a step must move through some memory path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepVolumes {
    pub read: u64,
    pub write: u64,
}

/// Fast-tier read fractions for a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReadFractions {
    /// Largest fraction of the read volume the fast tier can serve right now.
    pub feasible: f64,

    /// Bandwidth-optimal fraction, bounded by current fast-tier residency.
    pub target: f64,
}

impl ReadFractions {
    /// The fraction the cost model charges under the given accounting mode.
    pub fn for_accounting(&self, accounting: Accounting) -> f64 {
        match accounting {
            Accounting::Exclusive => self.feasible,
            Accounting::Inclusive => self.target,
        }
    }
}

/// Outcome of moving one far-tier entry into the fast tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The entry now lives in the fast tier.
    Promoted,
    /// The entry was not in the far tier; nothing changed.
    NotFar,
    /// The fast tier had no room; nothing changed.
    Full,
}

/// Residency bookkeeping for one simulation run.
#[derive(Debug, Clone)]
pub struct TierLedger {
    config: Arc<Config>,
    trace: Arc<Trace>,

    /// Per-token, per-layer locations, ordered by token id.
    grid: BTreeMap<TokenId, Vec<Location>>,

    /// Per-layer location counts over `grid`.
    census: Vec<LayerCensus>,

    /// Fast-tier capacity in bytes.
    capacity: u64,

    /// Bytes currently resident in the fast tier.
    used: u64,

    /// Portion of `used` held by model weights.
    weight_bytes: u64,

    n_layers: usize,
    kv_bytes: u64,
    best_alpha: f64,
    weight_ratio: f64,
}

impl TierLedger {
    /// Create an empty ledger: nothing tracked, fast tier empty.
    pub fn new(config: Arc<Config>, trace: Arc<Trace>) -> Self {
        let n_layers = config.model.n_layers;
        Self {
            census: vec![LayerCensus::default(); n_layers],
            capacity: config.tiers.fast_capacity,
            used: 0,
            weight_bytes: 0,
            n_layers,
            kv_bytes: config.kv_layer_bytes(),
            best_alpha: config.best_alpha(),
            weight_ratio: config.resident_weight_ratio(),
            grid: BTreeMap::new(),
            config,
            trace,
        }
    }

    /// An independent copy of the grid, census, and counter for a fresh run.
    ///
    /// The configuration and trace are immutable and shared.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn trace(&self) -> &Arc<Trace> {
        &self.trace
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    /// KV cache bytes of one token at one layer.
    pub fn kv_layer_bytes(&self) -> u64 {
        self.kv_bytes
    }

    pub fn best_alpha(&self) -> f64 {
        self.best_alpha
    }

    /// Fraction of model weights resident in the fast tier.
    pub fn resident_weight_ratio(&self) -> f64 {
        self.weight_ratio
    }

    // ---- location grid -------------------------------------------------

    fn ensure_token(&mut self, token: TokenId) -> &mut Vec<Location> {
        let census = &mut self.census;
        let n_layers = self.n_layers;
        self.grid.entry(token).or_insert_with(|| {
            for layer in census.iter_mut() {
                layer.add(Location::Uninitialized);
            }
            vec![Location::Uninitialized; n_layers]
        })
    }

    /// Location of a token's entry at `layer`, tracking the token if unseen.
    pub fn location(&mut self, token: TokenId, layer: usize) -> Location {
        self.ensure_token(token)[layer]
    }

    /// Location of a token's entry at `layer` without tracking it.
    ///
    /// Untracked tokens report [`Location::Uninitialized`].
    pub fn peek(&self, token: TokenId, layer: usize) -> Location {
        self.grid
            .get(&token)
            .map(|layers| layers[layer])
            .unwrap_or(Location::Uninitialized)
    }

    /// Overwrite a token's entry at `layer`, tracking the token if unseen.
    ///
    /// Does not touch the capacity counter; callers moving bytes between
    /// tiers pair this with [`try_reserve`](Self::try_reserve) or
    /// [`release`](Self::release).
    pub fn set_location(&mut self, token: TokenId, layer: usize, location: Location) {
        let slot = &mut self.ensure_token(token)[layer];
        let old = std::mem::replace(slot, location);
        if old != location {
            self.census[layer].moved(old, location);
        }
    }

    /// All layer locations of a tracked token.
    pub fn token_locations(&self, token: TokenId) -> Option<&[Location]> {
        self.grid.get(&token).map(Vec::as_slice)
    }

    /// Number of tracked tokens.
    pub fn tracked_tokens(&self) -> usize {
        self.grid.len()
    }

    /// Tracked token ids in ascending order.
    pub fn tokens(&self) -> impl DoubleEndedIterator<Item = TokenId> + '_ {
        self.grid.keys().copied()
    }

    /// Tracked tokens whose entry at `layer` has the given location, ascending.
    pub fn tokens_at(
        &self,
        layer: usize,
        location: Location,
    ) -> impl DoubleEndedIterator<Item = TokenId> + '_ {
        self.grid
            .iter()
            .filter(move |(_, layers)| layers[layer] == location)
            .map(|(&token, _)| token)
    }

    /// Tracked tokens with at least one layer in the fast tier, ascending.
    pub fn tokens_with_fast_entries(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.grid
            .iter()
            .filter(|(_, layers)| layers.contains(&Location::Fast))
            .map(|(&token, _)| token)
    }

    /// Location counts at `layer`.
    pub fn census(&self, layer: usize) -> LayerCensus {
        self.census[layer]
    }

    /// Fast-tier entries across all layers.
    pub fn fast_entries(&self) -> u64 {
        self.census.iter().map(|c| c.count(Location::Fast)).sum()
    }

    // ---- capacity counter ----------------------------------------------

    /// Admit `bytes` into the fast tier if they fit entirely.
    ///
    /// Fails without side effects when the tier is already full or the
    /// request exceeds the remaining space; there is no partial admission.
    pub fn try_reserve(&mut self, bytes: u64) -> bool {
        let remaining = self.remaining();
        if remaining == 0 || bytes > remaining {
            return false;
        }
        self.used += bytes;
        true
    }

    /// Return `bytes` to the fast tier.
    ///
    /// # Panics
    ///
    /// Panics if more bytes are released than are resident.
    pub fn release(&mut self, bytes: u64) {
        assert!(
            bytes <= self.used,
            "fast tier release of {bytes} bytes exceeds {} resident",
            self.used
        );
        self.used -= bytes;
    }

    /// Reserve the resident share of the model weights.
    ///
    /// Returns false, reserving nothing, if they do not fit.
    pub fn reserve_weights(&mut self) -> bool {
        let bytes = (self.config.model_weight_bytes() as f64 * self.weight_ratio) as u64;
        if self.try_reserve(bytes) {
            self.weight_bytes += bytes;
            true
        } else {
            false
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes resident in the fast tier.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Resident bytes belonging to model weights.
    pub fn weight_bytes(&self) -> u64 {
        self.weight_bytes
    }

    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    /// Fast-tier usage as a fraction of capacity.
    pub fn occupancy_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64
    }

    /// Whether occupancy has reached the high watermark.
    pub fn exceeds_threshold(&self) -> bool {
        self.occupancy_ratio() >= self.config.tiers.high_watermark
    }

    // ---- paired moves --------------------------------------------------

    /// Move a fast-tier entry to the far tier, releasing its bytes.
    ///
    /// Returns false if the entry was not in the fast tier.
    pub fn evict(&mut self, token: TokenId, layer: usize) -> bool {
        if self.peek(token, layer) != Location::Fast {
            return false;
        }
        self.set_location(token, layer, Location::Far);
        self.release(self.kv_bytes);
        trace!(token, layer, "Evicted KV entry to far tier");
        true
    }

    /// Move a far-tier entry into the fast tier if a reservation succeeds.
    pub fn promote(&mut self, token: TokenId, layer: usize) -> Promotion {
        if self.peek(token, layer) != Location::Far {
            return Promotion::NotFar;
        }
        if !self.try_reserve(self.kv_bytes) {
            return Promotion::Full;
        }
        self.set_location(token, layer, Location::Fast);
        trace!(token, layer, "Promoted KV entry to fast tier");
        Promotion::Promoted
    }

    // ---- step demand ---------------------------------------------------

    /// Read/write bytes the step at `key` must move, wherever the data lives.
    pub fn step_volumes(&self, key: StepKey) -> StepVolumes {
        let record = self.trace.get(key);
        if record.skip_layer {
            return StepVolumes::default();
        }

        match key.stage {
            Stage::FeedForward => StepVolumes {
                read: self.config.ffn_weight_bytes(),
                write: 0,
            },
            Stage::Attention => {
                let skips = record.skip_tokens();
                let skipped_in_set = skips
                    .iter()
                    .filter(|&&t| self.peek(t, key.layer) == Location::NotMaterialized)
                    .count() as u64;
                let not_materialized = self.census[key.layer].count(Location::NotMaterialized)
                    - skipped_in_set;
                let excluded = (skips.len() as u64 + not_materialized) * self.kv_bytes;

                let full = self.config.attention_weight_bytes() + key.token * self.kv_bytes;
                StepVolumes {
                    read: full.saturating_sub(excluded),
                    write: self.kv_bytes,
                }
            }
        }
    }

    /// Feasible and bandwidth-optimal fast-tier read fractions for `key`.
    pub fn read_fractions(&self, key: StepKey) -> ReadFractions {
        let read = self.step_volumes(key).read;
        if read == 0 {
            return ReadFractions::default();
        }

        let ratio = self.weight_ratio;
        if key.stage == Stage::FeedForward {
            return ReadFractions {
                feasible: ratio,
                target: ratio,
            };
        }

        // Tokens excluded from this step do not count toward what it reads.
        let mut fast_skipped = 0u64;
        let mut resident_skipped = 0u64;
        for &token in self.trace.get(key).skip_tokens() {
            let location = self.peek(token, key.layer);
            if location == Location::Fast {
                fast_skipped += 1;
            }
            if location.is_resident() {
                resident_skipped += 1;
            }
        }
        let census = self.census[key.layer];
        let fast = census.count(Location::Fast) - fast_skipped;
        let resident = census.resident() - resident_skipped;

        let read = read as f64;
        let kv = self.kv_bytes as f64;
        let weights = self.config.attention_weight_bytes() as f64;

        let feasible = (ratio * weights + fast as f64 * kv) / read;

        let best_tokens = (self.best_alpha * resident as f64).floor() as u64;
        let target = (weights * self.best_alpha.min(ratio) + best_tokens.min(fast) as f64 * kv) / read;

        ReadFractions {
            feasible: feasible.clamp(0.0, 1.0),
            target: target.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: u64 = 4;
    const DTYPE: u64 = 2;
    const KV: u64 = 2 * D * DTYPE;
    const WEIGHTS: u64 = 4 * D * D * DTYPE;

    fn ledger_with(trace: Trace, capacity_entries: u64) -> TierLedger {
        let mut config = Config::default();
        config.model.n_layers = 2;
        config.model.hidden_dim = D;
        config.model.ffn_dim = 8;
        config.model.dtype_size = DTYPE;
        config.model.param_count = 0.0;
        config.tiers.fast_capacity = capacity_entries * KV;
        config.tiers.resident_weight_ratio = Some(1.0);
        TierLedger::new(Arc::new(config), Arc::new(trace))
    }

    #[test]
    fn test_lazy_token_tracking() {
        let mut ledger = ledger_with(Trace::new(), 4);
        assert_eq!(ledger.peek(7, 1), Location::Uninitialized);
        assert_eq!(ledger.tracked_tokens(), 0);

        assert_eq!(ledger.location(7, 1), Location::Uninitialized);
        assert_eq!(ledger.tracked_tokens(), 1);
        assert_eq!(ledger.census(0).count(Location::Uninitialized), 1);
        assert_eq!(ledger.census(1).count(Location::Uninitialized), 1);
    }

    #[test]
    fn test_set_location_keeps_census() {
        let mut ledger = ledger_with(Trace::new(), 4);
        ledger.set_location(3, 0, Location::Far);
        ledger.set_location(3, 1, Location::NotMaterialized);
        ledger.set_location(3, 0, Location::Fast);

        assert_eq!(ledger.token_locations(3), Some(&[Location::Fast, Location::NotMaterialized][..]));
        assert_eq!(ledger.census(0).count(Location::Fast), 1);
        assert_eq!(ledger.census(0).count(Location::Far), 0);
        assert_eq!(ledger.census(1).count(Location::NotMaterialized), 1);
        assert_eq!(ledger.census(1).count(Location::Uninitialized), 0);
        // Capacity is untouched by location updates.
        assert_eq!(ledger.used(), 0);
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let mut ledger = ledger_with(Trace::new(), 2);
        assert!(ledger.try_reserve(KV));
        assert!(!ledger.try_reserve(2 * KV));
        assert_eq!(ledger.used(), KV);
        assert!(ledger.try_reserve(KV));
        assert_eq!(ledger.remaining(), 0);
        // Full tier rejects even an empty request.
        assert!(!ledger.try_reserve(0));

        ledger.release(KV);
        assert_eq!(ledger.used(), KV);
        assert!((ledger.occupancy_ratio() - 0.5).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_release_underflow_panics() {
        let mut ledger = ledger_with(Trace::new(), 2);
        ledger.release(1);
    }

    #[test]
    fn test_evict_and_promote_pair_with_counter() {
        let mut ledger = ledger_with(Trace::new(), 1);
        ledger.set_location(0, 0, Location::Far);
        ledger.set_location(1, 0, Location::Far);

        assert_eq!(ledger.promote(0, 0), Promotion::Promoted);
        assert_eq!(ledger.used(), KV);
        assert_eq!(ledger.promote(1, 0), Promotion::Full);
        assert_eq!(ledger.peek(1, 0), Location::Far);
        assert_eq!(ledger.promote(0, 0), Promotion::NotFar);

        assert!(ledger.evict(0, 0));
        assert!(!ledger.evict(0, 0));
        assert_eq!(ledger.used(), 0);
        assert_eq!(ledger.peek(0, 0), Location::Far);
    }

    #[test]
    fn test_step_volumes() {
        let text = "header\n5,0,0,[1,2],False\n5,1,0,[],True\n";
        let mut ledger = ledger_with(Trace::parse_str(text).unwrap(), 8);
        // Token 2 (in the skip set) and token 3 (outside it) were never computed at layer 0.
        ledger.set_location(2, 0, Location::NotMaterialized);
        ledger.set_location(3, 0, Location::NotMaterialized);

        let attn = ledger.step_volumes(StepKey::new(5, 0, Stage::Attention));
        // Weights + 5 tokens, minus the 2 skipped tokens and token 3.
        assert_eq!(attn.read, WEIGHTS + 5 * KV - 3 * KV);
        assert_eq!(attn.write, KV);

        let ffn = ledger.step_volumes(StepKey::new(5, 0, Stage::FeedForward));
        assert_eq!(ffn.read, 2 * D * 8 * DTYPE);
        assert_eq!(ffn.write, 0);

        let skipped = ledger.step_volumes(StepKey::new(5, 1, Stage::Attention));
        assert_eq!(skipped, StepVolumes::default());
    }

    #[test]
    fn test_read_fractions() {
        let text = "header\n4,0,0,[0],False\n";
        let mut ledger = ledger_with(Trace::parse_str(text).unwrap(), 8);
        for token in 0..4 {
            assert!(ledger.try_reserve(KV));
            ledger.set_location(token, 0, Location::Fast);
        }

        let key = StepKey::new(4, 0, Stage::Attention);
        let read = (WEIGHTS + 3 * KV) as f64;
        let fractions = ledger.read_fractions(key);
        // Token 0 is skipped, so three fast entries plus resident weights are usable.
        assert!((fractions.feasible - (WEIGHTS as f64 + 3.0 * KV as f64) / read).abs() < 1e-12);
        assert!((fractions.feasible - 1.0).abs() < 1e-12);

        let best = ledger.best_alpha();
        let best_tokens = (best * 3.0).floor();
        let expected_target = (WEIGHTS as f64 * best + best_tokens * KV as f64) / read;
        assert!((fractions.target - expected_target).abs() < 1e-12);
        assert_eq!(fractions.for_accounting(Accounting::Exclusive), fractions.feasible);
        assert_eq!(fractions.for_accounting(Accounting::Inclusive), fractions.target);

        let ffn = ledger.read_fractions(StepKey::new(4, 0, Stage::FeedForward));
        assert_eq!(ffn.feasible, 1.0);
        assert_eq!(ffn.target, 1.0);
    }

    #[test]
    fn test_read_fractions_zero_read() {
        let text = "header\n4,0,0,[],True\n";
        let ledger = ledger_with(Trace::parse_str(text).unwrap(), 8);
        let fractions = ledger.read_fractions(StepKey::new(4, 0, Stage::Attention));
        assert_eq!(fractions, ReadFractions::default());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut ledger = ledger_with(Trace::new(), 4);
        assert!(ledger.try_reserve(KV));
        ledger.set_location(0, 0, Location::Fast);

        let mut copy = ledger.snapshot();
        assert!(copy.evict(0, 0));
        copy.set_location(9, 1, Location::Far);

        assert_eq!(ledger.peek(0, 0), Location::Fast);
        assert_eq!(ledger.used(), KV);
        assert_eq!(ledger.tracked_tokens(), 1);
        assert_eq!(copy.used(), 0);
        assert_eq!(copy.tracked_tokens(), 2);
    }
}
