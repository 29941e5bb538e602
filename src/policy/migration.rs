//! Migration policy: rebalances already-placed entries between tiers.
//!
//! Runs once per step after placement. A rebalance may evict fast-tier
//! entries to the far tier or promote far-tier entries into the fast tier,
//! for any token and layer other than the current step's own write.
//!
//! Evictions always release their bytes. Promotions need a successful
//! reservation first; the first failed reservation ends all promotion for
//! the step.
//!
//! Traffic accounting: moving the current layer's entry of a token that this
//! step reads anyway costs no extra source-tier read, since the bytes are
//! already streaming through. Under inclusive accounting the far tier keeps
//! a copy of everything, so evictions cost no traffic at all.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cache::ledger::{Promotion, TierLedger};
use crate::cache::location::Location;
use crate::config::{Accounting, PolicyConfig};
use crate::trace::{Stage, StepKey, StepRecord, TokenId};

/// Migration policy variants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationKind {
    /// Never migrate.
    NoMigration,
    /// Above the high watermark, evict the oldest tokens with fast entries.
    Prior,
    /// Above the high watermark, evict the current step's skipped tokens.
    SkippedTokens,
    /// Evict every token skipped in a trailing window of steps.
    PastWindow,
    /// Evict what the next token skips, promote everything else.
    LookAhead,
    /// Evict what the next batch of tokens all skip, promote the rest.
    LookAheadBatch,
    /// Steer the next step's fast-tier read fraction toward `best_alpha`.
    Alpha,
}

impl std::fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MigrationKind::NoMigration => "NoMigration",
            MigrationKind::Prior => "PriorMigration",
            MigrationKind::SkippedTokens => "SkippedTokensMigration",
            MigrationKind::PastWindow => "PastWindowMigration",
            MigrationKind::LookAhead => "LookAheadMigration",
            MigrationKind::LookAheadBatch => "LookAheadBatchMigration",
            MigrationKind::Alpha => "AlphaMigration",
        };
        f.write_str(name)
    }
}

/// Bytes moved by one rebalance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationTraffic {
    /// Read out of the fast tier by evictions.
    pub fast_read: u64,
    /// Written into the fast tier by promotions.
    pub fast_write: u64,
    /// Read out of the far tier by promotions.
    pub far_read: u64,
    /// Written into the far tier by evictions.
    pub far_write: u64,
}

impl MigrationTraffic {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    fn record_eviction(&mut self, bytes: u64, reads_source: bool) {
        if reads_source {
            self.fast_read += bytes;
        }
        self.far_write += bytes;
    }

    fn record_promotion(&mut self, bytes: u64, reads_source: bool) {
        self.fast_write += bytes;
        if reads_source {
            self.far_read += bytes;
        }
    }

    /// Traffic as charged under the given accounting mode.
    pub fn for_accounting(self, accounting: Accounting) -> Self {
        match accounting {
            Accounting::Exclusive => self,
            Accounting::Inclusive => Self {
                fast_read: 0,
                far_write: 0,
                ..self
            },
        }
    }
}

/// Per-step context shared by the variants.
struct Step<'a> {
    key: StepKey,
    current: &'a StepRecord,
    kv_bytes: u64,
}

impl Step<'_> {
    /// Whether moving `token`'s entry at `layer` needs its own source-tier read.
    fn reads_source(&self, token: TokenId, layer: usize) -> bool {
        layer != self.key.layer || self.current.skips(token)
    }

    /// Whether `(token, layer)` is the entry this step writes.
    fn is_own_write(&self, token: TokenId, layer: usize) -> bool {
        token == self.key.token && layer == self.key.layer
    }

    fn evict(&self, ledger: &mut TierLedger, token: TokenId, layer: usize, traffic: &mut MigrationTraffic) {
        if self.is_own_write(token, layer) {
            return;
        }
        if ledger.evict(token, layer) {
            traffic.record_eviction(self.kv_bytes, self.reads_source(token, layer));
        }
    }

    /// Evict every fast-tier layer of `token`.
    fn evict_token(&self, ledger: &mut TierLedger, token: TokenId, traffic: &mut MigrationTraffic) {
        for layer in 0..ledger.n_layers() {
            self.evict(ledger, token, layer, traffic);
        }
    }

    fn promote(
        &self,
        ledger: &mut TierLedger,
        token: TokenId,
        layer: usize,
        traffic: &mut MigrationTraffic,
    ) -> Promotion {
        // The step's own write stays where placement put it.
        if self.is_own_write(token, layer) {
            return Promotion::NotFar;
        }
        let outcome = ledger.promote(token, layer);
        if outcome == Promotion::Promoted {
            traffic.record_promotion(self.kv_bytes, self.reads_source(token, layer));
        }
        outcome
    }
}

/// A configured migration policy.
#[derive(Debug, Clone)]
pub struct Migrator {
    kind: MigrationKind,
    config: PolicyConfig,
}

impl Migrator {
    pub fn new(kind: MigrationKind, config: PolicyConfig) -> Self {
        Self { kind, config }
    }

    pub fn kind(&self) -> MigrationKind {
        self.kind
    }

    /// Rebalance the ledger ahead of future steps and report the bytes moved.
    pub fn rebalance(&self, ledger: &mut TierLedger, key: StepKey) -> MigrationTraffic {
        if self.kind == MigrationKind::NoMigration {
            return MigrationTraffic::default();
        }

        let trace = Arc::clone(ledger.trace());
        let step = Step {
            key,
            current: trace.get(key),
            kv_bytes: ledger.kv_layer_bytes(),
        };
        let mut traffic = MigrationTraffic::default();

        match self.kind {
            MigrationKind::NoMigration => {}
            MigrationKind::Prior => self.prior(ledger, &step, &mut traffic),
            MigrationKind::SkippedTokens => {
                if ledger.exceeds_threshold() {
                    for &token in step.current.skip_tokens() {
                        step.evict_token(ledger, token, &mut traffic);
                    }
                }
            }
            MigrationKind::PastWindow => self.past_window(ledger, &step, &mut traffic),
            MigrationKind::LookAhead => {
                if trace.contains(key.next_token()) {
                    let next = trace.get(key.next_token());
                    look_ahead(ledger, &step, next.skip_tokens(), &mut traffic);
                }
            }
            MigrationKind::LookAheadBatch => self.look_ahead_batch(ledger, &step, &mut traffic),
            MigrationKind::Alpha => self.alpha(ledger, &step, &mut traffic),
        }

        if !traffic.is_zero() {
            trace!(
                policy = %self.kind,
                step = %key,
                fast_read = traffic.fast_read,
                fast_write = traffic.fast_write,
                far_read = traffic.far_read,
                far_write = traffic.far_write,
                "Rebalanced"
            );
        }
        traffic.for_accounting(ledger.config().tiers.accounting)
    }

    /// Above the watermark, evict a batch of the oldest tokens holding fast entries.
    fn prior(&self, ledger: &mut TierLedger, step: &Step<'_>, traffic: &mut MigrationTraffic) {
        if !ledger.exceeds_threshold() {
            return;
        }
        let victims: Vec<TokenId> = ledger
            .tokens_with_fast_entries()
            .take(self.config.prior_batch)
            .collect();
        for token in victims {
            step.evict_token(ledger, token, traffic);
        }
    }

    /// Evict every token skipped at this (layer, stage) over the trailing window.
    fn past_window(&self, ledger: &mut TierLedger, step: &Step<'_>, traffic: &mut MigrationTraffic) {
        let trace = Arc::clone(ledger.trace());
        let key = step.key;
        let start = (key.token + 1).saturating_sub(self.config.past_window);
        let victims: BTreeSet<TokenId> = (start..=key.token)
            .flat_map(|token| {
                trace
                    .get(StepKey { token, ..key })
                    .skip_tokens()
                    .iter()
                    .copied()
            })
            .collect();
        for token in victims {
            step.evict_token(ledger, token, traffic);
        }
    }

    /// Evict this layer for tokens every one of the next batch of steps skips;
    /// promote this layer for everything else.
    fn look_ahead_batch(&self, ledger: &mut TierLedger, step: &Step<'_>, traffic: &mut MigrationTraffic) {
        if self.config.lookahead_batch == 0 {
            return;
        }
        let trace = Arc::clone(ledger.trace());
        let key = step.key;
        let mut consistent: Vec<TokenId> = trace.get(key.next_token()).skip_tokens().to_vec();
        for ahead in 2..=self.config.lookahead_batch {
            if consistent.is_empty() {
                break;
            }
            let record = trace.get(key.ahead(ahead));
            consistent.retain(|&token| record.skips(token));
        }

        for &token in &consistent {
            step.evict(ledger, token, key.layer, traffic);
        }

        if ledger.remaining() < step.kv_bytes {
            return;
        }
        let candidates: Vec<TokenId> = ledger
            .tokens_at(key.layer, Location::Far)
            .filter(|&token| {
                consistent.binary_search(&token).is_err() && !step.is_own_write(token, key.layer)
            })
            .collect();
        for token in candidates {
            if step.promote(ledger, token, key.layer, traffic) == Promotion::Full {
                break;
            }
        }
    }

    /// Evict or promote single entries at this layer until the next step's
    /// feasible read fraction is within `alpha_deviation` of `best_alpha`.
    fn alpha(&self, ledger: &mut TierLedger, step: &Step<'_>, traffic: &mut MigrationTraffic) {
        let key = step.key;
        let next_key = key.next_token();
        let trace = Arc::clone(ledger.trace());
        if key.stage != Stage::Attention || !trace.contains(next_key) {
            return;
        }
        let next = trace.get(next_key);
        let layer = key.layer;
        let target = ledger.best_alpha();
        let deviation = self.config.alpha_deviation;
        let current = ledger.read_fractions(next_key).feasible;

        if current > target + deviation {
            // Oldest first, among entries the next step actually reads.
            let candidates: Vec<TokenId> = ledger
                .tokens_at(layer, Location::Fast)
                .filter(|&token| !next.skips(token) && !step.is_own_write(token, layer))
                .collect();
            for token in candidates {
                if ledger.read_fractions(next_key).feasible <= target + deviation {
                    break;
                }
                step.evict(ledger, token, layer, traffic);
            }
        } else if current < target - deviation {
            // Newest first; the first failed reservation ends the rebalance.
            let candidates: Vec<TokenId> = ledger
                .tokens_at(layer, Location::Far)
                .rev()
                .filter(|&token| !next.skips(token) && !step.is_own_write(token, layer))
                .collect();
            for token in candidates {
                if ledger.read_fractions(next_key).feasible >= target - deviation {
                    break;
                }
                if step.promote(ledger, token, layer, traffic) == Promotion::Full {
                    break;
                }
            }
        }
    }
}

/// Evict every fast layer of the tokens the next step skips, then promote the
/// far layers of all other tracked tokens, oldest first, until the tier is full.
fn look_ahead(
    ledger: &mut TierLedger,
    step: &Step<'_>,
    next_skips: &[TokenId],
    traffic: &mut MigrationTraffic,
) {
    for &token in next_skips {
        step.evict_token(ledger, token, traffic);
    }

    if ledger.remaining() < step.kv_bytes {
        return;
    }
    let candidates: Vec<TokenId> = ledger
        .tokens()
        .filter(|token| next_skips.binary_search(token).is_err())
        .collect();
    for token in candidates {
        for layer in 0..ledger.n_layers() {
            if step.promote(ledger, token, layer, traffic) == Promotion::Full {
                return;
            }
        }
    }
}
