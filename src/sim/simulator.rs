//! Trace replay: drives placement and migration step by step and
//! accumulates the modeled time.

use serde::Serialize;
use tracing::debug;

use crate::cache::ledger::TierLedger;
use crate::cache::location::Location;
use crate::policy::migration::{MigrationTraffic, Migrator};
use crate::policy::placement::Placement;
use crate::sim::cost::CostModel;
use crate::trace::{Stage, StepKey, TokenId};

/// Diagnostics for one simulated step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepDetail {
    pub token: TokenId,
    pub layer: usize,
    pub stage: Stage,
    /// Step time in nanoseconds.
    pub time: f64,
    /// Fast-tier read fraction charged.
    pub alpha: f64,
    /// Fast-tier write fraction.
    pub beta: f64,
}

/// Result of replaying the whole trace once.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunOutcome {
    /// Sum of step times in nanoseconds.
    pub total_time: f64,
    /// One entry per non-skipped step, in replay order.
    pub steps: Vec<StepDetail>,
}

impl RunOutcome {
    /// Mean fast-tier read fraction over simulated steps (0 if none ran).
    pub fn average_alpha(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.steps.iter().map(|s| s.alpha).sum::<f64>() / self.steps.len() as f64
    }

    /// Per-step fast-tier read fractions.
    pub fn alphas(&self) -> impl Iterator<Item = f64> + '_ {
        self.steps.iter().map(|s| s.alpha)
    }
}

#[derive(Debug, Clone)]
enum Strategy {
    Policies { placement: Placement, migrator: Migrator },
    /// Bandwidth-optimal reads capped by capacity, no placement or migration.
    UpperBound,
}

/// Replays a trace against one ledger.
#[derive(Debug)]
pub struct Simulator {
    ledger: TierLedger,
    cost: CostModel,
    strategy: Strategy,
}

impl Simulator {
    /// Simulate a placement/migration combination.
    pub fn new(ledger: TierLedger, placement: Placement, migrator: Migrator) -> Self {
        Self::with_strategy(ledger, Strategy::Policies { placement, migrator })
    }

    /// Simulate the forced-optimal baseline.
    pub fn upper_bound(ledger: TierLedger) -> Self {
        Self::with_strategy(ledger, Strategy::UpperBound)
    }

    fn with_strategy(ledger: TierLedger, strategy: Strategy) -> Self {
        let cost = CostModel::new(&ledger.config().tiers);
        Self {
            ledger,
            cost,
            strategy,
        }
    }

    pub fn ledger(&self) -> &TierLedger {
        &self.ledger
    }

    pub fn into_ledger(self) -> TierLedger {
        self.ledger
    }

    /// Replay every decode step in (token, layer, stage) order.
    pub fn run(&mut self) -> RunOutcome {
        let config = self.ledger.config().clone();
        let mut outcome = RunOutcome::default();
        let mut traffic_total = MigrationTraffic::default();

        for token in config.decode_range() {
            for layer in 0..config.model.n_layers {
                for stage in Stage::ALL {
                    let key = StepKey::new(token, layer, stage);
                    if let Some((detail, traffic)) = self.step(key) {
                        outcome.total_time += detail.time;
                        outcome.steps.push(detail);
                        traffic_total.fast_read += traffic.fast_read;
                        traffic_total.fast_write += traffic.fast_write;
                        traffic_total.far_read += traffic.far_read;
                        traffic_total.far_write += traffic.far_write;
                    }
                }
            }
        }

        debug!(
            steps = outcome.steps.len(),
            total_time_ns = outcome.total_time,
            migrated_fast_read = traffic_total.fast_read,
            migrated_fast_write = traffic_total.fast_write,
            migrated_far_read = traffic_total.far_read,
            migrated_far_write = traffic_total.far_write,
            final_utilization = self.ledger.occupancy_ratio(),
            "Replay finished"
        );
        outcome
    }

    /// Simulate one step; `None` if the trace skips it entirely.
    fn step(&mut self, key: StepKey) -> Option<(StepDetail, MigrationTraffic)> {
        let skipped = self.ledger.trace().get(key).skip_layer;

        match &self.strategy {
            Strategy::Policies { placement, migrator } => {
                if skipped {
                    // Records the entry as not materialized; no time is spent.
                    placement.place(&mut self.ledger, key);
                    return None;
                }
                let alpha = self
                    .ledger
                    .read_fractions(key)
                    .for_accounting(self.ledger.config().tiers.accounting);
                let beta = placement.place(&mut self.ledger, key);
                let traffic = migrator.rebalance(&mut self.ledger, key);
                let volumes = self.ledger.step_volumes(key);
                let time = self.cost.step_time(alpha, beta, volumes, traffic).total;
                Some((
                    StepDetail {
                        token: key.token,
                        layer: key.layer,
                        stage: key.stage,
                        time,
                        alpha,
                        beta,
                    },
                    traffic,
                ))
            }
            Strategy::UpperBound => {
                if skipped {
                    if key.stage == Stage::Attention {
                        self.ledger
                            .set_location(key.token, key.layer, Location::NotMaterialized);
                    }
                    return None;
                }
                let volumes = self.ledger.step_volumes(key);
                let alpha = if volumes.read == 0 {
                    0.0
                } else {
                    (self.ledger.capacity() as f64 / volumes.read as f64)
                        .min(self.ledger.best_alpha())
                };
                let none = MigrationTraffic::default();
                let far_write = self.cost.step_time(alpha, 0.0, volumes, none).total;
                let fast_write = self.cost.step_time(alpha, 1.0, volumes, none).total;
                let (beta, time) = if fast_write < far_write {
                    (1.0, fast_write)
                } else {
                    (0.0, far_write)
                };
                Some((
                    StepDetail {
                        token: key.token,
                        layer: key.layer,
                        stage: key.stage,
                        time,
                        alpha,
                        beta,
                    },
                    none,
                ))
            }
        }
    }
}
