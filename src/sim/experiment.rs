//! Experiment runner: the upper bound plus every placement x migration
//! combination, each on its own copy of the initialized ledger.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::cache::ledger::TierLedger;
use crate::config::Config;
use crate::policy::migration::{MigrationKind, Migrator};
use crate::policy::placement::{Placement, PlacementKind};
use crate::sim::simulator::{RunOutcome, Simulator};
use crate::trace::Trace;

/// Outcome of one placement/migration combination.
#[derive(Debug, Clone, Serialize)]
pub struct CombinationReport {
    pub placement: PlacementKind,
    pub migration: MigrationKind,
    pub outcome: RunOutcome,
}

/// Outcome of a whole experiment.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub upper_bound: RunOutcome,
    pub runs: Vec<CombinationReport>,
}

impl ExperimentReport {
    /// The fastest combination, if any ran.
    pub fn best_run(&self) -> Option<&CombinationReport> {
        self.runs
            .iter()
            .min_by(|a, b| a.outcome.total_time.total_cmp(&b.outcome.total_time))
    }
}

pub struct Experiment {
    config: Arc<Config>,
    base: TierLedger,
}

impl Experiment {
    /// Build the initialized base ledger shared (by snapshot) across runs.
    pub fn new(config: Arc<Config>, trace: Arc<Trace>) -> Self {
        let mut base = TierLedger::new(config.clone(), trace);
        config.run.initializer.apply(&mut base);
        Self { config, base }
    }

    /// The ledger state every run starts from.
    pub fn base(&self) -> &TierLedger {
        &self.base
    }

    /// Run one combination on a fresh snapshot of the base ledger.
    pub fn run_combination(&self, placement: PlacementKind, migration: MigrationKind) -> RunOutcome {
        let policy = &self.config.policy;
        Simulator::new(
            self.base.snapshot(),
            Placement::new(placement, policy.clone()),
            Migrator::new(migration, policy.clone()),
        )
        .run()
    }

    /// Run the forced-optimal baseline on a fresh snapshot.
    pub fn run_upper_bound(&self) -> RunOutcome {
        Simulator::upper_bound(self.base.snapshot()).run()
    }

    /// Run the upper bound, then every configured combination in order.
    pub fn run(&self) -> ExperimentReport {
        let upper_bound = self.run_upper_bound();
        info!(
            total_time_ns = upper_bound.total_time,
            avg_alpha = upper_bound.average_alpha(),
            "Upper bound complete"
        );

        let mut runs = Vec::new();
        for &placement in &self.config.run.placements {
            for &migration in &self.config.run.migrations {
                let outcome = self.run_combination(placement, migration);
                info!(
                    %placement,
                    %migration,
                    total_time_ns = outcome.total_time,
                    avg_alpha = outcome.average_alpha(),
                    "Combination complete"
                );
                runs.push(CombinationReport {
                    placement,
                    migration,
                    outcome,
                });
            }
        }

        ExperimentReport { upper_bound, runs }
    }
}
